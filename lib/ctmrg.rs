//! Directional CTMRG for an arbitrary unit cell.
//!
//! One sweep applies the four directional moves (by default left, up, right,
//! down) one after the other, each move seeing the environment produced by the
//! previous one. Within a move, projectors for every plaquette of the unit cell
//! are computed from the same environment before any tensor is updated.
//!
//! Only the left move is implemented directly. It grows the environment by one
//! column: for every site `c = (x, y)` the tensors of site `(x + 1, y)` (and the
//! upper-left corner of `(x + 1, y + 1)`) are replaced by
//!
//! ```text
//!   C'(-1,-1) = P_d(x, y) · [C(-1,-1) T(0,-1)] of site (x, y + 1)
//!   C'(-1, 1) = [C(-1,1) T(0,1)] of site (x, y) · P_u(x, y)
//!   T'(-1, 0) = P_u(x, y - 1) · [T(-1,0) a] of site (x, y) · P_d(x, y)
//! ```
//!
//! where the pair `(P_u, P_d)` truncates the cut below row `y` on the left of
//! the plaquette whose upper-left site is `(x, y)`. The other three moves are
//! the left move applied in a frame rotated by one, two, or three quarter
//! turns; rotating back yields the updated environment in the original frame.
//!
//! Projectors come in three flavors (see [`ProjectorMethod`]). The default
//! full-system projectors are built from the upper and lower halves of the
//! plaquette of enlarged corners:
//!
//! ```text
//!   H_u = LU · RU,   H_d = RD · LD,   H_d H_u = U S V†
//!   P_u = H_u V S^(-1/2),   P_d = S^(-1/2) U† H_d
//! ```
//!
//! so that `P_u P_d` is an oblique projector which is exact on the dominant
//! subspace of the plaquette.

use std::time::{ Duration, Instant };
use ndarray as nd;
use ndarray_linalg::SVDInto;
use num_traits::Float;
use rustc_hash::FxHashMap;
use thiserror::Error;
use crate::{
    Elem,
    config::{ CtmArgs, ProjectorMethod },
    conv::ConvCheck,
    corners::{ c2x2_ld, c2x2_lu, c2x2_rd, c2x2_ru },
    env::{ Env, EnvError },
    lattice::{ Coord, CornerDir, EdgeDir },
    rdm::RdmError,
    state::{ StateError, Wavefunction },
    tn::{ self, TnError, contract, double_layer, fuse },
};

#[derive(Debug, Error)]
pub enum CtmError {
    #[error("environment error: {0}")]
    Env(#[from] EnvError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("tensor error: {0}")]
    Tensor(#[from] TnError),

    /// Returned when a convergence check fails to evaluate its observable.
    #[error("convergence check error: {0}")]
    Rdm(#[from] RdmError),
}
pub type CtmResult<T> = Result<T, CtmError>;

impl From<ndarray_linalg::error::LinalgError> for CtmError {
    fn from(err: ndarray_linalg::error::LinalgError) -> Self {
        Self::Tensor(err.into())
    }
}

/// Wall-clock time spent in the two phases of [`run`].
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Timings {
    /// Total time spent in CTMRG sweeps.
    pub t_ctm: Duration,
    /// Total time spent in the convergence check.
    pub t_conv_check: Duration,
}

/// Result of a CTMRG run, generic over the kind of environment.
#[derive(Clone, Debug)]
pub struct CtmOutcome<E, H> {
    /// Final environment.
    pub env: E,
    /// Final value of the convergence history.
    pub history: Option<H>,
    /// Whether the convergence check was satisfied, as opposed to the sweep
    /// ceiling `ctm_max_iter` being reached.
    pub converged: bool,
    /// Number of sweeps performed.
    pub sweeps: usize,
    pub timings: Timings,
}

// The lattice as seen after `turns` counter-clockwise quarter turns.
struct Frame<'a, S> {
    state: &'a S,
    turns: u8,
}

impl<'a, A, S> Frame<'a, S>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    fn vts(&self, c: Coord) -> Coord {
        self.state.vertex_to_site(c.unrot_n(self.turns)).rot_n(self.turns)
    }

    fn vertices(&self) -> Vec<Coord> {
        self.state.vertices().into_iter().map(|c| c.rot_n(self.turns)).collect()
    }

    // on-site tensor with auxiliary legs relabeled for the rotated frame
    fn site(&self, c: Coord) -> CtmResult<nd::ArrayD<A>> {
        let mut a = self.state.site_checked(c.unrot_n(self.turns))?.clone();
        for _ in 0..self.turns {
            a = tn::permute(&a, &[0, 4, 1, 2, 3])?;
        }
        Ok(a)
    }
}

/// Number of singular values to keep out of the descending sequence `s`.
///
/// At most `chi` values are kept, none below `reltol · s[0]`. With
/// `keep_multiplets`, the cut is moved down past any group of values whose
/// spacing is below `eps_multiplet · s[0]`, unless that would remove every
/// value.
pub fn truncation_rank<R>(
    s: &[R],
    chi: usize,
    reltol: f64,
    keep_multiplets: bool,
    eps_multiplet: f64,
) -> usize
where R: Float
{
    let Some(s0) = s.first().copied() else { return 0; };
    if s0 <= R::zero() { return 0; }
    let tol = num_traits::cast::<f64, R>(reltol).unwrap_or_else(R::zero) * s0;
    let k = s.iter().take(chi).take_while(|sk| **sk > tol).count();
    if !keep_multiplets || k == 0 || k >= s.len() { return k; }
    let gap = num_traits::cast::<f64, R>(eps_multiplet).unwrap_or_else(R::zero) * s0;
    let mut k_m = k;
    while k_m > 0 && s[k_m - 1] - s[k_m] <= gap {
        k_m -= 1;
    }
    if k_m == 0 { k } else { k_m }
}

fn as_matrix<A: Elem>(a: nd::ArrayD<A>) -> CtmResult<nd::Array2<A>> {
    Ok(a.into_dimensionality::<nd::Ix2>().map_err(TnError::from)?)
}

// isometry onto the `k` dominant left singular vectors, padded to `chi`
// columns; returns (P_u, P_d)
fn isometric_projectors<A>(m: nd::Array2<A>, args: &CtmArgs)
    -> CtmResult<(nd::Array2<A>, nd::Array2<A>)>
where A: Elem
{
    let m = tn::normalize_max(m);
    let n_rows = m.nrows();
    let (Some(u), s, _) = m.svd_into(true, false)? else { unreachable!() };
    let k = truncation_rank(
        s.as_slice().unwrap_or(&[]),
        args.chi,
        args.projector_svd_reltol,
        args.keep_multiplets,
        args.projector_eps_multiplet,
    );
    let mut p_u: nd::Array2<A> = nd::Array2::zeros((n_rows, args.chi));
    p_u.slice_mut(nd::s![.., ..k]).assign(&u.slice(nd::s![.., ..k]));
    let p_d = tn::dagger(&p_u);
    Ok((p_u, p_d))
}

fn full_system_projectors<A>(
    h_u: nd::Array2<A>,
    h_d: nd::Array2<A>,
    args: &CtmArgs,
) -> CtmResult<(nd::Array2<A>, nd::Array2<A>)>
where A: Elem
{
    let h_u = tn::normalize_max(h_u);
    let h_d = tn::normalize_max(h_d);
    let m = h_d.dot(&h_u);
    let (Some(u), s, Some(vh)) = m.svd_into(true, true)? else { unreachable!() };
    let k = truncation_rank(
        s.as_slice().unwrap_or(&[]),
        args.chi,
        args.projector_svd_reltol,
        args.keep_multiplets,
        args.projector_eps_multiplet,
    );
    let inv_sqrt: Vec<A>
        = s.iter().take(k)
        .map(|sk| A::from_real(Float::recip(Float::sqrt(*sk))))
        .collect();
    // V_k S^(-1/2)
    let mut v_k: nd::Array2<A> = tn::dagger(&vh.slice(nd::s![..k, ..]).to_owned());
    v_k.axis_iter_mut(nd::Axis(1)).zip(&inv_sqrt)
        .for_each(|(mut col, w)| { col.mapv_inplace(|x| x * *w); });
    // S^(-1/2) U_k†
    let mut uh_k: nd::Array2<A> = tn::dagger(&u.slice(nd::s![.., ..k]).to_owned());
    uh_k.axis_iter_mut(nd::Axis(0)).zip(&inv_sqrt)
        .for_each(|(mut row, w)| { row.mapv_inplace(|x| x * *w); });
    let mut p_u: nd::Array2<A> = nd::Array2::zeros((h_u.nrows(), args.chi));
    p_u.slice_mut(nd::s![.., ..k]).assign(&h_u.dot(&v_k));
    let mut p_d: nd::Array2<A> = nd::Array2::zeros((args.chi, h_d.ncols()));
    p_d.slice_mut(nd::s![..k, ..]).assign(&uh_k.dot(&h_d));
    Ok((p_u, p_d))
}

// projectors for the cut below row `c.y` on the left of the plaquette with
// upper-left site `c`
fn projectors<A, S>(
    frame: &Frame<'_, S>,
    env: &Env<A>,
    dl: &FxHashMap<Coord, nd::ArrayD<A>>,
    c: Coord,
    args: &CtmArgs,
) -> CtmResult<(nd::Array2<A>, nd::Array2<A>)>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    let dl_at = |v: Coord| -> CtmResult<&nd::ArrayD<A>> {
        dl.get(&v).ok_or_else(|| StateError::MissingSite(v).into())
    };
    let lu = as_matrix(c2x2_lu(&env.site_env(c)?, dl_at(c)?)?)?;
    let res = match args.projector_method {
        ProjectorMethod::Corner => isometric_projectors(lu, args)?,
        ProjectorMethod::HalfSystem => {
            let c_r = frame.vts(c + Coord::new(1, 0));
            let ru = as_matrix(c2x2_ru(&env.site_env(c_r)?, dl_at(c_r)?)?)?;
            isometric_projectors(lu.dot(&ru), args)?
        },
        ProjectorMethod::FullSystem => {
            let c_r = frame.vts(c + Coord::new(1, 0));
            let c_rd = frame.vts(c + Coord::new(1, 1));
            let c_d = frame.vts(c + Coord::new(0, 1));
            let ru = as_matrix(c2x2_ru(&env.site_env(c_r)?, dl_at(c_r)?)?)?;
            let rd = as_matrix(c2x2_rd(&env.site_env(c_rd)?, dl_at(c_rd)?)?)?;
            let ld = as_matrix(c2x2_ld(&env.site_env(c_d)?, dl_at(c_d)?)?)?;
            full_system_projectors(lu.dot(&ru), rd.dot(&ld), args)?
        },
    };
    if args.verbosity.projectors > 0 {
        log::trace!(
            "projectors at {c}: P_u {:?}, P_d {:?}",
            res.0.shape(),
            res.1.shape(),
        );
    }
    Ok(res)
}

fn move_left<A, S>(frame: &Frame<'_, S>, env: &Env<A>, args: &CtmArgs)
    -> CtmResult<Env<A>>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    let verts = frame.vertices();
    let dl: FxHashMap<Coord, nd::ArrayD<A>>
        = verts.iter()
        .map(|c| Ok((*c, double_layer(&frame.site(*c)?)?)))
        .collect::<CtmResult<_>>()?;
    let proj: FxHashMap<Coord, (nd::Array2<A>, nd::Array2<A>)>
        = verts.iter()
        .map(|c| Ok((*c, projectors(frame, env, &dl, *c, args)?)))
        .collect::<CtmResult<_>>()?;
    let proj_at = |v: Coord| -> CtmResult<&(nd::Array2<A>, nd::Array2<A>)> {
        proj.get(&v).ok_or_else(|| StateError::MissingSite(v).into())
    };

    let mut new = env.clone();
    for c in verts.iter().copied() {
        let (p_u, p_d) = proj_at(c)?;
        let (p_u_above, _) = proj_at(frame.vts(c + Coord::new(0, -1)))?;
        let c_down = frame.vts(c + Coord::new(0, 1));
        let c_right = frame.vts(c + Coord::new(1, 0));
        let c_diag = frame.vts(c + Coord::new(1, 1));

        let x = contract(
            "ab,bcd->acd",
            env.c(c_down, CornerDir::LeftUp)?,
            env.t(c_down, EdgeDir::Up)?,
        )?;
        let x = as_matrix(fuse(&x, &[2, 1])?)?;
        let c_lu = p_d.dot(&x);
        new.set_c(c_diag, CornerDir::LeftUp, tn::normalize_max(c_lu).into_dyn());

        let x = contract(
            "ab,cbd->acd",
            env.c(c, CornerDir::LeftDown)?,
            env.t(c, EdgeDir::Down)?,
        )?;
        let x = as_matrix(fuse(&x, &[2, 1])?)?;
        let c_ld = p_u.t().dot(&x);
        new.set_c(c_right, CornerDir::LeftDown, tn::normalize_max(c_ld).into_dyn());

        let a = dl.get(&c).ok_or(StateError::MissingSite(c))?;
        let x = contract("abc,dcef->adbef", env.t(c, EdgeDir::Left)?, a)?;
        let x = fuse(&x, &[2, 2, 1])?;
        let x = contract("ak,abf->kbf", &p_u_above.clone().into_dyn(), &x)?;
        let t_l = contract("kbf,lb->klf", &x, &p_d.clone().into_dyn())?;
        new.set_t(c_right, EdgeDir::Left, tn::normalize_max(t_l));
    }
    Ok(new)
}

/// Apply a single directional move, growing the environment on side `dir`.
pub fn ctm_move<A, S>(state: &S, env: &Env<A>, dir: EdgeDir, args: &CtmArgs)
    -> CtmResult<Env<A>>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    let turns = dir.turns_to_left();
    let frame = Frame { state, turns };
    let rotated = env.rotated(turns)?;
    let moved = move_left(&frame, &rotated, args)?;
    let res = moved.rotated((4 - turns) % 4)?;
    if args.verbosity.ctm_move > 0 {
        log::debug!("CTMRG move {dir:?} done");
    }
    Ok(res)
}

/// Apply one full sweep of directional moves in the order given by
/// `args.ctm_move_sequence`.
pub fn ctm_sweep<A, S>(state: &S, env: Env<A>, args: &CtmArgs) -> CtmResult<Env<A>>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    args.ctm_move_sequence.iter()
        .try_fold(env, |env, dir| ctm_move(state, &env, *dir, args))
}

/// Run CTMRG sweeps until `conv_check` reports convergence or `ctm_max_iter`
/// sweeps have been performed.
///
/// The convergence check is called once after every sweep with the history it
/// returned the previous time (`None` on the first call). Closures are passed
/// as `&mut f`.
pub fn run<A, S, C, H>(state: &S, env: Env<A>, mut conv_check: C, args: &CtmArgs)
    -> CtmResult<CtmOutcome<Env<A>, H>>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
    C: ConvCheck<S, Env<A>, H>,
{
    if args.conv_check_cpu {
        log::trace!("convergence checks evaluated on the host");
    }
    let mut env = env;
    let mut history: Option<H> = None;
    let mut timings = Timings::default();
    let mut converged = false;
    let mut sweeps: usize = 0;
    log::info!(
        "CTMRG start: chi = {}, max sweeps = {}, projectors = {}",
        args.chi,
        args.ctm_max_iter,
        args.projector_method,
    );
    for i in 0..args.ctm_max_iter {
        let t0 = Instant::now();
        env = ctm_sweep(state, env, args)?;
        let t1 = Instant::now();
        let (done, h) = conv_check.check(state, &env, history.take(), args)?;
        let t2 = Instant::now();
        converged = done && conv_check.converged(&h);
        history = Some(h);
        timings.t_ctm += t1 - t0;
        timings.t_conv_check += t2 - t1;
        sweeps = i + 1;
        log::debug!(
            "CTMRG sweep {i}: t_sweep = {:?}, t_conv = {:?}",
            t1 - t0,
            t2 - t1,
        );
        if args.verbosity.ctm_convergence > 0 { env.log_corner_spectra()?; }
        if done { break; }
    }
    log::info!(
        "CTMRG done after {sweeps} sweeps (converged: {converged}); t_ctm = {:?}, t_conv_check = {:?}",
        timings.t_ctm,
        timings.t_conv_check,
    );
    Ok(CtmOutcome { env, history, converged, sweeps, timings })
}
