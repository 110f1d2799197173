//! Reduced density matrices of small patches.
//!
//! Every routine contracts a fragment of the network made of environment
//! tensors and doubled on-site tensors, some of which carry open physical legs
//! (see [`double_layer_open`]). Results are returned as tensors with all ket
//! indices first and the matching bra indices in the same order after them,
//! e.g. `ρ[s0, s1, s0', s1']` for two sites, and are passed through
//! [`sym_pos_def_rdm`] before being returned.
//!
//! The two-site routines are built from halves:
//!
//! ```text
//!   rdm2x1:  C -- T -- T -- C        rdm1x2:  C -- T -- C
//!            |    |    |    |                 |    |    |
//!            T -- a0 - a1 - T                 T -- a0 - T
//!            |    |    |    |                 |    |    |
//!            C -- T -- T -- C                 T -- a1 - T
//!                                             |    |    |
//!                                             C -- T -- C
//! ```
//!
//! where the upper-left quarter of every picture is an open enlarged corner
//! (see [`crate::corners`]).

use ndarray as nd;
use ndarray_linalg::{ Eigh, UPLO };
use num_traits::{ Float, ToPrimitive, Zero };
use thiserror::Error;
use crate::{
    Elem,
    corners::{
        c1x2_rd,
        c1x2_ru,
        c2x1_ld,
        c2x1_rd,
        c2x2_ld,
        c2x2_lu,
        c2x2_rd,
        c2x2_ru,
        site_ring,
    },
    env::{ Env, EnvError },
    lattice::Coord,
    state::{ StateError, Wavefunction },
    tn::{
        self,
        TnError,
        contract,
        double_layer,
        double_layer_op,
        double_layer_open,
    },
};

#[derive(Debug, Error)]
pub enum RdmError {
    #[error("environment error: {0}")]
    Env(#[from] EnvError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("tensor error: {0}")]
    Tensor(#[from] TnError),

    /// Returned when a tensor passed as a density matrix does not have as many
    /// bra as ket indices, or their dimensions differ.
    #[error("error in density matrix: unbalanced ket/bra shape {0:?}")]
    NotSquare(Vec<usize>),

    /// Returned when the norm of a patch vanishes.
    #[error("error in density matrix: vanishing trace")]
    ZeroTrace,
}
use RdmError::*;
pub type RdmResult<T> = Result<T, RdmError>;

impl From<ndarray_linalg::error::LinalgError> for RdmError {
    fn from(err: ndarray_linalg::error::LinalgError) -> Self {
        Self::Tensor(err.into())
    }
}

/// Options controlling the post-processing of reduced density matrices.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RdmOpts {
    /// Project onto positive semi-definite matrices.
    pub sym_pos_def: bool,
    /// Move the computation to the host before contracting. Always satisfied on
    /// the only supported device.
    pub force_cpu: bool,
    /// Relative size of the imaginary part of the trace above which a warning
    /// is emitted.
    pub imag_eps: f64,
    /// Negative eigenvalues with magnitude up to this value are tolerated when
    /// `sym_pos_def` is set.
    pub psd_tol: f64,
    pub verbosity: u8,
}

impl Default for RdmOpts {
    fn default() -> Self {
        Self {
            sym_pos_def: false,
            force_cpu: false,
            imag_eps: 1e-8,
            psd_tol: 0.0,
            verbosity: 0,
        }
    }
}

/// Hermitize a density matrix, optionally project it onto the cone of positive
/// semi-definite matrices, and normalize it to unit trace.
///
/// The input holds `n` ket indices followed by `n` bra indices; the output has
/// the same shape. Only the real part of the trace is used for normalization.
/// If the imaginary part is large relative to it (see [`RdmOpts::imag_eps`]),
/// a warning is logged and the computation continues.
pub fn sym_pos_def_rdm<A>(rdm: nd::ArrayD<A>, opts: &RdmOpts)
    -> RdmResult<nd::ArrayD<A>>
where A: Elem
{
    let shape = rdm.shape().to_vec();
    let n = shape.len();
    if n == 0 || n % 2 != 0 || shape[..n / 2] != shape[n / 2..] {
        return Err(NotSquare(shape));
    }
    let m = tn::to_matrix(&rdm, n / 2)?;
    let mut m = tn::hermitian_part(&m);
    if opts.sym_pos_def {
        let (evals, evecs) = m.eigh(UPLO::Lower)?;
        let min
            = evals.iter().copied()
            .fold(<A::Real as Float>::infinity(), Float::min);
        if min.to_f64().unwrap_or(0.0) < -opts.psd_tol {
            log::debug!("clamping negative density matrix eigenvalue {min}");
            let clamped: nd::Array1<A>
                = evals.mapv(|e| A::from_real(Float::max(e, A::Real::zero())));
            m = (&evecs * &clamped).dot(&tn::dagger(&evecs));
        }
    }
    let tr = tn::trace(&m);
    let (re, im) = (tr.re(), tr.im());
    let re_f = re.to_f64().unwrap_or(0.0);
    let im_f = im.to_f64().unwrap_or(0.0);
    if im_f.abs() / (re_f.abs() + 1e-8) > opts.imag_eps {
        log::warn!(
            "density matrix trace has a large imaginary part: {re_f} + {im_f}i"
        );
    }
    if re_f == 0.0 { return Err(ZeroTrace); }
    let inv = A::from_real(Float::recip(re));
    m.mapv_inplace(|x| x * inv);
    Ok(tn::reshape(&m.into_dyn(), &shape)?)
}

/// `Tr(ρ O)` for a density matrix in the layout returned by this module and an
/// operator given as a square matrix over the same (fused) index.
pub fn expectation<A>(rdm: &nd::ArrayD<A>, op: &nd::Array2<A>) -> RdmResult<A>
where A: Elem
{
    let n = rdm.ndim();
    if n % 2 != 0 { return Err(NotSquare(rdm.shape().to_vec())); }
    let m = tn::to_matrix(rdm, n / 2)?;
    if m.dim() != op.dim() {
        return Err(TnError::IncompatibleShape(op.shape().to_vec()).into());
    }
    Ok(tn::trace(&m.dot(op)))
}

fn prelude(name: &str, coord: Coord, opts: &RdmOpts) {
    if opts.force_cpu {
        log::trace!("{name}: contracting on the host");
    }
    if opts.verbosity > 0 {
        log::debug!("{name} at {coord}");
    }
}

fn open_at<A, S>(state: &S, c: Coord) -> RdmResult<nd::ArrayD<A>>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    Ok(double_layer_open(state.site_checked(c)?)?)
}

fn closed_at<A, S>(state: &S, c: Coord) -> RdmResult<nd::ArrayD<A>>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    Ok(double_layer(state.site_checked(c)?)?)
}

/// Single-site reduced density matrix `ρ[s, s']`.
pub fn rdm1x1<A, S>(coord: Coord, state: &S, env: &Env<A>, opts: RdmOpts)
    -> RdmResult<nd::ArrayD<A>>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    prelude("rdm1x1", coord, &opts);
    let c = state.vertex_to_site(coord);
    let ring = site_ring(&env.site_env(c)?)?;
    let rdm = contract("abcd,abcdst->st", &ring, &open_at(state, c)?)?;
    sym_pos_def_rdm(rdm, &opts)
}

/// Normalized expectation value `⟨O⟩` of a single-site operator, computed
/// without forming the density matrix.
pub fn expectation1x1<A, S>(coord: Coord, state: &S, env: &Env<A>, op: &nd::Array2<A>)
    -> RdmResult<A>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    let c = state.vertex_to_site(coord);
    let ring = site_ring(&env.site_env(c)?)?;
    let a = state.site_checked(c)?;
    let num = contract("abcd,abcd->", &ring, &double_layer_op(a, op)?)?.sum();
    let den = contract("abcd,abcd->", &ring, &double_layer(a)?)?.sum();
    if den == A::zero() { return Err(ZeroTrace); }
    Ok(num / den)
}

/// Reduced density matrix `ρ[s0, s1, s0', s1']` of the horizontal pair
/// `s0 = coord`, `s1 = coord + (1, 0)`.
pub fn rdm2x1<A, S>(coord: Coord, state: &S, env: &Env<A>, opts: RdmOpts)
    -> RdmResult<nd::ArrayD<A>>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    prelude("rdm2x1", coord, &opts);
    let c = state.vertex_to_site(coord);
    let cx = state.vertex_to_site(coord + Coord::new(1, 0));
    let env_c = env.site_env(c)?;
    let env_cx = env.site_env(cx)?;
    let left = contract(
        "ab,acst->bcst",
        &c2x1_ld(&env_c)?,
        &c2x2_lu(&env_c, &open_at(state, c)?)?,
    )?;
    let right = contract(
        "ab,cast->bcst",
        &c2x1_rd(&env_cx)?,
        &c2x2_ru(&env_cx, &open_at(state, cx)?)?,
    )?;
    let rdm = contract("xyst,xyuv->sutv", &left, &right)?;
    sym_pos_def_rdm(rdm, &opts)
}

/// Reduced density matrix `ρ[s0, s1, s0', s1']` of the vertical pair
/// `s0 = coord`, `s1 = coord + (0, 1)`.
pub fn rdm1x2<A, S>(coord: Coord, state: &S, env: &Env<A>, opts: RdmOpts)
    -> RdmResult<nd::ArrayD<A>>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    prelude("rdm1x2", coord, &opts);
    let c = state.vertex_to_site(coord);
    let cy = state.vertex_to_site(coord + Coord::new(0, 1));
    let env_c = env.site_env(c)?;
    let env_cy = env.site_env(cy)?;
    let upper = contract(
        "abst,bc->acst",
        &c2x2_lu(&env_c, &open_at(state, c)?)?,
        &c1x2_ru(&env_c)?,
    )?;
    let lower = contract(
        "abst,ac->bcst",
        &c2x2_ld(&env_cy, &open_at(state, cy)?)?,
        &c1x2_rd(&env_cy)?,
    )?;
    let rdm = contract("xyst,xyuv->sutv", &upper, &lower)?;
    sym_pos_def_rdm(rdm, &opts)
}

// the four enlarged corners of the plaquette with upper-left vertex `coord`,
// each with open physical legs where requested
fn plaquette<A, S>(coord: Coord, open: [bool; 4], state: &S, env: &Env<A>)
    -> RdmResult<[nd::ArrayD<A>; 4]>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    let sites = [
        state.vertex_to_site(coord),
        state.vertex_to_site(coord + Coord::new(1, 0)),
        state.vertex_to_site(coord + Coord::new(1, 1)),
        state.vertex_to_site(coord + Coord::new(0, 1)),
    ];
    let dl = |k: usize| -> RdmResult<nd::ArrayD<A>> {
        if open[k] { open_at(state, sites[k]) } else { closed_at(state, sites[k]) }
    };
    Ok([
        c2x2_lu(&env.site_env(sites[0])?, &dl(0)?)?,
        c2x2_ru(&env.site_env(sites[1])?, &dl(1)?)?,
        c2x2_rd(&env.site_env(sites[2])?, &dl(2)?)?,
        c2x2_ld(&env.site_env(sites[3])?, &dl(3)?)?,
    ])
}

/// Reduced density matrix of the 2x2 plaquette with upper-left vertex
/// `coord`, with sites ordered `s0 = (x, y)`, `s1 = (x + 1, y)`,
/// `s2 = (x, y + 1)`, `s3 = (x + 1, y + 1)`:
/// `ρ[s0, s1, s2, s3, s0', s1', s2', s3']`.
pub fn rdm2x2<A, S>(coord: Coord, state: &S, env: &Env<A>, opts: RdmOpts)
    -> RdmResult<nd::ArrayD<A>>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    prelude("rdm2x2", coord, &opts);
    let [lu, ru, rd, ld] = plaquette(coord, [true; 4], state, env)?;
    let upper = contract("abst,bcuv->acstuv", &lu, &ru)?;
    let lower = contract("abst,bcuv->acstuv", &rd, &ld)?;
    let rdm = contract("acstuv,cawxyz->suywtvzx", &upper, &lower)?;
    sym_pos_def_rdm(rdm, &opts)
}

/// Reduced density matrix `ρ[s0, s1, s0', s1']` of the diagonal pair
/// `s0 = coord`, `s1 = coord + (1, 1)`, embedded in the 2x2 plaquette.
pub fn rdm2x2_nnn_11<A, S>(coord: Coord, state: &S, env: &Env<A>, opts: RdmOpts)
    -> RdmResult<nd::ArrayD<A>>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    prelude("rdm2x2_nnn_11", coord, &opts);
    let [lu, ru, rd, ld]
        = plaquette(coord, [true, false, true, false], state, env)?;
    let upper = contract("abst,bc->acst", &lu, &ru)?;
    let lower = contract("abst,bc->acst", &rd, &ld)?;
    let rdm = contract("acst,cauv->sutv", &upper, &lower)?;
    sym_pos_def_rdm(rdm, &opts)
}

/// Reduced density matrix `ρ[s0, s1, s0', s1']` of the anti-diagonal pair
/// `s0 = coord`, `s1 = coord + (1, -1)`, embedded in the 2x2 plaquette of
/// which `coord` is the lower-left vertex.
pub fn rdm2x2_nnn_1n1<A, S>(coord: Coord, state: &S, env: &Env<A>, opts: RdmOpts)
    -> RdmResult<nd::ArrayD<A>>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    prelude("rdm2x2_nnn_1n1", coord, &opts);
    let [lu, ru, rd, ld]
        = plaquette(coord + Coord::new(0, -1), [false, true, false, true], state, env)?;
    let upper = contract("ab,bcst->acst", &lu, &ru)?;
    let lower = contract("ab,bcst->acst", &rd, &ld)?;
    let rdm = contract("acst,cauv->usvt", &upper, &lower)?;
    sym_pos_def_rdm(rdm, &opts)
}

// split every fused D² leg of an environment fragment into (ket, bra) and move
// all ket legs in front of all bra legs
pub(crate) fn unfuse_aux<A>(frag: &nd::ArrayD<A>, dims: &[usize])
    -> RdmResult<nd::ArrayD<A>>
where A: Elem
{
    if dims.len() != frag.ndim() {
        return Err(TnError::RankMismatch {
            expected: dims.len(), shape: frag.shape().to_vec() }.into());
    }
    let shape: Vec<usize> = dims.iter().flat_map(|d| [*d, *d]).collect();
    let split = tn::reshape(frag, &shape)?;
    let n = dims.len();
    let perm: Vec<usize> = (0..n).map(|k| 2 * k).chain((0..n).map(|k| 2 * k + 1)).collect();
    Ok(tn::permute(&split, &perm)?)
}

/// Environment of a single site seen as an operator on its auxiliary space,
/// `ρ[u, l, d, r, u', l', d', r']`.
pub fn aux_rdm1x1<A, S>(coord: Coord, state: &S, env: &Env<A>, opts: RdmOpts)
    -> RdmResult<nd::ArrayD<A>>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    prelude("aux_rdm1x1", coord, &opts);
    let c = state.vertex_to_site(coord);
    let a = state.site_checked(c)?;
    let ring = site_ring(&env.site_env(c)?)?;
    let rdm = unfuse_aux(&ring, &a.shape()[1..])?;
    sym_pos_def_rdm(rdm, &opts)
}

/// Environment of the horizontal pair `coord`, `coord + (1, 0)` seen as an
/// operator on the six outer auxiliary legs, ordered anticlockwise from the up
/// leg of the left site: `[u0, l0, d0, d1, r1, u1]` followed by the matching
/// bra legs.
pub fn aux_rdm2x1<A, S>(coord: Coord, state: &S, env: &Env<A>, opts: RdmOpts)
    -> RdmResult<nd::ArrayD<A>>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    prelude("aux_rdm2x1", coord, &opts);
    let c = state.vertex_to_site(coord);
    let cx = state.vertex_to_site(coord + Coord::new(1, 0));
    let e0 = env.site_env(c)?;
    let e1 = env.site_env(cx)?;

    let x = contract("ab,bcd->acd", e0.c_lu, e0.t_u)?;
    let x = contract("acd,aef->cdef", &x, e0.t_l)?;
    let x = contract("cdef,eg->cdfg", &x, e0.c_ld)?;
    let left = contract("cdfg,hgi->cdfhi", &x, e0.t_d)?;

    let y = contract("abc,cd->abd", e1.t_u, e1.c_ru)?;
    let y = contract("abd,def->abef", &y, e1.t_r)?;
    let y = contract("abef,fg->abeg", &y, e1.c_rd)?;
    let right = contract("abeg,hig->abehi", &y, e1.t_d)?;

    let frag = contract("cdfhi,dbeji->cfhjeb", &left, &right)?;
    let s0 = state.site_checked(c)?.shape().to_vec();
    let s1 = state.site_checked(cx)?.shape().to_vec();
    let rdm = unfuse_aux(&frag, &[s0[1], s0[2], s0[3], s1[3], s1[4], s1[1]])?;
    sym_pos_def_rdm(rdm, &opts)
}
