//! Environment store for an iPEPS with an arbitrary unit cell.
//!
//! For every non-equivalent site `c` of the unit cell the environment holds
//! four corner matrices and four edge tensors, keyed by `(c, direction)`:
//!
//! ```text
//!   C(-1,-1) --- T(0,-1) --- C(1,-1)        C(-1,-1): [down, right]
//!      |            |           |           C(1,-1):  [left, down]
//!   T(-1,0) ----- a(c) ----- T(1,0)         C(1,1):   [up, left]
//!      |            |           |           C(-1,1):  [up, right]
//!   C(-1,1) ---- T(0,1) ---- C(1,1)
//!                                           T(0,-1):  [left, D², right]
//!                                           T(-1,0):  [up, down, D²]
//!                                           T(0,1):   [D², left, right]
//!                                           T(1,0):   [up, D², down]
//! ```
//!
//! Leg orders follow the convention "start from up, go anticlockwise". The
//! `D²` legs are the fused (ket, bra) auxiliary legs of the doubled on-site
//! tensor they attach to; all other legs have dimension χ.
//!
//! Initialization ([`init_env`]) works with any [`Backend`]: the corner at
//! `(c, v)` is built from the doubled tensor of the site at `c + v`, with the
//! physical leg and all auxiliary legs not pointing back toward `c` traced out.
//! The same builders are used by the block-sparse environments of
//! [`crate::env_abelian`] and [`crate::env_c4v_abelian`].

use std::fmt;
use ndarray as nd;
use ndarray_linalg::SVDInto;
use num_traits::{ Float, Zero };
use rustc_hash::FxHashMap;
use thiserror::Error;
use crate::{
    Elem,
    config::{ ConfigError, DType, EnvInit, GlobalArgs },
    lattice::{ Coord, CornerDir, EdgeDir },
    state::{ StateError, Wavefunction },
    tn::{ self, Backend, TnError, TnResult },
};

#[derive(Debug, Error)]
pub enum EnvError {
    /// Returned when looking up a corner that is not stored.
    #[error("missing corner {dir} for site {coord}")]
    MissingCorner { coord: Coord, dir: CornerDir },

    /// Returned when looking up an edge tensor that is not stored.
    #[error("missing edge tensor {dir} for site {coord}")]
    MissingEdge { coord: Coord, dir: EdgeDir },

    /// Returned for recognized but unsupported initialization methods.
    #[error("environment initialization method {0} is not implemented")]
    NotImplemented(String),

    /// Returned when the element type disagrees with the configured dtype.
    #[error("dtype mismatch: environment configured for {config}, elements are {elem}")]
    DTypeMismatch { config: DType, elem: DType },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("tensor error: {0}")]
    Tensor(#[from] TnError),
}
use EnvError::*;
pub type EnvResult<T> = Result<T, EnvError>;

impl From<ndarray_linalg::error::LinalgError> for EnvError {
    fn from(err: ndarray_linalg::error::LinalgError) -> Self {
        Self::Tensor(err.into())
    }
}

/// Corner and edge tensors for every site of a unit cell, generic over the
/// tensor representation.
#[derive(Clone, Debug)]
pub struct EnvTensors<T> {
    pub c: FxHashMap<(Coord, CornerDir), T>,
    pub t: FxHashMap<(Coord, EdgeDir), T>,
}

impl<T> Default for EnvTensors<T> {
    fn default() -> Self {
        Self { c: FxHashMap::default(), t: FxHashMap::default() }
    }
}

/// Corner matrix of direction `dir` built from the site tensor `a` that sits
/// at that corner.
pub fn corner_from_site<T>(a: &T, dir: CornerDir) -> TnResult<T>
where T: Backend
{
    // legs traced out: physical and the two facing away from the center
    let traced: [usize; 3] = match dir {
        CornerDir::LeftUp => [0, 1, 2],
        CornerDir::RightUp => [0, 1, 4],
        CornerDir::RightDown => [0, 3, 4],
        CornerDir::LeftDown => [0, 2, 3],
    };
    a.tensordot(&a.conj(), &traced, &traced)?
        .permute(&[0, 2, 1, 3])?
        .fuse(&[2, 2])
        .map(|c| c.normalize_max())
}

/// Edge tensor of direction `dir` built from the site tensor `a` that sits at
/// that edge.
pub fn edge_from_site<T>(a: &T, dir: EdgeDir) -> TnResult<T>
where T: Backend
{
    let traced: [usize; 2] = match dir {
        EdgeDir::Up => [0, 1],
        EdgeDir::Left => [0, 2],
        EdgeDir::Down => [0, 3],
        EdgeDir::Right => [0, 4],
    };
    a.tensordot(&a.conj(), &traced, &traced)?
        .permute(&[0, 3, 1, 4, 2, 5])?
        .fuse(&[2, 2, 2])
        .map(|t| t.normalize_max())
}

/// Build all corner and edge tensors of a unit cell from the doubled on-site
/// tensors.
pub fn tensors_from_sites<S>(state: &S) -> EnvResult<EnvTensors<S::Tensor>>
where S: Wavefunction
{
    let mut env = EnvTensors::default();
    for c in state.vertices() {
        for dir in CornerDir::ALL {
            let a = state.site_checked(c + dir.vec())?;
            env.c.insert((c, dir), corner_from_site(a, dir)?);
        }
        for dir in EdgeDir::ALL {
            let a = state.site_checked(c + dir.vec())?;
            env.t.insert((c, dir), edge_from_site(a, dir)?);
        }
    }
    Ok(env)
}

/// Axis of the `D²` leg of an edge tensor.
pub fn edge_aux_axis(dir: EdgeDir) -> usize {
    match dir {
        EdgeDir::Up | EdgeDir::Right => 1,
        EdgeDir::Left => 2,
        EdgeDir::Down => 0,
    }
}

/// Shape of an edge tensor with environment dimension `chi` and auxiliary
/// dimension `d2`.
pub fn edge_shape(dir: EdgeDir, chi: usize, d2: usize) -> [usize; 3] {
    match dir {
        EdgeDir::Up | EdgeDir::Right => [chi, d2, chi],
        EdgeDir::Left => [chi, chi, d2],
        EdgeDir::Down => [d2, chi, chi],
    }
}

/// Dense CTMRG environment.
///
/// Every corner is `χ × χ` and every edge carries two legs of dimension χ,
/// regardless of the rank actually supported by the data (missing directions
/// are zero-padded).
#[derive(Clone)]
pub struct Env<A> {
    pub(crate) chi: usize,
    pub(crate) c: FxHashMap<(Coord, CornerDir), nd::ArrayD<A>>,
    pub(crate) t: FxHashMap<(Coord, EdgeDir), nd::ArrayD<A>>,
    pub(crate) global: GlobalArgs,
}

impl<A> fmt::Debug for Env<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sites: Vec<Coord> = self.c.keys().map(|(c, _)| *c).collect();
        sites.sort();
        sites.dedup();
        f.debug_struct("Env")
            .field("chi", &self.chi)
            .field("sites", &sites)
            .field("global", &self.global)
            .finish()
    }
}

/// References to the eight environment tensors surrounding one site.
#[derive(Copy, Clone, Debug)]
pub struct SiteEnv<'a, A> {
    pub c_lu: &'a nd::ArrayD<A>,
    pub c_ru: &'a nd::ArrayD<A>,
    pub c_rd: &'a nd::ArrayD<A>,
    pub c_ld: &'a nd::ArrayD<A>,
    pub t_u: &'a nd::ArrayD<A>,
    pub t_l: &'a nd::ArrayD<A>,
    pub t_d: &'a nd::ArrayD<A>,
    pub t_r: &'a nd::ArrayD<A>,
}

impl<A> Env<A>
where A: Elem
{
    /// Create a new, empty environment with bond dimension `chi`.
    pub fn new(chi: usize) -> Self {
        let global = GlobalArgs { dtype: A::DTYPE, ..GlobalArgs::default() };
        Self::with_global(chi, global)
    }

    /// Create a new, empty environment with explicit global settings.
    pub fn with_global(chi: usize, global: GlobalArgs) -> Self {
        Self {
            chi,
            c: FxHashMap::default(),
            t: FxHashMap::default(),
            global,
        }
    }

    /// Wrap existing tensors, padding or slicing every χ leg to `chi`.
    pub fn from_tensors(chi: usize, tensors: EnvTensors<nd::ArrayD<A>>)
        -> EnvResult<Self>
    {
        let mut env = Self::new(chi);
        for ((c, dir), tens) in tensors.c.into_iter() {
            let tens = tn::pad_to(&tens, &[chi, chi])?;
            env.c.insert((c, dir), tens);
        }
        for ((c, dir), tens) in tensors.t.into_iter() {
            let d2 = tens.shape().get(edge_aux_axis(dir)).copied()
                .ok_or_else(|| TnError::RankMismatch {
                    expected: 3, shape: tens.shape().to_vec() })?;
            let tens = tn::pad_to(&tens, &edge_shape(dir, chi, d2))?;
            env.t.insert((c, dir), tens);
        }
        Ok(env)
    }

    pub fn chi(&self) -> usize { self.chi }

    pub fn global(&self) -> GlobalArgs { self.global }

    /// Sites for which tensors are stored, in ascending order.
    pub fn sites(&self) -> Vec<Coord> {
        let mut sites: Vec<Coord> = self.c.keys().map(|(c, _)| *c).collect();
        sites.sort();
        sites.dedup();
        sites
    }

    pub fn c(&self, coord: Coord, dir: CornerDir) -> EnvResult<&nd::ArrayD<A>> {
        self.c.get(&(coord, dir)).ok_or(MissingCorner { coord, dir })
    }

    pub fn t(&self, coord: Coord, dir: EdgeDir) -> EnvResult<&nd::ArrayD<A>> {
        self.t.get(&(coord, dir)).ok_or(MissingEdge { coord, dir })
    }

    pub fn set_c(&mut self, coord: Coord, dir: CornerDir, tens: nd::ArrayD<A>) {
        self.c.insert((coord, dir), tens);
    }

    pub fn set_t(&mut self, coord: Coord, dir: EdgeDir, tens: nd::ArrayD<A>) {
        self.t.insert((coord, dir), tens);
    }

    /// All eight tensors surrounding a site.
    pub fn site_env(&self, coord: Coord) -> EnvResult<SiteEnv<'_, A>> {
        Ok(SiteEnv {
            c_lu: self.c(coord, CornerDir::LeftUp)?,
            c_ru: self.c(coord, CornerDir::RightUp)?,
            c_rd: self.c(coord, CornerDir::RightDown)?,
            c_ld: self.c(coord, CornerDir::LeftDown)?,
            t_u: self.t(coord, EdgeDir::Up)?,
            t_l: self.t(coord, EdgeDir::Left)?,
            t_d: self.t(coord, EdgeDir::Down)?,
            t_r: self.t(coord, EdgeDir::Right)?,
        })
    }

    /// Copy into an environment of a different bond dimension, zero-padding or
    /// slicing every χ leg.
    pub fn extend(&self, new_chi: usize) -> EnvResult<Self> {
        let tensors = EnvTensors { c: self.c.clone(), t: self.t.clone() };
        let mut env = Self::from_tensors(new_chi, tensors)?;
        env.global = self.global;
        Ok(env)
    }

    /// Copy of the environment as seen in a frame rotated by `n` quarter turns
    /// counter-clockwise: keys are rotated and legs reordered so that every
    /// tensor again follows the leg convention of its new direction.
    pub fn rotated(&self, n: u8) -> EnvResult<Self> {
        let mut env = self.clone();
        for _ in 0..n % 4 {
            env = env.rotated_once()?;
        }
        Ok(env)
    }

    fn rotated_once(&self) -> EnvResult<Self> {
        let mut c = FxHashMap::default();
        for ((coord, dir), tens) in self.c.iter() {
            let tens = match dir {
                CornerDir::LeftUp | CornerDir::LeftDown => tn::permute(tens, &[1, 0])?,
                CornerDir::RightUp | CornerDir::RightDown => tens.clone(),
            };
            c.insert((coord.rot(), dir.rot()), tens);
        }
        let mut t = FxHashMap::default();
        for ((coord, dir), tens) in self.t.iter() {
            let tens = match dir {
                EdgeDir::Right => tens.clone(),
                _ => tn::permute(tens, &[2, 0, 1])?,
            };
            t.insert((coord.rot(), dir.rot()), tens);
        }
        Ok(Self { chi: self.chi, c, t, global: self.global })
    }

    /// Singular values of every corner matrix, normalized to the largest one
    /// and zero-padded to χ, ordered by site and direction.
    pub fn corner_spectra(&self) -> EnvResult<Vec<((Coord, CornerDir), nd::Array1<A::Real>)>> {
        let mut keys: Vec<(Coord, CornerDir)> = self.c.keys().copied().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| {
                let m = tn::to_matrix(&self.c[&key], 1)?;
                let (_, s, _) = m.svd_into(false, false)?;
                let s0 = s.iter().copied().fold(A::Real::zero(), Float::max);
                let mut spec: nd::Array1<A::Real> = nd::Array1::zeros(self.chi);
                s.iter().take(self.chi).enumerate()
                    .for_each(|(k, sk)| {
                        spec[k] = if s0 > A::Real::zero() { *sk / s0 } else { *sk };
                    });
                Ok((key, spec))
            })
            .collect()
    }

    /// Log the normalized corner spectra at debug level.
    pub fn log_corner_spectra(&self) -> EnvResult<()> {
        for ((coord, dir), spec) in self.corner_spectra()? {
            log::debug!("spectrum {dir} at {coord}: {spec}");
        }
        Ok(())
    }

    /// Largest elementwise difference to another environment with the same
    /// keys and shapes.
    pub fn max_diff(&self, other: &Self) -> EnvResult<A::Real> {
        let mut acc = A::Real::zero();
        for ((coord, dir), tens) in self.c.iter() {
            let o = other.c(*coord, *dir)?;
            if o.shape() != tens.shape() {
                return Err(TnError::IncompatibleShape(o.shape().to_vec()).into());
            }
            acc = Float::max(acc, tn::max_abs(&(tens - o)));
        }
        for ((coord, dir), tens) in self.t.iter() {
            let o = other.t(*coord, *dir)?;
            if o.shape() != tens.shape() {
                return Err(TnError::IncompatibleShape(o.shape().to_vec()).into());
            }
            acc = Float::max(acc, tn::max_abs(&(tens - o)));
        }
        Ok(acc)
    }

    /// Return `true` if any stored element is NaN or infinite.
    pub fn has_non_finite(&self) -> bool {
        self.c.values().chain(self.t.values())
            .flat_map(|tens| tens.iter())
            .any(|x| !Float::is_finite(x.re()) || !Float::is_finite(x.im()))
    }
}

/// Populate an environment for `state` using the given method.
///
/// Only [`EnvInit::Ctmrg`] is supported; the other recognized methods fail
/// with [`EnvError::NotImplemented`].
pub fn init_env<A, S>(state: &S, env: &mut Env<A>, method: EnvInit)
    -> EnvResult<()>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    if env.global.dtype != A::DTYPE {
        return Err(DTypeMismatch { config: env.global.dtype, elem: A::DTYPE });
    }
    match method {
        EnvInit::Ctmrg => {
            let tensors = tensors_from_sites(state)?;
            let mut new = Env::from_tensors(env.chi, tensors)?;
            new.global = env.global;
            *env = new;
            log::debug!(
                "initialized environment with chi = {} for {} sites",
                env.chi,
                env.sites().len(),
            );
            Ok(())
        },
        other => Err(NotImplemented(other.to_string())),
    }
}

/// Like [`init_env`], with the method given by name.
pub fn init_env_named<A, S>(state: &S, env: &mut Env<A>, method: &str)
    -> EnvResult<()>
where
    A: Elem,
    S: Wavefunction<Tensor = nd::ArrayD<A>>,
{
    init_env(state, env, method.parse()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex64 as C64;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{
        config::Device,
        state::{ IPEPS, Tiling },
    };

    #[test]
    fn init_shapes_chi_above_d2() {
        let mut rng = StdRng::seed_from_u64(10546);
        let state: IPEPS<f64>
            = IPEPS::random(2, 2, Tiling::Rect { lx: 1, ly: 1 }, &mut rng).unwrap();
        let mut env: Env<f64> = Env::new(4);
        init_env(&state, &mut env, EnvInit::Ctmrg).unwrap();
        let c0 = Coord::new(0, 0);
        for dir in CornerDir::ALL {
            assert_eq!(env.c(c0, dir).unwrap().shape(), &[4, 4]);
        }
        for dir in EdgeDir::ALL {
            assert_eq!(env.t(c0, dir).unwrap().shape(), &[4, 4, 4]);
        }
        assert!(!env.has_non_finite());
        let m = tn::max_abs(env.c(c0, CornerDir::LeftUp).unwrap());
        assert!((m - 1.0).abs() < 1e-12);
    }

    #[test]
    fn init_pads_and_slices() {
        let mut rng = StdRng::seed_from_u64(5);
        let state: IPEPS<C64>
            = IPEPS::random(2, 3, Tiling::Bipartite, &mut rng).unwrap();
        let mut env: Env<C64> = Env::new(4);
        init_env(&state, &mut env, EnvInit::Ctmrg).unwrap();
        assert_eq!(env.sites(), vec![Coord::new(0, 0), Coord::new(1, 0)]);
        assert_eq!(env.t(Coord::new(1, 0), EdgeDir::Down).unwrap().shape(), &[9, 4, 4]);
        let big = env.extend(12).unwrap();
        assert_eq!(big.c(Coord::new(0, 0), CornerDir::RightDown).unwrap().shape(), &[12, 12]);
        assert_eq!(big.t(Coord::new(0, 0), EdgeDir::Left).unwrap().shape(), &[12, 12, 9]);
        let back = big.extend(4).unwrap();
        assert!(back.max_diff(&env).unwrap() < 1e-14);
    }

    #[test]
    fn corner_is_hermitian_doubled_tensor() {
        let mut rng = StdRng::seed_from_u64(11);
        let state: IPEPS<C64>
            = IPEPS::random(2, 2, Tiling::Rect { lx: 1, ly: 1 }, &mut rng).unwrap();
        let a = state.site(Coord::new(0, 0)).unwrap();
        let c = corner_from_site(a, CornerDir::LeftUp).unwrap();
        // C[(d d'), (r r')] = conj(C[(d' d), (r' r)])
        let c4 = tn::reshape(&c, &[2, 2, 2, 2]).unwrap();
        for (i, j, k, l) in itertools::iproduct!(0..2, 0..2, 0..2, 0..2) {
            let x = c4[[i, j, k, l]];
            let y = c4[[j, i, l, k]].conj();
            assert!((x - y).norm() < 1e-12);
        }
    }

    #[test]
    fn unsupported_init_methods() {
        let mut rng = StdRng::seed_from_u64(0);
        let state: IPEPS<f64>
            = IPEPS::random(2, 2, Tiling::Rect { lx: 1, ly: 1 }, &mut rng).unwrap();
        let mut env: Env<f64> = Env::new(4);
        for method in [EnvInit::Const, EnvInit::Random, EnvInit::CtmrgObc] {
            assert!(matches!(
                init_env(&state, &mut env, method),
                Err(NotImplemented(_))
            ));
        }
        assert!(matches!(
            init_env_named(&state, &mut env, "NOPE"),
            Err(Config(ConfigError::UnknownInit(_)))
        ));
        let mut wrong: Env<f64>
            = Env::with_global(4, GlobalArgs { dtype: DType::F32, device: Device::Cpu });
        assert!(matches!(
            init_env(&state, &mut wrong, EnvInit::Ctmrg),
            Err(DTypeMismatch { .. })
        ));
        assert!(matches!(
            env.c(Coord::new(3, 3), CornerDir::LeftUp),
            Err(MissingCorner { .. })
        ));
    }

    #[test]
    fn rotation_round_trip() {
        let mut rng = StdRng::seed_from_u64(2);
        let state: IPEPS<f64>
            = IPEPS::random(2, 2, Tiling::Rect { lx: 2, ly: 2 }, &mut rng).unwrap();
        let mut env: Env<f64> = Env::new(5);
        init_env(&state, &mut env, EnvInit::Ctmrg).unwrap();
        let r1 = env.rotated(1).unwrap();
        assert_eq!(
            r1.t(Coord::new(0, 0).rot(), EdgeDir::Up.rot()).unwrap().shape(),
            &[5, 5, 4],
        );
        let r4 = r1.rotated(3).unwrap();
        assert_eq!(r4.max_diff(&env).unwrap(), 0.0);
    }
}
