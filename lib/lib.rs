#![allow(dead_code, non_snake_case, non_upper_case_globals)]

//! Corner transfer matrix renormalization group (CTMRG) environments for
//! infinite projected entangled-pair states (iPEPS) on the square lattice, and
//! the reduced density matrices computed from them.
//!
//! An iPEPS is described by a finite unit cell of rank-5 on-site tensors
//! `A[s, u, l, d, r]` (one physical leg and four auxiliary legs) together with
//! a tiling function folding every lattice coordinate into the unit cell. The
//! norm `⟨ψ∣ψ⟩` is an infinite two-dimensional network of doubled tensors
//! `a = Σ_s A ⊗ A*`, which CTMRG approximates around every site of the cell by
//! four corner matrices `C` and four edge tensors `T` of bond dimension χ:
//!
//! ```text
//!   C(-1,-1) -- T(0,-1) -- C(1,-1)
//!      |           |          |
//!   T(-1,0) ---   a    --- T(1,0)
//!      |           |          |
//!   C(-1,1) --- T(0,1) --- C(1,1)
//! ```
//!
//! The environment is refined by repeated directional moves (absorption of one
//! row/column of the lattice followed by truncation back to χ with SVD
//! projectors) until a convergence check is satisfied. Reduced density matrices
//! of small patches are then obtained by contracting the corresponding
//! fragments of the network.
//!
//! The crate provides:
//! - [`env`]: the environment store and its initialization
//! - [`ctmrg`]: the directional CTMRG engine
//! - [`conv`]: convergence checks
//! - [`rdm`]: reduced density matrices and their post-processing
//! - [`env_c4v`], [`ctmrg_c4v`], [`rdm_c4v`]: single-site C<sub>4v</sub>
//!   symmetric specializations
//! - [`block`], [`env_abelian`], [`env_c4v_abelian`]: block-sparse tensors with
//!   abelian symmetries and their environments
//!
//! # Example
//!
//! ```ignore
//! use rand::{ SeedableRng, rngs::StdRng };
//! use ctmrg::{
//!     config::CtmArgs,
//!     conv::CornerSpectrumConv,
//!     ctmrg,
//!     env::{ Env, init_env },
//!     lattice::Coord,
//!     rdm::{ RdmOpts, rdm1x1 },
//!     state::{ IPEPS, Tiling },
//! };
//!
//! let mut rng = StdRng::seed_from_u64(10546);
//! let state: IPEPS<f64> = IPEPS::random(2, 2, Tiling::Rect { lx: 1, ly: 1 }, &mut rng)?;
//! let args = CtmArgs { chi: 8, ..CtmArgs::default() };
//! let mut env: Env<f64> = Env::new(args.chi);
//! init_env(&state, &mut env, args.ctm_env_init_type)?;
//! let out = ctmrg::run(&state, env, CornerSpectrumConv, &args)?;
//! let rho = rdm1x1(Coord::new(0, 0), &state, &out.env, RdmOpts::default())?;
//! ```

use ndarray_linalg::types::{ Scalar, Lapack };
use num_complex::{ Complex32 as C32, Complex64 as C64 };
use crate::config::DType;

pub mod config;
pub mod lattice;
pub mod tn;
pub mod state;
pub mod ops;

pub mod env;
pub mod corners;
pub mod ctmrg;
pub mod conv;
pub mod rdm;

pub mod env_c4v;
pub mod ctmrg_c4v;
pub mod rdm_c4v;

pub mod block;
pub mod env_abelian;
pub mod env_c4v_abelian;

/// Element type of all tensors handled by this crate.
///
/// This is a thin extension of [`Scalar`] + [`Lapack`] recording which of the
/// four supported numeric types is in use, so that environments can be checked
/// against the process-wide [`GlobalArgs`][config::GlobalArgs].
pub trait Elem: Scalar + Lapack {
    /// Runtime tag for the type.
    const DTYPE: DType;

    /// Construct from real and imaginary components.
    ///
    /// The imaginary part is discarded for real types.
    fn from_components(re: Self::Real, im: Self::Real) -> Self;

    /// Return `true` if the type has a non-trivial imaginary part.
    fn is_complex() -> bool { matches!(Self::DTYPE, DType::C32 | DType::C64) }
}

impl Elem for f32 {
    const DTYPE: DType = DType::F32;

    fn from_components(re: f32, _im: f32) -> Self { re }
}

impl Elem for f64 {
    const DTYPE: DType = DType::F64;

    fn from_components(re: f64, _im: f64) -> Self { re }
}

impl Elem for C32 {
    const DTYPE: DType = DType::C32;

    fn from_components(re: f32, im: f32) -> Self { Self { re, im } }
}

impl Elem for C64 {
    const DTYPE: DType = DType::C64;

    fn from_components(re: f64, im: f64) -> Self { Self { re, im } }
}
