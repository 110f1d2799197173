//! Environment of a single-site, C4v-symmetric iPEPS.
//!
//! Symmetry makes all four corners equal to a single symmetric matrix `C` and
//! all four edges equal to a single tensor `T`, stored with the leg order of
//! the left edge of the generic environment:
//!
//! ```text
//!   C -- 1          0
//!   |               |
//!   0               T -- 2 (D²)
//!                   |
//!                   1
//! ```
//!
//! [`EnvC4v::to_env`] expands the pair into the generic layout of
//! [`Env`][crate::env::Env] by relabeling legs.

use std::fmt;
use ndarray as nd;
use ndarray_linalg::SVDInto;
use num_traits::{ Float, Zero };
use crate::{
    Elem,
    config::{ EnvInit, GlobalArgs },
    env::{
        Env,
        EnvError,
        EnvResult,
        SiteEnv,
        corner_from_site,
        edge_from_site,
    },
    lattice::{ Coord, CornerDir, EdgeDir },
    state::IPEPSC4v,
    tn::{ self, TnError },
};

/// Dense C4v-symmetric environment.
#[derive(Clone)]
pub struct EnvC4v<A> {
    pub(crate) chi: usize,
    pub(crate) c: nd::ArrayD<A>,
    pub(crate) t: nd::ArrayD<A>,
    pub(crate) global: GlobalArgs,
}

impl<A> fmt::Debug for EnvC4v<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvC4v")
            .field("chi", &self.chi)
            .field("c", &self.c.shape())
            .field("t", &self.t.shape())
            .field("global", &self.global)
            .finish()
    }
}

/// The eight tensors around the site, relabeled to the generic conventions.
pub(crate) struct Unfolded<A> {
    c: nd::ArrayD<A>,
    t_u: nd::ArrayD<A>,
    t_l: nd::ArrayD<A>,
    t_d: nd::ArrayD<A>,
    t_r: nd::ArrayD<A>,
}

impl<A> Unfolded<A> {
    pub(crate) fn site_env(&self) -> SiteEnv<'_, A> {
        SiteEnv {
            c_lu: &self.c,
            c_ru: &self.c,
            c_rd: &self.c,
            c_ld: &self.c,
            t_u: &self.t_u,
            t_l: &self.t_l,
            t_d: &self.t_d,
            t_r: &self.t_r,
        }
    }
}

impl<A> EnvC4v<A>
where A: Elem
{
    /// Create a new environment with bond dimension `chi` and all-zero
    /// tensors. The `D²` dimension of the edge is fixed on initialization.
    pub fn new(chi: usize) -> Self {
        let global = GlobalArgs { dtype: A::DTYPE, ..GlobalArgs::default() };
        Self::with_global(chi, global)
    }

    pub fn with_global(chi: usize, global: GlobalArgs) -> Self {
        Self {
            chi,
            c: nd::ArrayD::zeros(vec![chi, chi]),
            t: nd::ArrayD::zeros(vec![chi, chi, 0]),
            global,
        }
    }

    /// Wrap a corner and an edge tensor, zero-padding or slicing the χ legs.
    pub fn from_tensors(chi: usize, c: nd::ArrayD<A>, t: nd::ArrayD<A>)
        -> EnvResult<Self>
    {
        if c.ndim() != 2 {
            return Err(TnError::RankMismatch { expected: 2, shape: c.shape().to_vec() }.into());
        }
        if t.ndim() != 3 {
            return Err(TnError::RankMismatch { expected: 3, shape: t.shape().to_vec() }.into());
        }
        let d2 = t.shape()[2];
        let mut env = Self::new(chi);
        env.c = tn::pad_to(&c, &[chi, chi])?;
        env.t = tn::pad_to(&t, &[chi, chi, d2])?;
        Ok(env)
    }

    pub fn chi(&self) -> usize { self.chi }

    pub fn global(&self) -> GlobalArgs { self.global }

    /// Corner matrix `[χ, χ]`.
    pub fn c(&self) -> &nd::ArrayD<A> { &self.c }

    /// Edge tensor `[χ, χ, D²]`.
    pub fn t(&self) -> &nd::ArrayD<A> { &self.t }

    pub fn set_c(&mut self, c: nd::ArrayD<A>) { self.c = c; }

    pub fn set_t(&mut self, t: nd::ArrayD<A>) { self.t = t; }

    pub(crate) fn unfold(&self) -> EnvResult<Unfolded<A>> {
        Ok(Unfolded {
            c: self.c.clone(),
            t_u: tn::permute(&self.t, &[0, 2, 1])?,
            t_l: self.t.clone(),
            t_d: tn::permute(&self.t, &[2, 0, 1])?,
            t_r: tn::permute(&self.t, &[0, 2, 1])?,
        })
    }

    /// Expand into a generic single-site environment at `(0, 0)`.
    pub fn to_env(&self) -> EnvResult<Env<A>> {
        let unfolded = self.unfold()?;
        let mut env = Env::with_global(self.chi, self.global);
        let c0 = Coord::new(0, 0);
        for dir in CornerDir::ALL {
            env.set_c(c0, dir, unfolded.c.clone());
        }
        env.set_t(c0, EdgeDir::Up, unfolded.t_u);
        env.set_t(c0, EdgeDir::Left, unfolded.t_l);
        env.set_t(c0, EdgeDir::Down, unfolded.t_d);
        env.set_t(c0, EdgeDir::Right, unfolded.t_r);
        Ok(env)
    }

    /// Singular values of the corner, normalized to the largest one and
    /// zero-padded to χ.
    pub fn corner_spectrum(&self) -> EnvResult<nd::Array1<A::Real>> {
        let m = tn::to_matrix(&self.c, 1)?;
        let (_, s, _) = m.svd_into(false, false)?;
        let s0 = s.iter().copied().fold(A::Real::zero(), Float::max);
        let mut spec: nd::Array1<A::Real> = nd::Array1::zeros(self.chi);
        s.iter().take(self.chi).enumerate()
            .for_each(|(k, sk)| {
                spec[k] = if s0 > A::Real::zero() { *sk / s0 } else { *sk };
            });
        Ok(spec)
    }

    /// Corner spectrum (unnormalized singular values of `C`, in descending
    /// order) together with the sizes of its multiplets, where neighboring
    /// values closer than `eps_multiplet_gap` belong to the same multiplet.
    pub fn compute_multiplets(&self, eps_multiplet_gap: f64)
        -> EnvResult<(nd::Array1<A::Real>, Vec<usize>)>
    {
        let m = tn::to_matrix(&self.c, 1)?;
        let (_, s, _) = m.svd_into(false, false)?;
        let s: Vec<f64>
            = s.iter()
            .map(|x| num_traits::cast::<A::Real, f64>(*x).unwrap_or(0.0))
            .collect();
        let mults = multiplets(&s, eps_multiplet_gap);
        let spec: nd::Array1<A::Real>
            = s.iter()
            .map(|x| A::real(*x))
            .collect();
        Ok((spec, mults))
    }

    /// Return `true` if any stored element is NaN or infinite.
    pub fn has_non_finite(&self) -> bool {
        self.c.iter().chain(self.t.iter())
            .any(|x| !Float::is_finite(x.re()) || !Float::is_finite(x.im()))
    }
}

/// Sizes of the groups of a descending sequence whose consecutive gaps are at
/// most `eps`. The sequence is implicitly terminated by a zero, so trailing
/// values that are numerically zero are not counted as a multiplet.
pub fn multiplets(s: &[f64], eps: f64) -> Vec<usize> {
    let mut sorted = s.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    sorted.push(0.0);
    let mut mults: Vec<usize> = Vec::new();
    let mut len: usize = 0;
    for w in sorted.windows(2) {
        len += 1;
        if w[0] - w[1] > eps {
            mults.push(len);
            len = 0;
        }
    }
    mults
}

/// Populate a C4v environment for `state` using the given method.
///
/// Only [`EnvInit::Ctmrg`] is supported: `C` and `T` are built from the
/// doubled on-site tensor, with every leg pointing away from the center traced
/// out.
pub fn init_env_c4v<A>(state: &IPEPSC4v<A>, env: &mut EnvC4v<A>, method: EnvInit)
    -> EnvResult<()>
where A: Elem
{
    if env.global.dtype != A::DTYPE {
        return Err(EnvError::DTypeMismatch { config: env.global.dtype, elem: A::DTYPE });
    }
    match method {
        EnvInit::Ctmrg => {
            let a = state.site_tensor();
            let c = corner_from_site(a, CornerDir::LeftUp)?;
            let t = edge_from_site(a, EdgeDir::Left)?;
            let mut new = EnvC4v::from_tensors(env.chi, c, t)?;
            new.global = env.global;
            *env = new;
            log::debug!("initialized C4v environment with chi = {}", env.chi);
            Ok(())
        },
        other => Err(EnvError::NotImplemented(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::env::{ init_env, tensors_from_sites };

    #[test]
    fn multiplet_sizes() {
        assert_eq!(multiplets(&[1.0, 0.5, 0.5, 0.2, 1e-14], 1e-10), vec![1, 2, 1]);
        assert_eq!(multiplets(&[1.0, 1.0, 0.0, 0.0], 1e-10), vec![2]);
        assert!(multiplets(&[], 1e-10).is_empty());
    }

    #[test]
    fn init_matches_generic() {
        let mut rng = StdRng::seed_from_u64(10546);
        let state: IPEPSC4v<f64> = IPEPSC4v::random(2, 2, &mut rng).unwrap();
        let mut env: EnvC4v<f64> = EnvC4v::new(6);
        init_env_c4v(&state, &mut env, EnvInit::Ctmrg).unwrap();
        assert_eq!(env.c().shape(), &[6, 6]);
        assert_eq!(env.t().shape(), &[6, 6, 4]);
        let c = env.c();
        assert!(tn::max_abs(&(c - &c.t())) < 1e-14);

        let generic = state.to_ipeps().unwrap();
        let mut env_g: Env<f64> = Env::new(6);
        init_env(&generic, &mut env_g, EnvInit::Ctmrg).unwrap();
        let expanded = env.to_env().unwrap();
        assert!(expanded.max_diff(&env_g).unwrap() < 1e-12);
        assert_eq!(tensors_from_sites(&generic).unwrap().t.len(), 4);

        let (spec, mults) = env.compute_multiplets(1e-10).unwrap();
        assert_eq!(spec.len(), 6);
        assert!(mults.iter().sum::<usize>() <= 6);
        assert!(matches!(
            init_env_c4v(&state, &mut env, EnvInit::Random),
            Err(EnvError::NotImplemented(_)),
        ));
    }
}
