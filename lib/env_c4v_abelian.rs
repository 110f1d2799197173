//! Block-sparse environment of a single-site, C4v-symmetric iPEPS.
//!
//! Like [`EnvC4v`], the environment is a single corner `C[χ, χ]` and a single
//! edge `T[χ, χ, D²]`, here stored as [`BlockTensor`]s built from the site at
//! `(0, 0)` of an [`IPEPSAbelian`].

use std::fmt;
use ndarray as nd;
use ndarray_linalg::SVDInto;
use crate::{
    Elem,
    block::{ BlockTensor, Leg },
    config::{ EnvInit, GlobalArgs },
    env::{ EnvError, EnvResult, corner_from_site, edge_from_site },
    env_abelian::IPEPSAbelian,
    env_c4v::{ EnvC4v, multiplets },
    lattice::{ Coord, CornerDir, EdgeDir },
    state::Wavefunction,
    tn::{ self, TnError },
};

/// Block-sparse C4v-symmetric environment.
#[derive(Clone)]
pub struct EnvC4vAbelian<A> {
    pub(crate) chi: usize,
    pub(crate) c: Option<BlockTensor<A>>,
    pub(crate) t: Option<BlockTensor<A>>,
    pub(crate) global: GlobalArgs,
}

impl<A> fmt::Debug for EnvC4vAbelian<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvC4vAbelian")
            .field("chi", &self.chi)
            .field("c", &self.c)
            .field("t", &self.t)
            .field("global", &self.global)
            .finish()
    }
}

impl<A> EnvC4vAbelian<A>
where A: Elem
{
    /// Create a new environment with bond dimension `chi` and no tensors.
    pub fn new(chi: usize) -> Self {
        let global = GlobalArgs { dtype: A::DTYPE, ..GlobalArgs::default() };
        Self::with_global(chi, global)
    }

    pub fn with_global(chi: usize, global: GlobalArgs) -> Self {
        Self { chi, c: None, t: None, global }
    }

    pub fn chi(&self) -> usize { self.chi }

    pub fn global(&self) -> GlobalArgs { self.global }

    pub fn c(&self) -> EnvResult<&BlockTensor<A>> {
        self.c.as_ref()
            .ok_or(EnvError::MissingCorner { coord: Coord::new(0, 0), dir: CornerDir::LeftUp })
    }

    pub fn t(&self) -> EnvResult<&BlockTensor<A>> {
        self.t.as_ref()
            .ok_or(EnvError::MissingEdge { coord: Coord::new(0, 0), dir: EdgeDir::Left })
    }

    /// Convert to a dense C4v environment.
    ///
    /// All χ legs are joined to each other, so their sectors are merged into a
    /// single layout. The `D²` leg of `T` is split, densified in the layout of
    /// the on-site tensor, and fused again with the ket index major. The
    /// result has bond dimension `max(χ, merged leg dimension)`.
    pub fn to_dense(&self) -> EnvResult<EnvC4v<A>> {
        let c = self.c()?;
        let t = self.t()?;
        let chi_legs = [c.leg(0), c.leg(1), t.leg(0), t.leg(1)];
        let mut merged: Option<Leg> = None;
        for leg in chi_legs.into_iter() {
            let leg = leg.ok_or(TnError::RankMismatch { expected: 2, shape: Vec::new() })?;
            merged = Some(match merged {
                Some(m) => m.union(leg).map_err(TnError::from)?,
                None => leg.union(leg).map_err(TnError::from)?,
            });
        }
        let merged = merged.ok_or(TnError::RankMismatch { expected: 2, shape: Vec::new() })?;
        let max_chi = merged.dim().max(self.chi);
        if max_chi > self.chi {
            log::warn!(
                "dense environment needs chi = {max_chi}, larger than the nominal chi = {}",
                self.chi,
            );
        }
        let c_dense
            = c.to_dense_with(&[merged.clone(), merged.clone()])
            .map_err(TnError::from)?;
        let split = t.unfuse(2).map_err(TnError::from)?;
        let legs = [
            merged.clone(),
            merged,
            split.legs()[2].clone(),
            split.legs()[3].clone(),
        ];
        let t_dense = split.to_dense_with(&legs).map_err(TnError::from)?;
        let t_dense = tn::fuse(&t_dense, &[1, 1, 2])?;
        let mut env = EnvC4v::from_tensors(max_chi, c_dense, t_dense)?;
        env.global = self.global;
        Ok(env)
    }

    /// Singular values of the corner (unnormalized, in descending order)
    /// together with the sizes of its multiplets, where neighboring values
    /// closer than `eps_multiplet_gap` belong to the same multiplet.
    ///
    /// The corner is block diagonal, so its spectrum is the union of the
    /// spectra of its blocks.
    pub fn compute_multiplets(&self, eps_multiplet_gap: f64)
        -> EnvResult<(nd::Array1<A::Real>, Vec<usize>)>
    {
        let mut s: Vec<f64> = Vec::new();
        for (_, block) in self.c()?.blocks() {
            let m = tn::to_matrix(block, 1)?;
            let (_, sb, _) = m.svd_into(false, false)?;
            s.extend(
                sb.iter().map(|x| num_traits::cast::<A::Real, f64>(*x).unwrap_or(0.0))
            );
        }
        s.sort_by(|a, b| b.total_cmp(a));
        let mults = multiplets(&s, eps_multiplet_gap);
        let spec: nd::Array1<A::Real> = s.iter().map(|x| A::real(*x)).collect();
        Ok((spec, mults))
    }
}

/// Populate a block-sparse C4v environment from the site at `(0, 0)` of
/// `state`.
///
/// Only [`EnvInit::Ctmrg`] is supported.
pub fn init_env_c4v<A>(state: &IPEPSAbelian<A>, env: &mut EnvC4vAbelian<A>, method: EnvInit)
    -> EnvResult<()>
where A: Elem
{
    if env.global.dtype != A::DTYPE {
        return Err(EnvError::DTypeMismatch { config: env.global.dtype, elem: A::DTYPE });
    }
    match method {
        EnvInit::Ctmrg => {
            let a = state.site_checked(Coord::new(0, 0))?;
            env.c = Some(corner_from_site(a, CornerDir::LeftUp)?);
            env.t = Some(edge_from_site(a, EdgeDir::Left)?);
            log::debug!("initialized block-sparse C4v environment with chi = {}", env.chi);
            Ok(())
        },
        other => Err(EnvError::NotImplemented(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use crate::{
        block::Symmetry,
        config::CtmArgs,
        conv::CornerSpectrumConv,
        ctmrg_c4v,
        env_c4v::init_env_c4v as init_env_c4v_dense,
        ops,
        rdm::{ self, RdmOpts },
        rdm_c4v,
        state::{ IPEPSC4v, Tiling, is_c4v_symmetric },
    };

    const BETA: f64 = 0.3;

    fn z2_ising() -> (IPEPSAbelian<f64>, IPEPSC4v<f64>) {
        let site: nd::ArrayD<f64> = ops::ising_site_x(BETA);
        let leg = |sig| Leg::new(sig, &[(0, 1), (1, 1)]).unwrap();
        let legs = vec![leg(-1), leg(1), leg(1), leg(-1), leg(-1)];
        let block = BlockTensor::from_dense(&site, Symmetry::Zn(2), legs, 0).unwrap();
        assert!(tn::max_abs(&(tn::Backend::to_dense(&block).unwrap() - &site)) < 1e-15);
        let sites: BTreeMap<Coord, BlockTensor<f64>>
            = [(Coord::new(0, 0), block)].into_iter().collect();
        let state = IPEPSAbelian::new(sites, Tiling::Rect { lx: 1, ly: 1 }).unwrap();
        assert!(is_c4v_symmetric(&site, 1e-14).unwrap());
        (state, IPEPSC4v::new(site).unwrap())
    }

    #[test]
    fn init_matches_dense() {
        let (state, dense_state) = z2_ising();
        let mut env: EnvC4vAbelian<f64> = EnvC4vAbelian::new(8);
        init_env_c4v(&state, &mut env, EnvInit::Ctmrg).unwrap();
        assert_eq!(env.c().unwrap().num_blocks(), 2);
        let converted = env.to_dense().unwrap();
        assert_eq!(converted.chi(), 8);
        assert_eq!(converted.t().shape(), &[8, 8, 4]);

        let mut dense_env: EnvC4v<f64> = EnvC4v::new(8);
        init_env_c4v_dense(&dense_state, &mut dense_env, EnvInit::Ctmrg).unwrap();
        let r_block = rdm_c4v::rdm1x1(&dense_state, &converted, RdmOpts::default()).unwrap();
        let r_dense = rdm_c4v::rdm1x1(&dense_state, &dense_env, RdmOpts::default()).unwrap();
        assert!(tn::max_abs(&(r_block - r_dense)) < 1e-12);

        let (spec, mults) = env.compute_multiplets(1e-10).unwrap();
        let (spec_dense, _) = dense_env.compute_multiplets(1e-10).unwrap();
        assert_eq!(spec.len(), 4);
        spec.iter().zip(spec_dense.iter())
            .for_each(|(x, y)| assert!((x - y).abs() < 1e-12));
        assert!(mults.iter().sum::<usize>() <= 4);

        assert!(matches!(
            init_env_c4v(&state, &mut env, EnvInit::Const),
            Err(EnvError::NotImplemented(_)),
        ));
    }

    #[test]
    fn converged_correlation_is_exact() {
        let (state, dense_state) = z2_ising();
        let args = CtmArgs {
            chi: 16,
            ctm_max_iter: 500,
            ctm_conv_tol: 1e-10,
            ..CtmArgs::default()
        };
        let mut env: EnvC4vAbelian<f64> = EnvC4vAbelian::new(args.chi);
        init_env_c4v(&state, &mut env, EnvInit::Ctmrg).unwrap();
        let out = ctmrg_c4v::run(&dense_state, env.to_dense().unwrap(), CornerSpectrumConv, &args)
            .unwrap();
        assert!(out.converged);
        let rho = rdm_c4v::rdm2x1(&dense_state, &out.env, RdmOpts::default()).unwrap();
        let xx = ops::kron(&ops::make_sx::<f64>(), &ops::make_sx::<f64>());
        let e = rdm::expectation(&rho, &xx).unwrap();
        assert!((e - ops::onsager_nn_correlation(BETA)).abs() < 1e-6);
    }
}
