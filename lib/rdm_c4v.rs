//! Reduced density matrices of a C<sub>4v</sub>-symmetric iPEPS.
//!
//! Every routine works on the single site of the state and its environment
//! [`EnvC4v`], relabeled into the generic layout of [`crate::corners`], and
//! returns tensors in the same layout as [`crate::rdm`]: all ket indices first,
//! then the matching bra indices. Symmetry is used where it saves work, e.g.
//! the two halves of [`rdm2x1`] are the same tensor.
//!
//! The `_sl` variants never form the doubled on-site tensor and absorb the ket
//! and bra layers one at a time instead, which lowers the memory footprint for
//! larger bond dimensions.

use ndarray as nd;
use crate::{
    Elem,
    corners::{ c2x1_ld, c2x2_ld, c2x2_lu, c2x2_lu_sl, c2x2_rd, c2x2_ru, site_ring },
    env_c4v::EnvC4v,
    rdm::{ RdmOpts, RdmResult, sym_pos_def_rdm, unfuse_aux },
    state::IPEPSC4v,
    tn::{ self, contract, double_layer, double_layer_open },
};

fn prelude(name: &str, opts: &RdmOpts) {
    if opts.force_cpu {
        log::trace!("{name}: contracting on the host");
    }
    if opts.verbosity > 0 {
        log::debug!("{name} (C4v)");
    }
}

/// Single-site reduced density matrix `ρ[s, s']`.
pub fn rdm1x1<A>(state: &IPEPSC4v<A>, env: &EnvC4v<A>, opts: RdmOpts)
    -> RdmResult<nd::ArrayD<A>>
where A: Elem
{
    prelude("rdm1x1", &opts);
    let unfolded = env.unfold()?;
    let ring = site_ring(&unfolded.site_env())?;
    let a = double_layer_open(state.site_tensor())?;
    let rdm = contract("abcd,abcdst->st", &ring, &a)?;
    sym_pos_def_rdm(rdm, &opts)
}

/// Like [`rdm1x1`], contracting the ket and bra layers separately.
pub fn rdm1x1_sl<A>(state: &IPEPSC4v<A>, env: &EnvC4v<A>, opts: RdmOpts)
    -> RdmResult<nd::ArrayD<A>>
where A: Elem
{
    prelude("rdm1x1_sl", &opts);
    let unfolded = env.unfold()?;
    let ring = site_ring(&unfolded.site_env())?;
    let a = state.site_tensor();
    let split: Vec<usize> = a.shape()[1..].iter().flat_map(|d| [*d, *d]).collect();
    let ring = tn::reshape(&ring, &split)?;
    let x = contract("aAbBcCdD,sabcd->ABCDs", &ring, a)?;
    let rdm = contract("ABCDs,tABCD->st", &x, &tn::conj(a))?;
    sym_pos_def_rdm(rdm, &opts)
}

/// Environment of the site seen as an operator on its auxiliary space,
/// `ρ[u, l, d, r, u', l', d', r']`.
pub fn aux_rdm1x1<A>(state: &IPEPSC4v<A>, env: &EnvC4v<A>, opts: RdmOpts)
    -> RdmResult<nd::ArrayD<A>>
where A: Elem
{
    prelude("aux_rdm1x1", &opts);
    let unfolded = env.unfold()?;
    let ring = site_ring(&unfolded.site_env())?;
    let rdm = unfuse_aux(&ring, &state.site_tensor().shape()[1..])?;
    sym_pos_def_rdm(rdm, &opts)
}

// left half of the 2x1 network; by reflection symmetry it is also the right
// half
fn half2x1<A>(env: &EnvC4v<A>, lu_open: nd::ArrayD<A>) -> RdmResult<nd::ArrayD<A>>
where A: Elem
{
    let unfolded = env.unfold()?;
    Ok(contract("ab,acst->bcst", &c2x1_ld(&unfolded.site_env())?, &lu_open)?)
}

/// Reduced density matrix `ρ[s0, s1, s0', s1']` of a nearest-neighbor pair.
pub fn rdm2x1<A>(state: &IPEPSC4v<A>, env: &EnvC4v<A>, opts: RdmOpts)
    -> RdmResult<nd::ArrayD<A>>
where A: Elem
{
    prelude("rdm2x1", &opts);
    let unfolded = env.unfold()?;
    let a = double_layer_open(state.site_tensor())?;
    let half = half2x1(env, c2x2_lu(&unfolded.site_env(), &a)?)?;
    let rdm = contract("xyst,xyuv->sutv", &half, &half)?;
    sym_pos_def_rdm(rdm, &opts)
}

/// Like [`rdm2x1`], contracting the ket and bra layers separately.
pub fn rdm2x1_sl<A>(state: &IPEPSC4v<A>, env: &EnvC4v<A>, opts: RdmOpts)
    -> RdmResult<nd::ArrayD<A>>
where A: Elem
{
    prelude("rdm2x1_sl", &opts);
    let unfolded = env.unfold()?;
    let lu = c2x2_lu_sl(&unfolded.site_env(), state.site_tensor(), true)?;
    let half = half2x1(env, lu)?;
    let rdm = contract("xyst,xyuv->sutv", &half, &half)?;
    sym_pos_def_rdm(rdm, &opts)
}

// enlarged corners [LU, RU, RD, LD] of the plaquette, open where requested
fn plaquette<A>(state: &IPEPSC4v<A>, env: &EnvC4v<A>, open: [bool; 4])
    -> RdmResult<[nd::ArrayD<A>; 4]>
where A: Elem
{
    let unfolded = env.unfold()?;
    let se = unfolded.site_env();
    let a = state.site_tensor();
    let a_open = double_layer_open(a)?;
    let a_closed = double_layer(a)?;
    let pick = |k: usize| if open[k] { &a_open } else { &a_closed };
    Ok([
        c2x2_lu(&se, pick(0))?,
        c2x2_ru(&se, pick(1))?,
        c2x2_rd(&se, pick(2))?,
        c2x2_ld(&se, pick(3))?,
    ])
}

/// Reduced density matrix of a 2x2 plaquette,
/// `ρ[s0, s1, s2, s3, s0', s1', s2', s3']`, with the sites ordered
/// upper-left, upper-right, lower-left, lower-right.
pub fn rdm2x2<A>(state: &IPEPSC4v<A>, env: &EnvC4v<A>, opts: RdmOpts)
    -> RdmResult<nd::ArrayD<A>>
where A: Elem
{
    prelude("rdm2x2", &opts);
    let [lu, ru, rd, ld] = plaquette(state, env, [true; 4])?;
    let upper = contract("abst,bcuv->acstuv", &lu, &ru)?;
    let lower = contract("abst,bcuv->acstuv", &rd, &ld)?;
    let rdm = contract("acstuv,cawxyz->suywtvzx", &upper, &lower)?;
    sym_pos_def_rdm(rdm, &opts)
}

/// Reduced density matrix `ρ[s0, s1, s0', s1']` of the nearest-neighbor pair
/// along the upper edge of a 2x2 plaquette. The result equals [`rdm2x1`] up
/// to the finite-χ error of the environment.
pub fn rdm2x2_nn<A>(state: &IPEPSC4v<A>, env: &EnvC4v<A>, opts: RdmOpts)
    -> RdmResult<nd::ArrayD<A>>
where A: Elem
{
    prelude("rdm2x2_nn", &opts);
    let [lu, ru, rd, ld] = plaquette(state, env, [true, true, false, false])?;
    let upper = contract("abst,bcuv->acstuv", &lu, &ru)?;
    let lower = contract("ab,bc->ac", &rd, &ld)?;
    let rdm = contract("acstuv,ca->sutv", &upper, &lower)?;
    sym_pos_def_rdm(rdm, &opts)
}

/// Reduced density matrix `ρ[s0, s1, s0', s1']` of a next-nearest-neighbor
/// (diagonal) pair in a 2x2 plaquette.
pub fn rdm2x2_nnn<A>(state: &IPEPSC4v<A>, env: &EnvC4v<A>, opts: RdmOpts)
    -> RdmResult<nd::ArrayD<A>>
where A: Elem
{
    prelude("rdm2x2_nnn", &opts);
    let [lu, ru, rd, ld] = plaquette(state, env, [true, false, true, false])?;
    let upper = contract("abst,bc->acst", &lu, &ru)?;
    let lower = contract("abst,bc->acst", &rd, &ld)?;
    let rdm = contract("acst,cauv->sutv", &upper, &lower)?;
    sym_pos_def_rdm(rdm, &opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{
        config::{ CtmArgs, EnvInit },
        ctmrg_c4v,
        env_c4v::init_env_c4v,
        lattice::Coord,
        rdm,
    };

    fn converged_env(seed: u64) -> (IPEPSC4v<f64>, EnvC4v<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let state: IPEPSC4v<f64> = IPEPSC4v::random(2, 2, &mut rng).unwrap();
        let args = CtmArgs { chi: 6, ..CtmArgs::default() };
        let mut env: EnvC4v<f64> = EnvC4v::new(args.chi);
        init_env_c4v(&state, &mut env, EnvInit::Ctmrg).unwrap();
        for _ in 0..8 {
            env = ctmrg_c4v::step(&state, &env, &args).unwrap();
        }
        (state, env)
    }

    fn assert_close(a: &nd::ArrayD<f64>, b: &nd::ArrayD<f64>, tol: f64) {
        assert_eq!(a.shape(), b.shape());
        assert!(tn::max_abs(&(a - b)) < tol);
    }

    fn assert_density_matrix(rdm: &nd::ArrayD<f64>) {
        let m = tn::to_matrix(rdm, rdm.ndim() / 2).unwrap();
        assert!((tn::trace(&m) - 1.0).abs() < 1e-12);
        assert!(tn::max_abs(&(&m - &m.t())) < 1e-12);
    }

    #[test]
    fn matches_generic_density_matrices() {
        let (state, env) = converged_env(10546);
        let generic = state.to_ipeps().unwrap();
        let env_g = env.to_env().unwrap();
        let c = Coord::new(0, 0);
        let opts = RdmOpts::default();
        assert_close(
            &rdm1x1(&state, &env, opts).unwrap(),
            &rdm::rdm1x1(c, &generic, &env_g, opts).unwrap(),
            1e-12,
        );
        assert_close(
            &rdm2x1(&state, &env, opts).unwrap(),
            &rdm::rdm2x1(c, &generic, &env_g, opts).unwrap(),
            1e-10,
        );
        assert_close(
            &rdm2x2(&state, &env, opts).unwrap(),
            &rdm::rdm2x2(c, &generic, &env_g, opts).unwrap(),
            1e-12,
        );
        assert_close(
            &rdm2x2_nnn(&state, &env, opts).unwrap(),
            &rdm::rdm2x2_nnn_11(c, &generic, &env_g, opts).unwrap(),
            1e-12,
        );
        assert_close(
            &aux_rdm1x1(&state, &env, opts).unwrap(),
            &rdm::aux_rdm1x1(c, &generic, &env_g, opts).unwrap(),
            1e-12,
        );
    }

    #[test]
    fn single_layer_variants_agree() {
        let (state, env) = converged_env(3);
        let psd = RdmOpts { sym_pos_def: true, ..RdmOpts::default() };
        for opts in [RdmOpts::default(), psd] {
            let r1 = rdm1x1(&state, &env, opts).unwrap();
            assert_close(&r1, &rdm1x1_sl(&state, &env, opts).unwrap(), 1e-12);
            assert_density_matrix(&r1);
            let r2 = rdm2x1(&state, &env, opts).unwrap();
            assert_close(&r2, &rdm2x1_sl(&state, &env, opts).unwrap(), 1e-10);
            assert_density_matrix(&r2);
        }
    }

    #[test]
    fn plaquette_marginals() {
        let (state, env) = converged_env(17);
        let opts = RdmOpts::default();
        let r4 = rdm2x2(&state, &env, opts).unwrap();
        assert_eq!(r4.shape(), &[2; 8]);
        assert_density_matrix(&r4);
        let nn = rdm2x2_nn(&state, &env, opts).unwrap();
        let nnn = rdm2x2_nnn(&state, &env, opts).unwrap();
        assert_density_matrix(&nn);
        assert_density_matrix(&nnn);
        let marginal = |keep_nn: bool| -> nd::ArrayD<f64> {
            nd::ArrayD::from_shape_fn(vec![2, 2, 2, 2], |i| {
                let mut acc = 0.0;
                for p in 0..2 {
                    for q in 0..2 {
                        let idx
                            = if keep_nn {
                                [i[0], i[1], p, q, i[2], i[3], p, q]
                            } else {
                                [i[0], p, q, i[1], i[2], p, q, i[3]]
                            };
                        acc += r4[nd::IxDyn(&idx)];
                    }
                }
                acc
            })
        };
        assert_close(&nn, &marginal(true), 1e-12);
        assert_close(&nnn, &marginal(false), 1e-12);
        let aux = aux_rdm1x1(&state, &env, opts).unwrap();
        assert_eq!(aux.shape(), &[2; 8]);
        assert_density_matrix(&aux);
    }
}
