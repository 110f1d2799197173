//! CTMRG for a single-site iPEPS with C<sub>4v</sub> symmetry.
//!
//! With all four corners equal, one move per sweep suffices. The upper-left
//! enlarged corner `LU` is symmetric under the reflection across the diagonal,
//! so instead of an SVD of a plaquette it is diagonalized directly:
//!
//! ```text
//!   LU = U Λ U†,   P = U[:, kept],   C' = Λ[kept]
//!
//!   T' = P† · (T a) · P        0 -- P† --+-- T -- a --+-- P -- 1
//! ```
//!
//! where the kept eigenpairs are the χ of largest `|λ|` (never splitting a
//! multiplet if requested). `T'` is then symmetrized over its two χ legs and
//! both tensors are normalized by their largest element.

use std::time::Instant;
use ndarray as nd;
use ndarray_linalg::{ Eigh, UPLO };
use num_traits::Float;
use crate::{
    Elem,
    config::CtmArgs,
    conv::ConvCheck,
    corners::{ c2x2_lu, c2x2_lu_sl },
    ctmrg::{ CtmOutcome, CtmResult, Timings, truncation_rank },
    env_c4v::EnvC4v,
    state::IPEPSC4v,
    tn::{ self, TnError, contract, double_layer, fuse },
};

fn as_matrix<A: Elem>(a: nd::ArrayD<A>) -> CtmResult<nd::Array2<A>> {
    Ok(a.into_dimensionality::<nd::Ix2>().map_err(TnError::from)?)
}

// the edge tensor grown by one site, legs [(χ, D²), (χ, D²), D²]
fn absorb_edge<A>(t: &nd::ArrayD<A>, a: &nd::ArrayD<A>, force_dl: bool)
    -> CtmResult<nd::ArrayD<A>>
where A: Elem
{
    if force_dl {
        let x = contract("abc,dcef->adbef", t, &double_layer(a)?)?;
        return Ok(fuse(&x, &[2, 2, 1])?);
    }
    let dl = a.shape()[2];
    let sh = t.shape().to_vec();
    let t = tn::reshape(t, &[sh[0], sh[1], dl, dl])?;
    let x = contract("abcC,sdcef->adbefCs", &t, a)?;
    let x = contract("adbefCs,sDCEF->adDbeEfF", &x, &tn::conj(a))?;
    Ok(fuse(&x, &[3, 3, 2])?)
}

/// Apply one C4v move, returning the updated environment.
pub fn step<A>(state: &IPEPSC4v<A>, env: &EnvC4v<A>, args: &CtmArgs)
    -> CtmResult<EnvC4v<A>>
where A: Elem
{
    let chi = env.chi();
    let a = state.site_tensor();
    let unfolded = env.unfold()?;
    let se = unfolded.site_env();
    let lu
        = if args.ctm_force_dl {
            c2x2_lu(&se, &double_layer(a)?)?
        } else {
            c2x2_lu_sl(&se, a, false)?
        };
    let lu = tn::normalize_max(tn::hermitian_part(&as_matrix(lu)?));
    let n = lu.nrows();
    let (evals, evecs) = lu.eigh(UPLO::Upper)?;

    let mut order: Vec<usize> = (0..evals.len()).collect();
    order.sort_by(|&i, &j| {
        Float::abs(evals[j]).partial_cmp(&Float::abs(evals[i]))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let s_abs: Vec<A::Real> = order.iter().map(|k| Float::abs(evals[*k])).collect();
    let k = truncation_rank(
        &s_abs,
        chi,
        args.projector_svd_reltol,
        args.keep_multiplets,
        args.projector_eps_multiplet,
    );
    if args.verbosity.projectors > 0 {
        log::trace!("C4v projector: keeping {k} of {n} eigenvectors");
    }

    let mut p: nd::Array2<A> = nd::Array2::zeros((n, chi));
    let mut c: nd::Array2<A> = nd::Array2::zeros((chi, chi));
    for (j, idx) in order.iter().take(k).enumerate() {
        p.column_mut(j).assign(&evecs.column(*idx));
        c[[j, j]] = A::from_real(evals[*idx]);
    }

    let x = absorb_edge(env.t(), a, args.ctm_force_dl)?;
    let p_dyn = p.into_dyn();
    let x = contract("ak,abf->kbf", &tn::conj(&p_dyn), &x)?;
    let t = contract("kbf,bl->klf", &x, &p_dyn)?;
    let half = A::from_real(A::real(0.5));
    let t = (&t + &tn::permute(&t, &[1, 0, 2])?).mapv_into(|x| x * half);

    let mut new = env.clone();
    new.set_c(tn::normalize_max(c).into_dyn());
    new.set_t(tn::normalize_max(t));
    Ok(new)
}

/// Run C4v CTMRG moves until `conv_check` reports convergence or
/// `ctm_max_iter` moves have been performed.
///
/// See [`ctmrg::run`][crate::ctmrg::run] for the protocol followed by the
/// convergence check.
pub fn run<A, C, H>(state: &IPEPSC4v<A>, env: EnvC4v<A>, mut conv_check: C, args: &CtmArgs)
    -> CtmResult<CtmOutcome<EnvC4v<A>, H>>
where
    A: Elem,
    C: ConvCheck<IPEPSC4v<A>, EnvC4v<A>, H>,
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
        "C4v CTMRG start: chi = {}, max iterations = {}, double layer = {}",
        args.chi,
        args.ctm_max_iter,
        args.ctm_force_dl,
    );
    for i in 0..args.ctm_max_iter {
        let t0 = Instant::now();
        env = step(state, &env, args)?;
        let t1 = Instant::now();
        let (done, h) = conv_check.check(state, &env, history.take(), args)?;
        let t2 = Instant::now();
        converged = done && conv_check.converged(&h);
        history = Some(h);
        timings.t_ctm += t1 - t0;
        timings.t_conv_check += t2 - t1;
        sweeps = i + 1;
        log::debug!(
            "C4v CTMRG step {i}: t_step = {:?}, t_conv = {:?}",
            t1 - t0,
            t2 - t1,
        );
        if args.verbosity.ctm_convergence > 0 {
            log::debug!("spectrum of C: {}", env.corner_spectrum()?);
        }
        if done { break; }
    }
    log::info!(
        "C4v CTMRG done after {sweeps} steps (converged: {converged}); t_ctm = {:?}, t_conv_check = {:?}",
        timings.t_ctm,
        timings.t_conv_check,
    );
    Ok(CtmOutcome { env, history, converged, sweeps, timings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{
        config::EnvInit,
        conv::{ CornerSpectrumConv, EnergyConv },
        ctmrg,
        env::{ Env, init_env },
        env_c4v::init_env_c4v,
        lattice::Coord,
        ops,
        rdm::{ self, RdmOpts },
        rdm_c4v,
    };

    fn zz<A: Elem>() -> nd::Array2<A> {
        ops::kron(&ops::make_sz::<A>(), &ops::make_sz::<A>())
    }

    // Ising-weighted site with the down state suppressed by a field `h`
    fn magnetized_site(beta: f64, h: f64) -> nd::ArrayD<f64> {
        let mut a: nd::ArrayD<f64> = ops::ising_site(beta);
        let g = (-h).exp();
        a.indexed_iter_mut()
            .filter(|(idx, _)| idx[0] == 1)
            .for_each(|(_, v)| { *v *= g; });
        a
    }

    #[test]
    fn step_keeps_shapes_and_symmetry() {
        let mut rng = StdRng::seed_from_u64(10546);
        let state: IPEPSC4v<f64> = IPEPSC4v::random(2, 2, &mut rng).unwrap();
        let args = CtmArgs { chi: 6, ..CtmArgs::default() };
        let mut env: EnvC4v<f64> = EnvC4v::new(args.chi);
        init_env_c4v(&state, &mut env, EnvInit::Ctmrg).unwrap();
        for _ in 0..5 {
            env = step(&state, &env, &args).unwrap();
        }
        assert_eq!(env.c().shape(), &[6, 6]);
        assert_eq!(env.t().shape(), &[6, 6, 4]);
        assert!(!env.has_non_finite());
        let c = env.c();
        assert!(tn::max_abs(&(c - &c.t())) < 1e-14);
        let t = env.t();
        assert!(tn::max_abs(&(t - &tn::permute(t, &[1, 0, 2]).unwrap())) < 1e-14);
        assert!((tn::max_abs(c) - 1.0).abs() < 1e-14);
    }

    #[test]
    fn single_layer_step_matches_double_layer() {
        let mut rng = StdRng::seed_from_u64(7);
        let state: IPEPSC4v<f64> = IPEPSC4v::random(2, 3, &mut rng).unwrap();
        let args_dl = CtmArgs { chi: 9, ..CtmArgs::default() };
        let args_sl = CtmArgs { ctm_force_dl: false, ..args_dl.clone() };
        let mut env: EnvC4v<f64> = EnvC4v::new(args_dl.chi);
        init_env_c4v(&state, &mut env, EnvInit::Ctmrg).unwrap();
        let env_dl = step(&state, &env, &args_dl).unwrap();
        let env_sl = step(&state, &env, &args_sl).unwrap();
        assert!(tn::max_abs(&(env_dl.c() - env_sl.c())) < 1e-8);
        let spec_dl = env_dl.corner_spectrum().unwrap();
        let spec_sl = env_sl.corner_spectrum().unwrap();
        spec_dl.iter().zip(spec_sl.iter())
            .for_each(|(x, y)| assert!((x - y).abs() < 1e-8));
    }

    #[test]
    fn ising_correlation_is_exact() {
        let beta = 0.3;
        let state = ops::ising_state::<f64>(beta).unwrap();
        let exact = ops::onsager_nn_correlation(beta);
        for force_dl in [true, false] {
            let args = CtmArgs {
                chi: 16,
                ctm_max_iter: 500,
                ctm_conv_tol: 1e-10,
                ctm_force_dl: force_dl,
                ..CtmArgs::default()
            };
            let mut env: EnvC4v<f64> = EnvC4v::new(args.chi);
            init_env_c4v(&state, &mut env, EnvInit::Ctmrg).unwrap();
            let out = run(&state, env, CornerSpectrumConv, &args).unwrap();
            assert!(out.converged);
            let rho = rdm_c4v::rdm2x1(&state, &out.env, RdmOpts::default()).unwrap();
            let e = rdm::expectation(&rho, &zz()).unwrap();
            assert!((e - exact).abs() < 1e-6);
            let rho1 = rdm_c4v::rdm1x1(&state, &out.env, RdmOpts::default()).unwrap();
            let m = rdm::expectation(&rho1, &ops::make_sz()).unwrap();
            assert!(m.abs() < 1e-6);
        }
    }

    #[test]
    fn agrees_with_generic_engine() {
        let beta = 0.25;
        let state = ops::ising_state::<f64>(beta).unwrap();
        let args = CtmArgs {
            chi: 12,
            ctm_max_iter: 400,
            ctm_conv_tol: 1e-11,
            ..CtmArgs::default()
        };
        let mut env: EnvC4v<f64> = EnvC4v::new(args.chi);
        init_env_c4v(&state, &mut env, EnvInit::Ctmrg).unwrap();
        let out = run(&state, env, CornerSpectrumConv, &args).unwrap();
        let rho_c4v = rdm_c4v::rdm2x1(&state, &out.env, RdmOpts::default()).unwrap();

        let generic = state.to_ipeps().unwrap();
        let mut env_g: Env<f64> = Env::new(args.chi);
        init_env(&generic, &mut env_g, EnvInit::Ctmrg).unwrap();
        let out_g = ctmrg::run(&generic, env_g, CornerSpectrumConv, &args).unwrap();
        let c0 = Coord::new(0, 0);
        let rho_g = rdm::rdm2x1(c0, &generic, &out_g.env, RdmOpts::default()).unwrap();
        assert!(tn::max_abs(&(&rho_c4v - &rho_g)) < 1e-6);
        assert_eq!(out.history.unwrap().len(), out.sweeps);
    }

    #[test]
    fn tighter_tolerance_does_not_worsen_correlation() {
        let beta = 0.35;
        let state = ops::ising_state::<f64>(beta).unwrap();
        let exact = ops::onsager_nn_correlation(beta);
        let mut errs: Vec<f64> = Vec::new();
        let mut sweeps: Vec<usize> = Vec::new();
        for tol in [1e-4, 1e-6, 1e-8] {
            let args = CtmArgs {
                chi: 16,
                ctm_max_iter: 500,
                ctm_conv_tol: tol,
                ..CtmArgs::default()
            };
            let mut env: EnvC4v<f64> = EnvC4v::new(args.chi);
            init_env_c4v(&state, &mut env, EnvInit::Ctmrg).unwrap();
            let conv = EnergyConv::new(
                |s: &IPEPSC4v<f64>, e: &EnvC4v<f64>| -> CtmResult<f64> {
                    let rho = rdm_c4v::rdm2x1(s, e, RdmOpts::default())?;
                    Ok(rdm::expectation(&rho, &zz())?)
                }
            );
            let out = run(&state, env, conv, &args).unwrap();
            assert!(out.converged);
            let rho = rdm_c4v::rdm2x1(&state, &out.env, RdmOpts::default()).unwrap();
            let e = rdm::expectation(&rho, &zz()).unwrap();
            errs.push((e - exact).abs());
            sweeps.push(out.sweeps);
        }
        assert!(sweeps.windows(2).all(|w| w[0] <= w[1]));
        assert!(errs.windows(2).all(|w| w[1] <= w[0] + 1e-10));
        assert!(errs[2] < 1e-6);
    }

    #[test]
    fn magnetized_state_agrees_with_generic_engine() {
        let state = IPEPSC4v::new(magnetized_site(0.5, 0.05)).unwrap();
        let args = CtmArgs {
            chi: 12,
            ctm_max_iter: 400,
            ctm_conv_tol: 1e-11,
            ..CtmArgs::default()
        };
        let mut env: EnvC4v<f64> = EnvC4v::new(args.chi);
        init_env_c4v(&state, &mut env, EnvInit::Ctmrg).unwrap();
        let out = run(&state, env, CornerSpectrumConv, &args).unwrap();
        assert!(out.converged);
        let r1_c4v = rdm_c4v::rdm1x1(&state, &out.env, RdmOpts::default()).unwrap();
        let r2_c4v = rdm_c4v::rdm2x1(&state, &out.env, RdmOpts::default()).unwrap();

        let generic = state.to_ipeps().unwrap();
        let mut env_g: Env<f64> = Env::new(args.chi);
        init_env(&generic, &mut env_g, EnvInit::Ctmrg).unwrap();
        let out_g = ctmrg::run(&generic, env_g, CornerSpectrumConv, &args).unwrap();
        assert!(out_g.converged);
        let c0 = Coord::new(0, 0);
        let r1_g = rdm::rdm1x1(c0, &generic, &out_g.env, RdmOpts::default()).unwrap();
        let r2_g = rdm::rdm2x1(c0, &generic, &out_g.env, RdmOpts::default()).unwrap();
        assert!(tn::max_abs(&(&r1_c4v - &r1_g)) < 1e-6);
        assert!(tn::max_abs(&(&r2_c4v - &r2_g)) < 1e-6);

        let m = rdm::expectation(&r1_c4v, &ops::make_sz()).unwrap();
        assert!(m > 0.5);
    }
}
