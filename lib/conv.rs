//! Convergence checks for [`ctmrg::run`][crate::ctmrg::run].
//!
//! A check is called once after every sweep with the current environment and
//! the history it returned the previous time, and reports whether the sweeps
//! can stop. Any closure
//!
//! ```text
//!   FnMut(&S, &E, Option<H>, &CtmArgs) -> CtmResult<(bool, H)>
//! ```
//!
//! is a check when passed by mutable reference. The provided ones all record a
//! distance between consecutive sweeps in a [`ConvHistory`] and report `true`
//! once it falls below `ctm_conv_tol`, or once the history holds
//! `ctm_max_iter` entries.

use ndarray as nd;
use num_traits::ToPrimitive;
use crate::{
    Elem,
    config::CtmArgs,
    ctmrg::CtmResult,
    env::Env,
    env_c4v::EnvC4v,
    tn,
};

/// A convergence criterion over states `S`, environments `E` and histories
/// `H`.
pub trait ConvCheck<S, E, H> {
    /// Inspect the environment after a sweep and return `(done, history)`.
    fn check(&mut self, state: &S, env: &E, history: Option<H>, args: &CtmArgs)
        -> CtmResult<(bool, H)>;

    /// Return `false` if a `done` signal accompanied by `history` was due to
    /// the sweep ceiling rather than to convergence.
    fn converged(&self, _history: &H) -> bool { true }
}

impl<'a, S, E, H, F> ConvCheck<S, E, H> for &'a mut F
where F: FnMut(&S, &E, Option<H>, &CtmArgs) -> CtmResult<(bool, H)>
{
    fn check(&mut self, state: &S, env: &E, history: Option<H>, args: &CtmArgs)
        -> CtmResult<(bool, H)>
    {
        (*self)(state, env, history, args)
    }
}

/// Record of a convergence check.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvHistory<T> {
    /// Monitored value after every evaluated sweep.
    pub values: Vec<T>,
    /// Distance between consecutive values; the first entry is always
    /// infinite.
    pub dists: Vec<f64>,
    /// Number of sweeps seen, including those skipped.
    pub sweeps: usize,
    converged: bool,
}

impl<T> Default for ConvHistory<T> {
    fn default() -> Self {
        Self { values: Vec::new(), dists: Vec::new(), sweeps: 0, converged: false }
    }
}

impl<T> ConvHistory<T> {
    /// Return `true` if the last distance fell below the tolerance, as opposed
    /// to the check stopping on the sweep ceiling.
    pub fn converged(&self) -> bool { self.converged }

    /// Number of recorded values.
    pub fn len(&self) -> usize { self.values.len() }

    pub fn is_empty(&self) -> bool { self.values.is_empty() }

    /// Most recent value.
    pub fn last(&self) -> Option<&T> { self.values.last() }

    /// Most recent distance, if at least two values have been recorded.
    pub fn last_dist(&self) -> Option<f64> {
        (self.dists.len() >= 2).then(|| self.dists[self.dists.len() - 1])
    }

    // append a value with its distance to the previous one and decide
    fn record(&mut self, value: T, dist: f64, args: &CtmArgs, name: &str) -> bool {
        self.values.push(value);
        self.dists.push(dist);
        self.converged = self.values.len() >= 2 && dist < args.ctm_conv_tol;
        if args.verbosity.ctm_convergence > 0 {
            log::debug!("{name}: sweep {}, dist = {dist:e}", self.sweeps);
        }
        self.converged || self.values.len() >= args.ctm_max_iter
    }
}

/// Absolute change of a scalar functional (e.g. the energy per site) between
/// consecutive sweeps.
pub struct EnergyConv<F> {
    f: F,
}

impl<F> EnergyConv<F> {
    pub fn new(f: F) -> Self { Self { f } }
}

impl<S, E, F> ConvCheck<S, E, ConvHistory<f64>> for EnergyConv<F>
where F: FnMut(&S, &E) -> CtmResult<f64>
{
    fn check(
        &mut self,
        state: &S,
        env: &E,
        history: Option<ConvHistory<f64>>,
        args: &CtmArgs,
    ) -> CtmResult<(bool, ConvHistory<f64>)>
    {
        let mut history = history.unwrap_or_default();
        history.sweeps += 1;
        let e = (self.f)(state, env)?;
        let dist = history.last().map(|e0| (e - e0).abs()).unwrap_or(f64::INFINITY);
        let done = history.record(e, dist, args, "energy");
        Ok((done, history))
    }

    fn converged(&self, history: &ConvHistory<f64>) -> bool { history.converged() }
}

/// Like [`EnergyConv`], but the functional is not evaluated during the first
/// `skip` sweeps.
pub struct PartialEnergyConv<F> {
    f: F,
    skip: usize,
}

impl<F> PartialEnergyConv<F> {
    pub fn new(f: F, skip: usize) -> Self { Self { f, skip } }
}

impl<S, E, F> ConvCheck<S, E, ConvHistory<f64>> for PartialEnergyConv<F>
where F: FnMut(&S, &E) -> CtmResult<f64>
{
    fn check(
        &mut self,
        state: &S,
        env: &E,
        history: Option<ConvHistory<f64>>,
        args: &CtmArgs,
    ) -> CtmResult<(bool, ConvHistory<f64>)>
    {
        let mut history = history.unwrap_or_default();
        history.sweeps += 1;
        if history.sweeps <= self.skip {
            return Ok((history.sweeps >= args.ctm_max_iter, history));
        }
        let e = (self.f)(state, env)?;
        let dist = history.last().map(|e0| (e - e0).abs()).unwrap_or(f64::INFINITY);
        let done = history.record(e, dist, args, "partial energy");
        Ok((done || history.sweeps >= args.ctm_max_iter, history))
    }

    fn converged(&self, history: &ConvHistory<f64>) -> bool { history.converged() }
}

/// Environments exposing the normalized singular value spectra of their
/// corners.
pub trait CornerSpectra {
    /// All corner spectra, concatenated in a fixed order.
    fn corner_spectra_flat(&self) -> CtmResult<Vec<f64>>;
}

impl<A> CornerSpectra for Env<A>
where A: Elem
{
    fn corner_spectra_flat(&self) -> CtmResult<Vec<f64>> {
        Ok(
            self.corner_spectra()?
                .into_iter()
                .flat_map(|(_, s)| s.to_vec())
                .map(|x| x.to_f64().unwrap_or(f64::NAN))
                .collect()
        )
    }
}

impl<A> CornerSpectra for EnvC4v<A>
where A: Elem
{
    fn corner_spectra_flat(&self) -> CtmResult<Vec<f64>> {
        Ok(
            self.corner_spectrum()?
                .iter()
                .map(|x| x.to_f64().unwrap_or(f64::NAN))
                .collect()
        )
    }
}

/// Frobenius distance between the concatenated, normalized singular value
/// spectra of all corners in consecutive sweeps.
#[derive(Copy, Clone, Debug, Default)]
pub struct CornerSpectrumConv;

impl<S, E> ConvCheck<S, E, ConvHistory<Vec<f64>>> for CornerSpectrumConv
where E: CornerSpectra
{
    fn check(
        &mut self,
        _state: &S,
        env: &E,
        history: Option<ConvHistory<Vec<f64>>>,
        args: &CtmArgs,
    ) -> CtmResult<(bool, ConvHistory<Vec<f64>>)>
    {
        let mut history = history.unwrap_or_default();
        history.sweeps += 1;
        let spec = env.corner_spectra_flat()?;
        let mut dist = f64::INFINITY;
        if let Some(prev) = history.last() {
            if prev.len() == spec.len() {
                dist = prev.iter().zip(&spec)
                    .map(|(a, b)| (a - b).powi(2))
                    .sum::<f64>()
                    .sqrt();
            }
        }
        let done = history.record(spec, dist, args, "corner spectra");
        Ok((done, history))
    }

    fn converged(&self, history: &ConvHistory<Vec<f64>>) -> bool {
        history.converged()
    }
}

/// Frobenius distance between reduced density matrices produced by a
/// caller-supplied functional in consecutive sweeps.
pub struct RdmConv<F> {
    f: F,
}

impl<F> RdmConv<F> {
    pub fn new(f: F) -> Self { Self { f } }
}

impl<S, E, A, F> ConvCheck<S, E, ConvHistory<nd::ArrayD<A>>> for RdmConv<F>
where
    A: Elem,
    F: FnMut(&S, &E) -> CtmResult<nd::ArrayD<A>>,
{
    fn check(
        &mut self,
        state: &S,
        env: &E,
        history: Option<ConvHistory<nd::ArrayD<A>>>,
        args: &CtmArgs,
    ) -> CtmResult<(bool, ConvHistory<nd::ArrayD<A>>)>
    {
        let mut history = history.unwrap_or_default();
        history.sweeps += 1;
        let rdm = (self.f)(state, env)?;
        let dist
            = history.last()
            .filter(|prev| prev.shape() == rdm.shape())
            .map(|prev| tn::norm_fro(&(&rdm - prev)).to_f64().unwrap_or(f64::NAN))
            .unwrap_or(f64::INFINITY);
        let done = history.record(rdm, dist, args, "rdm");
        Ok((done, history))
    }

    fn converged(&self, history: &ConvHistory<nd::ArrayD<A>>) -> bool {
        history.converged()
    }
}
