//! Spin-1/2 operators and an exactly solvable reference state.
//!
//! The reference state is the D = 2 iPEPS whose amplitudes are Boltzmann
//! weights of the classical Ising model,
//!
//! ```text
//!   ψ(σ) = exp( (β/2) Σ_<ij> σ_i σ_j )
//! ```
//!
//! so that `⟨ψ|ψ⟩` is the partition function `Z(β)` of the square-lattice Ising
//! model and `⟨ψ|σ^z_i σ^z_j|ψ⟩ / ⟨ψ|ψ⟩` is the classical nearest-neighbor
//! correlation, known in closed form from Onsager's solution.

use std::f64::consts::PI;
use ndarray as nd;
use num_complex::Complex64 as C64;
use once_cell::sync::Lazy;
use crate::{
    Elem,
    state::{ IPEPSC4v, StateResult },
};

/// Make the 2 x 2 identity.
pub fn make_id<A>() -> nd::Array2<A>
where A: Elem
{
    nd::array![
        [A::one(),  A::zero()],
        [A::zero(), A::one() ],
    ]
}

/// Make the Pauli X matrix.
///
/// Since this operator takes no arguments, consider using the
/// lazily-constructed, [`Complex64`][C64]-valued [`SXMAT`] instead.
pub fn make_sx<A>() -> nd::Array2<A>
where A: Elem
{
    nd::array![
        [A::zero(), A::one() ],
        [A::one(),  A::zero()],
    ]
}

/// Lazy-static version of [`make_sx`] for a [`Complex64`][C64] element type.
pub static SXMAT: Lazy<nd::Array2<C64>> = Lazy::new(make_sx);

/// Make `i` times the Pauli Y matrix, which is real.
pub fn make_isy<A>() -> nd::Array2<A>
where A: Elem
{
    nd::array![
        [A::zero(), A::one() ],
        [-A::one(), A::zero()],
    ]
}

/// Make the Pauli Y matrix.
pub fn make_sy() -> nd::Array2<C64> {
    nd::array![
        [C64::new(0.0, 0.0), C64::new(0.0, -1.0)],
        [C64::new(0.0, 1.0), C64::new(0.0, 0.0) ],
    ]
}

/// Lazy-static version of [`make_sy`].
pub static SYMAT: Lazy<nd::Array2<C64>> = Lazy::new(make_sy);

/// Make the Pauli Z matrix.
///
/// Since this operator takes no arguments, consider using the
/// lazily-constructed, [`Complex64`][C64]-valued [`SZMAT`] instead.
pub fn make_sz<A>() -> nd::Array2<A>
where A: Elem
{
    nd::array![
        [A::one(),  A::zero()],
        [A::zero(), -A::one()],
    ]
}

/// Lazy-static version of [`make_sz`] for a [`Complex64`][C64] element type.
pub static SZMAT: Lazy<nd::Array2<C64>> = Lazy::new(make_sz);

/// Make the spin raising operator `S⁺ = (σ^x + i σ^y) / 2`.
pub fn make_sp<A>() -> nd::Array2<A>
where A: Elem
{
    nd::array![
        [A::zero(), A::one() ],
        [A::zero(), A::zero()],
    ]
}

/// Make the spin lowering operator `S⁻ = (σ^x - i σ^y) / 2`.
pub fn make_sm<A>() -> nd::Array2<A>
where A: Elem
{
    nd::array![
        [A::zero(), A::zero()],
        [A::one(),  A::zero()],
    ]
}

/// Kronecker product `a ⊗ b`, with the row (column) index of `a` major.
pub fn kron<A>(a: &nd::Array2<A>, b: &nd::Array2<A>) -> nd::Array2<A>
where A: Elem
{
    let (ra, ca) = a.dim();
    let (rb, cb) = b.dim();
    nd::Array2::from_shape_fn((ra * rb, ca * cb), |(i, j)| {
        a[[i / rb, j / cb]] * b[[i % rb, j % cb]]
    })
}

/// Two-site spin-1/2 Heisenberg interaction `S_0 · S_1`, as a 4 x 4 matrix.
pub fn make_heisenberg_bond<A>() -> nd::Array2<A>
where A: Elem
{
    let quarter = A::from_real(A::real(0.25));
    let half = A::from_real(A::real(0.5));
    let zz = kron(&make_sz::<A>(), &make_sz::<A>()).mapv(|x| x * quarter);
    let pm = kron(&make_sp::<A>(), &make_sm::<A>());
    let mp = kron(&make_sm::<A>(), &make_sp::<A>());
    zz + (pm + mp).mapv(|x| x * half)
}

/// On-site tensor `A[s, u, l, d, r] = W[s, u] W[s, l] W[s, d] W[s, r]` of the
/// Ising-weighted state at inverse temperature `beta`, where
/// `Σ_k W[σ, k] W[σ', k] = exp((β/2) σ σ')`.
pub fn ising_site<A>(beta: f64) -> nd::ArrayD<A>
where A: Elem
{
    let b = beta / 2.0;
    let (c, s) = (b.cosh().sqrt(), b.sinh().sqrt());
    let w: nd::Array2<f64> = nd::array![[c, s], [c, -s]];
    nd::ArrayD::from_shape_fn(vec![2, 2, 2, 2, 2], |idx| {
        let v = w[[idx[0], idx[1]]]
            * w[[idx[0], idx[2]]]
            * w[[idx[0], idx[3]]]
            * w[[idx[0], idx[4]]];
        A::from_real(A::real(v))
    })
}

/// The Ising-weighted state as a single-site C4v-symmetric iPEPS.
pub fn ising_state<A>(beta: f64) -> StateResult<IPEPSC4v<A>>
where A: Elem
{
    IPEPSC4v::new(ising_site(beta))
}

/// [`ising_site`] with the physical leg rotated to the eigenbasis of σ^x.
///
/// In this basis the tensor is Z_2-graded: an element is nonzero only if the
/// physical index and the four auxiliary indices sum to an even number, so
/// `⟨σ^z σ^z⟩` of the original state becomes `⟨σ^x σ^x⟩`.
pub fn ising_site_x<A>(beta: f64) -> nd::ArrayD<A>
where A: Elem
{
    let a: nd::ArrayD<f64> = ising_site(beta);
    let h = std::f64::consts::FRAC_1_SQRT_2;
    nd::ArrayD::from_shape_fn(vec![2, 2, 2, 2, 2], |idx| {
        let mut k: Vec<usize> = (0..5).map(|j| idx[j]).collect();
        k[0] = 0;
        let up = a[k.as_slice()];
        k[0] = 1;
        let down = a[k.as_slice()];
        let v = if idx[0] == 0 { h * (up + down) } else { h * (up - down) };
        A::from_real(A::real(v))
    })
}

// arithmetic-geometric mean
fn agm(mut a: f64, mut b: f64) -> f64 {
    while (a - b).abs() > 1e-15 * a.abs() {
        (a, b) = ((a + b) / 2.0, (a * b).sqrt());
    }
    a
}

/// Complete elliptic integral of the first kind for modulus `k`.
///
/// Returns `∞` for `|k| >= 1`, where the integral diverges.
pub fn elliptic_k(k: f64) -> f64 {
    let kp2 = 1.0 - k * k;
    if k.abs() >= 1.0 || kp2 <= 0.0 { return f64::INFINITY; }
    PI / (2.0 * agm(1.0, kp2.sqrt()))
}

/// Exact nearest-neighbor correlation `⟨σ_i σ_j⟩` of the classical
/// square-lattice Ising model with unit coupling at inverse temperature
/// `beta`.
pub fn onsager_nn_correlation(beta: f64) -> f64 {
    let b2 = 2.0 * beta;
    let k = 2.0 * b2.sinh() / b2.cosh().powi(2);
    let t2 = b2.tanh().powi(2);
    // at the critical point the prefactor vanishes faster than K diverges
    let kk = elliptic_k(k);
    let singular = if kk.is_infinite() { 0.0 } else { (2.0 * t2 - 1.0) * kk };
    0.5 / b2.tanh() * (1.0 + 2.0 / PI * singular)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::is_c4v_symmetric;

    #[test]
    fn spin_algebra() {
        let sx: nd::Array2<f64> = make_sx();
        let isy: nd::Array2<f64> = make_isy();
        let sz: nd::Array2<f64> = make_sz();
        // σ^x σ^z = -i σ^y
        assert_eq!(sx.dot(&sz), -isy.clone());
        assert_eq!(make_sp::<f64>() + make_sm::<f64>(), sx);
        assert_eq!(SXMAT.dot(&*SYMAT), SZMAT.mapv(|x| x * C64::i()));
        let h: nd::Array2<f64> = make_heisenberg_bond();
        // singlet energy -3/4 and triplet energy 1/4
        let singlet = nd::array![0.0, 1.0, -1.0, 0.0] / 2.0_f64.sqrt();
        let e = singlet.dot(&h.dot(&singlet));
        assert!((e + 0.75).abs() < 1e-14);
        assert!((h[[0, 0]] - 0.25).abs() < 1e-14);
    }

    #[test]
    fn ising_weights() {
        let beta = 0.3;
        let a: nd::ArrayD<f64> = ising_site(beta);
        assert!(is_c4v_symmetric(&a, 1e-14).unwrap());
        // a single bond between two sites carries exp(β/2 σ σ')
        let b = beta / 2.0;
        let w: nd::Array2<f64>
            = nd::array![[b.cosh().sqrt(), b.sinh().sqrt()], [b.cosh().sqrt(), -b.sinh().sqrt()]];
        let bond = w.dot(&w.t());
        assert!((bond[[0, 0]] - b.exp()).abs() < 1e-14);
        assert!((bond[[0, 1]] - (-b).exp()).abs() < 1e-14);
    }

    #[test]
    fn rotated_ising_site_is_graded() {
        let a: nd::ArrayD<f64> = ising_site_x(0.4);
        for (idx, v) in a.indexed_iter() {
            let parity = (0..5).map(|k| idx[k]).sum::<usize>() % 2;
            if parity == 1 { assert!(v.abs() < 1e-14); }
        }
        assert!(is_c4v_symmetric(&a, 1e-14).unwrap());
        let dl = crate::tn::double_layer(&a).unwrap();
        let dl0 = crate::tn::double_layer(&ising_site::<f64>(0.4)).unwrap();
        assert!(crate::tn::max_abs(&(dl - dl0)) < 1e-13);
    }

    #[test]
    fn onsager_limits() {
        assert!((elliptic_k(0.0) - PI / 2.0).abs() < 1e-14);
        // high-temperature expansion ⟨σσ⟩ ≈ tanh β + O(β³)
        let beta = 1e-3;
        assert!((onsager_nn_correlation(beta) - beta.tanh()).abs() < 1e-6);
        // deep in the ordered phase the correlation saturates
        assert!((onsager_nn_correlation(2.0) - 1.0).abs() < 1e-3);
        let c = onsager_nn_correlation(0.3);
        assert!(c > 0.3_f64.tanh() && c < 1.0);
    }

    #[test]
    fn onsager_at_critical_point() {
        assert!(elliptic_k(1.0).is_infinite());
        assert!(elliptic_k(-1.5).is_infinite());
        let beta_c = 0.5 * (1.0 + 2.0_f64.sqrt()).ln();
        let exact = std::f64::consts::FRAC_1_SQRT_2;
        let c = onsager_nn_correlation(beta_c);
        assert!(c.is_finite());
        assert!((c - exact).abs() < 1e-6);
        for beta in [beta_c - 1e-9, beta_c + 1e-9] {
            assert!((onsager_nn_correlation(beta) - exact).abs() < 1e-6);
        }
    }
}
