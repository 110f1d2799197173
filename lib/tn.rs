//! Thin contraction layer over dense `ndarray` arrays, and the [`Backend`]
//! trait shared with the block-sparse tensors of [`crate::block`].
//!
//! Contractions are written with subscript strings in the usual `einsum` form
//! restricted to two operands, e.g.
//!
//! ```text
//! contract("ab,bcd->acd", &c, &t)
//! ```
//!
//! where every label appears either in exactly one operand and the output (a
//! free index), or in both operands and not in the output (a summed index).
//! Internally, operands are permuted so that summed indices are contiguous,
//! flattened to matrices, and multiplied with BLAS.
//!
//! This module also builds the doubled ("double-layer") on-site tensors
//!
//! ```text
//!   a[(u u'), (l l'), (d d'), (r r')] = Σ_s A[s, u, l, d, r] A*[s, u', l', d', r']
//! ```
//!
//! in which every auxiliary ket leg is fused with the matching bra leg, ket
//! index major.

use std::fmt;
use itertools::Itertools;
use ndarray as nd;
use ndarray_linalg::{ error::LinalgError, types::Scalar };
use num_traits::{ Float, Zero };
use thiserror::Error;
use crate::{ Elem, block::BlockError };

#[derive(Debug, Error)]
pub enum TnError {
    /// Returned when a subscript string cannot be parsed or describes an
    /// unsupported contraction (batch indices, implicit traces, repeated
    /// labels).
    #[error("error in contraction: malformed subscripts '{0}'")]
    BadSubscripts(String),

    /// Returned when the number of labels for an operand differs from its rank.
    #[error("error in contraction: {labels} labels given for an operand of rank {rank}")]
    LabelCount { labels: usize, rank: usize },

    /// Returned when contracted axes have different dimensions.
    #[error("error in contraction: dimension mismatch {left} != {right} on contracted axis")]
    DimMismatch { left: usize, right: usize },

    /// Returned when lists of axes are inconsistent with the operands.
    #[error("error in tensor operation: invalid axes {0:?}")]
    BadAxes(Vec<usize>),

    /// Returned when a tensor does not have the rank an operation expects.
    #[error("error in tensor operation: expected rank {expected}, got shape {shape:?}")]
    RankMismatch { expected: usize, shape: Vec<usize> },

    /// Returned when a tensor does not have the shape an operation expects.
    #[error("error in tensor operation: incompatible shape {0:?}")]
    IncompatibleShape(Vec<usize>),

    /// Wraps reshaping failures from `ndarray`.
    #[error("shape error: {0}")]
    Shape(#[from] nd::ShapeError),

    /// Wraps failures of SVD/eigendecompositions.
    #[error("linear algebra failure: {0}")]
    LinAlg(#[from] LinalgError),

    /// Wraps failures of block-sparse tensor operations.
    #[error("block tensor error: {0}")]
    Block(#[from] BlockError),
}
use TnError::*;
pub type TnResult<T> = Result<T, TnError>;

/// Operations needed to build environments, implemented by dense arrays and by
/// block-sparse abelian tensors.
pub trait Backend: Clone + fmt::Debug + Sized {
    type Elem: Elem;

    /// Number of legs.
    fn rank(&self) -> usize;

    /// Contract `axes_self` of `self` with `axes_other` of `other`. The result
    /// carries the remaining legs of `self` followed by those of `other`.
    fn tensordot(&self, other: &Self, axes_self: &[usize], axes_other: &[usize])
        -> TnResult<Self>;

    /// Complex conjugate (with reversed leg signatures, where applicable).
    fn conj(&self) -> Self;

    /// Reorder legs so that leg `k` of the result is leg `axes[k]` of `self`.
    fn permute(&self, axes: &[usize]) -> TnResult<Self>;

    /// Fuse consecutive groups of legs with the given sizes into single legs.
    fn fuse(&self, groups: &[usize]) -> TnResult<Self>;

    /// Largest absolute value over all elements.
    fn max_abs(&self) -> <Self::Elem as Scalar>::Real;

    /// Multiply every element by `x`.
    fn scale(&self, x: Self::Elem) -> Self;

    /// Convert to a dense array.
    fn to_dense(&self) -> TnResult<nd::ArrayD<Self::Elem>>;

    /// Divide by [`Self::max_abs`], leaving all-zero tensors untouched.
    fn normalize_max(&self) -> Self {
        let m = self.max_abs();
        if m > <Self::Elem as Scalar>::Real::zero() {
            self.scale(Self::Elem::from_real(Float::recip(m)))
        } else {
            self.clone()
        }
    }
}

impl<A: Elem> Backend for nd::ArrayD<A> {
    type Elem = A;

    fn rank(&self) -> usize { self.ndim() }

    fn tensordot(&self, other: &Self, axes_self: &[usize], axes_other: &[usize])
        -> TnResult<Self>
    {
        tensordot(self, other, axes_self, axes_other)
    }

    fn conj(&self) -> Self { conj(self) }

    fn permute(&self, axes: &[usize]) -> TnResult<Self> { permute(self, axes) }

    fn fuse(&self, groups: &[usize]) -> TnResult<Self> { fuse(self, groups) }

    fn max_abs(&self) -> A::Real { max_abs(self) }

    fn scale(&self, x: A) -> Self { self.mapv(|v| v * x) }

    fn to_dense(&self) -> TnResult<nd::ArrayD<A>> { Ok(self.clone()) }
}

fn check_axes(rank: usize, axes: &[usize]) -> TnResult<()> {
    (axes.iter().all(|k| *k < rank) && axes.iter().all_unique())
        .then_some(())
        .ok_or_else(|| BadAxes(axes.to_vec()))
}

/// Contract the listed axes of two dense arrays.
///
/// The result carries the free axes of `a` (in order) followed by those of
/// `b`.
pub fn tensordot<A>(
    a: &nd::ArrayD<A>,
    b: &nd::ArrayD<A>,
    axes_a: &[usize],
    axes_b: &[usize],
) -> TnResult<nd::ArrayD<A>>
where A: Elem
{
    if axes_a.len() != axes_b.len() {
        return Err(BadAxes(axes_a.iter().chain(axes_b).copied().collect()));
    }
    check_axes(a.ndim(), axes_a)?;
    check_axes(b.ndim(), axes_b)?;
    for (ka, kb) in axes_a.iter().zip(axes_b) {
        if a.shape()[*ka] != b.shape()[*kb] {
            return Err(DimMismatch { left: a.shape()[*ka], right: b.shape()[*kb] });
        }
    }
    let free_a: Vec<usize>
        = (0..a.ndim()).filter(|k| !axes_a.contains(k)).collect();
    let free_b: Vec<usize>
        = (0..b.ndim()).filter(|k| !axes_b.contains(k)).collect();
    let m: usize = free_a.iter().map(|k| a.shape()[*k]).product();
    let n: usize = free_b.iter().map(|k| b.shape()[*k]).product();
    let k: usize = axes_a.iter().map(|k| a.shape()[*k]).product();
    let perm_a: Vec<usize> = free_a.iter().chain(axes_a).copied().collect();
    let perm_b: Vec<usize> = axes_b.iter().chain(free_b.iter()).copied().collect();
    let amat: nd::Array2<A>
        = a.view().permuted_axes(perm_a)
        .as_standard_layout()
        .into_owned()
        .into_shape((m, k))?;
    let bmat: nd::Array2<A>
        = b.view().permuted_axes(perm_b)
        .as_standard_layout()
        .into_owned()
        .into_shape((k, n))?;
    let shape: Vec<usize>
        = free_a.iter().map(|k| a.shape()[*k])
        .chain(free_b.iter().map(|k| b.shape()[*k]))
        .collect();
    Ok(amat.dot(&bmat).into_shape(shape)?)
}

/// Contract two dense arrays according to a subscript string such as
/// `"abc,cd->dab"`.
pub fn contract<A>(subscripts: &str, a: &nd::ArrayD<A>, b: &nd::ArrayD<A>)
    -> TnResult<nd::ArrayD<A>>
where A: Elem
{
    let bad = || BadSubscripts(subscripts.to_string());
    let (inputs, output) = subscripts.split_once("->").ok_or_else(bad)?;
    let (la, lb) = inputs.split_once(',').ok_or_else(bad)?;
    let la: Vec<char> = la.trim().chars().collect();
    let lb: Vec<char> = lb.trim().chars().collect();
    let lo: Vec<char> = output.trim().chars().collect();
    if la.len() != a.ndim() {
        return Err(LabelCount { labels: la.len(), rank: a.ndim() });
    }
    if lb.len() != b.ndim() {
        return Err(LabelCount { labels: lb.len(), rank: b.ndim() });
    }
    if !la.iter().all_unique() || !lb.iter().all_unique()
        || !lo.iter().all_unique()
    {
        return Err(bad());
    }
    for l in la.iter().chain(lb.iter()) {
        let in_a = la.contains(l);
        let in_b = lb.contains(l);
        let in_o = lo.contains(l);
        if (in_a && in_b && in_o) || (in_a != in_b && !in_o) {
            return Err(bad());
        }
    }
    if lo.iter().any(|l| !la.contains(l) && !lb.contains(l)) {
        return Err(bad());
    }
    let (axes_a, axes_b): (Vec<usize>, Vec<usize>)
        = la.iter().enumerate()
        .filter_map(|(ka, l)| {
            lb.iter().position(|m| m == l).map(|kb| (ka, kb))
        })
        .unzip();
    let res = tensordot(a, b, &axes_a, &axes_b)?;
    let res_labels: Vec<char>
        = la.iter().filter(|l| !lb.contains(l))
        .chain(lb.iter().filter(|l| !la.contains(l)))
        .copied()
        .collect();
    let perm: Vec<usize>
        = lo.iter()
        .map(|l| res_labels.iter().position(|m| m == l).ok_or_else(bad))
        .collect::<TnResult<_>>()?;
    permute(&res, &perm)
}

/// Reorder axes, returning an array in standard layout.
pub fn permute<A>(a: &nd::ArrayD<A>, axes: &[usize]) -> TnResult<nd::ArrayD<A>>
where A: Clone
{
    if axes.len() != a.ndim() { return Err(BadAxes(axes.to_vec())); }
    check_axes(a.ndim(), axes)?;
    Ok(a.view().permuted_axes(axes).as_standard_layout().into_owned())
}

/// Reshape in row-major order.
pub fn reshape<A>(a: &nd::ArrayD<A>, shape: &[usize]) -> TnResult<nd::ArrayD<A>>
where A: Clone
{
    Ok(a.as_standard_layout().into_owned().into_shape(shape.to_vec())?)
}

/// Fuse consecutive groups of axes with the given sizes.
pub fn fuse<A>(a: &nd::ArrayD<A>, groups: &[usize]) -> TnResult<nd::ArrayD<A>>
where A: Clone
{
    if groups.iter().sum::<usize>() != a.ndim() {
        return Err(BadAxes(groups.to_vec()));
    }
    let mut shape: Vec<usize> = Vec::with_capacity(groups.len());
    let mut k0: usize = 0;
    for g in groups.iter() {
        shape.push(a.shape()[k0..k0 + g].iter().product());
        k0 += g;
    }
    reshape(a, &shape)
}

/// View a tensor as a matrix, grouping its first `nrows` axes into the row
/// index.
pub fn to_matrix<A>(a: &nd::ArrayD<A>, nrows: usize) -> TnResult<nd::Array2<A>>
where A: Clone
{
    if nrows > a.ndim() { return Err(BadAxes(vec![nrows])); }
    let m: usize = a.shape()[..nrows].iter().product();
    let n: usize = a.shape()[nrows..].iter().product();
    Ok(a.as_standard_layout().into_owned().into_shape((m, n))?)
}

/// Elementwise complex conjugate.
pub fn conj<A, D>(a: &nd::Array<A, D>) -> nd::Array<A, D>
where
    A: Elem,
    D: nd::Dimension,
{
    a.mapv(|x| x.conj())
}

/// Conjugate transpose of a matrix.
pub fn dagger<A>(m: &nd::Array2<A>) -> nd::Array2<A>
where A: Elem
{
    m.t().mapv(|x| x.conj())
}

/// Largest absolute value of any element, or zero for empty arrays.
pub fn max_abs<A, D>(a: &nd::Array<A, D>) -> A::Real
where
    A: Elem,
    D: nd::Dimension,
{
    a.iter()
        .map(|x| x.abs())
        .fold(A::Real::zero(), |acc, v| Float::max(acc, v))
}

/// Divide by the largest absolute value, leaving all-zero arrays untouched.
pub fn normalize_max<A, D>(a: nd::Array<A, D>) -> nd::Array<A, D>
where
    A: Elem,
    D: nd::Dimension,
{
    let m = max_abs(&a);
    if m > A::Real::zero() {
        let inv = A::from_real(Float::recip(m));
        a.mapv_into(|x| x * inv)
    } else {
        a
    }
}

/// Frobenius norm.
pub fn norm_fro<A, D>(a: &nd::Array<A, D>) -> A::Real
where
    A: Elem,
    D: nd::Dimension,
{
    Float::sqrt(
        a.iter()
            .map(|x| x.square())
            .fold(A::Real::zero(), |acc, v| acc + v)
    )
}

/// Zero-pad or slice every axis to the given shape.
pub fn pad_to<A>(a: &nd::ArrayD<A>, shape: &[usize]) -> TnResult<nd::ArrayD<A>>
where A: Elem
{
    if shape.len() != a.ndim() {
        return Err(RankMismatch { expected: shape.len(), shape: a.shape().to_vec() });
    }
    if a.shape() == shape { return Ok(a.clone()); }
    let common: Vec<usize>
        = a.shape().iter().zip(shape).map(|(m, n)| *m.min(n)).collect();
    let mut out: nd::ArrayD<A> = nd::ArrayD::zeros(shape.to_vec());
    out.slice_each_axis_mut(|ax| nd::Slice::from(0..common[ax.axis.index()]))
        .assign(&a.slice_each_axis(|ax| nd::Slice::from(0..common[ax.axis.index()])));
    Ok(out)
}

/// Hermitian part `(m + m†) / 2` of a square matrix.
pub fn hermitian_part<A>(m: &nd::Array2<A>) -> nd::Array2<A>
where A: Elem
{
    let half = A::from_real(A::real(0.5));
    (m + &dagger(m)).mapv_into(|x| x * half)
}

fn check_site(a: &nd::ArrayD<impl Clone>) -> TnResult<()> {
    (a.ndim() == 5).then_some(())
        .ok_or_else(|| RankMismatch { expected: 5, shape: a.shape().to_vec() })
}

/// Double-layer tensor with the physical index traced out, legs
/// `[u², l², d², r²]`.
pub fn double_layer<A>(a: &nd::ArrayD<A>) -> TnResult<nd::ArrayD<A>>
where A: Elem
{
    check_site(a)?;
    let sh = a.shape();
    let dl = contract("mefgh,mabcd->eafbgchd", a, &conj(a))?;
    reshape(&dl, &[sh[1] * sh[1], sh[2] * sh[2], sh[3] * sh[3], sh[4] * sh[4]])
}

/// Double-layer tensor with open physical indices, legs
/// `[u², l², d², r², s, s']` with `s` the ket index and `s'` the bra index.
pub fn double_layer_open<A>(a: &nd::ArrayD<A>) -> TnResult<nd::ArrayD<A>>
where A: Elem
{
    check_site(a)?;
    let sh = a.shape();
    let dl = contract("mefgh,nabcd->eafbgchdmn", a, &conj(a))?;
    reshape(
        &dl,
        &[sh[1] * sh[1], sh[2] * sh[2], sh[3] * sh[3], sh[4] * sh[4], sh[0], sh[0]],
    )
}

/// Double-layer tensor with the operator `op` inserted between ket and bra,
/// `Σ_{s s'} op[s', s] A[s] A*[s']`.
pub fn double_layer_op<A>(a: &nd::ArrayD<A>, op: &nd::Array2<A>)
    -> TnResult<nd::ArrayD<A>>
where A: Elem
{
    check_site(a)?;
    let d = a.shape()[0];
    if op.shape() != [d, d] {
        return Err(IncompatibleShape(op.shape().to_vec()));
    }
    let op_a = contract("ts,sefgh->tefgh", &op.clone().into_dyn(), a)?;
    let sh = a.shape();
    let dl = contract("mefgh,mabcd->eafbgchd", &op_a, &conj(a))?;
    reshape(&dl, &[sh[1] * sh[1], sh[2] * sh[2], sh[3] * sh[3], sh[4] * sh[4]])
}

/// Identity matrix of the element type.
pub fn eye<A>(n: usize) -> nd::Array2<A>
where A: Elem
{
    nd::Array2::from_diag_elem(n, A::one())
}

/// Sum of the diagonal of a square matrix.
pub fn trace<A>(m: &nd::Array2<A>) -> A
where A: Elem
{
    m.diag().iter().fold(A::zero(), |acc, x| acc + *x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{ Rng, SeedableRng, rngs::StdRng };

    fn rand_array(shape: &[usize], rng: &mut StdRng) -> nd::ArrayD<f64> {
        nd::ArrayD::from_shape_simple_fn(shape.to_vec(), || rng.gen_range(-1.0..1.0))
    }

    #[test]
    fn contract_matches_matrix_product() {
        let mut rng = StdRng::seed_from_u64(10546);
        let a = rand_array(&[3, 4], &mut rng);
        let b = rand_array(&[4, 5], &mut rng);
        let c = contract("ij,jk->ik", &a, &b).unwrap();
        let expected
            = a.clone().into_dimensionality::<nd::Ix2>().unwrap()
            .dot(&b.clone().into_dimensionality::<nd::Ix2>().unwrap());
        assert_eq!(c.shape(), &[3, 5]);
        c.iter().zip(expected.iter())
            .for_each(|(x, y)| assert!((x - y).abs() < 1e-12));

        let ct = contract("ij,jk->ki", &a, &b).unwrap();
        assert!((ct[[4, 2]] - expected[[2, 4]]).abs() < 1e-12);
    }

    #[test]
    fn contract_multiple_axes() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = rand_array(&[2, 3, 4], &mut rng);
        let b = rand_array(&[4, 2, 5], &mut rng);
        let c = contract("abc,cad->bd", &a, &b).unwrap();
        let mut expected = 0.0;
        for i in 0..2 {
            for k in 0..4 {
                expected += a[[i, 1, k]] * b[[k, i, 3]];
            }
        }
        assert!((c[[1, 3]] - expected).abs() < 1e-12);
    }

    #[test]
    fn contract_outer_product() {
        let a = nd::array![1.0, 2.0].into_dyn();
        let b = nd::array![3.0, 4.0, 5.0].into_dyn();
        let c = contract("i,j->ji", &a, &b).unwrap();
        assert_eq!(c.shape(), &[3, 2]);
        assert_eq!(c[[2, 1]], 10.0);
    }

    #[test]
    fn contract_rejects_bad_subscripts() {
        let a = nd::ArrayD::<f64>::zeros(vec![2, 2]);
        assert!(matches!(contract("ij,jk", &a, &a), Err(BadSubscripts(_))));
        assert!(matches!(contract("ijk,jk->i", &a, &a), Err(LabelCount { .. })));
        assert!(matches!(contract("ij,jk->ijk", &a, &a), Err(BadSubscripts(_))));
        assert!(matches!(contract("ij,kl->i", &a, &a), Err(BadSubscripts(_))));
        let b = nd::ArrayD::<f64>::zeros(vec![3, 2]);
        assert!(matches!(contract("ij,jk->ik", &a, &b), Err(DimMismatch { .. })));
    }

    #[test]
    fn pad_and_slice() {
        let a = nd::array![[1.0, 2.0], [3.0, 4.0]].into_dyn();
        let p = pad_to(&a, &[3, 1]).unwrap();
        assert_eq!(p, nd::array![[1.0], [3.0], [0.0]].into_dyn());
    }

    #[test]
    fn double_layer_traces_physical_leg() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = rand_array(&[2, 2, 3, 2, 3], &mut rng);
        let dl = double_layer(&a).unwrap();
        assert_eq!(dl.shape(), &[4, 9, 4, 9]);
        // fused index (ket, bra) = ket * D + bra
        let (u, up, l, lp, d, dp, r, rp) = (1, 0, 2, 1, 0, 1, 1, 2);
        let expected: f64
            = (0..2).map(|s| a[[s, u, l, d, r]] * a[[s, up, lp, dp, rp]]).sum();
        let got = dl[[u * 2 + up, l * 3 + lp, d * 2 + dp, r * 3 + rp]];
        assert!((got - expected).abs() < 1e-12);

        let open = double_layer_open(&a).unwrap();
        let traced = (0..2).fold(
            nd::ArrayD::<f64>::zeros(vec![4, 9, 4, 9]),
            |acc, s| acc + open.index_axis(nd::Axis(5), s).index_axis(nd::Axis(4), s),
        );
        traced.iter().zip(dl.iter())
            .for_each(|(x, y)| assert!((x - y).abs() < 1e-12));

        let with_id = double_layer_op(&a, &eye(2)).unwrap();
        with_id.iter().zip(dl.iter())
            .for_each(|(x, y)| assert!((x - y).abs() < 1e-12));
    }
}
