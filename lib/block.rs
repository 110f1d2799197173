//! Block-sparse tensors with an abelian symmetry.
//!
//! Every leg carries a signature `±1` and a list of sectors `(charge, dim)`.
//! A tensor stores one dense block per tuple of sector charges, and only
//! blocks satisfying charge conservation
//!
//! ```text
//!   Σ_k sig_k q_k = n      (mod N for Z_N)
//! ```
//!
//! can exist, where `n` is the total charge of the tensor. The dense
//! representation of a leg concatenates its sectors in ascending order of
//! charge.
//!
//! Fusing legs `(l_1, ..., l_m)` produces a leg with the signature of `l_1`
//! whose sector `q` gathers, in lexicographic order of charges, all
//! combinations with `sig_1 Σ_k sig_k q_k = q`. The fused leg remembers its
//! parts so that it can be split again with [`BlockTensor::unfuse`].

use std::{ collections::hash_map::Entry, fmt };
use itertools::Itertools;
use ndarray as nd;
use rand::Rng;
use rustc_hash::FxHashMap;
use thiserror::Error;
use crate::{
    Elem,
    tn::{ self, Backend, TnError, TnResult },
};

#[derive(Debug, Error)]
pub enum BlockError {
    /// Returned when combining tensors of different symmetry groups.
    #[error("symmetry mismatch: {0} vs {1}")]
    SymmetryMismatch(Symmetry, Symmetry),

    /// Returned when a leg signature is neither +1 nor -1.
    #[error("invalid signature {0}")]
    BadSignature(i8),

    /// Returned when a charge is not in canonical form for the group.
    #[error("charge {charge} is not valid for {sym}")]
    BadCharge { sym: Symmetry, charge: i32 },

    /// Returned when contracting two legs with equal signatures.
    #[error("contracted legs {left} and {right} must have opposite signatures")]
    SignatureMismatch { left: usize, right: usize },

    /// Returned when the same charge sector has different dimensions on two
    /// legs that are supposed to match.
    #[error("sector {charge} has dimension {left} on one leg and {right} on the other")]
    SectorMismatch { charge: i32, left: usize, right: usize },

    /// Returned when a block refers to a charge its leg does not carry.
    #[error("charge {charge} is not a sector of leg {axis}")]
    MissingSector { axis: usize, charge: i32 },

    /// Returned when inserting a block that violates charge conservation.
    #[error("block {0:?} violates charge conservation")]
    ChargeNotConserved(Vec<i32>),

    /// Returned when a block does not have the shape given by its sectors.
    #[error("block {key:?} has shape {shape:?}, expected {expected:?}")]
    BlockShape { key: Vec<i32>, shape: Vec<usize>, expected: Vec<usize> },

    /// Returned when trying to split a leg that was not produced by fusion.
    #[error("leg {0} is not fused")]
    NotFused(usize),

    #[error("tensor error: {0}")]
    Tensor(Box<TnError>),
}
use BlockError::*;
pub type BlockResult<T> = Result<T, BlockError>;

impl From<TnError> for BlockError {
    fn from(err: TnError) -> Self { Self::Tensor(Box::new(err)) }
}

/// Abelian symmetry group.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Symmetry {
    /// U(1): charges are arbitrary integers.
    U1,
    /// Z_N: charges are integers modulo `N`, stored in `0..N`.
    Zn(i32),
}

impl Symmetry {
    /// Canonical representative of a charge.
    pub fn reduce(&self, q: i32) -> i32 {
        match self {
            Self::U1 => q,
            Self::Zn(n) => q.rem_euclid(*n),
        }
    }

    fn check(&self, q: i32) -> BlockResult<()> {
        (self.reduce(q) == q).then_some(())
            .ok_or(BadCharge { sym: *self, charge: q })
    }
}

impl fmt::Display for Symmetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U1 => write!(f, "U(1)"),
            Self::Zn(n) => write!(f, "Z_{n}"),
        }
    }
}

/// A leg of a block-sparse tensor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Leg {
    sig: i8,
    sectors: Vec<(i32, usize)>,
    parts: Vec<Leg>,
}

// one combination of part sectors inside a fused sector
#[derive(Clone, Debug)]
struct Combo {
    charges: Vec<i32>,
    dims: Vec<usize>,
    charge: i32,
    offset: usize,
}

impl Leg {
    /// Create an elementary leg. Sectors are sorted by charge; a repeated
    /// charge keeps its first dimension.
    pub fn new(sig: i8, sectors: &[(i32, usize)]) -> BlockResult<Self> {
        if sig != 1 && sig != -1 { return Err(BadSignature(sig)); }
        let mut sectors = sectors.to_vec();
        sectors.sort_by_key(|(q, _)| *q);
        sectors.dedup_by_key(|(q, _)| *q);
        Ok(Self { sig, sectors, parts: Vec::new() })
    }

    pub fn sig(&self) -> i8 { self.sig }

    /// `(charge, dim)` pairs in ascending order of charge.
    pub fn sectors(&self) -> &[(i32, usize)] { &self.sectors }

    /// Legs this one was fused from, empty for elementary legs.
    pub fn parts(&self) -> &[Leg] { &self.parts }

    pub fn is_fused(&self) -> bool { !self.parts.is_empty() }

    /// Total dimension of the dense representation.
    pub fn dim(&self) -> usize { self.sectors.iter().map(|(_, d)| *d).sum() }

    /// Dimension of the sector with charge `q`.
    pub fn sector_dim(&self, q: i32) -> Option<usize> {
        self.sectors.iter().find(|(qk, _)| *qk == q).map(|(_, d)| *d)
    }

    /// Position of the sector with charge `q` in the dense representation.
    pub fn offset(&self, q: i32) -> Option<usize> {
        let k = self.sectors.iter().position(|(qk, _)| *qk == q)?;
        Some(self.sectors[..k].iter().map(|(_, d)| *d).sum())
    }

    /// The same leg seen from the other side of a bond.
    pub fn flipped(&self) -> Self {
        Self {
            sig: -self.sig,
            sectors: self.sectors.clone(),
            parts: self.parts.iter().map(|p| p.flipped()).collect(),
        }
    }

    /// Elementary leg with the signature of `self` carrying the sectors of
    /// both legs. Sectors present on both must agree in dimension.
    pub fn union(&self, other: &Self) -> BlockResult<Self> {
        let mut sectors = self.sectors.clone();
        for (q, d) in other.sectors.iter() {
            match self.sector_dim(*q) {
                Some(d0) if d0 != *d => {
                    return Err(SectorMismatch { charge: *q, left: d0, right: *d });
                },
                Some(_) => { },
                None => { sectors.push((*q, *d)); },
            }
        }
        Self::new(self.sig, &sectors)
    }

    fn fused(sym: Symmetry, parts: Vec<Leg>) -> Self {
        let mut leg = Self { sig: parts[0].sig, sectors: Vec::new(), parts };
        let mut totals: FxHashMap<i32, usize> = FxHashMap::default();
        for combo in leg.combos(sym) {
            let d: usize = combo.dims.iter().product();
            *totals.entry(combo.charge).or_insert(0) += d;
        }
        leg.sectors = totals.into_iter().collect();
        leg.sectors.sort_by_key(|(q, _)| *q);
        leg
    }

    // every combination of part sectors, in lexicographic order, with the
    // fused charge and the offset inside its fused sector
    fn combos(&self, sym: Symmetry) -> Vec<Combo> {
        let mut offsets: FxHashMap<i32, usize> = FxHashMap::default();
        self.parts.iter()
            .map(|p| p.sectors.iter().copied())
            .multi_cartesian_product()
            .map(|secs| {
                let charges: Vec<i32> = secs.iter().map(|(q, _)| *q).collect();
                let dims: Vec<usize> = secs.iter().map(|(_, d)| *d).collect();
                let total: i32
                    = self.parts.iter().zip(&charges)
                    .map(|(p, q)| i32::from(p.sig) * q)
                    .sum();
                let charge = sym.reduce(i32::from(self.sig) * total);
                let off = offsets.entry(charge).or_insert(0);
                let offset = *off;
                *off += dims.iter().product::<usize>();
                Combo { charges, dims, charge, offset }
            })
            .collect()
    }
}

/// Block-sparse tensor over the element type `A`.
#[derive(Clone)]
pub struct BlockTensor<A> {
    sym: Symmetry,
    n: i32,
    legs: Vec<Leg>,
    blocks: FxHashMap<Vec<i32>, nd::ArrayD<A>>,
}

impl<A> fmt::Debug for BlockTensor<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockTensor")
            .field("sym", &self.sym)
            .field("n", &self.n)
            .field("legs", &self.legs)
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl<A> BlockTensor<A>
where A: Elem
{
    /// Create a tensor without any blocks.
    pub fn zeros(sym: Symmetry, legs: Vec<Leg>, n: i32) -> BlockResult<Self> {
        if let Symmetry::Zn(k) = sym {
            if k < 1 { return Err(BadCharge { sym, charge: k }); }
        }
        sym.check(n)?;
        for leg in legs.iter() {
            leg.sectors.iter().try_for_each(|(q, _)| sym.check(*q))?;
        }
        Ok(Self { sym, n, legs, blocks: FxHashMap::default() })
    }

    /// Create a tensor from explicit blocks, checking conservation and block
    /// shapes.
    pub fn new<I>(sym: Symmetry, legs: Vec<Leg>, n: i32, blocks: I)
        -> BlockResult<Self>
    where I: IntoIterator<Item = (Vec<i32>, nd::ArrayD<A>)>
    {
        let mut tens = Self::zeros(sym, legs, n)?;
        for (key, block) in blocks.into_iter() {
            tens.insert(key, block)?;
        }
        Ok(tens)
    }

    /// Create a tensor with every allowed block filled with elements drawn
    /// uniformly from `[-1, 1)` (real and imaginary parts independently).
    pub fn random<R>(sym: Symmetry, legs: Vec<Leg>, n: i32, rng: &mut R)
        -> BlockResult<Self>
    where R: Rng + ?Sized
    {
        let mut tens = Self::zeros(sym, legs, n)?;
        for key in tens.allowed_keys() {
            let shape = tens.block_shape(&key)?;
            let block = nd::ArrayD::from_shape_simple_fn(shape, || {
                let re: f64 = rng.gen_range(-1.0..1.0);
                let im: f64 = if A::is_complex() { rng.gen_range(-1.0..1.0) } else { 0.0 };
                A::from_components(A::real(re), A::real(im))
            });
            tens.blocks.insert(key, block);
        }
        Ok(tens)
    }

    /// Extract the allowed blocks of a dense array. Elements outside of them
    /// are discarded.
    pub fn from_dense(dense: &nd::ArrayD<A>, sym: Symmetry, legs: Vec<Leg>, n: i32)
        -> BlockResult<Self>
    {
        let mut tens = Self::zeros(sym, legs, n)?;
        let dims: Vec<usize> = tens.legs.iter().map(|l| l.dim()).collect();
        if dense.shape() != dims.as_slice() {
            return Err(TnError::IncompatibleShape(dense.shape().to_vec()).into());
        }
        for key in tens.allowed_keys() {
            let (offs, shape) = tens.placement(&key, &tens.legs)?;
            let block
                = dense.slice_each_axis(|ax| {
                    let k = ax.axis.index();
                    nd::Slice::from(offs[k]..offs[k] + shape[k])
                })
                .to_owned();
            tens.blocks.insert(key, block);
        }
        Ok(tens)
    }

    pub fn sym(&self) -> Symmetry { self.sym }

    /// Total charge.
    pub fn charge(&self) -> i32 { self.n }

    pub fn legs(&self) -> &[Leg] { &self.legs }

    pub fn leg(&self, axis: usize) -> Option<&Leg> { self.legs.get(axis) }

    pub fn num_blocks(&self) -> usize { self.blocks.len() }

    pub fn block(&self, key: &[i32]) -> Option<&nd::ArrayD<A>> { self.blocks.get(key) }

    /// Iterate over `(charges, block)` pairs in arbitrary order.
    pub fn blocks(&self) -> impl Iterator<Item = (&Vec<i32>, &nd::ArrayD<A>)> + '_ {
        self.blocks.iter()
    }

    fn conserves(&self, key: &[i32]) -> bool {
        let total: i32
            = self.legs.iter().zip(key)
            .map(|(l, q)| i32::from(l.sig) * q)
            .sum();
        self.sym.reduce(total) == self.n
    }

    fn block_shape(&self, key: &[i32]) -> BlockResult<Vec<usize>> {
        self.legs.iter().zip(key).enumerate()
            .map(|(axis, (l, q))| {
                l.sector_dim(*q).ok_or(MissingSector { axis, charge: *q })
            })
            .collect()
    }

    // offsets and extents of a block inside the dense layout given by `legs`
    fn placement(&self, key: &[i32], legs: &[Leg])
        -> BlockResult<(Vec<usize>, Vec<usize>)>
    {
        let shape = self.block_shape(key)?;
        let mut offs: Vec<usize> = Vec::with_capacity(key.len());
        for (axis, (leg, q)) in legs.iter().zip(key).enumerate() {
            let d = leg.sector_dim(*q).ok_or(MissingSector { axis, charge: *q })?;
            if d != shape[axis] {
                return Err(SectorMismatch { charge: *q, left: shape[axis], right: d });
            }
            offs.push(leg.offset(*q).unwrap_or(0));
        }
        Ok((offs, shape))
    }

    /// All charge tuples allowed by conservation.
    pub fn allowed_keys(&self) -> Vec<Vec<i32>> {
        if self.legs.is_empty() {
            return if self.n == 0 { vec![Vec::new()] } else { Vec::new() };
        }
        self.legs.iter()
            .map(|l| l.sectors.iter().map(|(q, _)| *q))
            .multi_cartesian_product()
            .filter(|key| self.conserves(key))
            .collect()
    }

    /// Insert or replace a block.
    pub fn insert(&mut self, key: Vec<i32>, block: nd::ArrayD<A>) -> BlockResult<()> {
        if key.len() != self.legs.len() || !self.conserves(&key) {
            return Err(ChargeNotConserved(key));
        }
        let expected = self.block_shape(&key)?;
        if block.shape() != expected.as_slice() {
            return Err(BlockShape { key, shape: block.shape().to_vec(), expected });
        }
        self.blocks.insert(key, block);
        Ok(())
    }

    /// Dense representation in the sector layout of `legs`, which must carry
    /// at least the sectors of the corresponding legs of `self`.
    pub fn to_dense_with(&self, legs: &[Leg]) -> BlockResult<nd::ArrayD<A>> {
        if legs.len() != self.legs.len() {
            return Err(TnError::RankMismatch {
                expected: self.legs.len(),
                shape: legs.iter().map(|l| l.dim()).collect(),
            }.into());
        }
        let dims: Vec<usize> = legs.iter().map(|l| l.dim()).collect();
        let mut out: nd::ArrayD<A> = nd::ArrayD::zeros(dims);
        for (key, block) in self.blocks.iter() {
            let (offs, shape) = self.placement(key, legs)?;
            out.slice_each_axis_mut(|ax| {
                let k = ax.axis.index();
                nd::Slice::from(offs[k]..offs[k] + shape[k])
            })
            .assign(block);
        }
        Ok(out)
    }

    /// Split a fused leg back into its parts, in place of the original axis.
    pub fn unfuse(&self, axis: usize) -> BlockResult<Self> {
        let leg = self.legs.get(axis)
            .ok_or_else(|| TnError::BadAxes(vec![axis]))?;
        if !leg.is_fused() { return Err(NotFused(axis)); }
        let combos = leg.combos(self.sym);
        let legs: Vec<Leg>
            = self.legs[..axis].iter()
            .chain(leg.parts.iter())
            .chain(self.legs[axis + 1..].iter())
            .cloned()
            .collect();
        let mut blocks: FxHashMap<Vec<i32>, nd::ArrayD<A>> = FxHashMap::default();
        for (key, block) in self.blocks.iter() {
            for combo in combos.iter().filter(|c| c.charge == key[axis]) {
                let size: usize = combo.dims.iter().product();
                let sub
                    = block.slice_axis(
                        nd::Axis(axis),
                        nd::Slice::from(combo.offset..combo.offset + size),
                    )
                    .to_owned();
                let shape: Vec<usize>
                    = block.shape()[..axis].iter()
                    .chain(combo.dims.iter())
                    .chain(block.shape()[axis + 1..].iter())
                    .copied()
                    .collect();
                let new_key: Vec<i32>
                    = key[..axis].iter()
                    .chain(combo.charges.iter())
                    .chain(key[axis + 1..].iter())
                    .copied()
                    .collect();
                blocks.insert(new_key, tn::reshape(&sub, &shape)?);
            }
        }
        Ok(Self { sym: self.sym, n: self.n, legs, blocks })
    }

    /// Split every fused leg recursively and return the dense representation
    /// together with the grouping that restores the original legs with
    /// [`tn::fuse`].
    pub fn to_dense_unfused(&self) -> BlockResult<(nd::ArrayD<A>, Vec<usize>)> {
        let mut tens = self.clone();
        let mut groups: Vec<usize> = vec![1; self.legs.len()];
        loop {
            let Some(axis) = tens.legs.iter().position(|l| l.is_fused()) else { break; };
            let m = tens.legs[axis].parts.len();
            // find the group that owns `axis` and widen it
            let mut acc: usize = 0;
            for g in groups.iter_mut() {
                if axis < acc + *g {
                    *g += m - 1;
                    break;
                }
                acc += *g;
            }
            tens = tens.unfuse(axis)?;
        }
        Ok((tens.to_dense_with(&tens.legs)?, groups))
    }

    fn tensordot_blocks(&self, other: &Self, axes_a: &[usize], axes_b: &[usize])
        -> BlockResult<Self>
    {
        if self.sym != other.sym {
            return Err(SymmetryMismatch(self.sym, other.sym));
        }
        let bad_axes = || -> BlockError {
            TnError::BadAxes(axes_a.iter().chain(axes_b).copied().collect()).into()
        };
        if axes_a.len() != axes_b.len()
            || axes_a.iter().any(|k| *k >= self.legs.len())
            || axes_b.iter().any(|k| *k >= other.legs.len())
            || !axes_a.iter().all_unique()
            || !axes_b.iter().all_unique()
        {
            return Err(bad_axes());
        }
        for (ka, kb) in axes_a.iter().zip(axes_b) {
            let (la, lb) = (&self.legs[*ka], &other.legs[*kb]);
            if la.sig != -lb.sig {
                return Err(SignatureMismatch { left: *ka, right: *kb });
            }
            for (q, d) in la.sectors.iter() {
                if let Some(d_b) = lb.sector_dim(*q) {
                    if d_b != *d {
                        return Err(SectorMismatch { charge: *q, left: *d, right: d_b });
                    }
                }
            }
        }
        let free_a: Vec<usize>
            = (0..self.legs.len()).filter(|k| !axes_a.contains(k)).collect();
        let free_b: Vec<usize>
            = (0..other.legs.len()).filter(|k| !axes_b.contains(k)).collect();
        let legs: Vec<Leg>
            = free_a.iter().map(|k| self.legs[*k].clone())
            .chain(free_b.iter().map(|k| other.legs[*k].clone()))
            .collect();

        let mut by_contracted: FxHashMap<Vec<i32>, Vec<(&Vec<i32>, &nd::ArrayD<A>)>>
            = FxHashMap::default();
        for (key, block) in other.blocks.iter() {
            let ckey: Vec<i32> = axes_b.iter().map(|k| key[*k]).collect();
            by_contracted.entry(ckey).or_default().push((key, block));
        }
        let mut blocks: FxHashMap<Vec<i32>, nd::ArrayD<A>> = FxHashMap::default();
        for (key_a, block_a) in self.blocks.iter() {
            let ckey: Vec<i32> = axes_a.iter().map(|k| key_a[*k]).collect();
            let Some(matches) = by_contracted.get(&ckey) else { continue; };
            for (key_b, block_b) in matches.iter() {
                let prod = tn::tensordot(block_a, block_b, axes_a, axes_b)?;
                let key: Vec<i32>
                    = free_a.iter().map(|k| key_a[*k])
                    .chain(free_b.iter().map(|k| key_b[*k]))
                    .collect();
                match blocks.entry(key) {
                    Entry::Occupied(mut e) => { *e.get_mut() += &prod; },
                    Entry::Vacant(e) => { e.insert(prod); },
                }
            }
        }
        let n = self.sym.reduce(self.n + other.n);
        Ok(Self { sym: self.sym, n, legs, blocks })
    }

    fn permute_blocks(&self, axes: &[usize]) -> BlockResult<Self> {
        if axes.len() != self.legs.len()
            || axes.iter().any(|k| *k >= self.legs.len())
            || !axes.iter().all_unique()
        {
            return Err(TnError::BadAxes(axes.to_vec()).into());
        }
        let legs: Vec<Leg> = axes.iter().map(|k| self.legs[*k].clone()).collect();
        let blocks: FxHashMap<Vec<i32>, nd::ArrayD<A>>
            = self.blocks.iter()
            .map(|(key, block)| {
                let key: Vec<i32> = axes.iter().map(|k| key[*k]).collect();
                Ok((key, tn::permute(block, axes)?))
            })
            .collect::<BlockResult<_>>()?;
        Ok(Self { sym: self.sym, n: self.n, legs, blocks })
    }

    fn fuse_blocks(&self, groups: &[usize]) -> BlockResult<Self> {
        if groups.iter().sum::<usize>() != self.legs.len() || groups.contains(&0) {
            return Err(TnError::BadAxes(groups.to_vec()).into());
        }
        // new legs, and for fused ones the offset of every part combination
        let mut legs: Vec<Leg> = Vec::with_capacity(groups.len());
        let mut lookups: Vec<Option<FxHashMap<Vec<i32>, (i32, usize)>>> = Vec::new();
        let mut k0: usize = 0;
        for g in groups.iter() {
            if *g == 1 {
                legs.push(self.legs[k0].clone());
                lookups.push(None);
            } else {
                let leg = Leg::fused(self.sym, self.legs[k0..k0 + g].to_vec());
                let lookup: FxHashMap<Vec<i32>, (i32, usize)>
                    = leg.combos(self.sym).into_iter()
                    .map(|c| (c.charges, (c.charge, c.offset)))
                    .collect();
                legs.push(leg);
                lookups.push(Some(lookup));
            }
            k0 += g;
        }
        let mut fused = Self::zeros(self.sym, legs, self.n)?;
        for (key, block) in self.blocks.iter() {
            let mut new_key: Vec<i32> = Vec::with_capacity(groups.len());
            let mut offs: Vec<usize> = Vec::with_capacity(groups.len());
            let mut k0: usize = 0;
            for (g, lookup) in groups.iter().zip(&lookups) {
                match lookup {
                    None => {
                        new_key.push(key[k0]);
                        offs.push(0);
                    },
                    Some(lookup) => {
                        let part_key = key[k0..k0 + g].to_vec();
                        let (q, off) = lookup.get(&part_key).copied()
                            .ok_or(MissingSector { axis: k0, charge: key[k0] })?;
                        new_key.push(q);
                        offs.push(off);
                    },
                }
                k0 += g;
            }
            let piece = tn::fuse(block, groups)?;
            let shape = fused.block_shape(&new_key)?;
            let target
                = fused.blocks.entry(new_key)
                .or_insert_with(|| nd::ArrayD::zeros(shape));
            target.slice_each_axis_mut(|ax| {
                let k = ax.axis.index();
                nd::Slice::from(offs[k]..offs[k] + piece.shape()[k])
            })
            .assign(&piece);
        }
        Ok(fused)
    }
}

impl<A: Elem> Backend for BlockTensor<A> {
    type Elem = A;

    fn rank(&self) -> usize { self.legs.len() }

    fn tensordot(&self, other: &Self, axes_self: &[usize], axes_other: &[usize])
        -> TnResult<Self>
    {
        Ok(self.tensordot_blocks(other, axes_self, axes_other)?)
    }

    fn conj(&self) -> Self {
        Self {
            sym: self.sym,
            n: self.sym.reduce(-self.n),
            legs: self.legs.iter().map(|l| l.flipped()).collect(),
            blocks: self.blocks.iter()
                .map(|(key, block)| (key.clone(), tn::conj(block)))
                .collect(),
        }
    }

    fn permute(&self, axes: &[usize]) -> TnResult<Self> {
        Ok(self.permute_blocks(axes)?)
    }

    fn fuse(&self, groups: &[usize]) -> TnResult<Self> {
        Ok(self.fuse_blocks(groups)?)
    }

    fn max_abs(&self) -> A::Real {
        self.blocks.values()
            .map(|b| tn::max_abs(b))
            .fold(<A::Real as num_traits::Zero>::zero(), num_traits::Float::max)
    }

    fn scale(&self, x: A) -> Self {
        Self {
            sym: self.sym,
            n: self.n,
            legs: self.legs.clone(),
            blocks: self.blocks.iter()
                .map(|(key, block)| (key.clone(), block.mapv(|v| v * x)))
                .collect(),
        }
    }

    fn to_dense(&self) -> TnResult<nd::ArrayD<A>> {
        Ok(self.to_dense_with(&self.legs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::env::corner_from_site;

    fn u1_leg(sig: i8) -> Leg {
        Leg::new(sig, &[(-1, 1), (0, 2), (1, 1)]).unwrap()
    }

    fn random_u1(legs: Vec<Leg>, n: i32, seed: u64) -> BlockTensor<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        BlockTensor::random(Symmetry::U1, legs, n, &mut rng).unwrap()
    }

    fn assert_close(a: &nd::ArrayD<f64>, b: &nd::ArrayD<f64>) {
        assert_eq!(a.shape(), b.shape());
        assert!(tn::max_abs(&(a - b)) < 1e-12);
    }

    #[test]
    fn legs_and_conservation() {
        let leg = Leg::new(1, &[(1, 3), (-2, 1), (1, 5)]).unwrap();
        assert_eq!(leg.sectors(), &[(-2, 1), (1, 3)]);
        assert_eq!(leg.dim(), 4);
        assert_eq!(leg.offset(1), Some(1));
        assert!(matches!(Leg::new(0, &[]), Err(BadSignature(0))));
        let other = Leg::new(-1, &[(1, 3), (4, 2)]).unwrap();
        let u = leg.union(&other).unwrap();
        assert_eq!(u.sectors(), &[(-2, 1), (1, 3), (4, 2)]);
        assert_eq!(u.sig(), 1);
        let bad = Leg::new(-1, &[(1, 2)]).unwrap();
        assert!(matches!(leg.union(&bad), Err(SectorMismatch { charge: 1, .. })));

        let mut t: BlockTensor<f64>
            = BlockTensor::zeros(Symmetry::U1, vec![u1_leg(1), u1_leg(-1)], 0).unwrap();
        assert_eq!(t.allowed_keys().len(), 3);
        assert!(matches!(
            t.insert(vec![1, 0], nd::ArrayD::zeros(vec![1, 2])),
            Err(ChargeNotConserved(_))
        ));
        assert!(matches!(
            t.insert(vec![0, 0], nd::ArrayD::zeros(vec![1, 2])),
            Err(BlockShape { .. })
        ));
        t.insert(vec![0, 0], nd::ArrayD::ones(vec![2, 2])).unwrap();
        assert_eq!(t.num_blocks(), 1);
        assert!(matches!(
            BlockTensor::<f64>::zeros(Symmetry::Zn(2), vec![], 3),
            Err(BadCharge { .. })
        ));
    }

    #[test]
    fn dense_conversion_keeps_allowed_blocks() {
        let t = random_u1(vec![u1_leg(1), u1_leg(1), u1_leg(-1)], 1, 10546);
        let dense = t.to_dense().unwrap();
        assert_eq!(dense.shape(), &[4, 4, 4]);
        let back = BlockTensor::from_dense(&dense, Symmetry::U1, t.legs().to_vec(), 1).unwrap();
        assert_close(&back.to_dense().unwrap(), &dense);
        // charge (-1, -1, 1): -1 - 1 - 1 != 1, so the element is zero
        assert_eq!(dense[[0, 0, 3]], 0.0);
    }

    #[test]
    fn contraction_matches_dense() {
        let a = random_u1(vec![u1_leg(1), u1_leg(-1), u1_leg(1)], 0, 1);
        let b = random_u1(vec![u1_leg(1), u1_leg(-1)], 1, 2);
        let c = Backend::tensordot(&a, &b, &[1], &[0]).unwrap();
        assert_eq!(c.charge(), 1);
        let dense = tn::tensordot(&a.to_dense().unwrap(), &b.to_dense().unwrap(), &[1], &[0])
            .unwrap();
        assert_close(&c.to_dense().unwrap(), &dense);
        assert!(matches!(
            a.tensordot_blocks(&b, &[0], &[0]),
            Err(SignatureMismatch { .. })
        ));
        let p = Backend::permute(&a, &[2, 0, 1]).unwrap();
        assert_close(&p.to_dense().unwrap(), &tn::permute(&a.to_dense().unwrap(), &[2, 0, 1]).unwrap());
        let full = Backend::tensordot(&a, &a.conj(), &[0, 1, 2], &[0, 1, 2]).unwrap();
        let norm2: f64 = a.to_dense().unwrap().iter().map(|x| x * x).sum();
        assert!((full.to_dense().unwrap().sum() - norm2).abs() < 1e-10);
    }

    #[test]
    fn fusion_round_trip() {
        let t = random_u1(vec![u1_leg(1), u1_leg(-1), u1_leg(1), u1_leg(-1)], 0, 3);
        let f = Backend::fuse(&t, &[2, 1, 1]).unwrap();
        assert_eq!(f.rank(), 3);
        assert!(f.leg(0).unwrap().is_fused());
        assert_eq!(f.leg(0).unwrap().dim(), 16);
        assert!((f.max_abs() - t.max_abs()).abs() < 1e-15);
        let back = f.unfuse(0).unwrap();
        assert_close(&back.to_dense().unwrap(), &t.to_dense().unwrap());
        let (dense, groups) = f.to_dense_unfused().unwrap();
        assert_eq!(groups, vec![2, 1, 1]);
        assert_close(&dense, &t.to_dense().unwrap());
        assert!(matches!(t.unfuse(1), Err(NotFused(1))));
    }

    #[test]
    fn zn_charges_wrap() {
        let leg = |sig| Leg::new(sig, &[(0, 1), (1, 1), (2, 1)]).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let a: BlockTensor<f64>
            = BlockTensor::random(Symmetry::Zn(3), vec![leg(1), leg(1)], 2, &mut rng).unwrap();
        let b: BlockTensor<f64>
            = BlockTensor::random(Symmetry::Zn(3), vec![leg(-1), leg(1)], 2, &mut rng).unwrap();
        let c = Backend::tensordot(&a, &b, &[1], &[0]).unwrap();
        assert_eq!(c.charge(), 1);
        assert!(c.blocks().all(|(key, _)| (key[0] + key[1]).rem_euclid(3) == 1));
        assert_eq!(a.conj().charge(), 1);
    }

    #[test]
    fn corners_match_dense_construction() {
        let legs = vec![
            Leg::new(-1, &[(0, 1), (1, 1)]).unwrap(),
            u1_leg(1), u1_leg(1), u1_leg(-1), u1_leg(-1),
        ];
        let a = random_u1(legs, 0, 5);
        let c = corner_from_site(&a, crate::lattice::CornerDir::LeftUp).unwrap();
        let (dense, groups) = c.to_dense_unfused().unwrap();
        let dense = tn::fuse(&dense, &groups).unwrap();
        let expected = corner_from_site(&a.to_dense().unwrap(), crate::lattice::CornerDir::LeftUp)
            .unwrap();
        assert_close(&dense, &expected);
    }
}
