//! iPEPS wavefunctions: a finite unit cell of on-site tensors and a tiling
//! function folding the infinite lattice into it.
//!
//! Every on-site tensor has axis signature
//!
//! ```text
//!          u
//!          |
//!     l -- A -- r        A[s, u, l, d, r]
//!         /|
//!        s d
//! ```

use std::{ collections::BTreeMap, fmt, sync::Arc };
use ndarray as nd;
use rand::Rng;
use thiserror::Error;
use crate::{
    Elem,
    lattice::{ Coord, EdgeDir },
    tn::{ self, Backend, TnError },
};

#[derive(Debug, Error)]
pub enum StateError {
    /// Returned when a unit cell is created without any sites.
    #[error("error in state creation: empty unit cell")]
    EmptyCell,

    /// Returned when an on-site tensor does not have rank 5.
    #[error("error in state creation: on-site tensor at {0} must have rank 5, got {1}")]
    SiteRank(Coord, usize),

    /// Returned when the tiling maps a unit-cell site somewhere else, or maps
    /// a lattice vertex outside of the unit cell.
    #[error("error in state creation: tiling does not fix site {0}")]
    TilingMismatch(Coord),

    /// Returned when neighboring on-site tensors disagree on the dimension of
    /// the bond between them.
    #[error("error in state creation: bond dimension mismatch between {0} and {1}")]
    BondMismatch(Coord, Coord),

    /// Returned when the tensor at a coordinate cannot be found.
    #[error("missing on-site tensor for coordinate {0}")]
    MissingSite(Coord),

    #[error("tensor error: {0}")]
    Tensor(#[from] TnError),
}
use StateError::*;
pub type StateResult<T> = Result<T, StateError>;

/// Interface through which the environment engine sees a wavefunction.
pub trait Wavefunction {
    type Tensor: Backend;

    /// Fold an arbitrary lattice coordinate into the unit cell.
    fn vertex_to_site(&self, coord: Coord) -> Coord;

    /// On-site tensor for the unit-cell site that `coord` folds to.
    fn site(&self, coord: Coord) -> Option<&Self::Tensor>;

    /// All non-equivalent sites of the unit cell, in ascending order.
    fn vertices(&self) -> Vec<Coord>;

    /// Like [`Self::site`], but failing with [`StateError::MissingSite`].
    fn site_checked(&self, coord: Coord) -> StateResult<&Self::Tensor> {
        self.site(coord).ok_or(MissingSite(coord))
    }
}

/// Tiling of the square lattice by a unit cell.
#[derive(Clone)]
pub enum Tiling {
    /// `lx × ly` rectangle, periodically repeated. Sites are `(x, y)` with
    /// `0 <= x < lx`, `0 <= y < ly`.
    Rect { lx: usize, ly: usize },
    /// Two-site checkerboard: `(x, y) ↦ ((x + y) mod 2, 0)`.
    Bipartite,
    /// Any other folding.
    Custom(Arc<dyn Fn(Coord) -> Coord + Send + Sync>),
}

impl Tiling {
    /// Fold a coordinate into the unit cell.
    pub fn fold(&self, coord: Coord) -> Coord {
        match self {
            Self::Rect { lx, ly } => Coord::new(
                coord.x.rem_euclid(*lx as i64),
                coord.y.rem_euclid(*ly as i64),
            ),
            Self::Bipartite => Coord::new((coord.x + coord.y).rem_euclid(2), 0),
            Self::Custom(f) => f(coord),
        }
    }

    /// `true` for a rectangle with a zero extent, which folds nothing.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Rect { lx, ly } if *lx == 0 || *ly == 0)
    }

    /// Sites of the cell for the tilings where these can be enumerated.
    pub fn cell(&self) -> Option<Vec<Coord>> {
        match self {
            Self::Rect { lx, ly } => Some(
                (0..*ly as i64)
                    .flat_map(|y| (0..*lx as i64).map(move |x| Coord::new(x, y)))
                    .collect()
            ),
            Self::Bipartite => Some(vec![Coord::new(0, 0), Coord::new(1, 0)]),
            Self::Custom(_) => None,
        }
    }
}

impl fmt::Debug for Tiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rect { lx, ly } => write!(f, "Rect {{ lx: {lx}, ly: {ly} }}"),
            Self::Bipartite => write!(f, "Bipartite"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Dense iPEPS on an arbitrary unit cell.
#[derive(Clone, Debug)]
pub struct IPEPS<A> {
    pub(crate) sites: BTreeMap<Coord, nd::ArrayD<A>>,
    pub(crate) tiling: Tiling,
}

impl<A> IPEPS<A>
where A: Elem
{
    /// Create a new state, checking that the tiling folds every site onto
    /// itself, that all tensors have rank 5, and that the bond dimensions of
    /// neighboring tensors agree.
    pub fn new(sites: BTreeMap<Coord, nd::ArrayD<A>>, tiling: Tiling)
        -> StateResult<Self>
    {
        if sites.is_empty() || tiling.is_empty() { return Err(EmptyCell); }
        for (c, a) in sites.iter() {
            if a.ndim() != 5 { return Err(SiteRank(*c, a.ndim())); }
            if tiling.fold(*c) != *c { return Err(TilingMismatch(*c)); }
        }
        for c in sites.keys() {
            for dir in [EdgeDir::Right, EdgeDir::Down] {
                let n = tiling.fold(*c + dir.vec());
                let Some(b) = sites.get(&n) else { return Err(TilingMismatch(n)); };
                let a = &sites[c];
                let (ka, kb) = match dir {
                    EdgeDir::Right => (4, 2),
                    _ => (3, 1),
                };
                if a.shape()[ka] != b.shape()[kb] { return Err(BondMismatch(*c, n)); }
            }
        }
        Ok(Self { sites, tiling })
    }

    /// Create a state with elements drawn uniformly from `[-1, 1)` (real and
    /// imaginary parts independently) for every site of an enumerable tiling.
    pub fn random<R>(phys_dim: usize, bond_dim: usize, tiling: Tiling, rng: &mut R)
        -> StateResult<Self>
    where R: Rng + ?Sized
    {
        let cell = tiling.cell().ok_or(EmptyCell)?;
        let sites: BTreeMap<Coord, nd::ArrayD<A>>
            = cell.into_iter()
            .map(|c| (c, random_site(phys_dim, bond_dim, &mut *rng)))
            .collect();
        Self::new(sites, tiling)
    }

    pub fn tiling(&self) -> &Tiling { &self.tiling }

    /// Mutable access to the tensor of a unit-cell site.
    pub fn site_mut(&mut self, coord: Coord) -> Option<&mut nd::ArrayD<A>> {
        let c = self.tiling.fold(coord);
        self.sites.get_mut(&c)
    }

    /// Divide every on-site tensor by its largest element.
    pub fn normalize(&mut self)
    where A: Default
    {
        self.sites.values_mut()
            .for_each(|a| { *a = tn::normalize_max(std::mem::take(a)); });
    }

    /// Largest auxiliary bond dimension in the unit cell.
    pub fn max_bond_dim(&self) -> usize {
        self.sites.values()
            .flat_map(|a| a.shape()[1..].to_vec())
            .max()
            .unwrap_or(0)
    }
}

impl<A> Wavefunction for IPEPS<A>
where A: Elem
{
    type Tensor = nd::ArrayD<A>;

    fn vertex_to_site(&self, coord: Coord) -> Coord { self.tiling.fold(coord) }

    fn site(&self, coord: Coord) -> Option<&nd::ArrayD<A>> {
        self.sites.get(&self.tiling.fold(coord))
    }

    fn vertices(&self) -> Vec<Coord> { self.sites.keys().copied().collect() }
}

/// Random on-site tensor of shape `[d, D, D, D, D]`.
pub fn random_site<A, R>(phys_dim: usize, bond_dim: usize, rng: &mut R)
    -> nd::ArrayD<A>
where
    A: Elem,
    R: Rng + ?Sized,
{
    let shape = vec![phys_dim, bond_dim, bond_dim, bond_dim, bond_dim];
    nd::ArrayD::from_shape_simple_fn(shape, || {
        let re: f64 = rng.gen_range(-1.0..1.0);
        let im: f64 = if A::is_complex() { rng.gen_range(-1.0..1.0) } else { 0.0 };
        A::from_components(A::real(re), A::real(im))
    })
}

// axis permutations of the auxiliary legs realizing the elements of C4v
const C4V_PERMS: [[usize; 5]; 8] = [
    [0, 1, 2, 3, 4], // identity
    [0, 4, 1, 2, 3], // rotations
    [0, 3, 4, 1, 2],
    [0, 2, 3, 4, 1],
    [0, 1, 4, 3, 2], // l <-> r
    [0, 3, 2, 1, 4], // u <-> d
    [0, 2, 1, 4, 3], // u <-> l, d <-> r
    [0, 4, 3, 2, 1], // u <-> r, l <-> d
];

/// Single-site iPEPS whose tensor is invariant under the point group C4v.
#[derive(Clone, Debug)]
pub struct IPEPSC4v<A> {
    pub(crate) site: nd::ArrayD<A>,
}

impl<A> IPEPSC4v<A>
where A: Elem
{
    /// Create a new state, projecting the tensor onto its C4v-symmetric part.
    pub fn new(site: nd::ArrayD<A>) -> StateResult<Self> {
        if site.ndim() != 5 { return Err(SiteRank(Coord::new(0, 0), site.ndim())); }
        let sh = site.shape();
        if sh[1..].iter().any(|d| *d != sh[1]) {
            return Err(BondMismatch(Coord::new(0, 0), Coord::new(0, 0)));
        }
        Ok(Self { site: symmetrize(&site)? })
    }

    pub fn random<R>(phys_dim: usize, bond_dim: usize, rng: &mut R)
        -> StateResult<Self>
    where R: Rng + ?Sized
    {
        Self::new(random_site(phys_dim, bond_dim, rng))
    }

    pub fn site_tensor(&self) -> &nd::ArrayD<A> { &self.site }

    /// Re-project the tensor onto the C4v-symmetric subspace.
    pub fn symmetrize(&mut self) -> StateResult<()> {
        self.site = symmetrize(&self.site)?;
        Ok(())
    }

    /// Express as a generic single-site iPEPS.
    pub fn to_ipeps(&self) -> StateResult<IPEPS<A>> {
        let sites: BTreeMap<Coord, nd::ArrayD<A>>
            = [(Coord::new(0, 0), self.site.clone())].into_iter().collect();
        IPEPS::new(sites, Tiling::Rect { lx: 1, ly: 1 })
    }
}

/// Average of a rank-5 tensor over the eight elements of C4v acting on its
/// auxiliary legs.
pub fn symmetrize<A>(a: &nd::ArrayD<A>) -> StateResult<nd::ArrayD<A>>
where A: Elem
{
    let mut acc: nd::ArrayD<A> = nd::ArrayD::zeros(a.shape());
    for perm in C4V_PERMS.iter() {
        acc += &tn::permute(a, perm)?;
    }
    let w = A::from_real(A::real(0.125));
    Ok(acc.mapv_into(|x| x * w))
}

/// Return `true` if the tensor is invariant under all of C4v to within `tol`
/// (elementwise).
pub fn is_c4v_symmetric<A>(a: &nd::ArrayD<A>, tol: f64) -> StateResult<bool>
where A: Elem
{
    let tol = A::real(tol);
    for perm in C4V_PERMS.iter().skip(1) {
        let p = tn::permute(a, perm)?;
        if p.iter().zip(a.iter()).any(|(x, y)| (*x - *y).abs() > tol) {
            return Ok(false);
        }
    }
    Ok(true)
}

impl<A> Wavefunction for IPEPSC4v<A>
where A: Elem
{
    type Tensor = nd::ArrayD<A>;

    fn vertex_to_site(&self, _coord: Coord) -> Coord { Coord::new(0, 0) }

    fn site(&self, _coord: Coord) -> Option<&nd::ArrayD<A>> { Some(&self.site) }

    fn vertices(&self) -> Vec<Coord> { vec![Coord::new(0, 0)] }
}
