//! iPEPS and CTMRG environments built from block-sparse abelian tensors.
//!
//! The on-site tensors carry the leg signatures
//!
//! ```text
//!            u (+)
//!            |
//!   (+) l -- A -- r (-)        A[s, u, l, d, r]
//!           /|
//!      (-) s d (-)
//! ```
//!
//! so that every bond joins an outgoing and an incoming leg. Environments are
//! initialized with the same builders as the dense ones, and are brought to
//! dense form with [`EnvAbelian::to_dense`] for the CTMRG engine and the
//! reduced density matrices. Legs of different tensors joined by a χ bond can
//! carry different sets of sectors, so conversion first merges the sectors of
//! all legs joined (directly or through a chain of bonds) into a single layout.

use std::{ collections::BTreeMap, fmt };
use ndarray as nd;
use rand::Rng;
use rustc_hash::FxHashMap;
use crate::{
    Elem,
    block::{ BlockTensor, Leg, Symmetry },
    config::{ EnvInit, GlobalArgs },
    env::{ Env, EnvError, EnvResult, EnvTensors, tensors_from_sites },
    lattice::{ Coord, CornerDir, EdgeDir },
    state::{ IPEPS, StateError, StateResult, Tiling, Wavefunction },
    tn::{ self, Backend, TnError },
};

/// Block-sparse iPEPS on an arbitrary unit cell.
#[derive(Clone, Debug)]
pub struct IPEPSAbelian<A> {
    pub(crate) sites: BTreeMap<Coord, BlockTensor<A>>,
    pub(crate) tiling: Tiling,
}

impl<A> IPEPSAbelian<A>
where A: Elem
{
    /// Create a new state, checking that the tiling folds every site onto
    /// itself, that all tensors have rank 5 and the same symmetry, and that
    /// the legs of neighboring tensors can be joined.
    pub fn new(sites: BTreeMap<Coord, BlockTensor<A>>, tiling: Tiling)
        -> StateResult<Self>
    {
        let Some(first) = sites.values().next() else {
            return Err(StateError::EmptyCell);
        };
        if tiling.is_empty() { return Err(StateError::EmptyCell); }
        let sym = first.sym();
        for (c, a) in sites.iter() {
            if a.rank() != 5 { return Err(StateError::SiteRank(*c, a.rank())); }
            if tiling.fold(*c) != *c { return Err(StateError::TilingMismatch(*c)); }
            if a.sym() != sym {
                let err: TnError = crate::block::BlockError::SymmetryMismatch(sym, a.sym()).into();
                return Err(err.into());
            }
        }
        for (c, a) in sites.iter() {
            for dir in [EdgeDir::Right, EdgeDir::Down] {
                let n = tiling.fold(*c + dir.vec());
                let Some(b) = sites.get(&n) else {
                    return Err(StateError::TilingMismatch(n));
                };
                let (ka, kb) = match dir {
                    EdgeDir::Right => (4, 2),
                    _ => (3, 1),
                };
                let joined
                    = a.leg(ka).zip(b.leg(kb))
                    .is_some_and(|(la, lb)| *la == lb.flipped());
                if !joined { return Err(StateError::BondMismatch(*c, n)); }
            }
        }
        Ok(Self { sites, tiling })
    }

    /// Create a state with random blocks of total charge `n` on every site of
    /// an enumerable tiling. `phys` is the physical leg; every auxiliary leg
    /// carries the sectors `bond`.
    pub fn random<R>(
        sym: Symmetry,
        phys: Leg,
        bond: &[(i32, usize)],
        n: i32,
        tiling: Tiling,
        rng: &mut R,
    ) -> StateResult<Self>
    where R: Rng + ?Sized
    {
        let cell = tiling.cell().ok_or(StateError::EmptyCell)?;
        let aux = |sig: i8| -> StateResult<Leg> {
            Leg::new(sig, bond).map_err(|e| StateError::Tensor(e.into()))
        };
        let legs = vec![phys, aux(1)?, aux(1)?, aux(-1)?, aux(-1)?];
        let sites: BTreeMap<Coord, BlockTensor<A>>
            = cell.into_iter()
            .map(|c| {
                BlockTensor::random(sym, legs.clone(), n, &mut *rng)
                    .map(|a| (c, a))
                    .map_err(|e| StateError::Tensor(e.into()))
            })
            .collect::<StateResult<_>>()?;
        Self::new(sites, tiling)
    }

    pub fn tiling(&self) -> &Tiling { &self.tiling }

    /// Dense iPEPS with the same tiling.
    pub fn to_dense(&self) -> StateResult<IPEPS<A>> {
        let sites: BTreeMap<Coord, nd::ArrayD<A>>
            = self.sites.iter()
            .map(|(c, a)| Ok((*c, a.to_dense()?)))
            .collect::<StateResult<_>>()?;
        IPEPS::new(sites, self.tiling.clone())
    }
}

impl<A> Wavefunction for IPEPSAbelian<A>
where A: Elem
{
    type Tensor = BlockTensor<A>;

    fn vertex_to_site(&self, coord: Coord) -> Coord { self.tiling.fold(coord) }

    fn site(&self, coord: Coord) -> Option<&BlockTensor<A>> {
        self.sites.get(&self.tiling.fold(coord))
    }

    fn vertices(&self) -> Vec<Coord> { self.sites.keys().copied().collect() }
}

/// Block-sparse CTMRG environment, with the same leg conventions as
/// [`Env`].
#[derive(Clone)]
pub struct EnvAbelian<A> {
    pub(crate) chi: usize,
    pub(crate) c: FxHashMap<(Coord, CornerDir), BlockTensor<A>>,
    pub(crate) t: FxHashMap<(Coord, EdgeDir), BlockTensor<A>>,
    pub(crate) global: GlobalArgs,
}

impl<A> fmt::Debug for EnvAbelian<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvAbelian")
            .field("chi", &self.chi)
            .field("corners", &self.c.len())
            .field("edges", &self.t.len())
            .field("global", &self.global)
            .finish()
    }
}

// a χ leg of some environment tensor
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum Slot {
    C(Coord, CornerDir, usize),
    T(Coord, EdgeDir, usize),
}

// disjoint sets of χ legs joined by bonds
#[derive(Default)]
struct Joins {
    index: FxHashMap<Slot, usize>,
    parent: Vec<usize>,
}

impl Joins {
    fn id(&mut self, slot: Slot) -> usize {
        let n = self.parent.len();
        let k = *self.index.entry(slot).or_insert(n);
        if k == n { self.parent.push(n); }
        k
    }

    fn find(&mut self, mut k: usize) -> usize {
        while self.parent[k] != k {
            self.parent[k] = self.parent[self.parent[k]];
            k = self.parent[k];
        }
        k
    }

    fn join(&mut self, a: Slot, b: Slot) {
        let (ka, kb) = (self.id(a), self.id(b));
        let (ra, rb) = (self.find(ka), self.find(kb));
        if ra != rb { self.parent[rb] = ra; }
    }

    fn root(&mut self, slot: Slot) -> usize {
        let k = self.id(slot);
        self.find(k)
    }
}

// χ axes of an edge tensor
fn edge_chi_axes(dir: EdgeDir) -> [usize; 2] {
    match dir {
        EdgeDir::Up | EdgeDir::Right => [0, 2],
        EdgeDir::Left => [0, 1],
        EdgeDir::Down => [1, 2],
    }
}

impl<A> EnvAbelian<A>
where A: Elem
{
    /// Create a new, empty environment with bond dimension `chi`.
    pub fn new(chi: usize) -> Self {
        let global = GlobalArgs { dtype: A::DTYPE, ..GlobalArgs::default() };
        Self::with_global(chi, global)
    }

    pub fn with_global(chi: usize, global: GlobalArgs) -> Self {
        Self { chi, c: FxHashMap::default(), t: FxHashMap::default(), global }
    }

    pub fn chi(&self) -> usize { self.chi }

    pub fn global(&self) -> GlobalArgs { self.global }

    pub fn c(&self, coord: Coord, dir: CornerDir) -> EnvResult<&BlockTensor<A>> {
        self.c.get(&(coord, dir)).ok_or(EnvError::MissingCorner { coord, dir })
    }

    pub fn t(&self, coord: Coord, dir: EdgeDir) -> EnvResult<&BlockTensor<A>> {
        self.t.get(&(coord, dir)).ok_or(EnvError::MissingEdge { coord, dir })
    }

    /// Growing χ requires new sectors whose content is not determined by the
    /// current tensors, so this always fails.
    pub fn extend(&self, _new_chi: usize) -> EnvResult<Self> {
        Err(EnvError::NotImplemented("extend".to_string()))
    }

    /// Convert to a dense environment for `state`.
    ///
    /// The sectors of all legs joined by χ bonds (within the environment of a
    /// site, and between neighboring sites of the unit cell) are merged into
    /// one dense layout per group. The `D²` legs of the edge tensors are
    /// split, densified in the layout of the on-site tensors, and fused again
    /// with the ket index major. The result has bond dimension
    /// `max(χ, largest merged leg)`; a warning is logged when this exceeds χ.
    pub fn to_dense(&self, state: &IPEPSAbelian<A>) -> EnvResult<Env<A>> {
        let mut joins = Joins::default();
        for c in state.vertices() {
            use Slot::{ C, T };
            joins.join(C(c, CornerDir::LeftUp, 1), T(c, EdgeDir::Up, 0));
            joins.join(T(c, EdgeDir::Up, 2), C(c, CornerDir::RightUp, 0));
            joins.join(C(c, CornerDir::RightUp, 1), T(c, EdgeDir::Right, 0));
            joins.join(T(c, EdgeDir::Right, 2), C(c, CornerDir::RightDown, 0));
            joins.join(C(c, CornerDir::RightDown, 1), T(c, EdgeDir::Down, 2));
            joins.join(T(c, EdgeDir::Down, 1), C(c, CornerDir::LeftDown, 1));
            joins.join(C(c, CornerDir::LeftDown, 0), T(c, EdgeDir::Left, 1));
            joins.join(T(c, EdgeDir::Left, 0), C(c, CornerDir::LeftUp, 0));

            let cx = state.vertex_to_site(c + Coord::new(1, 0));
            let cy = state.vertex_to_site(c + Coord::new(0, 1));
            joins.join(T(c, EdgeDir::Up, 2), T(cx, EdgeDir::Up, 0));
            joins.join(T(c, EdgeDir::Down, 2), T(cx, EdgeDir::Down, 1));
            joins.join(T(c, EdgeDir::Left, 1), T(cy, EdgeDir::Left, 0));
            joins.join(T(c, EdgeDir::Right, 2), T(cy, EdgeDir::Right, 0));
        }

        // merged leg for every group
        let mut merged: FxHashMap<usize, Leg> = FxHashMap::default();
        let mut merge = |root: usize, leg: &Leg| -> EnvResult<()> {
            let new = match merged.get(&root) {
                Some(m) => m.union(leg).map_err(TnError::from)?,
                None => leg.union(leg).map_err(TnError::from)?,
            };
            merged.insert(root, new);
            Ok(())
        };
        for ((c, dir), tens) in self.c.iter() {
            for axis in [0, 1] {
                let root = joins.root(Slot::C(*c, *dir, axis));
                merge(root, tens.leg(axis).ok_or(TnError::BadAxes(vec![axis]))?)?;
            }
        }
        for ((c, dir), tens) in self.t.iter() {
            for axis in edge_chi_axes(*dir) {
                let root = joins.root(Slot::T(*c, *dir, axis));
                merge(root, tens.leg(axis).ok_or(TnError::BadAxes(vec![axis]))?)?;
            }
        }
        let max_chi
            = merged.values().map(|l| l.dim()).max().unwrap_or(0).max(self.chi);
        if max_chi > self.chi {
            log::warn!(
                "dense environment needs chi = {max_chi}, larger than the nominal chi = {}",
                self.chi,
            );
        }

        let mut tensors: EnvTensors<nd::ArrayD<A>> = EnvTensors::default();
        for ((c, dir), tens) in self.c.iter() {
            let legs: Vec<Leg>
                = [0, 1].into_iter()
                .map(|axis| {
                    let root = joins.root(Slot::C(*c, *dir, axis));
                    merged.get(&root).cloned()
                        .ok_or(EnvError::MissingCorner { coord: *c, dir: *dir })
                })
                .collect::<EnvResult<_>>()?;
            let dense = tens.to_dense_with(&legs).map_err(TnError::from)?;
            tensors.c.insert((*c, *dir), dense);
        }
        for ((c, dir), tens) in self.t.iter() {
            let aux = crate::env::edge_aux_axis(*dir);
            let split = tens.unfuse(aux).map_err(TnError::from)?;
            let mut legs: Vec<Leg> = Vec::with_capacity(4);
            for axis in 0..3 {
                if axis == aux {
                    split.legs()[aux..aux + 2].iter()
                        .for_each(|l| legs.push(l.clone()));
                } else {
                    let root = joins.root(Slot::T(*c, *dir, axis));
                    let leg = merged.get(&root).cloned()
                        .ok_or(EnvError::MissingEdge { coord: *c, dir: *dir })?;
                    legs.push(leg);
                }
            }
            let dense = split.to_dense_with(&legs).map_err(TnError::from)?;
            let groups: [usize; 3] = match dir {
                EdgeDir::Up | EdgeDir::Right => [1, 2, 1],
                EdgeDir::Left => [1, 1, 2],
                EdgeDir::Down => [2, 1, 1],
            };
            tensors.t.insert((*c, *dir), tn::fuse(&dense, &groups)?);
        }
        let mut env = Env::from_tensors(max_chi, tensors)?;
        env.global = self.global;
        Ok(env)
    }
}

/// Populate a block-sparse environment for `state` using the given method.
///
/// Only [`EnvInit::Ctmrg`] is supported.
pub fn init_env<A>(state: &IPEPSAbelian<A>, env: &mut EnvAbelian<A>, method: EnvInit)
    -> EnvResult<()>
where A: Elem
{
    if env.global.dtype != A::DTYPE {
        return Err(EnvError::DTypeMismatch { config: env.global.dtype, elem: A::DTYPE });
    }
    match method {
        EnvInit::Ctmrg => {
            let tensors = tensors_from_sites(state)?;
            env.c = tensors.c;
            env.t = tensors.t;
            log::debug!(
                "initialized block-sparse environment with chi = {} for {} sites",
                env.chi,
                state.vertices().len(),
            );
            Ok(())
        },
        other => Err(EnvError::NotImplemented(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{
        config::DType,
        env::init_env as init_env_dense,
        rdm::{ self, RdmOpts },
    };

    fn u1_state(tiling: Tiling, seed: u64) -> IPEPSAbelian<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let phys = Leg::new(-1, &[(0, 1), (1, 1)]).unwrap();
        IPEPSAbelian::random(Symmetry::U1, phys, &[(0, 1), (1, 1)], 0, tiling, &mut rng)
            .unwrap()
    }

    #[test]
    fn state_checks_bonds() {
        let state = u1_state(Tiling::Rect { lx: 2, ly: 1 }, 1);
        assert_eq!(state.vertices().len(), 2);
        let dense = state.to_dense().unwrap();
        assert_eq!(dense.max_bond_dim(), 2);

        let mut rng = StdRng::seed_from_u64(2);
        let phys = Leg::new(-1, &[(0, 1), (1, 1)]).unwrap();
        let aux = Leg::new(1, &[(0, 1), (1, 1)]).unwrap();
        // right and down legs with the wrong signature
        let legs = vec![phys, aux.clone(), aux.clone(), aux.clone(), aux];
        let a: BlockTensor<f64>
            = BlockTensor::random(Symmetry::U1, legs, 1, &mut rng).unwrap();
        let sites: BTreeMap<Coord, BlockTensor<f64>>
            = [(Coord::new(0, 0), a)].into_iter().collect();
        assert!(matches!(
            IPEPSAbelian::new(sites, Tiling::Rect { lx: 1, ly: 1 }),
            Err(StateError::BondMismatch(..)),
        ));

        let sites = state.sites.clone();
        assert!(matches!(
            IPEPSAbelian::new(sites, Tiling::Rect { lx: 0, ly: 1 }),
            Err(StateError::EmptyCell),
        ));
    }

    #[test]
    fn dense_conversion_reproduces_dense_environment() {
        let state = u1_state(Tiling::Rect { lx: 2, ly: 1 }, 10546);
        let mut env: EnvAbelian<f64> = EnvAbelian::new(4);
        init_env(&state, &mut env, EnvInit::Ctmrg).unwrap();
        assert_eq!(env.c.len(), 8);
        let c0 = Coord::new(0, 0);
        assert_eq!(env.c(c0, CornerDir::LeftUp).unwrap().charge(), 0);
        assert!(env.t(c0, EdgeDir::Up).unwrap().leg(1).unwrap().is_fused());
        let converted = env.clone().to_dense(&state).unwrap();
        assert_eq!(converted.chi(), 4);

        let dense_state = state.to_dense().unwrap();
        let mut dense_env: Env<f64> = Env::new(4);
        init_env_dense(&dense_state, &mut dense_env, EnvInit::Ctmrg).unwrap();
        for c in [c0, Coord::new(1, 0)] {
            let r_block = rdm::rdm1x1(c, &dense_state, &converted, RdmOpts::default()).unwrap();
            let r_dense = rdm::rdm1x1(c, &dense_state, &dense_env, RdmOpts::default()).unwrap();
            assert!(tn::max_abs(&(r_block - r_dense)) < 1e-10);
        }
        let r_block = rdm::rdm2x1(c0, &dense_state, &converted, RdmOpts::default()).unwrap();
        let r_dense = rdm::rdm2x1(c0, &dense_state, &dense_env, RdmOpts::default()).unwrap();
        assert!(tn::max_abs(&(r_block - r_dense)) < 1e-10);
    }

    #[test]
    fn small_chi_is_raised_on_conversion() {
        let state = u1_state(Tiling::Rect { lx: 1, ly: 1 }, 3);
        let mut env: EnvAbelian<f64> = EnvAbelian::new(2);
        init_env(&state, &mut env, EnvInit::Ctmrg).unwrap();
        let converted = env.to_dense(&state).unwrap();
        assert_eq!(converted.chi(), 4);
        assert!(matches!(env.extend(8), Err(EnvError::NotImplemented(_))));
        assert!(matches!(
            init_env(&state, &mut env, EnvInit::Random),
            Err(EnvError::NotImplemented(_)),
        ));
        let global = GlobalArgs { dtype: DType::C64, ..GlobalArgs::default() };
        let mut env: EnvAbelian<f64> = EnvAbelian::with_global(4, global);
        assert!(matches!(
            init_env(&state, &mut env, EnvInit::Ctmrg),
            Err(EnvError::DTypeMismatch { .. }),
        ));
    }
}
