//! Enlarged corners and half-row/half-column pieces of the environment.
//!
//! An enlarged corner absorbs one site into a corner matrix together with the
//! two adjacent edge tensors. For the upper-left one:
//!
//! ```text
//!   C(-1,-1) -- T(0,-1) -- (j)          LU[(i), (j)]
//!      |           |                      i = (χ of T(-1,0), D² of a down)
//!   T(-1,0) ---    a    -- (j)            j = (χ of T(0,-1), D² of a right)
//!      |           |
//!     (i)         (i)
//! ```
//!
//! Every enlarged corner is returned as a matrix over two fused legs, each
//! combining a χ leg (major) and a `D²` leg (minor), ordered clockwise around
//! the 2x2 plaquette so that `LU · RU · RD · LD` closes into a loop:
//!
//! | corner | rows                    | columns                |
//! |--------|-------------------------|------------------------|
//! | LU     | down of T(-1,0), a      | right of T(0,-1), a    |
//! | RU     | left of T(0,-1), a      | down of T(1,0), a      |
//! | RD     | up of T(1,0), a         | left of T(0,1), a      |
//! | LD     | right of T(0,1), a      | up of T(-1,0), a       |
//!
//! When the doubled tensor is passed with open physical legs (rank 6), the
//! result keeps them as two trailing axes `(s, s')`.

use ndarray as nd;
use crate::{
    Elem,
    env::SiteEnv,
    tn::{ self, TnError, TnResult, contract, fuse },
};

fn groups(a: &nd::ArrayD<impl Elem>) -> TnResult<&'static [usize]> {
    match a.ndim() {
        4 => Ok(&[2, 2]),
        6 => Ok(&[2, 2, 1, 1]),
        _ => Err(TnError::RankMismatch { expected: 4, shape: a.shape().to_vec() }),
    }
}

fn pick<'a>(a: &nd::ArrayD<impl Elem>, closed: &'a str, open: &'a str) -> &'a str {
    if a.ndim() == 6 { open } else { closed }
}

/// Upper-left enlarged corner.
pub fn c2x2_lu<A>(env: &SiteEnv<'_, A>, a: &nd::ArrayD<A>) -> TnResult<nd::ArrayD<A>>
where A: Elem
{
    let g = groups(a)?;
    let x = contract("ab,bcd->acd", env.c_lu, env.t_u)?;
    let x = contract("acd,aef->cdef", &x, env.t_l)?;
    let x = contract(pick(a, "cdef,cfgh->egdh", "cdef,cfghst->egdhst"), &x, a)?;
    fuse(&x, g)
}

/// Upper-left enlarged corner absorbing the ket and bra layers of the on-site
/// tensor `a` (`[s, u, l, d, r]`) one after the other, so that the doubled
/// tensor is never formed. With `open`, the physical legs of ket and bra are
/// kept as trailing axes `(s, s')`.
pub fn c2x2_lu_sl<A>(env: &SiteEnv<'_, A>, a: &nd::ArrayD<A>, open: bool)
    -> TnResult<nd::ArrayD<A>>
where A: Elem
{
    if a.ndim() != 5 {
        return Err(TnError::RankMismatch { expected: 5, shape: a.shape().to_vec() });
    }
    let (du, dl) = (a.shape()[1], a.shape()[2]);
    let x = contract("ab,bcd->acd", env.c_lu, env.t_u)?;
    let x = contract("acd,aef->cdef", &x, env.t_l)?;
    let sh = x.shape().to_vec();
    let x = tn::reshape(&x, &[du, du, sh[1], sh[2], dl, dl])?;
    let x = contract("uUdelL,sulgh->UdeLsgh", &x, a)?;
    let a_bra = tn::conj(a);
    if open {
        let x = contract("UdeLsgh,tULGH->egGdhHst", &x, &a_bra)?;
        fuse(&x, &[3, 3, 1, 1])
    } else {
        let x = contract("UdeLsgh,sULGH->egGdhH", &x, &a_bra)?;
        fuse(&x, &[3, 3])
    }
}

/// Upper-right enlarged corner.
pub fn c2x2_ru<A>(env: &SiteEnv<'_, A>, a: &nd::ArrayD<A>) -> TnResult<nd::ArrayD<A>>
where A: Elem
{
    let g = groups(a)?;
    let x = contract("ab,cda->bcd", env.c_ru, env.t_u)?;
    let x = contract("bcd,bef->cdef", &x, env.t_r)?;
    let x = contract(pick(a, "cdef,dghe->cgfh", "cdef,dghest->cgfhst"), &x, a)?;
    fuse(&x, g)
}

/// Lower-right enlarged corner.
pub fn c2x2_rd<A>(env: &SiteEnv<'_, A>, a: &nd::ArrayD<A>) -> TnResult<nd::ArrayD<A>>
where A: Elem
{
    let g = groups(a)?;
    let x = contract("ab,cda->bcd", env.c_rd, env.t_r)?;
    let x = contract("bcd,efb->cdef", &x, env.t_d)?;
    let x = contract(pick(a, "cdef,ghed->cgfh", "cdef,ghedst->cgfhst"), &x, a)?;
    fuse(&x, g)
}

/// Lower-left enlarged corner.
pub fn c2x2_ld<A>(env: &SiteEnv<'_, A>, a: &nd::ArrayD<A>) -> TnResult<nd::ArrayD<A>>
where A: Elem
{
    let g = groups(a)?;
    let x = contract("ab,cad->bcd", env.c_ld, env.t_l)?;
    let x = contract("bcd,ebf->cdef", &x, env.t_d)?;
    let x = contract(pick(a, "cdef,gdeh->fhcg", "cdef,gdehst->fhcgst"), &x, a)?;
    fuse(&x, g)
}

/// `C(-1,1) T(0,1)`, as a matrix with rows (up of the corner, `D²` of the
/// edge) and columns the right leg of the edge.
pub fn c2x1_ld<A>(env: &SiteEnv<'_, A>) -> TnResult<nd::ArrayD<A>>
where A: Elem
{
    fuse(&contract("ab,cbd->acd", env.c_ld, env.t_d)?, &[2, 1])
}

/// `T(0,1) C(1,1)`, as a matrix with rows (up of the corner, `D²` of the edge)
/// and columns the left leg of the edge.
pub fn c2x1_rd<A>(env: &SiteEnv<'_, A>) -> TnResult<nd::ArrayD<A>>
where A: Elem
{
    fuse(&contract("ab,cdb->acd", env.c_rd, env.t_d)?, &[2, 1])
}

/// `C(1,-1)` over `T(1,0)`, as a matrix with rows (left of the corner, `D²`
/// of the edge) and columns the down leg of the edge.
pub fn c1x2_ru<A>(env: &SiteEnv<'_, A>) -> TnResult<nd::ArrayD<A>>
where A: Elem
{
    fuse(&contract("ab,bcd->acd", env.c_ru, env.t_r)?, &[2, 1])
}

/// `T(1,0)` over `C(1,1)`, as a matrix with rows (left of the corner, `D²` of
/// the edge) and columns the up leg of the edge.
pub fn c1x2_rd<A>(env: &SiteEnv<'_, A>) -> TnResult<nd::ArrayD<A>>
where A: Elem
{
    fuse(&contract("ab,cda->bdc", env.c_rd, env.t_r)?, &[2, 1])
}

/// The ring of eight environment tensors around a site with its four `D²`
/// legs left open, ordered `[up, left, down, right]`.
pub fn site_ring<A>(env: &SiteEnv<'_, A>) -> TnResult<nd::ArrayD<A>>
where A: Elem
{
    let x = contract("ab,bcd->acd", env.c_lu, env.t_u)?;
    let x = contract("acd,de->ace", &x, env.c_ru)?;
    let x = contract("ace,efg->acfg", &x, env.t_r)?;
    let x = contract("acfg,gh->acfh", &x, env.c_rd)?;
    let x = contract("acfh,ijh->acfij", &x, env.t_d)?;
    let x = contract("acfij,kj->acfik", &x, env.c_ld)?;
    contract("acfik,akl->clif", &x, env.t_l)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{
        config::EnvInit,
        env::{ Env, init_env },
        lattice::Coord,
        state::{ IPEPS, Tiling, Wavefunction },
        tn::{ self, double_layer, double_layer_open },
    };

    fn loop_value(env: &Env<f64>, state: &IPEPS<f64>) -> f64 {
        let c = Coord::new(0, 0);
        let se = env.site_env(c).unwrap();
        let a = double_layer(state.site(c).unwrap()).unwrap();
        let lu = tn::to_matrix(&c2x2_lu(&se, &a).unwrap(), 1).unwrap();
        let ru = tn::to_matrix(&c2x2_ru(&se, &a).unwrap(), 1).unwrap();
        let rd = tn::to_matrix(&c2x2_rd(&se, &a).unwrap(), 1).unwrap();
        let ld = tn::to_matrix(&c2x2_ld(&se, &a).unwrap(), 1).unwrap();
        tn::trace(&lu.dot(&ru).dot(&rd).dot(&ld))
    }

    #[test]
    fn enlarged_corner_open_legs_trace_to_closed() {
        let mut rng = StdRng::seed_from_u64(10546);
        let state: IPEPS<f64>
            = IPEPS::random(2, 2, Tiling::Rect { lx: 1, ly: 1 }, &mut rng).unwrap();
        let mut env: Env<f64> = Env::new(4);
        init_env(&state, &mut env, EnvInit::Ctmrg).unwrap();
        let c = Coord::new(0, 0);
        let se = env.site_env(c).unwrap();
        let a = double_layer(state.site(c).unwrap()).unwrap();
        let lu = c2x2_lu(&se, &a).unwrap();
        assert_eq!(lu.shape(), &[16, 16]);
        let z = loop_value(&env, &state);
        assert!(z.is_finite() && z.abs() > 0.0);

        let ao = double_layer_open(state.site(c).unwrap()).unwrap();
        let luo = c2x2_lu(&se, &ao).unwrap();
        assert_eq!(luo.shape(), &[16, 16, 2, 2]);
        let traced = luo.index_axis(nd::Axis(3), 0).index_axis(nd::Axis(2), 0).to_owned()
            + luo.index_axis(nd::Axis(3), 1).index_axis(nd::Axis(2), 1);
        traced.iter().zip(lu.iter())
            .for_each(|(x, y)| assert!((x - y).abs() < 1e-12));
    }

    #[test]
    fn ring_contracts_with_site() {
        let mut rng = StdRng::seed_from_u64(3);
        let state: IPEPS<f64>
            = IPEPS::random(2, 2, Tiling::Rect { lx: 1, ly: 1 }, &mut rng).unwrap();
        let mut env: Env<f64> = Env::new(3);
        init_env(&state, &mut env, EnvInit::Ctmrg).unwrap();
        let c = Coord::new(0, 0);
        let se = env.site_env(c).unwrap();
        let a = double_layer(state.site(c).unwrap()).unwrap();
        let ring = site_ring(&se).unwrap();
        let z = contract("abcd,abcd->", &ring, &a).unwrap();
        assert_eq!(z.ndim(), 0);
        let manual: f64 = ring.iter().zip(a.iter()).map(|(x, y)| x * y).sum();
        assert!((z.sum() - manual).abs() < 1e-10 * manual.abs().max(1.0));
        assert_eq!(c2x1_ld(&se).unwrap().shape(), &[12, 3]);
        assert_eq!(c1x2_rd(&se).unwrap().shape(), &[12, 3]);
    }

    #[test]
    fn single_layer_corner_matches_double_layer() {
        let mut rng = StdRng::seed_from_u64(99);
        let state: IPEPS<f64>
            = IPEPS::random(2, 3, Tiling::Rect { lx: 1, ly: 1 }, &mut rng).unwrap();
        let mut env: Env<f64> = Env::new(5);
        init_env(&state, &mut env, EnvInit::Ctmrg).unwrap();
        let c = Coord::new(0, 0);
        let se = env.site_env(c).unwrap();
        let site = state.site(c).unwrap();
        let dl = c2x2_lu(&se, &double_layer(site).unwrap()).unwrap();
        let sl = c2x2_lu_sl(&se, site, false).unwrap();
        assert_eq!(sl.shape(), dl.shape());
        assert!(tn::max_abs(&(&sl - &dl)) < 1e-10 * tn::max_abs(&dl));
        let dlo = c2x2_lu(&se, &double_layer_open(site).unwrap()).unwrap();
        let slo = c2x2_lu_sl(&se, site, true).unwrap();
        assert_eq!(slo.shape(), &[45, 45, 2, 2]);
        assert!(tn::max_abs(&(&slo - &dlo)) < 1e-10 * tn::max_abs(&dlo));
    }
}
