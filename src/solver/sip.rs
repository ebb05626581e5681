//! Inverse (SIP) polynomial fit.
//!
//! After the joint solve converges, each observation's approximate
//! pre-image `(U, V) = CD⁻¹ · (ξ, η)` is computed, and two decoupled
//! `ncoeff × ncoeff` systems are solved for the corrections that carry the
//! linear pre-image back to the measured focal-plane position:
//!
//! ```text
//! Σ ap_k U^x V^y = u − U        Σ bp_k U^x V^y = v − V
//! ```

use tracing::debug;

use crate::coeff::Coeff;
use crate::error::FitError;
use crate::obs::Obs;
use crate::poly::Poly;
use crate::solver::linear::{alloc_system, solve_system};

/// Fill `(u_lin, v_lin)` with the CD-inverse pre-image of the
/// tangent-plane position, for the observations of `c`'s exposure.
pub(crate) fn set_linear_preimage(obs: &mut [Obs], c: &Coeff) {
    for o in obs.iter_mut().filter(|o| o.iexp == c.iexp) {
        let (u_lin, v_lin) = c.linear_preimage(o.xi, o.eta);
        o.u_lin = u_lin;
        o.v_lin = v_lin;
    }
}

/// Fit the inverse polynomial of one exposure from its good observations.
///
/// Updates `c.ap` and `c.bp` in place.
pub(crate) fn solve_inverse_poly(
    obs: &[Obs],
    sel: &[usize],
    poly: &Poly,
    c: &mut Coeff,
) -> Result<(), FitError> {
    let n = poly.ncoeff;
    let (mut ma, mut ba) = alloc_system(n)?;
    let (mut mb, mut bb) = alloc_system(n)?;
    let mut pu = vec![0.0; n];
    let mut pv = vec![0.0; n];

    let mut ngood = 0usize;
    for &idx in sel {
        let o = &obs[idx];
        if !o.good {
            continue;
        }
        ngood += 1;
        poly.fill_powers(o.u_lin, o.v_lin, &mut pu, &mut pv);
        for j in 0..n {
            let pj = pu[j] * pv[j];
            ba[j] += (o.u - o.u_lin) * pj;
            bb[j] += (o.v - o.v_lin) * pj;
            for i in 0..n {
                let pi = pu[i] * pv[i];
                ma[(i, j)] += pj * pi;
                mb[(i, j)] += pj * pi;
            }
        }
    }
    debug!("inverse-polynomial fit for exposure {}: {ngood} rows", c.iexp);

    let sol_a = solve_system(ma, ba)?;
    let sol_b = solve_system(mb, bb)?;
    for k in 0..n {
        c.ap[k] = sol_a[k];
        c.bp[k] = sol_b[k];
    }
    Ok(())
}
