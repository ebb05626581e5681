//! Per-exposure initial fit.
//!
//! Each exposure is fit separately against its catalog-matched observations
//! to seed the joint solve:
//!
//! 1. solve the over-determined system for the polynomial coefficients plus
//!    a small tangent-point correction `(dA, dD)`, reject outliers at
//!    `9σ²`, and solve once more;
//! 2. move the tangent point and refine with the focal-plane offset
//!    `(x0, y0)` as extra unknowns, linearizing `(u, v) → (u + x0, v + y0)`
//!    through the polynomial gradients;
//! 3. relocate the tangent point to the Jacobian-determinant peak (golden
//!    section in `u` and `v` alternately) and run the offset refinement
//!    twice more.

use std::sync::Arc;

use nalgebra::DVector;
use tracing::{debug, warn};

use crate::chip::{ChipSet, ExposureSet, ExpId};
use crate::coeff::Coeff;
use crate::error::FitError;
use crate::obs::Obs;
use crate::poly::Poly;
use crate::solver::linear::{alloc_system, solve_system};
use crate::tanplane::{inverse_gnomonic, D2R};

/// Solve for the polynomial coefficients and a tangent-point correction.
///
/// Unknowns: `[a_0..a_n, b_0..b_n, dA, dD]`, unweighted.
pub(crate) fn solve_for_coeff(
    obs: &[Obs],
    sel: &[usize],
    poly: &Poly,
) -> Result<DVector<f64>, FitError> {
    let n = poly.ncoeff;
    let size = 2 * n + 2;
    let (mut m, mut rhs) = alloc_system(size)?;
    let mut pu = vec![0.0; n];
    let mut pv = vec![0.0; n];

    for &idx in sel {
        let o = &obs[idx];
        if !o.good {
            continue;
        }
        poly.fill_powers(o.u, o.v, &mut pu, &mut pv);
        for j in 0..n {
            let pj = pu[j] * pv[j];
            rhs[j] += o.xi * pj;
            rhs[j + n] += o.eta * pj;
            for i in 0..n {
                let pi = pu[i] * pv[i];
                m[(i, j)] += pj * pi;
                m[(i + n, j + n)] += pj * pi;
            }
            m[(j, 2 * n)] -= pj * o.xi_a0;
            m[(j, 2 * n + 1)] -= pj * o.xi_d0;
            m[(j + n, 2 * n)] -= pj * o.eta_a0;
            m[(j + n, 2 * n + 1)] -= pj * o.eta_d0;
            m[(2 * n, j)] -= pj * o.xi_a0;
            m[(2 * n + 1, j)] -= pj * o.xi_d0;
            m[(2 * n, j + n)] -= pj * o.eta_a0;
            m[(2 * n + 1, j + n)] -= pj * o.eta_d0;
        }
        m[(2 * n, 2 * n)] += o.xi_a0 * o.xi_a0 + o.eta_a0 * o.eta_a0;
        m[(2 * n, 2 * n + 1)] += o.xi_a0 * o.xi_d0 + o.eta_a0 * o.eta_d0;
        m[(2 * n + 1, 2 * n)] += o.xi_a0 * o.xi_d0 + o.eta_a0 * o.eta_d0;
        m[(2 * n + 1, 2 * n + 1)] += o.xi_d0 * o.xi_d0 + o.eta_d0 * o.eta_d0;
        rhs[2 * n] -= o.xi * o.xi_a0 + o.eta * o.eta_a0;
        rhs[2 * n + 1] -= o.xi * o.xi_d0 + o.eta * o.eta_d0;
    }

    solve_system(m, rhs)
}

/// Chi-squared of the plain coefficient solve.
pub(crate) fn calc_chi_initial(obs: &[Obs], sel: &[usize], sol: &DVector<f64>, poly: &Poly) -> f64 {
    let n = poly.ncoeff;
    let mut chi2 = 0.0;
    for &idx in sel {
        let o = &obs[idx];
        if !o.good {
            continue;
        }
        let mut ax = o.xi;
        let mut ay = o.eta;
        for k in 0..n {
            let p = o.u.powi(poly.xorder(k)) * o.v.powi(poly.yorder(k));
            ax -= sol[k] * p;
            ay -= sol[k + n] * p;
        }
        ax += o.xi_a0 * sol[2 * n] + o.xi_d0 * sol[2 * n + 1];
        ay += o.eta_a0 * sol[2 * n] + o.eta_d0 * sol[2 * n + 1];
        chi2 += ax * ax + ay * ay;
    }
    chi2
}

/// Mark observations whose squared residual exceeds `e2` as bad.
pub(crate) fn flag_initial_outliers(
    obs: &mut [Obs],
    sel: &[usize],
    sol: &DVector<f64>,
    poly: &Poly,
    e2: f64,
) -> usize {
    let n = poly.ncoeff;
    let mut nrejected = 0;
    for &idx in sel {
        let o = &mut obs[idx];
        let mut fx = 0.0;
        let mut fy = 0.0;
        for k in 0..n {
            let p = o.u.powi(poly.xorder(k)) * o.v.powi(poly.yorder(k));
            fx += sol[k] * p;
            fy += sol[k + n] * p;
        }
        fx -= o.xi_a0 * sol[2 * n] + o.xi_d0 * sol[2 * n + 1];
        fy -= o.eta_a0 * sol[2 * n] + o.eta_d0 * sol[2 * n + 1];
        let r2 = (o.xi - fx).powi(2) + (o.eta - fy).powi(2);
        if r2 > e2 && o.good {
            o.good = false;
            nrejected += 1;
        }
    }
    nrejected
}

/// Refine the current solution with the focal-plane offset as unknowns.
///
/// Unknowns: `[da_0..da_n, db_0..db_n, dx0, dy0]`; the offset couples
/// through the polynomial gradients at each observation.
pub(crate) fn solve_for_coeff_with_offset(
    obs: &[Obs],
    sel: &[usize],
    c: &Coeff,
) -> Result<DVector<f64>, FitError> {
    let poly = &c.poly;
    let n = poly.ncoeff;
    let size = 2 * n + 2;
    let (mut m, mut rhs) = alloc_system(size)?;
    let mut pu = vec![0.0; n];
    let mut pv = vec![0.0; n];

    for &idx in sel {
        let o = &obs[idx];
        if !o.good {
            continue;
        }
        poly.fill_powers(o.u, o.v, &mut pu, &mut pv);
        let mut ax = o.xi;
        let mut ay = o.eta;
        let mut bx = 0.0;
        let mut by = 0.0;
        let mut cx = 0.0;
        let mut cy = 0.0;
        for k in 0..n {
            let xo = poly.xorder(k);
            let yo = poly.yorder(k);
            ax -= c.a[k] * pu[k] * pv[k];
            ay -= c.b[k] * pu[k] * pv[k];
            if xo >= 1 {
                let g = o.u.powi(xo - 1) * pv[k] * xo as f64;
                bx += c.a[k] * g;
                by += c.b[k] * g;
            }
            if yo >= 1 {
                let g = pu[k] * o.v.powi(yo - 1) * yo as f64;
                cx += c.a[k] * g;
                cy += c.b[k] * g;
            }
        }
        for k in 0..n {
            let pk = pu[k] * pv[k];
            rhs[k] += ax * pk;
            rhs[k + n] += ay * pk;
            for j in 0..n {
                let pj = pu[j] * pv[j];
                m[(j, k)] += pj * pk;
                m[(j + n, k + n)] += pj * pk;
            }
            m[(k, 2 * n)] += bx * pk;
            m[(k, 2 * n + 1)] += cx * pk;
            m[(k + n, 2 * n)] += by * pk;
            m[(k + n, 2 * n + 1)] += cy * pk;
            m[(2 * n, k)] += bx * pk;
            m[(2 * n + 1, k)] += cx * pk;
            m[(2 * n, k + n)] += by * pk;
            m[(2 * n + 1, k + n)] += cy * pk;
        }
        m[(2 * n, 2 * n)] += bx * bx + by * by;
        m[(2 * n, 2 * n + 1)] += bx * cx + by * cy;
        m[(2 * n + 1, 2 * n)] += cx * bx + cy * by;
        m[(2 * n + 1, 2 * n + 1)] += cx * cx + cy * cy;
        rhs[2 * n] += ax * bx + ay * by;
        rhs[2 * n + 1] += ax * cx + ay * cy;
    }

    solve_system(m, rhs)
}

/// Chi-squared of a full per-exposure solution against its observations.
pub(crate) fn calc_chi2_exposure(obs: &[Obs], sel: &[usize], c: &Coeff) -> f64 {
    let poly = &c.poly;
    let mut chi2 = 0.0;
    for &idx in sel {
        let o = &obs[idx];
        if !o.good {
            continue;
        }
        let (xi_fit, eta_fit) = c.uv_to_xieta(o.u, o.v);
        chi2 += (o.xi - xi_fit).powi(2) + (o.eta - eta_fit).powi(2);
    }
    chi2
}

// ── Tangent-point relocation ────────────────────────────────────────────────

/// Golden-section maximization of `f` on `[lo, hi]` to width 0.01.
fn golden_max<F: Fn(f64) -> f64>(f: F, lo: f64, hi: f64) -> f64 {
    let w = (3.0 - 5f64.sqrt()) / 2.0;
    let mut a = lo;
    let mut c = hi;
    let mut b = a * (1.0 - w) + c * w;
    let mut fb = f(b);
    loop {
        let x = if c - b > b - a {
            b * (1.0 - w) + c * w
        } else {
            a * (1.0 - w) + b * w
        };
        let fx = f(x);
        if c - b > b - a {
            if fx > fb {
                a = b;
                b = x;
                fb = fx;
            } else {
                c = x;
            }
        } else if fx > fb {
            c = b;
            b = x;
            fb = fx;
        } else {
            a = x;
        }
        if c - a < 0.01 {
            return b;
        }
    }
}

/// Move the tangent point to the focal-plane position where the Jacobian
/// determinant peaks.
///
/// Alternates golden-section searches in `u` and `v`, halving the search
/// window each outer iteration, until the outer step falls below 0.01
/// pixels in both axes or 20 iterations elapse. A candidate is only
/// accepted when it improves the determinant beyond rounding level: a flat
/// Jacobian carries machine-noise texture that must not move the tangent
/// point.
pub(crate) fn relocate_crval_to_detj_peak(c: &mut Coeff) {
    const MIN_GAIN: f64 = 1e-9;

    let mut u = 0.0f64;
    let mut v = 0.0f64;

    for i in 0..20 {
        let u_prev = u;
        let v_prev = v;
        let window = 3000.0 / 2f64.powi(i);

        let u_cand = golden_max(|x| c.det_j(x, v), u - window, u + window);
        if c.det_j(u_cand, v) > c.det_j(u, v) * (1.0 + MIN_GAIN) {
            u = u_cand;
        }
        let v_cand = golden_max(|x| c.det_j(u, x), v - window, v + window);
        if c.det_j(u, v_cand) > c.det_j(u, v) * (1.0 + MIN_GAIN) {
            v = v_cand;
        }

        if (u - u_prev).abs() < 0.01 && (v - v_prev).abs() < 0.01 {
            break;
        }
    }

    let (xi, eta) = c.uv_to_xieta(u, v);
    let (ra, dec) = inverse_gnomonic(xi * D2R, eta * D2R, c.crval_ra, c.crval_dec);
    c.crval_ra = ra;
    c.crval_dec = dec;
}

// ── Per-exposure driver ─────────────────────────────────────────────────────

/// Fit every exposure separately; the results seed the joint solve.
///
/// Observations must arrive with `(ξ, η)` computed against the exposure's
/// initial tangent point and `(u, v)` from the current chip placement.
/// Exposures with fewer good observations than unknowns are skipped with a
/// warning; their observations are excluded from the joint fit.
pub(crate) fn initial_fit(
    matches: &mut [Obs],
    exposures: &ExposureSet,
    chips: &ChipSet,
    poly: &Arc<Poly>,
) -> Result<Vec<(ExpId, Coeff)>, FitError> {
    let n = poly.ncoeff;
    let mut coeffs = Vec::with_capacity(exposures.len());

    for (iexp, origin) in exposures.iter() {
        let sel: Vec<usize> = matches
            .iter()
            .enumerate()
            .filter(|(_, o)| o.iexp == *iexp)
            .map(|(j, _)| j)
            .collect();
        let ngood = sel.iter().filter(|&&j| matches[j].good).count();

        let mut c = Coeff::new(poly.clone(), *iexp);
        c.crval_ra = origin.ra;
        c.crval_dec = origin.dec;

        if 2 * ngood < 2 * n + 2 {
            warn!(
                "exposure {iexp}: {ngood} good observations cannot constrain {} unknowns; \
                 excluded from the fit",
                2 * n + 2
            );
            for &j in &sel {
                matches[j].good = false;
            }
            coeffs.push((*iexp, c));
            continue;
        }

        // Plain solve, one rejection pass, solve again.
        let sol = solve_for_coeff(matches, &sel, poly)?;
        let chi2 = calc_chi_initial(matches, &sel, &sol, poly);
        debug!("exposure {iexp}: initial chi2 = {chi2:.6e}");
        let e2 = chi2 / sel.len() as f64;
        let nrej = flag_initial_outliers(matches, &sel, &sol, poly, 9.0 * e2);
        debug!("exposure {iexp}: rejected {nrej} observations");
        let sol = solve_for_coeff(matches, &sel, poly)?;
        debug!(
            "exposure {iexp}: refit chi2 = {:.6e}",
            calc_chi_initial(matches, &sel, &sol, poly)
        );

        for k in 0..n {
            c.a[k] = sol[k];
            c.b[k] = sol[k + n];
        }
        c.crval_ra = origin.ra + sol[2 * n];
        c.crval_dec = origin.dec + sol[2 * n + 1];

        for &j in &sel {
            matches[j].set_xi_eta(c.crval_ra, c.crval_dec);
        }

        // First offset refinement.
        apply_offset_refinement(matches, &sel, chips, &mut c)?;
        debug!(
            "exposure {iexp}: chi2 after offset = {:.6e}",
            calc_chi2_exposure(matches, &sel, &c)
        );

        // Re-center on the Jacobian peak, then refine twice more.
        relocate_crval_to_detj_peak(&mut c);
        for &j in &sel {
            matches[j].set_xi_eta(c.crval_ra, c.crval_dec);
        }
        for _ in 0..2 {
            apply_offset_refinement(matches, &sel, chips, &mut c)?;
            debug!(
                "exposure {iexp}: chi2 after offset = {:.6e}",
                calc_chi2_exposure(matches, &sel, &c)
            );
        }

        coeffs.push((*iexp, c));
    }

    Ok(coeffs)
}

fn apply_offset_refinement(
    matches: &mut [Obs],
    sel: &[usize],
    chips: &ChipSet,
    c: &mut Coeff,
) -> Result<(), FitError> {
    let n = c.poly.ncoeff;
    let sol = solve_for_coeff_with_offset(matches, sel, c)?;
    for k in 0..n {
        c.a[k] += sol[k];
        c.b[k] += sol[k + n];
    }
    c.x0 += sol[2 * n];
    c.y0 += sol[2 * n + 1];
    for &j in sel {
        let chip = chips.by_index(matches[j].jchip);
        matches[j].set_uv(chip, c.x0, c.y0);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_golden_max_parabola() {
        let peak = golden_max(|x| -(x - 3.7).powi(2), -100.0, 100.0);
        assert!((peak - 3.7).abs() < 0.01);
    }

    #[test]
    fn test_relocation_stays_put_on_flat_jacobian() {
        let poly = Arc::new(Poly::new(2));
        let mut c = Coeff::new(poly, ExpId(0));
        c.a[0] = 1.0;
        c.b[1] = 1.0;
        c.crval_ra = 0.5;
        c.crval_dec = -0.2;
        relocate_crval_to_detj_peak(&mut c);
        assert!((c.crval_ra - 0.5).abs() < 1e-12);
        assert!((c.crval_dec + 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_relocation_finds_quadratic_peak() {
        // det J of xi = u + eps*u^2 peaks where the quadratic gradient
        // cancels; build a plate whose determinant grows toward +u so the
        // search must move off the origin.
        let poly = Arc::new(Poly::new(2));
        let mut c = Coeff::new(poly, ExpId(0));
        c.a[0] = 1e-4;
        c.b[1] = 1e-4;
        // dxi/du = 1e-4 + 2*eps*u: the determinant increases toward +u, so
        // the peak sits at the +window edge of the first search.
        c.a[2] = 1e-10;
        let before = c.det_j(0.0, 0.0);
        relocate_crval_to_detj_peak(&mut c);
        // The tangent point moved toward larger determinant.
        assert!(
            c.crval_ra != 0.0 || c.crval_dec != 0.0,
            "tangent point should have moved, det at origin {before}"
        );
    }
}
