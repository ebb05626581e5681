//! Flux normal-equations assemblers.
//!
//! Unknowns, in column order: per-exposure zeropoints, per-chip zeropoints,
//! the field-polynomial coefficients above first order, per-star true
//! magnitudes, and the gauge-fixing Lagrange multipliers. The model for one
//! observation of star `s` at focal-plane `(u, v)`:
//!
//! ```text
//! m_inst = m_star(s) - f_exp[j] - f_chip[c] - P(u, v)
//! ```
//!
//! Relative mode solves for every star magnitude and afterwards ties the
//! whole solution to the catalog scale with a sigma-clipped weighted mean
//! of `m_cat - m_star`. Absolute mode uses catalog magnitudes directly on
//! matched rows and keeps star unknowns only for internal sources.
//!
//! Rows with absent magnitudes or errors are skipped; a star needs two good
//! measurements to receive an unknown.

use nalgebra::DVector;
use tracing::{debug, warn};

use crate::error::FitError;
use crate::fluxmodel::{tn, FluxFitParams};
use crate::obs::Obs;
use crate::solver::linear::{alloc_system, solve_system};

/// Column offsets of the flux system.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FluxLayout {
    pub nexp: usize,
    pub nchip: usize,
    /// Free field-polynomial coefficients (constant and linear terms held
    /// at zero).
    pub ncoeff: usize,
    pub nstar: usize,
    /// Gauge multipliers: two in relative mode, one in absolute mode.
    pub ngauge: usize,
}

impl FluxLayout {
    #[inline]
    pub(crate) fn chip_col(&self, jchip: usize) -> usize {
        self.nexp + jchip
    }

    #[inline]
    pub(crate) fn coeff_col(&self, k: usize) -> usize {
        self.nexp + self.nchip + k
    }

    #[inline]
    pub(crate) fn star_col(&self, jstar: usize) -> usize {
        self.nexp + self.nchip + self.ncoeff + jstar
    }

    #[inline]
    pub(crate) fn ndim(&self) -> usize {
        self.nexp + self.nchip + self.ncoeff + self.nstar + self.ngauge
    }
}

/// Number of field-polynomial coefficients actually fit: everything above
/// the constant and linear terms.
pub(crate) fn free_coeff_count(ffp: &FluxFitParams) -> usize {
    ffp.ncoeff.saturating_sub(3)
}

/// A row is usable when the observation is good and both the magnitude and
/// its error are present.
#[inline]
fn row_ok(o: &Obs) -> bool {
    o.good && o.mag.is_some() && o.mag_err.is_some()
}

/// Normalized basis powers of the field polynomial at one observation.
fn fill_flux_powers(ffp: &FluxFitParams, u: f64, v: f64, pu: &mut [f64], pv: &mut [f64]) {
    let nfree = pu.len();
    let uu = u / ffp.u_max;
    let vv = v / ffp.v_max;
    for k in 0..nfree {
        let xo = ffp.xorder(k + 3);
        let yo = ffp.yorder(k + 3);
        if ffp.chebyshev {
            pu[k] = tn(xo, uu);
            pv[k] = tn(yo, vv);
        } else {
            pu[k] = uu.powi(xo);
            pv[k] = vv.powi(yo);
        }
    }
}

/// Densify star indices over matched stars (relative mode only) and
/// internal sources. Returns the number of stars with unknowns.
fn assign_flux_star_indices(
    matches: &mut [Obs],
    nmatch: usize,
    sources: &mut [Obs],
    nsource: usize,
    include_matches: bool,
) -> usize {
    let base = if include_matches { nmatch } else { 0 };
    let mut counts = vec![0usize; base + nsource];
    if include_matches {
        for o in matches.iter() {
            if row_ok(o) {
                counts[o.istar] += 1;
            }
        }
    }
    for o in sources.iter() {
        if row_ok(o) {
            counts[base + o.istar] += 1;
        }
    }
    let mut dense = vec![None; counts.len()];
    let mut next = 0usize;
    for (i, &cnt) in counts.iter().enumerate() {
        if cnt >= 2 {
            dense[i] = Some(next);
            next += 1;
        }
    }
    if include_matches {
        for o in matches.iter_mut() {
            o.jstar = dense[o.istar];
        }
    }
    for o in sources.iter_mut() {
        o.jstar = dense[base + o.istar];
    }
    next
}

/// One observation's contribution when its star carries an unknown.
fn add_star_row(
    m: &mut nalgebra::DMatrix<f64>,
    rhs: &mut DVector<f64>,
    lay: &FluxLayout,
    o: &Obs,
    pu: &[f64],
    pv: &[f64],
    is2: f64,
) {
    let mag = o.mag.expect("caller checked the magnitude");
    let jstar = o.jstar.expect("caller checked the star index");
    let (re, rc) = (o.jexp, lay.chip_col(o.jchip));
    let rs = lay.star_col(jstar);

    m[(re, re)] -= is2;
    m[(re, rc)] -= is2;
    for k in 0..lay.ncoeff {
        m[(re, lay.coeff_col(k))] -= pu[k] * pv[k] * is2;
    }
    m[(re, rs)] += is2;

    m[(rc, re)] -= is2;
    m[(rc, rc)] -= is2;
    for k in 0..lay.ncoeff {
        m[(rc, lay.coeff_col(k))] -= pu[k] * pv[k] * is2;
    }
    m[(rc, rs)] += is2;

    for j in 0..lay.ncoeff {
        let pj = pu[j] * pv[j];
        let rj = lay.coeff_col(j);
        m[(rj, re)] -= pj * is2;
        m[(rj, rc)] -= pj * is2;
        for k in 0..lay.ncoeff {
            m[(rj, lay.coeff_col(k))] -= pj * pu[k] * pv[k] * is2;
        }
        m[(rj, rs)] += pj * is2;
    }

    m[(rs, re)] += is2;
    m[(rs, rc)] += is2;
    for k in 0..lay.ncoeff {
        m[(rs, lay.coeff_col(k))] += pu[k] * pv[k] * is2;
    }
    m[(rs, rs)] -= is2;

    rhs[re] += mag * is2;
    rhs[rc] += mag * is2;
    for k in 0..lay.ncoeff {
        rhs[lay.coeff_col(k)] += mag * pu[k] * pv[k] * is2;
    }
    rhs[rs] -= mag * is2;
}

/// One catalog-anchored observation (absolute mode, no star unknown).
fn add_anchored_row(
    m: &mut nalgebra::DMatrix<f64>,
    rhs: &mut DVector<f64>,
    lay: &FluxLayout,
    o: &Obs,
    pu: &[f64],
    pv: &[f64],
    is2: f64,
) {
    let dmag = o.mag.expect("caller checked the magnitude")
        - o.mag_cat.expect("caller checked the catalog magnitude");
    let (re, rc) = (o.jexp, lay.chip_col(o.jchip));

    m[(re, re)] -= is2;
    m[(re, rc)] -= is2;
    for k in 0..lay.ncoeff {
        m[(re, lay.coeff_col(k))] -= pu[k] * pv[k] * is2;
    }

    m[(rc, re)] -= is2;
    m[(rc, rc)] -= is2;
    for k in 0..lay.ncoeff {
        m[(rc, lay.coeff_col(k))] -= pu[k] * pv[k] * is2;
    }

    for j in 0..lay.ncoeff {
        let pj = pu[j] * pv[j];
        let rj = lay.coeff_col(j);
        m[(rj, re)] -= pj * is2;
        m[(rj, rc)] -= pj * is2;
        for k in 0..lay.ncoeff {
            m[(rj, lay.coeff_col(k))] -= pj * pu[k] * pv[k] * is2;
        }
    }

    rhs[re] += dmag * is2;
    rhs[rc] += dmag * is2;
    for k in 0..lay.ncoeff {
        rhs[lay.coeff_col(k)] += dmag * pu[k] * pv[k] * is2;
    }
}

/// Keep the factorization regular when a zeropoint received no rows.
fn pin_empty_flux_blocks(
    m: &mut nalgebra::DMatrix<f64>,
    lay: &FluxLayout,
    exp_counts: &[usize],
    chip_counts: &[usize],
    coeff_rows: usize,
) {
    for (j, &cnt) in exp_counts.iter().enumerate() {
        if cnt == 0 {
            warn!("exposure index {j}: no usable flux rows; zeropoint not estimable");
            m[(j, j)] = 1.0;
        }
    }
    for (j, &cnt) in chip_counts.iter().enumerate() {
        if cnt == 0 {
            warn!("chip index {j}: no usable flux rows; zeropoint not estimable");
            let r = lay.chip_col(j);
            m[(r, r)] = 1.0;
        }
    }
    if coeff_rows == 0 {
        for k in 0..lay.ncoeff {
            let r = lay.coeff_col(k);
            m[(r, r)] = 1.0;
        }
    }
}

// ── Relative fit ────────────────────────────────────────────────────────────

/// One relative-mode solve.
///
/// Star magnitudes are unknowns for matched and internal stars alike; two
/// Lagrange multipliers pin the first exposure zeropoint and the chip
/// zeropoint sum. After the solve, the catalog anchoring shift is applied
/// and `mag0` plus the field coefficients are written back.
#[allow(clippy::too_many_arguments)]
pub(crate) fn flux_fit_relative(
    matches: &mut [Obs],
    nmatch: usize,
    sources: &mut [Obs],
    nsource: usize,
    nexp: usize,
    nchip: usize,
    ffp: &mut FluxFitParams,
) -> Result<DVector<f64>, FitError> {
    let nstar = assign_flux_star_indices(matches, nmatch, sources, nsource, true);
    let lay = FluxLayout {
        nexp,
        nchip,
        ncoeff: free_coeff_count(ffp),
        nstar,
        ngauge: 2,
    };
    let ndim = lay.ndim();
    debug!("relative flux system: {ndim} unknowns ({nstar} stars)");

    let (mut m, mut rhs) = alloc_system(ndim)?;
    let mut pu = vec![0.0; lay.ncoeff];
    let mut pv = vec![0.0; lay.ncoeff];

    let mut exp_counts = vec![0usize; nexp];
    let mut chip_counts = vec![0usize; nchip];
    let mut coeff_rows = 0usize;
    for o in matches.iter().chain(sources.iter()) {
        if o.jstar.is_none() || !row_ok(o) {
            continue;
        }
        fill_flux_powers(ffp, o.u, o.v, &mut pu, &mut pv);
        let err = o.mag_err.expect("row_ok checked the error");
        let is2 = 1.0 / (err * err);
        exp_counts[o.jexp] += 1;
        chip_counts[o.jchip] += 1;
        coeff_rows += 1;
        add_star_row(&mut m, &mut rhs, &lay, o, &pu, &pv, is2);
    }

    // Gauge rows: pin the first exposure zeropoint, pin Σ chip zeropoints.
    let g1 = lay.star_col(nstar);
    m[(0, g1)] = 1.0;
    m[(g1, 0)] = 1.0;
    for j in 0..nchip {
        m[(lay.chip_col(j), g1 + 1)] = -1.0;
        m[(g1 + 1, lay.chip_col(j))] = -1.0;
    }

    pin_empty_flux_blocks(&mut m, &lay, &exp_counts, &chip_counts, coeff_rows);

    let mut sol = solve_system(m, rhs)?;

    // Tie the relative solution to the catalog scale: inverse-variance mean
    // of (m_cat - m_star) over catalog rows, two 3σ clip passes.
    let mut resid = Vec::new();
    for o in matches.iter() {
        let (Some(jstar), Some(mag_cat), Some(err_cat)) = (o.jstar, o.mag_cat, o.mag_cat_err)
        else {
            continue;
        };
        if !row_ok(o) {
            continue;
        }
        resid.push((mag_cat - sol[lay.star_col(jstar)], err_cat));
    }

    let dmag = if resid.is_empty() {
        warn!("no catalog magnitudes available; relative solution left unanchored");
        0.0
    } else {
        let wmean = |rows: &[(f64, f64)]| {
            let mut s = 0.0;
            let mut sx = 0.0;
            let mut sxx = 0.0;
            for &(v, e) in rows {
                let w = 1.0 / (e * e);
                s += w;
                sx += v * w;
                sxx += v * v * w;
            }
            let avg = sx / s;
            (avg, ((sxx - sx * sx / s) / s).sqrt())
        };
        let (mut avg, mut sigma) = wmean(&resid);
        debug!("catalog anchoring: mean {avg:.6}, sigma {sigma:.6}");
        for _ in 0..2 {
            let kept: Vec<(f64, f64)> = resid
                .iter()
                .copied()
                .filter(|&(v, e)| ((v - avg) / e).abs() < 3.0)
                .collect();
            if kept.is_empty() {
                break;
            }
            (avg, sigma) = wmean(&kept);
            debug!("catalog anchoring (clipped): mean {avg:.6}, sigma {sigma:.6}");
        }
        avg
    };

    for j in 0..nexp {
        sol[j] += dmag;
    }
    for s in 0..nstar {
        let col = lay.star_col(s);
        sol[col] += dmag;
    }

    for o in matches.iter_mut().chain(sources.iter_mut()) {
        if let Some(jstar) = o.jstar {
            if o.good && o.mag.is_some() {
                o.mag0 = Some(sol[lay.star_col(jstar)]);
            }
        }
    }

    for k in 0..lay.ncoeff {
        ffp.coeff[3 + k] = sol[lay.coeff_col(k)];
    }

    Ok(sol)
}

// ── Absolute fit ────────────────────────────────────────────────────────────

/// One absolute-mode solve.
///
/// Catalog-matched rows constrain the zeropoints directly; internal sources
/// keep per-star unknowns; a single multiplier pins the chip zeropoint sum.
#[allow(clippy::too_many_arguments)]
pub(crate) fn flux_fit_absolute(
    matches: &mut [Obs],
    _nmatch: usize,
    sources: &mut [Obs],
    nsource: usize,
    nexp: usize,
    nchip: usize,
    ffp: &mut FluxFitParams,
) -> Result<DVector<f64>, FitError> {
    let nstar = assign_flux_star_indices(matches, 0, sources, nsource, false);
    let lay = FluxLayout {
        nexp,
        nchip,
        ncoeff: free_coeff_count(ffp),
        nstar,
        ngauge: 1,
    };
    let ndim = lay.ndim();
    debug!("absolute flux system: {ndim} unknowns ({nstar} internal stars)");

    let (mut m, mut rhs) = alloc_system(ndim)?;
    let mut pu = vec![0.0; lay.ncoeff];
    let mut pv = vec![0.0; lay.ncoeff];

    let mut exp_counts = vec![0usize; nexp];
    let mut chip_counts = vec![0usize; nchip];
    let mut coeff_rows = 0usize;

    for o in matches.iter() {
        let (Some(_), Some(mag_cat_err)) = (o.mag_cat, o.mag_cat_err) else {
            continue;
        };
        if !row_ok(o) {
            continue;
        }
        fill_flux_powers(ffp, o.u, o.v, &mut pu, &mut pv);
        let err = o.mag_err.expect("row_ok checked the error");
        let is2 = 1.0 / (err * err + mag_cat_err * mag_cat_err);
        exp_counts[o.jexp] += 1;
        chip_counts[o.jchip] += 1;
        coeff_rows += 1;
        add_anchored_row(&mut m, &mut rhs, &lay, o, &pu, &pv, is2);
    }
    for o in sources.iter() {
        if o.jstar.is_none() || !row_ok(o) {
            continue;
        }
        fill_flux_powers(ffp, o.u, o.v, &mut pu, &mut pv);
        let err = o.mag_err.expect("row_ok checked the error");
        let is2 = 1.0 / (err * err);
        exp_counts[o.jexp] += 1;
        chip_counts[o.jchip] += 1;
        coeff_rows += 1;
        add_star_row(&mut m, &mut rhs, &lay, o, &pu, &pv, is2);
    }

    // Gauge row: pin Σ chip zeropoints.
    let g = lay.star_col(nstar);
    for j in 0..nchip {
        m[(lay.chip_col(j), g)] = -1.0;
        m[(g, lay.chip_col(j))] = -1.0;
    }

    pin_empty_flux_blocks(&mut m, &lay, &exp_counts, &chip_counts, coeff_rows);

    let sol = solve_system(m, rhs)?;

    for o in sources.iter_mut() {
        if let Some(jstar) = o.jstar {
            if o.good && o.mag.is_some() {
                o.mag0 = Some(sol[lay.star_col(jstar)]);
            }
        }
    }

    for k in 0..lay.ncoeff {
        ffp.coeff[3 + k] = sol[lay.coeff_col(k)];
    }

    Ok(sol)
}

// ── Chi-squared and rejection ───────────────────────────────────────────────

/// Relative-mode chi-squared (or mean squared magnitude residual with
/// `mag_resid`).
pub(crate) fn calc_chi2_rel(
    matches: &[Obs],
    sources: &[Obs],
    nexp: usize,
    nchip: usize,
    sol: &DVector<f64>,
    ffp: &FluxFitParams,
    mag_resid: bool,
) -> f64 {
    let lay = FluxLayout {
        nexp,
        nchip,
        ncoeff: free_coeff_count(ffp),
        nstar: 0,
        ngauge: 0,
    };
    let mut chi2 = 0.0;
    let mut mag2 = 0.0;
    let mut num = 0usize;
    for o in matches.iter().chain(sources.iter()) {
        let Some(jstar) = o.jstar else { continue };
        if !row_ok(o) {
            continue;
        }
        let val = o.mag.unwrap() + sol[o.jexp] + sol[lay.chip_col(o.jchip)] + ffp.eval(o.u, o.v);
        let r = val - sol[lay.star_col(jstar)];
        chi2 += (r / o.mag_err.unwrap()).powi(2);
        mag2 += r * r;
        num += 1;
    }
    if num == 0 {
        return 0.0;
    }
    if mag_resid {
        mag2 / num as f64
    } else {
        chi2 / num as f64
    }
}

/// Absolute-mode chi-squared.
pub(crate) fn calc_chi2_abs(
    matches: &[Obs],
    sources: &[Obs],
    nexp: usize,
    nchip: usize,
    sol: &DVector<f64>,
    ffp: &FluxFitParams,
    mag_resid: bool,
) -> f64 {
    let lay = FluxLayout {
        nexp,
        nchip,
        ncoeff: free_coeff_count(ffp),
        nstar: 0,
        ngauge: 0,
    };
    let mut chi2 = 0.0;
    let mut mag2 = 0.0;
    let mut num = 0usize;
    for o in matches.iter() {
        let (Some(mag_cat), Some(err_cat)) = (o.mag_cat, o.mag_cat_err) else {
            continue;
        };
        if !row_ok(o) {
            continue;
        }
        let val = o.mag.unwrap() + sol[o.jexp] + sol[lay.chip_col(o.jchip)] + ffp.eval(o.u, o.v);
        let err = o.mag_err.unwrap();
        let r = val - mag_cat;
        chi2 += r * r / (err * err + err_cat * err_cat);
        mag2 += r * r;
        num += 1;
    }
    for o in sources.iter() {
        let Some(jstar) = o.jstar else { continue };
        if !row_ok(o) {
            continue;
        }
        let val = o.mag.unwrap() + sol[o.jexp] + sol[lay.chip_col(o.jchip)] + ffp.eval(o.u, o.v);
        let r = val - sol[lay.star_col(jstar)];
        chi2 += (r / o.mag_err.unwrap()).powi(2);
        mag2 += r * r;
        num += 1;
    }
    if num == 0 {
        return 0.0;
    }
    if mag_resid {
        mag2 / num as f64
    } else {
        chi2 / num as f64
    }
}

/// Reject relative-mode rows above `e2`.
pub(crate) fn flag_outliers_rel(
    matches: &mut [Obs],
    sources: &mut [Obs],
    nexp: usize,
    nchip: usize,
    sol: &DVector<f64>,
    e2: f64,
    ffp: &FluxFitParams,
) -> usize {
    let lay = FluxLayout {
        nexp,
        nchip,
        ncoeff: free_coeff_count(ffp),
        nstar: 0,
        ngauge: 0,
    };
    let mut nreject = 0usize;
    for o in matches.iter_mut().chain(sources.iter_mut()) {
        let Some(jstar) = o.jstar else { continue };
        if !row_ok(o) {
            continue;
        }
        let val = o.mag.unwrap() + sol[o.jexp] + sol[lay.chip_col(o.jchip)] + ffp.eval(o.u, o.v);
        let r2 = ((val - sol[lay.star_col(jstar)]) / o.mag_err.unwrap()).powi(2);
        if r2 > e2 {
            o.good = false;
            nreject += 1;
        }
    }
    debug!("flux rejection: {nreject} rows");
    nreject
}

/// Reject absolute-mode rows above `e2`.
pub(crate) fn flag_outliers_abs(
    matches: &mut [Obs],
    sources: &mut [Obs],
    nexp: usize,
    nchip: usize,
    sol: &DVector<f64>,
    e2: f64,
    ffp: &FluxFitParams,
) -> usize {
    let lay = FluxLayout {
        nexp,
        nchip,
        ncoeff: free_coeff_count(ffp),
        nstar: 0,
        ngauge: 0,
    };
    let mut nreject = 0usize;
    for o in matches.iter_mut() {
        let (Some(mag_cat), Some(err_cat)) = (o.mag_cat, o.mag_cat_err) else {
            continue;
        };
        if !row_ok(o) {
            continue;
        }
        let val = o.mag.unwrap() + sol[o.jexp] + sol[lay.chip_col(o.jchip)] + ffp.eval(o.u, o.v);
        let err = o.mag_err.unwrap();
        let r2 = (val - mag_cat).powi(2) / (err * err + err_cat * err_cat);
        if r2 > e2 {
            o.good = false;
            nreject += 1;
        }
    }
    for o in sources.iter_mut() {
        let Some(jstar) = o.jstar else { continue };
        if !row_ok(o) {
            continue;
        }
        let val = o.mag.unwrap() + sol[o.jexp] + sol[lay.chip_col(o.jchip)] + ffp.eval(o.u, o.v);
        let r2 = ((val - sol[lay.star_col(jstar)]) / o.mag_err.unwrap()).powi(2);
        if r2 > e2 {
            o.good = false;
            nreject += 1;
        }
    }
    debug!("flux rejection: {nreject} rows");
    nreject
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::{ChipId, ExpId};

    #[test]
    fn test_free_coeff_count_clamps() {
        assert_eq!(free_coeff_count(&FluxFitParams::new(0, false, false)), 0);
        assert_eq!(free_coeff_count(&FluxFitParams::new(1, false, false)), 0);
        assert_eq!(free_coeff_count(&FluxFitParams::new(2, false, false)), 3);
    }

    #[test]
    fn test_star_index_assignment_modes() {
        let mk = |istar: usize, mag: Option<f64>| {
            let mut o = Obs::new(0, 0.0, 0.0, 0.0, 0.0, ChipId(0), ExpId(0));
            o.istar = istar;
            o.mag = mag;
            o.mag_err = mag.map(|_| 0.01);
            o
        };
        let mut matches = vec![mk(0, Some(20.0)), mk(0, Some(20.0)), mk(1, Some(19.0))];
        let mut sources = vec![mk(0, Some(21.0)), mk(0, Some(21.0)), mk(1, None)];

        // Relative: matched star 0 (2 rows) and source star 0 (2 rows)
        // receive unknowns; matched star 1 and source star 1 do not.
        let n = assign_flux_star_indices(&mut matches, 2, &mut sources, 2, true);
        assert_eq!(n, 2);
        assert_eq!(matches[0].jstar, Some(0));
        assert_eq!(matches[2].jstar, None);
        assert_eq!(sources[0].jstar, Some(1));
        assert_eq!(sources[2].jstar, None);

        // Absolute: only sources are considered.
        let n = assign_flux_star_indices(&mut matches, 2, &mut sources, 2, false);
        assert_eq!(n, 1);
        assert_eq!(sources[0].jstar, Some(0));
    }
}
