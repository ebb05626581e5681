//! Flux self-calibration.
//!
//! Drives the relative or absolute normal-equations solve three times, with
//! a `χ² > 9` rejection pass after the first two, and converts the fitted
//! magnitude-space zeropoints into linear flux scale factors
//! `10^(-0.4·m)` keyed by the original exposure and chip identifiers.

mod fit;

pub(crate) use fit::{
    calc_chi2_abs, calc_chi2_rel, flag_outliers_abs, flag_outliers_rel, flux_fit_absolute,
    flux_fit_relative,
};

use tracing::{debug, info, warn};

use crate::chip::{ChipId, ChipSet, ExposureSet, ExpId};
use crate::error::FitError;
use crate::fluxmodel::FluxFitParams;
use crate::obs::Obs;

/// Result of the flux self-calibration.
#[derive(Debug, Clone)]
pub struct FluxSolution {
    /// Per-exposure linear flux scale factors, in input exposure order.
    pub fexp: Vec<(ExpId, f64)>,
    /// Per-chip linear flux scale factors, in input chip order.
    pub fchip: Vec<(ChipId, f64)>,
    /// Field-dependent flux model with the fitted coefficients.
    pub params: FluxFitParams,
}

fn has_usable_rows(matches: &[Obs], sources: &[Obs]) -> bool {
    matches
        .iter()
        .chain(sources.iter())
        .any(|o| o.good && o.mag.is_some() && o.mag_err.is_some())
}

fn unit_solution(
    exposures: &ExposureSet,
    chips: &ChipSet,
    ffp: &FluxFitParams,
) -> FluxSolution {
    FluxSolution {
        fexp: exposures.iter().map(|(id, _)| (*id, 1.0)).collect(),
        fchip: chips.iter().map(|(id, _)| (*id, 1.0)).collect(),
        params: ffp.clone(),
    }
}

/// Run the flux fit in the mode selected by `ffp.absolute`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn flux_fit(
    matches: &mut [Obs],
    nmatch: usize,
    sources: &mut [Obs],
    nsource: usize,
    exposures: &ExposureSet,
    chips: &ChipSet,
    ffp: &FluxFitParams,
) -> Result<FluxSolution, FitError> {
    if !has_usable_rows(matches, sources) {
        warn!("no observations carry magnitudes; flux calibration skipped");
        return Ok(unit_solution(exposures, chips, ffp));
    }

    let nexp = exposures.len();
    let nchip = chips.len();
    let mut params = ffp.clone();

    let sol = if params.absolute {
        let mut sol = flux_fit_absolute(matches, nmatch, sources, nsource, nexp, nchip, &mut params)?;
        for pass in 0..2 {
            let chi2 = calc_chi2_abs(matches, sources, nexp, nchip, &sol, &params, false);
            let e2 = calc_chi2_abs(matches, sources, nexp, nchip, &sol, &params, true);
            info!(
                "absolute flux fit pass {pass}: chi2 = {chi2:.6e}, rms = {:.4} mag",
                e2.sqrt()
            );
            flag_outliers_abs(matches, sources, nexp, nchip, &sol, 9.0, &params);
            sol = flux_fit_absolute(matches, nmatch, sources, nsource, nexp, nchip, &mut params)?;
        }
        let chi2 = calc_chi2_abs(matches, sources, nexp, nchip, &sol, &params, false);
        let e2 = calc_chi2_abs(matches, sources, nexp, nchip, &sol, &params, true);
        info!(
            "absolute flux fit final: chi2 = {chi2:.6e}, rms = {:.4} mag",
            e2.sqrt()
        );
        sol
    } else {
        let mut sol = flux_fit_relative(matches, nmatch, sources, nsource, nexp, nchip, &mut params)?;
        for pass in 0..2 {
            let chi2 = calc_chi2_rel(matches, sources, nexp, nchip, &sol, &params, false);
            let e2 = calc_chi2_rel(matches, sources, nexp, nchip, &sol, &params, true);
            info!(
                "relative flux fit pass {pass}: chi2 = {chi2:.6e}, rms = {:.4} mag",
                e2.sqrt()
            );
            flag_outliers_rel(matches, sources, nexp, nchip, &sol, 9.0, &params);
            sol = flux_fit_relative(matches, nmatch, sources, nsource, nexp, nchip, &mut params)?;
        }
        let chi2 = calc_chi2_rel(matches, sources, nexp, nchip, &sol, &params, false);
        let e2 = calc_chi2_rel(matches, sources, nexp, nchip, &sol, &params, true);
        info!(
            "relative flux fit final: chi2 = {chi2:.6e}, rms = {:.4} mag",
            e2.sqrt()
        );
        sol
    };

    let fexp = exposures
        .iter()
        .enumerate()
        .map(|(j, (id, _))| (*id, 10f64.powf(-0.4 * sol[j])))
        .collect();
    let fchip = chips
        .iter()
        .enumerate()
        .map(|(j, (id, _))| (*id, 10f64.powf(-0.4 * sol[nexp + j])))
        .collect();
    for (k, c) in params.coeff.iter().enumerate() {
        debug!("flux coefficient {k}: {c:.6}");
    }

    Ok(FluxSolution {
        fexp,
        fchip,
        params,
    })
}

/// Run the flux self-calibration on its own.
///
/// Observations must carry their focal-plane coordinates `(u, v)`; dense
/// exposure and chip indices are assigned here.
/// [`solve_mosaic`](crate::solve_mosaic) runs the same machinery after the
/// astrometric fit.
#[allow(clippy::too_many_arguments)]
pub fn solve_flux(
    matches: &mut [Obs],
    nmatch: usize,
    sources: &mut [Obs],
    nsource: usize,
    exposures: &ExposureSet,
    chips: &ChipSet,
    ffp: &FluxFitParams,
) -> Result<FluxSolution, FitError> {
    crate::solver::densify_indices(matches, exposures, chips)?;
    crate::solver::densify_indices(sources, exposures, chips)?;
    flux_fit(matches, nmatch, sources, nsource, exposures, chips, ffp)
}
