//! Mosaic fit orchestration.
//!
//! The driver runs the pipeline of the self-calibration:
//!
//! 1. per-exposure initial fits seed the polynomial coefficients, tangent
//!    points and focal-plane offsets;
//! 2. three joint iterations refine every exposure polynomial, every chip
//!    placement and (in the with-stars variant) every internal star
//!    position, rejecting outliers at `χ² > 9` after each solve;
//! 3. the inverse SIP polynomial is fit per exposure;
//! 4. the flux self-calibration solves for zeropoints and the
//!    field-dependent flux surface.
//!
//! Exactly three joint iterations are run; chi-squared is logged each
//! iteration and a divergence only warns. Chip placements are updated in
//! place; the result mapping preserves the input exposure order.

pub(crate) mod init;
pub(crate) mod joint;
pub(crate) mod linear;
pub(crate) mod sip;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::chip::{ChipSet, ExposureSet, ExpId};
use crate::coeff::Coeff;
use crate::error::FitError;
use crate::flux::{flux_fit, FluxSolution};
use crate::fluxmodel::FluxFitParams;
use crate::obs::Obs;
use crate::poly::Poly;
use crate::snapshot::write_obs_records;

/// Configuration of a mosaic fit.
#[derive(Debug, Clone)]
pub struct MosaicFitConfig {
    /// Total order of the plate polynomial (>= 1).
    pub order: usize,
    /// Refine chip placements.
    pub solve_ccd: bool,
    /// Refine chip yaw angles (with the `Σ dθ = 0` gauge constraint).
    pub allow_rotation: bool,
    /// Catalog position error floor, added in quadrature to the propagated
    /// pixel errors of catalog-matched rows (degrees).
    pub cat_rms: f64,
    /// Write per-iteration observation snapshots.
    pub write_snapshots: bool,
    /// Directory receiving the snapshot files.
    pub snapshot_dir: PathBuf,
}

impl Default for MosaicFitConfig {
    fn default() -> Self {
        Self {
            order: 3,
            solve_ccd: true,
            allow_rotation: true,
            cat_rms: 0.0,
            write_snapshots: false,
            snapshot_dir: PathBuf::from("."),
        }
    }
}

/// Result of a mosaic fit.
#[derive(Debug, Clone)]
pub struct MosaicSolution {
    /// Per-exposure astrometric solutions, in input exposure order.
    pub coeffs: Vec<(ExpId, Coeff)>,
    /// Flux calibration result.
    pub flux: FluxSolution,
}

impl MosaicSolution {
    /// Solution for one exposure.
    pub fn coeff(&self, id: ExpId) -> Option<&Coeff> {
        self.coeffs.iter().find(|(eid, _)| *eid == id).map(|(_, c)| c)
    }
}

// ── Shared plumbing ─────────────────────────────────────────────────────────

fn validate(
    config: &MosaicFitConfig,
    exposures: &ExposureSet,
    chips: &ChipSet,
) -> Result<(), FitError> {
    if config.order < 1 {
        return Err(FitError::InvalidInput(format!(
            "polynomial order must be >= 1, got {}",
            config.order
        )));
    }
    if exposures.is_empty() {
        return Err(FitError::InvalidInput("no exposures".into()));
    }
    if chips.is_empty() {
        return Err(FitError::InvalidInput("no chips".into()));
    }
    Ok(())
}

/// Assign dense `jexp`/`jchip` indices from the input collections.
pub(crate) fn densify_indices(
    obs: &mut [Obs],
    exposures: &ExposureSet,
    chips: &ChipSet,
) -> Result<(), FitError> {
    for o in obs.iter_mut() {
        o.jexp = exposures.index_of(o.iexp).ok_or_else(|| {
            FitError::InvalidInput(format!(
                "observation references unknown exposure {}",
                o.iexp
            ))
        })?;
        o.jchip = chips.index_of(o.ichip).ok_or_else(|| {
            FitError::InvalidInput(format!("observation references unknown chip {}", o.ichip))
        })?;
    }
    Ok(())
}

/// Recompute `(ξ, η)` against the initial projections and `(u, v)` with
/// zero exposure offset.
fn prepare_observations(obs: &mut [Obs], exposures: &ExposureSet, chips: &ChipSet) {
    for o in obs.iter_mut() {
        let (_, origin) = exposures.by_index(o.jexp);
        o.set_xi_eta(origin.ra, origin.dec);
        let chip = chips.by_index(o.jchip);
        o.set_uv(chip, 0.0, 0.0);
    }
}

fn snapshot(config: &MosaicFitConfig, name: &str, obs: &[Obs]) {
    if !config.write_snapshots {
        return;
    }
    if let Err(e) = std::fs::create_dir_all(&config.snapshot_dir)
        .map_err(anyhow::Error::from)
        .and_then(|_| write_obs_records(&config.snapshot_dir.join(name), obs))
    {
        warn!("snapshot {name} not written: {e}");
    }
}

/// Refresh an observation set against the current solution.
fn refresh(obs: &mut [Obs], coeffs: &[(ExpId, Coeff)], chips: &ChipSet, with_xieta: bool) {
    for o in obs.iter_mut() {
        let c = &coeffs[o.jexp].1;
        if with_xieta {
            o.set_xi_eta(c.crval_ra, c.crval_dec);
        }
        o.set_uv(chips.by_index(o.jchip), c.x0, c.y0);
        o.set_fit_val(c);
    }
}

/// Apply one joint solution: polynomial increments and chip placement.
fn apply_joint_corrections(
    coeffs: &mut [(ExpId, Coeff)],
    chips: &mut ChipSet,
    sol: &nalgebra::DVector<f64>,
    lay: &joint::BlockLayout,
) {
    let n = lay.ncoeff;
    for (j, (_, c)) in coeffs.iter_mut().enumerate() {
        let eo = lay.exp_off(j);
        for k in 0..n {
            c.a[k] += sol[eo + k];
            c.b[k] += sol[eo + n + k];
        }
    }
    if lay.solve_ccd {
        for jchip in 0..lay.nchip {
            let co = lay.chip_off(jchip);
            let chip = chips.by_index_mut(jchip);
            chip.shift_center(sol[co], sol[co + 1]);
            if lay.allow_rotation {
                let yaw = chip.yaw() + sol[co + 2];
                chip.set_yaw(yaw);
            }
        }
    }
}

/// Fit the inverse polynomial of every exposure from its observations.
fn fit_inverse_polynomials(
    coeffs: &mut [(ExpId, Coeff)],
    matches: &mut [Obs],
    sources: &mut [Obs],
    poly: &Poly,
) -> Result<(), FitError> {
    for (jexp, (iexp, c)) in coeffs.iter_mut().enumerate() {
        sip::set_linear_preimage(matches, c);
        sip::set_linear_preimage(sources, c);
        let pool: Vec<Obs> = matches
            .iter()
            .chain(sources.iter())
            .filter(|o| o.jexp == jexp)
            .cloned()
            .collect();
        let ngood = pool.iter().filter(|o| o.good).count();
        if ngood < poly.ncoeff {
            warn!(
                "exposure {iexp}: {ngood} good observations cannot constrain the inverse \
                 polynomial; left at zero"
            );
            continue;
        }
        let sel: Vec<usize> = (0..pool.len()).collect();
        sip::solve_inverse_poly(&pool, &sel, poly, c)?;
    }
    Ok(())
}

// ── Entry points ────────────────────────────────────────────────────────────

/// Fit a mosaic from catalog matches and internal sources.
///
/// `nmatch` and `nsource` are the numbers of distinct star groups behind
/// `matches` and `sources` (`Obs::istar` indexes into them). Chip
/// placements are updated in place; observations receive their fitted
/// residuals and dense indices.
#[allow(clippy::too_many_arguments)]
pub fn solve_mosaic(
    matches: &mut [Obs],
    nmatch: usize,
    sources: &mut [Obs],
    nsource: usize,
    exposures: &ExposureSet,
    chips: &mut ChipSet,
    ffp: &FluxFitParams,
    config: &MosaicFitConfig,
) -> Result<MosaicSolution, FitError> {
    validate(config, exposures, chips)?;
    densify_indices(matches, exposures, chips)?;
    densify_indices(sources, exposures, chips)?;
    prepare_observations(matches, exposures, chips);
    prepare_observations(sources, exposures, chips);

    snapshot(config, "match-initial-0.bin", matches);
    snapshot(config, "source-initial-0.bin", sources);

    let poly = Arc::new(Poly::new(config.order));
    let mut coeffs = init::initial_fit(matches, exposures, chips, &poly)?;

    refresh(matches, &coeffs, chips, true);
    refresh(sources, &coeffs, chips, true);

    snapshot(config, "match-initial-1.bin", matches);
    snapshot(config, "source-initial-1.bin", sources);

    info!(
        "before joint fit: chi2 = {:.6e} (matched {:.3}\", sources {:.3}\")",
        joint::calc_chi2_star(matches, sources, &coeffs),
        joint::calc_chi2(matches, &coeffs, true).sqrt() * 3600.0,
        joint::calc_chi2(sources, &coeffs, true).sqrt() * 3600.0,
    );

    let mut prev_chi2 = f64::INFINITY;
    for iter in 0..3 {
        joint::prune_underdetermined(
            matches,
            sources,
            &coeffs,
            chips.len(),
            poly.ncoeff,
            config.solve_ccd,
            if config.allow_rotation { 3 } else { 2 },
        );
        let (sol, lay) = joint::solve_lin_approx_star(
            matches,
            sources,
            nsource,
            &coeffs,
            chips.len(),
            &poly,
            config.solve_ccd,
            config.allow_rotation,
            config.cat_rms,
        )?;

        apply_joint_corrections(&mut coeffs, chips, &sol, &lay);
        refresh(matches, &coeffs, chips, false);

        for o in sources.iter_mut() {
            if let Some(jstar) = o.jstar {
                let so = lay.star_off(jstar);
                o.ra += sol[so];
                o.dec += sol[so + 1];
                let c = &coeffs[o.jexp].1;
                o.set_xi_eta(c.crval_ra, c.crval_dec);
            }
        }
        refresh(sources, &coeffs, chips, false);

        snapshot(config, &format!("match-iter-{iter}.bin"), matches);
        snapshot(config, &format!("source-iter-{iter}.bin"), sources);

        let chi2 = joint::calc_chi2_star(matches, sources, &coeffs);
        info!(
            "iteration {}: chi2 = {chi2:.6e} (matched {:.3}\", sources {:.3}\")",
            iter + 1,
            joint::calc_chi2(matches, &coeffs, true).sqrt() * 3600.0,
            joint::calc_chi2(sources, &coeffs, true).sqrt() * 3600.0,
        );
        if chi2 > prev_chi2 {
            warn!("chi-squared increased from {prev_chi2:.6e} to {chi2:.6e}; continuing");
        }
        prev_chi2 = chi2;

        joint::flag_outliers(matches, &coeffs, &poly, 9.0, config.cat_rms);
        joint::flag_outliers(sources, &coeffs, &poly, 9.0, 0.0);
    }

    fit_inverse_polynomials(&mut coeffs, matches, sources, &poly)?;

    info!("flux fit ...");
    let flux = flux_fit(matches, nmatch, sources, nsource, exposures, chips, ffp)?;

    for o in matches.iter_mut() {
        o.set_fit_val_inverse(&coeffs[o.jexp].1);
    }
    for o in sources.iter_mut() {
        o.set_fit_val_inverse(&coeffs[o.jexp].1);
    }

    Ok(MosaicSolution { coeffs, flux })
}

/// Fit a mosaic from catalog matches only.
///
/// The joint system carries no star-position block; internal sources do
/// not participate.
pub fn solve_mosaic_matches_only(
    matches: &mut [Obs],
    nmatch: usize,
    exposures: &ExposureSet,
    chips: &mut ChipSet,
    ffp: &FluxFitParams,
    config: &MosaicFitConfig,
) -> Result<MosaicSolution, FitError> {
    validate(config, exposures, chips)?;
    densify_indices(matches, exposures, chips)?;
    prepare_observations(matches, exposures, chips);

    snapshot(config, "match-initial-0.bin", matches);

    let poly = Arc::new(Poly::new(config.order));
    let mut coeffs = init::initial_fit(matches, exposures, chips, &poly)?;

    refresh(matches, &coeffs, chips, true);
    snapshot(config, "match-initial-1.bin", matches);

    let mut no_sources: [Obs; 0] = [];
    let mut prev_chi2 = f64::INFINITY;
    for iter in 0..3 {
        joint::prune_underdetermined(
            matches,
            &mut no_sources,
            &coeffs,
            chips.len(),
            poly.ncoeff,
            config.solve_ccd,
            if config.allow_rotation { 3 } else { 2 },
        );
        let sol = joint::solve_lin_approx(
            matches,
            &coeffs,
            chips.len(),
            &poly,
            config.solve_ccd,
            config.allow_rotation,
            config.cat_rms,
        )?;
        let lay = joint::BlockLayout::new(
            poly.ncoeff,
            coeffs.len(),
            chips.len(),
            config.solve_ccd,
            config.allow_rotation,
            0,
        );

        apply_joint_corrections(&mut coeffs, chips, &sol, &lay);
        refresh(matches, &coeffs, chips, false);

        snapshot(config, &format!("match-iter-{iter}.bin"), matches);

        let chi2 = joint::calc_chi2(matches, &coeffs, false);
        info!(
            "iteration {}: chi2 = {chi2:.6e} (matched {:.3}\")",
            iter + 1,
            joint::calc_chi2(matches, &coeffs, true).sqrt() * 3600.0,
        );
        if chi2 > prev_chi2 {
            warn!("chi-squared increased from {prev_chi2:.6e} to {chi2:.6e}; continuing");
        }
        prev_chi2 = chi2;

        joint::flag_outliers(matches, &coeffs, &poly, 9.0, config.cat_rms);
    }

    fit_inverse_polynomials(&mut coeffs, matches, &mut no_sources, &poly)?;

    info!("flux fit ...");
    let flux = flux_fit(matches, nmatch, &mut no_sources, 0, exposures, chips, ffp)?;

    for o in matches.iter_mut() {
        o.set_fit_val_inverse(&coeffs[o.jexp].1);
    }

    Ok(MosaicSolution { coeffs, flux })
}
