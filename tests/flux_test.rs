//! Photometric end-to-end tests: synthetic mosaics with known exposure and
//! chip zeropoints (and optionally a field-dependent flux surface), checked
//! against the relative and absolute solvers.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use mosaicfit::{
    solve_flux, Chip, ChipId, ChipSet, ExpId, ExposureSet, FluxFitParams, Obs, SkyOrigin,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
}

fn camera(nexp: usize, nchip: usize) -> (ExposureSet, ChipSet) {
    let mut exposures = ExposureSet::new();
    for j in 0..nexp {
        exposures
            .insert(ExpId(j as i64), SkyOrigin { ra: 0.0, dec: 0.0 })
            .unwrap();
    }
    let mut chips = ChipSet::new();
    for c in 0..nchip {
        chips
            .insert(
                ChipId(c as i64),
                Chip::new([200.0 * c as f64, 0.0], 0.0, 1.0),
            )
            .unwrap();
    }
    (exposures, chips)
}

/// One photometric row; focal-plane coordinates are set directly.
#[allow(clippy::too_many_arguments)]
fn flux_obs(
    id: i64,
    istar: usize,
    iexp: i64,
    ichip: i64,
    u: f64,
    v: f64,
    mag: f64,
    err: f64,
) -> Obs {
    let mut o = Obs::new(id, 0.0, 0.0, 0.0, 0.0, ChipId(ichip), ExpId(iexp));
    o.istar = istar;
    o.u = u;
    o.v = v;
    o.mag = Some(mag);
    o.mag_err = Some(err);
    o.set_pixel_errors(0.01, 0.01);
    o
}

fn mag_of(scale: f64) -> f64 {
    -2.5 * scale.log10()
}

const F_EXP_TRUE: [f64; 3] = [0.00, 0.02, -0.05];
const SIGMA: f64 = 0.01;

/// Noise-free relative fit: zeropoints, the chip-sum gauge and the catalog
/// anchoring are all exact.
#[test]
fn test_relative_flux_exact() {
    init_tracing();
    let (exposures, chips) = camera(3, 4);
    let nstar = 60;

    let mut rng = StdRng::seed_from_u64(7);
    let mut matches = Vec::new();
    let mut id = 0;
    for s in 0..nstar {
        let m_true = 18.0 + 4.0 * rng.random::<f64>();
        for exp in 0..3i64 {
            let chip = (s as i64 + exp) % 4;
            let mut o = flux_obs(
                id,
                s,
                exp,
                chip,
                200.0 * chip as f64,
                0.0,
                m_true - F_EXP_TRUE[exp as usize],
                SIGMA,
            );
            o.mag_cat = Some(m_true);
            o.mag_cat_err = Some(SIGMA);
            matches.push(o);
            id += 1;
        }
    }

    let ffp = FluxFitParams::new(0, false, false);
    let mut sources: Vec<Obs> = Vec::new();
    let sol = solve_flux(
        &mut matches,
        nstar,
        &mut sources,
        0,
        &exposures,
        &chips,
        &ffp,
    )
    .unwrap();

    for (j, (_, scale)) in sol.fexp.iter().enumerate() {
        assert!(
            (mag_of(*scale) - F_EXP_TRUE[j]).abs() < 1e-9,
            "exposure {j}: recovered {:.6}, truth {:.6}",
            mag_of(*scale),
            F_EXP_TRUE[j]
        );
    }

    // Chip zeropoint sum gauge.
    let chip_sum: f64 = sol.fchip.iter().map(|(_, s)| mag_of(*s)).sum();
    assert!(chip_sum.abs() < 1e-10, "chip zeropoint sum = {chip_sum:.3e}");

    // Catalog anchoring: the weighted mean of (m_cat - m_star) vanishes.
    let mut s = 0.0;
    let mut sx = 0.0;
    for o in &matches {
        if let (Some(mag_cat), Some(err_cat), Some(mag0)) = (o.mag_cat, o.mag_cat_err, o.mag0) {
            let w = 1.0 / (err_cat * err_cat);
            s += w;
            sx += (mag_cat - mag0) * w;
        }
    }
    assert!((sx / s).abs() < 1e-9, "anchored mean = {:.3e}", sx / s);
}

/// Relative fit with Gaussian measurement noise: recovered exposure
/// offsets land within the statistical bound.
#[test]
fn test_relative_flux_noisy() {
    init_tracing();
    let (exposures, chips) = camera(3, 4);
    let nstar = 240;

    let mut rng = StdRng::seed_from_u64(42);
    let noise = Normal::new(0.0, SIGMA).unwrap();
    let mut matches = Vec::new();
    let mut id = 0;
    for s in 0..nstar {
        let m_true = 18.0 + 4.0 * rng.random::<f64>();
        for exp in 0..3i64 {
            let chip = (s as i64 + exp) % 4;
            let mut o = flux_obs(
                id,
                s,
                exp,
                chip,
                200.0 * chip as f64,
                0.0,
                m_true - F_EXP_TRUE[exp as usize] + noise.sample(&mut rng),
                SIGMA,
            );
            o.mag_cat = Some(m_true);
            o.mag_cat_err = Some(SIGMA);
            matches.push(o);
            id += 1;
        }
    }

    let ffp = FluxFitParams::new(0, false, false);
    let mut sources: Vec<Obs> = Vec::new();
    let sol = solve_flux(
        &mut matches,
        nstar,
        &mut sources,
        0,
        &exposures,
        &chips,
        &ffp,
    )
    .unwrap();

    // 3σ/√N per exposure, with headroom for the star-magnitude nuisance
    // parameters sharing the same measurements.
    let tol = 3.0 * SIGMA / (nstar as f64).sqrt() * 1.5;
    let mut sum_rec = 0.0;
    for (j, (_, scale)) in sol.fexp.iter().enumerate() {
        let rec = mag_of(*scale);
        sum_rec += rec;
        assert!(
            (rec - F_EXP_TRUE[j]).abs() < tol,
            "exposure {j}: recovered {rec:.5}, truth {:.5}, tol {tol:.5}",
            F_EXP_TRUE[j]
        );
    }
    let sum_true: f64 = F_EXP_TRUE.iter().sum();
    assert!(
        (sum_rec - sum_true).abs() < tol,
        "zeropoint sum {sum_rec:.5} vs {sum_true:.5}"
    );

    let chip_sum: f64 = sol.fchip.iter().map(|(_, s)| mag_of(*s)).sum();
    assert!(chip_sum.abs() < 1e-10, "chip zeropoint sum = {chip_sum:.3e}");
}

/// Absolute fit: catalog magnitudes on half the stars anchor the scale;
/// the internal half gets unbiased fitted magnitudes.
#[test]
fn test_absolute_flux_catalog_anchoring() {
    init_tracing();
    let (exposures, chips) = camera(3, 4);
    let nmatch = 500;
    let nsource = 500;

    let mut rng = StdRng::seed_from_u64(42);
    let noise = Normal::new(0.0, SIGMA).unwrap();

    let mut matches = Vec::new();
    let mut id = 0;
    for s in 0..nmatch {
        let m_true = 18.0 + 4.0 * rng.random::<f64>();
        for exp in 0..3i64 {
            let chip = (s as i64 + exp) % 4;
            let mut o = flux_obs(
                id,
                s,
                exp,
                chip,
                200.0 * chip as f64,
                0.0,
                m_true - F_EXP_TRUE[exp as usize] + noise.sample(&mut rng),
                SIGMA,
            );
            o.mag_cat = Some(m_true);
            o.mag_cat_err = Some(SIGMA);
            matches.push(o);
            id += 1;
        }
    }

    let mut sources = Vec::new();
    let mut source_truth = Vec::new();
    for s in 0..nsource {
        let m_true = 18.0 + 4.0 * rng.random::<f64>();
        source_truth.push(m_true);
        for exp in 0..3i64 {
            let chip = (s as i64 + exp) % 4;
            sources.push(flux_obs(
                id,
                s,
                exp,
                chip,
                200.0 * chip as f64,
                0.0,
                m_true - F_EXP_TRUE[exp as usize] + noise.sample(&mut rng),
                SIGMA,
            ));
            id += 1;
        }
    }

    let ffp = FluxFitParams::new(0, true, false);
    solve_flux(
        &mut matches,
        nmatch,
        &mut sources,
        nsource,
        &exposures,
        &chips,
        &ffp,
    )
    .unwrap();

    // Per-star fitted magnitudes and their overall bias.
    let mut bias = 0.0;
    let mut count = 0usize;
    for (s, &m_true) in source_truth.iter().enumerate() {
        let o = sources.iter().find(|o| o.istar == s && o.mag0.is_some());
        let Some(o) = o else { continue };
        let mag0 = o.mag0.unwrap();
        assert!(
            (mag0 - m_true).abs() < 0.05,
            "star {s}: fitted {mag0:.4}, truth {m_true:.4}"
        );
        bias += mag0 - m_true;
        count += 1;
    }
    assert!(count > nsource * 9 / 10, "most stars must receive magnitudes");
    let bias = bias / count as f64;
    assert!(bias.abs() < 1e-3, "magnitude bias = {bias:.5}");
}

/// A Chebyshev field surface above first order is recovered exactly from
/// noise-free data.
#[test]
fn test_chebyshev_field_surface_recovery() {
    init_tracing();
    let (exposures, chips) = camera(3, 4);
    let nstar = 200;

    let mut truth = FluxFitParams::new(2, false, true);
    truth.u_max = 1000.0;
    truth.v_max = 1000.0;
    truth.coeff[3] = 0.05; // T2(u)
    truth.coeff[4] = -0.03; // T1(u)·T1(v)
    truth.coeff[5] = 0.02; // T2(v)

    let mut rng = StdRng::seed_from_u64(11);
    let mut matches = Vec::new();
    let mut id = 0;
    for s in 0..nstar {
        let m_true = 18.0 + 4.0 * rng.random::<f64>();
        for exp in 0..3i64 {
            let chip = (s as i64 + exp) % 4;
            // Dithered exposures place the star at a different focal-plane
            // position each time; the per-row surface differences are what
            // separate the coefficients from the star magnitudes.
            let u = -1000.0 + 2000.0 * rng.random::<f64>();
            let v = -1000.0 + 2000.0 * rng.random::<f64>();
            let mut o = flux_obs(
                id,
                s,
                exp,
                chip,
                u,
                v,
                m_true - F_EXP_TRUE[exp as usize] - truth.eval(u, v),
                SIGMA,
            );
            o.mag_cat = Some(m_true);
            o.mag_cat_err = Some(SIGMA);
            matches.push(o);
            id += 1;
        }
    }

    let mut ffp = FluxFitParams::new(2, false, true);
    ffp.u_max = 1000.0;
    ffp.v_max = 1000.0;
    let mut sources: Vec<Obs> = Vec::new();
    let sol = solve_flux(
        &mut matches,
        nstar,
        &mut sources,
        0,
        &exposures,
        &chips,
        &ffp,
    )
    .unwrap();

    for k in 3..6 {
        assert!(
            (sol.params.coeff[k] - truth.coeff[k]).abs() < 1e-9,
            "coefficient {k}: {:.6} vs {:.6}",
            sol.params.coeff[k],
            truth.coeff[k]
        );
    }
    // Constant and linear terms stay pinned at zero.
    for k in 0..3 {
        assert_eq!(sol.params.coeff[k], 0.0);
    }
}

/// Rows with absent magnitudes are skipped without disturbing the fit, and
/// a fully magnitude-less input degrades to unit scales.
#[test]
fn test_missing_magnitudes() {
    init_tracing();
    let (exposures, chips) = camera(3, 4);

    // A fit where one row of one star carries no magnitude: its star drops
    // below two measurements and is excluded, everything else proceeds.
    let mut matches = Vec::new();
    let mut id = 0;
    for s in 0..24usize {
        let m_true = 20.0;
        for exp in 0..3i64 {
            let chip = (s as i64 + exp) % 4;
            let mut o = flux_obs(
                id,
                s,
                exp,
                chip,
                0.0,
                0.0,
                m_true - F_EXP_TRUE[exp as usize],
                SIGMA,
            );
            o.mag_cat = Some(m_true);
            o.mag_cat_err = Some(SIGMA);
            if s == 0 && exp > 0 {
                o.mag = None;
                o.mag_err = None;
            }
            matches.push(o);
            id += 1;
        }
    }
    let ffp = FluxFitParams::new(0, false, false);
    let mut sources: Vec<Obs> = Vec::new();
    let sol = solve_flux(&mut matches, 24, &mut sources, 0, &exposures, &chips, &ffp).unwrap();
    assert!(matches[0].mag0.is_none(), "one-row star gets no magnitude");
    for (j, (_, scale)) in sol.fexp.iter().enumerate() {
        assert!((mag_of(*scale) - F_EXP_TRUE[j]).abs() < 1e-9);
    }

    // No magnitudes anywhere: unit scales.
    let mut bare = vec![flux_obs(0, 0, 0, 0, 0.0, 0.0, 20.0, SIGMA)];
    bare[0].mag = None;
    bare[0].mag_err = None;
    let sol = solve_flux(&mut bare, 1, &mut sources, 0, &exposures, &chips, &ffp).unwrap();
    for (_, scale) in &sol.fexp {
        assert_eq!(*scale, 1.0);
    }
}
