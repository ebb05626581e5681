//! Astrometric end-to-end tests: build synthetic mosaics with known plate
//! models and chip placements, run the full fit, and verify the solution
//! recovers the truth.

use mosaicfit::tanplane::{inverse_gnomonic, D2R};
use mosaicfit::{
    solve_mosaic, solve_mosaic_matches_only, Chip, ChipId, ChipSet, ExpId, ExposureSet,
    FluxFitParams, MosaicFitConfig, Obs, SkyOrigin,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
}

/// Build one detection whose true tangent-plane position (degrees) is
/// given; the sky position is derived by the inverse projection at the
/// exposure's initial tangent point (0, 0).
fn make_obs(
    id: i64,
    istar: usize,
    xi_deg: f64,
    eta_deg: f64,
    x: f64,
    y: f64,
    ichip: ChipId,
    iexp: ExpId,
) -> Obs {
    let (ra, dec) = inverse_gnomonic(xi_deg * D2R, eta_deg * D2R, 0.0, 0.0);
    let mut o = Obs::new(id, ra, dec, x, y, ichip, iexp);
    o.istar = istar;
    o.set_pixel_errors(0.01, 0.01);
    o
}

fn single_chip() -> ChipSet {
    let mut chips = ChipSet::new();
    chips
        .insert(ChipId(0), Chip::new([0.0, 0.0], 0.0, 1.0))
        .unwrap();
    chips
}

fn two_exposures() -> ExposureSet {
    let mut exposures = ExposureSet::new();
    exposures
        .insert(ExpId(0), SkyOrigin { ra: 0.0, dec: 0.0 })
        .unwrap();
    exposures
        .insert(ExpId(1), SkyOrigin { ra: 0.0, dec: 0.0 })
        .unwrap();
    exposures
}

const GRID: [f64; 3] = [-1.0, 0.0, 1.0];

/// Identity plate: (ξ, η) = (u, v) on a 3×3 grid over two exposures.
/// The fitted linear part must be the identity, every higher coefficient
/// zero, the offsets zero and the tangent points unmoved.
#[test]
fn test_identity_plate() {
    init_tracing();
    let exposures = two_exposures();
    let mut chips = single_chip();

    let mut matches = Vec::new();
    let mut id = 0;
    for exp in 0..2i64 {
        let mut istar = 0;
        for &gx in &GRID {
            for &gy in &GRID {
                let mut o = make_obs(id, istar, gx, gy, gx, gy, ChipId(0), ExpId(exp));
                o.mag = Some(20.0);
                o.mag_err = Some(0.01);
                o.mag_cat = Some(20.0);
                o.mag_cat_err = Some(0.01);
                matches.push(o);
                id += 1;
                istar += 1;
            }
        }
    }

    let config = MosaicFitConfig {
        order: 2,
        solve_ccd: true,
        allow_rotation: false,
        ..Default::default()
    };
    let ffp = FluxFitParams::new(0, false, false);
    let sol =
        solve_mosaic_matches_only(&mut matches, 9, &exposures, &mut chips, &ffp, &config).unwrap();

    for (iexp, c) in &sol.coeffs {
        assert!((c.a[0] - 1.0).abs() < 1e-10, "exposure {iexp}: a0 = {}", c.a[0]);
        assert!((c.b[1] - 1.0).abs() < 1e-10, "exposure {iexp}: b1 = {}", c.b[1]);
        assert!(c.a[1].abs() < 1e-10 && c.b[0].abs() < 1e-10);
        for k in 2..c.a.len() {
            assert!(c.a[k].abs() < 1e-10, "a[{k}] = {}", c.a[k]);
            assert!(c.b[k].abs() < 1e-10, "b[{k}] = {}", c.b[k]);
        }
        assert!(c.x0.abs() < 1e-8 && c.y0.abs() < 1e-8);
        assert!(c.crval_ra.abs() < 1e-10 && c.crval_dec.abs() < 1e-10);
    }

    // Chi-squared and the forward/inverse round trip on every good row.
    let chi2: f64 = matches
        .iter()
        .filter(|o| o.good)
        .map(|o| (o.xi - o.xi_fit).powi(2) + (o.eta - o.eta_fit).powi(2))
        .sum();
    assert!(chi2 < 1e-10, "chi2 = {chi2:e}");
    for o in matches.iter().filter(|o| o.good) {
        assert!((o.u - o.u_fit).abs() < 1e-3, "u round trip: {} vs {}", o.u, o.u_fit);
        assert!(
            (o.xi - o.xi_fit).abs() * 3600.0 < 1e-3,
            "xi round trip: {} vs {}",
            o.xi,
            o.xi_fit
        );
    }

    // With equal instrumental and catalog magnitudes the flux scales are
    // unity.
    for (_, f) in &sol.flux.fexp {
        assert!((f - 1.0).abs() < 1e-9, "fexp = {f}");
    }
    for (_, f) in &sol.flux.fchip {
        assert!((f - 1.0).abs() < 1e-9, "fchip = {f}");
    }
}

/// Known plate scale: (ξ, η) = 1.0001 · (u, v).
#[test]
fn test_known_scale() {
    init_tracing();
    let exposures = two_exposures();
    let mut chips = single_chip();

    let mut matches = Vec::new();
    let mut id = 0;
    for exp in 0..2i64 {
        let mut istar = 0;
        for &gx in &GRID {
            for &gy in &GRID {
                matches.push(make_obs(
                    id,
                    istar,
                    1.0001 * gx,
                    1.0001 * gy,
                    gx,
                    gy,
                    ChipId(0),
                    ExpId(exp),
                ));
                id += 1;
                istar += 1;
            }
        }
    }

    let config = MosaicFitConfig {
        order: 2,
        solve_ccd: true,
        allow_rotation: false,
        ..Default::default()
    };
    let ffp = FluxFitParams::new(0, false, false);
    let sol =
        solve_mosaic_matches_only(&mut matches, 9, &exposures, &mut chips, &ffp, &config).unwrap();

    for (iexp, c) in &sol.coeffs {
        assert!(
            (c.a[0] - 1.0001).abs() < 1e-8,
            "exposure {iexp}: a0 = {:.12}",
            c.a[0]
        );
        assert!(
            (c.b[1] - 1.0001).abs() < 1e-8,
            "exposure {iexp}: b1 = {:.12}",
            c.b[1]
        );
    }
}

const CHIP_GRID: [f64; 5] = [-40.0, -20.0, 0.0, 20.0, 40.0];
const SCALE: f64 = 0.01; // degrees per focal-plane pixel

/// Two chips whose true centers are displaced from the assumed layout; the
/// joint fit must recover the relative placement to sub-1e-4 pixels.
#[test]
fn test_chip_offset_recovery() {
    init_tracing();
    let mut exposures = ExposureSet::new();
    exposures
        .insert(ExpId(0), SkyOrigin { ra: 0.0, dec: 0.0 })
        .unwrap();

    let mut chips = ChipSet::new();
    chips
        .insert(ChipId(0), Chip::new([0.0, 0.0], 0.0, 1.0))
        .unwrap();
    chips
        .insert(ChipId(1), Chip::new([100.0, 0.0], 0.0, 1.0))
        .unwrap();
    let true_centers = [[0.0, 0.0], [102.0, -1.0]];

    let mut matches = Vec::new();
    let mut id = 0;
    let mut istar = 0;
    for (ichip, truth) in true_centers.iter().enumerate() {
        for &gx in &CHIP_GRID {
            for &gy in &CHIP_GRID {
                let u_true = gx + truth[0];
                let v_true = gy + truth[1];
                matches.push(make_obs(
                    id,
                    istar,
                    SCALE * u_true,
                    SCALE * v_true,
                    gx,
                    gy,
                    ChipId(ichip as i64),
                    ExpId(0),
                ));
                id += 1;
                istar += 1;
            }
        }
    }

    let config = MosaicFitConfig {
        order: 2,
        solve_ccd: true,
        allow_rotation: false,
        ..Default::default()
    };
    let ffp = FluxFitParams::new(0, false, false);
    let nmatch = matches.len();
    solve_mosaic_matches_only(&mut matches, nmatch, &exposures, &mut chips, &ffp, &config)
        .unwrap();

    // The absolute placement shares a gauge with the tangent point and the
    // exposure offset; the chip-to-chip separation is what the data pin
    // down.
    let c0 = chips.get(ChipId(0)).unwrap().center_px();
    let c1 = chips.get(ChipId(1)).unwrap().center_px();
    let sep = [c1[0] - c0[0], c1[1] - c0[1]];
    assert!(
        (sep[0] - 102.0).abs() < 1e-4,
        "separation x = {:.6}",
        sep[0]
    );
    assert!((sep[1] + 1.0).abs() < 1e-4, "separation y = {:.6}", sep[1]);
}

/// As above, but the second chip also carries a small true yaw; with
/// rotation enabled the fit must recover the relative angle and keep the
/// yaw-sum gauge pinned.
#[test]
fn test_chip_yaw_recovery() {
    init_tracing();
    let mut exposures = ExposureSet::new();
    exposures
        .insert(ExpId(0), SkyOrigin { ra: 0.0, dec: 0.0 })
        .unwrap();

    let mut chips = ChipSet::new();
    chips
        .insert(ChipId(0), Chip::new([0.0, 0.0], 0.0, 1.0))
        .unwrap();
    chips
        .insert(ChipId(1), Chip::new([100.0, 0.0], 0.0, 1.0))
        .unwrap();
    let true_yaw = 0.001f64;

    let mut matches = Vec::new();
    let mut id = 0;
    let mut istar = 0;
    for ichip in 0..2i64 {
        for &gx in &CHIP_GRID {
            for &gy in &CHIP_GRID {
                let (u_true, v_true) = if ichip == 1 {
                    (
                        100.0 + true_yaw.cos() * gx - true_yaw.sin() * gy,
                        true_yaw.sin() * gx + true_yaw.cos() * gy,
                    )
                } else {
                    (gx, gy)
                };
                matches.push(make_obs(
                    id,
                    istar,
                    SCALE * u_true,
                    SCALE * v_true,
                    gx,
                    gy,
                    ChipId(ichip),
                    ExpId(0),
                ));
                id += 1;
                istar += 1;
            }
        }
    }

    let config = MosaicFitConfig {
        order: 2,
        solve_ccd: true,
        allow_rotation: true,
        ..Default::default()
    };
    let ffp = FluxFitParams::new(0, false, false);
    let nmatch = matches.len();
    solve_mosaic_matches_only(&mut matches, nmatch, &exposures, &mut chips, &ffp, &config)
        .unwrap();

    let yaw0 = chips.get(ChipId(0)).unwrap().yaw();
    let yaw1 = chips.get(ChipId(1)).unwrap().yaw();
    // The bulk rotation is absorbed by the exposure polynomial; the
    // chip-to-chip angle survives.
    assert!(
        (yaw1 - yaw0 - true_yaw).abs() < 1e-6,
        "relative yaw = {:.9}",
        yaw1 - yaw0
    );
    // Rotation-sum gauge.
    assert!((yaw0 + yaw1).abs() < 1e-10, "yaw sum = {:.3e}", yaw0 + yaw1);
}

/// Internal sources with perturbed assumed sky positions: the
/// joint-with-stars fit must pull them back onto the truth.
#[test]
fn test_internal_star_position_refinement() {
    init_tracing();
    let exposures = two_exposures();
    let mut chips = single_chip();

    let mut matches = Vec::new();
    let mut id = 0;
    for exp in 0..2i64 {
        let mut istar = 0;
        for &gx in &GRID {
            for &gy in &GRID {
                matches.push(make_obs(id, istar, gx, gy, gx, gy, ChipId(0), ExpId(exp)));
                id += 1;
                istar += 1;
            }
        }
    }

    // Five internal stars: detector positions follow the true tangent-plane
    // location, but the catalog-free sky position starts 0.01 degrees off.
    let star_xi = [
        (0.3, -0.2),
        (-0.7, 0.5),
        (0.1, 0.8),
        (-0.4, -0.6),
        (0.6, 0.1),
    ];
    let mut sources = Vec::new();
    let mut truth = Vec::new();
    for (istar, &(xi, eta)) in star_xi.iter().enumerate() {
        let (ra_true, dec_true) = inverse_gnomonic(xi * D2R, eta * D2R, 0.0, 0.0);
        truth.push((ra_true, dec_true));
        for exp in 0..2i64 {
            let mut o = make_obs(id, istar, xi, eta, xi, eta, ChipId(0), ExpId(exp));
            // Perturb the assumed position; the detector coordinates stay
            // consistent with the truth.
            let (ra, dec) =
                inverse_gnomonic((xi + 0.01) * D2R, (eta - 0.01) * D2R, 0.0, 0.0);
            o.ra = ra;
            o.dec = dec;
            sources.push(o);
            id += 1;
        }
    }

    let config = MosaicFitConfig {
        order: 2,
        solve_ccd: true,
        allow_rotation: false,
        ..Default::default()
    };
    let ffp = FluxFitParams::new(0, false, false);
    solve_mosaic(
        &mut matches,
        9,
        &mut sources,
        5,
        &exposures,
        &mut chips,
        &ffp,
        &config,
    )
    .unwrap();

    for (istar, &(ra_true, dec_true)) in truth.iter().enumerate() {
        let o = sources.iter().find(|o| o.istar == istar).unwrap();
        assert!(
            (o.ra - ra_true).abs() < 1e-8,
            "star {istar}: ra off by {:.3e} rad",
            o.ra - ra_true
        );
        assert!(
            (o.dec - dec_true).abs() < 1e-8,
            "star {istar}: dec off by {:.3e} rad",
            o.dec - dec_true
        );
    }
}

/// A corrupted detection is rejected and stays rejected; clean rows
/// survive. The grid is dense enough that a single outlier cannot hide
/// behind its own leverage.
#[test]
fn test_outlier_rejected_and_stays_bad() {
    init_tracing();
    let exposures = two_exposures();
    let mut chips = single_chip();

    let grid5 = [-1.0, -0.5, 0.0, 0.5, 1.0];
    let mut matches = Vec::new();
    let mut id = 0;
    for exp in 0..2i64 {
        let mut istar = 0;
        for &gx in &grid5 {
            for &gy in &grid5 {
                matches.push(make_obs(id, istar, gx, gy, gx, gy, ChipId(0), ExpId(exp)));
                id += 1;
                istar += 1;
            }
        }
    }
    // Corrupt one detection by five pixels (500 sigma).
    let bad_id = matches[3].id;
    matches[3].x += 5.0;

    let config = MosaicFitConfig {
        order: 2,
        solve_ccd: true,
        allow_rotation: false,
        ..Default::default()
    };
    let ffp = FluxFitParams::new(0, false, false);
    solve_mosaic_matches_only(&mut matches, 25, &exposures, &mut chips, &ffp, &config).unwrap();

    let bad = matches.iter().find(|o| o.id == bad_id).unwrap();
    assert!(!bad.good, "corrupted detection must be rejected");
    let ngood = matches.iter().filter(|o| o.good).count();
    assert_eq!(ngood, matches.len() - 1, "clean detections must survive");
}

/// Invalid inputs are reported before any solving happens.
#[test]
fn test_invalid_inputs() {
    let exposures = two_exposures();
    let mut chips = single_chip();
    let ffp = FluxFitParams::new(0, false, false);

    let config = MosaicFitConfig {
        order: 0,
        ..Default::default()
    };
    let mut matches = vec![make_obs(0, 0, 0.0, 0.0, 0.0, 0.0, ChipId(0), ExpId(0))];
    assert!(solve_mosaic_matches_only(
        &mut matches,
        1,
        &exposures,
        &mut chips,
        &ffp,
        &config
    )
    .is_err());

    let config = MosaicFitConfig::default();
    let mut unknown_chip = vec![make_obs(0, 0, 0.0, 0.0, 0.0, 0.0, ChipId(9), ExpId(0))];
    assert!(solve_mosaic_matches_only(
        &mut unknown_chip,
        1,
        &exposures,
        &mut chips,
        &ffp,
        &config
    )
    .is_err());

    let empty = ExposureSet::new();
    assert!(solve_mosaic_matches_only(
        &mut matches,
        1,
        &empty,
        &mut chips,
        &ffp,
        &config
    )
    .is_err());
}

/// Snapshots are written for every stage when enabled.
#[test]
fn test_snapshots_written() {
    init_tracing();
    let exposures = two_exposures();
    let mut chips = single_chip();

    let mut matches = Vec::new();
    let mut id = 0;
    for exp in 0..2i64 {
        let mut istar = 0;
        for &gx in &GRID {
            for &gy in &GRID {
                matches.push(make_obs(id, istar, gx, gy, gx, gy, ChipId(0), ExpId(exp)));
                id += 1;
                istar += 1;
            }
        }
    }

    let dir = std::env::temp_dir().join("mosaicfit-snapshots");
    let _ = std::fs::remove_dir_all(&dir);
    let config = MosaicFitConfig {
        order: 2,
        solve_ccd: true,
        allow_rotation: false,
        write_snapshots: true,
        snapshot_dir: dir.clone(),
        ..Default::default()
    };
    let ffp = FluxFitParams::new(0, false, false);
    solve_mosaic_matches_only(&mut matches, 9, &exposures, &mut chips, &ffp, &config).unwrap();

    for name in [
        "match-initial-0.bin",
        "match-initial-1.bin",
        "match-iter-0.bin",
        "match-iter-1.bin",
        "match-iter-2.bin",
    ] {
        assert!(dir.join(name).exists(), "missing snapshot {name}");
        let rows = mosaicfit::snapshot::read_obs_records(&dir.join(name)).unwrap();
        assert_eq!(rows.len(), matches.len());
    }
}
