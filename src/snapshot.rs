//! Per-iteration observation snapshots.
//!
//! When enabled, the orchestrator writes the full observation tables after
//! the initial fit and after every joint iteration: one archived record per
//! [`Obs`](crate::obs::Obs) with every scalar attribute as a typed column.
//! The on-disk layout is the `rkyv` archive of `Vec<ObsRecord>` — stable
//! within one build of the crate.

use std::path::Path;

use rkyv::{Archive, Deserialize, Serialize};
use tracing::info;

use crate::obs::Obs;

/// Flat, serializable row mirroring one observation.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub struct ObsRecord {
    pub id: i64,
    pub istar: u64,
    pub jstar: i64,
    pub ra: f64,
    pub dec: f64,
    pub x: f64,
    pub y: f64,
    pub xerr: f64,
    pub yerr: f64,
    pub u: f64,
    pub v: f64,
    pub u0: f64,
    pub v0: f64,
    pub u_lin: f64,
    pub v_lin: f64,
    pub xi: f64,
    pub eta: f64,
    pub xi_fit: f64,
    pub eta_fit: f64,
    pub u_fit: f64,
    pub v_fit: f64,
    pub iexp: i64,
    pub ichip: i64,
    pub jexp: u64,
    pub jchip: u64,
    pub good: bool,
    pub mag: Option<f64>,
    pub mag_err: Option<f64>,
    pub mag_cat: Option<f64>,
    pub mag_cat_err: Option<f64>,
    pub mag0: Option<f64>,
}

impl ObsRecord {
    pub fn from_obs(o: &Obs) -> Self {
        Self {
            id: o.id,
            istar: o.istar as u64,
            jstar: o.jstar.map_or(-1, |j| j as i64),
            ra: o.ra,
            dec: o.dec,
            x: o.x,
            y: o.y,
            xerr: o.xerr,
            yerr: o.yerr,
            u: o.u,
            v: o.v,
            u0: o.u0,
            v0: o.v0,
            u_lin: o.u_lin,
            v_lin: o.v_lin,
            xi: o.xi,
            eta: o.eta,
            xi_fit: o.xi_fit,
            eta_fit: o.eta_fit,
            u_fit: o.u_fit,
            v_fit: o.v_fit,
            iexp: o.iexp.0,
            ichip: o.ichip.0,
            jexp: o.jexp as u64,
            jchip: o.jchip as u64,
            good: o.good,
            mag: o.mag,
            mag_err: o.mag_err,
            mag_cat: o.mag_cat,
            mag_cat_err: o.mag_cat_err,
            mag0: o.mag0,
        }
    }
}

/// Write one observation table to `path`.
pub fn write_obs_records(path: &Path, obs: &[Obs]) -> anyhow::Result<()> {
    let records: Vec<ObsRecord> = obs.iter().map(ObsRecord::from_obs).collect();
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&records)
        .map_err(|e| anyhow::anyhow!("snapshot serialization failed: {e}"))?;
    std::fs::write(path, &bytes)?;
    info!(
        "Wrote snapshot {} ({} rows, {} bytes)",
        path.display(),
        records.len(),
        bytes.len()
    );
    Ok(())
}

/// Read an observation table back (used by tests and offline inspection).
pub fn read_obs_records(path: &Path) -> anyhow::Result<Vec<ObsRecord>> {
    let bytes = std::fs::read(path)?;
    rkyv::from_bytes::<Vec<ObsRecord>, rkyv::rancor::Error>(&bytes)
        .map_err(|e| anyhow::anyhow!("snapshot deserialization failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::{ChipId, ExpId};

    #[test]
    fn test_record_round_trip() {
        let mut o = Obs::new(42, 1.0, -0.5, 10.0, 20.0, ChipId(3), ExpId(7));
        o.set_pixel_errors(0.05, 0.04);
        o.set_flux(1000.0, 10.0);
        let dir = std::env::temp_dir().join("mosaicfit-snapshot-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("match-iter-0.bin");
        write_obs_records(&path, std::slice::from_ref(&o)).unwrap();
        let rows = read_obs_records(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 42);
        assert_eq!(rows[0].ichip, 3);
        assert_eq!(rows[0].iexp, 7);
        assert!(rows[0].good);
        assert!((rows[0].mag.unwrap() - (-7.5)).abs() < 1e-12);
        assert_eq!(rows[0].jstar, -1);
    }
}
