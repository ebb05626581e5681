//! Mosaic astrometric and photometric self-calibration.
//!
//! Given detections of stars collected by many detectors ("chips") across
//! many exposures of an imaging camera, this crate simultaneously fits a
//! per-exposure tangent-plane projection with polynomial distortion, a
//! per-chip rigid placement on the focal plane (translation plus an
//! optional yaw), refined sky positions for stars observed only within the
//! mosaic, and a flux calibration (per-exposure and per-chip zeropoints
//! plus a field-dependent polynomial), anchored to a reference catalog or
//! to the repeated measurements themselves.
//!
//! Entry points: [`solve_mosaic`] (catalog matches plus internal sources)
//! and [`solve_mosaic_matches_only`]. Results export to standard TAN-SIP
//! headers via [`wcs`].

pub mod chip;
pub mod coeff;
pub mod error;
pub mod flux;
pub mod fluxmodel;
pub mod obs;
pub mod poly;
pub mod snapshot;
pub mod solver;
pub mod tanplane;
pub mod wcs;

pub use chip::{Chip, ChipId, ChipSet, ExpId, ExposureSet, SkyOrigin};
pub use coeff::Coeff;
pub use error::FitError;
pub use flux::{solve_flux, FluxSolution};
pub use fluxmodel::FluxFitParams;
pub use obs::Obs;
pub use poly::Poly;
pub use solver::{solve_mosaic, solve_mosaic_matches_only, MosaicFitConfig, MosaicSolution};
