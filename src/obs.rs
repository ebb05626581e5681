//! A single detection and its transform state.
//!
//! An [`Obs`] is created once from a matched source and then mutated by the
//! fit: its focal-plane coordinates `(u, v)` are recomputed whenever the
//! chip placement or the exposure offset changes, its tangent-plane
//! coordinates `(ξ, η)` whenever the tangent point moves, and its `good`
//! flag may be cleared (never restored) by outlier rejection.
//!
//! Tangent-plane quantities are stored in degrees; sky positions in
//! radians; pixel and focal-plane quantities in pixels.

use crate::chip::{Chip, ChipId, ExpId};
use crate::coeff::Coeff;
use crate::tanplane;

/// One detection of a star on one chip of one exposure.
#[derive(Debug, Clone)]
pub struct Obs {
    /// Pipeline source identifier.
    pub id: i64,
    /// Star-group index within the match or source list.
    pub istar: usize,
    /// Dense star index assigned by the solver; `None` when the star is not
    /// part of the current system (fewer than two good observations).
    pub jstar: Option<usize>,

    /// Sky position (radians). For internal-only sources this is refined in
    /// place by the joint fit.
    pub ra: f64,
    pub dec: f64,

    /// Detector pixel coordinates.
    pub x: f64,
    pub y: f64,
    /// Pixel-coordinate uncertainties.
    pub xerr: f64,
    pub yerr: f64,

    /// Focal-plane pixels (chip placement applied, exposure offset added).
    pub u: f64,
    pub v: f64,
    /// Yaw-rotated but unshifted pixel coordinates; rotation gradient input.
    pub u0: f64,
    pub v0: f64,
    /// Linear pre-image of `(ξ, η)` under the CD matrix, input to the
    /// inverse-polynomial fit.
    pub u_lin: f64,
    pub v_lin: f64,

    /// Tangent-plane coordinates (degrees) and their partials with respect
    /// to the source position (`_a`, `_d`) and the tangent point
    /// (`_a0`, `_d0`).
    pub xi: f64,
    pub eta: f64,
    pub xi_a: f64,
    pub xi_d: f64,
    pub eta_a: f64,
    pub eta_d: f64,
    pub xi_a0: f64,
    pub xi_d0: f64,
    pub eta_a0: f64,
    pub eta_d0: f64,

    /// Model predictions at the current solution.
    pub xi_fit: f64,
    pub eta_fit: f64,
    pub u_fit: f64,
    pub v_fit: f64,

    /// Exposure and chip this detection belongs to.
    pub iexp: ExpId,
    pub ichip: ChipId,
    /// Dense exposure and chip indices assigned by the solver.
    pub jexp: usize,
    pub jchip: usize,

    /// Cleared by outlier rejection; never restored.
    pub good: bool,

    /// Instrumental magnitude and its error; absent when the pipeline flux
    /// was non-positive.
    pub mag: Option<f64>,
    pub mag_err: Option<f64>,
    /// Catalog magnitude and error, present only for catalog-matched rows.
    pub mag_cat: Option<f64>,
    pub mag_cat_err: Option<f64>,
    /// Fitted true magnitude of the star, filled by the flux fit.
    pub mag0: Option<f64>,
}

impl Obs {
    /// Create a detection with pixel coordinates.
    pub fn new(id: i64, ra: f64, dec: f64, x: f64, y: f64, ichip: ChipId, iexp: ExpId) -> Self {
        Self {
            id,
            istar: 0,
            jstar: None,
            ra,
            dec,
            x,
            y,
            xerr: f64::NAN,
            yerr: f64::NAN,
            u: f64::NAN,
            v: f64::NAN,
            u0: f64::NAN,
            v0: f64::NAN,
            u_lin: f64::NAN,
            v_lin: f64::NAN,
            xi: f64::NAN,
            eta: f64::NAN,
            xi_a: f64::NAN,
            xi_d: f64::NAN,
            eta_a: f64::NAN,
            eta_d: f64::NAN,
            xi_a0: f64::NAN,
            xi_d0: f64::NAN,
            eta_a0: f64::NAN,
            eta_d0: f64::NAN,
            xi_fit: f64::NAN,
            eta_fit: f64::NAN,
            u_fit: f64::NAN,
            v_fit: f64::NAN,
            iexp,
            ichip,
            jexp: 0,
            jchip: 0,
            good: true,
            mag: None,
            mag_err: None,
            mag_cat: None,
            mag_cat_err: None,
            mag0: None,
        }
    }

    /// Set the pixel uncertainties; non-finite values mark the observation
    /// bad.
    pub fn set_pixel_errors(&mut self, xerr: f64, yerr: f64) {
        self.xerr = xerr;
        self.yerr = yerr;
        if !xerr.is_finite() || !yerr.is_finite() {
            self.good = false;
        }
    }

    /// Set the instrumental magnitude from a pipeline flux measurement.
    pub fn set_flux(&mut self, flux: f64, flux_err: f64) {
        let (mag, err) = mag_from_flux(flux, flux_err);
        self.mag = mag;
        self.mag_err = err;
    }

    /// Set the catalog magnitude from a catalog flux measurement.
    pub fn set_catalog_flux(&mut self, flux: f64, flux_err: f64) {
        let (mag, err) = mag_from_flux(flux, flux_err);
        self.mag_cat = mag;
        self.mag_cat_err = err;
        self.mag0 = mag;
    }

    /// Recompute `(u, v)` and `(u0, v0)` from the chip placement and the
    /// exposure's focal-plane offset.
    pub fn set_uv(&mut self, chip: &Chip, x0: f64, y0: f64) {
        let (u0, v0) = chip.rotate_pixel(self.x, self.y);
        self.u0 = u0;
        self.v0 = v0;
        let (u, v) = chip.position_from_pixel(self.x, self.y);
        self.u = u + x0;
        self.v = v + y0;
    }

    /// Recompute `(ξ, η)` and all ten partials against the tangent point
    /// `(ra0, dec0)`, converting to degrees.
    pub fn set_xi_eta(&mut self, ra0: f64, dec0: f64) {
        let (a, d) = (self.ra, self.dec);
        const R2D: f64 = tanplane::R2D;
        self.xi = tanplane::cal_xi(a, d, ra0, dec0) * R2D;
        self.eta = tanplane::cal_eta(a, d, ra0, dec0) * R2D;
        self.xi_a = tanplane::cal_xi_a(a, d, ra0, dec0) * R2D;
        self.xi_d = tanplane::cal_xi_d(a, d, ra0, dec0) * R2D;
        self.eta_a = tanplane::cal_eta_a(a, d, ra0, dec0) * R2D;
        self.eta_d = tanplane::cal_eta_d(a, d, ra0, dec0) * R2D;
        self.xi_a0 = tanplane::cal_xi_a0(a, d, ra0, dec0) * R2D;
        self.xi_d0 = tanplane::cal_xi_d0(a, d, ra0, dec0) * R2D;
        self.eta_a0 = tanplane::cal_eta_a0(a, d, ra0, dec0) * R2D;
        self.eta_d0 = tanplane::cal_eta_d0(a, d, ra0, dec0) * R2D;
    }

    /// Evaluate the forward model at `(u, v)` into `xi_fit`, `eta_fit`.
    pub fn set_fit_val(&mut self, c: &Coeff) {
        let (xi, eta) = c.uv_to_xieta(self.u, self.v);
        self.xi_fit = xi;
        self.eta_fit = eta;
    }

    /// Evaluate the inverse model at `(ξ, η)` into `u_fit`, `v_fit`.
    pub fn set_fit_val_inverse(&mut self, c: &Coeff) {
        let (u, v) = c.xieta_to_uv(self.xi, self.eta);
        self.u_fit = u;
        self.v_fit = v;
    }
}

/// Convert a flux and its error to a magnitude pair; non-positive inputs
/// yield absent magnitudes.
pub fn mag_from_flux(flux: f64, flux_err: f64) -> (Option<f64>, Option<f64>) {
    if flux > 0.0 && flux_err > 0.0 {
        (
            Some(-2.5 * flux.log10()),
            Some(2.5 / std::f64::consts::LN_10 * flux_err / flux),
        )
    } else {
        (None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poly::Poly;
    use std::sync::Arc;

    #[test]
    fn test_mag_from_flux() {
        let (mag, err) = mag_from_flux(100.0, 1.0);
        assert!((mag.unwrap() - (-5.0)).abs() < 1e-12);
        assert!((err.unwrap() - 2.5 / std::f64::consts::LN_10 * 0.01).abs() < 1e-12);
        assert_eq!(mag_from_flux(-1.0, 1.0), (None, None));
        assert_eq!(mag_from_flux(10.0, 0.0), (None, None));
    }

    #[test]
    fn test_bad_pixel_errors_flag() {
        let mut o = Obs::new(1, 0.0, 0.0, 10.0, 10.0, ChipId(0), ExpId(0));
        o.set_pixel_errors(0.1, f64::NAN);
        assert!(!o.good);
    }

    #[test]
    fn test_set_uv_with_offset() {
        let chip = Chip::new([10.0, 0.0], 0.0, 1.0);
        let mut o = Obs::new(1, 0.0, 0.0, 5.0, -3.0, ChipId(0), ExpId(0));
        o.set_uv(&chip, 2.0, 1.0);
        assert!((o.u - 17.0).abs() < 1e-12);
        assert!((o.v - (-2.0)).abs() < 1e-12);
        // u0, v0 carry only the rotation.
        assert!((o.u0 - 5.0).abs() < 1e-12);
        assert!((o.v0 - (-3.0)).abs() < 1e-12);
    }

    #[test]
    fn test_set_xi_eta_degrees() {
        let mut o = Obs::new(1, 1e-3, 0.0, 0.0, 0.0, ChipId(0), ExpId(0));
        o.set_xi_eta(0.0, 0.0);
        // Small offset: xi in degrees is ~ ra in degrees.
        assert!((o.xi - 1e-3 * tanplane::R2D).abs() < 1e-8);
        assert!(o.eta.abs() < 1e-8);
    }

    #[test]
    fn test_fit_val_round_trip() {
        let poly = Arc::new(Poly::new(2));
        let mut c = Coeff::new(poly, ExpId(0));
        c.a[0] = 1.0;
        c.b[1] = 1.0;
        let mut o = Obs::new(1, 0.0, 0.0, 0.0, 0.0, ChipId(0), ExpId(0));
        o.u = 4.0;
        o.v = -2.0;
        o.set_fit_val(&c);
        assert!((o.xi_fit - 4.0).abs() < 1e-12);
        o.xi = o.xi_fit;
        o.eta = o.eta_fit;
        o.set_fit_val_inverse(&c);
        assert!((o.u_fit - 4.0).abs() < 1e-12);
        assert!((o.v_fit + 2.0).abs() < 1e-12);
    }
}
