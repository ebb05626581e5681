//! TAN-SIP header interchange and per-chip solution conversion.
//!
//! The fit result is exported as a standard tangent-plane projection with
//! SIP distortion: the 2×2 linear part of the forward polynomial becomes the
//! CD matrix, the higher-order terms become the `A`/`B` distortion matrices
//! (normalized through the CD inverse), and the inverse polynomial becomes
//! `AP`/`BP`. The reference pixel is `(-x0, -y0)` and the reference sky
//! position is the tangent point in degrees.
//!
//! Import reads the same keywords back, zero-defaulting absent SIP
//! coefficients.
//!
//! [`convert_coeff`] and [`convert_flux_fit_params`] re-expand an
//! exposure-frame solution into one chip's frame (yaw rotation plus center
//! translation) so that a per-chip WCS or flux model can be written.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::chip::Chip;
use crate::coeff::Coeff;
use crate::error::FitError;
use crate::fluxmodel::FluxFitParams;
use crate::poly::Poly;
use crate::tanplane::{D2R, R2D};

// ── Property map ────────────────────────────────────────────────────────────

/// A typed header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Int(i64),
    Bool(bool),
    Double(f64),
}

/// Ordered property map used for header interchange.
#[derive(Debug, Clone, Default)]
pub struct Header {
    map: BTreeMap<String, HeaderValue>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: HeaderValue) {
        self.map.insert(key.to_string(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn get_int(&self, key: &str) -> Result<i64, FitError> {
        match self.map.get(key) {
            Some(HeaderValue::Int(v)) => Ok(*v),
            Some(_) => Err(FitError::Header(key.to_string(), "expected integer")),
            None => Err(FitError::Header(key.to_string(), "missing")),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, FitError> {
        match self.map.get(key) {
            Some(HeaderValue::Bool(v)) => Ok(*v),
            Some(_) => Err(FitError::Header(key.to_string(), "expected boolean")),
            None => Err(FitError::Header(key.to_string(), "missing")),
        }
    }

    pub fn get_double(&self, key: &str) -> Result<f64, FitError> {
        match self.map.get(key) {
            Some(HeaderValue::Double(v)) => Ok(*v),
            Some(HeaderValue::Int(v)) => Ok(*v as f64),
            Some(_) => Err(FitError::Header(key.to_string(), "expected double")),
            None => Err(FitError::Header(key.to_string(), "missing")),
        }
    }

    /// Double with a default for absent keys (zero-defaulted SIP terms).
    pub fn get_double_or(&self, key: &str, default: f64) -> Result<f64, FitError> {
        if self.contains(key) {
            self.get_double(key)
        } else {
            Ok(default)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.map.iter()
    }
}

// ── Coeff → TAN-SIP header ──────────────────────────────────────────────────

/// Encode an exposure solution as TAN-SIP header keywords.
pub fn wcs_header_from_coeff(c: &Coeff) -> Header {
    let order = c.poly.order();
    let mut h = Header::new();

    h.set("CRVAL1", HeaderValue::Double(c.crval_ra * R2D));
    h.set("CRVAL2", HeaderValue::Double(c.crval_dec * R2D));
    h.set("CRPIX1", HeaderValue::Double(-c.x0));
    h.set("CRPIX2", HeaderValue::Double(-c.y0));
    h.set("CD1_1", HeaderValue::Double(c.a[0]));
    h.set("CD1_2", HeaderValue::Double(c.a[1]));
    h.set("CD2_1", HeaderValue::Double(c.b[0]));
    h.set("CD2_2", HeaderValue::Double(c.b[1]));

    let det = c.a[0] * c.b[1] - c.a[1] * c.b[0];

    h.set("A_ORDER", HeaderValue::Int(order as i64));
    h.set("B_ORDER", HeaderValue::Int(order as i64));
    // Forward distortion: higher-order terms mapped through the CD inverse.
    for k in 2..=order {
        let n = k * (k + 1) / 2 - 1;
        for i in (0..=k).rev() {
            let j = k - i;
            let a = c.a[n + j];
            let b = c.b[n + j];
            let sip_a = (c.b[1] * a - c.a[1] * b) / det;
            let sip_b = (-c.b[0] * a + c.a[0] * b) / det;
            h.set(&format!("A_{i}_{j}"), HeaderValue::Double(sip_a));
            h.set(&format!("B_{i}_{j}"), HeaderValue::Double(sip_b));
        }
    }

    h.set("AP_ORDER", HeaderValue::Int(order as i64));
    h.set("BP_ORDER", HeaderValue::Int(order as i64));
    for k in 1..=order {
        let n = k * (k + 1) / 2 - 1;
        for i in (0..=k).rev() {
            let j = k - i;
            h.set(&format!("AP_{i}_{j}"), HeaderValue::Double(c.ap[n + j]));
            h.set(&format!("BP_{i}_{j}"), HeaderValue::Double(c.bp[n + j]));
        }
    }

    h
}

/// Decode an exposure solution from TAN-SIP header keywords.
///
/// Absent SIP coefficients default to zero; the polynomial order is taken
/// from `A_ORDER`.
pub fn coeff_from_wcs_header(h: &Header) -> Result<Coeff, FitError> {
    let order = h.get_int("A_ORDER")? as usize;
    let order_p = h.get_int("AP_ORDER")? as usize;

    let poly = Arc::new(Poly::new(order));
    let mut c = Coeff::new(poly, crate::chip::ExpId(0));

    let cd00 = h.get_double("CD1_1")?;
    let cd01 = h.get_double("CD1_2")?;
    let cd10 = h.get_double("CD2_1")?;
    let cd11 = h.get_double("CD2_2")?;

    c.crval_ra = h.get_double("CRVAL1")? * D2R;
    c.crval_dec = h.get_double("CRVAL2")? * D2R;
    c.x0 = -h.get_double("CRPIX1")?;
    c.y0 = -h.get_double("CRPIX2")?;

    for k in 2..=order {
        let n = k * (k + 1) / 2 - 1;
        for i in (0..=k).rev() {
            let j = k - i;
            let sip_a = h.get_double_or(&format!("A_{i}_{j}"), 0.0)?;
            let sip_b = h.get_double_or(&format!("B_{i}_{j}"), 0.0)?;
            c.a[n + j] = cd00 * sip_a + cd01 * sip_b;
            c.b[n + j] = cd10 * sip_a + cd11 * sip_b;
        }
    }

    for k in 1..=order_p.min(order) {
        let n = k * (k + 1) / 2 - 1;
        for i in (0..=k).rev() {
            let j = k - i;
            c.ap[n + j] = h.get_double_or(&format!("AP_{i}_{j}"), 0.0)?;
            c.bp[n + j] = h.get_double_or(&format!("BP_{i}_{j}"), 0.0)?;
        }
    }

    c.a[0] = cd00;
    c.a[1] = cd01;
    c.b[0] = cd10;
    c.b[1] = cd11;

    Ok(c)
}

// ── Per-chip conversions ────────────────────────────────────────────────────

fn binomial(n: i32, k: i32) -> f64 {
    let mut out = 1.0;
    for i in 0..k {
        out *= (n - i) as f64 / (k - i) as f64;
    }
    out
}

/// Rotate and translate an exposure-frame solution into one chip's frame.
///
/// With `u = cos·u' − sin·v'`, `v = sin·u' + cos·v'`, each monomial
/// `u^i v^j` re-expands over the chip-frame basis by a double binomial sum;
/// the offsets move by the chip center expressed in the rotated frame, and
/// the inverse polynomial is re-expanded through the normalized CD matrix.
pub fn convert_coeff(c: &Coeff, chip: &Chip) -> Coeff {
    let poly = Arc::new(Poly::new(c.poly.order()));
    let mut out = Coeff::new(poly.clone(), c.iexp);
    out.crval_ra = c.crval_ra;
    out.crval_dec = c.crval_dec;

    let cos_yaw = chip.cos_yaw();
    let sin_yaw = chip.sin_yaw();

    for k in 0..poly.ncoeff {
        let xo = poly.xorder(k);
        let yo = poly.yorder(k);
        for n in 0..=xo {
            for m in 0..=yo {
                let i = n + m;
                let j = xo + yo - n - m;
                let l = poly
                    .get_index(i, j)
                    .expect("re-expansion exponents stay inside the basis");
                let coef = binomial(xo, n)
                    * binomial(yo, m)
                    * cos_yaw.powi(n)
                    * (-sin_yaw).powi(xo - n)
                    * sin_yaw.powi(m)
                    * cos_yaw.powi(yo - m);
                out.a[l] += c.a[k] * coef;
                out.b[l] += c.b[k] * coef;
            }
        }
    }

    let off = chip.center_px();
    out.x0 = (off[0] + c.x0) * cos_yaw + (off[1] + c.y0) * sin_yaw;
    out.y0 = -(off[0] + c.x0) * sin_yaw + (off[1] + c.y0) * cos_yaw;

    // Normalize the chip-frame CD through the exposure-frame CD inverse and
    // re-expand the inverse polynomial over it.
    let det = c.a[0] * c.b[1] - c.a[1] * c.b[0];
    let inv = [
        [c.b[1] / det, -c.a[1] / det],
        [-c.b[0] / det, c.a[0] / det],
    ];
    let ma = inv[0][0] * out.a[0] + inv[0][1] * out.b[0];
    let mb = inv[0][0] * out.a[1] + inv[0][1] * out.b[1];
    let mc = inv[1][0] * out.a[0] + inv[1][1] * out.b[0];
    let md = inv[1][0] * out.a[1] + inv[1][1] * out.b[1];

    let mut ap = vec![0.0; poly.ncoeff];
    let mut bp = vec![0.0; poly.ncoeff];
    for k in 0..poly.ncoeff {
        let xo = poly.xorder(k);
        let yo = poly.yorder(k);
        for n in 0..=xo {
            for m in 0..=yo {
                let i = n + m;
                let j = xo + yo - n - m;
                let l = poly
                    .get_index(i, j)
                    .expect("re-expansion exponents stay inside the basis");
                let coef = binomial(xo, n)
                    * binomial(yo, m)
                    * ma.powi(n)
                    * mb.powi(xo - n)
                    * mc.powi(m)
                    * md.powi(yo - m);
                ap[l] += c.ap[k] * coef;
                bp[l] += c.bp[k] * coef;
            }
        }
    }
    ap[0] += ma;
    ap[1] += mb;
    bp[0] += mc;
    bp[1] += md;

    for k in 0..poly.ncoeff {
        out.ap[k] = ap[k] * cos_yaw + bp[k] * sin_yaw;
        out.bp[k] = -ap[k] * sin_yaw + bp[k] * cos_yaw;
    }
    out.ap[0] -= 1.0;
    out.bp[1] -= 1.0;

    out
}

/// Rotate and translate the flux model into one chip's frame.
///
/// The output is always monomial with unit normalization scales; a
/// Chebyshev input is expanded first.
pub fn convert_flux_fit_params(c: &Coeff, chip: &Chip, ffp: &FluxFitParams) -> FluxFitParams {
    let src = ffp.to_monomial();
    let mut out = FluxFitParams::new(src.order, src.absolute, false);

    let cos_yaw = chip.cos_yaw();
    let sin_yaw = chip.sin_yaw();

    for k in 0..src.ncoeff {
        let xo = src.xorder(k);
        let yo = src.yorder(k);
        for n in 0..=xo {
            for m in 0..=yo {
                let i = n + m;
                let j = xo + yo - n - m;
                let l = out
                    .get_index(i, j)
                    .expect("re-expansion exponents stay inside the basis");
                let coef = binomial(xo, n)
                    * binomial(yo, m)
                    * cos_yaw.powi(n)
                    * (-sin_yaw).powi(xo - n)
                    * sin_yaw.powi(m)
                    * cos_yaw.powi(yo - m)
                    / src.u_max.powi(xo)
                    / src.v_max.powi(yo);
                out.coeff[l] += src.coeff[k] * coef;
            }
        }
    }

    let off = chip.center_px();
    out.x0 = (off[0] + c.x0) * cos_yaw + (off[1] + c.y0) * sin_yaw;
    out.y0 = -(off[0] + c.x0) * sin_yaw + (off[1] + c.y0) * cos_yaw;

    out
}
