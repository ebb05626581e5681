//! Per-exposure astrometric solution.
//!
//! A [`Coeff`] owns the forward plate polynomial (`a`, `b`), the SIP-style
//! inverse polynomial (`ap`, `bp`), the tangent-plane center and the
//! focal-plane pixel offset of one exposure. The polynomial basis is a
//! shared immutable [`Poly`]; every exposure of one mosaic fit references
//! the same instance.
//!
//! The forward transform maps focal-plane pixels to tangent-plane degrees:
//!
//! ```text
//! ξ(u,v) = Σ_k a_k u^x_k v^y_k      η(u,v) = Σ_k b_k u^x_k v^y_k
//! ```
//!
//! `a[0], a[1], b[0], b[1]` are the CD-like 2×2 linear part; the inverse
//! transform first inverts it, then adds the `ap`, `bp` correction at the
//! linear pre-image.

use std::sync::Arc;

use crate::chip::ExpId;
use crate::poly::Poly;

/// Astrometric solution for one exposure.
#[derive(Debug, Clone)]
pub struct Coeff {
    /// Shared polynomial basis.
    pub poly: Arc<Poly>,
    /// Exposure this solution belongs to.
    pub iexp: ExpId,
    /// Forward ξ coefficients (degrees per pixel^order).
    pub a: Vec<f64>,
    /// Forward η coefficients.
    pub b: Vec<f64>,
    /// Inverse u correction coefficients.
    pub ap: Vec<f64>,
    /// Inverse v correction coefficients.
    pub bp: Vec<f64>,
    /// Tangent-point right ascension (radians).
    pub crval_ra: f64,
    /// Tangent-point declination (radians).
    pub crval_dec: f64,
    /// Focal-plane pixel offset added to every chip position.
    pub x0: f64,
    pub y0: f64,
}

impl Coeff {
    /// Zero-coefficient solution on a shared basis.
    pub fn new(poly: Arc<Poly>, iexp: ExpId) -> Self {
        let n = poly.ncoeff;
        Self {
            poly,
            iexp,
            a: vec![0.0; n],
            b: vec![0.0; n],
            ap: vec![0.0; n],
            bp: vec![0.0; n],
            crval_ra: 0.0,
            crval_dec: 0.0,
            x0: 0.0,
            y0: 0.0,
        }
    }

    /// Forward ξ at focal-plane pixels `(u, v)`, in degrees.
    pub fn xi(&self, u: f64, v: f64) -> f64 {
        let p = &self.poly;
        (0..p.ncoeff)
            .map(|k| self.a[k] * u.powi(p.xorder(k)) * v.powi(p.yorder(k)))
            .sum()
    }

    /// Forward η at focal-plane pixels `(u, v)`, in degrees.
    pub fn eta(&self, u: f64, v: f64) -> f64 {
        let p = &self.poly;
        (0..p.ncoeff)
            .map(|k| self.b[k] * u.powi(p.xorder(k)) * v.powi(p.yorder(k)))
            .sum()
    }

    /// Forward transform `(u, v) → (ξ, η)`.
    pub fn uv_to_xieta(&self, u: f64, v: f64) -> (f64, f64) {
        (self.xi(u, v), self.eta(u, v))
    }

    /// Inverse transform `(ξ, η) → (u, v)`.
    ///
    /// Inverts the 2×2 linear part, then adds the `ap`, `bp` polynomial
    /// correction evaluated at the linear pre-image.
    pub fn xieta_to_uv(&self, xi: f64, eta: f64) -> (f64, f64) {
        let (u_lin, v_lin) = self.linear_preimage(xi, eta);
        let p = &self.poly;
        let mut u = u_lin;
        let mut v = v_lin;
        for k in 0..p.ncoeff {
            let t = u_lin.powi(p.xorder(k)) * v_lin.powi(p.yorder(k));
            u += self.ap[k] * t;
            v += self.bp[k] * t;
        }
        (u, v)
    }

    /// Pre-image of `(ξ, η)` under the 2×2 linear part alone.
    pub fn linear_preimage(&self, xi: f64, eta: f64) -> (f64, f64) {
        let det = self.a[0] * self.b[1] - self.a[1] * self.b[0];
        let u = (xi * self.b[1] - eta * self.a[1]) / det;
        let v = (-xi * self.b[0] + eta * self.a[0]) / det;
        (u, v)
    }

    /// ∂ξ/∂u.
    pub fn dxi_du(&self, u: f64, v: f64) -> f64 {
        let p = &self.poly;
        (0..p.ncoeff)
            .filter(|&k| p.xorder(k) >= 1)
            .map(|k| {
                self.a[k] * p.xorder(k) as f64 * u.powi(p.xorder(k) - 1) * v.powi(p.yorder(k))
            })
            .sum()
    }

    /// ∂ξ/∂v.
    pub fn dxi_dv(&self, u: f64, v: f64) -> f64 {
        let p = &self.poly;
        (0..p.ncoeff)
            .filter(|&k| p.yorder(k) >= 1)
            .map(|k| {
                self.a[k] * u.powi(p.xorder(k)) * p.yorder(k) as f64 * v.powi(p.yorder(k) - 1)
            })
            .sum()
    }

    /// ∂η/∂u.
    pub fn deta_du(&self, u: f64, v: f64) -> f64 {
        let p = &self.poly;
        (0..p.ncoeff)
            .filter(|&k| p.xorder(k) >= 1)
            .map(|k| {
                self.b[k] * p.xorder(k) as f64 * u.powi(p.xorder(k) - 1) * v.powi(p.yorder(k))
            })
            .sum()
    }

    /// ∂η/∂v.
    pub fn deta_dv(&self, u: f64, v: f64) -> f64 {
        let p = &self.poly;
        (0..p.ncoeff)
            .filter(|&k| p.yorder(k) >= 1)
            .map(|k| {
                self.b[k] * u.powi(p.xorder(k)) * p.yorder(k) as f64 * v.powi(p.yorder(k) - 1)
            })
            .sum()
    }

    /// Magnitude of the Jacobian determinant `|∂(ξ,η)/∂(u,v)|`.
    ///
    /// Used by the tangent-point relocation and by Jacobian image
    /// synthesis.
    pub fn det_j(&self, u: f64, v: f64) -> f64 {
        let a = self.dxi_du(u, v);
        let b = self.dxi_dv(u, v);
        let c = self.deta_du(u, v);
        let d = self.deta_dv(u, v);
        (a * d - b * c).abs()
    }

    /// Mean plate scale in degrees per pixel, from the CD determinant.
    pub fn pixel_scale(&self) -> f64 {
        (self.a[0] * self.b[1] - self.a[1] * self.b[0]).abs().sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_coeff(order: usize) -> Coeff {
        let poly = Arc::new(Poly::new(order));
        let mut c = Coeff::new(poly, ExpId(0));
        c.a[0] = 1.0;
        c.b[1] = 1.0;
        c
    }

    #[test]
    fn test_identity_forward() {
        let c = identity_coeff(3);
        let (xi, eta) = c.uv_to_xieta(12.5, -3.75);
        assert!((xi - 12.5).abs() < 1e-12);
        assert!((eta + 3.75).abs() < 1e-12);
    }

    #[test]
    fn test_linear_inverse_round_trip() {
        let poly = Arc::new(Poly::new(2));
        let mut c = Coeff::new(poly, ExpId(0));
        // A rotated, anisotropic linear part.
        c.a[0] = 1.1e-4;
        c.a[1] = -2.0e-5;
        c.b[0] = 1.5e-5;
        c.b[1] = 0.9e-4;
        let (xi, eta) = c.uv_to_xieta(500.0, -250.0);
        let (u, v) = c.xieta_to_uv(xi, eta);
        assert!((u - 500.0).abs() < 1e-9);
        assert!((v + 250.0).abs() < 1e-9);
    }

    #[test]
    fn test_derivatives_numeric() {
        use approx::assert_abs_diff_eq;

        let poly = Arc::new(Poly::new(3));
        let mut c = Coeff::new(poly, ExpId(0));
        c.a = vec![1.0, 0.1, 1e-3, -2e-3, 5e-4, 1e-6, 2e-6, -1e-6, 3e-7];
        c.b = vec![-0.05, 1.0, 2e-3, 1e-3, -8e-4, 2e-6, -1e-6, 4e-7, 1e-6];
        let (u, v) = (3.2, -1.7);
        let h = 1e-6;
        let num_dxi_du = (c.xi(u + h, v) - c.xi(u - h, v)) / (2.0 * h);
        let num_dxi_dv = (c.xi(u, v + h) - c.xi(u, v - h)) / (2.0 * h);
        let num_deta_du = (c.eta(u + h, v) - c.eta(u - h, v)) / (2.0 * h);
        let num_deta_dv = (c.eta(u, v + h) - c.eta(u, v - h)) / (2.0 * h);
        assert_abs_diff_eq!(c.dxi_du(u, v), num_dxi_du, epsilon = 1e-8);
        assert_abs_diff_eq!(c.dxi_dv(u, v), num_dxi_dv, epsilon = 1e-8);
        assert_abs_diff_eq!(c.deta_du(u, v), num_deta_du, epsilon = 1e-8);
        assert_abs_diff_eq!(c.deta_dv(u, v), num_deta_dv, epsilon = 1e-8);
    }

    #[test]
    fn test_det_j_identity() {
        let c = identity_coeff(2);
        assert!((c.det_j(100.0, 100.0) - 1.0).abs() < 1e-12);
        assert!((c.pixel_scale() - 1.0).abs() < 1e-12);
    }
}
