//! Gnomonic (TAN) projection and its analytic partial derivatives.
//!
//! The standard gnomonic projection of a source at `(a, d)` onto the plane
//! tangent at `(a0, d0)`:
//!
//! ```text
//! denom = sin d0 sin d + cos d0 cos d cos(a - a0)
//! ξ     = cos d sin(a - a0) / denom
//! η     = (cos d0 sin d - sin d0 cos d cos(a - a0)) / denom
//! ```
//!
//! All angles are radians; the returned values are dimensionless tangent-plane
//! offsets (radians for small separations). The fit linearizes the projection
//! in both the source position and the tangent point, so all ten first
//! partials are provided as separate pure functions.
//!
//! Reference: Calabretta & Greisen (2002), FITS WCS Paper II, §5.1.1.

/// Degrees per radian. The mosaic fit carries ξ, η and their partials in
/// degrees; the conversion happens at the observation layer.
pub const R2D: f64 = 180.0 / std::f64::consts::PI;

/// Radians per degree.
pub const D2R: f64 = std::f64::consts::PI / 180.0;

#[inline]
fn denom(a: f64, d: f64, a0: f64, d0: f64) -> f64 {
    d0.sin() * d.sin() + d0.cos() * d.cos() * (a - a0).cos()
}

/// ξ of the gnomonic projection.
#[inline]
pub fn cal_xi(a: f64, d: f64, a0: f64, d0: f64) -> f64 {
    d.cos() * (a - a0).sin() / denom(a, d, a0, d0)
}

/// ∂ξ/∂a (source right ascension).
#[inline]
pub fn cal_xi_a(a: f64, d: f64, a0: f64, d0: f64) -> f64 {
    let den = denom(a, d, a0, d0);
    d0.cos() * d.cos().powi(2) * (a - a0).sin().powi(2) / den.powi(2)
        + d.cos() * (a - a0).cos() / den
}

/// ∂ξ/∂d (source declination).
#[inline]
pub fn cal_xi_d(a: f64, d: f64, a0: f64, d0: f64) -> f64 {
    let den = denom(a, d, a0, d0);
    -d.cos() * (a - a0).sin() * (d0.sin() * d.cos() - d0.cos() * d.sin() * (a - a0).cos())
        / den.powi(2)
        - d.sin() * (a - a0).sin() / den
}

/// ∂ξ/∂a0 (tangent-point right ascension).
#[inline]
pub fn cal_xi_a0(a: f64, d: f64, a0: f64, d0: f64) -> f64 {
    let den = denom(a, d, a0, d0);
    -d0.cos() * d.cos().powi(2) * (a - a0).sin().powi(2) / den.powi(2)
        - d.cos() * (a - a0).cos() / den
}

/// ∂ξ/∂d0 (tangent-point declination).
#[inline]
pub fn cal_xi_d0(a: f64, d: f64, a0: f64, d0: f64) -> f64 {
    let den = denom(a, d, a0, d0);
    -d.cos() * (a - a0).sin() * (d0.cos() * d.sin() - d0.sin() * d.cos() * (a - a0).cos())
        / den.powi(2)
}

/// η of the gnomonic projection.
#[inline]
pub fn cal_eta(a: f64, d: f64, a0: f64, d0: f64) -> f64 {
    (d0.cos() * d.sin() - d0.sin() * d.cos() * (a - a0).cos()) / denom(a, d, a0, d0)
}

/// ∂η/∂a (source right ascension).
#[inline]
pub fn cal_eta_a(a: f64, d: f64, a0: f64, d0: f64) -> f64 {
    let den = denom(a, d, a0, d0);
    d0.cos() * d.cos() * (a - a0).sin()
        * (d0.cos() * d.sin() - d0.sin() * d.cos() * (a - a0).cos())
        / den.powi(2)
        + d0.sin() * d.cos() * (a - a0).sin() / den
}

/// ∂η/∂d (source declination).
#[inline]
pub fn cal_eta_d(a: f64, d: f64, a0: f64, d0: f64) -> f64 {
    let den = denom(a, d, a0, d0);
    -(d0.sin() * d.cos() - d0.cos() * d.sin() * (a - a0).cos())
        * (d0.cos() * d.sin() - d0.sin() * d.cos() * (a - a0).cos())
        / den.powi(2)
        + (d0.cos() * d.cos() + d0.sin() * d.sin() * (a - a0).cos()) / den
}

/// ∂η/∂a0 (tangent-point right ascension).
#[inline]
pub fn cal_eta_a0(a: f64, d: f64, a0: f64, d0: f64) -> f64 {
    let den = denom(a, d, a0, d0);
    -d0.cos() * d.cos() * (a - a0).sin()
        * (d0.cos() * d.sin() - d0.sin() * d.cos() * (a - a0).cos())
        / den.powi(2)
        - d0.sin() * d.cos() * (a - a0).sin() / den
}

/// ∂η/∂d0 (tangent-point declination).
#[inline]
pub fn cal_eta_d0(a: f64, d: f64, a0: f64, d0: f64) -> f64 {
    let den = denom(a, d, a0, d0);
    -(d0.cos() * d.sin() - d0.sin() * d.cos() * (a - a0).cos()).powi(2) / den.powi(2) - 1.0
}

/// Inverse gnomonic projection.
///
/// Given tangent-plane offsets `(ξ, η)` in radians at reference point
/// `(a0, d0)`, returns celestial coordinates `(a, d)` in radians.
pub fn inverse_gnomonic(xi: f64, eta: f64, a0: f64, d0: f64) -> (f64, f64) {
    let sin_d0 = d0.sin();
    let cos_d0 = d0.cos();
    let rho_sq = xi * xi + eta * eta;

    if rho_sq < 1e-30 {
        return (a0, d0);
    }

    let rho = rho_sq.sqrt();
    let c = rho.atan();
    let sin_c = c.sin();
    let cos_c = c.cos();

    let d = (cos_c * sin_d0 + eta * sin_c * cos_d0 / rho).asin();
    let a = a0 + (xi * sin_c).atan2(rho * cos_d0 * cos_c - eta * sin_d0 * sin_c);
    (a, d)
}
