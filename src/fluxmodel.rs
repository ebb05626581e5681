//! Field-dependent flux model.
//!
//! [`FluxFitParams`] is a bivariate polynomial over normalized focal-plane
//! coordinates, in either the monomial or the Chebyshev (first kind) basis,
//! that models the spatially varying part of the flux calibration. Unlike
//! the plate polynomial it includes the constant term; the flux fit holds
//! the constant and linear coefficients at zero to stay non-degenerate with
//! the exposure and chip zeropoints.

use crate::error::FitError;
use crate::wcs::{Header, HeaderValue};

/// Bivariate flux-correction polynomial with normalization scales.
#[derive(Debug, Clone)]
pub struct FluxFitParams {
    /// Total polynomial order.
    pub order: usize,
    /// Chebyshev (first kind) basis instead of plain monomials.
    pub chebyshev: bool,
    /// Catalog-anchored (absolute) rather than self-consistent (relative)
    /// photometric fit.
    pub absolute: bool,
    /// Number of coefficients: `(order+1)(order+2)/2`, constant included.
    pub ncoeff: usize,
    xorder: Vec<i32>,
    yorder: Vec<i32>,
    /// Coefficient vector, triangular order with the constant first.
    pub coeff: Vec<f64>,
    /// Normalization scale for `u`.
    pub u_max: f64,
    /// Normalization scale for `v`.
    pub v_max: f64,
    /// Focal-plane offset added to `u` before normalization.
    pub x0: f64,
    /// Focal-plane offset added to `v` before normalization.
    pub y0: f64,
}

impl FluxFitParams {
    /// Zero-coefficient model of the given order.
    pub fn new(order: usize, absolute: bool, chebyshev: bool) -> Self {
        let ncoeff = (order + 1) * (order + 2) / 2;
        let mut xorder = Vec::with_capacity(ncoeff);
        let mut yorder = Vec::with_capacity(ncoeff);
        for j in 0..=order as i32 {
            for i in 0..=j {
                xorder.push(j - i);
                yorder.push(i);
            }
        }
        debug_assert_eq!(xorder.len(), ncoeff);
        Self {
            order,
            chebyshev,
            absolute,
            ncoeff,
            xorder,
            yorder,
            coeff: vec![0.0; ncoeff],
            u_max: 1.0,
            v_max: 1.0,
            x0: 0.0,
            y0: 0.0,
        }
    }

    /// `u` exponent (or Chebyshev degree) of term `k`.
    #[inline]
    pub fn xorder(&self, k: usize) -> i32 {
        self.xorder[k]
    }

    /// `v` exponent (or Chebyshev degree) of term `k`.
    #[inline]
    pub fn yorder(&self, k: usize) -> i32 {
        self.yorder[k]
    }

    /// Index of the term with exponents `(i, j)`, or `None`.
    pub fn get_index(&self, i: i32, j: i32) -> Option<usize> {
        (0..self.ncoeff).find(|&k| self.xorder[k] == i && self.yorder[k] == j)
    }

    /// Evaluate the model at focal-plane pixels `(u, v)`, in magnitudes.
    pub fn eval(&self, u: f64, v: f64) -> f64 {
        let uu = (u + self.x0) / self.u_max;
        let vv = (v + self.y0) / self.v_max;
        if self.chebyshev {
            (0..self.ncoeff)
                .map(|k| self.coeff[k] * tn(self.xorder[k], uu) * tn(self.yorder[k], vv))
                .sum()
        } else {
            (0..self.ncoeff)
                .map(|k| self.coeff[k] * uu.powi(self.xorder[k]) * vv.powi(self.yorder[k]))
                .sum()
        }
    }

    /// Expand a Chebyshev-basis model into the equivalent monomial basis.
    ///
    /// The conversion is explicit rather than hidden in clone/copy; the
    /// result always has `chebyshev = false`. A model already in monomial
    /// form is returned unchanged.
    pub fn to_monomial(&self) -> FluxFitParams {
        if !self.chebyshev {
            return self.clone();
        }
        let mut out = FluxFitParams::new(self.order, self.absolute, false);
        out.u_max = self.u_max;
        out.v_max = self.v_max;
        out.x0 = self.x0;
        out.y0 = self.y0;
        let table = chebyshev_table(self.order);
        for k in 0..self.ncoeff {
            let xo = self.xorder[k] as usize;
            let yo = self.yorder[k] as usize;
            for i in 0..=xo {
                for j in 0..=yo {
                    let kk = out
                        .get_index(i as i32, j as i32)
                        .expect("expansion exponents lie inside the basis");
                    out.coeff[kk] += self.coeff[k] * table[xo][xo - i] * table[yo][yo - j];
                }
            }
        }
        out
    }

    /// Encode the model into a property map.
    pub fn to_header(&self) -> Header {
        let mut h = Header::new();
        h.set("ORDER", HeaderValue::Int(self.order as i64));
        h.set("ABSOLUTE", HeaderValue::Bool(self.absolute));
        h.set("CHEBYSHEV", HeaderValue::Bool(self.chebyshev));
        h.set("NCOEFF", HeaderValue::Int(self.ncoeff as i64));
        h.set("U_MAX", HeaderValue::Double(self.u_max));
        h.set("V_MAX", HeaderValue::Double(self.v_max));
        h.set("X0", HeaderValue::Double(self.x0));
        h.set("Y0", HeaderValue::Double(self.y0));
        for k in 0..self.ncoeff {
            let key = format!("C_{}_{}", self.xorder[k], self.yorder[k]);
            h.set(&key, HeaderValue::Double(self.coeff[k]));
        }
        h
    }

    /// Decode a model from a property map written by [`Self::to_header`].
    pub fn from_header(h: &Header) -> Result<Self, FitError> {
        let order = h.get_int("ORDER")? as usize;
        let absolute = h.get_bool("ABSOLUTE")?;
        let chebyshev = h.get_bool("CHEBYSHEV")?;
        let mut p = FluxFitParams::new(order, absolute, chebyshev);
        p.u_max = h.get_double("U_MAX")?;
        p.v_max = h.get_double("V_MAX")?;
        p.x0 = h.get_double("X0")?;
        p.y0 = h.get_double("Y0")?;
        for k in 0..p.ncoeff {
            let key = format!("C_{}_{}", p.xorder[k], p.yorder[k]);
            p.coeff[k] = h.get_double(&key)?;
        }
        Ok(p)
    }
}

/// Chebyshev polynomial of the first kind, `T_n(x)`.
pub fn tn(n: i32, x: f64) -> f64 {
    match n {
        0 => 1.0,
        1 => x,
        _ => {
            let mut tm1 = 1.0;
            let mut t = x;
            for _ in 2..=n {
                let next = 2.0 * x * t - tm1;
                tm1 = t;
                t = next;
            }
            t
        }
    }
}

/// Monomial expansion table for Chebyshev polynomials of the first kind.
///
/// `table[n][k]` is the coefficient of `x^(n-k)` in `T_n(x)`, so
/// `T_n(x) = Σ_i table[n][n-i] x^i`.
pub fn chebyshev_table(order: usize) -> Vec<Vec<f64>> {
    let mut table: Vec<Vec<f64>> = Vec::with_capacity(order + 1);
    table.push(vec![1.0]);
    if order >= 1 {
        table.push(vec![1.0, 0.0]);
    }
    for n in 2..=order {
        // T_n = 2x T_{n-1} - T_{n-2}
        let mut row = vec![0.0; n + 1];
        for (k, &c) in table[n - 1].iter().enumerate() {
            row[k] += 2.0 * c;
        }
        for (k, &c) in table[n - 2].iter().enumerate() {
            row[k + 2] -= c;
        }
        table.push(row);
    }
    table
}
