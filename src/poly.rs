//! Bivariate polynomial basis shared by the plate model.
//!
//! The basis of total order `n` contains every monomial `u^i · v^j` with
//! `1 ≤ i + j ≤ n` — the constant term is deliberately absent because the
//! astrometric fit absorbs it into the tangent-plane center. Terms are
//! enumerated in row-major triangular order:
//!
//! ```text
//! (1,0), (0,1), (2,0), (1,1), (0,2), ..., (n,0), ..., (0,n)
//! ```
//!
//! One `Poly` instance is shared (via `Arc`) by every per-exposure solution
//! of a mosaic fit, so the enumeration order is part of the solver contract.

/// Constant-free bivariate polynomial basis of a given total order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Poly {
    order: usize,
    /// Number of basis terms: `(order+1)(order+2)/2 - 1`.
    pub ncoeff: usize,
    xorder: Vec<i32>,
    yorder: Vec<i32>,
}

impl Poly {
    /// Create the basis for the given total order (must be >= 1).
    pub fn new(order: usize) -> Self {
        assert!(order >= 1, "polynomial order must be >= 1");
        let ncoeff = (order + 1) * (order + 2) / 2 - 1;
        let mut xorder = Vec::with_capacity(ncoeff);
        let mut yorder = Vec::with_capacity(ncoeff);
        for j in 1..=order as i32 {
            for i in 0..=j {
                xorder.push(j - i);
                yorder.push(i);
            }
        }
        debug_assert_eq!(xorder.len(), ncoeff);
        Self {
            order,
            ncoeff,
            xorder,
            yorder,
        }
    }

    /// Total order of the basis.
    pub fn order(&self) -> usize {
        self.order
    }

    /// `u` exponent of term `k`.
    #[inline]
    pub fn xorder(&self, k: usize) -> i32 {
        self.xorder[k]
    }

    /// `v` exponent of term `k`.
    #[inline]
    pub fn yorder(&self, k: usize) -> i32 {
        self.yorder[k]
    }

    /// Index of the term with exponents `(i, j)`, or `None` if the pair is
    /// not part of the basis.
    pub fn get_index(&self, i: i32, j: i32) -> Option<usize> {
        (0..self.ncoeff).find(|&k| self.xorder[k] == i && self.yorder[k] == j)
    }

    /// Fill `pu[k] = u^xorder[k]` and `pv[k] = v^yorder[k]` for every term.
    ///
    /// The assemblers hoist these powers out of their inner accumulation
    /// loops; the slices must have length `ncoeff`.
    pub fn fill_powers(&self, u: f64, v: f64, pu: &mut [f64], pv: &mut [f64]) {
        for k in 0..self.ncoeff {
            pu[k] = u.powi(self.xorder[k]);
            pv[k] = v.powi(self.yorder[k]);
        }
    }
}
