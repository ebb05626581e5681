//! Joint astrometric normal-equations assembler.
//!
//! One linearized system couples every exposure's polynomial correction,
//! every chip's placement correction (translation, and optionally yaw with a
//! Lagrange multiplier pinning `Σ dθ = 0`), and — in the with-stars variant —
//! two sky-position corrections per internal star observed at least twice.
//!
//! Block structure (column offsets):
//!
//! ```text
//! [ exp 0 poly | exp 1 poly | ... | chip 0 .. chip C | λ | star 0 .. star S ]
//!   2·ncoeff     2·ncoeff           np per chip        1    2 per star
//! ```
//!
//! Observations couple only their own exposure block to their own chip
//! block (through the focal-plane gradients of the forward transform) and,
//! for internal stars, to their star's 2-vector (through the tangent-plane
//! partials, entered with negative sign because the star position enters
//! the residual on the subtracted side).

use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

use crate::chip::ExpId;
use crate::coeff::Coeff;
use crate::error::FitError;
use crate::obs::Obs;
use crate::poly::Poly;
use crate::solver::linear::{alloc_system, solve_system};

// ── Block layout ────────────────────────────────────────────────────────────

/// Row/column offsets of the joint system.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockLayout {
    pub ncoeff: usize,
    pub nexp: usize,
    pub nchip: usize,
    pub solve_ccd: bool,
    pub allow_rotation: bool,
    /// Placement parameters per chip: 3 with rotation, 2 without, 0 when
    /// chips are held fixed.
    pub np: usize,
    /// Unknowns before the star block (includes the Lagrange multiplier).
    pub size0: usize,
    /// Stars carrying position unknowns.
    pub nstar2: usize,
    /// Total unknowns.
    pub size: usize,
}

impl BlockLayout {
    pub(crate) fn new(
        ncoeff: usize,
        nexp: usize,
        nchip: usize,
        solve_ccd: bool,
        allow_rotation: bool,
        nstar2: usize,
    ) -> Self {
        let (np, size0) = if solve_ccd {
            if allow_rotation {
                (3, 2 * ncoeff * nexp + 3 * nchip + 1)
            } else {
                (2, 2 * ncoeff * nexp + 2 * nchip)
            }
        } else {
            (0, 2 * ncoeff * nexp)
        };
        Self {
            ncoeff,
            nexp,
            nchip,
            solve_ccd,
            allow_rotation,
            np,
            size0,
            nstar2,
            size: size0 + 2 * nstar2,
        }
    }

    #[inline]
    pub(crate) fn exp_off(&self, jexp: usize) -> usize {
        2 * self.ncoeff * jexp
    }

    #[inline]
    pub(crate) fn chip_off(&self, jchip: usize) -> usize {
        2 * self.ncoeff * self.nexp + self.np * jchip
    }

    /// Row/column of the rotation-sum Lagrange multiplier.
    #[inline]
    pub(crate) fn rot_row(&self) -> usize {
        2 * self.ncoeff * self.nexp + self.np * self.nchip
    }

    #[inline]
    pub(crate) fn star_off(&self, jstar: usize) -> usize {
        self.size0 + 2 * jstar
    }
}

// ── Per-observation terms ───────────────────────────────────────────────────

/// Residuals, gradients and weights of one observation at the current
/// solution.
struct ObsTerms {
    ax: f64,
    ay: f64,
    bx: f64,
    by: f64,
    cx: f64,
    cy: f64,
    dx: f64,
    dy: f64,
    isx2: f64,
    isy2: f64,
}

/// Evaluate residuals `A`, gradients `B` (∂/∂u), `C` (∂/∂v), `D` (∂/∂θ) and
/// the per-axis inverse variances at `(u, v)`.
///
/// `cat_rms` is the catalog position floor added in quadrature; internal
/// stars pass zero because their positions are themselves free parameters.
fn compute_terms(
    o: &Obs,
    c: &Coeff,
    poly: &Poly,
    pu: &mut [f64],
    pv: &mut [f64],
    cat_rms: f64,
) -> ObsTerms {
    let n = poly.ncoeff;
    poly.fill_powers(o.u, o.v, pu, pv);

    let mut ax = o.xi;
    let mut ay = o.eta;
    let mut bx = 0.0;
    let mut by = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for k in 0..n {
        let xo = poly.xorder(k);
        let yo = poly.yorder(k);
        ax -= c.a[k] * pu[k] * pv[k];
        ay -= c.b[k] * pu[k] * pv[k];
        if xo >= 1 {
            let g = o.u.powi(xo - 1) * pv[k] * xo as f64;
            bx += c.a[k] * g;
            by += c.b[k] * g;
        }
        if yo >= 1 {
            let g = pu[k] * o.v.powi(yo - 1) * yo as f64;
            cx += c.a[k] * g;
            cy += c.b[k] * g;
        }
    }
    // Yaw gradient through the unshifted rotation: du/dθ = -v0, dv/dθ = u0.
    let dx = -o.v0 * bx + o.u0 * cx;
    let dy = -o.v0 * by + o.u0 * cy;

    let dxi = bx * o.xerr + cx * o.yerr;
    let deta = by * o.xerr + cy * o.yerr;
    let isx2 = 1.0 / (dxi * dxi + cat_rms * cat_rms);
    let isy2 = 1.0 / (deta * deta + cat_rms * cat_rms);

    ObsTerms {
        ax,
        ay,
        bx,
        by,
        cx,
        cy,
        dx,
        dy,
        isx2,
        isy2,
    }
}

/// Add one observation's polynomial and chip contributions.
fn add_common_blocks(
    m: &mut DMatrix<f64>,
    rhs: &mut DVector<f64>,
    o: &Obs,
    t: &ObsTerms,
    lay: &BlockLayout,
    pu: &[f64],
    pv: &[f64],
) {
    let n = lay.ncoeff;
    let eo = lay.exp_off(o.jexp);
    let co = lay.chip_off(o.jchip);

    for k in 0..n {
        let pk = pu[k] * pv[k];
        rhs[eo + k] += t.ax * pk * t.isx2;
        rhs[eo + n + k] += t.ay * pk * t.isy2;
        for j in 0..n {
            let pj = pu[j] * pv[j];
            m[(eo + j, eo + k)] += pj * pk * t.isx2;
            m[(eo + n + j, eo + n + k)] += pj * pk * t.isy2;
        }

        if lay.solve_ccd {
            m[(eo + k, co)] += t.bx * pk * t.isx2;
            m[(eo + k, co + 1)] += t.cx * pk * t.isx2;
            m[(eo + n + k, co)] += t.by * pk * t.isy2;
            m[(eo + n + k, co + 1)] += t.cy * pk * t.isy2;
            m[(co, eo + k)] += t.bx * pk * t.isx2;
            m[(co + 1, eo + k)] += t.cx * pk * t.isx2;
            m[(co, eo + n + k)] += t.by * pk * t.isy2;
            m[(co + 1, eo + n + k)] += t.cy * pk * t.isy2;
            if lay.allow_rotation {
                m[(eo + k, co + 2)] += t.dx * pk * t.isx2;
                m[(eo + n + k, co + 2)] += t.dy * pk * t.isy2;
                m[(co + 2, eo + k)] += t.dx * pk * t.isx2;
                m[(co + 2, eo + n + k)] += t.dy * pk * t.isy2;
            }
        }
    }

    if lay.solve_ccd {
        m[(co, co)] += t.bx * t.bx * t.isx2 + t.by * t.by * t.isy2;
        m[(co, co + 1)] += t.bx * t.cx * t.isx2 + t.by * t.cy * t.isy2;
        m[(co + 1, co)] += t.cx * t.bx * t.isx2 + t.cy * t.by * t.isy2;
        m[(co + 1, co + 1)] += t.cx * t.cx * t.isx2 + t.cy * t.cy * t.isy2;
        if lay.allow_rotation {
            m[(co, co + 2)] += t.bx * t.dx * t.isx2 + t.by * t.dy * t.isy2;
            m[(co + 1, co + 2)] += t.cx * t.dx * t.isx2 + t.cy * t.dy * t.isy2;
            m[(co + 2, co)] += t.dx * t.bx * t.isx2 + t.dy * t.by * t.isy2;
            m[(co + 2, co + 1)] += t.dx * t.cx * t.isx2 + t.dy * t.cy * t.isy2;
            m[(co + 2, co + 2)] += t.dx * t.dx * t.isx2 + t.dy * t.dy * t.isy2;
        }

        rhs[co] += t.ax * t.bx * t.isx2 + t.ay * t.by * t.isy2;
        rhs[co + 1] += t.ax * t.cx * t.isx2 + t.ay * t.cy * t.isy2;
        if lay.allow_rotation {
            rhs[co + 2] += t.ax * t.dx * t.isx2 + t.ay * t.dy * t.isy2;
        }
    }
}

/// Add one internal-star observation's position cross terms.
///
/// All entries carry a negative sign: the star's `(dra, ddec)` enters the
/// forecast on the subtracted side of the residual.
fn add_star_blocks(
    m: &mut DMatrix<f64>,
    rhs: &mut DVector<f64>,
    o: &Obs,
    t: &ObsTerms,
    lay: &BlockLayout,
    pu: &[f64],
    pv: &[f64],
) {
    let n = lay.ncoeff;
    let eo = lay.exp_off(o.jexp);
    let co = lay.chip_off(o.jchip);
    let so = lay.star_off(o.jstar.expect("star rows require a dense index"));

    for k in 0..n {
        let pk = pu[k] * pv[k];
        m[(eo + k, so)] -= o.xi_a * pk * t.isx2;
        m[(eo + k, so + 1)] -= o.xi_d * pk * t.isx2;
        m[(eo + n + k, so)] -= o.eta_a * pk * t.isy2;
        m[(eo + n + k, so + 1)] -= o.eta_d * pk * t.isy2;
        m[(so, eo + k)] -= o.xi_a * pk * t.isx2;
        m[(so + 1, eo + k)] -= o.xi_d * pk * t.isx2;
        m[(so, eo + n + k)] -= o.eta_a * pk * t.isy2;
        m[(so + 1, eo + n + k)] -= o.eta_d * pk * t.isy2;
    }

    if lay.solve_ccd {
        m[(co, so)] -= t.bx * o.xi_a * t.isx2 + t.by * o.eta_a * t.isy2;
        m[(co, so + 1)] -= t.bx * o.xi_d * t.isx2 + t.by * o.eta_d * t.isy2;
        m[(co + 1, so)] -= t.cx * o.xi_a * t.isx2 + t.cy * o.eta_a * t.isy2;
        m[(co + 1, so + 1)] -= t.cx * o.xi_d * t.isx2 + t.cy * o.eta_d * t.isy2;
        m[(so, co)] -= t.bx * o.xi_a * t.isx2 + t.by * o.eta_a * t.isy2;
        m[(so + 1, co)] -= t.bx * o.xi_d * t.isx2 + t.by * o.eta_d * t.isy2;
        m[(so, co + 1)] -= t.cx * o.xi_a * t.isx2 + t.cy * o.eta_a * t.isy2;
        m[(so + 1, co + 1)] -= t.cx * o.xi_d * t.isx2 + t.cy * o.eta_d * t.isy2;
        if lay.allow_rotation {
            m[(co + 2, so)] -= t.dx * o.xi_a * t.isx2 + t.dy * o.eta_a * t.isy2;
            m[(co + 2, so + 1)] -= t.dx * o.xi_d * t.isx2 + t.dy * o.eta_d * t.isy2;
            m[(so, co + 2)] -= t.dx * o.xi_a * t.isx2 + t.dy * o.eta_a * t.isy2;
            m[(so + 1, co + 2)] -= t.dx * o.xi_d * t.isx2 + t.dy * o.eta_d * t.isy2;
        }
    }

    m[(so, so)] += o.xi_a * o.xi_a * t.isx2 + o.eta_a * o.eta_a * t.isy2;
    m[(so, so + 1)] += o.xi_a * o.xi_d * t.isx2 + o.eta_a * o.eta_d * t.isy2;
    m[(so + 1, so)] += o.xi_d * o.xi_a * t.isx2 + o.eta_d * o.eta_a * t.isy2;
    m[(so + 1, so + 1)] += o.xi_d * o.xi_d * t.isx2 + o.eta_d * o.eta_d * t.isy2;

    rhs[so] -= t.ax * o.xi_a * t.isx2 + t.ay * o.eta_a * t.isy2;
    rhs[so + 1] -= t.ax * o.xi_d * t.isx2 + t.ay * o.eta_d * t.isy2;
}

/// Symmetric ones tying every chip's `dθ` to the Lagrange multiplier.
fn add_rotation_constraint(m: &mut DMatrix<f64>, lay: &BlockLayout) {
    let row = lay.rot_row();
    for jchip in 0..lay.nchip {
        let co = lay.chip_off(jchip) + 2;
        m[(co, row)] = 1.0;
        m[(row, co)] = 1.0;
    }
}

/// Pin empty exposure/chip blocks to zero correction so the factorization
/// stays regular after a block was warned out of the fit.
fn pin_empty_blocks(
    m: &mut DMatrix<f64>,
    lay: &BlockLayout,
    exp_counts: &[usize],
    chip_counts: &[usize],
) {
    for (jexp, &cnt) in exp_counts.iter().enumerate() {
        if cnt == 0 {
            let eo = lay.exp_off(jexp);
            for r in eo..eo + 2 * lay.ncoeff {
                m[(r, r)] = 1.0;
            }
        }
    }
    if lay.solve_ccd {
        for (jchip, &cnt) in chip_counts.iter().enumerate() {
            if cnt == 0 {
                let co = lay.chip_off(jchip);
                for r in co..co + lay.np {
                    if m[(r, r)] == 0.0 {
                        m[(r, r)] = 1.0;
                    }
                }
            }
        }
    }
}

// ── Under-determined block removal ──────────────────────────────────────────

/// Drop observations belonging to blocks that cannot be constrained.
///
/// Each good observation supplies two equations, so an exposure needs at
/// least `ncoeff` of them to cover its `2·ncoeff` polynomial unknowns, and
/// a chip at least `ceil(np/2)`. Dropping an exposure's rows can starve a
/// chip and vice versa, so the scan repeats until stable. Rejection is
/// monotone: flags are only ever cleared.
pub(crate) fn prune_underdetermined(
    matches: &mut [Obs],
    sources: &mut [Obs],
    coeffs: &[(ExpId, Coeff)],
    nchip: usize,
    ncoeff: usize,
    solve_ccd: bool,
    np: usize,
) {
    let nexp = coeffs.len();
    loop {
        let mut exp_counts = vec![0usize; nexp];
        let mut chip_counts = vec![0usize; nchip];
        for o in matches.iter().chain(sources.iter()) {
            if o.good {
                exp_counts[o.jexp] += 1;
                chip_counts[o.jchip] += 1;
            }
        }

        let mut changed = false;
        for (jexp, &cnt) in exp_counts.iter().enumerate() {
            if cnt > 0 && cnt < ncoeff {
                warn!(
                    "exposure {}: {cnt} good observations cannot constrain {} polynomial \
                     unknowns; excluded from the joint fit",
                    coeffs[jexp].0,
                    2 * ncoeff
                );
                for o in matches.iter_mut().chain(sources.iter_mut()) {
                    if o.jexp == jexp && o.good {
                        o.good = false;
                        changed = true;
                    }
                }
            }
        }
        if solve_ccd {
            for (jchip, &cnt) in chip_counts.iter().enumerate() {
                if cnt > 0 && 2 * cnt < np {
                    warn!(
                        "chip index {jchip}: {cnt} good observations cannot constrain its \
                         placement; excluded from the joint fit"
                    );
                    for o in matches.iter_mut().chain(sources.iter_mut()) {
                        if o.jchip == jchip && o.good {
                            o.good = false;
                            changed = true;
                        }
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }
}

// ── Star index densification ────────────────────────────────────────────────

/// Assign dense star indices to sources whose star has at least two good
/// observations; all other observations get `jstar = None`.
///
/// Returns the number of included stars.
pub(crate) fn assign_star_indices(sources: &mut [Obs], nstar: usize) -> usize {
    let mut counts = vec![0usize; nstar];
    for o in sources.iter() {
        if o.good {
            counts[o.istar] += 1;
        }
    }
    let mut dense = vec![None; nstar];
    let mut next = 0usize;
    for (istar, &cnt) in counts.iter().enumerate() {
        if cnt >= 2 {
            dense[istar] = Some(next);
            next += 1;
        }
    }
    for o in sources.iter_mut() {
        o.jstar = dense[o.istar];
    }
    next
}

// ── Assembly entry points ───────────────────────────────────────────────────

/// Assemble and solve the joint system over catalog matches only.
pub(crate) fn solve_lin_approx(
    matches: &[Obs],
    coeffs: &[(ExpId, Coeff)],
    nchip: usize,
    poly: &Poly,
    solve_ccd: bool,
    allow_rotation: bool,
    cat_rms: f64,
) -> Result<DVector<f64>, FitError> {
    let lay = BlockLayout::new(poly.ncoeff, coeffs.len(), nchip, solve_ccd, allow_rotation, 0);
    debug!("joint system size: {}", lay.size);
    let (mut m, mut rhs) = alloc_system(lay.size)?;
    let mut pu = vec![0.0; poly.ncoeff];
    let mut pv = vec![0.0; poly.ncoeff];

    let mut exp_counts = vec![0usize; lay.nexp];
    let mut chip_counts = vec![0usize; lay.nchip];
    for o in matches {
        if !o.good {
            continue;
        }
        exp_counts[o.jexp] += 1;
        chip_counts[o.jchip] += 1;
        let t = compute_terms(o, &coeffs[o.jexp].1, poly, &mut pu, &mut pv, cat_rms);
        add_common_blocks(&mut m, &mut rhs, o, &t, &lay, &pu, &pv);
    }

    if lay.solve_ccd && lay.allow_rotation {
        add_rotation_constraint(&mut m, &lay);
    }
    pin_empty_blocks(&mut m, &lay, &exp_counts, &chip_counts);

    solve_system(m, rhs)
}

/// Assemble and solve the joint system over matches plus internal stars.
///
/// Sources get fresh dense star indices; the returned layout carries the
/// star-block offset needed to apply the corrections.
pub(crate) fn solve_lin_approx_star(
    matches: &[Obs],
    sources: &mut [Obs],
    nstar: usize,
    coeffs: &[(ExpId, Coeff)],
    nchip: usize,
    poly: &Poly,
    solve_ccd: bool,
    allow_rotation: bool,
    cat_rms: f64,
) -> Result<(DVector<f64>, BlockLayout), FitError> {
    let nstar2 = assign_star_indices(sources, nstar);
    let lay = BlockLayout::new(
        poly.ncoeff,
        coeffs.len(),
        nchip,
        solve_ccd,
        allow_rotation,
        nstar2,
    );
    debug!("joint system size: {} ({nstar2} stars included)", lay.size);
    let (mut m, mut rhs) = alloc_system(lay.size)?;
    let mut pu = vec![0.0; poly.ncoeff];
    let mut pv = vec![0.0; poly.ncoeff];

    let mut exp_counts = vec![0usize; lay.nexp];
    let mut chip_counts = vec![0usize; lay.nchip];
    let mut num_obs_good = 0usize;
    let mut num_star_good = 0usize;

    for o in matches {
        if !o.good {
            continue;
        }
        num_obs_good += 1;
        exp_counts[o.jexp] += 1;
        chip_counts[o.jchip] += 1;
        let t = compute_terms(o, &coeffs[o.jexp].1, poly, &mut pu, &mut pv, cat_rms);
        add_common_blocks(&mut m, &mut rhs, o, &t, &lay, &pu, &pv);
    }
    for o in sources.iter() {
        if !o.good || o.jstar.is_none() {
            continue;
        }
        num_star_good += 1;
        exp_counts[o.jexp] += 1;
        chip_counts[o.jchip] += 1;
        let t = compute_terms(o, &coeffs[o.jexp].1, poly, &mut pu, &mut pv, 0.0);
        add_common_blocks(&mut m, &mut rhs, o, &t, &lay, &pu, &pv);
        add_star_blocks(&mut m, &mut rhs, o, &t, &lay, &pu, &pv);
    }
    debug!("good observations: {num_obs_good} matched, {num_star_good} internal");

    if lay.solve_ccd && lay.allow_rotation {
        add_rotation_constraint(&mut m, &lay);
    }
    pin_empty_blocks(&mut m, &lay, &exp_counts, &chip_counts);

    let sol = solve_system(m, rhs)?;
    Ok((sol, lay))
}

// ── Chi-squared and rejection ───────────────────────────────────────────────

/// Unweighted chi-squared of the forward model over good observations.
///
/// With `norm` the mean squared residual is returned instead of the sum.
pub(crate) fn calc_chi2(obs: &[Obs], coeffs: &[(ExpId, Coeff)], norm: bool) -> f64 {
    let mut chi2 = 0.0;
    let mut num = 0usize;
    for o in obs {
        if !o.good {
            continue;
        }
        let c = &coeffs[o.jexp].1;
        let (xi_fit, eta_fit) = c.uv_to_xieta(o.u, o.v);
        chi2 += (o.xi - xi_fit).powi(2) + (o.eta - eta_fit).powi(2);
        num += 1;
    }
    if norm {
        if num == 0 {
            0.0
        } else {
            chi2 / num as f64
        }
    } else {
        chi2
    }
}

/// Combined chi-squared of matches and internal sources.
pub(crate) fn calc_chi2_star(
    matches: &[Obs],
    sources: &[Obs],
    coeffs: &[(ExpId, Coeff)],
) -> f64 {
    calc_chi2(matches, coeffs, false) + calc_chi2(sources, coeffs, false)
}

/// Reject observations whose error-scaled squared residual exceeds `e2`.
///
/// The per-axis scale propagates the pixel errors through the local
/// gradients, with `cat_rms` added in quadrature for catalog rows.
pub(crate) fn flag_outliers(
    obs: &mut [Obs],
    coeffs: &[(ExpId, Coeff)],
    poly: &Poly,
    e2: f64,
    cat_rms: f64,
) -> usize {
    let mut pu = vec![0.0; poly.ncoeff];
    let mut pv = vec![0.0; poly.ncoeff];
    let mut nreject = 0usize;
    for o in obs.iter_mut() {
        if !o.good {
            continue;
        }
        let t = compute_terms(o, &coeffs[o.jexp].1, poly, &mut pu, &mut pv, cat_rms);
        let chi2 = t.ax * t.ax * t.isx2 + t.ay * t.ay * t.isy2;
        if chi2 > e2 {
            o.good = false;
            nreject += 1;
        }
    }
    debug!("rejected {nreject} observations");
    nreject
}
