//! Guarded dense normal-equations storage and LU solve.
//!
//! The joint system can reach `2·ncoeff·nexp + 3·nchip + 1 + 2·nstar`
//! unknowns; the dense `size × size` working matrix is allocated through a
//! fallible reservation so that an impossible request surfaces as
//! [`FitError::OutOfMemory`] with the byte count in the diagnostic instead
//! of aborting the process.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::error::FitError;

/// Allocate a zeroed `size × size` system matrix and right-hand side.
pub(crate) fn alloc_system(size: usize) -> Result<(DMatrix<f64>, DVector<f64>), FitError> {
    let elems = size
        .checked_mul(size)
        .ok_or(FitError::OutOfMemory { bytes: usize::MAX })?;
    let bytes = elems.saturating_mul(std::mem::size_of::<f64>());
    let mut data: Vec<f64> = Vec::new();
    data.try_reserve_exact(elems)
        .map_err(|_| FitError::OutOfMemory { bytes })?;
    data.resize(elems, 0.0);
    debug!("allocated {size}x{size} normal-equations system ({bytes} bytes)");
    Ok((DMatrix::from_vec(size, size, data), DVector::zeros(size)))
}

/// Solve `A x = b` by dense LU with partial pivoting.
///
/// The matrix is consumed; a zero pivot reports [`FitError::SingularSystem`].
pub(crate) fn solve_system(a: DMatrix<f64>, b: DVector<f64>) -> Result<DVector<f64>, FitError> {
    a.lu().solve(&b).ok_or(FitError::SingularSystem)
}
