//! Crate error type.
//!
//! Fatal failure modes of the fit surface here; soft conditions
//! (under-determined blocks, chi-squared divergence) are logged and handled
//! in place by the solvers instead of unwinding.

use thiserror::Error;

/// Errors produced by the mosaic fit.
#[derive(Debug, Error)]
pub enum FitError {
    /// Malformed input: bad polynomial order, empty exposure or chip sets,
    /// duplicate identifiers.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The normal-equations matrix is numerically singular (LU reported a
    /// zero pivot).
    #[error("normal-equations matrix is singular")]
    SingularSystem,

    /// The dense solver working memory could not be allocated.
    #[error("cannot allocate solver working memory ({bytes} bytes required)")]
    OutOfMemory {
        /// Size of the failed allocation in bytes.
        bytes: usize,
    },

    /// A required header keyword is absent or has the wrong type.
    #[error("header keyword {0}: {1}")]
    Header(String, &'static str),
}
