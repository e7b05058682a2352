//! Error types for the ba-covariance library
//!
//! Every module carries its own `thiserror` enum. This module provides the
//! crate-level error that all of them convert into, so binaries and tests can use
//! a single `?`-friendly result type.

use crate::{
    covariance::CovarianceError, linalg::LinAlgError, manifold::ManifoldError,
    optimizer::OptimizerError,
};
use thiserror::Error;

/// Main result type used throughout the ba-covariance library
pub type BaCovResult<T> = Result<T, BaCovError>;

/// Main error type for the ba-covariance library
#[derive(Debug, Clone, Error)]
pub enum BaCovError {
    /// Linear algebra related errors
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(String),

    /// Manifold operations errors
    #[error("Manifold error: {0}")]
    Manifold(String),

    /// Covariance estimation errors
    #[error("Covariance error: {0}")]
    Covariance(String),

    /// Optimizer related errors
    #[error("Optimizer error: {0}")]
    Optimizer(String),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<LinAlgError> for BaCovError {
    fn from(err: LinAlgError) -> Self {
        BaCovError::LinearAlgebra(err.to_string())
    }
}

impl From<ManifoldError> for BaCovError {
    fn from(err: ManifoldError) -> Self {
        BaCovError::Manifold(err.to_string())
    }
}

impl From<CovarianceError> for BaCovError {
    fn from(err: CovarianceError) -> Self {
        BaCovError::Covariance(err.to_string())
    }
}

impl From<OptimizerError> for BaCovError {
    fn from(err: OptimizerError) -> Self {
        BaCovError::Optimizer(err.to_string())
    }
}
