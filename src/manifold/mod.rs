//! Tangent-space parameterizations for optimization variables.
//!
//! A parameter block stores its value in an *ambient* representation (for example
//! four quaternion coefficients). Optimizers and covariance estimators work in the
//! block's *tangent* space, whose dimension may be smaller. A [`Manifold`]
//! connects the two:
//!
//! Manifold          | ambient | tangent | plus(x, δ)
//! ----------------- | ------- | ------- | ---------------------------
//! Euclidean (none)  | n       | n       | x + δ
//! Quaternion        | 4       | 3       | q ⊗ Exp(δ)
//! Subset            | n       | n − k   | x + P δ (k coordinates fixed)
//!
//! Blocks without a manifold are treated as Euclidean by the problem.

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use std::fmt::Debug;
use thiserror::Error;

pub mod quaternion;
pub mod subset;

pub use quaternion::QuaternionManifold;
pub use subset::SubsetManifold;

/// Errors that can occur during manifold operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ManifoldError {
    /// Invalid tangent vector dimension
    #[error("Invalid tangent dimension: expected {expected}, got {actual}")]
    InvalidTangentDimension { expected: usize, actual: usize },

    /// Invalid ambient vector dimension
    #[error("Invalid ambient dimension: expected {expected}, got {actual}")]
    InvalidAmbientDimension { expected: usize, actual: usize },

    /// Invalid manifold element
    #[error("Invalid manifold element: {0}")]
    InvalidElement(String),

    /// Invalid manifold construction parameters
    #[error("Invalid manifold definition: {0}")]
    InvalidDefinition(String),
}

/// Result type for manifold operations.
pub type ManifoldResult<T> = Result<T, ManifoldError>;

/// Local parameterization of a parameter block.
///
/// `plus_jacobian` returns ∂plus(x, δ)/∂δ evaluated at δ = 0, an
/// `ambient_size × tangent_size` matrix. Multiplying a residual Jacobian taken with
/// respect to the ambient coordinates by this matrix yields the Jacobian with
/// respect to the tangent coordinates.
pub trait Manifold: Send + Sync + Debug {
    /// Number of stored values.
    fn ambient_size(&self) -> usize;

    /// Dimension of the local tangent space.
    fn tangent_size(&self) -> usize;

    /// Apply a tangent-space increment to an ambient value.
    fn plus(&self, x: &[f64], delta: &[f64]) -> ManifoldResult<DVector<f64>>;

    /// Jacobian of `plus` with respect to the increment at zero.
    fn plus_jacobian(&self, x: &[f64]) -> ManifoldResult<DMatrix<f64>>;
}

pub(crate) fn check_ambient(expected: usize, actual: usize) -> ManifoldResult<()> {
    if expected != actual {
        return Err(ManifoldError::InvalidAmbientDimension { expected, actual });
    }
    Ok(())
}

pub(crate) fn check_tangent(expected: usize, actual: usize) -> ManifoldResult<()> {
    if expected != actual {
        return Err(ManifoldError::InvalidTangentDimension { expected, actual });
    }
    Ok(())
}

/// Skew-symmetric matrix `[v]×` such that `[v]× w = v × w`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skew_matches_cross_product() {
        let a = Vector3::new(0.3, -1.2, 2.0);
        let b = Vector3::new(-0.7, 0.4, 1.1);
        let diff = skew(&a) * b - a.cross(&b);
        assert!(diff.norm() < 1e-15);
    }

    #[test]
    fn test_dimension_checks() {
        assert!(check_ambient(4, 4).is_ok());
        assert_eq!(
            check_tangent(3, 2),
            Err(ManifoldError::InvalidTangentDimension {
                expected: 3,
                actual: 2
            })
        );
    }
}
