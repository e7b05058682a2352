//! Nonlinear least-squares optimization of a [`crate::core::Problem`].
//!
//! Only Levenberg-Marquardt is provided; the bundle adjuster uses it to bring a
//! problem to a converged state before covariance estimation.

use std::fmt;

use thiserror::Error;

pub mod levenberg_marquardt;

pub use levenberg_marquardt::{LevenbergMarquardt, LevenbergMarquardtConfig, LevenbergMarquardtSummary};

/// Optimizer specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// Residual or Jacobian evaluation failed
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// Parameter update could not be applied
    #[error("Parameter update failed: {0}")]
    Update(String),

    /// Cost became non-finite
    #[error("Numerical failure: {0}")]
    NumericalFailure(String),
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Status of an optimization process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// Nothing to optimize
    NoVariables,
    /// Maximum number of iterations reached
    MaxIterationsReached,
    /// Cost function tolerance reached
    CostToleranceReached,
    /// Parameter tolerance reached
    ParameterToleranceReached,
    /// Gradient tolerance reached
    GradientToleranceReached,
    /// Damping grew past its upper bound without an accepted step
    DampingLimitReached,
    /// Timeout reached
    Timeout,
}

impl OptimizationStatus {
    /// Whether the optimizer stopped because a convergence criterion was met.
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            OptimizationStatus::NoVariables
                | OptimizationStatus::CostToleranceReached
                | OptimizationStatus::ParameterToleranceReached
                | OptimizationStatus::GradientToleranceReached
        )
    }
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::NoVariables => write!(f, "No variables"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::CostToleranceReached => write!(f, "Cost tolerance reached"),
            OptimizationStatus::ParameterToleranceReached => {
                write!(f, "Parameter tolerance reached")
            }
            OptimizationStatus::GradientToleranceReached => write!(f, "Gradient tolerance reached"),
            OptimizationStatus::DampingLimitReached => write!(f, "Damping limit reached"),
            OptimizationStatus::Timeout => write!(f, "Timeout"),
        }
    }
}
