//! Residual functions for the bundle-adjustment problem.
//!
//! A factor maps the ambient values of its parameter blocks to a residual vector
//! and, on request, the Jacobian with respect to those ambient values. Columns are
//! laid out block after block in the order the blocks were passed to
//! [`crate::core::problem::Problem::add_residual_block`]. Conversion to tangent
//! coordinates is the problem's job.

use std::fmt;

use nalgebra::{DMatrix, DVector};

pub mod reprojection;

pub use reprojection::ReprojectionFactor;

pub trait Factor: fmt::Debug + Send + Sync {
    /// Number of residual rows.
    fn residual_dimension(&self) -> usize;

    /// Ambient size of every parameter block the factor reads, in order.
    fn parameter_block_sizes(&self) -> &[usize];

    /// Evaluate the residual and, if `compute_jacobian` is set, the ambient Jacobian
    /// (`residual_dimension × Σ parameter_block_sizes`).
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>);
}
