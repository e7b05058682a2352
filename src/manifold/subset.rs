//! Euclidean manifold with a subset of coordinates held constant.

use nalgebra::{DMatrix, DVector};

use super::{Manifold, ManifoldError, ManifoldResult, check_ambient, check_tangent};

/// Euclidean block of `size` values where `constant_indices` never move.
///
/// The tangent space is made of the remaining coordinates in increasing index
/// order.
#[derive(Debug, Clone, PartialEq)]
pub struct SubsetManifold {
    size: usize,
    free_indices: Vec<usize>,
}

impl SubsetManifold {
    /// Create a subset manifold.
    ///
    /// Fails when an index is out of range or when every coordinate would be held
    /// constant (such a block should be marked constant instead).
    pub fn new(size: usize, constant_indices: &[usize]) -> ManifoldResult<Self> {
        let mut is_constant = vec![false; size];
        for &idx in constant_indices {
            if idx >= size {
                return Err(ManifoldError::InvalidDefinition(format!(
                    "constant index {idx} out of range for block of size {size}"
                )));
            }
            is_constant[idx] = true;
        }
        let free_indices: Vec<usize> = (0..size).filter(|&i| !is_constant[i]).collect();
        if free_indices.is_empty() {
            return Err(ManifoldError::InvalidDefinition(
                "all coordinates are constant".to_string(),
            ));
        }
        Ok(Self { size, free_indices })
    }

    /// Coordinates that take part in the tangent space.
    pub fn free_indices(&self) -> &[usize] {
        &self.free_indices
    }
}

impl Manifold for SubsetManifold {
    fn ambient_size(&self) -> usize {
        self.size
    }

    fn tangent_size(&self) -> usize {
        self.free_indices.len()
    }

    fn plus(&self, x: &[f64], delta: &[f64]) -> ManifoldResult<DVector<f64>> {
        check_ambient(self.size, x.len())?;
        check_tangent(self.free_indices.len(), delta.len())?;
        let mut result = DVector::from_row_slice(x);
        for (&idx, &d) in self.free_indices.iter().zip(delta) {
            result[idx] += d;
        }
        Ok(result)
    }

    fn plus_jacobian(&self, x: &[f64]) -> ManifoldResult<DMatrix<f64>> {
        check_ambient(self.size, x.len())?;
        let mut jacobian = DMatrix::zeros(self.size, self.free_indices.len());
        for (col, &idx) in self.free_indices.iter().enumerate() {
            jacobian[(idx, col)] = 1.0;
        }
        Ok(jacobian)
    }
}
