//! Linear algebra utilities.
//!
//! - Sparse matrices and sparse Cholesky factorization using faer
//! - Dense helpers for the small blocks of the covariance engine using nalgebra

use faer::sparse::{SparseColMat, Triplet};
use nalgebra::DMatrix;
use thiserror::Error;

pub mod cholesky;

pub use cholesky::SparseCholeskySolver;

/// Type alias for sparse matrices using faer
pub type SparseMatrix = SparseColMat<usize, f64>;

/// Type alias for faer matrices (used for vectors)
pub type FaerMatrix = faer::Mat<f64>;

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed (Cholesky, QR, etc.)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Singular matrix detected (matrix is not invertible)
    #[error("Singular matrix detected (matrix is not invertible): {0}")]
    SingularMatrix(String),

    /// Failed to create sparse matrix from triplets
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Matrix format conversion failed
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),

    /// Invalid input provided to linear solver
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Common interface for sparse normal-equation solvers
pub trait SparseLinearSolver {
    /// Solve `(JᵀJ) dx = -Jᵀr`.
    fn solve_normal_equation(
        &mut self,
        residuals: &FaerMatrix,
        jacobians: &SparseMatrix,
    ) -> LinAlgResult<FaerMatrix>;

    /// Solve `(JᵀJ + λI) dx = -Jᵀr`.
    fn solve_augmented_equation(
        &mut self,
        residuals: &FaerMatrix,
        jacobians: &SparseMatrix,
        lambda: f64,
    ) -> LinAlgResult<FaerMatrix>;
}

/// Utility functions for sparse matrix operations
pub mod conversions {
    use super::*;

    /// Create sparse matrix from triplets using faer
    pub fn triplets_to_sparse(
        rows: usize,
        cols: usize,
        triplets: &[Triplet<usize, usize, f64>],
    ) -> LinAlgResult<SparseMatrix> {
        SparseColMat::try_new_from_triplets(rows, cols, triplets)
            .map_err(|e| LinAlgError::SparseMatrixCreation(format!("{e:?}")))
    }

    /// Copy a sparse matrix into a dense nalgebra matrix.
    pub fn sparse_to_dense(matrix: &SparseMatrix) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(matrix.nrows(), matrix.ncols());
        let symbolic = matrix.symbolic();
        for col in 0..matrix.ncols() {
            let row_indices = symbolic.row_idx_of_col_raw(col);
            let col_values = matrix.val_of_col(col);
            for (idx, &row) in row_indices.iter().enumerate() {
                dense[(row, col)] += col_values[idx];
            }
        }
        dense
    }

    /// Copy a dense faer matrix into nalgebra.
    pub fn faer_to_nalgebra(matrix: &FaerMatrix) -> DMatrix<f64> {
        DMatrix::from_fn(matrix.nrows(), matrix.ncols(), |i, j| matrix[(i, j)])
    }
}

/// Force exact symmetry: `A = (A + Aᵀ) / 2`.
pub fn symmetrize(matrix: &mut DMatrix<f64>) {
    let n = matrix.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (matrix[(i, j)] + matrix[(j, i)]);
            matrix[(i, j)] = avg;
            matrix[(j, i)] = avg;
        }
    }
}
