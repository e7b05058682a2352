use std::ops::Mul;

use faer::linalg::solvers::Solve;
use faer::sparse::Triplet;
use faer::sparse::linalg::solvers::{Llt, SymbolicLlt};
use faer::{Mat, Side};

use super::{FaerMatrix, LinAlgError, LinAlgResult, SparseLinearSolver, SparseMatrix, conversions};

/// Sparse Cholesky (LLᵀ) solver for symmetric positive definite systems.
///
/// Besides solving normal equations for the optimizer, a factorized solver can be
/// reused to solve against many right-hand sides, which is what the reference
/// covariance computation needs.
pub struct SparseCholeskySolver {
    factor: Option<Llt<usize, f64>>,
}

impl Default for SparseCholeskySolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self { factor: None }
    }

    /// Compute the Gauss-Newton matrix `H = JᵀJ`.
    pub fn compute_hessian(jacobians: &SparseMatrix) -> LinAlgResult<SparseMatrix> {
        let jacobians_t = jacobians
            .as_ref()
            .transpose()
            .to_col_major()
            .map_err(|e| LinAlgError::MatrixConversion(format!("Transpose failed: {e:?}")))?;
        Ok(jacobians_t.mul(jacobians.as_ref()))
    }

    /// Return `H + λI` as a new sparse matrix.
    pub fn add_diagonal(hessian: &SparseMatrix, lambda: f64) -> LinAlgResult<SparseMatrix> {
        let n = hessian.ncols();
        let symbolic = hessian.symbolic();
        let mut triplets = Vec::new();
        for col in 0..n {
            let row_indices = symbolic.row_idx_of_col_raw(col);
            let col_values = hessian.val_of_col(col);
            for (idx, &row) in row_indices.iter().enumerate() {
                triplets.push(Triplet::new(row, col, col_values[idx]));
            }
            triplets.push(Triplet::new(col, col, lambda));
        }
        conversions::triplets_to_sparse(hessian.nrows(), n, &triplets)
    }

    /// Factorize a symmetric positive definite matrix.
    pub fn factorize(&mut self, matrix: &SparseMatrix) -> LinAlgResult<()> {
        self.factor = None;
        let symbolic = SymbolicLlt::try_new(matrix.symbolic(), Side::Lower).map_err(|e| {
            LinAlgError::FactorizationFailed(format!("Symbolic Cholesky failed: {e:?}"))
        })?;
        let factor = Llt::try_new_with_symbolic(symbolic, matrix.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::SingularMatrix(format!("Cholesky failed: {e:?}")))?;
        self.factor = Some(factor);
        Ok(())
    }

    pub fn is_factorized(&self) -> bool {
        self.factor.is_some()
    }

    /// Solve against the last factorization.
    pub fn solve(&self, rhs: &FaerMatrix) -> LinAlgResult<FaerMatrix> {
        let factor = self
            .factor
            .as_ref()
            .ok_or_else(|| LinAlgError::InvalidInput("Solver is not factorized".to_string()))?;
        let solution = factor.solve(rhs.as_ref());
        for j in 0..solution.ncols() {
            for i in 0..solution.nrows() {
                if !solution[(i, j)].is_finite() {
                    return Err(LinAlgError::SingularMatrix(
                        "Cholesky solve produced non-finite values".to_string(),
                    ));
                }
            }
        }
        Ok(solution)
    }
}

impl SparseLinearSolver for SparseCholeskySolver {
    fn solve_normal_equation(
        &mut self,
        residuals: &FaerMatrix,
        jacobians: &SparseMatrix,
    ) -> LinAlgResult<FaerMatrix> {
        let hessian = Self::compute_hessian(jacobians)?;
        let gradient: Mat<f64> = jacobians.as_ref().transpose().mul(-residuals);
        self.factorize(&hessian)?;
        self.solve(&gradient)
    }

    fn solve_augmented_equation(
        &mut self,
        residuals: &FaerMatrix,
        jacobians: &SparseMatrix,
        lambda: f64,
    ) -> LinAlgResult<FaerMatrix> {
        let hessian = Self::compute_hessian(jacobians)?;
        let gradient: Mat<f64> = jacobians.as_ref().transpose().mul(-residuals);
        let augmented = Self::add_diagonal(&hessian, lambda)?;
        self.factorize(&augmented)?;
        self.solve(&gradient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-10;

    fn create_test_system() -> (SparseMatrix, Mat<f64>) {
        let triplets = vec![
            Triplet::new(0, 0, 2.0),
            Triplet::new(0, 1, 1.0),
            Triplet::new(1, 1, 3.0),
            Triplet::new(2, 0, 1.0),
            Triplet::new(2, 2, 1.5),
            Triplet::new(3, 1, 0.5),
            Triplet::new(3, 2, 2.0),
        ];
        let jacobian = conversions::triplets_to_sparse(4, 3, &triplets).unwrap();
        let residuals = Mat::from_fn(4, 1, |i, _| [0.5, -1.0, 0.25, 2.0][i]);
        (jacobian, residuals)
    }

    #[test]
    fn test_normal_equation_matches_dense_solution() {
        let (jacobian, residuals) = create_test_system();
        let mut solver = SparseCholeskySolver::new();
        let dx = solver.solve_normal_equation(&residuals, &jacobian).unwrap();

        let j = conversions::sparse_to_dense(&jacobian);
        let r = nalgebra::DVector::from_fn(4, |i, _| residuals[(i, 0)]);
        let h = j.transpose() * &j;
        let expected = h.cholesky().unwrap().solve(&(-(j.transpose() * r)));
        for i in 0..3 {
            assert!((dx[(i, 0)] - expected[i]).abs() < TOLERANCE);
        }
    }

    #[test]
    fn test_augmented_equation_shrinks_step() {
        let (jacobian, residuals) = create_test_system();
        let mut solver = SparseCholeskySolver::new();
        let plain = solver.solve_normal_equation(&residuals, &jacobian).unwrap();
        let damped = solver
            .solve_augmented_equation(&residuals, &jacobian, 100.0)
            .unwrap();
        let norm = |m: &Mat<f64>| (0..3).map(|i| m[(i, 0)] * m[(i, 0)]).sum::<f64>();
        assert!(norm(&damped) < norm(&plain));
    }

    #[test]
    fn test_singular_matrix_fails() {
        let triplets = vec![Triplet::new(0, 0, 1.0), Triplet::new(1, 0, 1.0)];
        let jacobian = conversions::triplets_to_sparse(2, 2, &triplets).unwrap();
        let hessian = SparseCholeskySolver::compute_hessian(&jacobian).unwrap();
        let mut solver = SparseCholeskySolver::new();
        let result = solver
            .factorize(&hessian)
            .and_then(|_| solver.solve(&Mat::from_fn(2, 1, |_, _| 1.0)));
        assert!(result.is_err());
    }

    #[test]
    fn test_solve_requires_factorization() {
        let solver = SparseCholeskySolver::new();
        assert!(!solver.is_factorized());
        assert!(solver.solve(&Mat::zeros(2, 1)).is_err());
    }
}
