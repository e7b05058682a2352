//! Direct covariance computation from the full Gauss-Newton matrix.
//!
//! Used to validate the Schur-based estimator: `JᵀJ` over every variable block
//! is factorized once with sparse Cholesky and the requested columns of its
//! inverse are recovered by solving against unit vectors. No damping is applied,
//! so the problem must be fully constrained.

use faer::sparse::Triplet;
use nalgebra::DMatrix;
use tracing::debug;

use crate::core::{ColumnLayout, ParamBlockId, Problem};
use crate::linalg::{
    FaerMatrix, LinAlgError, LinAlgResult, SparseCholeskySolver, SparseMatrix, conversions,
};

/// Source of joint tangent-space covariances for a list of parameter blocks.
pub trait ReferenceCovariance {
    /// Joint covariance of `blocks`, laid out in the given order. `None` when a
    /// block is constant, unknown or the solve fails.
    fn compute(&self, blocks: &[ParamBlockId]) -> Option<DMatrix<f64>>;
}

pub struct SparseCholeskyReference {
    layout: ColumnLayout,
    tangent_sizes: Vec<usize>,
    scale: Vec<f64>,
    solver: SparseCholeskySolver,
}

impl SparseCholeskyReference {
    pub fn new(problem: &Problem) -> LinAlgResult<Self> {
        let layout = ColumnLayout::new(problem);
        let (_, jacobian) = problem
            .evaluate_jacobian(&layout)
            .map_err(|e| LinAlgError::InvalidInput(e.to_string()))?;

        // Unit-diagonal scaling keeps the factorization well conditioned when
        // parameters have very different units.
        let scale: Vec<f64> = column_squared_norms(&jacobian)
            .into_iter()
            .map(|d| if d > 0.0 { 1.0 / d.sqrt() } else { 1.0 })
            .collect();
        let scaled = scale_columns(&jacobian, &scale)?;
        let hessian = SparseCholeskySolver::compute_hessian(&scaled)?;

        let mut solver = SparseCholeskySolver::new();
        solver.factorize(&hessian)?;
        debug!(
            "Factorized {}x{} reference information matrix",
            hessian.nrows(),
            hessian.ncols()
        );

        let tangent_sizes = problem
            .parameter_block_ids()
            .map(|id| problem.parameter_block_tangent_size(id))
            .collect();

        Ok(Self {
            layout,
            tangent_sizes,
            scale,
            solver,
        })
    }

    fn columns_of(&self, blocks: &[ParamBlockId]) -> Option<Vec<usize>> {
        let mut columns = Vec::new();
        for &id in blocks {
            let offset = self.layout.offset(id)?;
            let size = *self.tangent_sizes.get(id.index())?;
            columns.extend(offset..offset + size);
        }
        Some(columns)
    }
}

impl ReferenceCovariance for SparseCholeskyReference {
    fn compute(&self, blocks: &[ParamBlockId]) -> Option<DMatrix<f64>> {
        let columns = self.columns_of(blocks)?;
        let n = self.layout.num_cols();
        let k = columns.len();

        let mut rhs = FaerMatrix::zeros(n, k);
        for (j, &col) in columns.iter().enumerate() {
            rhs[(col, j)] = 1.0;
        }
        let solution = self.solver.solve(&rhs).ok()?;

        let cov = DMatrix::from_fn(k, k, |i, j| {
            let (ci, cj) = (columns[i], columns[j]);
            self.scale[ci] * solution[(ci, j)] * self.scale[cj]
        });
        Some(0.5 * (&cov + cov.transpose()))
    }
}

fn column_squared_norms(matrix: &SparseMatrix) -> Vec<f64> {
    (0..matrix.ncols())
        .map(|col| matrix.val_of_col(col).iter().map(|v| v * v).sum())
        .collect()
}

fn scale_columns(matrix: &SparseMatrix, scale: &[f64]) -> LinAlgResult<SparseMatrix> {
    let symbolic = matrix.symbolic();
    let mut triplets = Vec::new();
    for (col, &s) in scale.iter().enumerate() {
        let rows = symbolic.row_idx_of_col_raw(col);
        let values = matrix.val_of_col(col);
        for (&row, &value) in rows.iter().zip(values) {
            triplets.push(Triplet::new(row, col, value * s));
        }
    }
    conversions::triplets_to_sparse(matrix.nrows(), matrix.ncols(), &triplets)
}
