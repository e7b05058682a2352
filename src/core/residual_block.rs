use nalgebra as na;

use crate::core::problem::ParamBlockId;
use crate::factors::Factor;

/// A factor together with the parameter blocks it reads.
#[derive(Debug)]
pub struct ResidualBlock {
    pub residual_block_id: usize,
    pub residual_row_start_idx: usize,
    pub parameter_blocks: Vec<ParamBlockId>,
    pub factor: Box<dyn Factor>,
}

impl ResidualBlock {
    pub fn new(
        residual_block_id: usize,
        residual_row_start_idx: usize,
        parameter_blocks: &[ParamBlockId],
        factor: Box<dyn Factor>,
    ) -> Self {
        ResidualBlock {
            residual_block_id,
            residual_row_start_idx,
            parameter_blocks: parameter_blocks.to_vec(),
            factor,
        }
    }

    pub fn dim_residual(&self) -> usize {
        self.factor.residual_dimension()
    }
}

/// Residual and tangent-space Jacobian blocks of one residual block.
///
/// `jacobians[i]` belongs to `parameter_blocks[i]` and is `None` when that block is
/// held constant.
#[derive(Debug, Clone)]
pub struct LinearizedResidual {
    pub residual_block_id: usize,
    pub parameter_blocks: Vec<ParamBlockId>,
    pub residual: na::DVector<f64>,
    pub jacobians: Vec<Option<na::DMatrix<f64>>>,
}

impl LinearizedResidual {
    pub fn squared_norm(&self) -> f64 {
        self.residual.norm_squared()
    }
}
