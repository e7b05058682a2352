//! Nonlinear least-squares problem over parameter blocks.
//!
//! Parameter blocks live in an arena and are addressed by [`ParamBlockId`]. A block
//! may carry a [`StorageKey`] naming the reconstruction field it mirrors, and an
//! optional manifold describing its tangent space. Blocks without a manifold are
//! Euclidean.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use faer::sparse::Triplet;
use nalgebra as na;
use rayon::prelude::*;
use tracing::debug;

use crate::core::residual_block::{LinearizedResidual, ResidualBlock};
use crate::error::BaCovResult;
use crate::factors::Factor;
use crate::linalg::{FaerMatrix, SparseMatrix, conversions};
use crate::manifold::{Manifold, ManifoldError, ManifoldResult};
use crate::scene::{CameraId, ImageId, Point3DId};

/// Arena index of a parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamBlockId(usize);

impl ParamBlockId {
    /// Never refers to a block of any problem.
    pub const INVALID: ParamBlockId = ParamBlockId(usize::MAX);

    pub fn index(&self) -> usize {
        self.0
    }
}

/// Reconstruction storage a parameter block mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    ImageRotation(ImageId),
    ImageTranslation(ImageId),
    Point3D(Point3DId),
    CameraParams(CameraId),
}

#[derive(Debug, Clone)]
struct ParameterBlock {
    values: na::DVector<f64>,
    manifold: Option<Arc<dyn Manifold>>,
    constant: bool,
    key: Option<StorageKey>,
}

impl ParameterBlock {
    fn tangent_size(&self) -> usize {
        self.manifold
            .as_ref()
            .map_or(self.values.len(), |m| m.tangent_size())
    }
}

/// Column offsets of the variable (non-constant) blocks in a global tangent-space
/// Jacobian, in block id order.
#[derive(Debug, Clone)]
pub struct ColumnLayout {
    offsets: Vec<Option<usize>>,
    num_cols: usize,
}

impl ColumnLayout {
    pub fn new(problem: &Problem) -> Self {
        let mut offsets = Vec::with_capacity(problem.blocks.len());
        let mut num_cols = 0;
        for block in &problem.blocks {
            if block.constant {
                offsets.push(None);
            } else {
                offsets.push(Some(num_cols));
                num_cols += block.tangent_size();
            }
        }
        Self { offsets, num_cols }
    }

    pub fn offset(&self, id: ParamBlockId) -> Option<usize> {
        self.offsets.get(id.0).copied().flatten()
    }

    pub fn num_cols(&self) -> usize {
        self.num_cols
    }
}

pub struct Problem {
    blocks: Vec<ParameterBlock>,
    keys: HashMap<StorageKey, ParamBlockId>,
    residual_blocks: Vec<ResidualBlock>,
    total_residual_dimension: usize,
}

impl Default for Problem {
    fn default() -> Self {
        Self::new()
    }
}

impl Problem {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            keys: HashMap::new(),
            residual_blocks: Vec::new(),
            total_residual_dimension: 0,
        }
    }

    fn block(&self, id: ParamBlockId) -> &ParameterBlock {
        self.blocks
            .get(id.0)
            .unwrap_or_else(|| panic!("parameter block {id:?} does not belong to this problem"))
    }

    fn block_mut(&mut self, id: ParamBlockId) -> &mut ParameterBlock {
        self.blocks
            .get_mut(id.0)
            .unwrap_or_else(|| panic!("parameter block {id:?} does not belong to this problem"))
    }

    pub fn add_parameter_block(&mut self, values: &[f64]) -> ParamBlockId {
        let id = ParamBlockId(self.blocks.len());
        self.blocks.push(ParameterBlock {
            values: na::DVector::from_column_slice(values),
            manifold: None,
            constant: false,
            key: None,
        });
        id
    }

    /// Add a block mirroring `key`. Adding the same key twice returns the existing
    /// block and leaves its values untouched.
    pub fn add_parameter_block_with_key(&mut self, key: StorageKey, values: &[f64]) -> ParamBlockId {
        if let Some(&id) = self.keys.get(&key) {
            assert_eq!(
                self.block(id).values.len(),
                values.len(),
                "{key:?} was added with a different size"
            );
            return id;
        }
        let id = self.add_parameter_block(values);
        self.blocks[id.0].key = Some(key);
        self.keys.insert(key, id);
        id
    }

    pub fn set_manifold(&mut self, id: ParamBlockId, manifold: Arc<dyn Manifold>) -> ManifoldResult<()> {
        let block = self.block_mut(id);
        if manifold.ambient_size() != block.values.len() {
            return Err(ManifoldError::InvalidAmbientDimension {
                expected: block.values.len(),
                actual: manifold.ambient_size(),
            });
        }
        block.manifold = Some(manifold);
        Ok(())
    }

    pub fn manifold(&self, id: ParamBlockId) -> Option<&dyn Manifold> {
        self.block(id).manifold.as_deref()
    }

    pub fn has_parameter_block(&self, id: ParamBlockId) -> bool {
        id.0 < self.blocks.len()
    }

    pub fn set_parameter_block_constant(&mut self, id: ParamBlockId) {
        self.block_mut(id).constant = true;
    }

    pub fn set_parameter_block_variable(&mut self, id: ParamBlockId) {
        self.block_mut(id).constant = false;
    }

    pub fn is_parameter_block_constant(&self, id: ParamBlockId) -> bool {
        self.block(id).constant
    }

    pub fn parameter_block_size(&self, id: ParamBlockId) -> usize {
        self.block(id).values.len()
    }

    /// Local (tangent) dimension, taken from the block's manifold when it has one.
    pub fn parameter_block_tangent_size(&self, id: ParamBlockId) -> usize {
        self.block(id).tangent_size()
    }

    pub fn parameter_block_values(&self, id: ParamBlockId) -> &[f64] {
        self.block(id).values.as_slice()
    }

    pub fn set_parameter_block_values(&mut self, id: ParamBlockId, values: &[f64]) {
        let block = self.block_mut(id);
        assert_eq!(block.values.len(), values.len(), "size mismatch for {id:?}");
        block.values.copy_from_slice(values);
    }

    pub fn find_parameter_block(&self, key: &StorageKey) -> Option<ParamBlockId> {
        self.keys.get(key).copied()
    }

    pub fn storage_key(&self, id: ParamBlockId) -> Option<StorageKey> {
        self.block(id).key
    }

    pub fn parameter_block_ids(&self) -> impl Iterator<Item = ParamBlockId> + '_ {
        (0..self.blocks.len()).map(ParamBlockId)
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.residual_blocks.len()
    }

    pub fn num_residuals(&self) -> usize {
        self.total_residual_dimension
    }

    pub fn residual_blocks(&self) -> &[ResidualBlock] {
        &self.residual_blocks
    }

    /// # Panics
    /// Panics if the blocks do not match the factor's arity or ambient sizes.
    pub fn add_residual_block(&mut self, factor: Box<dyn Factor>, blocks: &[ParamBlockId]) -> usize {
        let sizes = factor.parameter_block_sizes();
        assert_eq!(
            sizes.len(),
            blocks.len(),
            "factor expects {} parameter blocks, got {}",
            sizes.len(),
            blocks.len()
        );
        for (&id, &size) in blocks.iter().zip(sizes) {
            assert_eq!(
                self.parameter_block_size(id),
                size,
                "parameter block {id:?} has the wrong size for this factor"
            );
        }
        let residual_block_id = self.residual_blocks.len();
        let dim = factor.residual_dimension();
        self.residual_blocks.push(ResidualBlock::new(
            residual_block_id,
            self.total_residual_dimension,
            blocks,
            factor,
        ));
        self.total_residual_dimension += dim;
        residual_block_id
    }

    /// Evaluate one residual block with Jacobians in tangent coordinates.
    pub fn linearize_residual_block(&self, residual_block_id: usize) -> ManifoldResult<LinearizedResidual> {
        let residual_block = &self.residual_blocks[residual_block_id];
        let params: Vec<na::DVector<f64>> = residual_block
            .parameter_blocks
            .iter()
            .map(|&id| self.block(id).values.clone())
            .collect();
        let (residual, ambient_jacobian) = residual_block.factor.linearize(&params, true);
        let ambient_jacobian = ambient_jacobian.ok_or_else(|| {
            ManifoldError::InvalidDefinition("factor returned no Jacobian".to_string())
        })?;

        let mut jacobians = Vec::with_capacity(params.len());
        let mut col = 0;
        for &id in &residual_block.parameter_blocks {
            let block = self.block(id);
            let ambient = block.values.len();
            if block.constant {
                jacobians.push(None);
            } else {
                let columns = ambient_jacobian.columns(col, ambient);
                let tangent_jacobian = match &block.manifold {
                    Some(manifold) => columns * manifold.plus_jacobian(block.values.as_slice())?,
                    None => columns.into_owned(),
                };
                jacobians.push(Some(tangent_jacobian));
            }
            col += ambient;
        }

        Ok(LinearizedResidual {
            residual_block_id,
            parameter_blocks: residual_block.parameter_blocks.clone(),
            residual,
            jacobians,
        })
    }

    /// Linearize every residual block in parallel.
    pub fn linearize(&self) -> ManifoldResult<Vec<LinearizedResidual>> {
        (0..self.residual_blocks.len())
            .into_par_iter()
            .map(|idx| self.linearize_residual_block(idx))
            .collect()
    }

    /// `0.5 · Σ ‖r‖²` at the current values.
    pub fn cost(&self) -> f64 {
        0.5 * self
            .residual_blocks
            .par_iter()
            .map(|residual_block| {
                let params: Vec<na::DVector<f64>> = residual_block
                    .parameter_blocks
                    .iter()
                    .map(|&id| self.block(id).values.clone())
                    .collect();
                residual_block.factor.linearize(&params, false).0.norm_squared()
            })
            .sum::<f64>()
    }

    /// Stack residuals and assemble the sparse tangent-space Jacobian for `layout`.
    pub fn evaluate_jacobian(&self, layout: &ColumnLayout) -> BaCovResult<(FaerMatrix, SparseMatrix)> {
        let linearized = self.linearize()?;
        let mut residuals = FaerMatrix::zeros(self.total_residual_dimension, 1);
        let mut triplets = Vec::new();
        for lin in &linearized {
            let row_start = self.residual_blocks[lin.residual_block_id].residual_row_start_idx;
            for (i, value) in lin.residual.iter().enumerate() {
                residuals[(row_start + i, 0)] = *value;
            }
            for (id, jacobian) in lin.parameter_blocks.iter().zip(&lin.jacobians) {
                let (Some(jacobian), Some(col_start)) = (jacobian, layout.offset(*id)) else {
                    continue;
                };
                for c in 0..jacobian.ncols() {
                    for r in 0..jacobian.nrows() {
                        let value = jacobian[(r, c)];
                        if value != 0.0 {
                            triplets.push(Triplet::new(row_start + r, col_start + c, value));
                        }
                    }
                }
            }
        }
        let jacobian =
            conversions::triplets_to_sparse(self.total_residual_dimension, layout.num_cols(), &triplets)?;
        Ok((residuals, jacobian))
    }

    /// Apply a stacked tangent step to every variable block of `layout`.
    pub fn apply_tangent_step(&mut self, layout: &ColumnLayout, step: &FaerMatrix) -> ManifoldResult<()> {
        assert_eq!(step.nrows(), layout.num_cols(), "step size mismatch");
        for (idx, block) in self.blocks.iter_mut().enumerate() {
            let Some(offset) = layout.offset(ParamBlockId(idx)) else {
                continue;
            };
            let delta: Vec<f64> = (0..block.tangent_size()).map(|i| step[(offset + i, 0)]).collect();
            block.values = match &block.manifold {
                Some(manifold) => manifold.plus(block.values.as_slice(), &delta)?,
                None => &block.values + na::DVector::from_vec(delta),
            };
        }
        Ok(())
    }

    pub fn snapshot_values(&self) -> Vec<na::DVector<f64>> {
        self.blocks.iter().map(|b| b.values.clone()).collect()
    }

    pub fn restore_values(&mut self, values: Vec<na::DVector<f64>>) {
        assert_eq!(values.len(), self.blocks.len(), "snapshot size mismatch");
        for (block, v) in self.blocks.iter_mut().zip(values) {
            block.values = v;
        }
    }
}

/// Marks blocks constant for its lifetime and restores them when dropped.
///
/// Only blocks that were variable on entry are touched, so nesting guards or
/// passing already-constant blocks is safe.
pub struct ConstantBlocksGuard<'a> {
    problem: &'a mut Problem,
    changed: Vec<ParamBlockId>,
}

impl<'a> ConstantBlocksGuard<'a> {
    pub fn new(problem: &'a mut Problem, blocks: impl IntoIterator<Item = ParamBlockId>) -> Self {
        let mut changed = Vec::new();
        for id in blocks {
            if !problem.is_parameter_block_constant(id) {
                problem.set_parameter_block_constant(id);
                changed.push(id);
            }
        }
        debug!("Temporarily holding {} parameter blocks constant", changed.len());
        Self { problem, changed }
    }
}

impl Deref for ConstantBlocksGuard<'_> {
    type Target = Problem;

    fn deref(&self) -> &Problem {
        self.problem
    }
}

impl DerefMut for ConstantBlocksGuard<'_> {
    fn deref_mut(&mut self) -> &mut Problem {
        self.problem
    }
}

impl Drop for ConstantBlocksGuard<'_> {
    fn drop(&mut self) {
        for &id in &self.changed {
            self.problem.set_parameter_block_variable(id);
        }
    }
}
