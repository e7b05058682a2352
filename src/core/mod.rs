//! Core optimization components
//!
//! - Problem formulation over parameter blocks with manifold metadata
//! - Residual blocks pairing a factor with the blocks it reads
//! - Scoped constant marking

pub mod problem;
pub mod residual_block;

pub use problem::{ColumnLayout, ConstantBlocksGuard, ParamBlockId, Problem, StorageKey};
pub use residual_block::{LinearizedResidual, ResidualBlock};
