//! Covariance estimation for a solved bundle-adjustment problem.
//!
//! The estimator classifies the problem's parameter blocks into poses, points and
//! other parameters, eliminates the points with a Schur complement and recovers
//! the requested marginal covariances in tangent coordinates:
//!
//! - Pose covariances are `[rotation, translation]` blocks of `S⁻¹`
//! - Other-parameter covariances are diagonal blocks of `S⁻¹`
//! - Point covariances are `V⁻¹ + Yᵀ S⁻¹ Y` per point, never forming the full
//!   point-point inverse
//!
//! The problem is only read. Blocks held constant contribute no columns and never
//! show up in the result.
//!
//! # Example
//!
//! ```no_run
//! use ba_covariance::bundle_adjustment::{BundleAdjuster, BundleAdjustmentConfig, BundleAdjustmentOptions};
//! use ba_covariance::covariance::{BaCovarianceOptions, CovarianceParams, estimate_ba_covariance};
//! use ba_covariance::scene::{SyntheticDatasetOptions, synthesize_dataset};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut reconstruction = synthesize_dataset(&SyntheticDatasetOptions::default())?;
//! let mut config = BundleAdjustmentConfig::new();
//! for image_id in reconstruction.image_ids() {
//!     config.add_image(image_id);
//! }
//! let mut adjuster = BundleAdjuster::new(BundleAdjustmentOptions::default(), config, &reconstruction)?;
//! adjuster.solve()?;
//! adjuster.write_back(&mut reconstruction)?;
//!
//! let options = BaCovarianceOptions::default().with_params(CovarianceParams::PosesAndPoints);
//! let covariance = estimate_ba_covariance(&options, &reconstruction, &adjuster)?;
//! if let Some(cov) = covariance.point_cov(1) {
//!     println!("point 1 covariance: {cov}");
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use nalgebra::{DMatrix, Matrix3, Vector3};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{info, warn};

use crate::bundle_adjustment::BundleAdjuster;
use crate::core::{ParamBlockId, Problem};
use crate::manifold::{QuaternionManifold, skew};
use crate::scene::{ImageId, Point3DId, Reconstruction, Rigid3d};

pub mod catalog;
pub mod reference;
mod schur;

pub use catalog::{
    PointParam, PoseParam, extract_other_params, extract_point_params, extract_pose_params,
};
pub use reference::{ReferenceCovariance, SparseCholeskyReference};

/// Which parameter groups to recover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CovarianceParams {
    OnlyPoints,
    OnlyPoses,
    PosesAndPoints,
    /// Poses, points and all other variable blocks (e.g. intrinsics).
    #[default]
    All,
}

impl CovarianceParams {
    pub fn estimate_poses(&self) -> bool {
        !matches!(self, CovarianceParams::OnlyPoints)
    }

    pub fn estimate_points(&self) -> bool {
        !matches!(self, CovarianceParams::OnlyPoses)
    }

    pub fn estimate_others(&self) -> bool {
        matches!(self, CovarianceParams::All)
    }
}

/// Configuration for [`estimate_ba_covariance`].
#[derive(Debug, Clone)]
pub struct BaCovarianceOptions {
    pub params: CovarianceParams,
    /// Added to the diagonal of every point block before elimination. Must be
    /// non-negative. With zero damping the problem must be free of gauge
    /// freedom, otherwise estimation fails.
    pub damping: f64,
    /// Relative eigenvalue threshold below which a direction of the reduced system
    /// is treated as unobservable.
    pub rank_tolerance: f64,
    /// A point block whose smallest eigenvalue is at or below this fraction of its
    /// largest one is singular.
    pub point_block_tolerance: f64,
}

impl Default for BaCovarianceOptions {
    fn default() -> Self {
        Self {
            params: CovarianceParams::All,
            damping: 1e-8,
            rank_tolerance: 1e-12,
            point_block_tolerance: 1e-12,
        }
    }
}

impl BaCovarianceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(mut self, params: CovarianceParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    pub fn with_rank_tolerance(mut self, rank_tolerance: f64) -> Self {
        self.rank_tolerance = rank_tolerance;
        self
    }

    pub fn with_point_block_tolerance(mut self, point_block_tolerance: f64) -> Self {
        self.point_block_tolerance = point_block_tolerance;
        self
    }
}

/// Reasons the estimation as a whole can fail.
#[derive(Debug, Clone, Error)]
pub enum CovarianceError {
    /// Point information block is not invertible, typically with zero damping
    #[error(
        "Point {point3d_id} has a singular information block (eigenvalues in [{min_eigenvalue:.3e}, {max_eigenvalue:.3e}])"
    )]
    SingularPointBlock {
        point3d_id: Point3DId,
        min_eigenvalue: f64,
        max_eigenvalue: f64,
    },

    #[error("Schur complement contains non-finite entries")]
    NonFiniteSchurComplement,

    /// Without damping the caller must have removed every gauge freedom
    #[error("Undamped Schur complement is rank deficient by {rank_deficiency}")]
    RankDeficientSchurComplement { rank_deficiency: usize },

    /// Schur complement has significantly negative or no positive eigenvalues
    #[error(
        "Schur complement is not positive semi-definite (eigenvalues in [{min_eigenvalue:.3e}, {max_eigenvalue:.3e}])"
    )]
    IndefiniteSchurComplement {
        min_eigenvalue: f64,
        max_eigenvalue: f64,
    },

    /// Points must only interact through pose and other blocks
    #[error("Residual block {residual_block_id} couples points {first} and {second}")]
    PointCoupling {
        residual_block_id: usize,
        first: Point3DId,
        second: Point3DId,
    },

    #[error("Evaluation failed: {0}")]
    Evaluation(String),
}

/// Result type for covariance estimation
pub type CovarianceResult<T> = Result<T, CovarianceError>;

#[derive(Debug, Clone)]
struct PoseEntry {
    /// Columns of the image's blocks inside the joint pose covariance.
    indices: Vec<usize>,
    /// Set only when rotation and translation both have full tangent spaces.
    cam_from_world: Option<Rigid3d>,
}

/// Estimated covariances, keyed by reconstruction entity.
///
/// Immutable once produced. Lookups return `None` for unknown ids, groups that
/// were not requested and parameters that were held constant.
#[derive(Debug, Clone)]
pub struct BaCovariance {
    pose_covs: HashMap<ImageId, DMatrix<f64>>,
    pose_entries: HashMap<ImageId, PoseEntry>,
    joint_pose_cov: DMatrix<f64>,
    point_covs: HashMap<Point3DId, Matrix3<f64>>,
    other_covs: HashMap<ParamBlockId, DMatrix<f64>>,
    rank_deficiency: usize,
}

impl Default for BaCovariance {
    fn default() -> Self {
        Self {
            pose_covs: HashMap::new(),
            pose_entries: HashMap::new(),
            joint_pose_cov: DMatrix::zeros(0, 0),
            point_covs: HashMap::new(),
            other_covs: HashMap::new(),
            rank_deficiency: 0,
        }
    }
}

impl BaCovariance {
    /// Covariance of an image pose over `[rotation tangent, translation tangent]`.
    /// Only the blocks that were variable are included.
    pub fn cam_from_world_cov(&self, image_id: ImageId) -> Option<&DMatrix<f64>> {
        self.pose_covs.get(&image_id)
    }

    /// Cross-covariance between two estimated poses; rows follow `image_id1`.
    pub fn cam_from_world_cross_cov(
        &self,
        image_id1: ImageId,
        image_id2: ImageId,
    ) -> Option<DMatrix<f64>> {
        let rows = &self.pose_entries.get(&image_id1)?.indices;
        let cols = &self.pose_entries.get(&image_id2)?.indices;
        Some(DMatrix::from_fn(rows.len(), cols.len(), |i, j| {
            self.joint_pose_cov[(rows[i], cols[j])]
        }))
    }

    /// Covariance of `cam2_from_cam1 = cam2_from_world · cam1_from_world⁻¹`,
    /// propagated to first order.
    ///
    /// The relative rotation is perturbed on the right like the image rotations, so
    /// the result is over `[rotation tangent, translation]` as well. Requires both
    /// poses to be fully variable.
    pub fn cam2_from_cam1_cov(&self, image_id1: ImageId, image_id2: ImageId) -> Option<DMatrix<f64>> {
        let entry1 = self.pose_entries.get(&image_id1)?;
        let entry2 = self.pose_entries.get(&image_id2)?;
        let cam1_from_world = entry1.cam_from_world?;
        let cam2_from_world = entry2.cam_from_world?;

        let joint = self.cam_from_world_cross_cov_joint(&entry1.indices, &entry2.indices);
        let jacobian = relative_pose_jacobian(&cam1_from_world, &cam2_from_world);
        let cov = &jacobian * joint * jacobian.transpose();
        Some(0.5 * (&cov + cov.transpose()))
    }

    fn cam_from_world_cross_cov_joint(&self, indices1: &[usize], indices2: &[usize]) -> DMatrix<f64> {
        let indices: Vec<usize> = indices1.iter().chain(indices2).copied().collect();
        DMatrix::from_fn(indices.len(), indices.len(), |i, j| {
            self.joint_pose_cov[(indices[i], indices[j])]
        })
    }

    /// Marginal 3×3 covariance of a point position.
    pub fn point_cov(&self, point3d_id: Point3DId) -> Option<Matrix3<f64>> {
        self.point_covs.get(&point3d_id).copied()
    }

    /// Covariance of a block that is neither a pose nor a point.
    pub fn other_params_cov(&self, id: ParamBlockId) -> Option<&DMatrix<f64>> {
        self.other_covs.get(&id)
    }

    pub fn num_poses(&self) -> usize {
        self.pose_covs.len()
    }

    pub fn num_points(&self) -> usize {
        self.point_covs.len()
    }

    pub fn num_others(&self) -> usize {
        self.other_covs.len()
    }

    /// Number of directions of the reduced system treated as unobservable.
    pub fn rank_deficiency(&self) -> usize {
        self.rank_deficiency
    }
}

/// Jacobian of `cam2_from_cam1` with respect to `[δ1, τ1, δ2, τ2]`, where `δ` is
/// the right rotation perturbation and `τ` the translation increment.
fn relative_pose_jacobian(cam1_from_world: &Rigid3d, cam2_from_world: &Rigid3d) -> DMatrix<f64> {
    let r1 = cam1_from_world.rotation.to_rotation_matrix().into_inner();
    let r2 = cam2_from_world.rotation.to_rotation_matrix().into_inner();
    let r = r2 * r1.transpose();
    let t1_in_cam1: Vector3<f64> = r1.transpose() * cam1_from_world.translation;
    let d_translation_d_rotation = r2 * skew(&t1_in_cam1);

    let mut jacobian = DMatrix::zeros(6, 12);
    jacobian.view_mut((0, 0), (3, 3)).copy_from(&(-r1));
    jacobian.view_mut((0, 6), (3, 3)).copy_from(&r1);
    jacobian
        .view_mut((3, 0), (3, 3))
        .copy_from(&(-d_translation_d_rotation));
    jacobian.view_mut((3, 3), (3, 3)).copy_from(&(-r));
    jacobian
        .view_mut((3, 6), (3, 3))
        .copy_from(&d_translation_d_rotation);
    jacobian
        .view_mut((3, 9), (3, 3))
        .copy_from(&Matrix3::identity());
    jacobian
}

/// Estimate covariances for the problem held by a bundle adjuster.
pub fn estimate_ba_covariance(
    options: &BaCovarianceOptions,
    reconstruction: &Reconstruction,
    bundle_adjuster: &BundleAdjuster,
) -> CovarianceResult<BaCovariance> {
    estimate_ba_covariance_from_problem(options, reconstruction, bundle_adjuster.problem())
}

/// Estimate covariances at the current parameter values of `problem`.
///
/// # Panics
///
/// Panics if `options.damping` is negative or NaN, or if a point block does not
/// have a 3-dimensional tangent space.
pub fn estimate_ba_covariance_from_problem(
    options: &BaCovarianceOptions,
    reconstruction: &Reconstruction,
    problem: &Problem,
) -> CovarianceResult<BaCovariance> {
    assert!(
        options.damping >= 0.0,
        "damping must be non-negative, got {}",
        options.damping
    );

    let poses = extract_pose_params(reconstruction, problem);
    let points = extract_point_params(reconstruction, problem);
    let others = extract_other_params(problem, &poses, &points);

    info!(
        "Estimating {:?} covariances: {} poses, {} points, {} other blocks",
        options.params,
        poses.iter().filter(|p| p.is_estimable()).count(),
        points.iter().filter(|p| p.xyz.is_some()).count(),
        others.len()
    );

    let system = schur::eliminate_and_invert(options, problem, &poses, &points, &others)?;
    if system.rank_deficiency > 0 {
        warn!(
            "Reduced system is rank deficient by {}; unobservable directions get zero variance",
            system.rank_deficiency
        );
    }

    let mut result = BaCovariance {
        rank_deficiency: system.rank_deficiency,
        ..Default::default()
    };

    if options.params.estimate_poses() {
        let n = system.layout.num_pose_cols();
        result.joint_pose_cov = system.s_inv.view((0, 0), (n, n)).into_owned();
        for pose in poses.iter().filter(|p| p.is_estimable()) {
            let indices: Vec<usize> = pose
                .blocks()
                .filter_map(|id| system.layout.get(id))
                .flat_map(|(offset, size)| offset..offset + size)
                .collect();
            let cov = DMatrix::from_fn(indices.len(), indices.len(), |i, j| {
                system.s_inv[(indices[i], indices[j])]
            });
            result.pose_covs.insert(pose.image_id, cov);
            result.pose_entries.insert(
                pose.image_id,
                PoseEntry {
                    indices,
                    cam_from_world: full_pose_value(problem, pose),
                },
            );
        }
    }

    if options.params.estimate_others() {
        for &id in &others {
            if let Some((offset, size)) = system.layout.get(id) {
                let cov = system.s_inv.view((offset, offset), (size, size)).into_owned();
                result.other_covs.insert(id, cov);
            }
        }
    }

    if options.params.estimate_points() {
        result.point_covs = system
            .eliminations
            .par_iter()
            .map(|elimination| (elimination.point3d_id, elimination.covariance(&system.s_inv)))
            .collect();
    }

    info!(
        "Covariance estimation done: {} poses, {} points, {} other blocks",
        result.num_poses(),
        result.num_points(),
        result.num_others()
    );
    Ok(result)
}

/// Current pose of an image whose rotation and translation are both fully variable.
fn full_pose_value(problem: &Problem, pose: &PoseParam) -> Option<Rigid3d> {
    let (rotation, translation) = (pose.rotation?, pose.translation?);
    if problem.parameter_block_tangent_size(rotation) != 3
        || problem.parameter_block_tangent_size(translation) != 3
    {
        return None;
    }
    let q = QuaternionManifold::to_unit_quaternion(problem.parameter_block_values(rotation)).ok()?;
    let t = problem.parameter_block_values(translation);
    Some(Rigid3d::new(q, Vector3::new(t[0], t[1], t[2])))
}
