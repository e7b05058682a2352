//! # BA Covariance
//!
//! Uncertainty estimation for solved bundle-adjustment problems.
//!
//! Given a converged problem over camera poses, 3D points and camera
//! intrinsics, the estimator produces marginal covariances in each parameter's
//! tangent space without forming or inverting the full normal-equation matrix.
//!
//! ## Features
//!
//! - **Schur-Complement Engine**: Points are eliminated block by block, the reduced
//!   pose/intrinsics system is pseudo-inverted and point covariances are recovered
//!   from the partitioned inverse
//! - **Gauge Handling**: Rank-revealing inversion of the reduced system plus
//!   point-block damping
//! - **Bundle Adjustment**: Reprojection factors, quaternion and subset manifolds,
//!   sparse Levenberg-Marquardt built on faer
//! - **Validation**: A sparse Cholesky reference covariance and deterministic
//!   synthetic scenes
//!
//! ## Covariance Groups
//!
//! - **Poses**: `[rotation tangent, translation]` per image
//! - **Points**: 3×3 position covariance per 3D point
//! - **Others**: every remaining variable block, e.g. camera intrinsics

pub mod bundle_adjustment;
pub mod core;
pub mod covariance;
pub mod error;
pub mod factors;
pub mod linalg;
pub mod logger;
pub mod manifold;
pub mod optimizer;
pub mod scene;

// Re-export core types
pub use core::{ConstantBlocksGuard, ParamBlockId, Problem, StorageKey};
pub use error::{BaCovError, BaCovResult};

// Re-export the bundle adjuster
pub use bundle_adjustment::{BundleAdjuster, BundleAdjustmentConfig, BundleAdjustmentOptions};

// Re-export covariance estimation
pub use covariance::{
    BaCovariance, BaCovarianceOptions, CovarianceError, CovarianceParams, ReferenceCovariance,
    SparseCholeskyReference, estimate_ba_covariance, estimate_ba_covariance_from_problem,
};

// Re-export logger
pub use logger::{init_logger, init_logger_with_level};

// Re-export scene types
pub use scene::{Camera, CameraModelId, Image, Point3D, Reconstruction, Rigid3d};
