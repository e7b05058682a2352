//! Reconstruction data model: cameras, images, 3D points and their tracks.
//!
//! This is the minimal scene description the bundle adjuster and the covariance
//! parameter catalog need. Entities are addressed by integer ids; the
//! `INVALID_*` sentinels never refer to a stored entity.

pub mod camera;
pub mod reconstruction;
pub mod rigid3;
pub mod synthetic;

pub use camera::{Camera, CameraModelId};
pub use reconstruction::{Image, Point2D, Point3D, Reconstruction, TrackElement};
pub use rigid3::Rigid3d;
pub use synthetic::{SyntheticDatasetOptions, synthesize_dataset};

pub type CameraId = u32;
pub type ImageId = u32;
pub type Point3DId = u64;

pub const INVALID_CAMERA_ID: CameraId = CameraId::MAX;
pub const INVALID_IMAGE_ID: ImageId = ImageId::MAX;
pub const INVALID_POINT3D_ID: Point3DId = Point3DId::MAX;
