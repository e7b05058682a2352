//! Synthetic reconstructions for tests and benchmarks.
//!
//! Images sit on a ring around a cloud of points and look at its center, so every
//! point is seen by every image with a well conditioned geometry.

use std::f64::consts::PI;

use nalgebra::{UnitQuaternion, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tracing::debug;

use super::{Camera, CameraModelId, Image, Point2D, Reconstruction, Rigid3d, TrackElement};
use crate::error::{BaCovError, BaCovResult};

#[derive(Debug, Clone)]
pub struct SyntheticDatasetOptions {
    pub num_cameras: usize,
    pub num_images: usize,
    pub num_points3d: usize,
    pub camera_model: CameraModelId,
    pub camera_width: usize,
    pub camera_height: usize,
    /// Points are drawn uniformly from `[-point_extent, point_extent]³`.
    pub point_extent: f64,
    /// Distance of the image projection centers from the world origin.
    pub ring_radius: f64,
    /// Standard deviation of the Gaussian pixel noise added to observations.
    pub point2d_stddev: f64,
    pub seed: u64,
}

impl Default for SyntheticDatasetOptions {
    fn default() -> Self {
        Self {
            num_cameras: 2,
            num_images: 10,
            num_points3d: 100,
            camera_model: CameraModelId::SimplePinhole,
            camera_width: 1024,
            camera_height: 768,
            point_extent: 1.0,
            ring_radius: 6.0,
            point2d_stddev: 0.0,
            seed: 42,
        }
    }
}

impl SyntheticDatasetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_cameras(mut self, num_cameras: usize) -> Self {
        self.num_cameras = num_cameras;
        self
    }

    pub fn with_num_images(mut self, num_images: usize) -> Self {
        self.num_images = num_images;
        self
    }

    pub fn with_num_points3d(mut self, num_points3d: usize) -> Self {
        self.num_points3d = num_points3d;
        self
    }

    pub fn with_camera_model(mut self, camera_model: CameraModelId) -> Self {
        self.camera_model = camera_model;
        self
    }

    pub fn with_point2d_stddev(mut self, point2d_stddev: f64) -> Self {
        self.point2d_stddev = point2d_stddev;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

fn synthesize_camera(
    options: &SyntheticDatasetOptions,
    camera_id: u32,
    rng: &mut StdRng,
) -> Camera {
    let width = options.camera_width;
    let height = options.camera_height;
    let focal = 1.2 * width.max(height) as f64 * rng.random_range(0.95..1.05);
    let cx = width as f64 / 2.0;
    let cy = height as f64 / 2.0;
    let params = match options.camera_model {
        CameraModelId::SimplePinhole => vec![focal, cx, cy],
        CameraModelId::Pinhole => vec![focal, focal * rng.random_range(0.98..1.02), cx, cy],
    };
    Camera::new(camera_id, options.camera_model, width, height, params)
}

/// Pose of a camera at `center` looking at the world origin.
fn look_at_origin(center: &Vector3<f64>) -> Rigid3d {
    let world_from_cam_rotation = UnitQuaternion::face_towards(&(-center), &Vector3::y());
    let cam_from_world_rotation = world_from_cam_rotation.inverse();
    Rigid3d::new(
        cam_from_world_rotation,
        -(cam_from_world_rotation * center),
    )
}

/// Generate a random reconstruction with cameras, images, points and noisy tracks.
///
/// Points whose track would have fewer than two observations are redrawn. Fails
/// with `InvalidInput` if the requested number of points cannot be reached.
pub fn synthesize_dataset(options: &SyntheticDatasetOptions) -> BaCovResult<Reconstruction> {
    if options.num_cameras == 0 || options.num_images < 2 {
        return Err(BaCovError::InvalidInput(format!(
            "need at least one camera and two images, got {} cameras and {} images",
            options.num_cameras, options.num_images
        )));
    }
    if !(options.point2d_stddev >= 0.0) {
        return Err(BaCovError::InvalidInput(format!(
            "pixel noise standard deviation must be non-negative, got {}",
            options.point2d_stddev
        )));
    }
    let noise = Normal::new(0.0, options.point2d_stddev)
        .map_err(|e| BaCovError::InvalidInput(format!("invalid pixel noise: {e}")))?;
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut reconstruction = Reconstruction::new();

    for camera_idx in 0..options.num_cameras {
        let camera = synthesize_camera(options, camera_idx as u32 + 1, &mut rng);
        reconstruction.add_camera(camera);
    }

    for image_idx in 0..options.num_images {
        let angle = 2.0 * PI * image_idx as f64 / options.num_images as f64
            + rng.random_range(-0.1..0.1);
        let center = Vector3::new(
            options.ring_radius * angle.cos(),
            rng.random_range(-1.0..1.0),
            options.ring_radius * angle.sin(),
        );
        let camera_id = (image_idx % options.num_cameras) as u32 + 1;
        let image_id = image_idx as u32 + 1;
        reconstruction.add_image(Image::new(
            image_id,
            camera_id,
            format!("image{image_id:04}.png"),
            look_at_origin(&center),
        ));
    }

    let image_ids = reconstruction.image_ids();
    let max_attempts = 100 * options.num_points3d.max(1);
    let mut attempts = 0;
    while reconstruction.num_points3d() < options.num_points3d && attempts < max_attempts {
        attempts += 1;
        let extent = options.point_extent;
        let xyz = Vector3::new(
            rng.random_range(-extent..extent),
            rng.random_range(-extent..extent),
            rng.random_range(-extent..extent),
        );

        let mut observations: Vec<(u32, Vector2<f64>)> = Vec::new();
        for &image_id in &image_ids {
            let Some(image) = reconstruction.image(image_id) else {
                continue;
            };
            let Some(camera) = reconstruction.camera(image.camera_id) else {
                continue;
            };
            let p_cam = image.cam_from_world.transform_point(&xyz);
            if let Some(uv) = camera.img_from_cam(&p_cam)
                && camera.contains(&uv)
            {
                let noisy = uv + Vector2::new(noise.sample(&mut rng), noise.sample(&mut rng));
                observations.push((image_id, noisy));
            }
        }
        if observations.len() < 2 {
            continue;
        }

        let mut track = Vec::with_capacity(observations.len());
        for (image_id, xy) in observations {
            if let Some(image) = reconstruction.image_mut(image_id) {
                image.points2d.push(Point2D::new(xy));
                track.push(TrackElement {
                    image_id,
                    point2d_idx: image.points2d.len() - 1,
                });
            }
        }
        reconstruction.add_point3d(xyz, track);
    }

    if reconstruction.num_points3d() < options.num_points3d {
        return Err(BaCovError::InvalidInput(format!(
            "only {} of {} points are observed by two images after {} attempts",
            reconstruction.num_points3d(),
            options.num_points3d,
            attempts
        )));
    }

    debug!(
        "Synthesized {} cameras, {} images, {} points",
        reconstruction.num_cameras(),
        reconstruction.num_images(),
        reconstruction.num_points3d()
    );
    Ok(reconstruction)
}
