use std::collections::BTreeMap;

use nalgebra::{Vector2, Vector3};
use tracing::warn;

use super::{Camera, CameraId, INVALID_POINT3D_ID, ImageId, Point3DId, Rigid3d};

/// A 2D keypoint, optionally linked to the 3D point it observes.
#[derive(Debug, Clone, PartialEq)]
pub struct Point2D {
    pub xy: Vector2<f64>,
    pub point3d_id: Point3DId,
}

impl Point2D {
    pub fn new(xy: Vector2<f64>) -> Self {
        Self {
            xy,
            point3d_id: INVALID_POINT3D_ID,
        }
    }

    pub fn has_point3d(&self) -> bool {
        self.point3d_id != INVALID_POINT3D_ID
    }
}

#[derive(Debug, Clone)]
pub struct Image {
    pub image_id: ImageId,
    pub camera_id: CameraId,
    pub name: String,
    pub cam_from_world: Rigid3d,
    pub points2d: Vec<Point2D>,
}

impl Image {
    pub fn new(
        image_id: ImageId,
        camera_id: CameraId,
        name: impl Into<String>,
        cam_from_world: Rigid3d,
    ) -> Self {
        Self {
            image_id,
            camera_id,
            name: name.into(),
            cam_from_world,
            points2d: Vec::new(),
        }
    }

    pub fn num_points3d(&self) -> usize {
        self.points2d.iter().filter(|p| p.has_point3d()).count()
    }

    /// Camera center in world coordinates.
    pub fn projection_center(&self) -> Vector3<f64> {
        self.cam_from_world.origin()
    }
}

/// One observation of a 3D point: the image and the index of the keypoint in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackElement {
    pub image_id: ImageId,
    pub point2d_idx: usize,
}

#[derive(Debug, Clone)]
pub struct Point3D {
    pub xyz: Vector3<f64>,
    pub track: Vec<TrackElement>,
}

/// Cameras, images and 3D points keyed by id.
///
/// Ordered maps keep iteration deterministic, which the parameter catalog relies on
/// to produce stable pose and point orderings.
#[derive(Debug, Clone)]
pub struct Reconstruction {
    cameras: BTreeMap<CameraId, Camera>,
    images: BTreeMap<ImageId, Image>,
    points3d: BTreeMap<Point3DId, Point3D>,
    next_point3d_id: Point3DId,
}

impl Default for Reconstruction {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconstruction {
    pub fn new() -> Self {
        Self {
            cameras: BTreeMap::new(),
            images: BTreeMap::new(),
            points3d: BTreeMap::new(),
            next_point3d_id: 1,
        }
    }

    pub fn add_camera(&mut self, camera: Camera) {
        if self.cameras.insert(camera.camera_id, camera).is_some() {
            warn!("Replaced an existing camera");
        }
    }

    pub fn add_image(&mut self, image: Image) {
        assert!(
            self.cameras.contains_key(&image.camera_id),
            "image {} references unknown camera {}",
            image.image_id,
            image.camera_id
        );
        self.images.insert(image.image_id, image);
    }

    /// Add a 3D point and link every track element's keypoint to it.
    ///
    /// # Panics
    /// Panics if a track element references a missing image or keypoint.
    pub fn add_point3d(&mut self, xyz: Vector3<f64>, track: Vec<TrackElement>) -> Point3DId {
        let point3d_id = self.next_point3d_id;
        self.next_point3d_id += 1;
        for element in &track {
            let image = self
                .images
                .get_mut(&element.image_id)
                .unwrap_or_else(|| panic!("track references unknown image {}", element.image_id));
            let point2d = image.points2d.get_mut(element.point2d_idx).unwrap_or_else(|| {
                panic!(
                    "track references keypoint {} outside image {}",
                    element.point2d_idx, element.image_id
                )
            });
            point2d.point3d_id = point3d_id;
        }
        self.points3d.insert(point3d_id, Point3D { xyz, track });
        point3d_id
    }

    pub fn camera(&self, camera_id: CameraId) -> Option<&Camera> {
        self.cameras.get(&camera_id)
    }

    pub fn camera_mut(&mut self, camera_id: CameraId) -> Option<&mut Camera> {
        self.cameras.get_mut(&camera_id)
    }

    pub fn image(&self, image_id: ImageId) -> Option<&Image> {
        self.images.get(&image_id)
    }

    pub fn image_mut(&mut self, image_id: ImageId) -> Option<&mut Image> {
        self.images.get_mut(&image_id)
    }

    pub fn point3d(&self, point3d_id: Point3DId) -> Option<&Point3D> {
        self.points3d.get(&point3d_id)
    }

    pub fn point3d_mut(&mut self, point3d_id: Point3DId) -> Option<&mut Point3D> {
        self.points3d.get_mut(&point3d_id)
    }

    pub fn cameras(&self) -> impl Iterator<Item = (&CameraId, &Camera)> {
        self.cameras.iter()
    }

    pub fn images(&self) -> impl Iterator<Item = (&ImageId, &Image)> {
        self.images.iter()
    }

    pub fn points3d(&self) -> impl Iterator<Item = (&Point3DId, &Point3D)> {
        self.points3d.iter()
    }

    pub fn image_ids(&self) -> Vec<ImageId> {
        self.images.keys().copied().collect()
    }

    pub fn point3d_ids(&self) -> Vec<Point3DId> {
        self.points3d.keys().copied().collect()
    }

    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    pub fn num_points3d(&self) -> usize {
        self.points3d.len()
    }

    /// Mean reprojection error in pixels over all observations.
    pub fn compute_mean_reprojection_error(&self) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for point in self.points3d.values() {
            for element in &point.track {
                let Some(image) = self.images.get(&element.image_id) else {
                    continue;
                };
                let Some(camera) = self.cameras.get(&image.camera_id) else {
                    continue;
                };
                let p_cam = image.cam_from_world.transform_point(&point.xyz);
                if let Some(uv) = camera.img_from_cam(&p_cam) {
                    sum += (uv - image.points2d[element.point2d_idx].xy).norm();
                    count += 1;
                }
            }
        }
        if count == 0 { 0.0 } else { sum / count as f64 }
    }
}
