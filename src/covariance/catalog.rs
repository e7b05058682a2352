//! Classification of a problem's parameter blocks into pose, point and other
//! parameters.
//!
//! Pose and point blocks are found through the reconstruction's storage keys.
//! Everything else that is still variable is "other". Membership is decided by
//! block identity, so two blocks holding equal values are never confused.

use std::collections::HashSet;

use crate::core::{ParamBlockId, Problem, StorageKey};
use crate::scene::{ImageId, Point3DId, Reconstruction};

/// Rotation and translation blocks of one image. A block is `None` when the
/// problem does not contain it or holds it constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoseParam {
    pub image_id: ImageId,
    pub rotation: Option<ParamBlockId>,
    pub translation: Option<ParamBlockId>,
}

impl PoseParam {
    /// Live blocks in covariance order: rotation first, then translation.
    pub fn blocks(&self) -> impl Iterator<Item = ParamBlockId> {
        self.rotation.into_iter().chain(self.translation)
    }

    pub fn is_estimable(&self) -> bool {
        self.rotation.is_some() || self.translation.is_some()
    }

    pub fn tangent_size(&self, problem: &Problem) -> usize {
        self.blocks()
            .map(|id| problem.parameter_block_tangent_size(id))
            .sum()
    }
}

/// Position block of one 3D point, `None` when absent or constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointParam {
    pub point3d_id: Point3DId,
    pub xyz: Option<ParamBlockId>,
}

fn live_block(problem: &Problem, key: StorageKey) -> Option<ParamBlockId> {
    problem
        .find_parameter_block(&key)
        .filter(|&id| !problem.is_parameter_block_constant(id))
}

/// One entry per image of the reconstruction, in image id order.
pub fn extract_pose_params(reconstruction: &Reconstruction, problem: &Problem) -> Vec<PoseParam> {
    reconstruction
        .images()
        .map(|(&image_id, _)| PoseParam {
            image_id,
            rotation: live_block(problem, StorageKey::ImageRotation(image_id)),
            translation: live_block(problem, StorageKey::ImageTranslation(image_id)),
        })
        .collect()
}

/// One entry per 3D point of the reconstruction, in point id order.
pub fn extract_point_params(reconstruction: &Reconstruction, problem: &Problem) -> Vec<PointParam> {
    reconstruction
        .points3d()
        .map(|(&point3d_id, _)| PointParam {
            point3d_id,
            xyz: live_block(problem, StorageKey::Point3D(point3d_id)),
        })
        .collect()
}

/// Variable blocks that are neither pose nor point blocks, in block id order.
pub fn extract_other_params(
    problem: &Problem,
    poses: &[PoseParam],
    points: &[PointParam],
) -> Vec<ParamBlockId> {
    let claimed: HashSet<ParamBlockId> = poses
        .iter()
        .flat_map(PoseParam::blocks)
        .chain(points.iter().filter_map(|p| p.xyz))
        .collect();
    problem
        .parameter_block_ids()
        .filter(|id| !claimed.contains(id) && !problem.is_parameter_block_constant(*id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::QuaternionManifold;
    use crate::scene::{Camera, Image, Rigid3d};
    use nalgebra::Vector3;
    use std::sync::Arc;

    fn setup() -> (Reconstruction, Problem, Point3DId) {
        let mut reconstruction = Reconstruction::new();
        reconstruction.add_camera(Camera::simple_pinhole(1, 100.0, 100, 100));
        for image_id in [1, 2, 3] {
            reconstruction.add_image(Image::new(image_id, 1, "", Rigid3d::identity()));
        }
        let point3d_id = reconstruction.add_point3d(Vector3::new(0.0, 0.0, 1.0), Vec::new());
        let other_point = reconstruction.add_point3d(Vector3::new(1.0, 0.0, 1.0), Vec::new());

        let mut problem = Problem::new();
        for image_id in [1, 2] {
            let q = problem
                .add_parameter_block_with_key(StorageKey::ImageRotation(image_id), &[0.0, 0.0, 0.0, 1.0]);
            problem.set_manifold(q, Arc::new(QuaternionManifold::new())).unwrap();
            problem.add_parameter_block_with_key(StorageKey::ImageTranslation(image_id), &[0.0; 3]);
        }
        let t2 = problem
            .find_parameter_block(&StorageKey::ImageTranslation(2))
            .unwrap();
        problem.set_parameter_block_constant(t2);
        problem.add_parameter_block_with_key(StorageKey::Point3D(point3d_id), &[0.0, 0.0, 1.0]);
        let constant_point =
            problem.add_parameter_block_with_key(StorageKey::Point3D(other_point), &[1.0, 0.0, 1.0]);
        problem.set_parameter_block_constant(constant_point);
        problem.add_parameter_block_with_key(StorageKey::CameraParams(1), &[100.0, 50.0, 50.0]);
        // A block with the same values as a point, but a different identity.
        problem.add_parameter_block(&[0.0, 0.0, 1.0]);
        (reconstruction, problem, point3d_id)
    }

    #[test]
    fn test_pose_params() {
        let (reconstruction, problem, _) = setup();
        let poses = extract_pose_params(&reconstruction, &problem);
        assert_eq!(poses.len(), 3);
        assert!(poses[0].rotation.is_some() && poses[0].translation.is_some());
        assert_eq!(poses[0].tangent_size(&problem), 6);
        assert!(poses[1].rotation.is_some() && poses[1].translation.is_none());
        assert_eq!(poses[1].tangent_size(&problem), 3);
        assert!(!poses[2].is_estimable());
    }

    #[test]
    fn test_point_params() {
        let (reconstruction, problem, point3d_id) = setup();
        let points = extract_point_params(&reconstruction, &problem);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].point3d_id, point3d_id);
        assert!(points[0].xyz.is_some());
        assert!(points[1].xyz.is_none());
    }

    #[test]
    fn test_other_params_use_identity() {
        let (reconstruction, problem, _) = setup();
        let poses = extract_pose_params(&reconstruction, &problem);
        let points = extract_point_params(&reconstruction, &problem);
        let others = extract_other_params(&problem, &poses, &points);
        let camera = problem
            .find_parameter_block(&StorageKey::CameraParams(1))
            .unwrap();
        assert_eq!(others.len(), 2);
        assert_eq!(others[0], camera);
        assert_eq!(problem.storage_key(others[1]), None);

        // Extraction order does not matter.
        let points_first = extract_point_params(&reconstruction, &problem);
        assert_eq!(extract_other_params(&problem, &poses, &points_first), others);
    }
}
