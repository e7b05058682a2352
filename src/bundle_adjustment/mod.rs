//! Bundle adjustment of a [`Reconstruction`].
//!
//! [`BundleAdjustmentConfig`] selects the images whose observations enter the
//! problem and which parameters stay fixed. [`BundleAdjuster`] turns that selection
//! into a [`Problem`] with one parameter block per reconstruction field, refines it
//! with Levenberg-Marquardt and copies the result back.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use nalgebra::Vector3;
use tracing::{debug, info};

use crate::core::{ParamBlockId, Problem, StorageKey};
use crate::error::{BaCovError, BaCovResult};
use crate::factors::ReprojectionFactor;
use crate::manifold::{QuaternionManifold, SubsetManifold};
use crate::optimizer::{LevenbergMarquardt, LevenbergMarquardtConfig, LevenbergMarquardtSummary};
use crate::scene::{Camera, CameraId, CameraModelId, ImageId, Point3DId, Reconstruction};

/// Which images, poses, intrinsics and points take part in bundle adjustment.
#[derive(Debug, Clone, Default)]
pub struct BundleAdjustmentConfig {
    image_ids: BTreeSet<ImageId>,
    constant_cam_poses: HashSet<ImageId>,
    constant_cam_positions: BTreeMap<ImageId, Vec<usize>>,
    constant_cam_intrinsics: HashSet<CameraId>,
    variable_point3d_ids: BTreeSet<Point3DId>,
    constant_point3d_ids: BTreeSet<Point3DId>,
}

impl BundleAdjustmentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&mut self, image_id: ImageId) {
        self.image_ids.insert(image_id);
    }

    pub fn has_image(&self, image_id: ImageId) -> bool {
        self.image_ids.contains(&image_id)
    }

    pub fn image_ids(&self) -> impl Iterator<Item = ImageId> + '_ {
        self.image_ids.iter().copied()
    }

    pub fn num_images(&self) -> usize {
        self.image_ids.len()
    }

    /// Hold both rotation and translation of an image fixed.
    pub fn set_constant_cam_pose(&mut self, image_id: ImageId) {
        self.constant_cam_poses.insert(image_id);
    }

    pub fn set_variable_cam_pose(&mut self, image_id: ImageId) {
        self.constant_cam_poses.remove(&image_id);
    }

    pub fn has_constant_cam_pose(&self, image_id: ImageId) -> bool {
        self.constant_cam_poses.contains(&image_id)
    }

    /// Hold individual coordinates of an image's translation fixed.
    pub fn set_constant_cam_positions(&mut self, image_id: ImageId, idxs: &[usize]) {
        self.constant_cam_positions.insert(image_id, idxs.to_vec());
    }

    pub fn constant_cam_positions(&self, image_id: ImageId) -> Option<&[usize]> {
        self.constant_cam_positions.get(&image_id).map(Vec::as_slice)
    }

    pub fn set_constant_cam_intrinsics(&mut self, camera_id: CameraId) {
        self.constant_cam_intrinsics.insert(camera_id);
    }

    pub fn set_variable_cam_intrinsics(&mut self, camera_id: CameraId) {
        self.constant_cam_intrinsics.remove(&camera_id);
    }

    pub fn has_constant_cam_intrinsics(&self, camera_id: CameraId) -> bool {
        self.constant_cam_intrinsics.contains(&camera_id)
    }

    /// Refine a point even if none of the configured images observes it.
    pub fn add_variable_point(&mut self, point3d_id: Point3DId) {
        self.constant_point3d_ids.remove(&point3d_id);
        self.variable_point3d_ids.insert(point3d_id);
    }

    pub fn add_constant_point(&mut self, point3d_id: Point3DId) {
        self.variable_point3d_ids.remove(&point3d_id);
        self.constant_point3d_ids.insert(point3d_id);
    }

    pub fn has_constant_point(&self, point3d_id: Point3DId) -> bool {
        self.constant_point3d_ids.contains(&point3d_id)
    }

    pub fn num_constant_points(&self) -> usize {
        self.constant_point3d_ids.len()
    }
}

#[derive(Debug, Clone)]
pub struct BundleAdjustmentOptions {
    pub refine_focal_length: bool,
    pub refine_principal_point: bool,
    pub solver: LevenbergMarquardtConfig,
}

impl Default for BundleAdjustmentOptions {
    fn default() -> Self {
        Self {
            refine_focal_length: true,
            refine_principal_point: false,
            solver: LevenbergMarquardtConfig::default(),
        }
    }
}

impl BundleAdjustmentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_refine_focal_length(mut self, refine: bool) -> Self {
        self.refine_focal_length = refine;
        self
    }

    pub fn with_refine_principal_point(mut self, refine: bool) -> Self {
        self.refine_principal_point = refine;
        self
    }

    pub fn with_solver(mut self, solver: LevenbergMarquardtConfig) -> Self {
        self.solver = solver;
        self
    }
}

/// Intrinsic indices that stay fixed under `options`.
fn constant_intrinsic_indices(model: CameraModelId, options: &BundleAdjustmentOptions) -> Vec<usize> {
    let (focal, principal_point): (&[usize], &[usize]) = match model {
        CameraModelId::SimplePinhole => (&[0], &[1, 2]),
        CameraModelId::Pinhole => (&[0, 1], &[2, 3]),
    };
    let mut constant = Vec::new();
    if !options.refine_focal_length {
        constant.extend_from_slice(focal);
    }
    if !options.refine_principal_point {
        constant.extend_from_slice(principal_point);
    }
    constant
}

pub struct BundleAdjuster {
    options: BundleAdjustmentOptions,
    config: BundleAdjustmentConfig,
    problem: Problem,
    summary: Option<LevenbergMarquardtSummary>,
}

impl BundleAdjuster {
    /// Build the least-squares problem for `config` over `reconstruction`.
    ///
    /// Every observation of a configured image becomes a reprojection residual.
    /// Points listed explicitly in the config also pull in observations from
    /// images outside it; those images enter with constant poses.
    pub fn new(
        options: BundleAdjustmentOptions,
        config: BundleAdjustmentConfig,
        reconstruction: &Reconstruction,
    ) -> BaCovResult<Self> {
        let mut adjuster = Self {
            options,
            config,
            problem: Problem::new(),
            summary: None,
        };
        adjuster.build(reconstruction)?;
        info!(
            "Bundle adjustment problem: {} images, {} parameter blocks, {} residuals",
            adjuster.config.num_images(),
            adjuster.problem.num_parameter_blocks(),
            adjuster.problem.num_residuals()
        );
        Ok(adjuster)
    }

    fn build(&mut self, reconstruction: &Reconstruction) -> BaCovResult<()> {
        let image_ids: Vec<ImageId> = self.config.image_ids().collect();
        for &image_id in &image_ids {
            let image = reconstruction.image(image_id).ok_or_else(|| {
                BaCovError::InvalidInput(format!("image {image_id} is not in the reconstruction"))
            })?;
            for point2d in image.points2d.iter().filter(|p| p.has_point3d()) {
                self.add_observation(reconstruction, image_id, point2d.point3d_id, false)?;
            }
        }

        let explicit_points: Vec<Point3DId> = self
            .config
            .variable_point3d_ids
            .iter()
            .chain(&self.config.constant_point3d_ids)
            .copied()
            .collect();
        for point3d_id in explicit_points {
            let point = reconstruction.point3d(point3d_id).ok_or_else(|| {
                BaCovError::InvalidInput(format!("point {point3d_id} is not in the reconstruction"))
            })?;
            for element in &point.track {
                if !self.config.has_image(element.image_id) {
                    self.add_observation(reconstruction, element.image_id, point3d_id, true)?;
                }
            }
        }

        for point3d_id in self.config.constant_point3d_ids.clone() {
            if let Some(id) = self.problem.find_parameter_block(&StorageKey::Point3D(point3d_id)) {
                self.problem.set_parameter_block_constant(id);
            }
        }
        Ok(())
    }

    fn add_observation(
        &mut self,
        reconstruction: &Reconstruction,
        image_id: ImageId,
        point3d_id: Point3DId,
        force_constant_pose: bool,
    ) -> BaCovResult<()> {
        let image = reconstruction
            .image(image_id)
            .ok_or_else(|| BaCovError::InvalidInput(format!("unknown image {image_id}")))?;
        let camera = reconstruction.camera(image.camera_id).ok_or_else(|| {
            BaCovError::InvalidInput(format!("unknown camera {}", image.camera_id))
        })?;
        let point = reconstruction
            .point3d(point3d_id)
            .ok_or_else(|| BaCovError::InvalidInput(format!("unknown point {point3d_id}")))?;
        let Some(element) = point.track.iter().find(|e| e.image_id == image_id) else {
            return Err(BaCovError::InvalidInput(format!(
                "point {point3d_id} has no observation in image {image_id}"
            )));
        };

        let (rotation, translation) = self.add_pose(reconstruction, image_id, force_constant_pose)?;
        let xyz = self
            .problem
            .add_parameter_block_with_key(StorageKey::Point3D(point3d_id), point.xyz.as_slice());
        let intrinsics = self.add_camera(camera)?;

        let observed = image.points2d[element.point2d_idx].xy;
        self.problem.add_residual_block(
            Box::new(ReprojectionFactor::new(observed, camera.model)),
            &[rotation, translation, xyz, intrinsics],
        );
        Ok(())
    }

    fn add_pose(
        &mut self,
        reconstruction: &Reconstruction,
        image_id: ImageId,
        force_constant: bool,
    ) -> BaCovResult<(ParamBlockId, ParamBlockId)> {
        let rotation_key = StorageKey::ImageRotation(image_id);
        let translation_key = StorageKey::ImageTranslation(image_id);
        if let (Some(rotation), Some(translation)) = (
            self.problem.find_parameter_block(&rotation_key),
            self.problem.find_parameter_block(&translation_key),
        ) {
            return Ok((rotation, translation));
        }

        let image = reconstruction
            .image(image_id)
            .ok_or_else(|| BaCovError::InvalidInput(format!("unknown image {image_id}")))?;
        let cam_from_world = &image.cam_from_world;
        let rotation = self.problem.add_parameter_block_with_key(
            rotation_key,
            &QuaternionManifold::coeffs(&cam_from_world.rotation),
        );
        let translation = self
            .problem
            .add_parameter_block_with_key(translation_key, cam_from_world.translation.as_slice());
        self.problem
            .set_manifold(rotation, Arc::new(QuaternionManifold::new()))?;

        if force_constant || self.config.has_constant_cam_pose(image_id) {
            self.problem.set_parameter_block_constant(rotation);
            self.problem.set_parameter_block_constant(translation);
        } else if let Some(idxs) = self.config.constant_cam_positions(image_id) {
            let unique: BTreeSet<usize> = idxs.iter().copied().collect();
            if unique.len() >= 3 {
                self.problem.set_parameter_block_constant(translation);
            } else if !unique.is_empty() {
                let idxs: Vec<usize> = unique.into_iter().collect();
                let manifold = SubsetManifold::new(3, &idxs)?;
                self.problem.set_manifold(translation, Arc::new(manifold))?;
            }
        }
        Ok((rotation, translation))
    }

    fn add_camera(&mut self, camera: &Camera) -> BaCovResult<ParamBlockId> {
        let key = StorageKey::CameraParams(camera.camera_id);
        if let Some(id) = self.problem.find_parameter_block(&key) {
            return Ok(id);
        }
        let id = self.problem.add_parameter_block_with_key(key, &camera.params);
        let constant = constant_intrinsic_indices(camera.model, &self.options);
        if self.config.has_constant_cam_intrinsics(camera.camera_id)
            || constant.len() >= camera.params.len()
        {
            self.problem.set_parameter_block_constant(id);
        } else if !constant.is_empty() {
            let manifold = SubsetManifold::new(camera.params.len(), &constant)?;
            self.problem.set_manifold(id, Arc::new(manifold))?;
        }
        Ok(id)
    }

    pub fn options(&self) -> &BundleAdjustmentOptions {
        &self.options
    }

    pub fn config(&self) -> &BundleAdjustmentConfig {
        &self.config
    }

    pub fn problem(&self) -> &Problem {
        &self.problem
    }

    pub fn problem_mut(&mut self) -> &mut Problem {
        &mut self.problem
    }

    /// Summary of the last [`Self::solve`], if any.
    pub fn summary(&self) -> Option<&LevenbergMarquardtSummary> {
        self.summary.as_ref()
    }

    pub fn solve(&mut self) -> BaCovResult<LevenbergMarquardtSummary> {
        let mut solver = LevenbergMarquardt::with_config(self.options.solver.clone());
        let summary = solver.optimize(&mut self.problem)?;
        debug!("{summary}");
        self.summary = Some(summary.clone());
        Ok(summary)
    }

    /// Copy the problem's current values into the reconstruction fields they mirror.
    pub fn write_back(&self, reconstruction: &mut Reconstruction) -> BaCovResult<()> {
        for id in self.problem.parameter_block_ids() {
            let Some(key) = self.problem.storage_key(id) else {
                continue;
            };
            let values = self.problem.parameter_block_values(id);
            match key {
                StorageKey::ImageRotation(image_id) => {
                    if let Some(image) = reconstruction.image_mut(image_id) {
                        image.cam_from_world.rotation = QuaternionManifold::to_unit_quaternion(values)?;
                    }
                }
                StorageKey::ImageTranslation(image_id) => {
                    if let Some(image) = reconstruction.image_mut(image_id) {
                        image.cam_from_world.translation = Vector3::from_column_slice(values);
                    }
                }
                StorageKey::Point3D(point3d_id) => {
                    if let Some(point) = reconstruction.point3d_mut(point3d_id) {
                        point.xyz = Vector3::from_column_slice(values);
                    }
                }
                StorageKey::CameraParams(camera_id) => {
                    if let Some(camera) = reconstruction.camera_mut(camera_id) {
                        camera.params.copy_from_slice(values);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{SyntheticDatasetOptions, synthesize_dataset};

    fn dataset() -> Reconstruction {
        let options = SyntheticDatasetOptions::new()
            .with_num_cameras(2)
            .with_num_images(4)
            .with_num_points3d(30)
            .with_point2d_stddev(0.5);
        synthesize_dataset(&options).unwrap()
    }

    fn full_config(reconstruction: &Reconstruction) -> BundleAdjustmentConfig {
        let mut config = BundleAdjustmentConfig::new();
        for image_id in reconstruction.image_ids() {
            config.add_image(image_id);
        }
        config
    }

    #[test]
    fn test_problem_layout() {
        let reconstruction = dataset();
        let config = full_config(&reconstruction);
        let adjuster =
            BundleAdjuster::new(BundleAdjustmentOptions::default(), config, &reconstruction).unwrap();
        let problem = adjuster.problem();
        // 4 rotations, 4 translations, 30 points, 2 cameras
        assert_eq!(problem.num_parameter_blocks(), 40);
        let observations: usize = reconstruction.points3d().map(|(_, p)| p.track.len()).sum();
        assert_eq!(problem.num_residual_blocks(), observations);

        let rotation = problem.find_parameter_block(&StorageKey::ImageRotation(1)).unwrap();
        assert_eq!(problem.parameter_block_tangent_size(rotation), 3);
        // Principal point is held fixed by default.
        let camera = problem.find_parameter_block(&StorageKey::CameraParams(1)).unwrap();
        assert_eq!(problem.parameter_block_tangent_size(camera), 1);
    }

    #[test]
    fn test_constant_settings() {
        let reconstruction = dataset();
        let mut config = full_config(&reconstruction);
        config.set_constant_cam_pose(1);
        config.set_constant_cam_positions(2, &[0]);
        config.set_constant_cam_positions(3, &[0, 1, 2]);
        config.set_constant_cam_intrinsics(2);
        let point3d_id = reconstruction.point3d_ids()[0];
        config.add_constant_point(point3d_id);

        let adjuster =
            BundleAdjuster::new(BundleAdjustmentOptions::default(), config, &reconstruction).unwrap();
        let problem = adjuster.problem();
        let find = |key| problem.find_parameter_block(&key).unwrap();

        assert!(problem.is_parameter_block_constant(find(StorageKey::ImageRotation(1))));
        assert!(problem.is_parameter_block_constant(find(StorageKey::ImageTranslation(1))));
        assert_eq!(problem.parameter_block_tangent_size(find(StorageKey::ImageTranslation(2))), 2);
        assert!(problem.is_parameter_block_constant(find(StorageKey::ImageTranslation(3))));
        assert!(!problem.is_parameter_block_constant(find(StorageKey::ImageRotation(3))));
        assert!(problem.is_parameter_block_constant(find(StorageKey::CameraParams(2))));
        assert!(!problem.is_parameter_block_constant(find(StorageKey::CameraParams(1))));
        assert!(problem.is_parameter_block_constant(find(StorageKey::Point3D(point3d_id))));
    }

    #[test]
    fn test_unknown_image_is_rejected() {
        let reconstruction = dataset();
        let mut config = full_config(&reconstruction);
        config.add_image(999);
        assert!(BundleAdjuster::new(BundleAdjustmentOptions::default(), config, &reconstruction).is_err());
    }

    #[test]
    fn test_solve_reduces_cost_and_writes_back() {
        let mut reconstruction = dataset();
        let mut config = full_config(&reconstruction);
        config.set_constant_cam_pose(1);
        config.set_constant_cam_positions(2, &[0]);
        let before = reconstruction.compute_mean_reprojection_error();

        let mut adjuster =
            BundleAdjuster::new(BundleAdjustmentOptions::default(), config, &reconstruction).unwrap();
        let summary = adjuster.solve().unwrap();
        assert!(summary.final_cost < summary.initial_cost);
        assert!(adjuster.summary().is_some());

        let fixed_translation = reconstruction.image(2).unwrap().cam_from_world.translation.x;
        adjuster.write_back(&mut reconstruction).unwrap();
        let after = reconstruction.compute_mean_reprojection_error();
        assert!(after < before);
        let translation = reconstruction.image(2).unwrap().cam_from_world.translation;
        assert_eq!(translation.x, fixed_translation);
    }
}
