//! Integration tests for what the covariance store contains: requested groups,
//! constant parameters, invalid ids, relative poses and scoped constant marking.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use ba_covariance::bundle_adjustment::{BundleAdjuster, BundleAdjustmentConfig, BundleAdjustmentOptions};
use ba_covariance::core::{ConstantBlocksGuard, ParamBlockId, Problem, StorageKey};
use ba_covariance::covariance::{
    BaCovarianceOptions, CovarianceError, CovarianceParams, ReferenceCovariance,
    SparseCholeskyReference, estimate_ba_covariance, estimate_ba_covariance_from_problem,
    extract_other_params, extract_point_params, extract_pose_params,
};
use ba_covariance::factors::Factor;
use ba_covariance::scene::{
    INVALID_IMAGE_ID, INVALID_POINT3D_ID, Reconstruction, Rigid3d, SyntheticDatasetOptions,
    synthesize_dataset,
};
use nalgebra::{DMatrix, DVector, UnitQuaternion, Vector3};

use covariance_test_utils::*;

/// 2 cameras, 6 images, 200 points; first 3 points constant.
fn small_scene() -> (Reconstruction, BundleAdjuster) {
    let mut reconstruction = synthesize_dataset(
        &SyntheticDatasetOptions::new()
            .with_num_cameras(2)
            .with_num_images(6)
            .with_num_points3d(200)
            .with_point2d_stddev(0.1)
            .with_seed(7),
    )
    .unwrap();
    let config = scene_config(&reconstruction, SceneOptions::default());
    let mut adjuster =
        BundleAdjuster::new(BundleAdjustmentOptions::default(), config, &reconstruction).unwrap();
    adjuster.solve().unwrap();
    adjuster.write_back(&mut reconstruction).unwrap();
    (reconstruction, adjuster)
}

#[test]
fn test_group_isolation() {
    let (reconstruction, adjuster) = small_scene();
    let estimate = |params| {
        let options = BaCovarianceOptions::default().with_params(params);
        estimate_ba_covariance(&options, &reconstruction, &adjuster).unwrap()
    };

    let only_points = estimate(CovarianceParams::OnlyPoints);
    assert_eq!(only_points.num_poses(), 0);
    assert_eq!(only_points.num_others(), 0);
    assert_eq!(only_points.num_points(), 197);
    assert!(only_points.cam_from_world_cov(1).is_none());

    let only_poses = estimate(CovarianceParams::OnlyPoses);
    assert_eq!(only_poses.num_poses(), 6);
    assert_eq!(only_poses.num_points(), 0);
    assert_eq!(only_poses.num_others(), 0);

    let poses_and_points = estimate(CovarianceParams::PosesAndPoints);
    assert_eq!(poses_and_points.num_poses(), 6);
    assert_eq!(poses_and_points.num_points(), 197);
    assert_eq!(poses_and_points.num_others(), 0);

    let all = estimate(CovarianceParams::All);
    assert_eq!(all.num_poses(), 6);
    assert_eq!(all.num_points(), 197);
    assert_eq!(all.num_others(), 2);

    // Skipping extraction does not change what is extracted.
    for image_id in reconstruction.image_ids() {
        assert_matrix_near(
            only_poses.cam_from_world_cov(image_id).unwrap(),
            all.cam_from_world_cov(image_id).unwrap(),
            1e-10,
        );
    }
    for point3d_id in reconstruction.point3d_ids() {
        match (only_points.point_cov(point3d_id), all.point_cov(point3d_id)) {
            (Some(a), Some(b)) => assert!((a - b).amax() < 1e-10),
            (a, b) => assert_eq!(a.is_some(), b.is_some()),
        }
    }
}

#[test]
fn test_invalid_ids_are_absent() {
    let (reconstruction, adjuster) = small_scene();
    let ba_cov =
        estimate_ba_covariance(&BaCovarianceOptions::default(), &reconstruction, &adjuster).unwrap();
    assert!(ba_cov.cam_from_world_cov(INVALID_IMAGE_ID).is_none());
    assert!(ba_cov.cam_from_world_cross_cov(1, INVALID_IMAGE_ID).is_none());
    assert!(ba_cov.cam2_from_cam1_cov(INVALID_IMAGE_ID, 1).is_none());
    assert!(ba_cov.point_cov(INVALID_POINT3D_ID).is_none());
    assert!(ba_cov.other_params_cov(ParamBlockId::INVALID).is_none());

    // Pose and point blocks are not "other" parameters.
    let problem = adjuster.problem();
    let rotation = problem
        .find_parameter_block(&StorageKey::ImageRotation(1))
        .unwrap();
    assert!(ba_cov.other_params_cov(rotation).is_none());
}

#[test]
fn test_constant_parameters_are_excluded() {
    let reconstruction = synthesize_dataset(
        &SyntheticDatasetOptions::new()
            .with_num_cameras(2)
            .with_num_images(5)
            .with_num_points3d(150)
            .with_point2d_stddev(0.1),
    )
    .unwrap();
    let point3d_ids = reconstruction.point3d_ids();

    let mut config = BundleAdjustmentConfig::new();
    for image_id in reconstruction.image_ids() {
        config.add_image(image_id);
    }
    config.set_constant_cam_pose(1);
    config.set_constant_cam_positions(2, &[0]);
    config.set_constant_cam_intrinsics(1);
    for &point3d_id in &point3d_ids[..10] {
        config.add_constant_point(point3d_id);
    }
    let adjuster =
        BundleAdjuster::new(BundleAdjustmentOptions::default(), config, &reconstruction).unwrap();
    let ba_cov =
        estimate_ba_covariance(&BaCovarianceOptions::default(), &reconstruction, &adjuster).unwrap();

    assert!(ba_cov.cam_from_world_cov(1).is_none());
    assert_eq!(ba_cov.cam_from_world_cov(2).unwrap().shape(), (5, 5));
    assert_eq!(ba_cov.cam_from_world_cov(3).unwrap().shape(), (6, 6));
    assert_eq!(ba_cov.num_poses(), 4);

    for &point3d_id in &point3d_ids[..10] {
        assert!(ba_cov.point_cov(point3d_id).is_none());
    }
    for &point3d_id in &point3d_ids[10..] {
        assert!(ba_cov.point_cov(point3d_id).is_some());
    }

    let problem = adjuster.problem();
    let camera1 = problem
        .find_parameter_block(&StorageKey::CameraParams(1))
        .unwrap();
    let camera2 = problem
        .find_parameter_block(&StorageKey::CameraParams(2))
        .unwrap();
    assert!(ba_cov.other_params_cov(camera1).is_none());
    assert_eq!(ba_cov.other_params_cov(camera2).unwrap().shape(), (1, 1));
    assert_eq!(ba_cov.num_others(), 1);

    // A partially fixed translation has no full tangent space, so no relative pose.
    assert!(ba_cov.cam2_from_cam1_cov(2, 3).is_none());
    assert!(ba_cov.cam2_from_cam1_cov(1, 3).is_none());
    assert!(ba_cov.cam2_from_cam1_cov(3, 4).is_some());
}

#[test]
fn test_estimation_does_not_modify_problem() {
    let (reconstruction, adjuster) = small_scene();
    let problem = adjuster.problem();
    let values_before = problem.snapshot_values();
    let constant_before: Vec<bool> = problem
        .parameter_block_ids()
        .map(|id| problem.is_parameter_block_constant(id))
        .collect();

    estimate_ba_covariance(&BaCovarianceOptions::default(), &reconstruction, &adjuster).unwrap();

    assert_eq!(problem.snapshot_values(), values_before);
    let constant_after: Vec<bool> = problem
        .parameter_block_ids()
        .map(|id| problem.is_parameter_block_constant(id))
        .collect();
    assert_eq!(constant_after, constant_before);
}

#[test]
fn test_conditional_point_covariance_with_scoped_constants() {
    let (reconstruction, mut adjuster) = small_scene();
    let problem = adjuster.problem();
    let poses = extract_pose_params(&reconstruction, problem);
    let points = extract_point_params(&reconstruction, problem);
    let others = extract_other_params(problem, &poses, &points);
    let held: Vec<ParamBlockId> = poses
        .iter()
        .flat_map(|p| p.blocks())
        .chain(others.iter().copied())
        .collect();

    let options = BaCovarianceOptions::default().with_params(CovarianceParams::OnlyPoints);
    let marginal = estimate_ba_covariance(&options, &reconstruction, &adjuster).unwrap();

    {
        let guard = ConstantBlocksGuard::new(adjuster.problem_mut(), held.iter().copied());
        let conditional = estimate_ba_covariance_from_problem(&options, &reconstruction, &guard).unwrap();
        assert_eq!(conditional.rank_deficiency(), 0);
        let reference = SparseCholeskyReference::new(&guard).unwrap();

        for point in &points {
            let Some(xyz) = point.xyz else { continue };
            let expected = reference.compute(&[xyz]).unwrap();
            let cov = conditional.point_cov(point.point3d_id).unwrap();
            assert_matrix_near(&DMatrix::from_column_slice(3, 3, cov.as_slice()), &expected, 1e-8);

            // Fixing poses and intrinsics can only reduce the point uncertainty.
            let full = marginal.point_cov(point.point3d_id).unwrap();
            assert!(full.trace() >= cov.trace());
        }
    }

    for id in held {
        assert!(!adjuster.problem().is_parameter_block_constant(id));
    }
}

fn relative_pose_log(pose: &Rigid3d, nominal: &Rigid3d) -> DVector<f64> {
    let dr = (nominal.rotation.inverse() * pose.rotation).scaled_axis();
    let dt = pose.translation - nominal.translation;
    DVector::from_iterator(6, dr.iter().chain(dt.iter()).copied())
}

fn perturbed(pose: &Rigid3d, delta: &[f64]) -> Rigid3d {
    Rigid3d::new(
        pose.rotation * UnitQuaternion::from_scaled_axis(Vector3::new(delta[0], delta[1], delta[2])),
        pose.translation + Vector3::new(delta[3], delta[4], delta[5]),
    )
}

#[test]
fn test_relative_pose_covariance_matches_numeric_propagation() {
    let (reconstruction, adjuster) = small_scene();
    let ba_cov = estimate_ba_covariance(
        &BaCovarianceOptions::default().with_params(CovarianceParams::OnlyPoses),
        &reconstruction,
        &adjuster,
    )
    .unwrap();

    let (id1, id2) = (2, 5);
    let cam1 = reconstruction.image(id1).unwrap().cam_from_world;
    let cam2 = reconstruction.image(id2).unwrap().cam_from_world;
    let relative = |c1: &Rigid3d, c2: &Rigid3d| c2.compose(&c1.inverse());
    let nominal = relative(&cam1, &cam2);

    let h = 1e-6;
    let mut jacobian = DMatrix::zeros(6, 12);
    for k in 0..12 {
        let mut delta = [0.0; 12];
        delta[k] = h;
        let plus = relative(&perturbed(&cam1, &delta[..6]), &perturbed(&cam2, &delta[6..]));
        delta[k] = -h;
        let minus = relative(&perturbed(&cam1, &delta[..6]), &perturbed(&cam2, &delta[6..]));
        jacobian.set_column(
            k,
            &((relative_pose_log(&plus, &nominal) - relative_pose_log(&minus, &nominal)) / (2.0 * h)),
        );
    }

    let mut joint = DMatrix::zeros(12, 12);
    joint
        .view_mut((0, 0), (6, 6))
        .copy_from(ba_cov.cam_from_world_cov(id1).unwrap());
    joint
        .view_mut((6, 6), (6, 6))
        .copy_from(ba_cov.cam_from_world_cov(id2).unwrap());
    let cross = ba_cov.cam_from_world_cross_cov(id1, id2).unwrap();
    joint.view_mut((0, 6), (6, 6)).copy_from(&cross);
    joint.view_mut((6, 0), (6, 6)).copy_from(&cross.transpose());
    let expected = &jacobian * joint * jacobian.transpose();

    let cov = ba_cov.cam2_from_cam1_cov(id1, id2).unwrap();
    assert_valid_covariance(&cov);
    let scale = expected.amax();
    assert!((&cov - &expected).amax() <= 1e-5 * scale);

    // Cross-covariance blocks are transposes of each other.
    let reverse = ba_cov.cam_from_world_cross_cov(id2, id1).unwrap();
    assert_matrix_near(&reverse, &cross.transpose(), 1e-15);
}

/// Residual `a - b` between two 3-vectors.
#[derive(Debug)]
struct PointDifferenceFactor;

impl Factor for PointDifferenceFactor {
    fn residual_dimension(&self) -> usize {
        3
    }

    fn parameter_block_sizes(&self) -> &[usize] {
        &[3, 3]
    }

    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let residual = &params[0] - &params[1];
        let jacobian = compute_jacobian.then(|| {
            let mut j = DMatrix::zeros(3, 6);
            j.view_mut((0, 0), (3, 3)).fill_with_identity();
            j.view_mut((0, 3), (3, 3)).copy_from(&(-DMatrix::<f64>::identity(3, 3)));
            j
        });
        (residual, jacobian)
    }
}

#[test]
fn test_point_coupling_is_rejected() {
    let mut reconstruction = Reconstruction::new();
    let first = reconstruction.add_point3d(Vector3::new(0.0, 0.0, 1.0), Vec::new());
    let second = reconstruction.add_point3d(Vector3::new(0.0, 1.0, 1.0), Vec::new());

    let mut problem = Problem::new();
    let a = problem.add_parameter_block_with_key(StorageKey::Point3D(first), &[0.0, 0.0, 1.0]);
    let b = problem.add_parameter_block_with_key(StorageKey::Point3D(second), &[0.0, 1.0, 1.0]);
    problem.add_residual_block(Box::new(PointDifferenceFactor), &[a, b]);

    let result =
        estimate_ba_covariance_from_problem(&BaCovarianceOptions::default(), &reconstruction, &problem);
    assert!(matches!(result, Err(CovarianceError::PointCoupling { .. })));

    // With one side constant the residual touches a single point.
    problem.set_parameter_block_constant(b);
    let ba_cov =
        estimate_ba_covariance_from_problem(&BaCovarianceOptions::default(), &reconstruction, &problem)
            .unwrap();
    let cov = ba_cov.point_cov(first).unwrap();
    assert!((cov[(0, 0)] - 1.0 / (1.0 + 1e-8)).abs() < 1e-12);
    assert!(ba_cov.point_cov(second).is_none());
}
