//! Reprojection error of a 3D point observed by a pinhole camera.
//!
//! # Camera Model
//!
//! ```text
//! p_cam = R(q) · X + t
//! u     = fx · p_cam.x / p_cam.z + cx
//! v     = fy · p_cam.y / p_cam.z + cy
//! r     = [u, v] - observed
//! ```
//!
//! Parameter blocks, in order: rotation `q` as `[x, y, z, w]`, translation `t`,
//! point `X`, camera intrinsics.

use nalgebra::{DMatrix, DVector, Matrix3, Matrix3x4, Quaternion, Vector2, Vector3};

use super::Factor;
use crate::manifold::skew;
use crate::scene::CameraModelId;

#[derive(Debug, Clone)]
pub struct ReprojectionFactor {
    observed: Vector2<f64>,
    model: CameraModelId,
    block_sizes: [usize; 4],
}

impl ReprojectionFactor {
    pub fn new(observed: Vector2<f64>, model: CameraModelId) -> Self {
        Self {
            observed,
            model,
            block_sizes: [4, 3, 3, model.num_params()],
        }
    }

    pub fn observed(&self) -> &Vector2<f64> {
        &self.observed
    }
}

/// Jacobian of `R(q) · X` with respect to the quaternion coefficients `[x, y, z, w]`.
///
/// # Derivation
///
/// For a unit quaternion with vector part `v` and scalar part `w`:
/// ```text
/// R(q) X = X + 2w (v × X) + 2 v × (v × X) = (I + 2w[v]× + 2[v]×²) X
///
/// ∂/∂w = 2 (v × X)
/// ∂/∂v = -2w [X]× + 2 ((v·X) I + v Xᵀ - 2 X vᵀ)
/// ```
fn rotate_point_jacobian(q: &Quaternion<f64>, point: &Vector3<f64>) -> Matrix3x4<f64> {
    let w = q.w;
    let v = q.imag();
    let d_vec = -2.0 * w * skew(point)
        + 2.0 * (Matrix3::identity() * v.dot(point) + v * point.transpose()
            - 2.0 * point * v.transpose());
    let d_w = 2.0 * v.cross(point);

    let mut jacobian = Matrix3x4::zeros();
    jacobian.fixed_view_mut::<3, 3>(0, 0).copy_from(&d_vec);
    jacobian.set_column(3, &d_w);
    jacobian
}

impl Factor for ReprojectionFactor {
    fn residual_dimension(&self) -> usize {
        2
    }

    fn parameter_block_sizes(&self) -> &[usize] {
        &self.block_sizes
    }

    /// Points on or behind the image plane yield a zero residual and Jacobian so
    /// they drop out of the normal equations instead of poisoning them.
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        assert_eq!(
            params.len(),
            4,
            "reprojection factor expects 4 parameter blocks, got {}",
            params.len()
        );
        let q = Quaternion::new(params[0][3], params[0][0], params[0][1], params[0][2]);
        let translation = Vector3::new(params[1][0], params[1][1], params[1][2]);
        let point = Vector3::new(params[2][0], params[2][1], params[2][2]);
        let intrinsics = params[3].as_slice();

        let v_skew = skew(&q.imag());
        let rotation_matrix = Matrix3::identity() + 2.0 * q.w * v_skew + 2.0 * v_skew * v_skew;
        let p_cam = rotation_matrix * point + translation;

        let total_cols: usize = self.block_sizes.iter().sum();
        let Some((uv, d_uv_d_p_cam, d_uv_d_params)) =
            self.model.project_with_jacobians(intrinsics, &p_cam)
        else {
            let jacobian = compute_jacobian.then(|| DMatrix::zeros(2, total_cols));
            return (DVector::zeros(2), jacobian);
        };

        let residual = DVector::from_column_slice((uv - self.observed).as_slice());
        if !compute_jacobian {
            return (residual, None);
        }

        // ∂p_cam/∂t = I and ∂p_cam/∂X = R
        let d_rotation = d_uv_d_p_cam * rotate_point_jacobian(&q, &point);
        let d_point = d_uv_d_p_cam * rotation_matrix;

        let mut jacobian = DMatrix::zeros(2, total_cols);
        jacobian.view_mut((0, 0), (2, 4)).copy_from(&d_rotation);
        jacobian.view_mut((0, 4), (2, 3)).copy_from(&d_uv_d_p_cam);
        jacobian.view_mut((0, 7), (2, 3)).copy_from(&d_point);
        jacobian
            .view_mut((0, 10), (2, self.block_sizes[3]))
            .copy_from(&d_uv_d_params);
        (residual, Some(jacobian))
    }
}
