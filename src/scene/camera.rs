//! Pinhole camera models with analytic projection Jacobians.

use nalgebra::{DMatrix, Matrix2x3, Vector2, Vector3};

use super::CameraId;

/// Minimum depth for a point to be considered in front of the camera.
const MIN_DEPTH: f64 = 1e-10;

/// Supported intrinsic models.
///
/// - `SimplePinhole`: `[f, cx, cy]`
/// - `Pinhole`: `[fx, fy, cx, cy]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CameraModelId {
    SimplePinhole,
    Pinhole,
}

impl CameraModelId {
    pub fn num_params(&self) -> usize {
        match self {
            CameraModelId::SimplePinhole => 3,
            CameraModelId::Pinhole => 4,
        }
    }

    /// Project a camera-frame point and return the pixel together with
    /// ∂uv/∂p_cam and ∂uv/∂params.
    ///
    /// Returns `None` for points on or behind the image plane.
    ///
    /// # Panics
    /// Panics if `params` does not match the model's parameter count.
    pub fn project_with_jacobians(
        &self,
        params: &[f64],
        p_cam: &Vector3<f64>,
    ) -> Option<(Vector2<f64>, Matrix2x3<f64>, DMatrix<f64>)> {
        assert_eq!(
            params.len(),
            self.num_params(),
            "{self:?} expects {} parameters, got {}",
            self.num_params(),
            params.len()
        );
        if p_cam.z < MIN_DEPTH {
            return None;
        }
        let inv_z = 1.0 / p_cam.z;
        let xn = p_cam.x * inv_z;
        let yn = p_cam.y * inv_z;

        let (fx, fy, cx, cy) = match self {
            CameraModelId::SimplePinhole => (params[0], params[0], params[1], params[2]),
            CameraModelId::Pinhole => (params[0], params[1], params[2], params[3]),
        };
        let uv = Vector2::new(fx * xn + cx, fy * yn + cy);

        let d_uv_d_point = Matrix2x3::new(
            fx * inv_z,
            0.0,
            -fx * xn * inv_z,
            0.0,
            fy * inv_z,
            -fy * yn * inv_z,
        );

        let mut d_uv_d_params = DMatrix::zeros(2, self.num_params());
        match self {
            CameraModelId::SimplePinhole => {
                d_uv_d_params[(0, 0)] = xn;
                d_uv_d_params[(1, 0)] = yn;
                d_uv_d_params[(0, 1)] = 1.0;
                d_uv_d_params[(1, 2)] = 1.0;
            }
            CameraModelId::Pinhole => {
                d_uv_d_params[(0, 0)] = xn;
                d_uv_d_params[(1, 1)] = yn;
                d_uv_d_params[(0, 2)] = 1.0;
                d_uv_d_params[(1, 3)] = 1.0;
            }
        }
        Some((uv, d_uv_d_point, d_uv_d_params))
    }
}

/// Camera intrinsics shared by one or more images.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub camera_id: CameraId,
    pub model: CameraModelId,
    pub width: usize,
    pub height: usize,
    pub params: Vec<f64>,
}

impl Camera {
    pub fn new(
        camera_id: CameraId,
        model: CameraModelId,
        width: usize,
        height: usize,
        params: Vec<f64>,
    ) -> Self {
        assert_eq!(
            params.len(),
            model.num_params(),
            "camera {camera_id}: {model:?} expects {} parameters",
            model.num_params()
        );
        Self {
            camera_id,
            model,
            width,
            height,
            params,
        }
    }

    /// Simple pinhole camera with the principal point at the image center.
    pub fn simple_pinhole(camera_id: CameraId, focal: f64, width: usize, height: usize) -> Self {
        Self::new(
            camera_id,
            CameraModelId::SimplePinhole,
            width,
            height,
            vec![focal, width as f64 / 2.0, height as f64 / 2.0],
        )
    }

    /// Project a camera-frame point into the image.
    pub fn img_from_cam(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        self.model
            .project_with_jacobians(&self.params, p_cam)
            .map(|(uv, _, _)| uv)
    }

    /// Whether a pixel falls inside the image bounds.
    pub fn contains(&self, uv: &Vector2<f64>) -> bool {
        uv.x >= 0.0 && uv.y >= 0.0 && uv.x < self.width as f64 && uv.y < self.height as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric_point_jacobian(model: CameraModelId, params: &[f64], p: &Vector3<f64>) -> Matrix2x3<f64> {
        let eps = 1e-6;
        let mut jac = Matrix2x3::zeros();
        for k in 0..3 {
            let mut plus = *p;
            let mut minus = *p;
            plus[k] += eps;
            minus[k] -= eps;
            let up = model.project_with_jacobians(params, &plus).unwrap().0;
            let um = model.project_with_jacobians(params, &minus).unwrap().0;
            jac.set_column(k, &((up - um) / (2.0 * eps)));
        }
        jac
    }

    #[test]
    fn test_simple_pinhole_projects_principal_point() {
        let camera = Camera::simple_pinhole(1, 500.0, 640, 480);
        let uv = camera.img_from_cam(&Vector3::new(0.0, 0.0, 2.0)).unwrap();
        assert!((uv.x - 320.0).abs() < 1e-12);
        assert!((uv.y - 240.0).abs() < 1e-12);
        assert!(camera.contains(&uv));
    }

    #[test]
    fn test_point_behind_camera_is_rejected() {
        let camera = Camera::simple_pinhole(1, 500.0, 640, 480);
        assert!(camera.img_from_cam(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_point_jacobians_match_finite_differences() {
        let p = Vector3::new(0.3, -0.2, 4.0);
        for (model, params) in [
            (CameraModelId::SimplePinhole, vec![800.0, 320.0, 240.0]),
            (CameraModelId::Pinhole, vec![800.0, 780.0, 320.0, 240.0]),
        ] {
            let (_, analytic, _) = model.project_with_jacobians(&params, &p).unwrap();
            let numeric = numeric_point_jacobian(model, &params, &p);
            assert!((analytic - numeric).norm() < 1e-5, "{model:?}");
        }
    }

    #[test]
    fn test_param_jacobian_pinhole() {
        let p = Vector3::new(0.5, 0.25, 2.0);
        let params = [100.0, 120.0, 10.0, 20.0];
        let (_, _, d_params) = CameraModelId::Pinhole
            .project_with_jacobians(&params, &p)
            .unwrap();
        assert_eq!(d_params[(0, 0)], 0.25);
        assert_eq!(d_params[(1, 1)], 0.125);
        assert_eq!(d_params[(0, 2)], 1.0);
        assert_eq!(d_params[(1, 3)], 1.0);
    }
}
