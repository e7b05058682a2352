//! Unit quaternion manifold for rotation blocks.
//!
//! Storage follows nalgebra's coefficient order `[x, y, z, w]`. Increments are
//! applied on the right: `q ⊞ δ = q ⊗ Exp(δ)`, where `Exp` maps an axis-angle
//! vector to a unit quaternion. The tangent space is therefore expressed in the
//! local (body) frame of the rotation.

use nalgebra::{DMatrix, DVector, Quaternion, UnitQuaternion, Vector3};

use super::{Manifold, ManifoldError, ManifoldResult, check_ambient, check_tangent, skew};

/// Unit quaternion with a 3-dimensional tangent space.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuaternionManifold;

impl QuaternionManifold {
    pub fn new() -> Self {
        Self
    }

    /// Build a normalized nalgebra quaternion from `[x, y, z, w]` storage.
    pub fn to_unit_quaternion(x: &[f64]) -> ManifoldResult<UnitQuaternion<f64>> {
        check_ambient(4, x.len())?;
        let q = Quaternion::new(x[3], x[0], x[1], x[2]);
        if q.norm() < 1e-12 {
            return Err(ManifoldError::InvalidElement(
                "quaternion has near-zero norm".to_string(),
            ));
        }
        Ok(UnitQuaternion::from_quaternion(q))
    }

    /// Storage coefficients `[x, y, z, w]` of a unit quaternion.
    pub fn coeffs(q: &UnitQuaternion<f64>) -> [f64; 4] {
        let c = q.quaternion().coords;
        [c[0], c[1], c[2], c[3]]
    }
}

impl Manifold for QuaternionManifold {
    fn ambient_size(&self) -> usize {
        4
    }

    fn tangent_size(&self) -> usize {
        3
    }

    fn plus(&self, x: &[f64], delta: &[f64]) -> ManifoldResult<DVector<f64>> {
        check_tangent(3, delta.len())?;
        let q = Self::to_unit_quaternion(x)?;
        let dq = UnitQuaternion::from_scaled_axis(Vector3::new(delta[0], delta[1], delta[2]));
        let coeffs = Self::coeffs(&(q * dq));
        Ok(DVector::from_row_slice(&coeffs))
    }

    fn plus_jacobian(&self, x: &[f64]) -> ManifoldResult<DMatrix<f64>> {
        let q = Self::to_unit_quaternion(x)?;
        let c = q.quaternion().coords;
        let v = Vector3::new(c[0], c[1], c[2]);
        let w = c[3];

        // d(q ⊗ [δ/2, 1])/dδ: vector rows 0.5 (w I + [v]×), scalar row -0.5 vᵀ.
        let top = (nalgebra::Matrix3::identity() * w + skew(&v)) * 0.5;
        let mut jacobian = DMatrix::zeros(4, 3);
        jacobian.view_mut((0, 0), (3, 3)).copy_from(&top);
        for k in 0..3 {
            jacobian[(3, k)] = -0.5 * v[k];
        }
        Ok(jacobian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_quaternion() -> [f64; 4] {
        let q = UnitQuaternion::from_euler_angles(0.3, -0.2, 1.1);
        QuaternionManifold::coeffs(&q)
    }

    #[test]
    fn test_plus_zero_is_identity() {
        let x = sample_quaternion();
        let result = QuaternionManifold.plus(&x, &[0.0, 0.0, 0.0]).unwrap();
        for i in 0..4 {
            assert!((result[i] - x[i]).abs() < 1e-15);
        }
    }

    #[test]
    fn test_plus_is_right_perturbation() {
        let x = sample_quaternion();
        let delta = [0.01, -0.02, 0.03];
        let result = QuaternionManifold.plus(&x, &delta).unwrap();
        let q = QuaternionManifold::to_unit_quaternion(&x).unwrap();
        let expected = q * UnitQuaternion::from_scaled_axis(Vector3::new(0.01, -0.02, 0.03));
        let rebuilt = QuaternionManifold::to_unit_quaternion(result.as_slice()).unwrap();
        assert!(rebuilt.angle_to(&expected) < 1e-12);
    }

    #[test]
    fn test_plus_jacobian_matches_finite_differences() {
        let x = sample_quaternion();
        let analytic = QuaternionManifold.plus_jacobian(&x).unwrap();
        let eps = 1e-7;
        for k in 0..3 {
            let mut delta = [0.0; 3];
            delta[k] = eps;
            let forward = QuaternionManifold.plus(&x, &delta).unwrap();
            delta[k] = -eps;
            let backward = QuaternionManifold.plus(&x, &delta).unwrap();
            for i in 0..4 {
                let numeric = (forward[i] - backward[i]) / (2.0 * eps);
                assert!(
                    (numeric - analytic[(i, k)]).abs() < 1e-8,
                    "entry ({i}, {k}): numeric {numeric} vs analytic {}",
                    analytic[(i, k)]
                );
            }
        }
    }

    #[test]
    fn test_rejects_bad_sizes() {
        assert!(QuaternionManifold.plus(&[0.0, 0.0, 1.0], &[0.0; 3]).is_err());
        assert!(QuaternionManifold.plus(&sample_quaternion(), &[0.0; 2]).is_err());
        assert!(QuaternionManifold.plus_jacobian(&[0.0; 4]).is_err());
    }
}
