use nalgebra::{UnitQuaternion, Vector3};

/// Rigid transform `x ↦ R x + t` stored as a unit quaternion and a translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rigid3d {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl Default for Rigid3d {
    fn default() -> Self {
        Self::identity()
    }
}

impl Rigid3d {
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self::new(UnitQuaternion::identity(), Vector3::zeros())
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self::new(rotation, -(rotation * self.translation))
    }

    /// Composition `self ∘ other`.
    pub fn compose(&self, other: &Rigid3d) -> Self {
        Self::new(
            self.rotation * other.rotation,
            self.rotation * other.translation + self.translation,
        )
    }

    /// Position of the frame origin expressed in the source frame (`-Rᵀt`).
    pub fn origin(&self) -> Vector3<f64> {
        self.inverse().translation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_composes_to_identity() {
        let t = Rigid3d::new(
            UnitQuaternion::from_euler_angles(0.1, 0.2, -0.3),
            Vector3::new(1.0, -2.0, 0.5),
        );
        let id = t.compose(&t.inverse());
        assert!(id.rotation.angle() < 1e-12);
        assert!(id.translation.norm() < 1e-12);
    }

    #[test]
    fn test_transform_point_and_origin() {
        let t = Rigid3d::new(
            UnitQuaternion::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_2),
            Vector3::new(0.0, 1.0, 0.0),
        );
        let p = t.transform_point(&Vector3::new(1.0, 0.0, 0.0));
        assert!((p - Vector3::new(0.0, 2.0, 0.0)).norm() < 1e-12);
        assert!(t.transform_point(&t.origin()).norm() < 1e-12);
    }
}
