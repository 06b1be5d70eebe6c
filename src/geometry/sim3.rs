//! Sim3: 7-DOF similarity transformation (rotation + translation + scale).
//!
//! Monocular SLAM drifts in scale, so loop corrections are estimated as
//! similarities. Configurations with observable scale (stereo, RGB-D,
//! initialized IMU) fix the 7th degree of freedom and Sim3 degenerates to
//! SE3 with scale 1.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use super::SE3;

/// 7-DOF similarity transformation.
///
/// Transforms points as: p' = s * R * p + t
#[derive(Debug, Clone, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    /// Identity transformation (no rotation, no translation, scale = 1).
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    /// Construct from rotation, translation and scale.
    pub fn from_parts(rotation: UnitQuaternion<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        Self {
            rotation,
            translation,
            scale,
        }
    }

    /// Lift an SE3 into Sim3 with scale = 1.0.
    pub fn from_se3(se3: &SE3) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale: 1.0,
        }
    }

    /// Drop the scale, keeping rotation and translation unchanged.
    pub fn to_se3(&self) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation,
        }
    }

    /// Convert to SE3 the way a corrected camera pose is committed: the
    /// translation is divided by the scale so that the rigid pose places the
    /// camera consistently with the scaled map.
    pub fn to_se3_scaled(&self) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation / self.scale,
        }
    }

    /// Inverse: S⁻¹ = [(1/s)Rᵀ | -(1/s)Rᵀ t].
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let scale_inv = 1.0 / self.scale;
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation) * scale_inv,
            scale: scale_inv,
        }
    }

    /// Compose two similarities: self ∘ other.
    ///
    /// For S1 = [s1 R1 | t1] and S2 = [s2 R2 | t2]:
    /// S1 ∘ S2 = [s1 s2 R1 R2 | s1 R1 t2 + t1]
    pub fn compose(&self, other: &Sim3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.scale * (self.rotation * other.translation) + self.translation,
            scale: self.scale * other.scale,
        }
    }

    /// Transform a single point: p' = s * R * p + t.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    /// Rotation as a 3x3 matrix (without scale).
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Rotation-only log map: the axis-angle vector φ of the rotation part.
    pub fn rotation_log(&self) -> Vector3<f64> {
        self.rotation.scaled_axis()
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity_maps_points_unchanged() {
        let p = Vector3::new(1.0, 2.0, 3.0);
        assert_relative_eq!(Sim3::identity().transform_point(&p), p, epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        let sim3 = Sim3::from_parts(
            UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(0.0, 0.0, 1.0)),
                std::f64::consts::FRAC_PI_2,
            ),
            Vector3::new(1.0, 2.0, 3.0),
            2.0,
        );

        let composed = sim3.compose(&sim3.inverse());
        assert_relative_eq!(composed.scale, 1.0, epsilon = 1e-12);
        assert_relative_eq!(composed.translation.norm(), 0.0, epsilon = 1e-12);

        let p = Vector3::new(-0.4, 1.1, 0.2);
        let back = sim3.inverse().transform_point(&sim3.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_scale_and_translation() {
        let s1 = Sim3::from_parts(UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0), 2.0);
        let s2 = Sim3::from_parts(UnitQuaternion::identity(), Vector3::new(0.0, 1.0, 0.0), 3.0);

        let composed = s1.compose(&s2);
        assert_relative_eq!(composed.scale, 6.0, epsilon = 1e-12);
        assert_relative_eq!(
            composed.translation,
            Vector3::new(1.0, 2.0, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_compose_matches_sequential_mapping() {
        let s1 = Sim3::from_parts(
            UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(1.0, 1.0, 0.0)),
                0.3,
            ),
            Vector3::new(0.5, -1.0, 2.0),
            1.4,
        );
        let s2 = Sim3::from_parts(
            UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(0.0, 1.0, 2.0)),
                -0.8,
            ),
            Vector3::new(-2.0, 0.0, 1.0),
            0.7,
        );

        let p = Vector3::new(0.1, 0.2, 0.3);
        let composed = s1.compose(&s2).transform_point(&p);
        let sequential = s1.transform_point(&s2.transform_point(&p));
        assert_relative_eq!(composed, sequential, epsilon = 1e-12);
    }

    #[test]
    fn test_scaled_se3_divides_translation() {
        let sim3 = Sim3::from_parts(UnitQuaternion::identity(), Vector3::new(2.0, 4.0, 6.0), 2.0);
        let se3 = sim3.to_se3_scaled();
        assert_relative_eq!(se3.translation, Vector3::new(1.0, 2.0, 3.0), epsilon = 1e-12);
    }
}
