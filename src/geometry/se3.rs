//! SE3: 6-DOF rigid transformation (rotation + translation).
//!
//! This is the pose type used everywhere in the graph: vertex estimates,
//! edge measurements, and the camera-to-reference offset are all SE3.
//! Transforms points as: p' = R * p + t.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};

/// 6-DOF rigid transformation: rotation + translation.
///
/// Always a valid rigid motion (unit quaternion, no scale or shear).
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation (no rotation, no translation).
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Construct from quaternion components (w, x, y, z) and translation.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(qw, qx, qy, qz));
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from a rotation matrix and translation.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Construct from a homogeneous 4x4 matrix of form [R | t; 0 | 1].
    pub fn from_matrix(mat: Matrix4<f64>) -> Self {
        let r_block = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let translation = Vector3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]);
        Self::from_rt(r_block, translation)
    }

    /// Convert to a homogeneous 4x4 matrix of form [R | t; 0 0 0 1].
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let r = self.rotation.to_rotation_matrix().into_inner();
        let mut mat = Matrix4::identity();
        mat.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
        mat[(0, 3)] = self.translation.x;
        mat[(1, 3)] = self.translation.y;
        mat[(2, 3)] = self.translation.z;
        mat
    }

    /// Inverse transformation: T^{-1} = [R^T | -R^T*t].
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let t_inv = -(rot_inv * self.translation);
        Self {
            rotation: rot_inv,
            translation: t_inv,
        }
    }

    /// Compose two transforms: self ∘ other.
    ///
    /// For T1 = [R1 | t1] and T2 = [R2 | t2]:
    /// T1 ∘ T2 = [R1*R2 | R1*t2 + t1]
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Relative transform from `self` to `other`: self^{-1} ∘ other.
    pub fn between(&self, other: &SE3) -> Self {
        self.inverse().compose(other)
    }

    /// Transform a single point: p' = R * p + t.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Transform multiple points.
    pub fn transform_points(&self, pts: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
        pts.iter().map(|p| self.transform_point(p)).collect()
    }

    /// Get the rotation matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Log map: convert to a 6-element vector [rotation_vec (3), translation (3)].
    ///
    /// Used by the optimizer to work in the tangent space.
    pub fn log(&self) -> [f64; 6] {
        let rot_vec = self.rotation.scaled_axis();
        [
            rot_vec.x,
            rot_vec.y,
            rot_vec.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ]
    }

    /// Exponential map: construct from a 6-element tangent vector.
    pub fn exp(tangent: &[f64; 6]) -> Self {
        let rot_vec = Vector3::new(tangent[0], tangent[1], tangent[2]);
        let rotation = UnitQuaternion::from_scaled_axis(rot_vec);
        let translation = Vector3::new(tangent[3], tangent[4], tangent[5]);
        Self {
            rotation,
            translation,
        }
    }

    /// Apply a small update in the tangent space.
    pub fn retract(&self, delta: &[f64; 6]) -> Self {
        let delta_se3 = Self::exp(delta);
        self.compose(&delta_se3)
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity() {
        let se3 = SE3::identity();
        assert_eq!(se3.translation, Vector3::zeros());

        let p = Vector3::new(1.0, 2.0, 3.0);
        let p_transformed = se3.transform_point(&p);
        assert_relative_eq!(p_transformed, p, epsilon = 1e-10);
    }

    #[test]
    fn test_inverse() {
        let se3 = SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(0.0, 0.0, 1.0)),
                std::f64::consts::FRAC_PI_2,
            ),
            translation: Vector3::new(1.0, 2.0, 3.0),
        };

        let se3_inv = se3.inverse();
        let composed = se3.compose(&se3_inv);

        assert_relative_eq!(composed.translation.norm(), 0.0, epsilon = 1e-10);

        let p = Vector3::new(1.0, 2.0, 3.0);
        let p_transformed = se3.transform_point(&p);
        let p_back = se3_inv.transform_point(&p_transformed);
        assert_relative_eq!(p_back, p, epsilon = 1e-10);
    }

    #[test]
    fn test_compose() {
        let t1 = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(1.0, 0.0, 0.0),
        };
        let t2 = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.0, 1.0, 0.0),
        };

        let composed = t1.compose(&t2);
        assert_relative_eq!(
            composed.translation,
            Vector3::new(1.0, 1.0, 0.0),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_between() {
        let t1 = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(1.0, 0.0, 0.0),
        };
        let t2 = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(3.0, 0.0, 0.0),
        };

        let rel = t1.between(&t2);
        assert_relative_eq!(
            rel.translation,
            Vector3::new(2.0, 0.0, 0.0),
            epsilon = 1e-10
        );

        // t1 ∘ rel should recover t2
        let recovered = t1.compose(&rel);
        assert_relative_eq!(recovered.translation, t2.translation, epsilon = 1e-10);
    }

    #[test]
    fn test_transform_point_rotation() {
        // 90 degrees around Z maps +X to +Y
        let se3 = SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(0.0, 0.0, 1.0)),
                std::f64::consts::FRAC_PI_2,
            ),
            translation: Vector3::new(0.0, 0.0, 1.0),
        };

        let p = Vector3::new(1.0, 0.0, 0.0);
        let p_transformed = se3.transform_point(&p);
        assert_relative_eq!(
            p_transformed,
            Vector3::new(0.0, 1.0, 1.0),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_to_from_matrix() {
        let se3 = SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(1.0, 0.0, 0.0)),
                std::f64::consts::FRAC_PI_4,
            ),
            translation: Vector3::new(1.0, 2.0, 3.0),
        };

        let mat = se3.to_matrix();
        let reconstructed = SE3::from_matrix(mat);

        assert_relative_eq!(se3.translation, reconstructed.translation, epsilon = 1e-10);
        assert_relative_eq!(
            se3.rotation.coords,
            reconstructed.rotation.coords,
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_log_exp_roundtrip() {
        let se3 = SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(0.0, 1.0, 0.0)),
                0.5,
            ),
            translation: Vector3::new(1.0, 2.0, 3.0),
        };

        let log_vec = se3.log();
        let reconstructed = SE3::exp(&log_vec);

        assert_relative_eq!(se3.translation, reconstructed.translation, epsilon = 1e-10);
        assert_relative_eq!(
            se3.rotation.coords,
            reconstructed.rotation.coords,
            epsilon = 1e-10
        );
    }
}
