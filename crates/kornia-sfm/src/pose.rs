use glam::{DMat3, DVec3};
use serde::{Deserialize, Serialize};

use crate::linalg::so3_exp;

/// Rigid transform from the world frame to the camera frame.
///
/// A world point `X_w` maps to the camera frame as `X_c = R * X_w + t`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraPose {
    /// Rotation from world to camera.
    pub rotation: DMat3,
    /// Translation from world to camera.
    pub translation: DVec3,
}

impl Default for CameraPose {
    fn default() -> Self {
        Self::identity()
    }
}

impl CameraPose {
    /// Number of local (tangent space) parameters of a pose.
    pub const DOF: usize = 6;

    /// Create a pose from a rotation matrix and a translation.
    pub fn new(rotation: DMat3, translation: DVec3) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// The identity pose.
    pub fn identity() -> Self {
        Self::new(DMat3::IDENTITY, DVec3::ZERO)
    }

    /// Create a pose from an axis-angle rotation vector and a translation.
    pub fn from_axis_angle(rotation_vector: DVec3, translation: DVec3) -> Self {
        Self::new(so3_exp(&rotation_vector), translation)
    }

    /// Pose of a camera centered at `center` looking at `target`.
    ///
    /// The camera frame is x right, y down, z forward; `up` is the world up direction.
    pub fn look_at(center: DVec3, target: DVec3, up: DVec3) -> Self {
        let z_axis = (target - center).normalize();
        let x_axis = z_axis.cross(up).normalize();
        let y_axis = z_axis.cross(x_axis);
        // rows of the world-to-camera rotation are the camera axes in world coordinates
        let rotation = DMat3::from_cols(x_axis, y_axis, z_axis).transpose();
        Self::new(rotation, -(rotation * center))
    }

    /// Transform a world point to the camera frame.
    #[inline]
    pub fn transform_point(&self, point: &DVec3) -> DVec3 {
        self.rotation * *point + self.translation
    }

    /// Camera center in world coordinates.
    pub fn center(&self) -> DVec3 {
        -(self.rotation.transpose() * self.translation)
    }

    /// The 3x4 projection matrix `[R | t]` in row-major order.
    pub fn projection_matrix(&self) -> [[f64; 4]; 3] {
        let r = self.rotation.transpose();
        let t = self.translation;
        [
            [r.x_axis.x, r.x_axis.y, r.x_axis.z, t.x],
            [r.y_axis.x, r.y_axis.y, r.y_axis.z, t.y],
            [r.z_axis.x, r.z_axis.y, r.z_axis.z, t.z],
        ]
    }

    /// Apply a local update `[omega, delta_t]`.
    ///
    /// The rotation is perturbed on the left, `R' = exp(omega) * R`, and the translation
    /// additively, `t' = t + delta_t`.
    pub fn retract(&self, delta: &[f64; 6]) -> Self {
        let omega = DVec3::new(delta[0], delta[1], delta[2]);
        let delta_t = DVec3::new(delta[3], delta[4], delta[5]);
        Self::new(so3_exp(&omega) * self.rotation, self.translation + delta_t)
    }

    /// Whether all the entries of the pose are finite.
    pub fn is_finite(&self) -> bool {
        self.rotation.is_finite() && self.translation.is_finite()
    }
}
