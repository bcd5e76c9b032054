use nalgebra::{
    Isometry3, Matrix3, Matrix4, Quaternion, Rotation3, Translation3, UnitQuaternion, Vector3,
    Vector6,
};

use std::ops;

/// Rigid transform placing a sensor in the world frame (camera to world).
/// Stored as a unit quaternion plus a translation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose(Isometry3<f32>);

impl Default for Pose {
    fn default() -> Self {
        Self::eye()
    }
}

impl Pose {
    /// Identity pose.
    pub fn eye() -> Self {
        Self(Isometry3::identity())
    }

    /// Creates a pose from a translation and a (not necessarily normalized) quaternion.
    pub fn new(translation: &Vector3<f32>, rotation: &Quaternion<f32>) -> Self {
        Self(Isometry3::from_parts(
            Translation3::from(*translation),
            UnitQuaternion::from_quaternion(*rotation),
        ))
    }

    /// Pure translation.
    pub fn from_translation(translation: &Vector3<f32>) -> Self {
        Self(Isometry3::from_parts(
            Translation3::from(*translation),
            UnitQuaternion::identity(),
        ))
    }

    /// Creates a pose from a translation and a scaled rotation axis.
    pub fn from_parts(translation: &Vector3<f32>, scaled_axis: &Vector3<f32>) -> Self {
        Self(Isometry3::from_parts(
            Translation3::from(*translation),
            UnitQuaternion::from_scaled_axis(*scaled_axis),
        ))
    }

    /// Exponential of a twist, layout is `[tx, ty, tz, rx, ry, rz]`.
    pub fn exp(twist: &Vector6<f32>) -> Self {
        Self::from_parts(
            &Vector3::new(twist[0], twist[1], twist[2]),
            &Vector3::new(twist[3], twist[4], twist[5]),
        )
    }

    pub fn from_matrix4(matrix: &Matrix4<f32>) -> Self {
        let translation = Translation3::new(matrix[(0, 3)], matrix[(1, 3)], matrix[(2, 3)]);
        let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(
            &matrix.fixed_slice::<3, 3>(0, 0).into_owned(),
        ));
        Self(Isometry3::from_parts(translation, rotation))
    }

    pub fn inverse(&self) -> Self {
        Self(self.0.inverse())
    }

    pub fn transform_vector(&self, point: &Vector3<f32>) -> Vector3<f32> {
        self.0.rotation * point + self.0.translation.vector
    }

    /// Applies the inverse transform without building it.
    pub fn inverse_transform_vector(&self, point: &Vector3<f32>) -> Vector3<f32> {
        self.0
            .rotation
            .inverse_transform_vector(&(point - self.0.translation.vector))
    }

    pub fn transform_normal(&self, normal: &Vector3<f32>) -> Vector3<f32> {
        self.0.rotation * normal
    }

    pub fn translation(&self) -> Vector3<f32> {
        self.0.translation.vector
    }

    pub fn quaternion(&self) -> UnitQuaternion<f32> {
        self.0.rotation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f32> {
        self.0.rotation.to_rotation_matrix().into_inner()
    }

    /// Rotation angle in radians.
    pub fn angle(&self) -> f32 {
        self.0.rotation.angle()
    }

    /// Maximum absolute deviation of `R^T R` from the identity.
    pub fn orthonormality_error(&self) -> f32 {
        let rot = self.rotation_matrix();
        (rot.transpose() * rot - Matrix3::identity()).abs().max()
    }

    /// Renormalizes the quaternion, keeping the rotation submatrix orthonormal.
    pub fn renormalize(&mut self) {
        self.0.rotation.renormalize();
    }

    /// Translation and angle between this pose and `other`.
    pub fn delta_to(&self, other: &Pose) -> (f32, f32) {
        let diff = self.inverse() * *other;
        (diff.translation().norm(), diff.angle())
    }

    pub fn is_identity(&self, epsilon: f32) -> bool {
        self.translation().norm() < epsilon && self.angle() < epsilon
    }
}

impl ops::Mul<Pose> for Pose {
    type Output = Pose;

    fn mul(self, rhs: Pose) -> Self::Output {
        Pose(self.0 * rhs.0)
    }
}

impl ops::Mul<&Pose> for &Pose {
    type Output = Pose;

    fn mul(self, rhs: &Pose) -> Self::Output {
        Pose(self.0 * rhs.0)
    }
}

impl ops::Mul<&Vector3<f32>> for &Pose {
    type Output = Vector3<f32>;

    fn mul(self, rhs: &Vector3<f32>) -> Self::Output {
        self.transform_vector(rhs)
    }
}

impl From<Pose> for Matrix4<f32> {
    fn from(pose: Pose) -> Self {
        pose.0.to_homogeneous()
    }
}

impl From<&Pose> for Matrix4<f32> {
    fn from(pose: &Pose) -> Self {
        pose.0.to_homogeneous()
    }
}
