use nalgebra::Vector3;

/// Jacobian of a left-multiplied twist `[t, w]` acting on `point`, projected on `direction`.
fn se3_jacobian(point: &Vector3<f32>, direction: &Vector3<f32>) -> [f32; 6] {
    let twist = point.cross(direction);
    [
        direction[0],
        direction[1],
        direction[2],
        twist[0],
        twist[1],
        twist[2],
    ]
}

pub struct PointPlaneDistance {}

impl PointPlaneDistance {
    /// Computes the residual and the Jacobian of the point-plane distance.
    ///
    /// # Arguments
    ///
    /// * source_point - Source point already placed in the world frame.
    /// * target_point - Predicted model point.
    /// * target_normal - Normal of the model at the target point.
    ///
    /// # Returns
    ///
    /// * The residual `(target - source) . normal` and its (6) Jacobian.
    pub fn jacobian(
        &self,
        source_point: &Vector3<f32>,
        target_point: &Vector3<f32>,
        target_normal: &Vector3<f32>,
    ) -> (f32, [f32; 6]) {
        let residual = (target_point - source_point).dot(target_normal);
        (residual, se3_jacobian(source_point, target_normal))
    }
}

pub struct PhotometricDistance {}

impl PhotometricDistance {
    /// Computes the residual and the Jacobian of the intensity difference.
    ///
    /// # Arguments
    ///
    /// * world_point - Source point placed in the world frame.
    /// * world_gradient - Spatial gradient, in the world frame, of the target
    ///   intensity at the projection of the point.
    /// * source_intensity - Intensity observed for the point in the current frame.
    /// * target_intensity - Intensity of the target image at the projection.
    pub fn jacobian(
        &self,
        world_point: &Vector3<f32>,
        world_gradient: &Vector3<f32>,
        source_intensity: f32,
        target_intensity: f32,
    ) -> (f32, [f32; 6]) {
        (
            source_intensity - target_intensity,
            se3_jacobian(world_point, world_gradient),
        )
    }
}
