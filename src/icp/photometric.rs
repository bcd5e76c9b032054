use nalgebra::Vector3;
use rayon::prelude::*;

use super::cost_function::PhotometricDistance;
use crate::camera::CameraIntrinsics;
use crate::intensity_map::IntensityMap;
use crate::optim::GaussNewton;
use crate::range_image::RangeImage;
use crate::transform::Pose;

/// Pixels with a flatter intensity gradient do not constrain the pose.
const MIN_GRADIENT: f32 = 1e-3;

/// A color image with a known placement, e.g. a keyframe.
pub struct IntensityView<'a> {
    /// Color camera to world.
    pub camera_pose: Pose,
    pub intrinsics: &'a CameraIntrinsics,
    pub intensity: &'a IntensityMap,
}

/// Photoconsistency between the current color image and a reference view,
/// linearized around the pose of the depth camera.
pub struct PhotometricTerm<'a> {
    pub reference: IntensityView<'a>,
    pub current: &'a IntensityMap,
    pub current_intrinsics: &'a CameraIntrinsics,
    /// Color camera to depth camera of the current frame.
    pub color_to_depth: Pose,
}

impl<'a> PhotometricTerm<'a> {
    /// Accumulates the normal equations for the points of `source` (depth camera frame).
    pub fn linearize(&self, source: &RangeImage, pose: &Pose) -> GaussNewton<6> {
        let distance = PhotometricDistance {};
        let reference = &self.reference;
        let reference_rotation = reference.camera_pose.rotation_matrix();

        (0..source.height())
            .into_par_iter()
            .fold(GaussNewton::<6>::new, |mut gn, row| {
                for col in 0..source.width() {
                    let point = match source.get_point(row, col) {
                        Some(point) => point,
                        None => continue,
                    };

                    let current_point = self.color_to_depth.inverse_transform_vector(&point);
                    if current_point[2] <= 0.0 {
                        continue;
                    }
                    let (u, v) = self.current_intrinsics.project(&current_point);
                    if !self.current.contains(u, v) {
                        continue;
                    }
                    let source_intensity = self.current.bilinear(u, v);

                    let world_point = pose.transform_vector(&point);
                    let kf_point = reference.camera_pose.inverse_transform_vector(&world_point);
                    if kf_point[2] <= 0.0 {
                        continue;
                    }
                    let (ku, kv) = reference.intrinsics.project(&kf_point);
                    if !reference.intensity.contains(ku, kv) {
                        continue;
                    }
                    let (target_intensity, du, dv) = reference.intensity.bilinear_grad(ku, kv);
                    if du * du + dv * dv < MIN_GRADIENT * MIN_GRADIENT {
                        continue;
                    }

                    let ((dfx, dcx), (dfy, dcy)) = reference.intrinsics.project_grad(&kf_point);
                    let camera_gradient = Vector3::new(du * dfx, dv * dfy, du * dcx + dv * dcy);
                    let world_gradient = reference_rotation * camera_gradient;

                    let (residual, jacobian) = distance.jacobian(
                        &world_point,
                        &world_gradient,
                        source_intensity,
                        target_intensity,
                    );
                    gn.step(residual, &jacobian);
                }
                gn
            })
            .reduce(GaussNewton::<6>::new, |mut lhs, rhs| {
                lhs.add(&rhs);
                lhs
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit_test::{plane_range_image, small_intrinsics};
    use ndarray::Array2;
    use rstest::rstest;

    #[rstest]
    fn should_ignore_flat_images(small_intrinsics: CameraIntrinsics) {
        let flat = IntensityMap::from_luma_image(&Array2::from_elem((60, 80), 128u8).view());
        let term = PhotometricTerm {
            reference: IntensityView {
                camera_pose: Pose::eye(),
                intrinsics: &small_intrinsics,
                intensity: &flat,
            },
            current: &flat,
            current_intrinsics: &small_intrinsics,
            color_to_depth: Pose::eye(),
        };
        let system = term.linearize(&plane_range_image(&small_intrinsics, 0.5), &Pose::eye());
        assert_eq!(system.count(), 0);
    }

    #[rstest]
    fn should_match_identical_views(small_intrinsics: CameraIntrinsics) {
        let texture = Array2::from_shape_fn((60, 80), |(row, col)| (row + col * 2) as u8);
        let map = IntensityMap::from_luma_image(&texture.view());
        let term = PhotometricTerm {
            reference: IntensityView {
                camera_pose: Pose::eye(),
                intrinsics: &small_intrinsics,
                intensity: &map,
            },
            current: &map,
            current_intrinsics: &small_intrinsics,
            color_to_depth: Pose::eye(),
        };
        let system = term.linearize(&plane_range_image(&small_intrinsics, 0.5), &Pose::eye());
        assert!(system.count() > 1000);
        assert!(system.mean_squared_residual() < 1e-8);
    }
}
