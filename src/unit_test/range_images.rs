use crate::camera::CameraIntrinsics;
use crate::range_image::RangeImage;

use super::plane_depth_frame;

/// Fronto-parallel plane at `depth` with normals.
pub fn plane_range_image(intrinsics: &CameraIntrinsics, depth: f32) -> RangeImage {
    let mut range_image =
        RangeImage::from_depth(&plane_depth_frame(intrinsics, depth, 0.0), 0.1, 5.0);
    range_image.compute_normals();
    range_image
}
