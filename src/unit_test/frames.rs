use ndarray::{Array2, Array3};
use rstest::*;

use crate::camera::CameraIntrinsics;
use crate::frame::{ColorFrame, DepthFrame};
use crate::synthetic::SyntheticScene;
use crate::transform::Pose;

/// A 80x60 camera with a 53 degrees horizontal field of view.
#[fixture]
pub fn small_intrinsics() -> CameraIntrinsics {
    CameraIntrinsics::new(80.0, 80.0, 40.0, 30.0, 80, 60)
}

/// Every pixel at `depth` meters.
pub fn plane_depth_frame(intrinsics: &CameraIntrinsics, depth: f32, timestamp: f64) -> DepthFrame {
    DepthFrame::new(
        Array2::from_elem((intrinsics.height, intrinsics.width), depth),
        timestamp,
        intrinsics.clone(),
    )
}

/// The room corner of [`SyntheticScene::corner`] seen from `pose`.
pub fn corner_depth_frame(intrinsics: &CameraIntrinsics, pose: &Pose, timestamp: f64) -> DepthFrame {
    let (depth, _) = SyntheticScene::corner().render(intrinsics, pose);
    DepthFrame::new(depth, timestamp, intrinsics.clone())
}

/// Adds `offset` meters to every sample.
pub fn offset_depth_frame(frame: &DepthFrame, offset: f32) -> DepthFrame {
    DepthFrame::new(
        frame.depth().mapv(|z| z + offset),
        frame.timestamp(),
        frame.intrinsics().clone(),
    )
}

/// Uniformly colored frame.
pub fn plane_color_frame(intrinsics: &CameraIntrinsics, rgb: [u8; 3], timestamp: f64) -> ColorFrame {
    let image = Array3::from_shape_fn((intrinsics.height, intrinsics.width, 3), |(_, _, c)| rgb[c]);
    ColorFrame::new(image, timestamp, intrinsics.clone())
}
