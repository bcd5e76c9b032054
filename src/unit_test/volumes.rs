use rstest::*;

use crate::camera::CameraIntrinsics;
use crate::config::{FusionParams, VolumeParams};
use crate::fusion::TsdfFusion;
use crate::transform::Pose;
use crate::volume::Volume;

use super::plane_range_image;

/// A 0.9 m cube of 48^3 voxels in front of the origin.
#[fixture]
pub fn small_volume_params() -> VolumeParams {
    VolumeParams::default()
        .with_center([0.0, 0.0, 0.4])
        .with_size(0.9)
        .with_resolution(48)
}

/// Volume with a plane at `depth` fused `times` from the origin.
pub fn fused_plane_volume(intrinsics: &CameraIntrinsics, depth: f32, times: usize) -> Volume {
    let mut volume = Volume::new(&small_volume_params(), &FusionParams::default()).unwrap();
    let frame = plane_range_image(intrinsics, depth);
    let fusion = TsdfFusion::default();
    for _ in 0..times {
        fusion
            .integrate(&mut volume, &frame, None, &Pose::eye(), 1.0)
            .unwrap();
    }
    volume
}
