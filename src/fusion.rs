use itertools::izip;
use nalgebra::Vector3;
use ndarray::{ArrayViewMut2, Axis};
use rayon::prelude::*;
use tracing::debug;

use crate::config::FusionParams;
use crate::error::{Error, Result};
use crate::frame::ColorFrame;
use crate::range_image::RangeImage;
use crate::transform::Pose;
use crate::volume::{Volume, VoxelColor, VoxelGrid};

/// Result of fusing one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FusionSummary {
    pub updated_voxels: usize,
    pub colored_voxels: usize,
}

/// What to do with the volume bounds before integrating a frame.
#[derive(Clone, Debug, PartialEq)]
pub enum BoundsPlan {
    /// The frustum fits well enough.
    Keep,
    /// Shift the volume by this many voxels.
    Recenter {
        shift: [i64; 3],
        discard_fraction: f32,
    },
    /// Recentering would discard too much of the fused surface.
    Exceeded { discard_fraction: f32 },
}

/// Projective TSDF fusion with Curless-Levoy weighting.
#[derive(Clone, Debug, Default)]
pub struct TsdfFusion {
    pub params: FusionParams,
}

struct Sample {
    distance: f32,
    weight: f32,
    color: Option<[u8; 3]>,
}

impl TsdfFusion {
    pub fn new(params: FusionParams) -> Self {
        Self { params }
    }

    /// Integrates a frame into the volume.
    ///
    /// # Arguments
    ///
    /// * `volume` - The volume to update.
    /// * `frame` - Depth frame in the camera frame, with normals.
    /// * `color` - Optional color frame of the same instant.
    /// * `pose` - Camera to world transform of the frame.
    /// * `quality` - Tracking confidence in [0, 1], scales the sample weights.
    ///
    /// # Returns
    ///
    /// Error `PoseOutsideVolume` if the camera center is not inside the volume.
    pub fn integrate(
        &self,
        volume: &mut Volume,
        frame: &RangeImage,
        color: Option<&ColorFrame>,
        pose: &Pose,
        quality: f32,
    ) -> Result<FusionSummary> {
        if !volume.contains(&pose.translation()) {
            return Err(Error::PoseOutsideVolume);
        }
        if frame.normals.is_none() {
            return Err(Error::invalid_parameter(
                "the fused frame needs normals",
            ));
        }
        let quality = quality.clamp(0.0, 1.0);
        if quality <= 0.0 {
            return Ok(FusionSummary::default());
        }

        let truncation = volume.truncation();
        let max_weight = volume.max_weight();
        let (grid, tsdf, weight, colors) = volume.layers_mut();
        let grid = *grid;
        let color = color.filter(|_| colors.is_some());

        let color_slices: Vec<Option<ArrayViewMut2<VoxelColor>>> = match colors {
            Some(colors) => colors.axis_iter_mut(Axis(0)).map(Some).collect(),
            None => (0..grid.dims[0]).map(|_| None).collect(),
        };

        let slices: Vec<_> = izip!(
            tsdf.axis_iter_mut(Axis(0)),
            weight.axis_iter_mut(Axis(0)),
            color_slices
        )
        .enumerate()
        .collect();

        let summary = slices
            .into_par_iter()
            .map(|(i, (mut tsdf, mut weight, mut colors))| {
                let mut summary = FusionSummary::default();
                for j in 0..grid.dims[1] {
                    for k in 0..grid.dims[2] {
                        let sample = match sample_voxel(
                            &grid, i, j, k, frame, color, pose, truncation, quality,
                        ) {
                            Some(sample) => sample,
                            None => continue,
                        };

                        let (d, w) = (&mut tsdf[(j, k)], &mut weight[(j, k)]);
                        *d = (*w * *d + sample.weight * sample.distance) / (*w + sample.weight);
                        *w = (*w + sample.weight).min(max_weight);
                        summary.updated_voxels += 1;

                        if let (Some(colors), Some(rgb)) = (colors.as_mut(), sample.color) {
                            let voxel = &mut colors[(j, k)];
                            let total = voxel.weight + sample.weight;
                            for c in 0..3 {
                                voxel.rgb[c] = (voxel.weight * voxel.rgb[c]
                                    + sample.weight * rgb[c] as f32)
                                    / total;
                            }
                            voxel.weight = total.min(max_weight);
                            summary.colored_voxels += 1;
                        }
                    }
                }
                summary
            })
            .reduce(FusionSummary::default, |a, b| FusionSummary {
                updated_voxels: a.updated_voxels + b.updated_voxels,
                colored_voxels: a.colored_voxels + b.colored_voxels,
            });

        debug!(
            updated = summary.updated_voxels,
            colored = summary.colored_voxels,
            quality,
            "frame integrated"
        );
        Ok(summary)
    }

    /// Decides whether the volume must be recentered to cover the view frustum of a frame.
    ///
    /// The frustum is bounded by the camera center and the image corner rays
    /// at the farthest valid depth. When it overflows the volume by more than
    /// `recenter_overflow` of the extent, the volume is moved so the frustum
    /// fits along the overflowing axes, keeping the camera one voxel inside.
    pub fn plan_bounds(&self, volume: &Volume, frame: &RangeImage, pose: &Pose) -> BoundsPlan {
        let max_depth = frame
            .points
            .index_axis(Axis(2), 2)
            .iter()
            .zip(frame.mask.iter())
            .filter(|(_, m)| **m == 1)
            .fold(0.0f32, |acc, (z, _)| acc.max(*z));
        if max_depth <= 0.0 {
            return BoundsPlan::Keep;
        }

        let camera_center = pose.translation();
        let intrinsics = &frame.intrinsics;
        let (w, h) = (
            intrinsics.width.saturating_sub(1) as f32,
            intrinsics.height.saturating_sub(1) as f32,
        );
        let mut aabb_min = camera_center;
        let mut aabb_max = camera_center;
        for (x, y) in [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)] {
            let corner = pose.transform_vector(&intrinsics.backproject(x, y, max_depth));
            aabb_min = aabb_min.inf(&corner);
            aabb_max = aabb_max.sup(&corner);
        }

        let grid = volume.grid();
        let (vol_min, vol_max, extent) = (grid.min_corner(), grid.max_corner(), grid.extent());
        let voxel_size = grid.voxel_size;

        let mut overflow = 0.0f32;
        let mut shift = [0i64; 3];
        for c in 0..3 {
            let below = (vol_min[c] - aabb_min[c]).max(0.0);
            let above = (aabb_max[c] - vol_max[c]).max(0.0);
            overflow = overflow.max(below.max(above) / extent[c]);

            let wanted = above - below;
            let mut voxels = (wanted.abs() / voxel_size).ceil() as i64 * wanted.signum() as i64;
            if wanted == 0.0 {
                voxels = 0;
            }

            let lowest = ((camera_center[c] - vol_max[c] + voxel_size) / voxel_size).ceil() as i64;
            let highest =
                ((camera_center[c] - vol_min[c] - voxel_size) / voxel_size).floor() as i64;
            shift[c] = if lowest <= highest {
                voxels.clamp(lowest, highest)
            } else {
                0
            };
        }

        if overflow <= self.params.recenter_overflow || shift == [0, 0, 0] {
            return BoundsPlan::Keep;
        }

        let discard_fraction = volume.surface_discard_fraction(&shift);
        if discard_fraction > self.params.max_discard_fraction {
            BoundsPlan::Exceeded { discard_fraction }
        } else {
            BoundsPlan::Recenter {
                shift,
                discard_fraction,
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn sample_voxel(
    grid: &VoxelGrid,
    i: usize,
    j: usize,
    k: usize,
    frame: &RangeImage,
    color: Option<&ColorFrame>,
    pose: &Pose,
    truncation: f32,
    quality: f32,
) -> Option<Sample> {
    let voxel_camera = pose.inverse_transform_vector(&grid.voxel_center(i, j, k));
    let (row, col) = frame.intrinsics.project_to_pixel(&voxel_camera)?;
    if frame.mask[(row, col)] != 1 {
        return None;
    }

    let normal = frame.get_normal(row, col)?;
    let ray_length = voxel_camera.norm();
    let cos_theta = normal.dot(&voxel_camera).abs() / ray_length;
    let weight = quality * cos_theta;
    if weight <= 0.0 {
        return None;
    }

    // Distance along the ray to the measured surface, projected on its normal.
    let depth = frame.points[(row, col, 2)];
    let distance = (depth - voxel_camera[2]) * ray_length / voxel_camera[2] * cos_theta;
    if distance < -truncation {
        return None;
    }
    let distance = distance.min(truncation);

    let color = match color {
        Some(color) if distance.abs() < truncation => sample_color(color, &voxel_camera),
        _ => None,
    };

    Some(Sample {
        distance,
        weight,
        color,
    })
}

fn sample_color(color: &ColorFrame, point_depth_camera: &Vector3<f32>) -> Option<[u8; 3]> {
    let point = color
        .color_to_depth
        .inverse_transform_vector(point_depth_camera);
    let (row, col) = color.intrinsics.project_to_pixel(&point)?;
    if row < color.height() && col < color.width() {
        Some(color.rgb(row, col))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraIntrinsics;
    use crate::config::VolumeParams;
    use crate::frame::DepthFrame;
    use crate::raycast::raycast;
    use crate::synthetic::{SyntheticScene, Texture};
    use crate::unit_test::{
        plane_color_frame, plane_range_image, small_intrinsics, small_volume_params,
    };
    use approx::assert_abs_diff_eq;
    use rstest::rstest;

    fn plane_volume() -> Volume {
        Volume::new(&small_volume_params(), &FusionParams::default()).unwrap()
    }

    #[rstest]
    fn should_fuse_plane(small_intrinsics: CameraIntrinsics) {
        let mut volume = plane_volume();
        let frame = plane_range_image(&small_intrinsics, 0.5);
        let fusion = TsdfFusion::default();
        let summary = fusion
            .integrate(&mut volume, &frame, None, &Pose::eye(), 1.0)
            .unwrap();
        assert!(summary.updated_voxels > 0);
        assert_eq!(summary.colored_voxels, 0);

        let grid = *volume.grid();
        let truncation = volume.truncation();
        for ((i, j, k), weight) in volume.weights().indexed_iter() {
            if *weight > 0.0 {
                let z = grid.voxel_center(i, j, k)[2];
                let expected = (0.5 - z).min(truncation);
                assert_abs_diff_eq!(volume.tsdf()[(i, j, k)], expected, epsilon = 1e-4);
            }
        }
        let (max_tsdf, max_weight) = volume.value_bounds();
        assert!(max_tsdf <= truncation + 1e-6);
        assert!(max_weight <= 1.0 + 1e-6);
    }

    #[test]
    fn grazing_floor_should_not_bias_prediction() {
        let intrinsics = CameraIntrinsics::new(160.0, 160.0, 79.5, 59.5, 160, 120);
        let floor = SyntheticScene::new().with_plane(
            Vector3::new(0.0, 0.15, 0.0),
            Vector3::new(0.0, -1.0, 0.0),
            Texture::Solid([150, 120, 90]),
        );
        let (depth, _) = floor.render(&intrinsics, &Pose::eye());
        let depth = DepthFrame::new(depth, 0.0, intrinsics.clone());
        let mut frame = RangeImage::from_depth(&depth, 0.1, 5.0);
        frame.compute_normals();

        let mut volume = Volume::new(&VolumeParams::default(), &FusionParams::default()).unwrap();
        TsdfFusion::default()
            .integrate(&mut volume, &frame, None, &Pose::eye(), 1.0)
            .unwrap();

        let predicted = raycast(&volume, &intrinsics, &Pose::eye());
        let offsets: Vec<f32> = (0..predicted.height())
            .flat_map(|row| (0..predicted.width()).map(move |col| (row, col)))
            .filter_map(|(row, col)| {
                let normal = predicted.get_normal(row, col)?;
                let point = predicted.get_point(row, col)?;
                (normal[1] < -0.99).then(|| point[1] - 0.15)
            })
            .collect();
        assert!(offsets.len() > 500, "{}", offsets.len());
        let bias = offsets.iter().sum::<f32>() / offsets.len() as f32;
        assert!(bias.abs() < 1.5e-3, "floor predicted {} m off", bias);
    }

    #[rstest]
    fn repeated_integration_converges(small_intrinsics: CameraIntrinsics) {
        let mut volume = plane_volume();
        let frame = plane_range_image(&small_intrinsics, 0.5);
        let fusion = TsdfFusion::default();
        for _ in 0..80 {
            fusion
                .integrate(&mut volume, &frame, None, &Pose::eye(), 1.0)
                .unwrap();
        }

        let (max_tsdf, max_weight) = volume.value_bounds();
        assert!(max_tsdf <= volume.truncation() + 1e-6);
        assert!(max_weight <= volume.max_weight());
        assert_eq!(max_weight, volume.max_weight());

        let sample = volume.sample_tsdf(&Vector3::new(0.0, 0.0, 0.48)).unwrap();
        assert_abs_diff_eq!(sample, 0.02, epsilon = 1.0 / volume.max_weight());
    }

    #[rstest]
    fn should_fuse_color(small_intrinsics: CameraIntrinsics) {
        let mut volume = plane_volume();
        let frame = plane_range_image(&small_intrinsics, 0.5);
        let color = plane_color_frame(&small_intrinsics, [200, 100, 50], 0.0);
        let summary = TsdfFusion::default()
            .integrate(&mut volume, &frame, Some(&color), &Pose::eye(), 1.0)
            .unwrap();
        assert!(summary.colored_voxels > 0);
        let rgb = volume.sample_color(&Vector3::new(0.0, 0.0, 0.5)).unwrap();
        assert_abs_diff_eq!(rgb[0], 200.0, epsilon = 1e-3);
        assert_abs_diff_eq!(rgb[2], 50.0, epsilon = 1e-3);
    }

    #[rstest]
    fn should_reject_pose_outside(small_intrinsics: CameraIntrinsics) {
        let mut volume = plane_volume();
        let frame = plane_range_image(&small_intrinsics, 0.5);
        let pose = Pose::from_translation(&Vector3::new(2.0, 0.0, 0.0));
        assert!(matches!(
            TsdfFusion::default().integrate(&mut volume, &frame, None, &pose, 1.0),
            Err(Error::PoseOutsideVolume)
        ));
        assert!(volume.is_empty());
    }

    #[rstest]
    fn should_plan_recenter(small_intrinsics: CameraIntrinsics) {
        let volume = plane_volume();
        let frame = plane_range_image(&small_intrinsics, 0.8);
        let fusion = TsdfFusion::default();
        assert_eq!(
            fusion.plan_bounds(&volume, &frame, &Pose::eye()),
            BoundsPlan::Keep
        );

        let pose = Pose::from_translation(&Vector3::new(0.3, 0.0, 0.0));
        match fusion.plan_bounds(&volume, &frame, &pose) {
            BoundsPlan::Recenter { shift, .. } => {
                assert!(shift[0] > 0);
                assert_eq!(shift[1], 0);
                assert_eq!(shift[2], 0);
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[rstest]
    fn should_refuse_discarding_surface(small_intrinsics: CameraIntrinsics) {
        let mut volume = plane_volume();
        let fusion = TsdfFusion::default();
        // A narrow strip of surface on the -x side that a +x shift would drop.
        let strip = plane_range_image(&small_intrinsics, 0.8);
        let pose = Pose::from_translation(&Vector3::new(-0.3, 0.0, 0.0));
        fusion
            .integrate(&mut volume, &strip, None, &pose, 1.0)
            .unwrap();

        let far = Pose::from_translation(&Vector3::new(0.42, 0.0, 0.0));
        assert!(matches!(
            fusion.plan_bounds(&volume, &strip, &far),
            BoundsPlan::Exceeded { .. }
        ));
    }
}
