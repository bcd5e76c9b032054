use nalgebra::Vector3;
use ndarray::{Array2, Array3};
use rayon::prelude::*;

use crate::camera::CameraIntrinsics;
use crate::range_image::RangeImage;
use crate::transform::Pose;
use crate::volume::Volume;

/// Smallest step as a fraction of the voxel size, so rays always cross the surface.
const MIN_STEP_FACTOR: f32 = 0.25;

/// A ray surface intersection in the world frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayHit {
    pub point: Vector3<f32>,
    pub normal: Vector3<f32>,
    /// Distance from the ray origin along the (unit) direction.
    pub distance: f32,
}

/// Entry and exit distances of a ray through an axis aligned box.
fn intersect_box(
    origin: &Vector3<f32>,
    direction: &Vector3<f32>,
    min: &Vector3<f32>,
    max: &Vector3<f32>,
) -> Option<(f32, f32)> {
    let mut t_near = 0.0f32;
    let mut t_far = f32::INFINITY;
    for c in 0..3 {
        if direction[c].abs() < 1e-12 {
            if origin[c] < min[c] || origin[c] > max[c] {
                return None;
            }
            continue;
        }
        let inv = 1.0 / direction[c];
        let (t0, t1) = {
            let t0 = (min[c] - origin[c]) * inv;
            let t1 = (max[c] - origin[c]) * inv;
            if t0 < t1 {
                (t0, t1)
            } else {
                (t1, t0)
            }
        };
        t_near = t_near.max(t0);
        t_far = t_far.min(t1);
        if t_near > t_far {
            return None;
        }
    }
    Some((t_near, t_far))
}

/// Marches a ray through the volume until it crosses the zero level from the front.
///
/// Steps are min(μ/2, |D|) inside the truncation band and the voxel
/// diagonal where the volume is unobserved or far from the surface.
pub fn cast_ray(volume: &Volume, origin: &Vector3<f32>, direction: &Vector3<f32>) -> Option<RayHit> {
    let grid = volume.grid();
    let (t_start, t_end) = intersect_box(origin, direction, &grid.min_corner(), &grid.max_corner())?;

    let truncation = volume.truncation();
    let diagonal = grid.voxel_diagonal();
    let min_step = grid.voxel_size * MIN_STEP_FACTOR;

    let mut t = t_start;
    let mut previous: Option<(f32, f32)> = None;
    while t <= t_end {
        let point = origin + direction * t;
        let step = match volume.sample_tsdf(&point) {
            Some(sdf) => {
                if let Some((prev_t, prev_sdf)) = previous {
                    if prev_sdf > 0.0 && sdf <= 0.0 {
                        let t_hit = prev_t + (t - prev_t) * prev_sdf / (prev_sdf - sdf);
                        let point = origin + direction * t_hit;
                        let normal = volume
                            .sample_gradient(&point)
                            .and_then(|g| g.try_normalize(1e-9))?;
                        return Some(RayHit {
                            point,
                            normal,
                            distance: t_hit,
                        });
                    }
                }
                previous = Some((t, sdf));
                if sdf.abs() < truncation {
                    (truncation * 0.5).min(sdf.abs()).max(min_step)
                } else {
                    diagonal
                }
            }
            None => {
                previous = None;
                diagonal
            }
        };
        t += step;
    }

    None
}

/// Ray casts the volume from a camera, producing the predicted surface.
///
/// # Returns
///
/// Range image with points and normals in the world frame, laid out in the image grid.
pub fn raycast(volume: &Volume, intrinsics: &CameraIntrinsics, pose: &Pose) -> RangeImage {
    let (width, height) = (intrinsics.width, intrinsics.height);
    let origin = pose.translation();

    let rows: Vec<Vec<Option<RayHit>>> = (0..height)
        .into_par_iter()
        .map(|row| {
            (0..width)
                .map(|col| {
                    let direction = pose
                        .transform_normal(&intrinsics.backproject(col as f32, row as f32, 1.0))
                        .normalize();
                    cast_ray(volume, &origin, &direction)
                })
                .collect()
        })
        .collect();

    let mut points = Array3::zeros((height, width, 3));
    let mut normals = Array3::zeros((height, width, 3));
    let mut mask = Array2::<u8>::zeros((height, width));
    for (row, hits) in rows.iter().enumerate() {
        for (col, hit) in hits.iter().enumerate() {
            if let Some(hit) = hit {
                for c in 0..3 {
                    points[(row, col, c)] = hit.point[c];
                    normals[(row, col, c)] = hit.normal[c];
                }
                mask[(row, col)] = 1;
            }
        }
    }

    RangeImage::from_parts(points, mask, Some(normals), intrinsics.clone())
}

/// Depth map (camera z, NaN where invalid) of a world frame range image seen from `pose`.
pub fn depth_from_world(surface: &RangeImage, pose: &Pose) -> Array2<f32> {
    Array2::from_shape_fn((surface.height(), surface.width()), |(row, col)| {
        surface
            .get_point(row, col)
            .map_or(f32::NAN, |point| pose.inverse_transform_vector(&point)[2])
    })
}
