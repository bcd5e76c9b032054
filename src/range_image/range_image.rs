use nalgebra::Vector3;
use ndarray::{Array2, Array3};

use crate::camera::CameraIntrinsics;
use crate::frame::DepthFrame;

use super::resize::halve_range_grid;

/// A point cloud that comes from an image-based measurement, keeping its grid structure.
///
/// Used both for sensor frames (points in the camera frame) and for surfaces
/// predicted from the volume (points in the world frame).
#[derive(Clone, Debug)]
pub struct RangeImage {
    /// 3D points, as array with shape: (height, width, 3)
    pub points: Array3<f32>,
    /// Mask of valid points, as array with shape: (height, width)
    pub mask: Array2<u8>,
    /// Normals of the points, as array with shape: (height, width, 3).
    /// Zero where a normal could not be estimated.
    pub normals: Option<Array3<f32>>,
    /// Camera parameters of the image grid.
    pub intrinsics: CameraIntrinsics,
    valid_points: usize,
}

impl RangeImage {
    /// Back-projects a depth frame into the camera frame.
    ///
    /// # Arguments
    ///
    /// * `frame` - Validated depth frame.
    /// * `min_depth`, `max_depth` - Samples outside this range are left invalid.
    pub fn from_depth(frame: &DepthFrame, min_depth: f32, max_depth: f32) -> Self {
        let intrinsics = frame.intrinsics();
        let (height, width) = (frame.height(), frame.width());
        let mut points = Array3::zeros((height, width, 3));
        let mut mask = Array2::<u8>::zeros((height, width));
        let mut valid_points = 0;

        for ((y, x), z) in frame.depth().indexed_iter() {
            let z = *z;
            if !(z.is_finite() && z >= min_depth && z <= max_depth) {
                continue;
            }
            let point3d = intrinsics.backproject(x as f32, y as f32, z);
            points[[y, x, 0]] = point3d[0];
            points[[y, x, 1]] = point3d[1];
            points[[y, x, 2]] = point3d[2];
            mask[[y, x]] = 1;
            valid_points += 1;
        }

        Self {
            points,
            mask,
            normals: None,
            intrinsics: intrinsics.clone(),
            valid_points,
        }
    }

    pub fn from_parts(
        points: Array3<f32>,
        mask: Array2<u8>,
        normals: Option<Array3<f32>>,
        intrinsics: CameraIntrinsics,
    ) -> Self {
        let valid_points = mask.iter().filter(|m| **m == 1).count();
        Self {
            points,
            mask,
            normals,
            intrinsics,
            valid_points,
        }
    }

    pub fn width(&self) -> usize {
        self.points.shape()[1]
    }

    pub fn height(&self) -> usize {
        self.points.shape()[0]
    }

    pub fn valid_points_count(&self) -> usize {
        self.valid_points
    }

    pub fn len(&self) -> usize {
        self.width() * self.height()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_point(&self, row: usize, col: usize) -> Option<Vector3<f32>> {
        if col < self.width() && row < self.height() && self.mask[(row, col)] == 1 {
            Some(Vector3::new(
                self.points[(row, col, 0)],
                self.points[(row, col, 1)],
                self.points[(row, col, 2)],
            ))
        } else {
            None
        }
    }

    /// Normal at a valid point, `None` when missing or not estimated.
    pub fn get_normal(&self, row: usize, col: usize) -> Option<Vector3<f32>> {
        let normals = self.normals.as_ref()?;
        if col >= self.width() || row >= self.height() || self.mask[(row, col)] != 1 {
            return None;
        }
        let normal = Vector3::new(
            normals[(row, col, 0)],
            normals[(row, col, 1)],
            normals[(row, col, 2)],
        );
        if normal.norm_squared() > 0.5 {
            Some(normal)
        } else {
            None
        }
    }

    fn neighbor(&self, row: usize, col: usize, drow: isize, dcol: isize) -> Option<Vector3<f32>> {
        let row = row as isize + drow;
        let col = col as isize + dcol;
        if row < 0 || col < 0 {
            return None;
        }
        self.get_point(row as usize, col as usize)
    }

    /// Estimates normals from the grid neighbors. Normals point towards the camera.
    ///
    /// A central difference is used when both neighbors are at a similar
    /// distance, otherwise the difference to the nearest one.
    pub fn compute_normals(&mut self) -> &mut Self {
        let height = self.height();
        let width = self.width();

        let ratio_threshold = 2f32;
        let ratio_threshold_squared = ratio_threshold * ratio_threshold;

        let pick = |center: Vector3<f32>,
                    before: Option<Vector3<f32>>,
                    after: Option<Vector3<f32>>|
         -> Option<Vector3<f32>> {
            match (before, after) {
                (Some(before), Some(after)) => {
                    let before_dist_squared = (before - center).norm_squared();
                    let after_dist_squared = (after - center).norm_squared();
                    let ratio = before_dist_squared / after_dist_squared;
                    if ratio < ratio_threshold_squared && ratio > 1f32 / ratio_threshold_squared {
                        Some(after - before)
                    } else if before_dist_squared < after_dist_squared {
                        Some(center - before)
                    } else {
                        Some(after - center)
                    }
                }
                (Some(before), None) => Some(center - before),
                (None, Some(after)) => Some(after - center),
                (None, None) => None,
            }
        };

        let mut normals = Array3::<f32>::zeros((height, width, 3));
        for row in 0..height {
            for col in 0..width {
                let center = match self.get_point(row, col) {
                    Some(center) => center,
                    None => continue,
                };

                let left_to_right = pick(
                    center,
                    self.neighbor(row, col, 0, -1),
                    self.neighbor(row, col, 0, 1),
                );
                let bottom_to_top = pick(
                    center,
                    self.neighbor(row, col, 1, 0),
                    self.neighbor(row, col, -1, 0),
                );

                if let (Some(left_to_right), Some(bottom_to_top)) = (left_to_right, bottom_to_top) {
                    let normal = left_to_right.cross(&bottom_to_top);
                    let normal_magnitude = normal.magnitude();
                    if normal_magnitude > 1e-12_f32 {
                        normals[(row, col, 0)] = normal[0] / normal_magnitude;
                        normals[(row, col, 1)] = normal[1] / normal_magnitude;
                        normals[(row, col, 2)] = normal[2] / normal_magnitude;
                    }
                }
            }
        }

        self.normals = Some(normals);
        self
    }

    /// Half resolution image, see [`halve_range_grid`].
    pub fn scale_down(&self) -> RangeImage {
        let (points, mask, normals) = halve_range_grid(
            &self.points.view(),
            &self.mask.view(),
            self.normals.as_ref().map(|n| n.view()).as_ref(),
        );
        RangeImage::from_parts(points, mask, normals, self.intrinsics.half())
    }

    /// Builds a pyramid with `levels` images, finest first.
    pub fn pyramid(self, levels: usize) -> Vec<RangeImage> {
        let mut pyramid = Vec::with_capacity(levels);
        pyramid.push(self);

        while pyramid.len() < levels {
            let next = match pyramid.last() {
                Some(prev) => prev.scale_down(),
                None => break,
            };
            pyramid.push(next);
        }

        pyramid
    }

    /// Builds a tracking pyramid from a depth frame, with normals at every level.
    pub fn depth_pyramid(
        frame: &DepthFrame,
        levels: usize,
        min_depth: f32,
        max_depth: f32,
    ) -> Vec<RangeImage> {
        let mut pyramid = RangeImage::from_depth(frame, min_depth, max_depth).pyramid(levels);
        pyramid.iter_mut().for_each(|level| {
            level.compute_normals();
        });
        pyramid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit_test::{plane_depth_frame, small_intrinsics};
    use approx::assert_abs_diff_eq;
    use rstest::rstest;

    #[rstest]
    fn should_backproject_depth(small_intrinsics: CameraIntrinsics) {
        let frame = plane_depth_frame(&small_intrinsics, 0.5, 0.0);
        let range_image = RangeImage::from_depth(&frame, 0.1, 4.0);
        assert_eq!(range_image.height(), small_intrinsics.height);
        assert_eq!(range_image.width(), small_intrinsics.width);
        assert_eq!(range_image.valid_points_count(), range_image.len());
        let point = range_image.get_point(0, 0).unwrap();
        assert_abs_diff_eq!(point[2], 0.5);

        let far = RangeImage::from_depth(&frame, 0.1, 0.4);
        assert_eq!(far.valid_points_count(), 0);
    }

    #[rstest]
    fn should_compute_normals_facing_camera(small_intrinsics: CameraIntrinsics) {
        let frame = plane_depth_frame(&small_intrinsics, 0.5, 0.0);
        let mut range_image = RangeImage::from_depth(&frame, 0.1, 4.0);
        range_image.compute_normals();

        for (row, col) in [(0, 0), (10, 20), (59, 79)] {
            let normal = range_image.get_normal(row, col).unwrap();
            assert_abs_diff_eq!(normal, Vector3::new(0.0, 0.0, -1.0), epsilon = 1e-4);
        }
    }

    #[rstest]
    fn should_build_pyramid(small_intrinsics: CameraIntrinsics) {
        let frame = plane_depth_frame(&small_intrinsics, 0.5, 0.0);
        let pyramid = RangeImage::depth_pyramid(&frame, 3, 0.1, 4.0);
        assert_eq!(pyramid.len(), 3);
        assert_eq!(
            (pyramid[2].width(), pyramid[2].height()),
            (small_intrinsics.width / 4, small_intrinsics.height / 4)
        );
        assert!(pyramid[2].get_normal(3, 3).is_some());

        // Points of a coarse level still project onto their pixel.
        let point = pyramid[1].get_point(5, 7).unwrap();
        let (x, y) = pyramid[1].intrinsics.project(&point);
        assert!((x - 7.0).abs() < 0.6 && (y - 5.0).abs() < 0.6);
    }
}
