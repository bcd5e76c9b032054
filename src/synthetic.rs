use nalgebra::Vector3;
use ndarray::{Array2, Array3};

use crate::camera::CameraIntrinsics;
use crate::error::Result;
use crate::frame::{ColorFrame, RawDepthFrame};
use crate::source::{FrameSource, SourceFrame};
use crate::transform::Pose;

/// Surface coloring of a synthetic primitive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Texture {
    Solid([u8; 3]),
    /// 3D checker board with cells of `size` meters.
    Checker { a: [u8; 3], b: [u8; 3], size: f32 },
}

impl Texture {
    pub fn color_at(&self, point: &Vector3<f32>) -> [u8; 3] {
        match *self {
            Texture::Solid(rgb) => rgb,
            Texture::Checker { a, b, size } => {
                let cell = (point / size).map(|c| c.floor() as i64);
                if (cell[0] + cell[1] + cell[2]).rem_euclid(2) == 0 {
                    a
                } else {
                    b
                }
            }
        }
    }
}

/// Analytic scene element.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Primitive {
    /// One-sided infinite plane, visible from the side its normal points to.
    Plane {
        point: Vector3<f32>,
        normal: Vector3<f32>,
        texture: Texture,
    },
    /// Solid axis aligned box.
    Box {
        min: Vector3<f32>,
        max: Vector3<f32>,
        texture: Texture,
    },
}

impl Primitive {
    fn intersect(&self, origin: &Vector3<f32>, direction: &Vector3<f32>) -> Option<f32> {
        match self {
            Primitive::Plane { point, normal, .. } => {
                let facing = direction.dot(normal);
                if facing >= 0.0 {
                    return None;
                }
                let t = (point - origin).dot(normal) / facing;
                if t > 0.0 {
                    Some(t)
                } else {
                    None
                }
            }
            Primitive::Box { min, max, .. } => {
                let mut t_near = f32::NEG_INFINITY;
                let mut t_far = f32::INFINITY;
                for c in 0..3 {
                    if direction[c].abs() < 1e-12 {
                        if origin[c] < min[c] || origin[c] > max[c] {
                            return None;
                        }
                        continue;
                    }
                    let t0 = (min[c] - origin[c]) / direction[c];
                    let t1 = (max[c] - origin[c]) / direction[c];
                    t_near = t_near.max(t0.min(t1));
                    t_far = t_far.min(t0.max(t1));
                }
                if t_near <= t_far && t_near > 0.0 {
                    Some(t_near)
                } else {
                    None
                }
            }
        }
    }

    fn texture(&self) -> &Texture {
        match self {
            Primitive::Plane { texture, .. } | Primitive::Box { texture, .. } => texture,
        }
    }
}

/// A scene of analytic primitives rendered with exact depth and color.
#[derive(Clone, Debug, Default)]
pub struct SyntheticScene {
    pub primitives: Vec<Primitive>,
}

impl SyntheticScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plane(mut self, point: Vector3<f32>, normal: Vector3<f32>, texture: Texture) -> Self {
        self.primitives.push(Primitive::Plane {
            point,
            normal: normal.normalize(),
            texture,
        });
        self
    }

    pub fn with_box(mut self, min: Vector3<f32>, max: Vector3<f32>, texture: Texture) -> Self {
        self.primitives.push(Primitive::Box { min, max, texture });
        self
    }

    /// Fronto-parallel plane at `depth` meters in front of the origin.
    pub fn plane(depth: f32, texture: Texture) -> Self {
        Self::new().with_plane(
            Vector3::new(0.0, 0.0, depth),
            Vector3::new(0.0, 0.0, -1.0),
            texture,
        )
    }

    /// Room corner: a floor, a side wall and a back wall.
    pub fn corner() -> Self {
        Self::new()
            .with_plane(
                Vector3::new(0.0, 0.15, 0.0),
                Vector3::new(0.0, -1.0, 0.0),
                Texture::Solid([150, 120, 90]),
            )
            .with_plane(
                Vector3::new(-0.2, 0.0, 0.0),
                Vector3::new(1.0, 0.0, 0.0),
                Texture::Solid([90, 150, 120]),
            )
            .with_plane(
                Vector3::new(0.0, 0.0, 0.8),
                Vector3::new(0.0, 0.0, -1.0),
                Texture::Solid([120, 90, 150]),
            )
    }

    /// Concave wedge over a floor, apex 0.8 m ahead. Any camera translation
    /// changes the observed depth.
    pub fn wedge() -> Self {
        let apex = Vector3::new(0.0, 0.0, 0.8);
        Self::new()
            .with_plane(
                Vector3::new(0.0, 0.15, 0.0),
                Vector3::new(0.0, -1.0, 0.0),
                Texture::Solid([150, 120, 90]),
            )
            .with_plane(
                apex,
                Vector3::new(0.6, 0.0, -0.8),
                Texture::Checker {
                    a: [200, 60, 40],
                    b: [40, 60, 200],
                    size: 0.05,
                },
            )
            .with_plane(
                apex,
                Vector3::new(-0.6, 0.0, -0.8),
                Texture::Solid([90, 150, 120]),
            )
    }

    /// First surface along a ray, as (distance, color).
    pub fn cast(&self, origin: &Vector3<f32>, direction: &Vector3<f32>) -> Option<(f32, [u8; 3])> {
        self.primitives
            .iter()
            .filter_map(|primitive| {
                primitive
                    .intersect(origin, direction)
                    .map(|t| (t, primitive))
            })
            .min_by(|(lhs, _), (rhs, _)| lhs.total_cmp(rhs))
            .map(|(t, primitive)| (t, primitive.texture().color_at(&(origin + direction * t))))
    }

    /// Renders metric depth (NaN where nothing is hit) and color seen from `pose`.
    pub fn render(&self, intrinsics: &CameraIntrinsics, pose: &Pose) -> (Array2<f32>, Array3<u8>) {
        let (width, height) = (intrinsics.width, intrinsics.height);
        let origin = pose.translation();
        let mut depth = Array2::from_elem((height, width), f32::NAN);
        let mut color = Array3::zeros((height, width, 3));

        for row in 0..height {
            for col in 0..width {
                // Unit z in the camera frame, so the distance is the depth.
                let direction =
                    pose.transform_normal(&intrinsics.backproject(col as f32, row as f32, 1.0));
                if let Some((t, rgb)) = self.cast(&origin, &direction) {
                    depth[(row, col)] = t;
                    for c in 0..3 {
                        color[(row, col, c)] = rgb[c];
                    }
                }
            }
        }

        (depth, color)
    }
}

/// Synthetic sensor moving along a list of poses.
pub struct SyntheticSensor {
    pub scene: SyntheticScene,
    intrinsics: CameraIntrinsics,
    poses: Vec<Pose>,
    frame_period: f64,
    with_color: bool,
    index: usize,
}

impl SyntheticSensor {
    pub fn new(scene: SyntheticScene, intrinsics: CameraIntrinsics, poses: Vec<Pose>) -> Self {
        Self {
            scene,
            intrinsics,
            poses,
            frame_period: 1.0 / 30.0,
            with_color: false,
            index: 0,
        }
    }

    pub fn with_color(mut self, with_color: bool) -> Self {
        self.with_color = with_color;
        self
    }

    pub fn with_frame_period(mut self, frame_period: f64) -> Self {
        self.frame_period = frame_period;
        self
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    /// Renders the frame at `index` without advancing the stream.
    pub fn frame_at(&self, index: usize) -> Option<SourceFrame> {
        let pose = self.poses.get(index)?;
        let timestamp = index as f64 * self.frame_period;
        let (depth, color) = self.scene.render(&self.intrinsics, pose);
        Some(SourceFrame {
            depth: RawDepthFrame::metric(depth, timestamp, self.intrinsics.clone()),
            color: if self.with_color {
                Some(ColorFrame::new(color, timestamp, self.intrinsics.clone()))
            } else {
                None
            },
            ground_truth: Some(*pose),
        })
    }
}

impl FrameSource for SyntheticSensor {
    fn calibration(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        let frame = self.frame_at(self.index);
        if frame.is_some() {
            self.index += 1;
        }
        Ok(frame)
    }

    fn rewind(&mut self) -> Result<()> {
        self.index = 0;
        Ok(())
    }
}

/// Poses translating by `step` each frame from `start`.
pub fn linear_trajectory(start: &Vector3<f32>, step: &Vector3<f32>, count: usize) -> Vec<Pose> {
    (0..count)
        .map(|i| Pose::from_translation(&(start + step * i as f32)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn should_render_exact_depth() {
        let intrinsics = CameraIntrinsics::new(80.0, 80.0, 40.0, 30.0, 80, 60);
        let scene = SyntheticScene::plane(0.5, Texture::Solid([1, 2, 3]));
        let (depth, color) = scene.render(&intrinsics, &Pose::eye());
        assert!(depth.iter().all(|z| (z - 0.5).abs() < 1e-6));
        assert_eq!(color[(10, 10, 2)], 3);

        let moved = Pose::from_translation(&Vector3::new(0.0, 0.0, 0.1));
        let (depth, _) = scene.render(&intrinsics, &moved);
        assert_abs_diff_eq!(depth[(30, 40)], 0.4, epsilon = 1e-6);
    }

    #[test]
    fn should_occlude_with_box() {
        let scene = SyntheticScene::plane(1.0, Texture::Solid([0, 0, 0])).with_box(
            Vector3::new(-0.1, -0.1, 0.5),
            Vector3::new(0.1, 0.1, 0.6),
            Texture::Solid([255, 0, 0]),
        );
        let (t, rgb) = scene
            .cast(&Vector3::zeros(), &Vector3::new(0.0, 0.0, 1.0))
            .unwrap();
        assert_abs_diff_eq!(t, 0.5);
        assert_eq!(rgb, [255, 0, 0]);
    }

    #[test]
    fn wedge_should_be_concave() {
        let scene = SyntheticScene::wedge();
        let (t, _) = scene
            .cast(&Vector3::zeros(), &Vector3::new(0.0, 0.0, 1.0))
            .unwrap();
        assert_abs_diff_eq!(t, 0.8, epsilon = 1e-6);

        // Either side hits the nearer wall.
        for x in [-0.25f32, 0.25] {
            let (t, _) = scene.cast(&Vector3::zeros(), &Vector3::new(x, 0.0, 1.0)).unwrap();
            assert_abs_diff_eq!(t, 0.64 / 0.95, epsilon = 1e-5);
        }
    }

    #[test]
    fn should_stream_frames() {
        let intrinsics = CameraIntrinsics::new(40.0, 40.0, 20.0, 15.0, 40, 30);
        let poses = linear_trajectory(&Vector3::zeros(), &Vector3::new(0.01, 0.0, 0.0), 3);
        let mut sensor = SyntheticSensor::new(SyntheticScene::corner(), intrinsics, poses)
            .with_color(true);
        let mut count = 0;
        while let Some(frame) = sensor.next_frame().unwrap() {
            assert!(frame.color.is_some());
            assert_abs_diff_eq!(frame.depth.timestamp, count as f64 / 30.0);
            count += 1;
        }
        assert_eq!(count, 3);
        sensor.rewind().unwrap();
        assert!(sensor.next_frame().unwrap().is_some());
    }
}
