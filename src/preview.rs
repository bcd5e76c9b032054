use std::sync::{Arc, PoisonError, RwLock};

use ndarray::Array2;

use crate::camera::CameraIntrinsics;
use crate::raycast::{depth_from_world, raycast};
use crate::sync::PoseCell;
use crate::transform::Pose;
use crate::volume::Volume;

/// A ray-cast view of the volume.
#[derive(Clone, Debug)]
pub struct PreviewFrame {
    pub pose: Pose,
    /// Timestamp of the published pose, when rendered from the pose cell.
    pub timestamp: Option<f64>,
    /// Camera depth, NaN where no surface was hit.
    pub depth: Array2<f32>,
    /// Headlight shading in [0, 255], zero where no surface was hit.
    pub shading: Array2<u8>,
}

impl PreviewFrame {
    pub fn hit_count(&self) -> usize {
        self.depth.iter().filter(|z| z.is_finite()).count()
    }
}

/// Renders the volume from the latest published pose on the UI thread.
///
/// Holds the volume read lock only while ray casting.
pub struct PreviewRenderer {
    volume: Arc<RwLock<Volume>>,
    pose: Arc<PoseCell>,
    intrinsics: CameraIntrinsics,
}

impl PreviewRenderer {
    pub fn new(volume: Arc<RwLock<Volume>>, pose: Arc<PoseCell>, intrinsics: CameraIntrinsics) -> Self {
        Self {
            volume,
            pose,
            intrinsics,
        }
    }

    /// Renders from the latest pose, `None` before the first pose is published.
    pub fn render(&self) -> Option<PreviewFrame> {
        let (pose, timestamp) = self.pose.latest()?;
        let mut frame = self.render_at(&pose);
        frame.timestamp = Some(timestamp);
        Some(frame)
    }

    pub fn render_at(&self, pose: &Pose) -> PreviewFrame {
        let surface = {
            let volume = self.volume.read().unwrap_or_else(PoisonError::into_inner);
            raycast(&volume, &self.intrinsics, pose)
        };

        let depth = depth_from_world(&surface, pose);
        let origin = pose.translation();
        let shading = Array2::from_shape_fn((surface.height(), surface.width()), |(row, col)| {
            match (surface.get_point(row, col), surface.get_normal(row, col)) {
                (Some(point), Some(normal)) => {
                    let to_camera = (origin - point).try_normalize(1e-9);
                    to_camera.map_or(0, |dir| (normal.dot(&dir).clamp(0.0, 1.0) * 255.0) as u8)
                }
                _ => 0,
            }
        });

        PreviewFrame {
            pose: *pose,
            timestamp: None,
            depth,
            shading,
        }
    }
}
