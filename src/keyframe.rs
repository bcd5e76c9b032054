use std::sync::Arc;

use nalgebra::Vector3;
use tracing::debug;

use crate::config::KeyframeParams;
use crate::frame::{ColorFrame, DepthFrame};
use crate::icp::IntensityView;
use crate::intensity_map::IntensityMap;
use crate::transform::Pose;

/// A retained (pose, color image) pair.
#[derive(Debug)]
pub struct Keyframe {
    /// Depth camera to world.
    pub pose: Pose,
    pub color: Arc<ColorFrame>,
    /// Depth retained for occlusion tests.
    pub depth: Option<Arc<DepthFrame>>,
    intensity: IntensityMap,
}

impl Keyframe {
    pub fn new(pose: Pose, color: Arc<ColorFrame>, depth: Option<Arc<DepthFrame>>) -> Self {
        let intensity = IntensityMap::from_color_frame(&color);
        Self {
            pose,
            color,
            depth,
            intensity,
        }
    }

    pub fn timestamp(&self) -> f64 {
        self.color.timestamp
    }

    /// Color camera to world.
    pub fn color_camera_pose(&self) -> Pose {
        self.pose * self.color.color_to_depth
    }

    /// Viewing direction (optical axis) of the color camera in the world frame.
    pub fn view_direction(&self) -> Vector3<f32> {
        self.color_camera_pose()
            .transform_normal(&Vector3::new(0.0, 0.0, 1.0))
    }

    pub fn intensity(&self) -> &IntensityMap {
        &self.intensity
    }

    pub fn intensity_view(&self) -> IntensityView<'_> {
        IntensityView {
            camera_pose: self.color_camera_pose(),
            intrinsics: &self.color.intrinsics,
            intensity: &self.intensity,
        }
    }
}

/// Selects and keeps the keyframes of a scan.
///
/// The sequence is append-only until [`KeyframeManager::clear`]; once
/// `max_keyframes` is reached new candidates are refused.
#[derive(Debug, Default)]
pub struct KeyframeManager {
    pub params: KeyframeParams,
    keyframes: Vec<Arc<Keyframe>>,
}

impl KeyframeManager {
    pub fn new(params: KeyframeParams) -> Self {
        Self {
            params,
            keyframes: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.keyframes.len() >= self.params.max_keyframes
    }

    pub fn keyframes(&self) -> &[Arc<Keyframe>] {
        &self.keyframes
    }

    /// Whether a frame at `pose` moved enough from the last keyframe to become one.
    pub fn would_be_new_keyframe(&self, pose: &Pose) -> bool {
        if self.is_full() {
            return false;
        }
        match self.keyframes.last() {
            None => true,
            Some(last) => {
                let (translation, angle) = last.pose.delta_to(pose);
                translation > self.params.max_delta_translation
                    || angle > self.params.max_delta_rotation
            }
        }
    }

    /// Adds a keyframe for the frame if [`Self::would_be_new_keyframe`] holds.
    ///
    /// # Returns
    ///
    /// Whether the keyframe was added.
    pub fn process_candidate(
        &mut self,
        pose: &Pose,
        color: &Arc<ColorFrame>,
        depth: Option<&Arc<DepthFrame>>,
    ) -> bool {
        if !self.would_be_new_keyframe(pose) {
            return false;
        }
        self.add(Keyframe::new(*pose, color.clone(), depth.cloned()))
    }

    /// Adds a keyframe unconditionally, unless the manager is full.
    pub fn add(&mut self, keyframe: Keyframe) -> bool {
        if self.is_full() {
            debug!(max_keyframes = self.params.max_keyframes, "keyframe refused");
            return false;
        }
        debug!(
            timestamp = keyframe.timestamp(),
            count = self.keyframes.len() + 1,
            "new keyframe"
        );
        self.keyframes.push(Arc::new(keyframe));
        true
    }

    pub fn clear(&mut self) {
        self.keyframes.clear();
    }

    /// Keyframe closest to `pose`, with rotation measured in units of the
    /// translation threshold.
    pub fn nearest(&self, pose: &Pose) -> Option<&Arc<Keyframe>> {
        let rotation_scale = self.params.max_delta_translation / self.params.max_delta_rotation;
        self.keyframes
            .iter()
            .map(|keyframe| {
                let (translation, angle) = keyframe.pose.delta_to(pose);
                (translation + angle * rotation_scale, keyframe)
            })
            .min_by_key(|(distance, _)| ordered_float::OrderedFloat(*distance))
            .map(|(_, keyframe)| keyframe)
    }

    /// Poses of the last `count` keyframes, most recent first.
    pub fn last_poses(&self, count: usize) -> Vec<Pose> {
        self.keyframes
            .iter()
            .rev()
            .take(count)
            .map(|keyframe| keyframe.pose)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraIntrinsics;
    use crate::unit_test::{plane_color_frame, small_intrinsics};
    use rstest::rstest;

    fn translated(x: f32) -> Pose {
        Pose::from_translation(&Vector3::new(x, 0.0, 0.0))
    }

    #[rstest]
    fn should_select_on_motion(small_intrinsics: CameraIntrinsics) {
        let color = Arc::new(plane_color_frame(&small_intrinsics, [10, 20, 30], 0.0));
        let mut manager = KeyframeManager::default();
        assert!(manager.would_be_new_keyframe(&Pose::eye()));
        assert!(manager.process_candidate(&Pose::eye(), &color, None));
        assert!(!manager.process_candidate(&translated(0.1), &color, None));
        assert!(manager.process_candidate(&translated(0.35), &color, None));

        let rotated = Pose::from_parts(
            &Vector3::new(0.35, 0.0, 0.0),
            &Vector3::new(0.0, 40.0_f32.to_radians(), 0.0),
        );
        assert!(manager.would_be_new_keyframe(&rotated));
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.last_poses(3), vec![translated(0.35), Pose::eye()]);
    }

    #[rstest]
    fn should_refuse_when_full(small_intrinsics: CameraIntrinsics) {
        let color = Arc::new(plane_color_frame(&small_intrinsics, [10, 20, 30], 0.0));
        let mut manager = KeyframeManager::new(KeyframeParams {
            max_keyframes: 2,
            ..Default::default()
        });
        for i in 0..4 {
            manager.add(Keyframe::new(translated(i as f32), color.clone(), None));
        }
        assert_eq!(manager.len(), 2);
        assert!(!manager.would_be_new_keyframe(&translated(10.0)));

        let nearest = manager.nearest(&translated(0.9)).unwrap();
        assert_eq!(nearest.pose, translated(1.0));

        manager.clear();
        assert!(manager.is_empty());
    }
}
