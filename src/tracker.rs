use std::fmt;

use tracing::{debug, info, warn};

use crate::config::TrackerParams;
use crate::frame::{ColorFrame, DepthFrame};
use crate::icp::{IcpEstimate, IcpParams, PhotometricTerm, ProjectiveIcp};
use crate::intensity_map::IntensityMap;
use crate::keyframe::KeyframeManager;
use crate::range_image::RangeImage;
use crate::raycast::raycast;
use crate::transform::Pose;
use crate::volume::Volume;

/// Per-frame translation, in meters, reported as fast motion.
const FAST_MOTION_TRANSLATION: f32 = 0.05;
/// Per-frame rotation, in degrees, reported as fast motion.
const FAST_MOTION_ROTATION_DEG: f32 = 10.0;
/// Quality below which a pose is reported as dodgy.
const DODGY_QUALITY: f32 = 0.5;
/// Relative loss of depth fit accepted from a photometric step.
const DEPTH_FIT_TOLERANCE: f32 = 0.05;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerState {
    Uninitialized,
    Tracking,
    Lost,
}

/// Coarse tracking status for user feedback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerStatus {
    Uninitialized,
    Good,
    /// Tracked with few inliers.
    Dodgy,
    FastMotion,
    /// Relocalized on this frame.
    Recovering,
    ModelLost,
}

impl TrackerStatus {
    /// Message for the user, if the status needs one.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            TrackerStatus::FastMotion => Some("Please move slower"),
            TrackerStatus::ModelLost => Some("Tracking lost, please return to the scanned area"),
            TrackerStatus::Dodgy | TrackerStatus::Recovering => Some("Hold still"),
            TrackerStatus::Uninitialized | TrackerStatus::Good => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LostReason {
    /// Nothing of the model is visible from the prior pose.
    EmptyPrediction,
    FewCorrespondences,
    HighResidual,
    IllConditioned,
    OutsideVolume,
}

impl fmt::Display for LostReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LostReason::EmptyPrediction => "model not visible",
            LostReason::FewCorrespondences => "too few correspondences",
            LostReason::HighResidual => "residual above threshold",
            LostReason::IllConditioned => "ill-conditioned alignment",
            LostReason::OutsideVolume => "pose outside the volume",
        };
        f.write_str(text)
    }
}

/// What the photometric step did to a depth estimate.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Refinement {
    /// Color disabled, no color frame or no keyframe to compare with.
    #[default]
    Skipped,
    /// Mean squared intensity residuals before and after the step.
    Applied { before: f32, after: f32 },
    Rejected { before: f32, after: f32 },
}

/// An accepted pose estimate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackedPose {
    /// Depth camera to world.
    pub pose: Pose,
    /// Confidence in [0, 1], the fraction of inliers.
    pub quality: f32,
    pub status: TrackerStatus,
    /// RMS point-to-plane residual in meters.
    pub residual: f32,
    /// Accepted without alignment as the first frame of the session.
    pub first_frame: bool,
    pub relocalized: bool,
    pub photometric: Refinement,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TrackResult {
    Tracked(TrackedPose),
    Lost(LostReason),
}

/// Depth-to-model tracker.
///
/// [`Tracker::track`] only estimates; the caller commits the outcome with
/// [`Tracker::accept`] or [`Tracker::mark_lost`], so a frame that is not fused
/// never changes the tracker state.
#[derive(Clone, Debug)]
pub struct Tracker {
    pub params: TrackerParams,
    state: TrackerState,
    status: TrackerStatus,
    last_pose: Pose,
    aligned_frames: usize,
}

impl Tracker {
    pub fn new(params: TrackerParams) -> Self {
        Self {
            params,
            state: TrackerState::Uninitialized,
            status: TrackerStatus::Uninitialized,
            last_pose: Pose::eye(),
            aligned_frames: 0,
        }
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn status(&self) -> TrackerStatus {
        self.status
    }

    /// Last accepted pose.
    pub fn last_pose(&self) -> &Pose {
        &self.last_pose
    }

    pub fn pyramid_levels(&self) -> usize {
        self.params.pyramid_iterations.len()
    }

    /// Builds the tracking pyramid of a depth frame.
    pub fn pyramid(&self, frame: &DepthFrame) -> Vec<RangeImage> {
        RangeImage::depth_pyramid(
            frame,
            self.pyramid_levels(),
            self.params.min_depth,
            self.params.max_depth,
        )
    }

    fn correspondence_distance(&self) -> f32 {
        if self.aligned_frames == 0 || self.state == TrackerState::Lost {
            self.params.initial_max_distance
        } else {
            self.params.max_distance
        }
    }

    /// Estimates the pose of a frame against the volume.
    ///
    /// # Arguments
    ///
    /// * `pyramid` - Tracking pyramid of the frame, finest first, with normals.
    /// * `color` - Color frame paired with the depth, if any.
    /// * `volume` - The fused model.
    /// * `keyframes` - Photometric references and relocalization anchors.
    pub fn track(
        &self,
        pyramid: &[RangeImage],
        color: Option<&ColorFrame>,
        volume: &Volume,
        keyframes: &KeyframeManager,
    ) -> TrackResult {
        if self.state == TrackerState::Uninitialized {
            return TrackResult::Tracked(TrackedPose {
                pose: Pose::eye(),
                quality: 1.0,
                status: TrackerStatus::Good,
                residual: 0.0,
                first_frame: true,
                relocalized: false,
                photometric: Refinement::Skipped,
            });
        }

        let relocalizing = self.state == TrackerState::Lost;
        let priors = if relocalizing && !keyframes.is_empty() {
            keyframes.last_poses(self.params.relocalization_candidates)
        } else {
            vec![self.last_pose]
        };

        let mut reason = LostReason::EmptyPrediction;
        for prior in priors.iter() {
            match self.align(pyramid, color, volume, keyframes, prior) {
                Ok((estimate, photometric)) => {
                    let pose = estimate.pose;
                    let quality = estimate.inlier_fraction().clamp(0.0, 1.0);
                    let status = if relocalizing {
                        TrackerStatus::Recovering
                    } else {
                        self.motion_status(&pose, quality)
                    };
                    if relocalizing {
                        info!(quality, "relocalized");
                    }
                    return TrackResult::Tracked(TrackedPose {
                        pose,
                        quality,
                        status,
                        residual: estimate.residual,
                        first_frame: false,
                        relocalized: relocalizing,
                        photometric,
                    });
                }
                Err(lost) => reason = lost,
            }
        }

        TrackResult::Lost(reason)
    }

    fn motion_status(&self, pose: &Pose, quality: f32) -> TrackerStatus {
        let (translation, angle) = self.last_pose.delta_to(pose);
        if translation > FAST_MOTION_TRANSLATION || angle > FAST_MOTION_ROTATION_DEG.to_radians() {
            TrackerStatus::FastMotion
        } else if quality < DODGY_QUALITY {
            TrackerStatus::Dodgy
        } else {
            TrackerStatus::Good
        }
    }

    fn align(
        &self,
        pyramid: &[RangeImage],
        color: Option<&ColorFrame>,
        volume: &Volume,
        keyframes: &KeyframeManager,
        prior: &Pose,
    ) -> Result<(IcpEstimate, Refinement), LostReason> {
        let finest = pyramid.first().ok_or(LostReason::EmptyPrediction)?;
        let model = raycast(volume, &finest.intrinsics, prior).pyramid(pyramid.len());
        if model.first().map_or(0, RangeImage::valid_points_count) == 0 {
            return Err(LostReason::EmptyPrediction);
        }

        let icp = ProjectiveIcp::new(
            IcpParams::from_tracker(&self.params, self.correspondence_distance()),
            &model,
            *prior,
        );
        let mut estimate = icp.align(pyramid, prior).ok_or(LostReason::EmptyPrediction)?;
        let mut refinement = Refinement::Skipped;
        if let (true, Some(color)) = (self.params.color_enabled, color) {
            (estimate, refinement) =
                self.refine_photometric(&icp, finest, pyramid, color, keyframes, estimate);
        }

        self.validate(&estimate, volume)?;
        Ok((estimate, refinement))
    }

    /// One step against the nearest keyframe at the finest level, on top of
    /// the converged depth system.
    fn refine_photometric(
        &self,
        icp: &ProjectiveIcp,
        finest: &RangeImage,
        pyramid: &[RangeImage],
        color: &ColorFrame,
        keyframes: &KeyframeManager,
        estimate: IcpEstimate,
    ) -> (IcpEstimate, Refinement) {
        let keyframe = match keyframes.nearest(&estimate.pose) {
            Some(keyframe) => keyframe,
            None => return (estimate, Refinement::Skipped),
        };
        let current = IntensityMap::from_color_frame(color);
        let term = PhotometricTerm {
            reference: keyframe.intensity_view(),
            current: &current,
            current_intrinsics: &color.intrinsics,
            color_to_depth: color.color_to_depth,
        };
        let photometric = term.linearize(finest, &estimate.pose);
        if photometric.count() == 0 {
            return (estimate, Refinement::Skipped);
        }
        let before = photometric.mean_squared_residual();

        let mut system = estimate.system.clone();
        system.add_weighted(&photometric, self.params.color_weight);
        let refined = system.solve().and_then(|update| {
            let mut pose = Pose::exp(&update) * estimate.pose;
            pose.renormalize();
            icp.evaluate(pyramid, &pose)
        });
        let refined = match refined {
            Some(refined) => refined,
            None => {
                return (
                    estimate,
                    Refinement::Rejected {
                        before,
                        after: before,
                    },
                )
            }
        };
        let after = term.linearize(finest, &refined.pose);
        let after = if after.count() == 0 {
            f32::INFINITY
        } else {
            after.mean_squared_residual()
        };

        if keeps_refinement(&estimate, &refined, before, after) {
            debug!(before, after, "photometric refinement");
            (refined, Refinement::Applied { before, after })
        } else {
            (estimate, Refinement::Rejected { before, after })
        }
    }

    fn validate(&self, estimate: &IcpEstimate, volume: &Volume) -> Result<(), LostReason> {
        if estimate.inlier_fraction() < self.params.min_inlier_fraction {
            return Err(LostReason::FewCorrespondences);
        }
        if estimate.residual >= self.params.max_residual {
            return Err(LostReason::HighResidual);
        }
        if estimate.condition_number.is_nan()
            || estimate.condition_number >= self.params.max_condition_number
        {
            return Err(LostReason::IllConditioned);
        }
        if !volume.contains(&estimate.pose.translation()) {
            return Err(LostReason::OutsideVolume);
        }
        Ok(())
    }

    /// Commits an estimate returned by [`Tracker::track`].
    pub fn accept(&mut self, tracked: &TrackedPose) {
        self.last_pose = tracked.pose;
        self.last_pose.renormalize();
        self.state = TrackerState::Tracking;
        self.status = tracked.status;
        if !tracked.first_frame {
            self.aligned_frames += 1;
        }
    }

    /// Commits a tracking failure. The last accepted pose is kept.
    pub fn mark_lost(&mut self, reason: LostReason) {
        if self.state != TrackerState::Lost {
            warn!(%reason, "tracking lost");
        }
        if self.state != TrackerState::Uninitialized {
            self.state = TrackerState::Lost;
            self.status = TrackerStatus::ModelLost;
        }
    }

    /// Forgets the trajectory, the next frame is a first frame.
    pub fn reset(&mut self) {
        self.state = TrackerState::Uninitialized;
        self.status = TrackerStatus::Uninitialized;
        self.last_pose = Pose::eye();
        self.aligned_frames = 0;
    }
}

/// A photometric step is kept when it lowers the intensity residual and the
/// depth fit stays within [`DEPTH_FIT_TOLERANCE`].
fn keeps_refinement(depth: &IcpEstimate, refined: &IcpEstimate, before: f32, after: f32) -> bool {
    after < before
        && refined.residual <= depth.residual * (1.0 + DEPTH_FIT_TOLERANCE)
        && refined.inlier_fraction() >= depth.inlier_fraction() * (1.0 - DEPTH_FIT_TOLERANCE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraIntrinsics;
    use crate::config::{FusionParams, VolumeParams};
    use crate::fusion::TsdfFusion;
    use crate::keyframe::Keyframe;
    use crate::optim::GaussNewton;
    use crate::synthetic::SyntheticScene;
    use crate::unit_test::{corner_depth_frame, offset_depth_frame, small_intrinsics};
    use nalgebra::Vector3;
    use rstest::rstest;
    use std::sync::Arc;

    fn wedge_frames(intrinsics: &CameraIntrinsics, pose: &Pose, timestamp: f64) -> (DepthFrame, ColorFrame) {
        let (depth, color) = SyntheticScene::wedge().render(intrinsics, pose);
        (
            DepthFrame::new(depth, timestamp, intrinsics.clone()),
            ColorFrame::new(color, timestamp, intrinsics.clone()),
        )
    }

    fn corner_volume(intrinsics: &CameraIntrinsics, tracker: &Tracker) -> Volume {
        let params = VolumeParams::default()
            .with_center([0.0, 0.0, 0.45])
            .with_size(1.0)
            .with_resolution(96);
        let mut volume = Volume::new(&params, &FusionParams::default()).unwrap();
        let frame = corner_depth_frame(intrinsics, &Pose::eye(), 0.0);
        let pyramid = tracker.pyramid(&frame);
        TsdfFusion::default()
            .integrate(&mut volume, &pyramid[0], None, &Pose::eye(), 1.0)
            .unwrap();
        volume
    }

    #[rstest]
    fn should_accept_first_frame(small_intrinsics: CameraIntrinsics) {
        let tracker = Tracker::new(TrackerParams::default());
        let frame = corner_depth_frame(&small_intrinsics, &Pose::eye(), 0.0);
        let volume = Volume::new(&VolumeParams::default(), &FusionParams::default()).unwrap();
        match tracker.track(&tracker.pyramid(&frame), None, &volume, &KeyframeManager::default()) {
            TrackResult::Tracked(tracked) => {
                assert!(tracked.first_frame);
                assert_eq!(tracked.pose, Pose::eye());
                assert_eq!(tracked.quality, 1.0);
            }
            TrackResult::Lost(reason) => panic!("lost: {}", reason),
        }
    }

    #[rstest]
    fn should_track_and_lose(small_intrinsics: CameraIntrinsics) {
        let mut tracker = Tracker::new(TrackerParams::default());
        let volume = corner_volume(&small_intrinsics, &tracker);
        let keyframes = KeyframeManager::default();
        let first = corner_depth_frame(&small_intrinsics, &Pose::eye(), 0.0);
        match tracker.track(&tracker.pyramid(&first), None, &volume, &keyframes) {
            TrackResult::Tracked(tracked) => tracker.accept(&tracked),
            TrackResult::Lost(reason) => panic!("lost: {}", reason),
        }

        let moved = Pose::from_translation(&Vector3::new(0.02, -0.01, 0.0));
        let frame = corner_depth_frame(&small_intrinsics, &moved, 1.0 / 30.0);
        let tracked = match tracker.track(&tracker.pyramid(&frame), None, &volume, &keyframes) {
            TrackResult::Tracked(tracked) => tracked,
            TrackResult::Lost(reason) => panic!("lost: {}", reason),
        };
        let (translation, angle) = tracked.pose.delta_to(&moved);
        assert!(translation < 5e-3, "{}", translation);
        assert!(angle < 0.5_f32.to_radians());
        assert!(tracked.quality > 0.2);
        tracker.accept(&tracked);
        assert_eq!(tracker.state(), TrackerState::Tracking);

        // Depth jump of one meter.
        let frame = offset_depth_frame(
            &corner_depth_frame(&small_intrinsics, &moved, 2.0 / 30.0),
            1.0,
        );
        let result = tracker.track(&tracker.pyramid(&frame), None, &volume, &keyframes);
        let reason = match result {
            TrackResult::Lost(reason) => reason,
            TrackResult::Tracked(tracked) => panic!("tracked: {:?}", tracked),
        };
        tracker.mark_lost(reason);
        assert_eq!(tracker.state(), TrackerState::Lost);
        assert_eq!(tracker.status(), TrackerStatus::ModelLost);
        assert_eq!(*tracker.last_pose(), tracked.pose);

        // Coming back relocalizes from the last pose.
        let frame = corner_depth_frame(&small_intrinsics, &moved, 3.0 / 30.0);
        match tracker.track(&tracker.pyramid(&frame), None, &volume, &keyframes) {
            TrackResult::Tracked(tracked) => {
                assert!(tracked.relocalized);
                assert_eq!(tracked.status, TrackerStatus::Recovering);
            }
            TrackResult::Lost(reason) => panic!("lost: {}", reason),
        }

        tracker.reset();
        assert_eq!(tracker.state(), TrackerState::Uninitialized);
    }

    #[rstest]
    fn photometric_should_refine_converged_depth(small_intrinsics: CameraIntrinsics) {
        let mut tracker = Tracker::new(TrackerParams::default());
        let params = VolumeParams::default()
            .with_center([0.0, 0.0, 0.45])
            .with_size(1.0)
            .with_resolution(96);
        let mut volume = Volume::new(&params, &FusionParams::default()).unwrap();
        let (depth, color) = wedge_frames(&small_intrinsics, &Pose::eye(), 0.0);
        let pyramid = tracker.pyramid(&depth);
        TsdfFusion::default()
            .integrate(&mut volume, &pyramid[0], Some(&color), &Pose::eye(), 1.0)
            .unwrap();
        let mut keyframes = KeyframeManager::default();
        assert!(keyframes.add(Keyframe::new(Pose::eye(), Arc::new(color.clone()), None)));
        match tracker.track(&pyramid, Some(&color), &volume, &keyframes) {
            TrackResult::Tracked(tracked) => {
                assert_eq!(tracked.photometric, Refinement::Skipped);
                tracker.accept(&tracked);
            }
            TrackResult::Lost(reason) => panic!("lost: {}", reason),
        }

        let moved = Pose::from_translation(&Vector3::new(0.01, 0.0, 0.0));
        let (depth, color) = wedge_frames(&small_intrinsics, &moved, 1.0 / 30.0);
        let pyramid = tracker.pyramid(&depth);
        let tracked = match tracker.track(&pyramid, Some(&color), &volume, &keyframes) {
            TrackResult::Tracked(tracked) => tracked,
            TrackResult::Lost(reason) => panic!("lost: {}", reason),
        };
        match tracked.photometric {
            Refinement::Applied { before, after } => assert!(after < before),
            Refinement::Rejected { .. } => (),
            Refinement::Skipped => panic!("the keyframe is in view"),
        }
        let (translation, _) = tracked.pose.delta_to(&moved);
        assert!(translation < 5e-3, "{}", translation);

        // Without a keyframe, or with color turned off, only depth is used.
        let alone = tracker.track(&pyramid, Some(&color), &volume, &KeyframeManager::default());
        assert!(matches!(
            alone,
            TrackResult::Tracked(TrackedPose {
                photometric: Refinement::Skipped,
                ..
            })
        ));
        let mut depth_only = tracker.clone();
        depth_only.params.color_enabled = false;
        assert!(matches!(
            depth_only.track(&pyramid, Some(&color), &volume, &keyframes),
            TrackResult::Tracked(TrackedPose {
                photometric: Refinement::Skipped,
                ..
            })
        ));
    }

    #[test]
    fn refinement_needs_lower_intensity_residual() {
        let estimate = |residual: f32, inliers: usize| IcpEstimate {
            pose: Pose::eye(),
            residual,
            inliers,
            valid_points: 100,
            condition_number: 1.0,
            system: GaussNewton::new(),
        };
        let depth = estimate(1e-3, 90);
        assert!(keeps_refinement(&depth, &estimate(1e-3, 90), 0.02, 0.01));
        assert!(!keeps_refinement(&depth, &estimate(1e-3, 90), 0.02, 0.02));
        assert!(!keeps_refinement(&depth, &estimate(2e-3, 90), 0.02, 0.01));
        assert!(!keeps_refinement(&depth, &estimate(1e-3, 60), 0.02, 0.01));
    }
}
