use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use crate::camera::CameraIntrinsics;
use crate::colorize::Colorizer;
use crate::config::ScanConfig;
use crate::error::{Error, Result};
use crate::frame::{ColorFrame, RawDepthFrame};
use crate::fusion::{BoundsPlan, FusionSummary, TsdfFusion};
use crate::intake::{AcceptedPair, FrameIntake, IntakeStats, Rejection};
use crate::keyframe::{Keyframe, KeyframeManager};
use crate::marching_cubes::MarchingCubes;
use crate::mesh::Mesh;
use crate::sync::CancelToken;
use crate::tracker::{
    LostReason, Refinement, TrackResult, TrackedPose, Tracker, TrackerState, TrackerStatus,
};
use crate::trajectory::Trajectory;
use crate::transform::Pose;
use crate::volume::{RecenterSummary, Volume};

/// A frame that was tracked and committed.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessedFrame {
    pub timestamp: f64,
    pub tracked: TrackedPose,
    /// `None` when the frame was not fused because the volume was exceeded.
    pub fusion: Option<FusionSummary>,
    pub recenter: Option<RecenterSummary>,
    pub volume_exceeded: bool,
    pub new_keyframe: bool,
}

/// What happened to one input frame.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameOutcome {
    /// Dropped by the intake, the session did not change.
    Rejected(Rejection),
    /// Tracking failed, nothing was fused.
    Lost { timestamp: f64, reason: LostReason },
    Tracked(ProcessedFrame),
}

impl FrameOutcome {
    pub fn tracked(&self) -> Option<&ProcessedFrame> {
        match self {
            FrameOutcome::Tracked(frame) => Some(frame),
            _ => None,
        }
    }
}

/// Counters since the session was set up. Not cleared by [`Session::reset`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub tracked: usize,
    pub lost: usize,
    pub integrated: usize,
    pub recentered: usize,
    pub volume_exceeded: usize,
    pub resets: usize,
}

/// A scanning session: the volume, the tracker, the keyframes and the
/// accepted trajectory.
///
/// The volume sits behind a reader-writer lock so a render thread can
/// ray-cast it, but only the session writes to it.
pub struct Session {
    config: ScanConfig,
    calibration: CameraIntrinsics,
    intake: FrameIntake,
    tracker: Tracker,
    fusion: TsdfFusion,
    volume: Arc<RwLock<Volume>>,
    keyframes: KeyframeManager,
    trajectory: Trajectory,
    stats: SessionStats,
    volume_exceeded: bool,
}

impl Session {
    /// Sets up a session for a sensor calibration.
    ///
    /// # Returns
    ///
    /// `Error::Setup` for an unusable calibration, `Error::InvalidParameter`
    /// for an invalid configuration.
    pub fn new(config: ScanConfig, calibration: CameraIntrinsics) -> Result<Self> {
        config.validate()?;
        calibration
            .validate()
            .map_err(|err| Error::setup(format!("unusable calibration: {}", err)))?;
        let volume = Volume::new(&config.volume, &config.fusion)?;
        info!(
            dims = ?volume.dims(),
            voxel_size = volume.voxel_size(),
            "session set up"
        );

        Ok(Self {
            intake: FrameIntake::new(config.intake.clone()).with_calibration(calibration.clone()),
            tracker: Tracker::new(config.tracker.clone()),
            fusion: TsdfFusion::new(config.fusion.clone()),
            keyframes: KeyframeManager::new(config.keyframes.clone()),
            volume: Arc::new(RwLock::new(volume)),
            trajectory: Trajectory::default(),
            stats: SessionStats::default(),
            volume_exceeded: false,
            config,
            calibration,
        })
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn calibration(&self) -> &CameraIntrinsics {
        &self.calibration
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn keyframes(&self) -> &KeyframeManager {
        &self.keyframes
    }

    /// The keyframes as shared handles, for background colorization.
    pub fn keyframe_snapshot(&self) -> Vec<Arc<Keyframe>> {
        self.keyframes.keyframes().to_vec()
    }

    /// Accepted poses, a subsequence of the input stream.
    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn intake_stats(&self) -> &IntakeStats {
        self.intake.stats()
    }

    /// Shared handle to the volume for readers on other threads.
    pub fn shared_volume(&self) -> Arc<RwLock<Volume>> {
        self.volume.clone()
    }

    pub fn read_volume(&self) -> RwLockReadGuard<'_, Volume> {
        self.volume.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_volume(&self) -> RwLockWriteGuard<'_, Volume> {
        self.volume.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the last frame was not fused because the volume was exceeded.
    pub fn volume_exceeded(&self) -> bool {
        self.volume_exceeded
    }

    /// Message for the user about the scan state, if any.
    pub fn user_message(&self) -> Option<&'static str> {
        if self.volume_exceeded {
            Some("Scan volume exceeded")
        } else {
            self.tracker.status().user_message()
        }
    }

    pub fn extract_mesh(&self) -> Mesh {
        MarchingCubes::default().extract(&self.read_volume())
    }

    pub fn colorizer(&self) -> Colorizer {
        Colorizer::new(self.config.colorize.clone(), self.read_volume().truncation())
    }

    /// Validates, tracks and fuses a frame.
    pub fn process(
        &mut self,
        depth: RawDepthFrame,
        color: Option<ColorFrame>,
    ) -> Result<FrameOutcome> {
        match self.intake.accept(depth, color) {
            Ok(pair) => self.process_accepted(&pair),
            Err(rejection) => Ok(FrameOutcome::Rejected(rejection)),
        }
    }

    /// Tracks and fuses a pair validated by an outside intake.
    pub fn process_accepted(&mut self, pair: &AcceptedPair) -> Result<FrameOutcome> {
        self.commit(pair, None, None)
    }

    /// Like [`Self::process_accepted`], but gives up with `Error::Canceled`
    /// before touching the volume once `cancel` is set.
    pub fn process_cancelable(
        &mut self,
        pair: &AcceptedPair,
        cancel: &CancelToken,
    ) -> Result<FrameOutcome> {
        self.commit(pair, None, Some(cancel))
    }

    /// Fuses a frame with a known camera pose, skipping tracking.
    pub fn process_with_pose(
        &mut self,
        depth: RawDepthFrame,
        color: Option<ColorFrame>,
        pose: &Pose,
    ) -> Result<FrameOutcome> {
        match self.intake.accept(depth, color) {
            Ok(pair) => self.commit(&pair, Some(*pose), None),
            Err(rejection) => Ok(FrameOutcome::Rejected(rejection)),
        }
    }

    fn lost(&mut self, timestamp: f64, reason: LostReason) -> FrameOutcome {
        self.tracker.mark_lost(reason);
        self.stats.lost += 1;
        FrameOutcome::Lost { timestamp, reason }
    }

    fn commit(
        &mut self,
        pair: &AcceptedPair,
        known_pose: Option<Pose>,
        cancel: Option<&CancelToken>,
    ) -> Result<FrameOutcome> {
        let timestamp = pair.timestamp();
        let pyramid = self.tracker.pyramid(&pair.depth);
        let finest = pyramid
            .first()
            .ok_or_else(|| Error::invalid_parameter("tracker has no pyramid levels"))?;

        let tracked = match known_pose {
            Some(mut pose) => {
                pose.renormalize();
                TrackedPose {
                    pose,
                    quality: 1.0,
                    status: TrackerStatus::Good,
                    residual: 0.0,
                    first_frame: self.tracker.state() == TrackerState::Uninitialized,
                    relocalized: false,
                    photometric: Refinement::Skipped,
                }
            }
            None => {
                let result = {
                    let volume = self.read_volume();
                    self.tracker
                        .track(&pyramid, pair.color.as_deref(), &volume, &self.keyframes)
                };
                match result {
                    TrackResult::Tracked(tracked) => tracked,
                    TrackResult::Lost(reason) => return Ok(self.lost(timestamp, reason)),
                }
            }
        };
        if let Some(cancel) = cancel {
            cancel.check()?;
        }

        let (fusion, recenter, exceeded) = {
            let mut volume = self.write_volume();
            if !volume.contains(&tracked.pose.translation()) {
                drop(volume);
                return Ok(self.lost(timestamp, LostReason::OutsideVolume));
            }

            let mut recenter = None;
            let mut exceeded = false;
            match self.fusion.plan_bounds(&volume, finest, &tracked.pose) {
                BoundsPlan::Keep => (),
                BoundsPlan::Recenter { shift, .. } => recenter = Some(volume.shift(shift)),
                BoundsPlan::Exceeded { discard_fraction } => {
                    if !self.volume_exceeded {
                        warn!(discard_fraction, "scan volume exceeded");
                    }
                    exceeded = true;
                }
            }

            let fusion = if exceeded {
                None
            } else {
                match self.fusion.integrate(
                    &mut volume,
                    finest,
                    pair.color.as_deref(),
                    &tracked.pose,
                    tracked.quality,
                ) {
                    Ok(summary) => Some(summary),
                    Err(Error::PoseOutsideVolume) => {
                        drop(volume);
                        return Ok(self.lost(timestamp, LostReason::OutsideVolume));
                    }
                    Err(err) => return Err(err),
                }
            };
            (fusion, recenter, exceeded)
        };

        self.tracker.accept(&tracked);
        self.trajectory.push(tracked.pose, timestamp);
        self.volume_exceeded = exceeded;
        self.stats.tracked += 1;
        if fusion.is_some() {
            self.stats.integrated += 1;
        }
        if recenter.is_some() {
            self.stats.recentered += 1;
        }
        if exceeded {
            self.stats.volume_exceeded += 1;
        }

        let new_keyframe = match &pair.color {
            Some(color) => self
                .keyframes
                .process_candidate(&tracked.pose, color, Some(&pair.depth)),
            None => false,
        };

        debug!(
            timestamp,
            quality = tracked.quality,
            status = ?tracked.status,
            "frame committed"
        );
        Ok(FrameOutcome::Tracked(ProcessedFrame {
            timestamp,
            tracked,
            fusion,
            recenter,
            volume_exceeded: exceeded,
            new_keyframe,
        }))
    }

    /// Restarts the scan keeping the calibration: the volume is reallocated
    /// at its configured placement, the tracker, the keyframes and the
    /// trajectory are cleared. The next frame is a first frame.
    pub fn reset(&mut self) -> Result<()> {
        let volume = Volume::new(&self.config.volume, &self.config.fusion)?;
        *self.write_volume() = volume;
        self.tracker.reset();
        self.intake.reset();
        self.keyframes.clear();
        self.trajectory.clear();
        self.volume_exceeded = false;
        self.stats.resets += 1;
        info!("session reset");
        Ok(())
    }
}
