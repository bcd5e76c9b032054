//! Validation and normalization of sensor frames.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::camera::{CameraIntrinsics, UndistortionMap};
use crate::config::IntakeParams;
use crate::frame::{ColorFrame, DepthFrame, RawDepthFrame};

/// Reason for dropping a frame. Rejections never change session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// Empty image, or image size disagreeing with its calibration.
    MalformedGeometry,
    /// Non positive or non finite focal lengths or principal point.
    InvalidIntrinsics,
    /// Timestamp not greater than the previous accepted frame.
    NonMonotonicTimestamp,
    /// Color and depth timestamps further apart than one frame period.
    ColorSkew,
    /// Depth calibration differs from the one the session was set up with.
    IntrinsicsMismatch,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Rejection::MalformedGeometry => "malformed frame geometry",
            Rejection::InvalidIntrinsics => "invalid intrinsics",
            Rejection::NonMonotonicTimestamp => "non monotonic timestamp",
            Rejection::ColorSkew => "color and depth timestamps too far apart",
            Rejection::IntrinsicsMismatch => "intrinsics differ from the session calibration",
        };
        f.write_str(text)
    }
}

/// Counters of the intake stage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IntakeStats {
    pub accepted: usize,
    pub malformed_geometry: usize,
    pub invalid_intrinsics: usize,
    pub non_monotonic: usize,
    pub color_skew: usize,
    pub intrinsics_mismatch: usize,
}

impl IntakeStats {
    pub fn rejected(&self) -> usize {
        self.malformed_geometry
            + self.invalid_intrinsics
            + self.non_monotonic
            + self.color_skew
            + self.intrinsics_mismatch
    }

    fn count(&mut self, rejection: Rejection) {
        let counter = match rejection {
            Rejection::MalformedGeometry => &mut self.malformed_geometry,
            Rejection::InvalidIntrinsics => &mut self.invalid_intrinsics,
            Rejection::NonMonotonicTimestamp => &mut self.non_monotonic,
            Rejection::ColorSkew => &mut self.color_skew,
            Rejection::IntrinsicsMismatch => &mut self.intrinsics_mismatch,
        };
        *counter += 1;
    }
}

/// A validated depth frame with its optional color frame.
#[derive(Clone, Debug)]
pub struct AcceptedPair {
    pub depth: Arc<DepthFrame>,
    pub color: Option<Arc<ColorFrame>>,
}

impl AcceptedPair {
    pub fn timestamp(&self) -> f64 {
        self.depth.timestamp()
    }
}

/// Frame intake. Checks geometry and timing, converts depth to meters and undistorts.
pub struct FrameIntake {
    params: IntakeParams,
    calibration: Option<CameraIntrinsics>,
    undistortion: Option<UndistortionMap>,
    last_timestamp: Option<f64>,
    stats: IntakeStats,
}

impl FrameIntake {
    pub fn new(params: IntakeParams) -> Self {
        Self {
            params,
            calibration: None,
            undistortion: None,
            last_timestamp: None,
            stats: IntakeStats::default(),
        }
    }

    /// Pins the depth calibration. Frames with other intrinsics are rejected afterwards.
    pub fn with_calibration(mut self, calibration: CameraIntrinsics) -> Self {
        self.undistortion = Some(UndistortionMap::new(&calibration));
        self.calibration = Some(calibration);
        self
    }

    pub fn calibration(&self) -> Option<&CameraIntrinsics> {
        self.calibration.as_ref()
    }

    pub fn stats(&self) -> &IntakeStats {
        &self.stats
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.last_timestamp
    }

    /// Forgets the timestamp history. The calibration and the counters are kept.
    pub fn reset(&mut self) {
        self.last_timestamp = None;
    }

    /// Validates a depth frame and its optional color frame.
    pub fn accept(
        &mut self,
        depth: RawDepthFrame,
        color: Option<ColorFrame>,
    ) -> Result<AcceptedPair, Rejection> {
        match self.validate(&depth, color.as_ref()) {
            Ok(()) => (),
            Err(rejection) => {
                debug!(
                    timestamp = depth.timestamp,
                    reason = %rejection,
                    "frame rejected"
                );
                self.stats.count(rejection);
                return Err(rejection);
            }
        }

        let depth = self.normalize(depth);
        self.last_timestamp = Some(depth.timestamp());
        self.stats.accepted += 1;
        Ok(AcceptedPair {
            depth: Arc::new(depth),
            color: color.map(Arc::new),
        })
    }

    fn validate(&self, depth: &RawDepthFrame, color: Option<&ColorFrame>) -> Result<(), Rejection> {
        let intrinsics = &depth.intrinsics;
        let (height, width) = depth.depth.shape();
        if width == 0 || height == 0 || !depth.timestamp.is_finite() {
            return Err(Rejection::MalformedGeometry);
        }
        if intrinsics.validate().is_err() {
            return Err(Rejection::InvalidIntrinsics);
        }
        if intrinsics.width != width || intrinsics.height != height {
            return Err(Rejection::MalformedGeometry);
        }
        if let Some(calibration) = &self.calibration {
            if calibration != intrinsics {
                return Err(Rejection::IntrinsicsMismatch);
            }
        }
        if let Some(last) = self.last_timestamp {
            if depth.timestamp <= last {
                return Err(Rejection::NonMonotonicTimestamp);
            }
        }

        if let Some(color) = color {
            let shape = color.image.shape();
            if shape[0] == 0 || shape[1] == 0 || shape[2] != 3 {
                return Err(Rejection::MalformedGeometry);
            }
            if color.intrinsics.validate().is_err() {
                return Err(Rejection::InvalidIntrinsics);
            }
            if color.intrinsics.width != shape[1] || color.intrinsics.height != shape[0] {
                return Err(Rejection::MalformedGeometry);
            }
            if (color.timestamp - depth.timestamp).abs() > self.params.frame_period {
                return Err(Rejection::ColorSkew);
            }
        }
        Ok(())
    }

    fn normalize(&mut self, frame: RawDepthFrame) -> DepthFrame {
        let meters = frame.depth.to_meters();
        if !self.params.undistort || frame.intrinsics.distortion.is_zero() {
            return DepthFrame::new(meters, frame.timestamp, frame.intrinsics);
        }

        let rebuild = self
            .undistortion
            .as_ref()
            .map_or(true, |map| !map.matches(&frame.intrinsics));
        if rebuild {
            debug!("building undistortion map");
            self.undistortion = Some(UndistortionMap::new(&frame.intrinsics));
        }

        match &self.undistortion {
            Some(map) => DepthFrame::new(
                map.remap(&meters, f32::NAN),
                frame.timestamp,
                frame.intrinsics.undistorted(),
            ),
            None => DepthFrame::new(meters, frame.timestamp, frame.intrinsics),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Distortion;
    use ndarray::{Array2, Array3};

    fn camera() -> CameraIntrinsics {
        CameraIntrinsics::new(40.0, 40.0, 16.0, 12.0, 32, 24)
    }

    fn depth_frame(timestamp: f64) -> RawDepthFrame {
        RawDepthFrame::metric(Array2::from_elem((24, 32), 0.8), timestamp, camera())
    }

    fn color_frame(timestamp: f64) -> ColorFrame {
        ColorFrame::new(Array3::zeros((24, 32, 3)), timestamp, camera())
    }

    #[test]
    fn test_accepts_valid_pair() {
        let mut intake = FrameIntake::new(IntakeParams::default());
        let pair = intake
            .accept(depth_frame(1.0), Some(color_frame(1.01)))
            .unwrap();
        assert_eq!(pair.timestamp(), 1.0);
        assert!(pair.color.is_some());
        assert_eq!(pair.depth.valid_count(), 32 * 24);
        assert_eq!(intake.stats().accepted, 1);
    }

    #[test]
    fn test_rejects_non_monotonic() {
        let mut intake = FrameIntake::new(IntakeParams::default());
        intake.accept(depth_frame(1.0), None).unwrap();
        assert_eq!(
            intake.accept(depth_frame(1.0), None).unwrap_err(),
            Rejection::NonMonotonicTimestamp
        );
        assert_eq!(
            intake.accept(depth_frame(0.5), None).unwrap_err(),
            Rejection::NonMonotonicTimestamp
        );
        // A rejection does not advance the timestamp.
        intake.accept(depth_frame(1.1), None).unwrap();
        assert_eq!(intake.stats().non_monotonic, 2);
        assert_eq!(intake.stats().rejected(), 2);
    }

    #[test]
    fn test_rejects_color_skew() {
        let mut intake = FrameIntake::new(IntakeParams::default());
        assert_eq!(
            intake
                .accept(depth_frame(1.0), Some(color_frame(1.1)))
                .unwrap_err(),
            Rejection::ColorSkew
        );
        assert_eq!(intake.last_timestamp(), None);
        assert!(intake.accept(depth_frame(1.0), None).is_ok());
    }

    #[test]
    fn test_rejects_geometry() {
        let mut intake = FrameIntake::new(IntakeParams::default());
        let empty = RawDepthFrame::metric(Array2::zeros((0, 0)), 1.0, camera());
        assert_eq!(
            intake.accept(empty, None).unwrap_err(),
            Rejection::MalformedGeometry
        );

        let wrong_size = RawDepthFrame::metric(Array2::zeros((10, 10)), 1.0, camera());
        assert_eq!(
            intake.accept(wrong_size, None).unwrap_err(),
            Rejection::MalformedGeometry
        );

        let mut bad_camera = depth_frame(1.0);
        bad_camera.intrinsics.fx = f64::NAN;
        assert_eq!(
            intake.accept(bad_camera, None).unwrap_err(),
            Rejection::InvalidIntrinsics
        );
    }

    #[test]
    fn test_rejects_other_calibration() {
        let mut intake = FrameIntake::new(IntakeParams::default()).with_calibration(camera());
        let mut frame = depth_frame(1.0);
        frame.intrinsics.cx = 15.0;
        assert_eq!(
            intake.accept(frame, None).unwrap_err(),
            Rejection::IntrinsicsMismatch
        );
    }

    #[test]
    fn test_undistorts() {
        let distorted = camera().with_distortion(Distortion {
            k1: 0.2,
            ..Default::default()
        });
        let mut intake = FrameIntake::new(IntakeParams::default());
        let pair = intake
            .accept(
                RawDepthFrame::metric(Array2::from_elem((24, 32), 0.8), 1.0, distorted),
                None,
            )
            .unwrap();
        assert!(pair.depth.intrinsics().distortion.is_zero());
        assert_eq!(pair.depth.get(12, 16), Some(0.8));
        assert!(pair.depth.valid_count() < 32 * 24);
    }
}
