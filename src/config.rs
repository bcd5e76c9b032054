use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Placement and resolution of the scanning volume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeParams {
    /// World-space center of the volume in meters.
    pub center: [f32; 3],
    /// Extent of the volume along each axis in meters.
    pub size: [f32; 3],
    /// Number of voxels along the largest side. The voxels are cubic.
    pub resolution: usize,
}

impl Default for VolumeParams {
    fn default() -> Self {
        Self {
            center: [0.0, 0.0, 0.5],
            size: [1.2, 1.2, 1.2],
            resolution: 128,
        }
    }
}

impl VolumeParams {
    pub fn with_center(mut self, center: [f32; 3]) -> Self {
        self.center = center;
        self
    }

    pub fn with_size(mut self, size: f32) -> Self {
        self.size = [size, size, size];
        self
    }

    pub fn with_resolution(mut self, resolution: usize) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn voxel_size(&self) -> f32 {
        let largest = self.size.iter().cloned().fold(0.0, f32::max);
        largest / self.resolution as f32
    }

    /// Number of voxels along each axis.
    pub fn dims(&self) -> [usize; 3] {
        let voxel_size = self.voxel_size();
        let mut dims = [0; 3];
        for (dim, size) in dims.iter_mut().zip(self.size.iter()) {
            *dim = ((size / voxel_size).round() as usize).max(1);
        }
        dims
    }
}

/// Frame intake settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeParams {
    /// Sensor frame period in seconds. Bounds the color-to-depth skew.
    pub frame_period: f64,
    /// Apply the calibration undistortion map to depth samples.
    pub undistort: bool,
}

impl Default for IntakeParams {
    fn default() -> Self {
        Self {
            frame_period: 1.0 / 30.0,
            undistort: true,
        }
    }
}

/// Depth-to-model tracker settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerParams {
    /// Iterations per pyramid level, finest level first.
    pub pyramid_iterations: Vec<usize>,
    /// Correspondence distance gate until the first frame tracked against the model.
    pub initial_max_distance: f32,
    /// Correspondence distance gate afterwards.
    pub max_distance: f32,
    /// Correspondence normal gate in radians.
    pub max_normal_angle: f32,
    /// Maximum RMS point-to-plane residual (meters) of an accepted pose.
    pub max_residual: f32,
    /// Minimum fraction of valid input pixels with a correspondence.
    pub min_inlier_fraction: f32,
    pub max_condition_number: f64,
    /// Weight of the photometric cost relative to the depth cost, applied
    /// linearly to its normal equations.
    pub color_weight: f32,
    pub color_enabled: bool,
    /// Number of keyframe poses tried while relocalizing.
    pub relocalization_candidates: usize,
    /// Depth samples outside [min_depth, max_depth] are ignored when tracking.
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            pyramid_iterations: vec![10, 5, 4],
            initial_max_distance: 0.10,
            max_distance: 0.02,
            max_normal_angle: 30.0_f32.to_radians(),
            max_residual: 0.01,
            min_inlier_fraction: 0.2,
            max_condition_number: 1e6,
            color_weight: 0.1,
            color_enabled: true,
            relocalization_candidates: 3,
            min_depth: 0.1,
            max_depth: 5.0,
        }
    }
}

impl TrackerParams {
    pub fn with_color(mut self, enabled: bool) -> Self {
        self.color_enabled = enabled;
        self
    }

    pub fn with_pyramid_iterations(mut self, iterations: Vec<usize>) -> Self {
        self.pyramid_iterations = iterations;
        self
    }
}

/// Volumetric fusion settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionParams {
    /// Cap on the per voxel fusion weight.
    pub max_weight: f32,
    /// Truncation band as a multiple of the voxel size.
    pub truncation_factor: f32,
    /// Fraction of the volume extent the view frustum may overflow before recentering.
    pub recenter_overflow: f32,
    /// Largest fraction of the fused surface a recenter may discard.
    pub max_discard_fraction: f32,
    /// Keep a per voxel color accumulator.
    pub integrate_color: bool,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            max_weight: 64.0,
            truncation_factor: 4.0,
            recenter_overflow: 0.25,
            max_discard_fraction: 0.5,
            integrate_color: true,
        }
    }
}

/// Keyframe selection settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyframeParams {
    pub max_keyframes: usize,
    /// Rotation since the last keyframe, in radians, that makes a new one.
    pub max_delta_rotation: f32,
    /// Translation since the last keyframe, in meters, that makes a new one.
    pub max_delta_translation: f32,
}

impl Default for KeyframeParams {
    fn default() -> Self {
        Self {
            max_keyframes: 48,
            max_delta_rotation: 30.0_f32.to_radians(),
            max_delta_translation: 0.3,
        }
    }
}

/// Enhanced colorization settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorizeParams {
    /// Give the first keyframe precedence over the view-angle blend.
    pub prioritize_first_keyframe: bool,
    /// Depth agreement used by the occlusion test. Defaults to the truncation band.
    pub occlusion_tolerance: Option<f32>,
}

/// All the settings of a scanning session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub volume: VolumeParams,
    pub intake: IntakeParams,
    pub tracker: TrackerParams,
    pub fusion: FusionParams,
    pub keyframes: KeyframeParams,
    pub colorize: ColorizeParams,
}

impl ScanConfig {
    /// Parses a JSON document, keys that are not present keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Truncation band μ in meters.
    pub fn truncation(&self) -> f32 {
        self.fusion.truncation_factor * self.volume.voxel_size()
    }

    pub fn validate(&self) -> Result<()> {
        let volume = &self.volume;
        if volume.resolution < 2 || volume.size.iter().any(|s| s.is_nan() || *s <= 0.0) {
            return Err(Error::invalid_parameter(format!(
                "volume must have a positive size and at least 2 voxels: {volume:?}"
            )));
        }
        if self.intake.frame_period.is_nan() || self.intake.frame_period <= 0.0 {
            return Err(Error::invalid_parameter("frame period must be positive"));
        }

        let tracker = &self.tracker;
        if tracker.pyramid_iterations.is_empty() {
            return Err(Error::invalid_parameter(
                "tracker needs at least one pyramid level",
            ));
        }
        if !(0.0..=1.0).contains(&tracker.min_inlier_fraction) {
            return Err(Error::invalid_parameter(
                "min_inlier_fraction must be in [0, 1]",
            ));
        }
        if !(tracker.initial_max_distance > 0.0 && tracker.max_distance > 0.0) {
            return Err(Error::invalid_parameter(
                "correspondence distances must be positive",
            ));
        }
        if !(tracker.min_depth >= 0.0 && tracker.max_depth > tracker.min_depth) {
            return Err(Error::invalid_parameter("invalid tracking depth range"));
        }

        let fusion = &self.fusion;
        if !(fusion.max_weight > 0.0 && fusion.truncation_factor > 0.0) {
            return Err(Error::invalid_parameter(
                "max_weight and truncation_factor must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&fusion.max_discard_fraction) {
            return Err(Error::invalid_parameter(
                "max_discard_fraction must be in [0, 1]",
            ));
        }

        if self.keyframes.max_keyframes == 0 {
            return Err(Error::invalid_parameter("max_keyframes must be positive"));
        }
        Ok(())
    }
}
