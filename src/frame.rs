use ndarray::{Array2, Array3};

use crate::camera::CameraIntrinsics;
use crate::transform::Pose;

/// Depth samples as delivered by the sensor driver.
#[derive(Clone, Debug)]
pub enum RawDepth {
    /// Samples already in meters. Zero, negative or non finite values are invalid.
    Metric(Array2<f32>),
    /// Integer sensor units, multiplied by `scale` to get meters. Zero is invalid.
    Scaled { data: Array2<u16>, scale: f32 },
}

impl RawDepth {
    pub fn shape(&self) -> (usize, usize) {
        match self {
            RawDepth::Metric(data) => data.dim(),
            RawDepth::Scaled { data, .. } => data.dim(),
        }
    }

    /// Converts to meters, invalid samples become NaN.
    pub fn to_meters(&self) -> Array2<f32> {
        match self {
            RawDepth::Metric(data) => data.mapv(|z| if z.is_finite() && z > 0.0 { z } else { f32::NAN }),
            RawDepth::Scaled { data, scale } => data.mapv(|z| {
                if z > 0 {
                    z as f32 * scale
                } else {
                    f32::NAN
                }
            }),
        }
    }
}

/// A depth frame before intake validation.
#[derive(Clone, Debug)]
pub struct RawDepthFrame {
    pub depth: RawDepth,
    /// Acquisition time in seconds.
    pub timestamp: f64,
    pub intrinsics: CameraIntrinsics,
}

impl RawDepthFrame {
    pub fn metric(depth: Array2<f32>, timestamp: f64, intrinsics: CameraIntrinsics) -> Self {
        Self {
            depth: RawDepth::Metric(depth),
            timestamp,
            intrinsics,
        }
    }
}

/// A validated depth frame in meters. Invalid samples are NaN.
#[derive(Clone, Debug)]
pub struct DepthFrame {
    depth: Array2<f32>,
    timestamp: f64,
    intrinsics: CameraIntrinsics,
}

impl DepthFrame {
    pub(crate) fn new(depth: Array2<f32>, timestamp: f64, intrinsics: CameraIntrinsics) -> Self {
        Self {
            depth,
            timestamp,
            intrinsics,
        }
    }

    pub fn depth(&self) -> &Array2<f32> {
        &self.depth
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    pub fn width(&self) -> usize {
        self.depth.ncols()
    }

    pub fn height(&self) -> usize {
        self.depth.nrows()
    }

    /// Depth at a pixel, `None` for invalid samples.
    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        self.depth
            .get((row, col))
            .copied()
            .filter(|z| z.is_finite())
    }

    pub fn valid_count(&self) -> usize {
        self.depth.iter().filter(|z| z.is_finite()).count()
    }
}

/// An sRGB frame with the rigid transform from the color sensor to the depth sensor.
#[derive(Clone, Debug)]
pub struct ColorFrame {
    /// Image with shape (height, width, 3).
    pub image: Array3<u8>,
    /// Acquisition time in seconds.
    pub timestamp: f64,
    pub intrinsics: CameraIntrinsics,
    /// Maps points in the color camera frame to the depth camera frame.
    pub color_to_depth: Pose,
}

impl ColorFrame {
    pub fn new(image: Array3<u8>, timestamp: f64, intrinsics: CameraIntrinsics) -> Self {
        Self {
            image,
            timestamp,
            intrinsics,
            color_to_depth: Pose::eye(),
        }
    }

    pub fn with_extrinsics(mut self, color_to_depth: Pose) -> Self {
        self.color_to_depth = color_to_depth;
        self
    }

    pub fn width(&self) -> usize {
        self.image.shape()[1]
    }

    pub fn height(&self) -> usize {
        self.image.shape()[0]
    }

    pub fn rgb(&self, row: usize, col: usize) -> [u8; 3] {
        [
            self.image[(row, col, 0)],
            self.image[(row, col, 1)],
            self.image[(row, col, 2)],
        ]
    }

    /// Luminance image with values in [0, 255].
    pub fn luma(&self) -> Array2<u8> {
        Array2::from_shape_fn((self.height(), self.width()), |(row, col)| {
            let [r, g, b] = self.rgb(row, col);
            (rgb_to_luma(r, g, b) * 255.0).round() as u8
        })
    }
}

/// ITU-R 601 luma in [0, 1].
pub fn rgb_to_luma(r: u8, g: u8, b: u8) -> f32 {
    (r as f32 * 0.299 + g as f32 * 0.587 + b as f32 * 0.114) / 255.0
}
