use nalgebra::{Matrix4, Vector3};
use ndarray::Array2;

use crate::error::{Error, Result};

/// Radial-tangential (Brown-Conrady) distortion coefficients.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    pub fn is_zero(&self) -> bool {
        self.k1 == 0.0 && self.k2 == 0.0 && self.p1 == 0.0 && self.p2 == 0.0 && self.k3 == 0.0
    }

    /// Distorts a normalized image coordinate.
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (xd, yd)
    }
}

/// Camera intrinsic parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraIntrinsics {
    /// Focal length and pixel scale in the X-axis.
    pub fx: f64,
    /// Focal length and pixel scale in the Y-axis.
    pub fy: f64,
    /// Camera X-center.
    pub cx: f64,
    /// Camera Y-center.
    pub cy: f64,
    pub width: usize,
    pub height: usize,
    pub distortion: Distortion,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: usize, height: usize) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
            distortion: Distortion::default(),
        }
    }

    pub fn with_distortion(mut self, distortion: Distortion) -> Self {
        self.distortion = distortion;
        self
    }

    /// Checks that the calibration describes a usable pinhole camera.
    pub fn validate(&self) -> Result<()> {
        let finite = [self.fx, self.fy, self.cx, self.cy]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.fx <= 0.0 || self.fy <= 0.0 {
            return Err(Error::invalid_parameter(format!(
                "invalid focal lengths or principal point: {self:?}"
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(Error::invalid_parameter("calibration with empty image size"));
        }
        Ok(())
    }

    /// Project a 3D point into image space.
    ///
    /// # Arguments
    ///
    /// * point: The 3D point.
    ///
    /// # Returns
    ///
    /// * (x and y) coordinates.
    pub fn project(&self, point: &Vector3<f32>) -> (f32, f32) {
        (
            point[0] * self.fx as f32 / point[2] + self.cx as f32,
            point[1] * self.fy as f32 / point[2] + self.cy as f32,
        )
    }

    /// Projects and rounds to the nearest pixel, `None` if behind the camera or outside the image.
    pub fn project_to_pixel(&self, point: &Vector3<f32>) -> Option<(usize, usize)> {
        if point[2] <= 0.0 {
            return None;
        }
        let (x, y) = self.project(point);
        let (col, row) = ((x + 0.5).floor(), (y + 0.5).floor());
        if col >= 0.0 && row >= 0.0 && (col as usize) < self.width && (row as usize) < self.height {
            Some((row as usize, col as usize))
        } else {
            None
        }
    }

    /// Derivatives of the projection, ((dx/dX, dx/dZ), (dy/dY, dy/dZ)).
    pub fn project_grad(&self, point: &Vector3<f32>) -> ((f32, f32), (f32, f32)) {
        let z = point[2];
        let zz = z * z;
        (
            (self.fx as f32 / z, -point[0] * self.fx as f32 / zz),
            (self.fy as f32 / z, -point[1] * self.fy as f32 / zz),
        )
    }

    pub fn backproject(&self, x: f32, y: f32, z: f32) -> Vector3<f32> {
        Vector3::new(
            (x - self.cx as f32) * z / self.fx as f32,
            (y - self.cy as f32) * z / self.fy as f32,
            z,
        )
    }

    /// Intrinsics of a half resolution image, keeping pixel centers aligned.
    pub fn half(&self) -> Self {
        Self {
            fx: self.fx * 0.5,
            fy: self.fy * 0.5,
            cx: (self.cx + 0.5) * 0.5 - 0.5,
            cy: (self.cy + 0.5) * 0.5 - 0.5,
            width: self.width / 2,
            height: self.height / 2,
            distortion: self.distortion,
        }
    }

    /// The same camera without lens distortion, i.e. after undistortion.
    pub fn undistorted(&self) -> Self {
        Self {
            distortion: Distortion::default(),
            ..self.clone()
        }
    }

    /// OpenGL style projection matrix for this camera.
    ///
    /// # Arguments
    ///
    /// * near: Near plane distance.
    /// * far: Far plane distance.
    pub fn gl_projection_matrix(&self, near: f32, far: f32) -> Matrix4<f32> {
        let (w, h) = (self.width as f32, self.height as f32);
        let (fx, fy, cx, cy) = (
            self.fx as f32,
            self.fy as f32,
            self.cx as f32,
            self.cy as f32,
        );
        Matrix4::new(
            2.0 * fx / w, 0.0, 1.0 - 2.0 * cx / w, 0.0,
            0.0, 2.0 * fy / h, 2.0 * cy / h - 1.0, 0.0,
            0.0, 0.0, -(far + near) / (far - near), -2.0 * far * near / (far - near),
            0.0, 0.0, -1.0, 0.0,
        )
    }
}

/// Lookup table from undistorted pixels to the nearest distorted source pixel.
/// Computed once per calibration.
#[derive(Clone, Debug)]
pub struct UndistortionMap {
    intrinsics: CameraIntrinsics,
    source: Option<Array2<Option<(u32, u32)>>>,
}

impl UndistortionMap {
    pub fn new(intrinsics: &CameraIntrinsics) -> Self {
        if intrinsics.distortion.is_zero() {
            return Self {
                intrinsics: intrinsics.clone(),
                source: None,
            };
        }

        let (width, height) = (intrinsics.width, intrinsics.height);
        let source = Array2::from_shape_fn((height, width), |(row, col)| {
            let x = (col as f64 - intrinsics.cx) / intrinsics.fx;
            let y = (row as f64 - intrinsics.cy) / intrinsics.fy;
            let (xd, yd) = intrinsics.distortion.distort(x, y);
            let u = (xd * intrinsics.fx + intrinsics.cx + 0.5).floor();
            let v = (yd * intrinsics.fy + intrinsics.cy + 0.5).floor();
            if u >= 0.0 && v >= 0.0 && (u as usize) < width && (v as usize) < height {
                Some((v as u32, u as u32))
            } else {
                None
            }
        });

        Self {
            intrinsics: intrinsics.clone(),
            source: Some(source),
        }
    }

    /// Whether the map was built for these intrinsics.
    pub fn matches(&self, intrinsics: &CameraIntrinsics) -> bool {
        self.intrinsics == *intrinsics
    }

    pub fn is_identity(&self) -> bool {
        self.source.is_none()
    }

    /// Remaps an image, pixels without a source get `empty`.
    pub fn remap<T: Copy>(&self, image: &Array2<T>, empty: T) -> Array2<T> {
        match &self.source {
            None => image.clone(),
            Some(source) => source.map(|src| match src {
                Some((row, col)) => image[(*row as usize, *col as usize)],
                None => empty,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_project_backproject() {
        let camera = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        let point = camera.backproject(100.0, 50.0, 0.75);
        let (x, y) = camera.project(&point);
        assert_abs_diff_eq!(x, 100.0, epsilon = 1e-3);
        assert_abs_diff_eq!(y, 50.0, epsilon = 1e-3);
        assert_eq!(camera.project_to_pixel(&point), Some((50, 100)));
        assert_eq!(camera.project_to_pixel(&-point), None);
    }

    #[test]
    fn test_half_keeps_pixel_centers() {
        let camera = CameraIntrinsics::new(500.0, 500.0, 319.5, 239.5, 640, 480);
        let half = camera.half();
        assert_eq!((half.width, half.height), (320, 240));
        assert_abs_diff_eq!(half.cx, 159.5);
        assert_abs_diff_eq!(half.cy, 119.5);
    }

    #[test]
    fn test_validate() {
        assert!(CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480)
            .validate()
            .is_ok());
        assert!(CameraIntrinsics::new(0.0, 500.0, 320.0, 240.0, 640, 480)
            .validate()
            .is_err());
        assert!(CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0, 0, 480)
            .validate()
            .is_err());
    }

    #[test]
    fn test_undistortion_map() {
        let camera = CameraIntrinsics::new(100.0, 100.0, 50.0, 50.0, 100, 100);
        assert!(UndistortionMap::new(&camera).is_identity());

        let distorted = camera.clone().with_distortion(Distortion {
            k1: 0.1,
            ..Default::default()
        });
        let map = UndistortionMap::new(&distorted);
        assert!(!map.is_identity());
        assert!(map.matches(&distorted));
        assert!(!map.matches(&camera));

        let image = Array2::from_shape_fn((100, 100), |(r, c)| (r * 100 + c) as f32);
        let remapped = map.remap(&image, f32::NAN);
        // The principal point is a fixed point of the distortion.
        assert_eq!(remapped[(50, 50)], image[(50, 50)]);
        // Pushed outward, so corners map outside the image.
        assert!(remapped[(0, 0)].is_nan());
    }
}
