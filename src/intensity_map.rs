use ndarray::{Array2, ArrayView2};

use crate::frame::ColorFrame;

/// Grayscale image in [0, 1] for photometric alignment, padded by one
/// repeated row and column so bilinear lookups at the last pixel stay in bounds.
#[derive(Debug, Clone)]
pub struct IntensityMap {
    padded: Array2<f32>,
    height: usize,
    width: usize,
}

impl IntensityMap {
    pub fn from_luma_image(image: &ArrayView2<u8>) -> Self {
        let (height, width) = image.dim();
        let padded = Array2::from_shape_fn((height + 1, width + 1), |(row, col)| {
            if height == 0 || width == 0 {
                return 0.0;
            }
            image[(row.min(height - 1), col.min(width - 1))] as f32 / 255.0
        });
        Self {
            padded,
            height,
            width,
        }
    }

    /// Luma of a color frame.
    pub fn from_color_frame(frame: &ColorFrame) -> Self {
        Self::from_luma_image(&frame.luma().view())
    }

    /// (height, width) of the source image.
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Whether (u, v) lies on the image.
    pub fn contains(&self, u: f32, v: f32) -> bool {
        u >= 0.0 && v >= 0.0 && u <= self.width as f32 - 1.0 && v <= self.height as f32 - 1.0
    }

    fn corners(&self, u: f32, v: f32) -> ([f32; 4], f32, f32) {
        let (col, row) = (u as usize, v as usize);
        (
            [
                self.padded[(row, col)],
                self.padded[(row, col + 1)],
                self.padded[(row + 1, col)],
                self.padded[(row + 1, col + 1)],
            ],
            u - col as f32,
            v - row as f32,
        )
    }

    /// Bilinear intensity at (u, v), which must satisfy [`Self::contains`].
    pub fn bilinear(&self, u: f32, v: f32) -> f32 {
        let ([top_left, top_right, bottom_left, bottom_right], fu, fv) = self.corners(u, v);
        let top = top_left + (top_right - top_left) * fu;
        let bottom = bottom_left + (bottom_right - bottom_left) * fu;
        top + (bottom - top) * fv
    }

    /// Bilinear intensity and its analytic derivatives along u and v.
    pub fn bilinear_grad(&self, u: f32, v: f32) -> (f32, f32, f32) {
        let ([top_left, top_right, bottom_left, bottom_right], fu, fv) = self.corners(u, v);
        let top = top_left + (top_right - top_left) * fu;
        let bottom = bottom_left + (bottom_right - bottom_left) * fu;
        let du = (top_right - top_left) * (1.0 - fv) + (bottom_right - bottom_left) * fv;
        (top + (bottom - top) * fv, du, bottom - top)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;
    use rstest::*;

    use super::IntensityMap;

    #[fixture]
    fn ramp() -> Array2<u8> {
        Array2::from_shape_fn((24, 32), |(row, col)| (col * 4 + row) as u8)
    }

    #[rstest]
    fn last_pixel_should_clamp(ramp: Array2<u8>) {
        let map = IntensityMap::from_luma_image(&ramp.view());
        let (height, width) = ramp.dim();
        let last = ramp[(height - 1, width - 1)] as f32 / 255.0;
        assert_eq!(map.bilinear((width - 1) as f32, (height - 1) as f32), last);
        assert_eq!(map.shape(), (24, 32));
    }

    #[rstest]
    fn pixel_centers_should_match_image(ramp: Array2<u8>) {
        let map = IntensityMap::from_luma_image(&ramp.view());
        for ((y, x), img_value) in ramp.indexed_iter() {
            let (value, _du, _dv) = map.bilinear_grad(x as f32, y as f32);
            assert_eq!(*img_value as f32 / 255.0, value);
        }
    }

    #[rstest]
    fn gradient_should_follow_ramp(ramp: Array2<u8>) {
        let map = IntensityMap::from_luma_image(&ramp.view());
        let (_, du, dv) = map.bilinear_grad(10.3, 7.6);
        assert!((du - 4.0 / 255.0).abs() < 1e-5);
        assert!((dv - 1.0 / 255.0).abs() < 1e-5);
        assert!(map.contains(31.0, 23.0));
        assert!(!map.contains(31.5, 0.0));
    }
}
