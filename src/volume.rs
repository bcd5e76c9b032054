use nalgebra::Vector3;
use ndarray::{Array2, Array3};
use tracing::info;

use crate::config::{FusionParams, VolumeParams};
use crate::error::{Error, Result};
use crate::frame::DepthFrame;
use crate::transform::Pose;

/// Geometry of the voxel grid: an axis aligned box split into cubic voxels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoxelGrid {
    /// Minimum corner of the box.
    pub origin: Vector3<f32>,
    pub voxel_size: f32,
    pub dims: [usize; 3],
}

impl VoxelGrid {
    pub fn new(center: &Vector3<f32>, voxel_size: f32, dims: [usize; 3]) -> Self {
        let extent = Vector3::new(dims[0] as f32, dims[1] as f32, dims[2] as f32) * voxel_size;
        Self {
            origin: center - extent * 0.5,
            voxel_size,
            dims,
        }
    }

    pub fn extent(&self) -> Vector3<f32> {
        Vector3::new(
            self.dims[0] as f32,
            self.dims[1] as f32,
            self.dims[2] as f32,
        ) * self.voxel_size
    }

    pub fn center(&self) -> Vector3<f32> {
        self.origin + self.extent() * 0.5
    }

    pub fn min_corner(&self) -> Vector3<f32> {
        self.origin
    }

    pub fn max_corner(&self) -> Vector3<f32> {
        self.origin + self.extent()
    }

    pub fn voxel_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Length of the voxel diagonal.
    pub fn voxel_diagonal(&self) -> f32 {
        self.voxel_size * 3.0f32.sqrt()
    }

    /// World position of a voxel center.
    pub fn voxel_center(&self, i: usize, j: usize, k: usize) -> Vector3<f32> {
        self.origin
            + Vector3::new(i as f32 + 0.5, j as f32 + 0.5, k as f32 + 0.5) * self.voxel_size
    }

    /// Continuous grid coordinates, voxel centers are at integer positions.
    pub fn grid_coord(&self, point: &Vector3<f32>) -> Vector3<f32> {
        (point - self.origin) / self.voxel_size - Vector3::repeat(0.5)
    }

    pub fn contains(&self, point: &Vector3<f32>) -> bool {
        let (min, max) = (self.min_corner(), self.max_corner());
        (0..3).all(|c| point[c] >= min[c] && point[c] <= max[c])
    }

    /// Whether the point is inside with at least `margin` meters of clearance.
    pub fn contains_with_margin(&self, point: &Vector3<f32>, margin: f32) -> bool {
        let (min, max) = (self.min_corner(), self.max_corner());
        (0..3).all(|c| point[c] >= min[c] + margin && point[c] <= max[c] - margin)
    }
}

/// Running color average of a voxel.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VoxelColor {
    pub rgb: [f32; 3],
    pub weight: f32,
}

/// Outcome of a volume recenter.
#[derive(Clone, Debug, PartialEq)]
pub struct RecenterSummary {
    /// Applied shift in voxels.
    pub shift: [i64; 3],
    pub new_center: Vector3<f32>,
    pub discarded_voxels: usize,
    pub discarded_surface_voxels: usize,
}

/// Truncated signed distance volume.
///
/// Per voxel stores the signed distance D, clamped to the truncation band,
/// and the fusion weight W. Voxels with W = 0 were never observed.
#[derive(Clone, Debug)]
pub struct Volume {
    grid: VoxelGrid,
    truncation: f32,
    max_weight: f32,
    tsdf: Array3<f32>,
    weight: Array3<f32>,
    color: Option<Array3<VoxelColor>>,
}

impl Volume {
    /// Allocates a zeroed volume.
    pub fn new(params: &VolumeParams, fusion: &FusionParams) -> Result<Self> {
        if params.resolution < 2 || params.size.iter().any(|s| s.is_nan() || *s <= 0.0) {
            return Err(Error::invalid_parameter(format!(
                "invalid volume parameters: {params:?}"
            )));
        }
        let voxel_size = params.voxel_size();
        let grid = VoxelGrid::new(&Vector3::from(params.center), voxel_size, params.dims());
        Ok(Self::from_grid(
            grid,
            fusion.truncation_factor * voxel_size,
            fusion.max_weight,
            fusion.integrate_color,
        ))
    }

    pub fn from_grid(grid: VoxelGrid, truncation: f32, max_weight: f32, with_color: bool) -> Self {
        let shape = (grid.dims[0], grid.dims[1], grid.dims[2]);
        Self {
            grid,
            truncation,
            max_weight,
            tsdf: Array3::zeros(shape),
            weight: Array3::zeros(shape),
            color: if with_color {
                Some(Array3::default(shape))
            } else {
                None
            },
        }
    }

    pub fn grid(&self) -> &VoxelGrid {
        &self.grid
    }

    pub fn voxel_size(&self) -> f32 {
        self.grid.voxel_size
    }

    pub fn dims(&self) -> [usize; 3] {
        self.grid.dims
    }

    pub fn center(&self) -> Vector3<f32> {
        self.grid.center()
    }

    /// Truncation band μ.
    pub fn truncation(&self) -> f32 {
        self.truncation
    }

    pub fn max_weight(&self) -> f32 {
        self.max_weight
    }

    pub fn has_color(&self) -> bool {
        self.color.is_some()
    }

    pub fn contains(&self, point: &Vector3<f32>) -> bool {
        self.grid.contains(point)
    }

    pub fn tsdf(&self) -> &Array3<f32> {
        &self.tsdf
    }

    pub fn weights(&self) -> &Array3<f32> {
        &self.weight
    }

    pub fn colors(&self) -> Option<&Array3<VoxelColor>> {
        self.color.as_ref()
    }

    pub fn voxel(&self, i: usize, j: usize, k: usize) -> (f32, f32) {
        (self.tsdf[(i, j, k)], self.weight[(i, j, k)])
    }

    pub(crate) fn layers_mut(
        &mut self,
    ) -> (
        &VoxelGrid,
        &mut Array3<f32>,
        &mut Array3<f32>,
        Option<&mut Array3<VoxelColor>>,
    ) {
        (
            &self.grid,
            &mut self.tsdf,
            &mut self.weight,
            self.color.as_mut(),
        )
    }

    /// Zeroes D, W and the color accumulator of every voxel.
    pub fn reset(&mut self) {
        self.tsdf.fill(0.0);
        self.weight.fill(0.0);
        if let Some(color) = self.color.as_mut() {
            color.fill(VoxelColor::default());
        }
    }

    /// Number of voxels with W > 0.
    pub fn observed_voxels(&self) -> usize {
        self.weight.iter().filter(|w| **w > 0.0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.weight.iter().all(|w| *w == 0.0)
    }

    fn is_surface_voxel(&self, index: (usize, usize, usize)) -> bool {
        self.weight[index] > 0.0 && self.tsdf[index].abs() < self.truncation
    }

    /// Voxel aligned shift, in voxels, that moves the center nearest to `new_center`.
    pub fn voxel_shift(&self, new_center: &Vector3<f32>) -> [i64; 3] {
        let offset = (new_center - self.grid.center()) / self.grid.voxel_size;
        [
            offset[0].round() as i64,
            offset[1].round() as i64,
            offset[2].round() as i64,
        ]
    }

    fn survives(&self, index: (usize, usize, usize), shift: &[i64; 3]) -> bool {
        let index = [index.0, index.1, index.2];
        (0..3).all(|c| {
            let new_index = index[c] as i64 - shift[c];
            new_index >= 0 && new_index < self.grid.dims[c] as i64
        })
    }

    /// Fraction of the near-surface voxels that a shift would discard.
    pub fn surface_discard_fraction(&self, shift: &[i64; 3]) -> f32 {
        let mut total = 0usize;
        let mut discarded = 0usize;
        for (index, weight) in self.weight.indexed_iter() {
            if *weight > 0.0 && self.tsdf[index].abs() < self.truncation {
                total += 1;
                if !self.survives(index, shift) {
                    discarded += 1;
                }
            }
        }
        if total == 0 {
            0.0
        } else {
            discarded as f32 / total as f32
        }
    }

    /// Moves the volume by a whole number of voxels.
    /// Voxels leaving the box are dropped and entering ones start zeroed.
    pub fn shift(&mut self, shift: [i64; 3]) -> RecenterSummary {
        let dims = self.grid.dims;
        let shape = (dims[0], dims[1], dims[2]);

        let mut discarded_voxels = 0;
        let mut discarded_surface_voxels = 0;
        for (index, weight) in self.weight.indexed_iter() {
            if *weight > 0.0 && !self.survives(index, &shift) {
                discarded_voxels += 1;
                if self.is_surface_voxel(index) {
                    discarded_surface_voxels += 1;
                }
            }
        }

        let source = |i: usize, j: usize, k: usize| -> Option<(usize, usize, usize)> {
            let si = i as i64 + shift[0];
            let sj = j as i64 + shift[1];
            let sk = k as i64 + shift[2];
            let inside = si >= 0
                && sj >= 0
                && sk >= 0
                && si < dims[0] as i64
                && sj < dims[1] as i64
                && sk < dims[2] as i64;
            if inside {
                Some((si as usize, sj as usize, sk as usize))
            } else {
                None
            }
        };

        let tsdf = &self.tsdf;
        self.tsdf = Array3::from_shape_fn(shape, |(i, j, k)| {
            source(i, j, k).map_or(0.0, |src| tsdf[src])
        });
        let weight = &self.weight;
        self.weight = Array3::from_shape_fn(shape, |(i, j, k)| {
            source(i, j, k).map_or(0.0, |src| weight[src])
        });
        if let Some(color) = self.color.as_ref() {
            let shifted = Array3::from_shape_fn(shape, |(i, j, k)| {
                source(i, j, k).map_or(VoxelColor::default(), |src| color[src])
            });
            self.color = Some(shifted);
        }

        self.grid.origin += Vector3::new(shift[0] as f32, shift[1] as f32, shift[2] as f32)
            * self.grid.voxel_size;

        let summary = RecenterSummary {
            shift,
            new_center: self.grid.center(),
            discarded_voxels,
            discarded_surface_voxels,
        };
        info!(
            shift = ?summary.shift,
            discarded = summary.discarded_voxels,
            "volume recentered"
        );
        summary
    }

    /// Translates the volume center towards `new_center`, snapped to the voxel grid.
    pub fn recenter(&mut self, new_center: &Vector3<f32>) -> RecenterSummary {
        let shift = self.voxel_shift(new_center);
        self.shift(shift)
    }

    fn observed(&self, i: usize, j: usize, k: usize) -> Option<f32> {
        let index = (i, j, k);
        if self.weight[index] > 0.0 {
            Some(self.tsdf[index])
        } else {
            None
        }
    }

    /// Trilinear cell around a world point: base voxel and fractional offsets.
    fn cell(&self, point: &Vector3<f32>) -> Option<([usize; 3], Vector3<f32>)> {
        let coord = self.grid.grid_coord(point);
        let mut base = [0usize; 3];
        let mut frac = Vector3::zeros();
        for c in 0..3 {
            let floor = coord[c].floor();
            if !(floor >= 0.0 && (floor as usize) + 1 < self.grid.dims[c]) {
                return None;
            }
            base[c] = floor as usize;
            frac[c] = coord[c] - floor;
        }
        Some((base, frac))
    }

    /// Trilinear interpolation of D. `None` if any of the 8 neighbors is unobserved.
    pub fn sample_tsdf(&self, point: &Vector3<f32>) -> Option<f32> {
        let ([i, j, k], frac) = self.cell(point)?;
        let mut value = 0.0;
        for corner in 0..8 {
            let (di, dj, dk) = (corner & 1, (corner >> 1) & 1, (corner >> 2) & 1);
            let d = self.observed(i + di, j + dj, k + dk)?;
            let wx = if di == 1 { frac[0] } else { 1.0 - frac[0] };
            let wy = if dj == 1 { frac[1] } else { 1.0 - frac[1] };
            let wz = if dk == 1 { frac[2] } else { 1.0 - frac[2] };
            value += d * wx * wy * wz;
        }
        Some(value)
    }

    /// Central difference gradient of D, pointing away from the surface interior.
    pub fn sample_gradient(&self, point: &Vector3<f32>) -> Option<Vector3<f32>> {
        let h = self.grid.voxel_size;
        let mut gradient = Vector3::zeros();
        for c in 0..3 {
            let mut offset = Vector3::zeros();
            offset[c] = h;
            let forward = self.sample_tsdf(&(point + offset))?;
            let backward = self.sample_tsdf(&(point - offset))?;
            gradient[c] = (forward - backward) / (2.0 * h);
        }
        Some(gradient)
    }

    /// Finite difference gradient of D at a voxel, one sided near unobserved neighbors.
    pub fn voxel_gradient(&self, i: usize, j: usize, k: usize) -> Vector3<f32> {
        let index = [i, j, k];
        let center = self.tsdf[(i, j, k)];
        let mut gradient = Vector3::zeros();
        for c in 0..3 {
            let at = |delta: i64| -> Option<f32> {
                let pos = index[c] as i64 + delta;
                if pos < 0 || pos >= self.grid.dims[c] as i64 {
                    return None;
                }
                let mut neighbor = index;
                neighbor[c] = pos as usize;
                self.observed(neighbor[0], neighbor[1], neighbor[2])
            };
            gradient[c] = match (at(-1), at(1)) {
                (Some(before), Some(after)) => (after - before) * 0.5,
                (None, Some(after)) => after - center,
                (Some(before), None) => center - before,
                (None, None) => 0.0,
            };
        }
        gradient / self.grid.voxel_size
    }

    /// Trilinear interpolation of the color accumulator, weighted by the color weights.
    pub fn sample_color(&self, point: &Vector3<f32>) -> Option<[f32; 3]> {
        let colors = self.color.as_ref()?;
        let ([i, j, k], frac) = self.cell(point)?;
        let mut rgb = [0.0f32; 3];
        let mut total = 0.0f32;
        for corner in 0..8 {
            let (di, dj, dk) = (corner & 1, (corner >> 1) & 1, (corner >> 2) & 1);
            let voxel = colors[(i + di, j + dj, k + dk)];
            let wx = if di == 1 { frac[0] } else { 1.0 - frac[0] };
            let wy = if dj == 1 { frac[1] } else { 1.0 - frac[1] };
            let wz = if dk == 1 { frac[2] } else { 1.0 - frac[2] };
            let w = voxel.weight * wx * wy * wz;
            for c in 0..3 {
                rgb[c] += voxel.rgb[c] * w;
            }
            total += w;
        }
        if total > 0.0 {
            Some([rgb[0] / total, rgb[1] / total, rgb[2] / total])
        } else {
            None
        }
    }

    /// Marks the depth pixels whose 3D point, placed by `pose`, lies inside the volume.
    pub fn inner_pixel_mask(&self, frame: &DepthFrame, pose: &Pose) -> Array2<bool> {
        let intrinsics = frame.intrinsics();
        Array2::from_shape_fn((frame.height(), frame.width()), |(row, col)| {
            frame.get(row, col).map_or(false, |z| {
                let point = intrinsics.backproject(col as f32, row as f32, z);
                self.grid.contains(&pose.transform_vector(&point))
            })
        })
    }

    /// Largest |D| and W over all voxels.
    pub fn value_bounds(&self) -> (f32, f32) {
        let max_abs_tsdf = self.tsdf.iter().fold(0.0f32, |acc, d| acc.max(d.abs()));
        let max_weight = self.weight.iter().fold(0.0f32, |acc, w| acc.max(*w));
        (max_abs_tsdf, max_weight)
    }
}
