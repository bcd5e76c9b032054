use ndarray::{Array2, Array3, ArrayView2, ArrayView3};

/// Index of the valid sample of a 2x2 block nearest to the block's mean point.
fn block_representative(
    src_v: usize,
    src_u: usize,
    src_mask: &ArrayView2<u8>,
    src_points: &ArrayView3<f32>,
) -> Option<(usize, usize)> {
    let mut candidates = [(0, 0); 4];
    let mut count = 0;
    let mut mean = [0.0f32; 3];
    for i in 0..2 {
        for j in 0..2 {
            let (i, j) = (src_v + i, src_u + j);
            if src_mask[[i, j]] == 1 {
                candidates[count] = (i, j);
                count += 1;
                for (c, m) in mean.iter_mut().enumerate() {
                    *m += src_points[(i, j, c)];
                }
            }
        }
    }
    if count == 0 {
        return None;
    }
    mean.iter_mut().for_each(|m| *m /= count as f32);

    let mut min_dist = f32::MAX;
    let mut nearest = candidates[0];
    for &(i, j) in candidates[..count].iter() {
        let dist: f32 = (0..3)
            .map(|c| {
                let diff = src_points[(i, j, c)] - mean[c];
                diff * diff
            })
            .sum();
        if dist < min_dist {
            min_dist = dist;
            nearest = (i, j);
        }
    }

    Some(nearest)
}

/// Halves a range grid. Each output sample is the input sample nearest to the
/// mean of its 2x2 block, so depth discontinuities are not blended.
/// The normals, when given, follow the chosen samples.
pub fn halve_range_grid(
    src_points: &ArrayView3<f32>,
    src_mask: &ArrayView2<u8>,
    src_normals: Option<&ArrayView3<f32>>,
) -> (Array3<f32>, Array2<u8>, Option<Array3<f32>>) {
    let (src_height, src_width) = (src_points.shape()[0], src_points.shape()[1]);
    let (dst_height, dst_width) = (src_height / 2, src_width / 2);

    let mut dst_points = Array3::zeros((dst_height, dst_width, 3));
    let mut dst_mask = Array2::zeros((dst_height, dst_width));
    let mut dst_normals = src_normals.map(|_| Array3::zeros((dst_height, dst_width, 3)));

    for dst_v in 0..dst_height {
        for dst_u in 0..dst_width {
            let (i, j) = match block_representative(dst_v * 2, dst_u * 2, src_mask, src_points) {
                Some(value) => value,
                None => continue,
            };

            dst_mask[(dst_v, dst_u)] = 1;
            for c in 0..3 {
                dst_points[(dst_v, dst_u, c)] = src_points[(i, j, c)];
            }
            if let (Some(dst), Some(src)) = (dst_normals.as_mut(), src_normals) {
                for c in 0..3 {
                    dst[(dst_v, dst_u, c)] = src[(i, j, c)];
                }
            }
        }
    }

    (dst_points, dst_mask, dst_normals)
}
