use nalgebra::{RealField, Vector3};

/// Returns the angle between two normals in radians.
///
/// # Arguments
///
/// * lfs - Left normal.
/// * rfs - Right normal.
///
/// # Returns
///
/// * Angle between the two normals in radians.
pub fn angle_between_normals<T: RealField + Copy>(lfs: &Vector3<T>, rfs: &Vector3<T>) -> T {
    let dot = lfs.dot(rfs);
    dot.clamp(-T::one(), T::one()).acos().abs()
}

/// Angle between two non-unit vectors in radians.
pub fn angle_between_vecs(lfs: &Vector3<f32>, rfs: &Vector3<f32>) -> f32 {
    let norm = lfs.norm() * rfs.norm();
    if norm <= f32::EPSILON {
        return 0.0;
    }
    (lfs.dot(rfs) / norm).clamp(-1.0, 1.0).acos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_angles() {
        let x = Vector3::new(1.0f32, 0.0, 0.0);
        let y = Vector3::new(0.0f32, 2.0, 0.0);
        assert_abs_diff_eq!(angle_between_vecs(&x, &y), std::f32::consts::FRAC_PI_2);
        assert_abs_diff_eq!(angle_between_normals(&x, &x), 0.0);
        // Rounding above one must not produce NaN.
        assert_abs_diff_eq!(angle_between_normals(&x, &(x * 1.000001)), 0.0);
    }
}
