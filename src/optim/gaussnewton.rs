use nalgebra::{Cholesky, Const, DMatrix, SMatrix, SVector, SymmetricEigen};

/// Accumulates the normal equations of a Gauss Newton problem and solves it.
///
/// # Type parameters
///
/// * `DIM` - The dimension of the problem.
#[derive(Clone, Debug)]
pub struct GaussNewton<const DIM: usize> {
    hessian: SMatrix<f64, DIM, DIM>,
    gradient: SVector<f64, DIM>,
    squared_residual_sum: f64,
    count: usize,
}

impl<const DIM: usize> Default for GaussNewton<DIM> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const DIM: usize> GaussNewton<DIM> {
    /// Creates a new Gauss Newton optimizer.
    pub fn new() -> Self {
        Self {
            hessian: SMatrix::zeros(),
            gradient: SVector::zeros(),
            squared_residual_sum: 0.0,
            count: 0,
        }
    }

    /// Resets the optimizer.
    pub fn reset(&mut self) {
        self.hessian.fill(0.0);
        self.gradient.fill(0.0);
        self.squared_residual_sum = 0.0;
        self.count = 0;
    }

    /// Adds a residual term.
    ///
    /// # Arguments
    ///
    /// * `residual` - The residual, such that r(x + dx) ≈ r - J dx.
    /// * `jacobian` - The jacobian of the term.
    pub fn step(&mut self, residual: f32, jacobian: &[f32; DIM]) {
        let residual = residual as f64;
        for i in 0..DIM {
            let ival = jacobian[i] as f64;
            self.gradient[i] += ival * residual;

            self.hessian[(i, i)] += ival * ival;
            for j in i + 1..DIM {
                let mul = ival * jacobian[j] as f64;
                self.hessian[(i, j)] += mul;
                self.hessian[(j, i)] += mul;
            }
        }

        self.squared_residual_sum += residual * residual;
        self.count += 1;
    }

    /// Solve the current gauss newton system.
    ///
    /// # Returns
    ///
    /// The update vector, `None` if there are no terms or the system is not positive definite.
    pub fn solve(&self) -> Option<SVector<f32, DIM>> {
        if self.count == 0 {
            return None;
        }

        Cholesky::<f64, Const<DIM>>::new(self.hessian)
            .map(|cholesky| nalgebra::convert(cholesky.solve(&self.gradient)))
    }

    /// Ratio between the largest and smallest eigenvalue of the normal equations.
    /// Infinite for singular systems.
    pub fn condition_number(&self) -> f64 {
        let hessian = DMatrix::from_column_slice(DIM, DIM, self.hessian.as_slice());
        let eigen = SymmetricEigen::new(hessian);
        let (min, max) = eigen
            .eigenvalues
            .iter()
            .fold((f64::INFINITY, 0.0f64), |(min, max), value| {
                (min.min(value.abs()), max.max(value.abs()))
            });
        if min <= f64::EPSILON * max || min == 0.0 {
            f64::INFINITY
        } else {
            max / min
        }
    }

    /// Adds the values of another optimizer to this one.
    /// Use this to combine the state of sub optimizers.
    ///
    /// # Arguments
    ///
    /// * `other` - The other optimizer.
    pub fn add(&mut self, other: &Self) {
        self.hessian += other.hessian;
        self.gradient += other.gradient;
        self.squared_residual_sum += other.squared_residual_sum;
        self.count += other.count;
    }

    /// Adds another optimizer whose cost is scaled by `weight`, e.g. to combine cost terms.
    pub fn add_weighted(&mut self, other: &Self, weight: f32) {
        let weight = weight as f64;
        self.hessian += other.hessian * weight;
        self.gradient += other.gradient * weight;
        self.squared_residual_sum += other.squared_residual_sum * weight;
        self.count += other.count;
    }

    /// Returns the mean squared residual.
    pub fn mean_squared_residual(&self) -> f32 {
        if self.count == 0 {
            return 0.0;
        }
        (self.squared_residual_sum / self.count as f64) as f32
    }

    /// Number of residual terms.
    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix6, Vector6};

    #[test]
    fn test_gauss_newton() {
        let mut gn = GaussNewton::<6>::new();

        gn.step(1.0, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        gn.step(2.0, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        gn.step(3.0, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let j = Vector6::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0);
        let expected_hessian: Matrix6<f64> = j * j.transpose() * 3.0;
        assert_eq!(gn.hessian, expected_hessian);
        assert_eq!(gn.gradient, j * 6.0);
        assert_eq!(gn.count(), 3);
        assert!((gn.mean_squared_residual() - 14.0 / 3.0).abs() < 1e-6);

        // Rank one, no unique solution.
        assert!(gn.solve().is_none() || gn.condition_number() > 1e6);
        assert!(gn.condition_number() > 1e6);
    }

    #[test]
    fn test_solves_linear_least_squares() {
        // Residuals r_i = b_i - a_i . x with x = (1, -2).
        let x = [1.0f32, -2.0];
        let rows = [[1.0f32, 0.0], [0.0, 1.0], [1.0, 1.0], [2.0, -1.0]];
        let mut gn = GaussNewton::<2>::new();
        for a in rows.iter() {
            let b = a[0] * x[0] + a[1] * x[1];
            gn.step(b, a);
        }
        let solution = gn.solve().unwrap();
        assert!((solution[0] - 1.0).abs() < 1e-5);
        assert!((solution[1] + 2.0).abs() < 1e-5);
        assert!(gn.condition_number() < 10.0);
    }

    #[test]
    fn test_add_weighted() {
        let mut a = GaussNewton::<2>::new();
        a.step(1.0, &[1.0, 0.0]);
        let mut b = GaussNewton::<2>::new();
        b.step(1.0, &[0.0, 1.0]);
        a.add_weighted(&b, 0.1);
        assert!((a.hessian[(1, 1)] - 0.1).abs() < 1e-7);
        assert!((a.gradient[1] - 0.1).abs() < 1e-7);
        assert_eq!(a.hessian[(0, 0)], 1.0);
        assert_eq!(a.count(), 2);
    }
}
