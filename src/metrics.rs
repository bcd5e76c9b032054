use crate::{
    error::{Error, Result},
    trajectory::Trajectory,
    transform::Pose,
};

/// Metrics for comparing two poses.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransformMetrics {
    /// Angle between the two poses in radians.
    pub angle: f32,
    /// Translation vector size between the two poses.
    pub translation: f32,
}

impl TransformMetrics {
    /// Creates a new `TransformMetrics` from two poses.
    pub fn new(lhs: &Pose, rhs: &Pose) -> Self {
        let (translation, angle) = lhs.delta_to(rhs);
        Self { angle, translation }
    }

    /// Mean of the per-pose errors of two trajectories of the same length.
    pub fn mean_trajectory_error(
        pred_trajectory: &Trajectory,
        gt_trajectory: &Trajectory,
    ) -> Result<Self> {
        if pred_trajectory.len() != gt_trajectory.len() {
            return Err(Error::invalid_parameter(
                "Pred and GT trajectories have different lengths.",
            ));
        }
        if pred_trajectory.is_empty() {
            return Ok(Self::default());
        }

        let mut accum_metrics = TransformMetrics::default();
        for ((pred, _), (gt, _)) in pred_trajectory.iter().zip(gt_trajectory.iter()) {
            let metrics = Self::new(&pred, &gt);
            accum_metrics.angle += metrics.angle;
            accum_metrics.translation += metrics.translation;
        }

        let count = pred_trajectory.len() as f32;
        accum_metrics.angle /= count;
        accum_metrics.translation /= count;
        Ok(accum_metrics)
    }

    /// Returns the total error of the two poses.
    pub fn total(&self) -> f32 {
        self.angle + self.translation
    }
}

impl std::fmt::Display for TransformMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "angle: {:.2}°, translation: {:.5}",
            self.angle.to_degrees(),
            self.translation
        )
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Vector3;

    use super::*;

    #[test]
    fn test_transform_metrics() {
        let pose = Pose::from_parts(&Vector3::new(0.1, -0.2, 0.3), &Vector3::new(0.0, 0.2, 0.0));
        let same = TransformMetrics::new(&pose, &pose);
        assert!(same.total() < 1e-6);

        let turned = Pose::from_parts(&Vector3::new(0.1, -0.2, 0.3), &Vector3::new(0.0, 0.3, 0.0));
        let metrics = TransformMetrics::new(&pose, &turned);
        assert!((metrics.angle - 0.1).abs() < 1e-4);
        assert!(metrics.translation < 1e-5);
        assert!(format!("{metrics}").starts_with("angle: 5.73°"));
    }

    #[test]
    fn test_mean_trajectory_error() {
        let gt: Trajectory = (0..3)
            .map(|i| (Pose::from_translation(&Vector3::new(i as f32, 0.0, 0.0)), i as f64))
            .collect();
        let pred: Trajectory = gt
            .iter()
            .map(|(pose, time)| {
                (Pose::from_translation(&Vector3::new(0.0, 0.01, 0.0)) * pose, time)
            })
            .collect();
        let metrics = TransformMetrics::mean_trajectory_error(&pred, &gt).unwrap();
        assert!((metrics.translation - 0.01).abs() < 1e-5);
        assert!(metrics.angle < 1e-5);

        assert!(TransformMetrics::mean_trajectory_error(&pred, &gt.slice(0, 1)).is_err());
    }
}
