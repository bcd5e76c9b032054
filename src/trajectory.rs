use std::ops::Index;

use crate::transform::Pose;

/// Sequence of accepted camera poses with their frame timestamps.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trajectory {
    /// Camera poses, transforms points from camera to world.
    pub camera_to_world: Vec<Pose>,
    /// Timestamps of each pose, in seconds.
    pub times: Vec<f64>,
}

impl Trajectory {
    /// Adds a new pose to the trajectory.
    ///
    /// # Arguments
    ///
    /// * `camera_to_world` - Transform from camera to world.
    /// * `time` - Timestamp of the pose.
    pub fn push(&mut self, camera_to_world: Pose, time: f64) {
        self.camera_to_world.push(camera_to_world);
        self.times.push(time);
    }

    pub fn len(&self) -> usize {
        self.camera_to_world.len()
    }

    pub fn is_empty(&self) -> bool {
        self.camera_to_world.is_empty()
    }

    pub fn clear(&mut self) {
        self.camera_to_world.clear();
        self.times.clear();
    }

    /// Returns the transform that takes points from `from_index` camera to `dest_index` camera.
    pub fn get_relative_transform(&self, from_index: usize, dest_index: usize) -> Option<Pose> {
        let from = self.camera_to_world.get(from_index)?;
        let dest = self.camera_to_world.get(dest_index)?;
        Some(dest.inverse() * *from)
    }

    /// Returns the iterator over poses and timestamps.
    pub fn iter(&self) -> impl Iterator<Item = (Pose, f64)> + '_ {
        self.camera_to_world
            .iter()
            .copied()
            .zip(self.times.iter().copied())
    }

    /// Creates a new trajectory with the poses transformed in such a way that the first pose is at origin.
    pub fn first_frame_at_origin(&self) -> Self {
        let first_inv = match self.camera_to_world.first() {
            Some(first) => first.inverse(),
            None => return self.clone(),
        };
        Self {
            camera_to_world: self
                .camera_to_world
                .iter()
                .map(|pose| first_inv * *pose)
                .collect(),
            times: self.times.clone(),
        }
    }

    /// Creates a new trajectory with the given range.
    ///
    /// # Arguments
    ///
    /// * `start` - Inclusive start index of the range.
    /// * `end` - Exclusive end index of the range.
    pub fn slice(&self, start: usize, end: usize) -> Self {
        Self {
            camera_to_world: self.camera_to_world[start..end].to_vec(),
            times: self.times[start..end].to_vec(),
        }
    }

    /// Gets the last pose and timestamp.
    pub fn last(&self) -> Option<(Pose, f64)> {
        Some((*self.camera_to_world.last()?, *self.times.last()?))
    }

    /// Whether the timestamps strictly increase.
    pub fn is_monotonic(&self) -> bool {
        self.times.windows(2).all(|pair| pair[0] < pair[1])
    }
}

impl FromIterator<(Pose, f64)> for Trajectory {
    /// Creates a new trajectory from the `(Pose, f64)` iterator.
    /// Use with the `collect::<Trajectory>` method.
    fn from_iter<T: IntoIterator<Item = (Pose, f64)>>(iter: T) -> Self {
        let mut trajectory = Trajectory::default();
        for (pose, time) in iter {
            trajectory.push(pose, time);
        }
        trajectory
    }
}

impl Index<usize> for Trajectory {
    type Output = Pose;

    fn index(&self, index: usize) -> &Self::Output {
        &self.camera_to_world[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector3;

    fn sample() -> Trajectory {
        (0..4)
            .map(|i| {
                (
                    Pose::from_translation(&Vector3::new(1.0 + i as f32 * 0.1, 0.0, 0.0)),
                    i as f64 / 30.0,
                )
            })
            .collect()
    }

    #[test]
    fn test_first_frame_at_origin() {
        let trajectory = sample().first_frame_at_origin();
        assert!(trajectory[0].is_identity(1e-6));
        assert_abs_diff_eq!(
            trajectory[3].translation(),
            Vector3::new(0.3, 0.0, 0.0),
            epsilon = 1e-6
        );
        assert!(trajectory.is_monotonic());
    }

    #[test]
    fn test_relative_transform() {
        let trajectory = sample();
        let relative = trajectory.get_relative_transform(2, 0).unwrap();
        assert_abs_diff_eq!(
            relative.translation(),
            Vector3::new(0.2, 0.0, 0.0),
            epsilon = 1e-6
        );
        assert!(trajectory.get_relative_transform(0, 9).is_none());
        assert_eq!(trajectory.slice(1, 3).len(), 2);
        assert_eq!(trajectory.last().unwrap().1, 3.0 / 30.0);
    }
}
