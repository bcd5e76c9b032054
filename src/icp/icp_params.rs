use crate::config::TrackerParams;

/// Parameters of one projective ICP run.
#[derive(Debug, Clone)]
pub struct IcpParams {
    /// Iterations per pyramid level, finest level first.
    pub pyramid_iterations: Vec<usize>,
    /// Correspondences farther apart than this are rejected.
    pub max_distance: f32,
    /// Correspondences whose normals differ by more than this angle (radians) are rejected.
    pub max_normal_angle: f32,
}

impl Default for IcpParams {
    fn default() -> Self {
        Self::from_tracker(&TrackerParams::default(), TrackerParams::default().max_distance)
    }
}

impl IcpParams {
    pub fn from_tracker(params: &TrackerParams, max_distance: f32) -> Self {
        Self {
            pyramid_iterations: params.pyramid_iterations.clone(),
            max_distance,
            max_normal_angle: params.max_normal_angle,
        }
    }

    pub fn max_distance(&'_ mut self, value: f32) -> &'_ mut IcpParams {
        self.max_distance = value;
        self
    }

    pub fn pyramid_iterations(&'_ mut self, value: Vec<usize>) -> &'_ mut IcpParams {
        self.pyramid_iterations = value;
        self
    }
}
