mod icp_params;
pub use icp_params::IcpParams;
mod cost_function;
pub use cost_function::{PhotometricDistance, PointPlaneDistance};
mod projective_icp;
pub use projective_icp::{IcpEstimate, ProjectiveIcp};
mod photometric;
pub use photometric::{IntensityView, PhotometricTerm};
