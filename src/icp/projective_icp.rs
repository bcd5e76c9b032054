use itertools::izip;
use nalgebra::Vector6;
use rayon::prelude::*;

use super::cost_function::PointPlaneDistance;
use super::IcpParams;
use crate::optim::GaussNewton;
use crate::range_image::RangeImage;
use crate::transform::Pose;
use crate::trig::angle_between_normals;

/// Smallest update norm considered a change of the estimate.
const CONVERGENCE_EPSILON: f32 = 1e-6;

/// Outcome of aligning a frame against the predicted model.
#[derive(Clone, Debug)]
pub struct IcpEstimate {
    /// Camera to world pose.
    pub pose: Pose,
    /// RMS point-to-plane residual at the finest level, in meters.
    pub residual: f32,
    /// Number of accepted correspondences at the finest level.
    pub inliers: usize,
    /// Number of valid source points at the finest level.
    pub valid_points: usize,
    /// Condition number of the final normal equations.
    pub condition_number: f64,
    /// Normal equations of the final estimate.
    pub system: GaussNewton<6>,
}

impl IcpEstimate {
    pub fn inlier_fraction(&self) -> f32 {
        if self.valid_points == 0 {
            0.0
        } else {
            self.inliers as f32 / self.valid_points as f32
        }
    }
}

/// Point-to-plane ICP with projective data association against a surface
/// predicted from the volume.
///
/// The model pyramid holds world frame points laid out in the image grid
/// of a camera at `model_pose`.
pub struct ProjectiveIcp<'model> {
    pub params: IcpParams,
    model: &'model [RangeImage],
    model_pose: Pose,
}

impl<'model> ProjectiveIcp<'model> {
    pub fn new(params: IcpParams, model: &'model [RangeImage], model_pose: Pose) -> Self {
        Self {
            params,
            model,
            model_pose,
        }
    }

    /// Accumulates the point-to-plane normal equations of one pyramid level.
    pub fn linearize(
        &self,
        source: &RangeImage,
        model: &RangeImage,
        pose: &Pose,
    ) -> GaussNewton<6> {
        let max_angle = self.params.max_normal_angle;
        let max_distance = self.params.max_distance;
        let model_pose = &self.model_pose;
        let distance = PointPlaneDistance {};

        (0..source.height())
            .into_par_iter()
            .fold(GaussNewton::<6>::new, |mut gn, row| {
                for col in 0..source.width() {
                    let (point, normal) =
                        match (source.get_point(row, col), source.get_normal(row, col)) {
                            (Some(point), Some(normal)) => (point, normal),
                            _ => continue,
                        };

                    let world_point = pose.transform_vector(&point);
                    let model_pixel = model
                        .intrinsics
                        .project_to_pixel(&model_pose.inverse_transform_vector(&world_point));
                    let (target, target_normal) = match model_pixel.and_then(|(mrow, mcol)| {
                        Some((model.get_point(mrow, mcol)?, model.get_normal(mrow, mcol)?))
                    }) {
                        Some(correspondence) => correspondence,
                        None => continue,
                    };

                    if (target - world_point).norm() > max_distance {
                        continue;
                    }
                    let world_normal = pose.transform_normal(&normal);
                    if angle_between_normals(&world_normal, &target_normal) > max_angle {
                        continue;
                    }

                    let (residual, jacobian) =
                        distance.jacobian(&world_point, &target, &target_normal);
                    gn.step(residual, &jacobian);
                }
                gn
            })
            .reduce(GaussNewton::<6>::new, |mut lhs, rhs| {
                lhs.add(&rhs);
                lhs
            })
    }

    /// Evaluates a pose at the finest level.
    pub fn evaluate(&self, source: &[RangeImage], pose: &Pose) -> Option<IcpEstimate> {
        let (source, model) = (source.first()?, self.model.first()?);
        let system = self.linearize(source, model, pose);
        Some(IcpEstimate {
            pose: *pose,
            residual: system.mean_squared_residual().sqrt(),
            inliers: system.count(),
            valid_points: source.valid_points_count(),
            condition_number: system.condition_number(),
            system,
        })
    }

    /// Aligns the source pyramid (camera frame, finest first) to the model,
    /// running the coarsest level first.
    ///
    /// # Returns
    ///
    /// The estimate at the finest level, `None` if the pyramids are empty.
    pub fn align(&self, source: &[RangeImage], initial: &Pose) -> Option<IcpEstimate> {
        let mut pose = *initial;

        for (source_level, model_level, max_iter) in izip!(
            source.iter(),
            self.model.iter(),
            self.params.pyramid_iterations.iter()
        )
        .rev()
        {
            for _ in 0..*max_iter {
                let system = self.linearize(source_level, model_level, &pose);
                // Fewer terms than unknowns.
                if system.count() < 6 {
                    break;
                }
                let update: Vector6<f32> = match system.solve() {
                    Some(update) => update,
                    None => break,
                };
                pose = Pose::exp(&update) * pose;
                pose.renormalize();
                if update.norm() < CONVERGENCE_EPSILON {
                    break;
                }
            }
        }

        self.evaluate(source, &pose)
    }
}
