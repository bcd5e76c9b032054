use std::sync::{Arc, PoisonError, RwLock};
use std::thread::JoinHandle;

use nalgebra::Vector3;
use ndarray::Array2;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::ColorizeParams;
use crate::error::Result;
use crate::keyframe::Keyframe;
use crate::mesh::Mesh;
use crate::sync::CancelToken;
use crate::volume::Volume;

/// Color of vertices no source observed.
const UNSEEN_COLOR: [u8; 3] = [128, 128, 128];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorizeStatus {
    Completed,
    /// Stopped early, the mesh keeps its previous colors.
    Canceled,
    /// Nothing to colorize from, the mesh keeps its previous colors.
    Skipped,
}

#[derive(Clone, Debug)]
pub struct ColorizeOutcome {
    pub mesh: Mesh,
    pub status: ColorizeStatus,
}

/// One-shot completion of a colorization stage.
pub type ColorizeHandler = Box<dyn FnOnce(ColorizeOutcome) + Send + 'static>;

#[derive(Clone, Copy, Default)]
struct Accumulator {
    rgb: [f32; 3],
    weight: f32,
    from_first: bool,
}

/// Attaches vertex colors to extracted meshes.
#[derive(Clone, Debug)]
pub struct Colorizer {
    pub params: ColorizeParams,
    /// Truncation band of the volume, the default occlusion tolerance.
    truncation: f32,
}

impl Colorizer {
    pub fn new(params: ColorizeParams, truncation: f32) -> Self {
        Self { params, truncation }
    }

    fn occlusion_tolerance(&self) -> f32 {
        self.params.occlusion_tolerance.unwrap_or(self.truncation)
    }

    /// Colors from the per voxel color accumulator.
    ///
    /// Vertices without observed color get a neutral gray. The result only
    /// depends on the mesh and the volume content.
    pub fn preview(&self, mesh: &Mesh, volume: &Volume) -> Mesh {
        let colors: Vec<[u8; 3]> = (0..mesh.len_vertices())
            .into_par_iter()
            .map(|v| {
                volume
                    .sample_color(&mesh.vertex(v))
                    .map_or(UNSEEN_COLOR, |rgb| rgb.map(|c| c.round().clamp(0.0, 255.0) as u8))
            })
            .collect();

        let mut colored = mesh.clone();
        colored.colors = Some(to_color_array(&colors));
        info!(vertices = mesh.len_vertices(), "preview colorization");
        colored
    }

    /// Blends keyframe colors onto the vertices.
    ///
    /// A keyframe contributes to a vertex facing it whose projection lands
    /// inside the image and, when the keyframe kept its depth, agrees with
    /// that depth within the occlusion tolerance. Contributions are weighted
    /// by the cosine between the normal and the direction to the camera.
    /// The cancel token is checked between keyframes.
    pub fn enhanced(
        &self,
        mesh: &Mesh,
        keyframes: &[Arc<Keyframe>],
        cancel: &CancelToken,
    ) -> ColorizeOutcome {
        if keyframes.is_empty() || mesh.len_vertices() == 0 {
            return ColorizeOutcome {
                mesh: mesh.clone(),
                status: ColorizeStatus::Skipped,
            };
        }

        let tolerance = self.occlusion_tolerance();
        let mut accumulators = vec![Accumulator::default(); mesh.len_vertices()];
        for (index, keyframe) in keyframes.iter().enumerate() {
            if cancel.is_canceled() {
                info!(processed = index, "enhanced colorization canceled");
                return ColorizeOutcome {
                    mesh: mesh.clone(),
                    status: ColorizeStatus::Canceled,
                };
            }

            let is_first = index == 0;
            accumulators
                .par_iter_mut()
                .enumerate()
                .for_each(|(v, accumulator)| {
                    let (rgb, weight) =
                        match sample_keyframe(keyframe, &mesh.vertex(v), &mesh.normal(v), tolerance)
                        {
                            Some(sample) => sample,
                            None => return,
                        };
                    if self.params.prioritize_first_keyframe {
                        if accumulator.from_first {
                            return;
                        }
                        if is_first {
                            *accumulator = Accumulator {
                                rgb: [0.0; 3],
                                weight: 0.0,
                                from_first: true,
                            };
                        }
                    }
                    for c in 0..3 {
                        accumulator.rgb[c] += rgb[c] as f32 * weight;
                    }
                    accumulator.weight += weight;
                });
            debug!(keyframe = index, "keyframe blended");
        }

        let colors: Vec<[u8; 3]> = accumulators
            .iter()
            .enumerate()
            .map(|(v, accumulator)| {
                if accumulator.weight > 0.0 {
                    accumulator
                        .rgb
                        .map(|c| (c / accumulator.weight).round().clamp(0.0, 255.0) as u8)
                } else {
                    mesh.color(v).unwrap_or(UNSEEN_COLOR)
                }
            })
            .collect();
        let seen = accumulators.iter().filter(|a| a.weight > 0.0).count();
        info!(
            keyframes = keyframes.len(),
            vertices = mesh.len_vertices(),
            seen,
            "enhanced colorization"
        );

        let mut colored = mesh.clone();
        colored.colors = Some(to_color_array(&colors));
        ColorizeOutcome {
            mesh: colored,
            status: ColorizeStatus::Completed,
        }
    }
}

fn to_color_array(colors: &[[u8; 3]]) -> Array2<u8> {
    Array2::from_shape_fn((colors.len(), 3), |(v, c)| colors[v][c])
}

/// Color and blend weight of a vertex seen by a keyframe.
fn sample_keyframe(
    keyframe: &Keyframe,
    vertex: &Vector3<f32>,
    normal: &Vector3<f32>,
    tolerance: f32,
) -> Option<([u8; 3], f32)> {
    let camera_pose = keyframe.color_camera_pose();
    let to_camera = (camera_pose.translation() - vertex).try_normalize(1e-9)?;
    let weight = normal.dot(&to_camera);
    if weight <= 0.0 {
        return None;
    }

    if let Some(depth) = &keyframe.depth {
        let point = keyframe.pose.inverse_transform_vector(vertex);
        let (row, col) = depth.intrinsics().project_to_pixel(&point)?;
        let observed = depth.get(row, col)?;
        if (observed - point[2]).abs() > tolerance {
            return None;
        }
    }

    let point = camera_pose.inverse_transform_vector(vertex);
    let color = &keyframe.color;
    let (row, col) = color.intrinsics.project_to_pixel(&point)?;
    if row >= color.height() || col >= color.width() {
        return None;
    }
    Some((color.rgb(row, col), weight))
}

/// Background preview-then-enhanced colorization with independent completions.
pub struct ColorizeTask {
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl ColorizeTask {
    /// Starts colorizing `mesh` on its own thread.
    ///
    /// `preview_done` runs once the voxel colors are attached, `enhanced_done`
    /// once the keyframe pass completed, was canceled or skipped.
    pub fn spawn(
        colorizer: Colorizer,
        mesh: Mesh,
        volume: Arc<RwLock<Volume>>,
        keyframes: Vec<Arc<Keyframe>>,
        preview_done: ColorizeHandler,
        enhanced_done: ColorizeHandler,
    ) -> Result<Self> {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let handle = std::thread::Builder::new()
            .name("colorize".to_string())
            .spawn(move || {
                let preview = {
                    let volume = volume.read().unwrap_or_else(PoisonError::into_inner);
                    colorizer.preview(&mesh, &volume)
                };
                preview_done(ColorizeOutcome {
                    mesh: preview.clone(),
                    status: ColorizeStatus::Completed,
                });
                enhanced_done(colorizer.enhanced(&preview, &keyframes, &token));
            })?;
        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Blocks until both completions ran.
    pub fn wait(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ColorizeTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel.cancel();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraIntrinsics;
    use crate::config::{FusionParams, VolumeParams};
    use crate::fusion::TsdfFusion;
    use crate::marching_cubes::MarchingCubes;
    use crate::transform::Pose;
    use crate::unit_test::{plane_color_frame, plane_depth_frame, small_intrinsics};
    use rstest::rstest;

    fn colored_plane_scan(intrinsics: &CameraIntrinsics) -> (Volume, Mesh, Keyframe) {
        let params = VolumeParams::default()
            .with_center([0.0, 0.0, 0.4])
            .with_size(0.9)
            .with_resolution(48);
        let mut volume = Volume::new(&params, &FusionParams::default()).unwrap();
        let depth = Arc::new(plane_depth_frame(intrinsics, 0.55, 0.0));
        let color = Arc::new(plane_color_frame(intrinsics, [200, 40, 10], 0.0));
        let frame = crate::range_image::RangeImage::depth_pyramid(&depth, 1, 0.1, 5.0)
            .remove(0);
        TsdfFusion::default()
            .integrate(&mut volume, &frame, Some(&color), &Pose::eye(), 1.0)
            .unwrap();
        let mesh = MarchingCubes::default().extract(&volume);
        let keyframe = Keyframe::new(Pose::eye(), color, Some(depth));
        (volume, mesh, keyframe)
    }

    #[rstest]
    fn preview_should_use_voxel_colors(small_intrinsics: CameraIntrinsics) {
        let (volume, mesh, _) = colored_plane_scan(&small_intrinsics);
        let colorizer = Colorizer::new(ColorizeParams::default(), volume.truncation());
        let first = colorizer.preview(&mesh, &volume);
        let second = colorizer.preview(&first, &volume);
        assert_eq!(first.colors, second.colors);

        let colors = first.colors.unwrap();
        assert_eq!(colors.nrows(), mesh.len_vertices());
        assert!(colors.rows().into_iter().all(|rgb| rgb[0] == 200 && rgb[1] == 40));
    }

    #[rstest]
    fn enhanced_should_blend_keyframes(small_intrinsics: CameraIntrinsics) {
        let (volume, mesh, keyframe) = colored_plane_scan(&small_intrinsics);
        let colorizer = Colorizer::new(ColorizeParams::default(), volume.truncation());
        let outcome = colorizer.enhanced(&mesh, &[Arc::new(keyframe)], &CancelToken::new());
        assert_eq!(outcome.status, ColorizeStatus::Completed);
        let colors = outcome.mesh.colors.unwrap();
        let seen = colors
            .rows()
            .into_iter()
            .filter(|rgb| rgb.to_vec() == [200u8, 40, 10])
            .count();
        assert!(seen > mesh.len_vertices() * 9 / 10);
    }

    #[rstest]
    fn enhanced_should_reject_occluded(small_intrinsics: CameraIntrinsics) {
        let (volume, mesh, _) = colored_plane_scan(&small_intrinsics);
        // The keyframe saw something much closer than the surface.
        let depth = Arc::new(plane_depth_frame(&small_intrinsics, 0.3, 0.0));
        let color = Arc::new(plane_color_frame(&small_intrinsics, [0, 0, 255], 0.0));
        let keyframe = Arc::new(Keyframe::new(Pose::eye(), color, Some(depth)));
        let colorizer = Colorizer::new(ColorizeParams::default(), volume.truncation());
        let outcome = colorizer.enhanced(&mesh, &[keyframe.clone()], &CancelToken::new());
        let colors = outcome.mesh.colors.unwrap();
        assert!(colors.rows().into_iter().all(|rgb| rgb.to_vec() == UNSEEN_COLOR.to_vec()));

        // Unseen vertices of a previewed mesh keep their volume color.
        let preview = colorizer.preview(&mesh, &volume);
        let outcome = colorizer.enhanced(&preview, &[keyframe], &CancelToken::new());
        assert_eq!(outcome.mesh.colors, preview.colors);
    }

    #[rstest]
    fn enhanced_should_degrade(small_intrinsics: CameraIntrinsics) {
        let (volume, mesh, keyframe) = colored_plane_scan(&small_intrinsics);
        let colorizer = Colorizer::new(ColorizeParams::default(), volume.truncation());
        let preview = colorizer.preview(&mesh, &volume);

        let outcome = colorizer.enhanced(&preview, &[], &CancelToken::new());
        assert_eq!(outcome.status, ColorizeStatus::Skipped);
        assert_eq!(outcome.mesh, preview);

        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = colorizer.enhanced(&preview, &[Arc::new(keyframe)], &cancel);
        assert_eq!(outcome.status, ColorizeStatus::Canceled);
        assert_eq!(outcome.mesh, preview);
    }

    #[rstest]
    fn task_should_complete_both_stages(small_intrinsics: CameraIntrinsics) {
        let (volume, mesh, keyframe) = colored_plane_scan(&small_intrinsics);
        let colorizer = Colorizer::new(ColorizeParams::default(), volume.truncation());
        let (sender, receiver) = std::sync::mpsc::channel();
        let preview_sender = sender.clone();
        let task = ColorizeTask::spawn(
            colorizer,
            mesh,
            Arc::new(RwLock::new(volume)),
            vec![Arc::new(keyframe)],
            Box::new(move |outcome| preview_sender.send(("preview", outcome.status)).unwrap()),
            Box::new(move |outcome| sender.send(("enhanced", outcome.status)).unwrap()),
        )
        .unwrap();
        task.wait();
        let stages: Vec<_> = receiver.iter().collect();
        assert_eq!(
            stages,
            vec![
                ("preview", ColorizeStatus::Completed),
                ("enhanced", ColorizeStatus::Completed)
            ]
        );
    }
}
