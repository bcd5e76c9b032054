use tracing::{debug, info, warn};

use crate::camera::CameraIntrinsics;
use crate::colorize::{ColorizeHandler, ColorizeTask};
use crate::config::ScanConfig;
use crate::error::{Error, Result};
use crate::frame::{ColorFrame, RawDepthFrame};
use crate::marching_cubes::MarchingCubes;
use crate::mesh::Mesh;
use crate::pipeline::{MeshExtraction, ScanEvent, ScanPipeline};
use crate::preview::PreviewRenderer;
use crate::session::Session;
use crate::tracker::TrackerStatus;
use crate::viewer::{DisplayMode, MeshViewDelegate, MeshViewer};

/// Near and far planes of the viewer projection, in meters.
const VIEWER_NEAR: f32 = 0.01;
const VIEWER_FAR: f32 = 10.0;

const VOLUME_EXCEEDED_MESSAGE: &str = "Scan volume exceeded";

enum Stage {
    Idle,
    Scanning(ScanPipeline),
    /// The scan finished and its mesh is in the viewer.
    Viewing(Session),
}

/// Drives a scan from sensor setup to the mesh viewer.
///
/// Owns the session while scanning and viewing; the viewer reaches back
/// through [`MeshViewDelegate`].
pub struct ScanController<V: MeshViewer> {
    config: ScanConfig,
    viewer: V,
    stage: Stage,
    colorize: Option<ColorizeTask>,
    message: Option<&'static str>,
}

impl<V: MeshViewer> ScanController<V> {
    pub fn new(config: ScanConfig, viewer: V) -> Self {
        Self {
            config,
            viewer,
            stage: Stage::Idle,
            colorize: None,
            message: None,
        }
    }

    pub fn viewer(&self) -> &V {
        &self.viewer
    }

    pub fn viewer_mut(&mut self) -> &mut V {
        &mut self.viewer
    }

    pub fn is_scanning(&self) -> bool {
        matches!(self.stage, Stage::Scanning(_))
    }

    /// The finished session, while its mesh is being viewed.
    pub fn session(&self) -> Option<&Session> {
        match &self.stage {
            Stage::Viewing(session) => Some(session),
            _ => None,
        }
    }

    /// Starts a new session for the sensor calibration, tearing down any previous one.
    pub fn setup_slam(&mut self, calibration: CameraIntrinsics) -> Result<()> {
        self.clear_slam();
        let session = Session::new(self.config.clone(), calibration)?;
        self.stage = Stage::Scanning(ScanPipeline::start(session)?);
        info!("SLAM set up");
        Ok(())
    }

    /// Restarts scanning with the same calibration.
    pub fn reset_slam(&mut self) -> Result<()> {
        self.colorize = None;
        self.message = None;
        self.viewer.hide_message();
        match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::Idle => {
                debug!("reset without a session");
            }
            Stage::Scanning(pipeline) => {
                pipeline.reset();
                self.stage = Stage::Scanning(pipeline);
            }
            Stage::Viewing(mut session) => {
                session.reset()?;
                self.stage = Stage::Scanning(ScanPipeline::start(session)?);
            }
        }
        Ok(())
    }

    /// Tears the session down, keyframes included.
    pub fn clear_slam(&mut self) {
        self.colorize = None;
        self.message = None;
        if !matches!(self.stage, Stage::Idle) {
            info!("SLAM cleared");
        }
        self.stage = Stage::Idle;
    }

    /// Delivers a sensor frame.
    ///
    /// # Returns
    ///
    /// Whether the frame was queued for tracking. `Error::Setup` if no
    /// scan is running.
    pub fn process_depth_frame(&mut self, depth: RawDepthFrame, color: Option<ColorFrame>) -> Result<bool> {
        match &mut self.stage {
            Stage::Scanning(pipeline) => Ok(pipeline.push_frame(depth, color)),
            _ => Err(Error::setup("no scan is running")),
        }
    }

    /// Renderer of the volume from the latest tracked pose, while scanning.
    pub fn preview_renderer(&self) -> Option<PreviewRenderer> {
        match &self.stage {
            Stage::Scanning(pipeline) => Some(PreviewRenderer::new(
                pipeline.shared_volume(),
                pipeline.pose_cell(),
                self.calibration()?.clone(),
            )),
            _ => None,
        }
    }

    fn calibration(&self) -> Option<&CameraIntrinsics> {
        match &self.stage {
            Stage::Scanning(pipeline) => Some(pipeline.calibration()),
            Stage::Viewing(session) => Some(session.calibration()),
            Stage::Idle => None,
        }
    }

    /// Drains the worker's notifications and updates the viewer message.
    pub fn poll_events(&mut self) -> Vec<ScanEvent> {
        let events: Vec<ScanEvent> = match &self.stage {
            Stage::Scanning(pipeline) => pipeline.events().try_iter().collect(),
            _ => return Vec::new(),
        };

        let mut message = self.message;
        for event in &events {
            match event {
                ScanEvent::Tracked(frame) => {
                    message = if frame.volume_exceeded {
                        Some(VOLUME_EXCEEDED_MESSAGE)
                    } else {
                        frame.tracked.status.user_message()
                    }
                }
                ScanEvent::Lost { .. } => message = TrackerStatus::ModelLost.user_message(),
                ScanEvent::Reset => message = None,
                _ => (),
            }
        }
        if message != self.message {
            match message {
                Some(text) => self.viewer.show_message(text),
                None => self.viewer.hide_message(),
            }
            self.message = message;
        }
        events
    }

    /// Stops scanning, extracts the mesh and hands it to the viewer.
    pub fn finish_scan(&mut self) -> Result<()> {
        let pipeline = match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::Scanning(pipeline) => pipeline,
            other => {
                self.stage = other;
                return Err(Error::setup("no scan is running"));
            }
        };
        let session = pipeline.finish()?;

        let mesh = MeshExtraction::spawn(session.shared_volume(), MarchingCubes::default())?.wait();
        let center = session.read_volume().center();
        let color_enabled = !session.keyframes().is_empty();
        info!(
            vertices = mesh.len_vertices(),
            faces = mesh.len_faces(),
            keyframes = session.keyframes().len(),
            "scan finished"
        );

        self.viewer.hide_message();
        self.message = None;
        self.viewer
            .set_camera_projection_matrix(session.calibration().gl_projection_matrix(VIEWER_NEAR, VIEWER_FAR));
        self.viewer.reset_mesh_center(center);
        self.viewer.set_color_enabled(color_enabled);
        self.viewer.set_display_mode(DisplayMode::Shaded);
        self.viewer.set_mesh(mesh);
        self.stage = Stage::Viewing(session);
        Ok(())
    }

    pub fn is_colorizing(&self) -> bool {
        self.colorize.as_ref().map_or(false, |task| !task.is_finished())
    }

    /// Blocks until the running colorization called both its handlers.
    pub fn wait_colorizing(&mut self) {
        if let Some(task) = self.colorize.take() {
            task.wait();
        }
    }
}

impl<V: MeshViewer> MeshViewDelegate for ScanController<V> {
    fn mesh_view_will_dismiss(&mut self) {
        if let Some(task) = &self.colorize {
            task.cancel();
        }
    }

    fn mesh_view_did_dismiss(&mut self) {
        if let Err(err) = self.reset_slam() {
            warn!(%err, "restarting the scan failed");
        }
    }

    fn mesh_view_did_request_colorizing(
        &mut self,
        mesh: Mesh,
        preview_done: ColorizeHandler,
        enhanced_done: ColorizeHandler,
    ) -> bool {
        let session = match &self.stage {
            Stage::Viewing(session) => session,
            _ => {
                warn!("colorizing requested without a finished scan");
                return false;
            }
        };
        // Replacing a running task cancels it.
        self.colorize = None;
        match ColorizeTask::spawn(
            session.colorizer(),
            mesh,
            session.shared_volume(),
            session.keyframe_snapshot(),
            preview_done,
            enhanced_done,
        ) {
            Ok(task) => {
                self.colorize = Some(task);
                true
            }
            Err(err) => {
                warn!(%err, "could not start colorizing");
                false
            }
        }
    }
}
