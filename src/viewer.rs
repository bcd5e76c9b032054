use nalgebra::{Matrix4, Vector3};

use crate::colorize::ColorizeHandler;
use crate::mesh::Mesh;

/// How the mesh viewer draws the mesh.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DisplayMode {
    #[default]
    Shaded,
    Wireframe,
    /// Vertex colors, when the mesh has them.
    Colored,
}

/// Mesh presentation front-end, driven by the scan controller.
pub trait MeshViewer {
    /// Hands off a completed mesh.
    fn set_mesh(&mut self, mesh: Mesh);

    /// OpenGL style projection of the viewing camera.
    fn set_camera_projection_matrix(&mut self, projection: Matrix4<f32>);

    /// Re-centers the viewing camera on `center`, in world coordinates.
    fn reset_mesh_center(&mut self, center: Vector3<f32>);

    fn set_color_enabled(&mut self, enabled: bool);

    fn set_display_mode(&mut self, mode: DisplayMode);

    fn show_message(&mut self, message: &str);

    fn hide_message(&mut self);
}

/// Callbacks of the mesh viewer into the scanning core.
pub trait MeshViewDelegate {
    fn mesh_view_will_dismiss(&mut self);

    fn mesh_view_did_dismiss(&mut self);

    /// Starts colorizing `mesh`. `preview_done` is called once the preview
    /// colors are attached, `enhanced_done` once the enhanced pass completed,
    /// was canceled or was skipped.
    ///
    /// # Returns
    ///
    /// `false` if colorization could not be started; neither handler is called then.
    fn mesh_view_did_request_colorizing(
        &mut self,
        mesh: Mesh,
        preview_done: ColorizeHandler,
        enhanced_done: ColorizeHandler,
    ) -> bool;
}

/// A viewer that only records what it was given. For batch runs and tests.
#[derive(Clone, Debug, Default)]
pub struct HeadlessViewer {
    pub mesh: Option<Mesh>,
    pub projection: Option<Matrix4<f32>>,
    pub center: Option<Vector3<f32>>,
    pub color_enabled: bool,
    pub display_mode: DisplayMode,
    pub message: Option<String>,
}

impl MeshViewer for HeadlessViewer {
    fn set_mesh(&mut self, mesh: Mesh) {
        self.mesh = Some(mesh);
    }

    fn set_camera_projection_matrix(&mut self, projection: Matrix4<f32>) {
        self.projection = Some(projection);
    }

    fn reset_mesh_center(&mut self, center: Vector3<f32>) {
        self.center = Some(center);
    }

    fn set_color_enabled(&mut self, enabled: bool) {
        self.color_enabled = enabled;
    }

    fn set_display_mode(&mut self, mode: DisplayMode) {
        self.display_mode = mode;
    }

    fn show_message(&mut self, message: &str) {
        self.message = Some(message.to_string());
    }

    fn hide_message(&mut self) {
        self.message = None;
    }
}
