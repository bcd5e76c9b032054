mod frames;
pub(crate) use frames::{
    corner_depth_frame, offset_depth_frame, plane_color_frame, plane_depth_frame, small_intrinsics,
};
mod range_images;
pub(crate) use range_images::plane_range_image;
mod volumes;
pub(crate) use volumes::{fused_plane_volume, small_volume_params};
