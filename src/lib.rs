pub mod camera;
pub mod config;
pub mod error;
pub mod frame;
pub mod intake;

pub mod icp;
mod intensity_map;
pub mod keyframe;
mod optim;
pub mod range_image;
pub mod raycast;
pub mod tracker;
pub mod transform;
mod trig;

pub mod fusion;
pub mod volume;

pub mod colorize;
pub mod io;
pub mod marching_cubes;
pub mod mesh;

pub mod controller;
pub mod pipeline;
pub mod preview;
pub mod session;
pub mod sync;
pub mod viewer;

pub mod source;
pub mod synthetic;

pub mod metrics;
pub mod trajectory;

#[cfg(test)]
mod unit_test;

pub use crate::controller::ScanController;
pub use crate::pipeline::{ScanEvent, ScanPipeline};
pub use crate::session::{FrameOutcome, Session};
