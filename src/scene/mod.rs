//! Scene management

mod camera;
mod camera_controller;

pub use camera::*;
pub use camera_controller::*;
