pub mod backend;
pub mod camera;
pub mod decoder;
pub mod frame;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use backend::{CameraBackend, CameraSession, CaptureError};
pub use camera::Camera;
pub use frame::Frame;
pub use frame::PixelFormat;
pub use synthetic::SyntheticBackend;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Backend;
