pub mod manager;
pub mod v4l2;

pub use manager::{CameraManager, CapturedFrame, FrameSource};
pub use v4l2::CameraDevice;
