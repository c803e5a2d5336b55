//! facecap-hw — Hardware layer for webcam capture.
//!
//! Provides V4L2-based camera access, conversion of raw buffers to RGB
//! frames, and JPEG persistence of captured frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};
