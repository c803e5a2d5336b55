//! facecap-core — Capture session controller and external stage runner.
//!
//! Drives a webcam to collect a labeled set of face images, then hands off
//! to external encode/recognize programs. Face processing itself happens in
//! those programs, never here.

pub mod config;
pub mod controller;
pub mod session;
pub mod stage;

pub use config::Config;
pub use controller::{
    Activity, CameraProvider, CaptureOutcome, Controller, ControllerError, Controls,
    StageCompletion, Tick, V4lCameraProvider,
};
pub use session::{CaptureSession, SessionError};
pub use stage::{StageExit, StageSpec};
