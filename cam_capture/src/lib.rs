//! Webcam acquisition for the face counting pipeline.
//!
//! A [`CaptureBackend`] opens the camera with fixed [`CaptureConstraints`] and hands out a
//! [`CaptureSession`]. The session keeps pulling frames on its own thread and always exposes the
//! newest one. Dropping the session stops the camera stream.
pub mod sensors;
pub mod session;

pub use sensors::{CaptureConstraints, CaptureError, CaptureErrorKind};
pub use session::{CaptureBackend, CaptureSession, FrameReceiver, V4lCamera, VideoFrame};

/// Error type.
pub type Error = Box<dyn std::error::Error>;
