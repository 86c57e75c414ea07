//! Common types shared between `face_server` and `cam_capture`.
pub mod detection;
pub mod models;
pub mod settings;

/// Error type.
pub type Error = Box<dyn std::error::Error>;
