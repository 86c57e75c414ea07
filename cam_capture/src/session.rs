//! Capture sessions owning a running camera stream.
//!
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use bytes::Bytes;
use tokio::sync::watch;

use crate::sensors::{get_capture_fn_linux, CaptureConstraints, CaptureError, CaptureErrorKind, CaptureFn};

/// One encoded (JPEG) camera frame.
#[derive(Debug)]
pub struct VideoFrame {
    /// Sequence number within the session, starting at 0.
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// Latest frame of a session, `None` until the first frame arrived.
pub type FrameReceiver = watch::Receiver<Option<Arc<VideoFrame>>>;

/// Source of capture sessions.
pub trait CaptureBackend: Send + Sync {
    fn acquire(&self, constraints: &CaptureConstraints) -> Result<CaptureSession, CaptureError>;
}

/// V4L2 camera delivering Motion JPEG.
pub struct V4lCamera {
    device_name: String,
}

impl V4lCamera {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
        }
    }
}

impl CaptureBackend for V4lCamera {
    fn acquire(&self, constraints: &CaptureConstraints) -> Result<CaptureSession, CaptureError> {
        let (capture_fn, resolution) = get_capture_fn_linux(&self.device_name, "MJPG", constraints)?;
        CaptureSession::spawn(capture_fn, resolution)
    }
}

/// A live camera stream.
///
/// A worker thread keeps capturing and publishes the newest frame. The stream is stopped and the
/// device released when the session is dropped.
pub struct CaptureSession {
    resolution: (u32, u32),
    frames_rx: FrameReceiver,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureSession {
    /// Start capturing with `capture_fn` on a dedicated thread.
    pub fn spawn(mut capture_fn: CaptureFn, resolution: (u32, u32)) -> Result<Self, CaptureError> {
        let (frames_tx, frames_rx) = watch::channel(None);
        let running = Arc::new(AtomicBool::new(true));

        let running_ = Arc::clone(&running);
        let worker = std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                let mut seq = 0;
                while running_.load(Ordering::Acquire) {
                    match capture_fn() {
                        Ok(data) => {
                            frames_tx.send_replace(Some(Arc::new(VideoFrame {
                                seq,
                                width: resolution.0,
                                height: resolution.1,
                                data,
                            })));
                            seq += 1;
                        }
                        Err(err) => {
                            log::error!("Error capturing frame: {err}");
                            frames_tx.send_replace(None);
                            break;
                        }
                    }
                }
                log::debug!("Capture worker stopped after {seq} frames");
            })
            .map_err(|e| CaptureError::new(CaptureErrorKind::Io, e.to_string()))?;

        Ok(Self {
            resolution,
            frames_rx,
            running,
            worker: Some(worker),
        })
    }

    /// Native resolution of the stream.
    pub fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    /// The newest frame, if any arrived yet.
    pub fn latest(&self) -> Option<Arc<VideoFrame>> {
        self.frames_rx.borrow().clone()
    }

    /// Subscribe to frame updates, e.g. for a preview stream.
    ///
    /// The receiver reports a closed channel once the session is stopped.
    pub fn subscribe(&self) -> FrameReceiver {
        self.frames_rx.clone()
    }

    /// Stop the worker and release the camera. Blocks until the current capture returns.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Capture worker panicked");
            }
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}
