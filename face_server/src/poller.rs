//! Periodic face detection on the newest camera frame.
//!
//! Every pipeline runs one [`DetectionPoller`]. At most one tick is in flight at a time; timer
//! ticks arriving while the previous one still runs are dropped. Results land on the shared
//! [`ResultBoard`], tagged with the generation of the pipeline that produced them.
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use cam_capture::{FrameReceiver, VideoFrame};
use common::{detection::DetectionResult, settings::Settings};
use image::RgbImage;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    meter::METER,
    nn::{DetectionRuntimeError, FaceDetector},
};

/// Latest published result and the pipeline generation it belongs to.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoardState {
    pub generation: u64,
    pub result: DetectionResult,
}

/// Holder of the current detection result.
pub struct ResultBoard {
    state: watch::Sender<BoardState>,
}

impl Default for ResultBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultBoard {
    pub fn new() -> Self {
        let (state, _) = watch::channel(BoardState::default());
        Self { state }
    }

    /// Switch to a new generation and clear the result.
    pub fn begin(&self, generation: u64) {
        self.state.send_replace(BoardState {
            generation,
            result: DetectionResult::empty(),
        });
    }

    /// Replace the result if `generation` is still the current one.
    pub fn publish(&self, generation: u64, result: DetectionResult) -> bool {
        self.state.send_if_modified(|state| {
            if state.generation != generation {
                return false;
            }
            state.result = result;
            true
        })
    }

    pub fn snapshot(&self) -> BoardState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BoardState> {
        self.state.subscribe()
    }
}

/// Single in-flight guard for ticks.
#[derive(Debug, Default)]
pub struct TickGate {
    busy: AtomicBool,
    dropped: AtomicU64,
}

impl TickGate {
    /// Enter the gate, or count a dropped tick if another one is still running.
    pub fn try_enter(self: &Arc<Self>) -> Option<TickPermit> {
        match self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Some(TickPermit {
                gate: Arc::clone(self),
            }),
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                METER.tick_dropped();
                None
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Released when dropped.
#[derive(Debug)]
pub struct TickPermit {
    gate: Arc<TickGate>,
}

impl Drop for TickPermit {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}

/// Decode a camera frame at its native resolution.
pub fn decode_frame(frame: &VideoFrame) -> Result<RgbImage, DetectionRuntimeError> {
    turbojpeg::decompress_image(&frame.data)
        .map_err(|e| DetectionRuntimeError::Decode(e.to_string()))
}

/// Run the detector once on `frame`.
///
/// Without a frame there is nothing to detect and the result is empty.
pub async fn tick(
    frame: Option<Arc<VideoFrame>>,
    detector: Arc<dyn FaceDetector>,
    settings: &Settings,
) -> Result<DetectionResult, DetectionRuntimeError> {
    let frame = match frame {
        Some(frame) => frame,
        None => {
            log::debug!("No frame available yet");
            return Ok(DetectionResult::empty());
        }
    };

    let min_confidence = settings.min_confidence;
    tokio::task::spawn_blocking(move || {
        let image = decode_frame(&frame)?;
        detector.detect(&image, min_confidence)
    })
    .await
    .map_err(|e| DetectionRuntimeError::Inference(format!("detection task failed: {e}")))?
}

pub struct DetectionPoller {
    generation: u64,
    frames: FrameReceiver,
    detector: Arc<dyn FaceDetector>,
    settings: watch::Receiver<Settings>,
    board: Arc<ResultBoard>,
    gate: Arc<TickGate>,
}

impl DetectionPoller {
    pub fn new(
        generation: u64,
        frames: FrameReceiver,
        detector: Arc<dyn FaceDetector>,
        settings: watch::Receiver<Settings>,
        board: Arc<ResultBoard>,
    ) -> Self {
        Self {
            generation,
            frames,
            detector,
            settings,
            board,
            gate: Arc::new(TickGate::default()),
        }
    }

    /// Tick every `period` until `cancel` fires, then wait for the last tick to finish.
    pub async fn run(self, period: Duration, cancel: CancellationToken) {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    match self.gate.try_enter() {
                        Some(permit) => in_flight = Some(self.spawn_tick(permit)),
                        None => log::debug!("Detection still running, dropping tick"),
                    }
                }
            }
        }

        if let Some(task) = in_flight {
            if let Err(e) = task.await {
                log::error!("Detection tick panicked: {e}");
            }
        }
        log::debug!(
            "Poller of pipeline #{} stopped, {} ticks dropped",
            self.generation,
            self.gate.dropped()
        );
    }

    fn spawn_tick(&self, permit: TickPermit) -> JoinHandle<()> {
        let frame = self.frames.borrow().clone();
        let detector = Arc::clone(&self.detector);
        let settings = *self.settings.borrow();
        let board = Arc::clone(&self.board);
        let generation = self.generation;

        tokio::spawn(async move {
            let _permit = permit;
            match tick(frame, detector, &settings).await {
                Ok(result) => {
                    METER.tick_detection();
                    log::debug!("Pipeline #{generation}: {}", result.label());
                    if !board.publish(generation, result) {
                        log::debug!("Discarding result of stale pipeline #{generation}");
                    }
                }
                Err(e) => log::warn!("Face detection failed: {e}"),
            }
        })
    }
}
