//! Lifecycle of the detection pipeline.
//!
//! A pipeline loads the selected detector, acquires the camera and then polls for faces until it
//! is cancelled. Settings changes that affect the detector or the timer tear the running pipeline
//! down completely before the next one starts, so there is never more than one detector and one
//! camera session alive.
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use cam_capture::{CaptureBackend, CaptureConstraints, CaptureSession, FrameReceiver};
use common::settings::Settings;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    loader::{DetectorProvider, ModelLoader},
    nn::FaceDetector,
    overlay::{DisplayGeometry, OverlayRenderer},
    poller::{BoardState, DetectionPoller, ResultBoard},
    store::{SettingsError, SettingsPatch, SettingsStore},
};

#[derive(Clone, Debug, PartialEq)]
pub enum PipelineState {
    Loading,
    Running,
    Failed { reason: String },
    Stopped,
}

impl PipelineState {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Loading => "loading",
            PipelineState::Running => "running",
            PipelineState::Failed { .. } => "failed",
            PipelineState::Stopped => "stopped",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            PipelineState::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Resources shared between the controller and the pipeline task.
struct Shared {
    capture: Arc<dyn CaptureBackend>,
    loader: Mutex<ModelLoader>,
    renderer: Mutex<OverlayRenderer>,
    board: Arc<ResultBoard>,
    state: watch::Sender<PipelineState>,
    frames: watch::Sender<Option<FrameReceiver>>,
}

impl Shared {
    fn set_state(&self, state: PipelineState) {
        self.state.send_replace(state);
    }

    fn fail(&self, generation: u64, reason: String) {
        log::error!("Pipeline #{generation} failed: {reason}");
        self.set_state(PipelineState::Failed { reason });
    }

    async fn release_detector(&self, detector: Arc<dyn FaceDetector>) {
        self.loader.lock().await.discard();
        drop(detector);
    }
}

struct RunningPipeline {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningPipeline {
    /// Cancel and wait until the camera and the detector are released.
    async fn stop(self) {
        log::info!("Stopping pipeline #{}", self.generation);
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            log::error!("Pipeline #{} panicked: {e}", self.generation);
        }
    }
}

pub struct PipelineController {
    shared: Arc<Shared>,
    store: Mutex<SettingsStore>,
    settings: watch::Sender<Settings>,
    generation: AtomicU64,
    running: Mutex<Option<RunningPipeline>>,
}

impl PipelineController {
    pub fn new(
        capture: Arc<dyn CaptureBackend>,
        provider: Arc<dyn DetectorProvider>,
        store: SettingsStore,
        renderer: OverlayRenderer,
    ) -> Self {
        let (settings, _) = watch::channel(store.get());
        let (state, _) = watch::channel(PipelineState::Stopped);
        let (frames, _) = watch::channel(None);

        Self {
            shared: Arc::new(Shared {
                capture,
                loader: Mutex::new(ModelLoader::new(provider)),
                renderer: Mutex::new(renderer),
                board: Arc::new(ResultBoard::new()),
                state,
                frames,
            }),
            store: Mutex::new(store),
            settings,
            generation: AtomicU64::new(0),
            running: Mutex::new(None),
        }
    }

    /// Start a pipeline with the current settings, replacing a running one.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if let Some(pipeline) = running.take() {
            pipeline.stop().await;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let settings = *self.settings.borrow();
        let cancel = CancellationToken::new();
        self.shared.board.begin(generation);
        self.shared.set_state(PipelineState::Loading);

        let task = tokio::spawn(run_pipeline(
            Arc::clone(&self.shared),
            generation,
            settings,
            self.settings.subscribe(),
            cancel.clone(),
        ));
        *running = Some(RunningPipeline {
            generation,
            cancel,
            task,
        });
    }

    /// Validate and persist a settings change.
    ///
    /// A new detector or poll interval restarts the pipeline. A new minimum confidence is picked
    /// up by the next tick. Any accepted change restarts a failed pipeline, even with the same
    /// settings.
    pub async fn apply(&self, patch: &SettingsPatch) -> Result<Settings, SettingsError> {
        let updated = self.store.lock().await.set(patch)?;
        let previous = self.settings.send_replace(updated);

        if previous.requires_restart(&updated) {
            log::info!(
                "Switching to {} every {} ms",
                updated.detector_kind,
                updated.poll_interval_ms
            );
            self.start().await;
        } else if self.retry().await {
            log::info!("Restarted failed pipeline with {}", updated.detector_kind);
        } else if previous != updated {
            log::info!("Minimum confidence set to {}", updated.min_confidence);
        }

        Ok(updated)
    }

    /// Restart the pipeline if it failed. Returns whether a restart happened.
    pub async fn retry(&self) -> bool {
        if !matches!(self.state(), PipelineState::Failed { .. }) {
            return false;
        }
        self.start().await;
        true
    }

    /// Stop the running pipeline, if any.
    pub async fn shutdown(&self) {
        if let Some(pipeline) = self.running.lock().await.take() {
            pipeline.stop().await;
        }
        self.shared.set_state(PipelineState::Stopped);
    }

    pub fn settings(&self) -> Settings {
        *self.settings.borrow()
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state.borrow().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub fn results(&self) -> BoardState {
        self.shared.board.snapshot()
    }

    /// Frames of the live session, `None` while no camera is acquired.
    pub fn frames(&self) -> Option<FrameReceiver> {
        self.shared.frames.borrow().clone()
    }

    pub async fn overlay_geometry(&self) -> DisplayGeometry {
        self.shared.renderer.lock().await.geometry()
    }

    pub async fn set_geometry(&self, geometry: DisplayGeometry) {
        self.shared.renderer.lock().await.resize(geometry);
    }

    /// Overlay as PNG. Without an attached surface a transparent image of the display size is
    /// returned.
    pub async fn overlay_png(&self) -> Result<Vec<u8>, image::ImageError> {
        self.shared.renderer.lock().await.encode_png()
    }
}

async fn run_pipeline(
    shared: Arc<Shared>,
    generation: u64,
    settings: Settings,
    live_settings: watch::Receiver<Settings>,
    cancel: CancellationToken,
) {
    let kind = settings.detector_kind;
    log::info!("Starting pipeline #{generation} with {kind}");
    shared.set_state(PipelineState::Loading);

    // Not raced against `cancel`, a restart waits for the build to finish
    let loaded = shared.loader.lock().await.load(kind).await;
    let detector = match loaded {
        Ok(detector) => detector,
        Err(e) => {
            shared.fail(generation, format!("Could not load {kind}: {e}"));
            return;
        }
    };
    if cancel.is_cancelled() {
        log::info!("Pipeline #{generation} cancelled while loading {kind}");
        shared.release_detector(detector).await;
        return;
    }

    let capture = Arc::clone(&shared.capture);
    let acquired =
        tokio::task::spawn_blocking(move || capture.acquire(&CaptureConstraints::DEFAULT)).await;
    let session = match acquired {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            shared.fail(generation, format!("Camera unavailable: {e}"));
            shared.release_detector(detector).await;
            return;
        }
        Err(e) => {
            shared.fail(generation, format!("Camera task failed: {e}"));
            shared.release_detector(detector).await;
            return;
        }
    };
    if cancel.is_cancelled() {
        shared.release_detector(detector).await;
        stop_session(session).await;
        return;
    }

    let (width, height) = session.resolution();
    log::info!("Camera streaming at {width}x{height}");
    shared
        .renderer
        .lock()
        .await
        .attach((width, height), detector.draws_overlay());
    shared.frames.send_replace(Some(session.subscribe()));
    shared.set_state(PipelineState::Running);

    let poller = DetectionPoller::new(
        generation,
        session.subscribe(),
        Arc::clone(&detector),
        live_settings,
        Arc::clone(&shared.board),
    );
    let period = Duration::from_millis(settings.poll_interval_ms);
    tokio::join!(
        poller.run(period, cancel.clone()),
        follow_results(&shared, &cancel)
    );

    shared.frames.send_replace(None);
    shared.renderer.lock().await.detach();
    shared.release_detector(detector).await;
    stop_session(session).await;
    log::info!("Pipeline #{generation} stopped");
}

/// Redraw the overlay whenever a new result is published.
async fn follow_results(shared: &Shared, cancel: &CancellationToken) {
    let mut updates = shared.board.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow().clone();
                let mut renderer = shared.renderer.lock().await;
                let geometry = renderer.geometry();
                renderer.render(&state.result, geometry);
            }
        }
    }
}

/// Stopping the capture worker blocks until the running capture returns.
async fn stop_session(session: CaptureSession) {
    if let Err(e) = tokio::task::spawn_blocking(move || drop(session)).await {
        log::error!("Failed to stop capture session: {e}");
    }
}
