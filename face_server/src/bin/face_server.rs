//! Face counting server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Extension, Router,
};
use cam_capture::V4lCamera;
use clap::Parser;
use env_logger::TimestampPrecision;
use face_server::{
    endpoints::{
        geometry, get_settings, healthcheck, index, models, overlay, post_settings, restart,
        status, video_stream,
    },
    loader::{ModelAssets, OnnxProvider},
    meter::spawn_meter_logger,
    overlay::{load_font, DisplayGeometry, OverlayRenderer},
    pipeline::PipelineController,
    store::{JsonFileStore, SettingsStore},
};

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve the UI and API on
    #[clap(long, default_value = "127.0.0.1:3000")]
    server_address: String,

    /// Camera device
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// Directory holding the ONNX models
    #[clap(long, default_value = "models")]
    models_dir: PathBuf,

    /// Base URL to download missing models from
    #[clap(long)]
    model_url: Option<String>,

    /// Settings file, defaults to `facecount/session.json` in the user config directory
    #[clap(long)]
    settings_file: Option<PathBuf>,

    /// TrueType font for confidence labels on the overlay
    #[clap(long)]
    font: Option<PathBuf>,
}

fn default_settings_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facecount")
        .join("session.json")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let settings_file =
        JsonFileStore::open(args.settings_file.unwrap_or_else(default_settings_file));
    log::info!("Using settings file {}", settings_file.path().display());
    let store = SettingsStore::load(Box::new(settings_file));

    let font = match &args.font {
        Some(path) => {
            let data = std::fs::read(path)
                .with_context(|| format!("reading font {}", path.display()))?;
            Some(load_font(data).context("invalid font file")?)
        }
        None => None,
    };
    let renderer = OverlayRenderer::new(font, DisplayGeometry::new(640, 360));

    let assets = ModelAssets::new(args.models_dir, args.model_url);
    log::info!("Loading models from {}", assets.models_dir().display());
    let controller = Arc::new(PipelineController::new(
        Arc::new(V4lCamera::new(args.device)),
        Arc::new(OnnxProvider::new(assets)),
        store,
        renderer,
    ));
    controller.start().await;

    spawn_meter_logger();

    // Build HTTP server with endpoints
    let app = Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/stream", get(video_stream))
        .route("/overlay", get(overlay))
        .route("/geometry", post(geometry))
        .route("/status", get(status))
        .route("/settings", get(get_settings).post(post_settings))
        .route("/models", get(models))
        .route("/restart", post(restart))
        .layer(Extension(controller.clone()));

    // Serve HTTP server until interrupted
    let addr: SocketAddr = args.server_address.parse()?;
    log::info!("Serving on http://{addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {e}");
            }
        })
        .await?;

    controller.shutdown().await;
    log::info!("Stopped");

    Ok(())
}
