//! Endpoints of HTTP server.
//!
use std::{convert::Infallible, sync::Arc};

use axum::{
    body::StreamBody,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;
use common::{
    detection::Detection,
    models::DetectorKind,
    settings::{Settings, ValidationError},
};
use futures::StreamExt;
use serde::Serialize;
use tokio_stream::wrappers::WatchStream;

use crate::{
    meter::METER,
    overlay::DisplayGeometry,
    pipeline::PipelineController,
    store::{SettingsError, SettingsPatch},
};

const INDEX_HTML: &str = include_str!("index.html");

/// Wrap a JPEG into a part of a `multipart/x-mixed-replace` stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::from(
        [
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n\r\n".as_bytes(),
        ]
        .concat(),
    )
}

pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// Live camera preview.
pub async fn video_stream(Extension(controller): Extension<Arc<PipelineController>>) -> Response {
    let frames = match controller.frames() {
        Some(frames) => frames,
        None => return (StatusCode::SERVICE_UNAVAILABLE, "camera not active").into_response(),
    };
    log::info!("Preview stream requested");

    let stream = WatchStream::new(frames).filter_map(|frame| async move {
        frame.map(|frame| {
            METER.tick_streamed();
            Ok::<_, Infallible>(as_jpeg_stream_item(&frame.data))
        })
    });

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [(
        header::CONTENT_TYPE,
        "multipart/x-mixed-replace; boundary=frame",
    )];

    (headers, body).into_response()
}

pub async fn overlay(Extension(controller): Extension<Arc<PipelineController>>) -> Response {
    match controller.overlay_png().await {
        Ok(png) => (
            [
                (header::CONTENT_TYPE, "image/png"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            png,
        )
            .into_response(),
        Err(e) => {
            log::error!("Failed to encode overlay: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Displayed video geometry reported by the client on resize and orientation changes.
pub async fn geometry(
    Extension(controller): Extension<Arc<PipelineController>>,
    Json(geometry): Json<DisplayGeometry>,
) -> StatusCode {
    if geometry.width == 0 || geometry.height == 0 {
        return StatusCode::UNPROCESSABLE_ENTITY;
    }
    controller.set_geometry(geometry).await;
    StatusCode::NO_CONTENT
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: &'static str,
    pub reason: Option<String>,
    pub generation: u64,
    pub count: usize,
    pub label: String,
    pub detections: Vec<Detection>,
    pub settings: Settings,
    pub overlay: DisplayGeometry,
}

pub async fn status(Extension(controller): Extension<Arc<PipelineController>>) -> Json<StatusResponse> {
    let state = controller.state();
    let board = controller.results();

    Json(StatusResponse {
        state: state.name(),
        reason: state.reason().map(str::to_owned),
        generation: board.generation,
        count: board.result.count,
        label: board.result.label(),
        detections: board.result.detections,
        settings: controller.settings(),
        overlay: controller.overlay_geometry().await,
    })
}

pub async fn get_settings(Extension(controller): Extension<Arc<PipelineController>>) -> Json<Settings> {
    Json(controller.settings())
}

#[derive(Debug, Serialize)]
pub struct Rejection {
    pub field: Option<&'static str>,
    pub message: String,
}

pub async fn post_settings(
    Extension(controller): Extension<Arc<PipelineController>>,
    Json(patch): Json<SettingsPatch>,
) -> Response {
    match controller.apply(&patch).await {
        Ok(settings) => Json(settings).into_response(),
        Err(SettingsError::Validation(e)) => {
            let field = match e {
                ValidationError::MinConfidenceOutOfRange(_) => "minConfidence",
                ValidationError::PollIntervalOutOfRange(_) => "pollIntervalMs",
                ValidationError::UnknownDetector(_) => "detectorKind",
            };
            let rejection = Rejection {
                field: Some(field),
                message: e.to_string(),
            };
            (StatusCode::UNPROCESSABLE_ENTITY, Json(rejection)).into_response()
        }
        Err(e @ SettingsError::Store(_)) => {
            log::error!("{e}");
            let rejection = Rejection {
                field: None,
                message: e.to_string(),
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(rejection)).into_response()
        }
    }
}

/// Restart a failed pipeline, e.g. after camera permission was granted.
pub async fn restart(Extension(controller): Extension<Arc<PipelineController>>) -> StatusCode {
    if controller.retry().await {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NO_CONTENT
    }
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<DetectorKind>,
    pub selected: DetectorKind,
}

pub async fn models(Extension(controller): Extension<Arc<PipelineController>>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: DetectorKind::ALL.to_vec(),
        selected: controller.settings().detector_kind,
    })
}
