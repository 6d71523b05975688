//! WasteWatch HTTP server: thin axum glue over the camera registry and
//! the stream multiplexer.  All pipeline logic lives in the library
//! crates; handlers here translate routes to registry calls and wrap
//! results in the `{success, ...}` JSON envelope.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::StreamBody,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use log::info;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;

use wastewatch_camera::{list_cameras, CameraId, CaptureConfig, DEFAULT_BACKENDS};
use wastewatch_registry::{CameraRegistry, DetectionDefaults, FrameFetch};
use wastewatch_stream::{open_stream, MJPEG_CONTENT_TYPE};

#[derive(Parser)]
#[command(name = "wastewatch-server", about = "Camera capture + waste detection service")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:5000")]
    bind: SocketAddr,

    /// ONNX detection model used when a start request names none.
    #[arg(long, default_value = "models/waste_detector.onnx")]
    model: PathBuf,

    /// Default confidence threshold for detection sessions.
    #[arg(long, default_value_t = 0.3)]
    confidence: f32,

    /// JPEG quality for snapshots and streams (1-100).
    #[arg(long, default_value_t = 80)]
    jpeg_quality: i32,

    /// Highest device index the camera list probes.
    #[arg(long, default_value_t = 4)]
    max_cameras: u32,
}

#[derive(Clone)]
struct AppState {
    registry: Arc<CameraRegistry>,
    defaults: DetectionDefaults,
    jpeg_quality: i32,
    max_cameras: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let state = AppState {
        registry: Arc::new(CameraRegistry::new()),
        defaults: DetectionDefaults {
            model_path: args.model,
            confidence: args.confidence,
        },
        jpeg_quality: args.jpeg_quality,
        max_cameras: args.max_cameras,
    };

    let app = Router::new()
        .route("/api/cameras/list", get(camera_list))
        .route("/api/camera/:id/start", post(camera_start))
        .route("/api/camera/:id/stop", post(camera_stop))
        .route("/api/camera/:id/frame", get(camera_frame))
        .route("/api/camera/:id/feed", get(camera_feed))
        .route("/api/camera/:id/detection/stream", get(detection_feed))
        .route("/api/detection/start", post(detection_start))
        .route("/api/detection/stop", post(detection_stop))
        .route("/api/detection/stats", get(detection_stats))
        .with_state(state.clone());

    info!("listening on {}", args.bind);
    axum::Server::bind(&args.bind)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    state.registry.shutdown();
    Ok(())
}

async fn camera_list(State(state): State<AppState>) -> Response {
    let max = state.max_cameras;
    let cameras = tokio::task::spawn_blocking(move || list_cameras(max, DEFAULT_BACKENDS))
        .await
        .unwrap_or_default();
    Json(json!({ "success": true, "cameras": cameras })).into_response()
}

#[derive(Deserialize, Default)]
struct StartCameraRequest {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

async fn camera_start(
    Path(id): Path<u32>,
    State(state): State<AppState>,
    body: Option<Json<StartCameraRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let defaults = CaptureConfig::default();
    let config = CaptureConfig {
        width: request.width.unwrap_or(defaults.width),
        height: request.height.unwrap_or(defaults.height),
        fps: request.fps.unwrap_or(defaults.fps),
        ..defaults
    };

    let registry = state.registry.clone();
    let result =
        tokio::task::spawn_blocking(move || registry.start_camera(CameraId::new(id), config))
            .await;
    match result {
        Ok(Ok(geometry)) => Json(json!({
            "success": true,
            "message": format!("camera {id} started"),
            "resolution": format!("{}x{}", geometry.width, geometry.height),
            "fps": geometry.fps,
        }))
        .into_response(),
        Ok(Err(err)) => failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn camera_stop(Path(id): Path<u32>, State(state): State<AppState>) -> Response {
    let registry = state.registry.clone();
    let result =
        tokio::task::spawn_blocking(move || registry.stop_camera(CameraId::new(id))).await;
    match result {
        Ok(Ok(())) => Json(json!({
            "success": true,
            "message": format!("camera {id} stopped"),
        }))
        .into_response(),
        Ok(Err(err)) => failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn camera_frame(Path(id): Path<u32>, State(state): State<AppState>) -> Response {
    match state
        .registry
        .get_frame(CameraId::new(id), true, state.jpeg_quality)
    {
        FrameFetch::Encoded(bytes) => {
            ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response()
        }
        FrameFetch::NotReady => failure(StatusCode::SERVICE_UNAVAILABLE, "no frame captured yet"),
        _ => failure(StatusCode::NOT_FOUND, format!("camera {id} is not active")),
    }
}

async fn camera_feed(Path(id): Path<u32>, State(state): State<AppState>) -> Response {
    mjpeg_response(&state, id, false)
}

async fn detection_feed(Path(id): Path<u32>, State(state): State<AppState>) -> Response {
    mjpeg_response(&state, id, true)
}

fn mjpeg_response(state: &AppState, id: u32, annotate: bool) -> Response {
    if !state.registry.is_active(CameraId::new(id)) {
        return failure(StatusCode::NOT_FOUND, format!("camera {id} is not active"));
    }
    let stream = open_stream(
        state.registry.clone(),
        CameraId::new(id),
        annotate,
        state.jpeg_quality,
    )
    .map(Ok::<_, std::io::Error>);
    (
        [(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)],
        StreamBody::new(stream),
    )
        .into_response()
}

#[derive(Deserialize)]
struct DetectionStartRequest {
    camera_id: u32,
    confidence: Option<f32>,
    model_path: Option<PathBuf>,
}

async fn detection_start(
    State(state): State<AppState>,
    Json(request): Json<DetectionStartRequest>,
) -> Response {
    let confidence = request.confidence.unwrap_or(state.defaults.confidence);
    let model_path = request
        .model_path
        .unwrap_or_else(|| state.defaults.model_path.clone());
    let registry = state.registry.clone();
    let id = request.camera_id;

    let result = tokio::task::spawn_blocking(move || {
        registry.start_detection(CameraId::new(id), confidence, model_path)
    })
    .await;
    match result {
        Ok(Ok(())) => Json(json!({
            "success": true,
            "message": format!("detection started on camera {id}"),
        }))
        .into_response(),
        Ok(Err(err)) => failure(StatusCode::BAD_REQUEST, err.to_string()),
        Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[derive(Deserialize)]
struct DetectionStopRequest {
    camera_id: u32,
}

async fn detection_stop(
    State(state): State<AppState>,
    Json(request): Json<DetectionStopRequest>,
) -> Response {
    let registry = state.registry.clone();
    let id = request.camera_id;
    let result =
        tokio::task::spawn_blocking(move || registry.stop_detection(CameraId::new(id))).await;
    match result {
        Ok(Ok(())) => Json(json!({
            "success": true,
            "message": format!("detection stopped on camera {id}"),
        }))
        .into_response(),
        Ok(Err(err)) => failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[derive(Deserialize)]
struct StatsQuery {
    camera_id: Option<u32>,
}

async fn detection_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let Some(id) = query.camera_id else {
        return failure(StatusCode::BAD_REQUEST, "camera_id is required");
    };
    let stats = state.registry.detection_stats(CameraId::new(id));
    Json(json!({ "success": true, "data": stats })).into_response()
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message.into() })),
    )
        .into_response()
}
