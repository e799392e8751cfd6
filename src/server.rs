//! HTTP control surface
//!
//! Every route answers with a JSON envelope, `{"result": ...}` or
//! `{"error": "..."}`, always with status 200. Browser clients branch on the
//! envelope key.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::control::{ControlError, Controller, StatusSnapshot};

const NO_CACHE: (header::HeaderName, &str) = (header::CACHE_CONTROL, "max-age=0");

/// Successful response body
struct Envelope<T>(T);

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        ([NO_CACHE], Json(json!({ "result": self.0 }))).into_response()
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        warn!("Request failed: {}", self);
        ([NO_CACHE], Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Envelope<T>, ControlError>;

pub fn router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/global_state", get(global_state))
        .route("/video_state", get(global_state))
        .route("/video_preview_url", get(video_preview_url))
        .route("/free_space_bytes", get(free_space_bytes))
        .route("/start_video_preview", get(start_video_preview))
        .route("/stop_video_preview", get(stop_video_preview))
        .route("/start_video_recording", get(start_video_recording))
        .route("/stop_video_recording", get(stop_video_recording))
        .route("/set_bitrate", get(set_bitrate))
        .route("/delete_recorded_videos", get(delete_recorded_videos))
        .route("/download_all_recordings", get(download_all_recordings))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(controller)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, controller: Arc<Controller>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("Failed to read listener address")?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, router(controller))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")
}

async fn global_state(State(controller): State<Arc<Controller>>) -> Envelope<StatusSnapshot> {
    Envelope(controller.status().await)
}

async fn video_preview_url(State(controller): State<Arc<Controller>>) -> Envelope<String> {
    Envelope(controller.preview_url().to_string())
}

async fn free_space_bytes(State(controller): State<Arc<Controller>>) -> ApiResult<u64> {
    Ok(Envelope(controller.free_space()?))
}

async fn start_video_preview(State(controller): State<Arc<Controller>>) -> ApiResult<&'static str> {
    controller.start_preview().await?;
    Ok(Envelope("ok"))
}

async fn stop_video_preview(State(controller): State<Arc<Controller>>) -> ApiResult<&'static str> {
    controller.stop_preview().await?;
    Ok(Envelope("ok"))
}

async fn start_video_recording(
    State(controller): State<Arc<Controller>>,
) -> ApiResult<&'static str> {
    controller.start_recording().await?;
    Ok(Envelope("ok"))
}

async fn stop_video_recording(
    State(controller): State<Arc<Controller>>,
) -> ApiResult<&'static str> {
    controller.stop_recording().await?;
    Ok(Envelope("ok"))
}

#[derive(Debug, Deserialize)]
struct BitrateQuery {
    bitrate: Option<String>,
}

async fn set_bitrate(
    State(controller): State<Arc<Controller>>,
    Query(query): Query<BitrateQuery>,
) -> ApiResult<&'static str> {
    let name = query
        .bitrate
        .ok_or(ControlError::MissingParameter("bitrate"))?;
    controller.set_bitrate(&name).await?;
    Ok(Envelope("ok"))
}

async fn delete_recorded_videos(
    State(controller): State<Arc<Controller>>,
) -> ApiResult<&'static str> {
    controller.delete_recordings().await?;
    Ok(Envelope("ok"))
}

async fn download_all_recordings(
    State(controller): State<Arc<Controller>>,
) -> std::result::Result<Response, ControlError> {
    let archive = controller.archive_recordings().await?;
    let body = Body::from_stream(ReaderStream::new(archive));
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=recordings.zip",
            ),
            NO_CACHE,
        ],
        body,
    )
        .into_response())
}
