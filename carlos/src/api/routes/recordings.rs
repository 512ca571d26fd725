//! Recording routes: intake, status, archive download and clearing.

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::Response,
    routing::{delete, get, post},
};
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::domain::{NewRecording, RecordingId, RecordingRequest, RecordingStatus};

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub record_path: String,
    pub poll_interval_ms: u64,
    pub recording: bool,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct RecordingFlag {
    pub recording: bool,
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub cleared: u64,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(service_info))
        .route("/record", post(create_recording))
        .route("/status", get(list_recordings))
        .route("/status/{id}", get(get_recording))
        .route("/download/{id}", get(download_recording))
        .route("/clear", delete(clear_recordings))
        .route("/recording", get(is_recording))
}

async fn service_info(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        record_path: state.layout.base().display().to_string(),
        poll_interval_ms: u64::try_from(state.poll_interval.as_millis()).unwrap_or(u64::MAX),
        recording: state.busy.is_busy(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn create_recording(
    State(state): State<AppState>,
    Json(payload): Json<NewRecording>,
) -> ApiResult<Json<RecordingRequest>> {
    let now = state.clock.now_ms();
    payload.validate(now)?;

    let id = state.ids.next_id(now);
    let request = payload.into_request(id, now);
    state.repo.create(&request).await?;
    state.refresh.notify();

    info!(
        recording_id = id,
        user = %request.user,
        scheduled_time = request.scheduled_time_ms,
        estimated_ms = request.estimated_duration_ms,
        "Recording scheduled"
    );
    Ok(Json(request))
}

async fn list_recordings(State(state): State<AppState>) -> ApiResult<Json<Vec<RecordingRequest>>> {
    Ok(Json(state.repo.list_all().await?))
}

fn parse_id(raw: &str) -> ApiResult<RecordingId> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid recording id: {}", raw)))
}

async fn get_recording(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RecordingRequest>> {
    let id = parse_id(&id)?;
    Ok(Json(state.repo.find_by_id(id).await?))
}

async fn download_recording(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let id = parse_id(&id)?;
    let request = state.repo.find_by_id(id).await?;
    if request.status != RecordingStatus::Finished {
        return Err(ApiError::locked(format!(
            "Recording {} is {}, archive not ready",
            id, request.status
        )));
    }

    let path = state.layout.archive_path(id);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(recording_id = id, path = %path.display(), "Archive missing for finished recording");
            return Err(ApiError::not_found(format!("No archive for recording {}", id)));
        }
        Err(e) => return Err(crate::Error::from(e).into()),
    };
    let size = file.metadata().await.map(|m| m.len()).ok();

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/gzip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.tar.gz\"", id),
        );
    if let Some(size) = size {
        builder = builder.header(header::CONTENT_LENGTH, size);
    }

    builder
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| ApiError::internal(format!("Failed to build response: {}", e)))
}

async fn clear_recordings(State(state): State<AppState>) -> ApiResult<Json<ClearResponse>> {
    let cleared = state.repo.delete_all().await?;
    warn!(cleared, "Cleared all recordings");
    state.refresh.notify();
    Ok(Json(ClearResponse { cleared }))
}

async fn is_recording(State(state): State<AppState>) -> Json<RecordingFlag> {
    Json(RecordingFlag {
        recording: state.busy.is_busy(),
    })
}
