//! Export REST API controller.

use crate::responses::{accepted, ok, ApiResponse, ApiResult, AppError};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tasktrack_export::{ExportRequest, Job, JobId, JobSnapshot, QueueStats};

/// Creates the exports router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(submit_export))
        .route("/stats", get(queue_stats))
        .route("/:job_id", get(get_export))
        .route("/:job_id/download", get(download_export))
        .route("/:job_id/pause", post(pause_export))
        .route("/:job_id/resume", post(resume_export))
        .route("/:job_id/cancel", post(cancel_export))
}

/// Job details returned by every export endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJobResponse {
    #[serde(flatten)]
    pub job: JobSnapshot,
    pub attempts: u32,
    pub max_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExportResultResponse>,
}

/// Finished artifact, without its server-side location.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResultResponse {
    pub filename: String,
    pub file_size_bytes: u64,
    pub total_items: u64,
    pub from_cache: bool,
    pub download_url: String,
}

impl From<&Job> for ExportJobResponse {
    fn from(job: &Job) -> Self {
        Self {
            job: JobSnapshot::from(job),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            started_at: job.started_at,
            completed_at: job.completed_at,
            result: job.result.as_ref().map(|artifact| ExportResultResponse {
                filename: artifact.filename.clone(),
                file_size_bytes: artifact.file_size_bytes,
                total_items: artifact.total_items,
                from_cache: artifact.from_cache,
                download_url: format!("/api/v1/exports/{}/download", job.id),
            }),
        }
    }
}

async fn submit_export(
    State(state): State<AppState>,
    Json(request): Json<ExportRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ExportJobResponse>>), AppError> {
    let job = state.exports.submit(request).await?;
    Ok(accepted(ExportJobResponse::from(&job)))
}

async fn get_export(State(state): State<AppState>, Path(job_id): Path<String>) -> ApiResult<ExportJobResponse> {
    let job = state.exports.job(&JobId::from_string(job_id)).await?;
    ok(ExportJobResponse::from(&job))
}

async fn download_export(State(state): State<AppState>, Path(job_id): Path<String>) -> Result<Response, AppError> {
    let download = state.exports.download(&JobId::from_string(job_id)).await?;
    let disposition = format!("attachment; filename=\"{}\"", download.filename);
    Ok((
        [
            (header::CONTENT_TYPE, download.content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        download.bytes,
    )
        .into_response())
}

async fn pause_export(State(state): State<AppState>, Path(job_id): Path<String>) -> ApiResult<ExportJobResponse> {
    let job = state.exports.pause(&JobId::from_string(job_id)).await?;
    ok(ExportJobResponse::from(&job))
}

async fn resume_export(State(state): State<AppState>, Path(job_id): Path<String>) -> ApiResult<ExportJobResponse> {
    let job = state.exports.resume(&JobId::from_string(job_id)).await?;
    ok(ExportJobResponse::from(&job))
}

async fn cancel_export(State(state): State<AppState>, Path(job_id): Path<String>) -> ApiResult<ExportJobResponse> {
    let job = state.exports.cancel(&JobId::from_string(job_id)).await?;
    ok(ExportJobResponse::from(&job))
}

async fn queue_stats(State(state): State<AppState>) -> ApiResult<QueueStats> {
    ok(state.exports.stats().await?)
}
