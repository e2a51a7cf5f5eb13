use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderValue, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use tokio_util::io::ReaderStream;

use crate::{
    error::ApiError,
    models::{JobAcceptedResponse, JobResponse, SubmitJobRequest},
    AppState,
};

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "timestamp": Utc::now(),
        "processes": state.orchestrator.pool_stats(),
        "clipDurations": state.config.clip_durations,
    }))
}

pub async fn create_job(
    State(state): State<AppState>,
    payload: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobAcceptedResponse>), ApiError> {
    let Json(payload) =
        payload.map_err(|rejection| ApiError::Validation(rejection.body_text()))?;
    let url = payload
        .url
        .ok_or_else(|| ApiError::Validation("url is required".to_string()))?;

    let job = state.orchestrator.submit(&url).await?;
    let response = JobAcceptedResponse {
        job_id: job.job_id,
        state: job.state,
        created_at: job.created_at,
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    state.orchestrator.status(&job_id).await.map(Json)
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    state.orchestrator.cancel(&job_id).await.map(Json)
}

pub async fn download_artifact(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response<Body>, ApiError> {
    let (file, info) = state.registry.open(&token).await?;

    let content_disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        info.file_name
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CONTENT_LENGTH, info.size_bytes)
        .header(header::CONTENT_DISPOSITION, content_disposition)
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|err| ApiError::Internal(anyhow::Error::new(err).context("Failed to build download response")))
}
