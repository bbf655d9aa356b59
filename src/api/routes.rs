//! REST handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{error, warn};
use uuid::Uuid;

use super::AppState;
use crate::error::{Error, JobError};
use crate::jobs::{JobFilter, JobRequest, JobStatus};

/// Header naming the submitting client.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

const DEFAULT_CLIENT_ID: &str = "default";

/// Largest page `GET /api/jobs` returns.
const MAX_LIST_LIMIT: usize = 500;

/// Error body: `{"error": "..."}` with a status derived from the error kind.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Job(JobError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Error::Job(JobError::NotRetryable { .. } | JobError::InvalidRequest(_)) => {
                StatusCode::BAD_REQUEST
            }
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(_) | Error::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Agent(_) => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

// ── Health ──────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "qa-jobs"
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

pub async fn submit_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<JobRequest>,
) -> Result<Response, ApiError> {
    let client_id = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_CLIENT_ID);

    let submission = state
        .service
        .submit(conversation_id, client_id, request)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(submission)).into_response())
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = state.service.get_job(id).await?;
    Ok(Json(job).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub conversation_id: Option<Uuid>,
    pub client_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Response, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => match raw.parse::<JobStatus>() {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(status = raw, "Rejected job list filter");
                return Ok(bad_request(e));
            }
        },
        None => None,
    };

    let filter = JobFilter {
        conversation_id: query.conversation_id,
        client_id: query.client_id,
        status,
        limit: query
            .limit
            .unwrap_or(JobFilter::default().limit)
            .clamp(1, MAX_LIST_LIMIT),
    };
    let jobs = state.service.list_jobs(&filter).await?;
    Ok(Json(jobs).into_response())
}

pub async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = state.service.retry(id).await?;
    Ok((StatusCode::ACCEPTED, Json(job)).into_response())
}

// ── Traces ──────────────────────────────────────────────────────────────

pub async fn list_traces(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.traces.list().await)
}

pub async fn get_trace(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.traces.get(id).await {
        Some(trace) => Json(trace).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("Trace {id} not found") })),
        )
            .into_response(),
    }
}

pub async fn clear_traces(State(state): State<AppState>) -> impl IntoResponse {
    state.traces.clear().await;
    StatusCode::NO_CONTENT
}
