//! HTTP + WebSocket surface for submitting questions and following jobs.

pub mod routes;
pub mod ws;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use crate::jobs::{JobEvents, JobService};
use crate::trace::TraceRecorder;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<JobService>,
    pub traces: Arc<TraceRecorder>,
    pub events: JobEvents,
}

/// Build the Axum router with job REST routes and the job event WebSocket.
pub fn job_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route(
            "/api/conversations/{id}/messages",
            post(routes::submit_message),
        )
        .route("/api/jobs", get(routes::list_jobs))
        .route("/api/jobs/{id}", get(routes::get_job))
        .route("/api/jobs/{id}/retry", post(routes::retry_job))
        .route(
            "/api/traces",
            get(routes::list_traces).delete(routes::clear_traces),
        )
        .route("/api/traces/{id}", get(routes::get_trace))
        .route("/ws/jobs", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
