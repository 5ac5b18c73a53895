//! Local job API that stands in for the queue runtime: it accepts job records
//! over HTTP and answers with the envelope the orchestrator produced.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;
use tracing::debug;
use uuid::Uuid;

use crate::job::{JobRecord, ResponseEnvelope};
use crate::orchestrator::JobHandler;

/// Inline jobs carry the whole image as base64, so the request body limit
/// has to sit well above axum's 2 MiB default.
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct JobApiState {
    handler: Arc<dyn JobHandler>,
    permits: Arc<Semaphore>,
    max_body_bytes: usize,
}

impl JobApiState {
    /// `max_concurrent_jobs` of zero is treated as one.
    pub fn new(handler: Arc<dyn JobHandler>, max_concurrent_jobs: usize) -> Self {
        Self {
            handler,
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }
}

pub fn job_router(state: JobApiState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_body_bytes);
    Router::new()
        .route("/health", get(health))
        .route("/runsync", post(run_sync))
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct RunSyncResponse {
    pub id: String,
    pub status: &'static str,
    pub output: ResponseEnvelope,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn run_sync(
    State(state): State<JobApiState>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<RunSyncResponse>, AppError> {
    let Json(body) = body?;
    if !body.is_object() {
        return Err(AppError::BadRequest(
            "job record must be a JSON object".to_string(),
        ));
    }

    let mut job = JobRecord::from_value(body);
    let id = job
        .id
        .get_or_insert_with(|| Uuid::new_v4().to_string())
        .clone();

    let _permit = state
        .permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| AppError::Internal("job queue is shutting down".to_string()))?;
    debug!(job_id = %id, "job admitted");

    let handler = Arc::clone(&state.handler);
    let output = tokio::task::spawn_blocking(move || handler.handle(&job))
        .await
        .map_err(|err| AppError::Internal(format!("job task failed: {err}")))?;

    Ok(Json(RunSyncResponse {
        id,
        status: "COMPLETED",
        output,
    }))
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    /// Body could not be read as a JSON job record; keeps axum's status.
    Rejected(StatusCode, String),
    Internal(String),
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Rejected(rejection.status(), rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Rejected(status, msg) => (status, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
