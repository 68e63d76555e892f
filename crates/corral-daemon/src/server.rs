//! HTTP surface of the daemon.
//!
//! Routes are HTTP/1.1-with-JSON over the Unix socket; HTTP is used for its
//! semantics (methods, paths, status codes), not for network reach. Every
//! error leaves as a [`ErrorBody`] with a stable machine-readable code.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::error;

use corral_core::protocol::{
    CancelResponse, EnqueueRequest, EnqueueResponse, ErrorBody, HealthResponse, JobSummary,
    ListJobsResponse, ProtocolError, ShowJobResponse, PROTOCOL_VERSION,
};
use corral_core::queue::{EnqueueJob, JobFilter};
use corral_core::{JobKind, JobStatus, QueueEngine, QueueError};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    queue: Arc<QueueEngine>,
}

/// Builds the daemon router over a queue engine.
#[must_use]
pub fn router(queue: Arc<QueueEngine>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/jobs/enqueue", post(enqueue))
        .route("/v1/jobs", get(list))
        .route("/v1/jobs/{job_id}", get(show))
        .route("/v1/jobs/{job_id}/cancel", post(cancel))
        .with_state(AppState { queue })
}

/// Errors a handler can answer with.
#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<ProtocolError> for ApiError {
    fn from(err: ProtocolError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        error!(error = %err, "queue operation failed");
        Self::Internal("internal queue error".to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, "badRequest", message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, "notFound", message),
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", message),
        };
        (status, Json(ErrorBody::new(code, message))).into_response()
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}

async fn enqueue(
    State(state): State<AppState>,
    payload: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let Json(req) = payload?;
    req.validate()?;

    let enqueued = state.queue.enqueue(&EnqueueJob {
        kind: req.kind,
        payload: req.payload,
        requester: req.requester,
        idempotency_key: req.idempotency_key,
        run_at_ms: req.run_at,
        priority: req.priority,
        max_attempts: None,
        now_ms: None,
    })?;
    Ok(Json(EnqueueResponse {
        protocol_version: PROTOCOL_VERSION,
        job_id: enqueued.job_id,
        deduped: enqueued.deduped,
    }))
}

/// Query parameters for `GET /v1/jobs`. `status` and `kind` take
/// comma-separated lists.
#[derive(Debug, Deserialize)]
struct ListParams {
    requester: Option<String>,
    status: Option<String>,
    kind: Option<String>,
    limit: Option<u32>,
}

fn parse_csv<T: FromStr>(raw: Option<&str>, what: &str) -> Result<Vec<T>, ApiError>
where
    T::Err: std::fmt::Display,
{
    raw.map_or_else(
        || Ok(Vec::new()),
        |raw| {
            raw.split(',')
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<T>()
                        .map_err(|err| ApiError::BadRequest(format!("bad {what}: {err}")))
                })
                .collect()
        },
    )
}

async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    let filter = JobFilter {
        requester: params.requester,
        statuses: parse_csv::<JobStatus>(params.status.as_deref(), "status")?,
        kinds: parse_csv::<JobKind>(params.kind.as_deref(), "kind")?,
        limit: params.limit,
    };
    let jobs = state.queue.list(&filter)?;
    Ok(Json(ListJobsResponse {
        protocol_version: PROTOCOL_VERSION,
        jobs: jobs.iter().map(JobSummary::from).collect(),
    }))
}

async fn show(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<ShowJobResponse>, ApiError> {
    let job = state
        .queue
        .get(&job_id)?
        .ok_or_else(|| ApiError::NotFound(format!("no such job: {job_id}")))?;
    Ok(Json(ShowJobResponse::from_job(&job)))
}

async fn cancel(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    if state.queue.get(&job_id)?.is_none() {
        return Err(ApiError::NotFound(format!("no such job: {job_id}")));
    }
    let ok = state.queue.cancel(&job_id, None)?;
    Ok(Json(CancelResponse {
        protocol_version: PROTOCOL_VERSION,
        ok,
    }))
}
