//! Versioned request/response payloads shared by the daemon and clients.
//!
//! Everything on the wire is JSON with camelCase fields. Requests carry a
//! `protocolVersion` and are decoded strictly (`deny_unknown_fields`): a
//! client speaking a newer dialect fails loudly at the edge instead of
//! having fields silently dropped. Responses are decoded leniently so old
//! clients tolerate additive fields.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{Job, JobKind, JobStatus};

/// Protocol dialect this build speaks. Bumped on incompatible changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Errors raised while validating a decoded request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The peer speaks a different protocol dialect.
    #[error("protocol version mismatch: got {got}, want {want}")]
    VersionMismatch {
        /// Version the peer sent.
        got: u32,
        /// Version this build speaks.
        want: u32,
    },

    /// A required field was present but empty.
    #[error("field must not be empty: {field}")]
    EmptyField {
        /// Name of the offending field.
        field: &'static str,
    },
}

fn require_version(got: u32) -> Result<(), ProtocolError> {
    if got == PROTOCOL_VERSION {
        Ok(())
    } else {
        Err(ProtocolError::VersionMismatch {
            got,
            want: PROTOCOL_VERSION,
        })
    }
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if value.trim().is_empty() {
        Err(ProtocolError::EmptyField { field })
    } else {
        Ok(())
    }
}

/// Request body for `POST /v1/jobs/enqueue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnqueueRequest {
    /// Dialect the client speaks; must match [`PROTOCOL_VERSION`].
    pub protocol_version: u32,
    /// Identity of the enqueuing principal.
    pub requester: String,
    /// Dedup token; empty or absent means "never dedup".
    #[serde(default)]
    pub idempotency_key: String,
    /// Payload shape tag; unknown kinds are rejected at decode time.
    pub kind: JobKind,
    /// Kind-specific data, carried opaquely.
    pub payload: serde_json::Value,
    /// Earliest claim time in ms since epoch; absent means "now".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<i64>,
    /// Higher claims first; absent means 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

impl EnqueueRequest {
    /// Checks version and field-level invariants after decode.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] on a dialect mismatch or an empty
    /// `requester`.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        require_version(self.protocol_version)?;
        require_non_empty("requester", &self.requester)
    }
}

/// Response body for `POST /v1/jobs/enqueue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    /// Dialect the daemon speaks.
    pub protocol_version: u32,
    /// Identity of the accepted job.
    pub job_id: String,
    /// `true` when an existing job was returned for the idempotency key.
    pub deduped: bool,
}

/// One job as rendered in list and show responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    /// Identity of the job.
    pub job_id: String,
    /// Payload shape tag.
    pub kind: JobKind,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Identity of the enqueuing principal.
    pub requester: String,
    /// Higher claims first.
    pub priority: i64,
    /// Earliest claim time (ms since epoch).
    pub run_at: i64,
    /// Creation time (ms since epoch).
    pub created_at: i64,
    /// Last mutation time (ms since epoch).
    pub updated_at: i64,
    /// Failures so far.
    pub attempt: u32,
    /// Attempt ceiling.
    pub max_attempts: u32,
    /// Current lease holder, if running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    /// Lease expiry (ms since epoch), if running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<i64>,
    /// Last failure message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            kind: job.kind,
            status: job.status,
            requester: job.requester.clone(),
            priority: job.priority,
            run_at: job.run_at_ms,
            created_at: job.created_at_ms,
            updated_at: job.updated_at_ms,
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            locked_by: job.locked_by.clone(),
            lease_until: job.lease_until_ms,
            last_error: job.last_error.clone(),
        }
    }
}

/// Response body for `GET /v1/jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsResponse {
    /// Dialect the daemon speaks.
    pub protocol_version: u32,
    /// Matching jobs, newest first.
    pub jobs: Vec<JobSummary>,
}

/// Response body for `GET /v1/jobs/{jobId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowJobResponse {
    /// Dialect the daemon speaks.
    pub protocol_version: u32,
    /// The job's summary fields.
    #[serde(flatten)]
    pub job: JobSummary,
    /// Kind-specific payload, verbatim.
    pub payload: serde_json::Value,
    /// Result stored by the acking worker, if terminal and successful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl ShowJobResponse {
    /// Renders a stored job for the show endpoint.
    #[must_use]
    pub fn from_job(job: &Job) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            job: JobSummary::from(job),
            payload: job.payload.clone(),
            result: job.result.clone(),
        }
    }
}

/// Response body for `POST /v1/jobs/{jobId}/cancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    /// Dialect the daemon speaks.
    pub protocol_version: u32,
    /// `true` when the job transitioned to `canceled`; `false` when it was
    /// already terminal.
    pub ok: bool,
}

/// Response body for `GET /healthz`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Dialect the daemon speaks.
    pub protocol_version: u32,
    /// Always `"ok"` when the daemon can answer at all.
    pub status: String,
}

impl HealthResponse {
    /// The canonical healthy response.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            status: "ok".to_string(),
        }
    }
}

/// Error body returned with any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Dialect the daemon speaks.
    pub protocol_version: u32,
    /// Machine-readable detail.
    pub error: ErrorDetail,
}

/// Machine-readable error detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    /// Stable error code (e.g. `notFound`, `badRequest`, `internal`).
    pub code: String,
    /// Human-readable message; safe to show an operator.
    pub message: String,
}

impl ErrorBody {
    /// Builds an error body with the current protocol version.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}
