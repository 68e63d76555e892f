//! Job records, kinds, statuses, and the append-only audit trail.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A job kind the queue knows how to carry.
///
/// This is a closed enumeration: adding a payload shape means adding a
/// variant here, not passing a free-form string. Unknown kinds are rejected
/// at protocol decode time, before any queue mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// Provision a new cattle instance.
    #[serde(rename = "cattle.spawn")]
    CattleSpawn,

    /// Tear down an existing cattle instance.
    #[serde(rename = "cattle.reap")]
    CattleReap,
}

impl JobKind {
    /// Stable string tag used on the wire and in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CattleSpawn => "cattle.spawn",
            Self::CattleReap => "cattle.reap",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for a kind tag outside the closed enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown job kind: {0}")]
pub struct UnknownJobKind(pub String);

impl std::str::FromStr for JobKind {
    type Err = UnknownJobKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cattle.spawn" => Ok(Self::CattleSpawn),
            "cattle.reap" => Ok(Self::CattleReap),
            other => Err(UnknownJobKind(other.to_string())),
        }
    }
}

/// Lifecycle status of a job.
///
/// `Done`, `Failed`, and `Canceled` are terminal: no transition leaves them
/// except deletion by pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed (or re-claimed after a retry).
    Queued,
    /// Exclusively held by a worker under a live lease.
    Running,
    /// Acked by the lease holder.
    Done,
    /// Exhausted its attempts.
    Failed,
    /// Canceled by an operator.
    Canceled,
}

impl JobStatus {
    /// Stable string tag used on the wire and in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Returns `true` for statuses no further transition leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for a status tag outside the known set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown job status: {0}")]
pub struct UnknownJobStatus(pub String);

impl std::str::FromStr for JobStatus {
    type Err = UnknownJobStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(UnknownJobStatus(other.to_string())),
        }
    }
}

/// A unit of deferred work as stored by the queue.
///
/// The payload is opaque to the queue itself; it is validated against the
/// kind's schema only at the edges (protocol layer, payload executors).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Opaque caller-visible identity.
    pub job_id: String,
    /// Closed-enum payload tag.
    pub kind: JobKind,
    /// Kind-specific structured data, uninterpreted by the queue.
    pub payload: serde_json::Value,
    /// Identity of the enqueuing principal.
    pub requester: String,
    /// Dedup token scoped per requester. Empty means "never dedup".
    pub idempotency_key: String,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Higher claims first.
    pub priority: i64,
    /// Earliest claim time (ms since epoch).
    pub run_at_ms: i64,
    /// Creation time (ms since epoch).
    pub created_at_ms: i64,
    /// Last mutation time (ms since epoch).
    pub updated_at_ms: i64,
    /// Failures so far; starts at 0, incremented by each `fail`.
    pub attempt: u32,
    /// Attempt ceiling after which the job fails permanently.
    pub max_attempts: u32,
    /// Exclusive holder while running.
    pub locked_by: Option<String>,
    /// Lease expiry while running (ms since epoch).
    pub lease_until_ms: Option<i64>,
    /// Last failure message reported via `fail`.
    pub last_error: Option<String>,
    /// Terminal success payload stored by `ack`.
    pub result: Option<serde_json::Value>,
}

/// A single append-only audit entry for a job transition.
///
/// Events are write-only from the queue's perspective and cascade-deleted
/// with their job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    /// Row id, monotonically increasing per store.
    pub id: i64,
    /// The job this event belongs to.
    pub job_id: String,
    /// Transition tag (`enqueued`, `claimed`, `reclaimed`, `acked`,
    /// `retried`, `failed`, `canceled`).
    pub event_type: String,
    /// Optional human-readable detail (e.g. the failure message).
    pub message: Option<String>,
    /// Attempt counter at the time of the event.
    pub attempt: u32,
    /// Event time (ms since epoch).
    pub created_at_ms: i64,
}
