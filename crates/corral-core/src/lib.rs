//! corral-core — durable lease-based job queue for cattle fleets.
//!
//! This crate is the core of the corral control plane. It provides:
//!
//! - [`storage`]: an embedded `SQLite` store with forward-only,
//!   version-gated schema migrations.
//! - [`queue`]: the lease-based task queue (enqueue, claim, ack, fail,
//!   cancel, prune) built on optimistic conditional updates, so mutual
//!   exclusion is anchored in the storage engine's transaction guarantees
//!   rather than in-process locks.
//! - [`token`]: one-time bootstrap credentials handed to freshly spawned
//!   instances; only a one-way hash of a token is ever persisted.
//! - [`protocol`]: the versioned request/response payloads shared by the
//!   daemon and its clients.
//! - [`channel`]: file-permission validation that makes the daemon's Unix
//!   socket safe to use as a trust boundary.
//!
//! The queue is payload-agnostic: it stores and returns opaque JSON blobs
//! and never interprets them. Executors interpret [`job::JobKind`] and
//! report outcomes via `ack`/`fail`.

pub mod channel;
pub mod job;
pub mod protocol;
pub mod queue;
pub mod storage;
pub mod token;

pub use job::{Job, JobEvent, JobKind, JobStatus};
pub use protocol::PROTOCOL_VERSION;
pub use queue::{QueueEngine, QueueError, QueuePolicy};
pub use storage::{Store, StorageError};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in integer milliseconds since the Unix epoch.
///
/// All queue timestamps (`run_at`, `lease_until`, `created_at`, ...) use
/// this representation.
#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
