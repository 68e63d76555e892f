//! Lease-based task queue over the storage engine.
//!
//! Every mutation is a single transaction whose decisive step is a
//! conditional `UPDATE ... WHERE` (compare-and-swap): a claim, ack, fail,
//! or lease extension only takes effect if the row still satisfies the
//! caller's precondition. A zero-row update means the caller lost the race
//! or the lease, which is a normal "stop working" signal — never an error.
//!
//! Ordering among eligible jobs is deterministic: priority descending, then
//! `run_at` ascending, then `created_at` ascending. Jobs whose lease has
//! expired are re-claimable as if still queued; that is the whole crash
//! recovery story.

use rusqlite::{named_params, OptionalExtension, Transaction};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::job::{Job, JobEvent, JobKind, JobStatus};
use crate::storage::{StorageError, Store};
use crate::now_ms;

/// Policy defaults for the queue.
///
/// These are configuration, not hard-coded behavior: every operation that
/// consults a default also accepts an explicit override.
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    /// Attempt ceiling applied when `enqueue` does not specify one.
    pub default_max_attempts: u32,
    /// Lease duration applied when `claim_next` does not specify one.
    pub default_lease_ms: i64,
    /// Base of the exponential retry backoff.
    pub retry_base_ms: i64,
    /// Ceiling of the exponential retry backoff.
    pub retry_max_ms: i64,
    /// Lifetime of a bootstrap token when `create` does not specify one.
    pub token_ttl_ms: i64,
    /// Retention window for pruning terminal jobs.
    pub prune_keep_days: i64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            default_max_attempts: 5,
            default_lease_ms: 30_000,
            retry_base_ms: 1_000,
            retry_max_ms: 300_000,
            token_ttl_ms: 900_000,
            prune_keep_days: 7,
        }
    }
}

/// Errors raised by queue operations.
///
/// Lease-ownership misses are deliberately *not* here: they come back as
/// `Ok(false)` / `Ok(None)` because losing a lease is an expected outcome.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// Storage-layer failure; the transaction did not apply.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Database failure; the transaction did not apply.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Payload or result blob could not be (de)serialized.
    #[error("payload serialization error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Parameters for [`QueueEngine::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueJob {
    /// Payload shape tag.
    pub kind: JobKind,
    /// Kind-specific data, stored opaquely.
    pub payload: serde_json::Value,
    /// Identity of the enqueuing principal.
    pub requester: String,
    /// Dedup token; empty means "never dedup".
    pub idempotency_key: String,
    /// Earliest claim time; defaults to now.
    pub run_at_ms: Option<i64>,
    /// Higher claims first; defaults to 0.
    pub priority: Option<i64>,
    /// Attempt ceiling; defaults to the policy value.
    pub max_attempts: Option<u32>,
    /// Clock override for tests.
    pub now_ms: Option<i64>,
}

impl EnqueueJob {
    /// Convenience constructor with all optional fields unset.
    #[must_use]
    pub fn new(kind: JobKind, payload: serde_json::Value, requester: impl Into<String>) -> Self {
        Self {
            kind,
            payload,
            requester: requester.into(),
            idempotency_key: String::new(),
            run_at_ms: None,
            priority: None,
            max_attempts: None,
            now_ms: None,
        }
    }
}

/// Result of [`QueueEngine::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    /// Identity of the new (or pre-existing, when deduped) job.
    pub job_id: String,
    /// `true` when an existing `(requester, idempotency_key)` row was
    /// returned instead of inserting a new one.
    pub deduped: bool,
}

/// Parameters for [`QueueEngine::claim_next`].
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Identity of the claiming worker; recorded as the lease holder.
    pub worker_id: String,
    /// Lease duration; defaults to the policy value.
    pub lease_ms: Option<i64>,
    /// Clock override for tests.
    pub now_ms: Option<i64>,
}

/// Parameters for [`QueueEngine::fail`].
#[derive(Debug, Clone)]
pub struct FailRequest {
    /// The job being failed.
    pub job_id: String,
    /// The worker reporting the failure; must hold the lease.
    pub worker_id: String,
    /// Failure message recorded as `last_error`.
    pub error: String,
    /// Backoff override; defaults to the policy values.
    pub retry: Option<RetryBackoff>,
    /// Clock override for tests.
    pub now_ms: Option<i64>,
}

/// Exponential backoff parameters: `min(max_ms, base_ms * 2^attempt)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    /// Backoff base.
    pub base_ms: i64,
    /// Backoff ceiling.
    pub max_ms: i64,
}

/// Outcome of [`QueueEngine::fail`] when the caller held the lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job went back to `queued` for a later retry.
    Queued {
        /// When the retry becomes claimable.
        run_at_ms: i64,
    },
    /// The job exhausted its attempts and is permanently `failed`.
    Failed,
}

/// Filters for [`QueueEngine::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Only jobs enqueued by this principal.
    pub requester: Option<String>,
    /// Only jobs in one of these statuses (empty = all).
    pub statuses: Vec<JobStatus>,
    /// Only jobs of one of these kinds (empty = all).
    pub kinds: Vec<JobKind>,
    /// Row cap; defaults to [`DEFAULT_LIST_LIMIT`], capped at
    /// [`MAX_LIST_LIMIT`].
    pub limit: Option<u32>,
}

/// Default row cap for `list`.
pub const DEFAULT_LIST_LIMIT: u32 = 50;

/// Hard row cap for `list`.
pub const MAX_LIST_LIMIT: u32 = 500;

const JOB_COLUMNS: &str = "job_id, kind, payload, requester, idempotency_key, status, priority, \
                           run_at, created_at, updated_at, attempt, max_attempts, locked_by, \
                           lease_until, last_error, result";

/// The lease-based job queue.
///
/// Holds the shared [`Store`] by value (dependency injection, not a
/// module-level singleton), so tests can run against isolated in-memory
/// stores.
#[derive(Debug, Clone)]
pub struct QueueEngine {
    pub(crate) store: Store,
    pub(crate) policy: QueuePolicy,
}

impl QueueEngine {
    /// Creates an engine with the default [`QueuePolicy`].
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self::with_policy(store, QueuePolicy::default())
    }

    /// Creates an engine with an explicit policy.
    #[must_use]
    pub fn with_policy(store: Store, policy: QueuePolicy) -> Self {
        Self { store, policy }
    }

    /// The policy this engine applies when callers omit overrides.
    #[must_use]
    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Inserts a new `queued` job, or returns the existing one when the
    /// `(requester, idempotency_key)` pair has been seen before.
    pub fn enqueue(&self, req: &EnqueueJob) -> Result<Enqueued, QueueError> {
        let now = req.now_ms.unwrap_or_else(now_ms);
        let run_at = req.run_at_ms.unwrap_or(now);
        let priority = req.priority.unwrap_or(0);
        let max_attempts = req
            .max_attempts
            .unwrap_or(self.policy.default_max_attempts)
            .max(1);
        let payload = serde_json::to_vec(&req.payload)?;

        let mut conn = self.store.conn();
        let tx = conn.transaction()?;

        if !req.idempotency_key.is_empty() {
            let existing = tx
                .query_row(
                    "SELECT job_id FROM jobs WHERE requester = :requester \
                     AND idempotency_key = :key",
                    named_params! {
                        ":requester": req.requester,
                        ":key": req.idempotency_key,
                    },
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            if let Some(job_id) = existing {
                debug!(job_id, requester = %req.requester, "enqueue deduped");
                return Ok(Enqueued {
                    job_id,
                    deduped: true,
                });
            }
        }

        let job_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO jobs (job_id, kind, payload, requester, idempotency_key, status, \
                               priority, run_at, created_at, updated_at, attempt, max_attempts) \
             VALUES (:job_id, :kind, :payload, :requester, :key, 'queued', \
                     :priority, :run_at, :now, :now, 0, :max_attempts)",
            named_params! {
                ":job_id": job_id,
                ":kind": req.kind.as_str(),
                ":payload": payload,
                ":requester": req.requester,
                ":key": req.idempotency_key,
                ":priority": priority,
                ":run_at": run_at,
                ":now": now,
                ":max_attempts": max_attempts,
            },
        )?;
        record_event(&tx, &job_id, "enqueued", None, 0, now)?;
        tx.commit()?;

        debug!(job_id, kind = %req.kind, requester = %req.requester, "enqueued job");
        Ok(Enqueued {
            job_id,
            deduped: false,
        })
    }

    /// Fetches a job by id.
    pub fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let conn = self.store.conn();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = :job_id"),
                named_params! { ":job_id": job_id },
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Lists jobs matching `filter`, newest first.
    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(requester) = &filter.requester {
            args.push(Box::new(requester.clone()));
            clauses.push(format!("requester = ?{}", args.len()));
        }
        if !filter.statuses.is_empty() {
            let mut placeholders = Vec::new();
            for status in &filter.statuses {
                args.push(Box::new(status.as_str()));
                placeholders.push(format!("?{}", args.len()));
            }
            clauses.push(format!("status IN ({})", placeholders.join(", ")));
        }
        if !filter.kinds.is_empty() {
            let mut placeholders = Vec::new();
            for kind in &filter.kinds {
                args.push(Box::new(kind.as_str()));
                placeholders.push(format!("?{}", args.len()));
            }
            clauses.push(format!("kind IN ({})", placeholders.join(", ")));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let limit = filter.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
        args.push(Box::new(limit));
        sql.push_str(&format!(
            " ORDER BY created_at DESC, job_id ASC LIMIT ?{}",
            args.len()
        ));

        let conn = self.store.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(AsRef::as_ref)),
            job_from_row,
        )?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Claims the next eligible job for `worker_id`, or returns `None`.
    ///
    /// Eligible means `queued` with `run_at` due, or `running` with an
    /// expired lease (crashed-worker recovery). Selection order is priority
    /// descending, `run_at` ascending, `created_at` ascending. The claim
    /// itself is a conditional update; on a lost race the next candidate is
    /// tried.
    pub fn claim_next(&self, req: &ClaimRequest) -> Result<Option<Job>, QueueError> {
        let now = req.now_ms.unwrap_or_else(now_ms);
        let lease_ms = req.lease_ms.unwrap_or(self.policy.default_lease_ms).max(1);
        let lease_until = now.saturating_add(lease_ms);

        let mut conn = self.store.conn();
        let tx = conn.transaction()?;

        let claimed = loop {
            let candidate = tx
                .query_row(
                    "SELECT job_id, status FROM jobs \
                     WHERE (status = 'queued' AND run_at <= :now) \
                        OR (status = 'running' AND lease_until < :now) \
                     ORDER BY priority DESC, run_at ASC, created_at ASC \
                     LIMIT 1",
                    named_params! { ":now": now },
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;

            let Some((job_id, prev_status)) = candidate else {
                return Ok(None);
            };

            let changed = tx.execute(
                "UPDATE jobs SET status = 'running', locked_by = :worker, \
                                 lease_until = :lease_until, updated_at = :now \
                 WHERE job_id = :job_id \
                   AND ((status = 'queued' AND run_at <= :now) \
                        OR (status = 'running' AND lease_until < :now))",
                named_params! {
                    ":worker": req.worker_id,
                    ":lease_until": lease_until,
                    ":now": now,
                    ":job_id": job_id,
                },
            )?;
            if changed == 1 {
                break (job_id, prev_status);
            }
            // Lost the race on this candidate; pick the next one.
        };

        let (job_id, prev_status) = claimed;
        let job = tx
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = :job_id"),
                named_params! { ":job_id": job_id },
                job_from_row,
            )
            .optional()?;
        let event = if prev_status == "running" {
            "reclaimed"
        } else {
            "claimed"
        };
        let attempt = job.as_ref().map_or(0, |j| j.attempt);
        record_event(&tx, &job_id, event, Some(&req.worker_id), attempt, now)?;
        tx.commit()?;

        debug!(job_id, worker = %req.worker_id, event, "claimed job");
        Ok(job)
    }

    /// Pushes the lease of a running job forward.
    ///
    /// Returns `false` without side effects when the caller no longer holds
    /// a live lease; the caller must stop working on the job.
    pub fn extend_lease(
        &self,
        job_id: &str,
        worker_id: &str,
        lease_until_ms: i64,
        now_ms_override: Option<i64>,
    ) -> Result<bool, QueueError> {
        let now = now_ms_override.unwrap_or_else(now_ms);
        let conn = self.store.conn();
        let changed = conn.execute(
            "UPDATE jobs SET lease_until = :lease_until, updated_at = :now \
             WHERE job_id = :job_id AND status = 'running' \
               AND locked_by = :worker AND lease_until >= :now",
            named_params! {
                ":lease_until": lease_until_ms,
                ":now": now,
                ":job_id": job_id,
                ":worker": worker_id,
            },
        )?;
        Ok(changed == 1)
    }

    /// Marks a running job `done` and stores its result.
    ///
    /// Returns `false` when the caller no longer holds a live lease.
    pub fn ack(
        &self,
        job_id: &str,
        worker_id: &str,
        result: Option<&serde_json::Value>,
        now_ms_override: Option<i64>,
    ) -> Result<bool, QueueError> {
        let now = now_ms_override.unwrap_or_else(now_ms);
        let result_blob = result.map(serde_json::to_vec).transpose()?;

        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE jobs SET status = 'done', result = :result, locked_by = NULL, \
                             lease_until = NULL, updated_at = :now \
             WHERE job_id = :job_id AND status = 'running' \
               AND locked_by = :worker AND lease_until >= :now",
            named_params! {
                ":result": result_blob,
                ":now": now,
                ":job_id": job_id,
                ":worker": worker_id,
            },
        )?;
        if changed == 1 {
            let attempt = job_attempt(&tx, job_id)?;
            record_event(&tx, job_id, "acked", Some(worker_id), attempt, now)?;
            tx.commit()?;
            debug!(job_id, worker = worker_id, "acked job");
            return Ok(true);
        }
        Ok(false)
    }

    /// Reports a failure for a running job.
    ///
    /// Increments the attempt counter; below the ceiling the job goes back
    /// to `queued` with exponential backoff, otherwise it becomes
    /// permanently `failed`. Returns `None` when the caller no longer holds
    /// a live lease.
    pub fn fail(&self, req: &FailRequest) -> Result<Option<FailOutcome>, QueueError> {
        let now = req.now_ms.unwrap_or_else(now_ms);
        let backoff = req.retry.unwrap_or(RetryBackoff {
            base_ms: self.policy.retry_base_ms,
            max_ms: self.policy.retry_max_ms,
        });

        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let counters = tx
            .query_row(
                "SELECT attempt, max_attempts FROM jobs \
                 WHERE job_id = :job_id AND status = 'running' \
                   AND locked_by = :worker AND lease_until >= :now",
                named_params! {
                    ":job_id": req.job_id,
                    ":worker": req.worker_id,
                    ":now": now,
                },
                |row| Ok((row.get::<_, u32>(0)?, row.get::<_, u32>(1)?)),
            )
            .optional()?;

        let Some((attempt, max_attempts)) = counters else {
            return Ok(None);
        };
        let next_attempt = attempt + 1;

        let outcome = if next_attempt < max_attempts {
            let run_at = now.saturating_add(backoff_ms(backoff.base_ms, backoff.max_ms, next_attempt));
            tx.execute(
                "UPDATE jobs SET status = 'queued', attempt = :attempt, run_at = :run_at, \
                                 locked_by = NULL, lease_until = NULL, \
                                 last_error = :error, updated_at = :now \
                 WHERE job_id = :job_id",
                named_params! {
                    ":attempt": next_attempt,
                    ":run_at": run_at,
                    ":error": req.error,
                    ":now": now,
                    ":job_id": req.job_id,
                },
            )?;
            record_event(&tx, &req.job_id, "retried", Some(&req.error), next_attempt, now)?;
            FailOutcome::Queued { run_at_ms: run_at }
        } else {
            tx.execute(
                "UPDATE jobs SET status = 'failed', attempt = :attempt, locked_by = NULL, \
                                 lease_until = NULL, last_error = :error, updated_at = :now \
                 WHERE job_id = :job_id",
                named_params! {
                    ":attempt": next_attempt,
                    ":error": req.error,
                    ":now": now,
                    ":job_id": req.job_id,
                },
            )?;
            record_event(&tx, &req.job_id, "failed", Some(&req.error), next_attempt, now)?;
            FailOutcome::Failed
        };
        tx.commit()?;

        debug!(job_id = %req.job_id, ?outcome, "failed job attempt");
        Ok(Some(outcome))
    }

    /// Cancels a `queued` or `running` job.
    ///
    /// Returns `false` when the job does not exist or is already terminal.
    pub fn cancel(&self, job_id: &str, now_ms_override: Option<i64>) -> Result<bool, QueueError> {
        let now = now_ms_override.unwrap_or_else(now_ms);
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE jobs SET status = 'canceled', locked_by = NULL, lease_until = NULL, \
                             updated_at = :now \
             WHERE job_id = :job_id AND status IN ('queued', 'running')",
            named_params! { ":now": now, ":job_id": job_id },
        )?;
        if changed == 1 {
            let attempt = job_attempt(&tx, job_id)?;
            record_event(&tx, job_id, "canceled", None, attempt, now)?;
            tx.commit()?;
            debug!(job_id, "canceled job");
            return Ok(true);
        }
        Ok(false)
    }

    /// Deletes terminal jobs older than `keep_days`; returns the count.
    ///
    /// Never touches non-terminal jobs. Audit events cascade with their
    /// job.
    pub fn prune(&self, keep_days: i64, now_ms_override: Option<i64>) -> Result<u64, QueueError> {
        let now = now_ms_override.unwrap_or_else(now_ms);
        let cutoff = now.saturating_sub(keep_days.max(0).saturating_mul(86_400_000));
        let conn = self.store.conn();
        let deleted = conn.execute(
            "DELETE FROM jobs WHERE status IN ('done', 'failed', 'canceled') \
             AND updated_at < :cutoff",
            named_params! { ":cutoff": cutoff },
        )?;
        if deleted > 0 {
            debug!(deleted, "pruned terminal jobs");
        }
        Ok(deleted as u64)
    }

    /// Reads the append-only audit trail for a job, oldest first.
    pub fn events(&self, job_id: &str) -> Result<Vec<JobEvent>, QueueError> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, event_type, message, attempt, created_at \
             FROM job_events WHERE job_id = :job_id ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(named_params! { ":job_id": job_id }, |row| {
            Ok(JobEvent {
                id: row.get(0)?,
                job_id: row.get(1)?,
                event_type: row.get(2)?,
                message: row.get(3)?,
                attempt: row.get(4)?,
                created_at_ms: row.get(5)?,
            })
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}

/// `min(max_ms, base_ms * 2^attempt)`, saturating.
fn backoff_ms(base_ms: i64, max_ms: i64, attempt: u32) -> i64 {
    let factor = 2_i64.saturating_pow(attempt.min(30));
    base_ms.saturating_mul(factor).min(max_ms)
}

fn job_attempt(tx: &Transaction<'_>, job_id: &str) -> rusqlite::Result<u32> {
    tx.query_row(
        "SELECT attempt FROM jobs WHERE job_id = :job_id",
        named_params! { ":job_id": job_id },
        |row| row.get(0),
    )
}

fn record_event(
    tx: &Transaction<'_>,
    job_id: &str,
    event_type: &str,
    message: Option<&str>,
    attempt: u32,
    now: i64,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO job_events (job_id, event_type, message, attempt, created_at) \
         VALUES (:job_id, :event_type, :message, :attempt, :now)",
        named_params! {
            ":job_id": job_id,
            ":event_type": event_type,
            ":message": message,
            ":attempt": attempt,
            ":now": now,
        },
    )?;
    Ok(())
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    fn conversion_err(
        idx: usize,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    }

    let kind: String = row.get(1)?;
    let kind = kind
        .parse::<JobKind>()
        .map_err(|e| conversion_err(1, e))?;
    let payload: Vec<u8> = row.get(2)?;
    let payload: serde_json::Value =
        serde_json::from_slice(&payload).map_err(|e| conversion_err(2, e))?;
    let status: String = row.get(5)?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| conversion_err(5, e))?;
    let result: Option<Vec<u8>> = row.get(15)?;
    let result = result
        .map(|bytes| serde_json::from_slice(&bytes))
        .transpose()
        .map_err(|e| conversion_err(15, e))?;

    Ok(Job {
        job_id: row.get(0)?,
        kind,
        payload,
        requester: row.get(3)?,
        idempotency_key: row.get(4)?,
        status,
        priority: row.get(6)?,
        run_at_ms: row.get(7)?,
        created_at_ms: row.get(8)?,
        updated_at_ms: row.get(9)?,
        attempt: row.get(10)?,
        max_attempts: row.get(11)?,
        locked_by: row.get(12)?,
        lease_until_ms: row.get(13)?,
        last_error: row.get(14)?,
        result,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn engine() -> QueueEngine {
        QueueEngine::new(Store::in_memory().unwrap())
    }

    fn spawn_req(requester: &str) -> EnqueueJob {
        EnqueueJob::new(JobKind::CattleSpawn, json!({"image": "nixos-24.05"}), requester)
    }

    fn claim(engine: &QueueEngine, worker: &str, now: i64) -> Option<Job> {
        engine
            .claim_next(&ClaimRequest {
                worker_id: worker.to_string(),
                lease_ms: Some(1_000),
                now_ms: Some(now),
            })
            .unwrap()
    }

    #[test]
    fn enqueue_assigns_defaults() {
        let q = engine();
        let enqueued = q
            .enqueue(&EnqueueJob {
                now_ms: Some(10),
                ..spawn_req("alice")
            })
            .unwrap();
        assert!(!enqueued.deduped);

        let job = q.get(&enqueued.job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, 0);
        assert_eq!(job.run_at_ms, 10);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.locked_by, None);
        assert_eq!(job.payload, json!({"image": "nixos-24.05"}));
    }

    #[test]
    fn enqueue_dedups_on_idempotency_key() {
        let q = engine();
        let req = EnqueueJob {
            idempotency_key: "spawn-web-1".to_string(),
            ..spawn_req("alice")
        };
        let first = q.enqueue(&req).unwrap();
        let second = q.enqueue(&req).unwrap();

        assert!(!first.deduped);
        assert!(second.deduped);
        assert_eq!(first.job_id, second.job_id);

        let jobs = q.list(&JobFilter::default()).unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn enqueue_dedup_is_scoped_per_requester() {
        let q = engine();
        let a = q
            .enqueue(&EnqueueJob {
                idempotency_key: "k".to_string(),
                ..spawn_req("alice")
            })
            .unwrap();
        let b = q
            .enqueue(&EnqueueJob {
                idempotency_key: "k".to_string(),
                ..spawn_req("bob")
            })
            .unwrap();
        assert_ne!(a.job_id, b.job_id);
        assert!(!b.deduped);
    }

    #[test]
    fn empty_idempotency_key_never_dedups() {
        let q = engine();
        let a = q.enqueue(&spawn_req("alice")).unwrap();
        let b = q.enqueue(&spawn_req("alice")).unwrap();
        assert_ne!(a.job_id, b.job_id);
    }

    #[test]
    fn claim_orders_by_priority_then_run_at_then_created_at() {
        let q = engine();
        let low = q
            .enqueue(&EnqueueJob {
                kind: JobKind::CattleReap,
                priority: Some(1),
                run_at_ms: Some(5),
                now_ms: Some(1),
                ..spawn_req("ops")
            })
            .unwrap();
        let high = q
            .enqueue(&EnqueueJob {
                priority: Some(5),
                run_at_ms: Some(8),
                now_ms: Some(2),
                ..spawn_req("ops")
            })
            .unwrap();

        // Higher priority wins regardless of insertion order and run_at.
        let first = claim(&q, "w1", 100).unwrap();
        assert_eq!(first.job_id, high.job_id);
        assert_eq!(first.kind, JobKind::CattleSpawn);

        let second = claim(&q, "w1", 100).unwrap();
        assert_eq!(second.job_id, low.job_id);

        assert!(claim(&q, "w1", 100).is_none());
    }

    #[test]
    fn claim_breaks_priority_ties_by_run_at() {
        let q = engine();
        let later = q
            .enqueue(&EnqueueJob {
                run_at_ms: Some(50),
                now_ms: Some(1),
                ..spawn_req("ops")
            })
            .unwrap();
        let earlier = q
            .enqueue(&EnqueueJob {
                run_at_ms: Some(10),
                now_ms: Some(2),
                ..spawn_req("ops")
            })
            .unwrap();

        assert_eq!(claim(&q, "w", 100).unwrap().job_id, earlier.job_id);
        assert_eq!(claim(&q, "w", 100).unwrap().job_id, later.job_id);
    }

    #[test]
    fn delayed_job_is_not_claimable_before_run_at() {
        let q = engine();
        q.enqueue(&EnqueueJob {
            run_at_ms: Some(1_000),
            now_ms: Some(0),
            ..spawn_req("ops")
        })
        .unwrap();

        assert!(claim(&q, "w", 999).is_none());
        assert!(claim(&q, "w", 1_000).is_some());
    }

    #[test]
    fn claim_sets_lease_fields() {
        let q = engine();
        q.enqueue(&EnqueueJob {
            now_ms: Some(0),
            ..spawn_req("ops")
        })
        .unwrap();

        let job = claim(&q, "worker-7", 100).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.locked_by.as_deref(), Some("worker-7"));
        assert_eq!(job.lease_until_ms, Some(1_100));
    }

    #[test]
    fn expired_lease_is_reclaimed_and_old_holder_loses() {
        let q = engine();
        let id = q
            .enqueue(&EnqueueJob {
                now_ms: Some(0),
                ..spawn_req("ops")
            })
            .unwrap()
            .job_id;

        let held = claim(&q, "w1", 0).unwrap();
        assert_eq!(held.lease_until_ms, Some(1_000));

        // Still held: nothing to claim.
        assert!(claim(&q, "w2", 500).is_none());

        // Lease expired: a different worker reclaims the same job.
        let reclaimed = claim(&q, "w2", 1_001).unwrap();
        assert_eq!(reclaimed.job_id, id);
        assert_eq!(reclaimed.locked_by.as_deref(), Some("w2"));

        // The original holder lost every lease-gated right.
        assert!(!q.ack(&id, "w1", None, Some(1_002)).unwrap());
        assert!(!q.extend_lease(&id, "w1", 5_000, Some(1_002)).unwrap());
        assert!(q
            .fail(&FailRequest {
                job_id: id.clone(),
                worker_id: "w1".to_string(),
                error: "too late".to_string(),
                retry: None,
                now_ms: Some(1_002),
            })
            .unwrap()
            .is_none());

        // The new holder still can ack.
        assert!(q.ack(&id, "w2", None, Some(1_500)).unwrap());
    }

    #[test]
    fn ack_stores_result_and_clears_lock() {
        let q = engine();
        let id = q
            .enqueue(&EnqueueJob {
                now_ms: Some(0),
                ..spawn_req("ops")
            })
            .unwrap()
            .job_id;
        claim(&q, "w", 0).unwrap();

        let result = json!({"instance": "i-0abc", "ip": "10.0.0.7"});
        assert!(q.ack(&id, "w", Some(&result), Some(100)).unwrap());

        let job = q.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.result, Some(result));
        assert_eq!(job.locked_by, None);
        assert_eq!(job.lease_until_ms, None);

        // Acking a done job is a lease miss, not an error.
        assert!(!q.ack(&id, "w", None, Some(101)).unwrap());
    }

    #[test]
    fn extend_lease_requires_ownership() {
        let q = engine();
        let id = q
            .enqueue(&EnqueueJob {
                now_ms: Some(0),
                ..spawn_req("ops")
            })
            .unwrap()
            .job_id;
        claim(&q, "w1", 0).unwrap();

        assert!(q.extend_lease(&id, "w1", 10_000, Some(500)).unwrap());
        let job = q.get(&id).unwrap().unwrap();
        assert_eq!(job.lease_until_ms, Some(10_000));

        assert!(!q.extend_lease(&id, "w2", 20_000, Some(500)).unwrap());
    }

    #[test]
    fn fail_retries_with_strictly_increasing_backoff_then_fails() {
        let q = engine();
        let id = q
            .enqueue(&EnqueueJob {
                max_attempts: Some(3),
                now_ms: Some(0),
                ..spawn_req("ops")
            })
            .unwrap()
            .job_id;

        let fail_at = |now: i64| {
            q.fail(&FailRequest {
                job_id: id.clone(),
                worker_id: "w".to_string(),
                error: "provider timeout".to_string(),
                retry: None,
                now_ms: Some(now),
            })
            .unwrap()
        };

        // First failure: back to queued with a delay.
        claim(&q, "w", 0).unwrap();
        let Some(FailOutcome::Queued { run_at_ms: first }) = fail_at(10) else {
            panic!("expected retry");
        };
        assert!(first > 10);

        // Second failure: strictly larger delay.
        claim(&q, "w", first).unwrap();
        let Some(FailOutcome::Queued { run_at_ms: second }) = fail_at(first) else {
            panic!("expected retry");
        };
        assert!(second - first > first - 10);

        // Third failure: permanent.
        claim(&q, "w", second).unwrap();
        assert_eq!(fail_at(second), Some(FailOutcome::Failed));

        let job = q.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt, 3);
        assert_eq!(job.last_error.as_deref(), Some("provider timeout"));

        // Never claimable again.
        assert!(claim(&q, "w", i64::MAX - 1_000_000).is_none());
    }

    #[test]
    fn backoff_formula_caps_at_max() {
        assert_eq!(backoff_ms(1_000, 300_000, 1), 2_000);
        assert_eq!(backoff_ms(1_000, 300_000, 2), 4_000);
        assert_eq!(backoff_ms(1_000, 300_000, 10), 300_000);
        assert_eq!(backoff_ms(1_000, 300_000, 60), 300_000);
    }

    #[test]
    fn cancel_covers_queued_and_running_but_not_terminal() {
        let q = engine();
        let queued = q
            .enqueue(&EnqueueJob {
                now_ms: Some(0),
                ..spawn_req("ops")
            })
            .unwrap()
            .job_id;
        assert!(q.cancel(&queued, Some(1)).unwrap());
        assert_eq!(
            q.get(&queued).unwrap().unwrap().status,
            JobStatus::Canceled
        );

        let running = q
            .enqueue(&EnqueueJob {
                now_ms: Some(0),
                ..spawn_req("ops")
            })
            .unwrap()
            .job_id;
        claim(&q, "w", 0).unwrap();
        assert!(q.cancel(&running, Some(1)).unwrap());
        let job = q.get(&running).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.locked_by, None);

        // Terminal: idempotent-false.
        assert!(!q.cancel(&queued, Some(2)).unwrap());
        assert!(!q.cancel("no-such-job", Some(2)).unwrap());
    }

    #[test]
    fn prune_only_removes_old_terminal_jobs() {
        let q = engine();
        let day_ms = 86_400_000;

        let old_done = q
            .enqueue(&EnqueueJob {
                now_ms: Some(0),
                ..spawn_req("ops")
            })
            .unwrap()
            .job_id;
        claim(&q, "w", 0).unwrap();
        assert!(q.ack(&old_done, "w", None, Some(10)).unwrap());

        let still_queued = q
            .enqueue(&EnqueueJob {
                now_ms: Some(0),
                ..spawn_req("ops")
            })
            .unwrap()
            .job_id;

        let fresh_canceled = q
            .enqueue(&EnqueueJob {
                now_ms: Some(9 * day_ms),
                ..spawn_req("ops")
            })
            .unwrap()
            .job_id;
        assert!(q.cancel(&fresh_canceled, Some(9 * day_ms)).unwrap());

        let deleted = q.prune(7, Some(10 * day_ms)).unwrap();
        assert_eq!(deleted, 1);
        assert!(q.get(&old_done).unwrap().is_none());
        assert!(q.get(&still_queued).unwrap().is_some());
        assert!(q.get(&fresh_canceled).unwrap().is_some());

        // Events cascade with the pruned job.
        assert!(q.events(&old_done).unwrap().is_empty());
    }

    #[test]
    fn audit_trail_records_transitions() {
        let q = engine();
        let id = q
            .enqueue(&EnqueueJob {
                max_attempts: Some(2),
                now_ms: Some(0),
                ..spawn_req("ops")
            })
            .unwrap()
            .job_id;
        claim(&q, "w", 0).unwrap();
        q.fail(&FailRequest {
            job_id: id.clone(),
            worker_id: "w".to_string(),
            error: "boom".to_string(),
            retry: None,
            now_ms: Some(10),
        })
        .unwrap();

        let types: Vec<String> = q
            .events(&id)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, ["enqueued", "claimed", "retried"]);
    }

    #[test]
    fn list_filters_and_orders_newest_first() {
        let q = engine();
        let a = q
            .enqueue(&EnqueueJob {
                now_ms: Some(1),
                ..spawn_req("alice")
            })
            .unwrap()
            .job_id;
        let b = q
            .enqueue(&EnqueueJob {
                kind: JobKind::CattleReap,
                now_ms: Some(2),
                ..spawn_req("alice")
            })
            .unwrap()
            .job_id;
        q.enqueue(&EnqueueJob {
            now_ms: Some(3),
            ..spawn_req("bob")
        })
        .unwrap();

        let alices = q
            .list(&JobFilter {
                requester: Some("alice".to_string()),
                ..JobFilter::default()
            })
            .unwrap();
        let ids: Vec<&str> = alices.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, [b.as_str(), a.as_str()]);

        let reaps = q
            .list(&JobFilter {
                kinds: vec![JobKind::CattleReap],
                ..JobFilter::default()
            })
            .unwrap();
        assert_eq!(reaps.len(), 1);
        assert_eq!(reaps[0].job_id, b);

        let queued = q
            .list(&JobFilter {
                statuses: vec![JobStatus::Queued],
                limit: Some(1),
                ..JobFilter::default()
            })
            .unwrap();
        assert_eq!(queued.len(), 1);
    }

    #[test]
    fn get_unknown_job_is_none() {
        assert!(engine().get("missing").unwrap().is_none());
    }

    #[test]
    fn spawn_claims_before_later_reap_regardless_of_insertion_order() {
        // End-to-end ordering scenario: a priority-5 spawn beats a
        // priority-1 reap with a later run_at even when the reap was
        // enqueued first.
        let q = engine();
        q.enqueue(&EnqueueJob {
            kind: JobKind::CattleReap,
            priority: Some(1),
            run_at_ms: Some(500),
            now_ms: Some(0),
            ..spawn_req("ops")
        })
        .unwrap();
        let spawn = q
            .enqueue(&EnqueueJob {
                priority: Some(5),
                now_ms: Some(1),
                ..spawn_req("ops")
            })
            .unwrap();

        let first = claim(&q, "w", 1_000).unwrap();
        assert_eq!(first.job_id, spawn.job_id);
        assert_eq!(first.kind, JobKind::CattleSpawn);
    }
}
