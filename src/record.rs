//! Record types persisted by the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a [`JobRecord`].
///
/// `Pending` and `Processing` records are live; `Completed` and `Failed`
/// records are terminal and never redispatched. `Processing` exists for
/// observability only: it never gates dispatch, so a record handed to a
/// worker that crashed is re-picked on the next sweep once it is due again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to become due.
    Pending,
    /// Handed to a worker; still redispatchable when due.
    Processing,
    /// Finished successfully (only queues that keep completed records).
    Completed,
    /// Dead-lettered: non-retriable failure or exhausted retry budget.
    Failed,
}

impl JobStatus {
    /// Whether this record will never be dispatched again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A queued unit of work.
///
/// The `id` is the coalescing identity (`subject#bucket`, see
/// [`coalescing_key`](crate::coalescing_key)), unique within a queue.
/// Exactly one live record exists per identity at any time.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Coalescing identity key; primary key within the queue.
    pub id: String,
    /// Name of the queue instantiation that owns this record.
    pub queue: String,
    /// The logical subject this job is about (a URL, a thread id).
    pub subject_key: String,
    /// Opaque data for the external worker.
    pub payload: Option<Value>,
    /// Why the job was enqueued (origin category); informational.
    pub source: Option<String>,
    /// Set once at creation; FIFO tie-break among equally-due records.
    pub first_enqueued_at: DateTime<Utc>,
    /// Bumped on every coalesce-merge and every attempt.
    pub last_updated_at: DateTime<Utc>,
    /// Count of failed tries. Only increases, except via an operator reset.
    pub attempt: u32,
    /// The record is eligible for dispatch iff `next_attempt_at <= now`.
    pub next_attempt_at: DateTime<Utc>,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Last failure message, for diagnostics.
    pub last_error: Option<String>,
}

/// Per-subject bookkeeping, independent of queue membership.
///
/// Survives the job record itself: re-enqueueing a subject does not lose
/// history, and the `cursor` lets a worker make a re-dispatch idempotent
/// even if the record was recreated. Deleted only by an explicit
/// subject-level reset (e.g. the user deletes the thread).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressMeta {
    /// When the last successful run for this subject finished.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Number of successful runs.
    pub runs: i64,
    /// Total facts extracted across runs.
    pub facts_extracted: i64,
    /// Opaque worker-defined resume point (e.g. last processed message id).
    pub cursor: Option<String>,
}

/// Persisted success/failure counters for one queue.
///
/// Observability only; never consulted for control flow. `failures` counts
/// terminal failures, not individual retried attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Jobs that completed successfully.
    pub successes: i64,
    /// Jobs that were dead-lettered.
    pub failures: i64,
}
