//! The queue engine: enqueue/coalesce, due-time dispatch and outcome
//! handling.
//!
//! One generic engine serves both intended instantiations, page indexing
//! and fact extraction, parameterized by [`QueueConfig`]. Atomicity is
//! per-key read-modify-write against the store; no cross-record
//! transactions. If two enqueues for the same bucket race, last-write-wins
//! on the merged fields is acceptable: they are advisory metadata.

use crate::backoff::backoff_with_jitter;
use crate::coalesce::coalescing_key;
use crate::errors::QueueError;
use crate::record::{JobRecord, JobStatus, ProgressMeta, QueueStats};
use crate::storage;
use crate::trigger::TriggerLifecycle;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// How a second event for an already-queued identity is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Merge into the existing record: keep `first_enqueued_at`, `attempt`
    /// and `next_attempt_at`; take the newer payload/source when present.
    CoalesceLatest,
    /// Skip the write entirely if any pending record for the subject exists,
    /// in any bucket. Used where payload drift does not matter.
    SkipIfPending,
}

/// What happens to a record when its job succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessAction {
    /// Delete the record.
    Delete,
    /// Keep the record with `status = completed` until the cleanup sweep.
    MarkCompleted,
}

/// Tuning for one queue instantiation.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Coalescing window: events about one subject within the same bucket
    /// collapse into one record.
    pub bucket: Duration,
    /// Base retry delay; attempt `n` waits `min(base * 2^n, max_backoff)`
    /// scaled by jitter.
    pub base_backoff: Duration,
    /// Upper bound on the pre-jitter retry delay.
    pub max_backoff: Duration,
    /// Retry budget; reaching it dead-letters the record.
    pub max_attempts: u32,
    /// Duplicate-event handling.
    pub merge_strategy: MergeStrategy,
    /// Record disposition on success.
    pub success_action: SuccessAction,
}

impl QueueConfig {
    /// Preset for the page-indexing queue: coalesce-and-merge, eight
    /// attempts, successful records deleted.
    pub fn indexing() -> Self {
        Self {
            bucket: Duration::from_secs(60),
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(6 * 60 * 60),
            max_attempts: 8,
            merge_strategy: MergeStrategy::CoalesceLatest,
            success_action: SuccessAction::Delete,
        }
    }

    /// Preset for the fact-extraction queue: skip duplicate pending
    /// subjects, three attempts, completed records kept for status display.
    pub fn extraction() -> Self {
        Self {
            bucket: Duration::from_secs(60),
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(6 * 60 * 60),
            max_attempts: 3,
            merge_strategy: MergeStrategy::SkipIfPending,
            success_action: SuccessAction::MarkCompleted,
        }
    }
}

/// Disposition of an enqueue call, carrying the record id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// A fresh record was created, immediately eligible for dispatch.
    New(String),
    /// The event merged into an existing record in the same bucket.
    Merged(String),
    /// A pending record for the subject already existed; nothing written.
    Skipped(String),
}

impl Enqueued {
    /// The id of the record this enqueue resolved to.
    pub fn id(&self) -> &str {
        match self {
            Self::New(id) | Self::Merged(id) | Self::Skipped(id) => id,
        }
    }
}

/// A durable, coalescing, retry-aware work queue.
///
/// Cheap to clone; clones share the same pool and configuration. All
/// methods taking an explicit `now` exist so callers (and tests) can drive
/// the queue deterministically; the plain variants use the wall clock.
#[derive(Clone)]
pub struct Queue {
    pool: SqlitePool,
    name: String,
    config: QueueConfig,
    trigger: Option<TriggerLifecycle>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("trigger", &self.trigger)
            .finish()
    }
}

fn add_duration(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX);
    t.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Queue {
    /// Create a queue named `name` on top of `pool`.
    ///
    /// Run [`setup_database`](crate::setup_database) on the pool first.
    /// Queues with different names share tables but never see each other's
    /// records.
    pub fn new(pool: SqlitePool, name: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            pool,
            name: name.into(),
            config,
            trigger: None,
        }
    }

    /// Attach a wake-up trigger: armed on enqueue, disarmed when a drain
    /// leaves the queue empty.
    pub fn with_trigger(mut self, trigger: TriggerLifecycle) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn trigger(&self) -> Option<&TriggerLifecycle> {
        self.trigger.as_ref()
    }

    /// Enqueue an event about `subject_key`, coalescing per the queue's
    /// merge strategy.
    #[instrument(
        name = "requeue.enqueue",
        skip(self, payload),
        fields(queue = %self.name, subject = %subject_key)
    )]
    pub async fn enqueue(
        &self,
        subject_key: &str,
        payload: Option<Value>,
        source: Option<&str>,
    ) -> Result<Enqueued, QueueError> {
        self.enqueue_at(Utc::now(), subject_key, payload, source)
            .await
    }

    /// [`enqueue`](Self::enqueue) with an explicit arrival time.
    pub async fn enqueue_at(
        &self,
        now: DateTime<Utc>,
        subject_key: &str,
        payload: Option<Value>,
        source: Option<&str>,
    ) -> Result<Enqueued, QueueError> {
        let id = coalescing_key(subject_key, now, self.config.bucket.as_millis() as u64);

        let enqueued = match self.config.merge_strategy {
            MergeStrategy::SkipIfPending => {
                if let Some(existing) =
                    storage::find_pending_by_subject(&self.pool, &self.name, subject_key).await?
                {
                    debug!(record.id = %existing.id, "Subject already pending; skipping enqueue");
                    Enqueued::Skipped(existing.id)
                } else {
                    self.insert_new(now, id, subject_key, payload, source)
                        .await?
                }
            }
            MergeStrategy::CoalesceLatest => {
                match storage::get_record(&self.pool, &self.name, &id).await? {
                    Some(mut existing) => {
                        // Merge: identity, FIFO position and retry state are
                        // untouched; only the advisory fields move forward.
                        if payload.is_some() {
                            existing.payload = payload;
                        }
                        if let Some(source) = source {
                            existing.source = Some(source.to_owned());
                        }
                        existing.last_updated_at = now;
                        storage::put_record(&self.pool, &existing).await?;
                        debug!(record.id = %existing.id, "Coalesced into existing record");
                        Enqueued::Merged(existing.id)
                    }
                    None => {
                        self.insert_new(now, id, subject_key, payload, source)
                            .await?
                    }
                }
            }
        };

        if let Some(trigger) = &self.trigger {
            trigger.ensure_armed().await;
        }

        Ok(enqueued)
    }

    async fn insert_new(
        &self,
        now: DateTime<Utc>,
        id: String,
        subject_key: &str,
        payload: Option<Value>,
        source: Option<&str>,
    ) -> Result<Enqueued, QueueError> {
        let record = JobRecord {
            id: id.clone(),
            queue: self.name.clone(),
            subject_key: subject_key.to_owned(),
            payload,
            source: source.map(str::to_owned),
            first_enqueued_at: now,
            last_updated_at: now,
            attempt: 0,
            next_attempt_at: now,
            status: JobStatus::Pending,
            last_error: None,
        };
        storage::put_record(&self.pool, &record).await?;
        debug!(record.id = %id, "Enqueued new record");
        Ok(Enqueued::New(id))
    }

    /// Up to `batch_size` due records, ordered by due-time then FIFO.
    ///
    /// Does not mutate the records; the caller reports each one back via
    /// [`mark_success`](Self::mark_success) or
    /// [`mark_failure`](Self::mark_failure). A single active drain loop at
    /// a time is assumed; the queue does not defend against two loops
    /// double-processing a batch.
    pub async fn dequeue_batch(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<JobRecord>, QueueError> {
        storage::scan_due(&self.pool, &self.name, now, batch_size).await
    }

    /// Fetch a record by id.
    pub async fn get(&self, id: &str) -> Result<Option<JobRecord>, QueueError> {
        storage::get_record(&self.pool, &self.name, id).await
    }

    /// Flag a live record as handed to a worker. Observability only: a
    /// `processing` record is still redispatched once due, so a worker that
    /// never reports back cannot strand it.
    pub async fn mark_processing(&self, id: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        if let Some(mut record) = storage::get_record(&self.pool, &self.name, id).await? {
            if !record.status.is_terminal() {
                record.status = JobStatus::Processing;
                record.last_updated_at = now;
                storage::put_record(&self.pool, &record).await?;
            }
        }
        Ok(())
    }

    /// Record a successful run: the record is deleted (or marked completed,
    /// per the queue's success action) and the success counter increments.
    /// A no-op if the record is already gone or already terminal, so a late
    /// duplicate report cannot double-count or revive a dead-lettered record.
    pub async fn mark_success(&self, id: &str) -> Result<(), QueueError> {
        self.mark_success_at(Utc::now(), id).await
    }

    /// [`mark_success`](Self::mark_success) with an explicit time.
    pub async fn mark_success_at(&self, now: DateTime<Utc>, id: &str) -> Result<(), QueueError> {
        let Some(mut record) = storage::get_record(&self.pool, &self.name, id).await? else {
            return Ok(());
        };
        if record.status.is_terminal() {
            debug!(record.id = %id, status = ?record.status, "Ignoring success report for terminal record");
            return Ok(());
        }

        match self.config.success_action {
            SuccessAction::Delete => {
                storage::delete_record(&self.pool, &self.name, id).await?;
            }
            SuccessAction::MarkCompleted => {
                record.status = JobStatus::Completed;
                record.last_updated_at = now;
                record.last_error = None;
                storage::put_record(&self.pool, &record).await?;
            }
        }

        storage::increment_successes(&self.pool, &self.name).await?;
        debug!(record.id = %id, "Job succeeded");
        Ok(())
    }

    /// Record a failed run.
    ///
    /// Retriable failures reschedule with exponential backoff and jitter;
    /// non-retriable failures and exhausted budgets dead-letter the record
    /// (kept, not deleted, for diagnostics and operator reset). The failure
    /// counter increments only on the terminal transition. A no-op if the
    /// record was concurrently removed or is already terminal: a stale
    /// failure report must not resurrect a completed record or count a
    /// dead-letter twice.
    pub async fn mark_failure(
        &self,
        id: &str,
        error: &str,
        retriable: bool,
    ) -> Result<(), QueueError> {
        self.mark_failure_at(Utc::now(), id, error, retriable).await
    }

    /// [`mark_failure`](Self::mark_failure) with an explicit time.
    pub async fn mark_failure_at(
        &self,
        now: DateTime<Utc>,
        id: &str,
        error: &str,
        retriable: bool,
    ) -> Result<(), QueueError> {
        let Some(mut record) = storage::get_record(&self.pool, &self.name, id).await? else {
            return Ok(());
        };
        if record.status.is_terminal() {
            debug!(record.id = %id, status = ?record.status, "Ignoring failure report for terminal record");
            return Ok(());
        }

        let new_attempt = record.attempt.saturating_add(1);
        record.attempt = new_attempt;
        record.last_updated_at = now;
        record.last_error = Some(error.to_owned());

        if !retriable || new_attempt >= self.config.max_attempts {
            record.status = JobStatus::Failed;
            storage::put_record(&self.pool, &record).await?;
            storage::increment_failures(&self.pool, &self.name).await?;
            warn!(
                record.id = %id,
                attempt = new_attempt,
                retriable,
                "Job dead-lettered: {error}"
            );
        } else {
            let backoff = backoff_with_jitter(
                new_attempt,
                self.config.base_backoff,
                self.config.max_backoff,
            );
            record.status = JobStatus::Pending;
            record.next_attempt_at = add_duration(now, backoff);
            storage::put_record(&self.pool, &record).await?;
            debug!(
                record.id = %id,
                attempt = new_attempt,
                backoff_ms = backoff.as_millis() as u64,
                "Job failed; retrying later: {error}"
            );
        }

        Ok(())
    }

    /// Whether any live (pending or processing) record exists.
    pub async fn has_queued_items(&self) -> Result<bool, QueueError> {
        storage::has_live_records(&self.pool, &self.name).await
    }

    /// Re-arm dead-lettered records that have not exhausted the retry
    /// budget (failed via a non-retriable flag rather than attrition).
    /// Records at the cap stay dead. Returns the number re-armed.
    pub async fn reset_failed_items(&self) -> Result<u64, QueueError> {
        self.reset_failed_items_at(Utc::now()).await
    }

    /// [`reset_failed_items`](Self::reset_failed_items) with an explicit time.
    pub async fn reset_failed_items_at(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let reset =
            storage::reset_failed(&self.pool, &self.name, self.config.max_attempts, now).await?;
        if reset > 0 {
            if let Some(trigger) = &self.trigger {
                trigger.ensure_armed().await;
            }
        }
        Ok(reset)
    }

    /// Purge terminal records (completed, dead-lettered) last touched more
    /// than `retention` ago. Live and recently-dead records are untouched,
    /// leaving an operator window for [`reset_failed_items`](Self::reset_failed_items).
    pub async fn cleanup(&self, now: DateTime<Utc>, retention: Duration) -> Result<u64, QueueError> {
        let cutoff = now
            .checked_sub_signed(TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = storage::delete_terminal_before(&self.pool, &self.name, cutoff).await?;
        if purged > 0 {
            debug!(purged, "Purged terminal queue records");
        }
        Ok(purged)
    }

    /// The persisted success/failure counters for this queue.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        storage::queue_stats(&self.pool, &self.name).await
    }

    /// Per-subject progress bookkeeping, if any has been saved.
    pub async fn get_progress(&self, subject_key: &str) -> Result<Option<ProgressMeta>, QueueError> {
        storage::get_progress(&self.pool, &self.name, subject_key).await
    }

    /// Save per-subject progress. Owned by the subject's lifecycle, not the
    /// queue's: it survives record completion and re-enqueueing.
    pub async fn save_progress(
        &self,
        subject_key: &str,
        meta: &ProgressMeta,
    ) -> Result<(), QueueError> {
        storage::save_progress(&self.pool, &self.name, subject_key, meta).await
    }

    /// Delete a subject's progress (e.g. the subject itself was deleted).
    pub async fn clear_progress(&self, subject_key: &str) -> Result<bool, QueueError> {
        storage::clear_progress(&self.pool, &self.name, subject_key).await
    }
}
