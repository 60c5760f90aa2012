//! The drain loop: the narrow seam between the queue and external workers.
//!
//! The queue knows nothing about indexing or extraction; a worker is just a
//! [`JobHandler`] returning an [`Outcome`]. The [`Drainer`] pulls one due
//! batch per wake-up, runs the handler per record with panic isolation, and
//! reports each outcome back to the queue.

use crate::errors::QueueError;
use crate::queue::Queue;
use crate::record::JobRecord;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error, info_span, warn, Instrument};

const DEFAULT_BATCH_SIZE: usize = 25;

/// Outcome a handler reports for one record.
///
/// Exactly one outcome is reported per processed record; the queue decides
/// the state transition (delete/complete, reschedule, or dead-letter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The side effect ran; remove or complete the record.
    Success,
    /// The side effect failed.
    Failure {
        /// Diagnostic message stored on the record.
        error: String,
        /// Whether a later retry could succeed. `false` dead-letters the
        /// record immediately, regardless of the attempt count.
        retriable: bool,
    },
}

impl Outcome {
    /// A failure worth retrying (transient network/service trouble).
    pub fn retriable(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            retriable: true,
        }
    }

    /// A permanent failure (permission denied, malformed subject).
    pub fn fatal(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            retriable: false,
        }
    }
}

/// A worker that processes one queued record.
///
/// Implementations are expected to be idempotent: delivery is
/// at-least-once, and a record whose worker never reported back is
/// redispatched once it is due again.
pub trait JobHandler: Send + Sync + 'static {
    /// Application data provided to the handler at runtime.
    type Context: Clone + Send + Sync + 'static;

    /// Process `record`, reporting what the queue should do with it.
    fn run(&self, record: &JobRecord, ctx: Self::Context) -> impl Future<Output = Outcome> + Send;
}

/// What a drain cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Records handed to the handler.
    pub processed: usize,
    /// Records that reported success.
    pub succeeded: usize,
    /// Records that reported failure (rescheduled or dead-lettered).
    pub failed: usize,
}

/// Pulls due batches from a [`Queue`] and runs a [`JobHandler`] over them.
///
/// A drainer allows one drain cycle at a time: the guard is an explicit
/// atomic token, so an overlapping call returns `Ok(None)` without touching
/// the store. Serializing dispatch beyond that (making sure only the
/// trigger handler calls [`drain`](Self::drain)) is the embedder's job.
pub struct Drainer<H: JobHandler> {
    queue: Queue,
    handler: H,
    context: H::Context,
    batch_size: usize,
    in_flight: AtomicBool,
}

struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<H: JobHandler> Drainer<H> {
    /// Create a drainer over `queue` with a default batch size.
    pub fn new(queue: Queue, handler: H, context: H::Context) -> Self {
        Self {
            queue,
            handler,
            context,
            batch_size: DEFAULT_BATCH_SIZE,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Set the maximum number of records pulled per drain cycle.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// The queue this drainer serves.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Run one drain cycle at the wall clock time.
    pub async fn drain(&self) -> Result<Option<DrainSummary>, QueueError> {
        self.drain_at(Utc::now()).await
    }

    /// Run one drain cycle: pull the batch due at `now`, process it
    /// sequentially, then disarm the queue trigger if nothing is left.
    ///
    /// Returns `Ok(None)` if another cycle is already in flight.
    pub async fn drain_at(&self, now: DateTime<Utc>) -> Result<Option<DrainSummary>, QueueError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!(queue = %self.queue.name(), "Drain already in flight; skipping");
            return Ok(None);
        }
        let _guard = FlightGuard(&self.in_flight);

        let batch = self.queue.dequeue_batch(now, self.batch_size).await?;
        let mut summary = DrainSummary::default();

        for record in batch {
            self.queue.mark_processing(&record.id, now).await?;

            let span = info_span!(
                "job",
                job.id = %record.id,
                job.subject = %record.subject_key,
                queue = %self.queue.name(),
            );

            let result = AssertUnwindSafe(self.handler.run(&record, self.context.clone()))
                .catch_unwind()
                .instrument(span.clone())
                .await;

            let outcome = result.unwrap_or_else(|panic| Outcome::Failure {
                error: panic_message(&*panic),
                retriable: true,
            });

            let _enter = span.enter();
            summary.processed += 1;
            match outcome {
                Outcome::Success => {
                    summary.succeeded += 1;
                    self.queue.mark_success_at(now, &record.id).await?;
                }
                Outcome::Failure { error, retriable } => {
                    summary.failed += 1;
                    warn!("Job run failed: {error}");
                    self.queue
                        .mark_failure_at(now, &record.id, &error, retriable)
                        .await?;
                }
            }
        }

        if let Some(trigger) = self.queue.trigger() {
            if !self.queue.has_queued_items().await? {
                trigger.disarm().await;
            }
        }

        Ok(Some(summary))
    }

    /// Drive drain cycles from a wake-up channel (see
    /// [`TokioAlarm`](crate::TokioAlarm)) until the channel closes.
    ///
    /// Wake-ups for other trigger names are ignored. A failed cycle is
    /// logged and skipped; the next firing corrects it.
    pub async fn run(&self, mut wakeups: mpsc::UnboundedReceiver<String>) {
        while let Some(name) = wakeups.recv().await {
            if let Some(trigger) = self.queue.trigger() {
                if name != trigger.name() {
                    continue;
                }
            }
            if let Err(error) = self.drain().await {
                error!("Failed to drain queue: {error}");
            }
        }
    }
}

/// Best-effort extraction of a human-readable message from a panic payload.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "job handler panicked".to_owned()
    }
}
