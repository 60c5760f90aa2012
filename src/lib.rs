#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod backoff;
mod coalesce;
mod drain;
mod errors;
mod queue;
mod record;
mod storage;
mod trigger;

pub use self::coalesce::coalescing_key;
pub use self::drain::{DrainSummary, Drainer, JobHandler, Outcome};
pub use self::errors::QueueError;
pub use self::queue::{Enqueued, MergeStrategy, Queue, QueueConfig, SuccessAction};
pub use self::record::{JobRecord, JobStatus, ProgressMeta, QueueStats};
pub use self::storage::setup_database;
pub use self::trigger::{Alarm, TokioAlarm, TriggerLifecycle};
