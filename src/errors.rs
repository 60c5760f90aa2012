use thiserror::Error;

/// Errors surfaced by queue operations.
///
/// Expected conditions, like an absent record or an empty queue, are `Ok` values,
/// never errors. Only genuine store I/O or serialization failures reach the
/// caller, which is expected to log and skip the cycle; the next trigger
/// firing corrects a missed one.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The underlying store failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A payload or progress value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
