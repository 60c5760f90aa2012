//! SQLite persistence for queue records, progress metadata and stats.
//!
//! Timestamps are stored as integer unix milliseconds; that encoding (and
//! the text status column) is a storage detail; callers only ever see the
//! typed [`JobRecord`]. Every operation is an individually-atomic statement;
//! no multi-record transactions are used or required.

use crate::errors::QueueError;
use crate::record::{JobRecord, JobStatus, ProgressMeta, QueueStats};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

/// Create the queue tables and indexes if they do not exist yet.
///
/// Call once at startup before using any queue backed by `pool`.
pub async fn setup_database(pool: &SqlitePool) -> Result<(), QueueError> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS queue_records (
            queue TEXT NOT NULL,
            id TEXT NOT NULL,
            subject_key TEXT NOT NULL,
            payload TEXT,
            source TEXT,
            first_enqueued_at INTEGER NOT NULL,
            last_updated_at INTEGER NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            last_error TEXT,
            PRIMARY KEY (queue, id)
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS queue_records_due_idx
        ON queue_records (queue, status, next_attempt_at, first_enqueued_at)
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS queue_progress (
            queue TEXT NOT NULL,
            subject_key TEXT NOT NULL,
            meta TEXT NOT NULL,
            PRIMARY KEY (queue, subject_key)
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS queue_stats (
            queue TEXT PRIMARY KEY,
            successes INTEGER NOT NULL DEFAULT 0,
            failures INTEGER NOT NULL DEFAULT 0
        )
        ",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Raw row shape; converted to the typed record at the storage boundary.
#[derive(FromRow)]
struct RecordRow {
    queue: String,
    id: String,
    subject_key: String,
    payload: Option<String>,
    source: Option<String>,
    first_enqueued_at: i64,
    last_updated_at: i64,
    attempt: i64,
    next_attempt_at: i64,
    status: JobStatus,
    last_error: Option<String>,
}

const SELECT_RECORD: &str = r"
    SELECT queue, id, subject_key, payload, source, first_enqueued_at,
           last_updated_at, attempt, next_attempt_at, status, last_error
    FROM queue_records
";

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

impl TryFrom<RecordRow> for JobRecord {
    type Error = QueueError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let payload = row
            .payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(JobRecord {
            id: row.id,
            queue: row.queue,
            subject_key: row.subject_key,
            payload,
            source: row.source,
            first_enqueued_at: from_millis(row.first_enqueued_at),
            last_updated_at: from_millis(row.last_updated_at),
            attempt: u32::try_from(row.attempt).unwrap_or(u32::MAX),
            next_attempt_at: from_millis(row.next_attempt_at),
            status: row.status,
            last_error: row.last_error,
        })
    }
}

pub(crate) async fn get_record(
    pool: &SqlitePool,
    queue: &str,
    id: &str,
) -> Result<Option<JobRecord>, QueueError> {
    let row = sqlx::query_as::<_, RecordRow>(&format!("{SELECT_RECORD} WHERE queue = ? AND id = ?"))
        .bind(queue)
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(JobRecord::try_from).transpose()
}

/// Wholesale upsert: the stored row is replaced by `record`.
pub(crate) async fn put_record(pool: &SqlitePool, record: &JobRecord) -> Result<(), QueueError> {
    let payload = record
        .payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r"
        INSERT OR REPLACE INTO queue_records (
            queue, id, subject_key, payload, source, first_enqueued_at,
            last_updated_at, attempt, next_attempt_at, status, last_error
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(&record.queue)
    .bind(&record.id)
    .bind(&record.subject_key)
    .bind(payload)
    .bind(&record.source)
    .bind(record.first_enqueued_at.timestamp_millis())
    .bind(record.last_updated_at.timestamp_millis())
    .bind(i64::from(record.attempt))
    .bind(record.next_attempt_at.timestamp_millis())
    .bind(record.status)
    .bind(&record.last_error)
    .execute(pool)
    .await?;

    Ok(())
}

pub(crate) async fn delete_record(
    pool: &SqlitePool,
    queue: &str,
    id: &str,
) -> Result<bool, QueueError> {
    let result = sqlx::query("DELETE FROM queue_records WHERE queue = ? AND id = ?")
        .bind(queue)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// All live records due at `now`, ordered ascending by due-time and then by
/// first-enqueue time (FIFO among equally-due records), truncated to `limit`.
pub(crate) async fn scan_due(
    pool: &SqlitePool,
    queue: &str,
    now: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<JobRecord>, QueueError> {
    let rows = sqlx::query_as::<_, RecordRow>(&format!(
        r"
        {SELECT_RECORD}
        WHERE queue = ?
          AND status IN ('pending', 'processing')
          AND next_attempt_at <= ?
        ORDER BY next_attempt_at ASC, first_enqueued_at ASC
        LIMIT ?
        "
    ))
    .bind(queue)
    .bind(now.timestamp_millis())
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(JobRecord::try_from).collect()
}

/// A pending record for `subject_key` in any coalescing bucket, if one exists.
pub(crate) async fn find_pending_by_subject(
    pool: &SqlitePool,
    queue: &str,
    subject_key: &str,
) -> Result<Option<JobRecord>, QueueError> {
    let row = sqlx::query_as::<_, RecordRow>(&format!(
        "{SELECT_RECORD} WHERE queue = ? AND subject_key = ? AND status = 'pending' LIMIT 1"
    ))
    .bind(queue)
    .bind(subject_key)
    .fetch_optional(pool)
    .await?;

    row.map(JobRecord::try_from).transpose()
}

pub(crate) async fn has_live_records(pool: &SqlitePool, queue: &str) -> Result<bool, QueueError> {
    let exists = sqlx::query_scalar::<_, bool>(
        r"
        SELECT EXISTS(
            SELECT 1 FROM queue_records
            WHERE queue = ? AND status IN ('pending', 'processing')
        )
        ",
    )
    .bind(queue)
    .fetch_one(pool)
    .await?;

    Ok(exists)
}

/// Flip dead-lettered records that have not exhausted their budget back to
/// pending, due immediately. Returns the number of records re-armed.
pub(crate) async fn reset_failed(
    pool: &SqlitePool,
    queue: &str,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<u64, QueueError> {
    let result = sqlx::query(
        r"
        UPDATE queue_records
        SET status = 'pending', next_attempt_at = ?, last_updated_at = ?
        WHERE queue = ? AND status = 'failed' AND attempt < ?
        ",
    )
    .bind(now.timestamp_millis())
    .bind(now.timestamp_millis())
    .bind(queue)
    .bind(i64::from(max_attempts))
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Delete terminal records last touched before `cutoff`.
pub(crate) async fn delete_terminal_before(
    pool: &SqlitePool,
    queue: &str,
    cutoff: DateTime<Utc>,
) -> Result<u64, QueueError> {
    let result = sqlx::query(
        r"
        DELETE FROM queue_records
        WHERE queue = ?
          AND status IN ('completed', 'failed')
          AND last_updated_at < ?
        ",
    )
    .bind(queue)
    .bind(cutoff.timestamp_millis())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub(crate) async fn increment_successes(pool: &SqlitePool, queue: &str) -> Result<(), QueueError> {
    sqlx::query(
        r"
        INSERT INTO queue_stats (queue, successes, failures) VALUES (?, 1, 0)
        ON CONFLICT(queue) DO UPDATE SET successes = successes + 1
        ",
    )
    .bind(queue)
    .execute(pool)
    .await?;

    Ok(())
}

pub(crate) async fn increment_failures(pool: &SqlitePool, queue: &str) -> Result<(), QueueError> {
    sqlx::query(
        r"
        INSERT INTO queue_stats (queue, successes, failures) VALUES (?, 0, 1)
        ON CONFLICT(queue) DO UPDATE SET failures = failures + 1
        ",
    )
    .bind(queue)
    .execute(pool)
    .await?;

    Ok(())
}

pub(crate) async fn queue_stats(pool: &SqlitePool, queue: &str) -> Result<QueueStats, QueueError> {
    let row = sqlx::query_as::<_, (i64, i64)>(
        "SELECT successes, failures FROM queue_stats WHERE queue = ?",
    )
    .bind(queue)
    .fetch_optional(pool)
    .await?;

    Ok(row
        .map(|(successes, failures)| QueueStats {
            successes,
            failures,
        })
        .unwrap_or_default())
}

pub(crate) async fn get_progress(
    pool: &SqlitePool,
    queue: &str,
    subject_key: &str,
) -> Result<Option<ProgressMeta>, QueueError> {
    let meta = sqlx::query_scalar::<_, String>(
        "SELECT meta FROM queue_progress WHERE queue = ? AND subject_key = ?",
    )
    .bind(queue)
    .bind(subject_key)
    .fetch_optional(pool)
    .await?;

    meta.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(QueueError::from)
}

pub(crate) async fn save_progress(
    pool: &SqlitePool,
    queue: &str,
    subject_key: &str,
    meta: &ProgressMeta,
) -> Result<(), QueueError> {
    let meta = serde_json::to_string(meta)?;

    sqlx::query("INSERT OR REPLACE INTO queue_progress (queue, subject_key, meta) VALUES (?, ?, ?)")
        .bind(queue)
        .bind(subject_key)
        .bind(meta)
        .execute(pool)
        .await?;

    Ok(())
}

pub(crate) async fn clear_progress(
    pool: &SqlitePool,
    queue: &str,
    subject_key: &str,
) -> Result<bool, QueueError> {
    let result = sqlx::query("DELETE FROM queue_progress WHERE queue = ? AND subject_key = ?")
        .bind(queue)
        .bind(subject_key)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}
