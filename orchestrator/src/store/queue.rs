//! Command queue - durable FIFO of follow-ups waiting for the active execution.
//!
//! Entries are ordered by `seq` (AUTOINCREMENT), never by `created_at`, so two
//! commands written in the same millisecond still resolve deterministically.
//! Draining is always `peek_oldest` followed by `dequeue_by_id` on the same
//! `seq`; a crash between the two leaves the command in place.

use chrono::{DateTime, Duration, Utc};
use shared_types::{ExecutionPayload, QueuedCommand};
use sqlx::SqliteConnection;

use super::{from_millis, to_millis, StoreError};

/// Session-scoped sweeps drop commands older than this.
pub const QUEUE_RETENTION_HOURS: i64 = 2;

pub fn retention_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::hours(QUEUE_RETENTION_HOURS)
}

#[derive(sqlx::FromRow)]
struct QueuedCommandRow {
    seq: i64,
    session_id: String,
    execution_id: String,
    payload: String,
    created_at_ms: i64,
}

impl TryFrom<QueuedCommandRow> for QueuedCommand {
    type Error = StoreError;

    fn try_from(row: QueuedCommandRow) -> Result<Self, Self::Error> {
        Ok(QueuedCommand {
            seq: row.seq,
            session_id: row.session_id,
            execution_id: row.execution_id,
            payload: serde_json::from_str(&row.payload)?,
            created_at: from_millis(row.created_at_ms)?,
        })
    }
}

/// Append a command and return its sequence number.
pub async fn enqueue(
    conn: &mut SqliteConnection,
    session_id: &str,
    execution_id: &str,
    payload: &ExecutionPayload,
    now: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let payload_json = serde_json::to_string(payload)?;
    let result = sqlx::query(
        r#"
        INSERT INTO queued_commands (session_id, execution_id, payload, created_at_ms)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(session_id)
    .bind(execution_id)
    .bind(payload_json)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn peek_oldest(
    conn: &mut SqliteConnection,
    session_id: &str,
) -> Result<Option<QueuedCommand>, StoreError> {
    let row: Option<QueuedCommandRow> = sqlx::query_as(
        r#"
        SELECT seq, session_id, execution_id, payload, created_at_ms
        FROM queued_commands
        WHERE session_id = ?1
        ORDER BY seq ASC
        LIMIT 1
        "#,
    )
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(QueuedCommand::try_from).transpose()
}

/// Remove one command. Absent ids are a silent no-op so retried drains are safe.
pub async fn dequeue_by_id(conn: &mut SqliteConnection, seq: i64) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM queued_commands WHERE seq = ?1")
        .bind(seq)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn count(conn: &mut SqliteConnection, session_id: &str) -> Result<i64, StoreError> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM queued_commands WHERE session_id = ?1")
            .bind(session_id)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count)
}

/// Ordered snapshot of a session's queue.
pub async fn list(
    conn: &mut SqliteConnection,
    session_id: &str,
) -> Result<Vec<QueuedCommand>, StoreError> {
    let rows: Vec<QueuedCommandRow> = sqlx::query_as(
        r#"
        SELECT seq, session_id, execution_id, payload, created_at_ms
        FROM queued_commands
        WHERE session_id = ?1
        ORDER BY seq ASC
        "#,
    )
    .bind(session_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(QueuedCommand::try_from).collect()
}

/// Global sweep across every session in this store.
pub async fn delete_older_than(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM queued_commands WHERE created_at_ms < ?1")
        .bind(to_millis(cutoff))
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Session-scoped sweep using the fixed retention window.
pub async fn delete_expired(
    conn: &mut SqliteConnection,
    session_id: &str,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let result =
        sqlx::query("DELETE FROM queued_commands WHERE session_id = ?1 AND created_at_ms < ?2")
            .bind(session_id)
            .bind(to_millis(retention_cutoff(now)))
            .execute(&mut *conn)
            .await?;
    Ok(result.rows_affected())
}

/// Drop every command that would become `execution_id`.
pub async fn remove_for_execution(
    conn: &mut SqliteConnection,
    execution_id: &str,
) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM queued_commands WHERE execution_id = ?1")
        .bind(execution_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
