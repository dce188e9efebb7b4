//! Prepared sessions: the initial request stored before the first start.

use chrono::{DateTime, Utc};
use shared_types::{ExecutionPayload, PreparedSession};
use sqlx::SqliteConnection;

use super::{from_millis, from_optional_millis, to_millis, StoreError};

#[derive(sqlx::FromRow)]
struct PreparedSessionRow {
    session_id: String,
    owner_id: String,
    payload: String,
    initial_execution_id: Option<String>,
    created_at_ms: i64,
    initiated_at_ms: Option<i64>,
}

impl TryFrom<PreparedSessionRow> for PreparedSession {
    type Error = StoreError;

    fn try_from(row: PreparedSessionRow) -> Result<Self, Self::Error> {
        Ok(PreparedSession {
            session_id: row.session_id,
            owner_id: row.owner_id,
            payload: serde_json::from_str(&row.payload)?,
            initial_execution_id: row.initial_execution_id,
            created_at: from_millis(row.created_at_ms)?,
            initiated_at: from_optional_millis(row.initiated_at_ms)?,
        })
    }
}

pub async fn get(
    conn: &mut SqliteConnection,
    session_id: &str,
) -> Result<Option<PreparedSession>, StoreError> {
    let row: Option<PreparedSessionRow> = sqlx::query_as(
        r#"
        SELECT session_id, owner_id, payload, initial_execution_id, created_at_ms, initiated_at_ms
        FROM prepared_sessions
        WHERE session_id = ?1
        "#,
    )
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(PreparedSession::try_from).transpose()
}

/// Store or replace the prepared payload. Callers must refuse once the
/// session is initiated; this function does not check.
pub async fn upsert_prepared(
    conn: &mut SqliteConnection,
    session_id: &str,
    owner_id: &str,
    payload: &ExecutionPayload,
    now: DateTime<Utc>,
) -> Result<PreparedSession, StoreError> {
    let payload_json = serde_json::to_string(payload)?;
    sqlx::query(
        r#"
        INSERT INTO prepared_sessions (session_id, owner_id, payload, created_at_ms)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(session_id) DO UPDATE SET
            owner_id = excluded.owner_id,
            payload = excluded.payload,
            created_at_ms = excluded.created_at_ms
        "#,
    )
    .bind(session_id)
    .bind(owner_id)
    .bind(payload_json)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;

    Ok(PreparedSession {
        session_id: session_id.to_string(),
        owner_id: owner_id.to_string(),
        payload: payload.clone(),
        initial_execution_id: None,
        created_at: from_millis(to_millis(now))?,
        initiated_at: None,
    })
}

/// Record the execution that started the session. Returns false if the
/// session was already initiated or was never prepared.
pub async fn mark_initiated(
    conn: &mut SqliteConnection,
    session_id: &str,
    execution_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE prepared_sessions
        SET initial_execution_id = ?1, initiated_at_ms = ?2
        WHERE session_id = ?3 AND initiated_at_ms IS NULL
        "#,
    )
    .bind(execution_id)
    .bind(to_millis(now))
    .bind(session_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}
