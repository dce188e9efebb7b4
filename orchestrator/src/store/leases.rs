//! Lease records: time-bounded exclusive claims on an execution.
//!
//! A lease only knows an execution id, a holder token and timing. It never
//! looks at execution content or status. A row whose `expires_at` has passed
//! is treated as absent and is overwritten by the next acquisition.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqliteConnection;

use super::{from_millis, to_millis, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub execution_id: String,
    pub holder_token: String,
    pub request_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of an acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAcquisition {
    Acquired { expires_at: DateTime<Utc> },
    AlreadyHeld { holder: String },
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    execution_id: String,
    holder_token: String,
    request_id: String,
    acquired_at_ms: i64,
    expires_at_ms: i64,
}

impl TryFrom<LeaseRow> for LeaseRecord {
    type Error = StoreError;

    fn try_from(row: LeaseRow) -> Result<Self, Self::Error> {
        Ok(LeaseRecord {
            execution_id: row.execution_id,
            holder_token: row.holder_token,
            request_id: row.request_id,
            acquired_at: from_millis(row.acquired_at_ms)?,
            expires_at: from_millis(row.expires_at_ms)?,
        })
    }
}

pub async fn get(
    conn: &mut SqliteConnection,
    execution_id: &str,
) -> Result<Option<LeaseRecord>, StoreError> {
    let row: Option<LeaseRow> = sqlx::query_as(
        r#"
        SELECT execution_id, holder_token, request_id, acquired_at_ms, expires_at_ms
        FROM leases
        WHERE execution_id = ?1
        "#,
    )
    .bind(execution_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(LeaseRecord::try_from).transpose()
}

/// Grant the lease unless an unexpired one exists.
///
/// Acquisition is first-come-first-served; a repeated call by the current
/// holder is reported as `AlreadyHeld` with its own token.
pub async fn acquire(
    conn: &mut SqliteConnection,
    execution_id: &str,
    request_id: &str,
    holder_token: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<LeaseAcquisition, StoreError> {
    if let Some(current) = get(conn, execution_id).await? {
        if !current.is_expired(now) {
            return Ok(LeaseAcquisition::AlreadyHeld {
                holder: current.holder_token,
            });
        }
    }

    let expires_at = now + ttl;
    sqlx::query(
        r#"
        INSERT INTO leases (execution_id, holder_token, request_id, acquired_at_ms, expires_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(execution_id) DO UPDATE SET
            holder_token = excluded.holder_token,
            request_id = excluded.request_id,
            acquired_at_ms = excluded.acquired_at_ms,
            expires_at_ms = excluded.expires_at_ms
        "#,
    )
    .bind(execution_id)
    .bind(holder_token)
    .bind(request_id)
    .bind(to_millis(now))
    .bind(to_millis(expires_at))
    .execute(&mut *conn)
    .await?;

    Ok(LeaseAcquisition::Acquired { expires_at })
}

/// Push the expiry out by one TTL. Only the current holder of an unexpired
/// lease may extend; an expired holder has to acquire again.
pub async fn extend(
    conn: &mut SqliteConnection,
    execution_id: &str,
    holder_token: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE leases
        SET expires_at_ms = ?1
        WHERE execution_id = ?2 AND holder_token = ?3 AND expires_at_ms > ?4
        "#,
    )
    .bind(to_millis(now + ttl))
    .bind(execution_id)
    .bind(holder_token)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Give the lease up early. Like `extend`, this only succeeds for the holder
/// of an unexpired lease; expired rows are left to `purge_expired`.
pub async fn release(
    conn: &mut SqliteConnection,
    execution_id: &str,
    holder_token: &str,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        "DELETE FROM leases WHERE execution_id = ?1 AND holder_token = ?2 AND expires_at_ms > ?3",
    )
    .bind(execution_id)
    .bind(holder_token)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Drop any lease on an execution regardless of holder.
pub async fn clear(conn: &mut SqliteConnection, execution_id: &str) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM leases WHERE execution_id = ?1")
        .bind(execution_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn purge_expired(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM leases WHERE expires_at_ms <= ?1")
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
