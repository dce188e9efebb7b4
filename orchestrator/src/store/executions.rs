//! Execution records and the persisted state machine.
//!
//! `apply_transition` is the only way a status changes after insertion. The
//! legality check is `ExecutionStatus::can_transition_to`, a pure function of
//! `(current, target)`; timestamps and leases play no part in it.

use chrono::{DateTime, Utc};
use shared_types::{Execution, ExecutionPayload, ExecutionStatus};
use sqlx::SqliteConnection;

use super::{from_millis, from_optional_millis, to_millis, StoreError};

/// Outcome of a status change request
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied {
        previous: ExecutionStatus,
        execution: Execution,
    },
    Rejected {
        current: ExecutionStatus,
    },
    Missing,
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    execution_id: String,
    session_id: String,
    owner_id: String,
    status: String,
    payload: String,
    created_at_ms: i64,
    started_at_ms: Option<i64>,
    completed_at_ms: Option<i64>,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let status = ExecutionStatus::parse(&row.status).ok_or_else(|| {
            StoreError::CorruptRow(format!(
                "execution {} has unknown status {}",
                row.execution_id, row.status
            ))
        })?;

        Ok(Execution {
            status,
            payload: serde_json::from_str(&row.payload)?,
            created_at: from_millis(row.created_at_ms)?,
            started_at: from_optional_millis(row.started_at_ms)?,
            completed_at: from_optional_millis(row.completed_at_ms)?,
            execution_id: row.execution_id,
            session_id: row.session_id,
            owner_id: row.owner_id,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT execution_id, session_id, owner_id, status, payload, \
     created_at_ms, started_at_ms, completed_at_ms FROM executions";

/// Insert a new execution in `pending`.
pub async fn insert_pending(
    conn: &mut SqliteConnection,
    execution_id: &str,
    session_id: &str,
    owner_id: &str,
    payload: &ExecutionPayload,
    now: DateTime<Utc>,
) -> Result<Execution, StoreError> {
    let payload_json = serde_json::to_string(payload)?;
    sqlx::query(
        r#"
        INSERT INTO executions (execution_id, session_id, owner_id, status, payload, created_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(execution_id)
    .bind(session_id)
    .bind(owner_id)
    .bind(ExecutionStatus::Pending.as_str())
    .bind(payload_json)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;

    Ok(Execution {
        execution_id: execution_id.to_string(),
        session_id: session_id.to_string(),
        owner_id: owner_id.to_string(),
        status: ExecutionStatus::Pending,
        payload: payload.clone(),
        created_at: from_millis(to_millis(now))?,
        started_at: None,
        completed_at: None,
    })
}

pub async fn get(
    conn: &mut SqliteConnection,
    execution_id: &str,
) -> Result<Option<Execution>, StoreError> {
    let row: Option<ExecutionRow> =
        sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE execution_id = ?1"))
            .bind(execution_id)
            .fetch_optional(&mut *conn)
            .await?;

    row.map(Execution::try_from).transpose()
}

/// The session's `running` execution, if any.
pub async fn running_for_session(
    conn: &mut SqliteConnection,
    session_id: &str,
) -> Result<Option<Execution>, StoreError> {
    let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
        "{SELECT_COLUMNS} WHERE session_id = ?1 AND status = ?2 ORDER BY started_at_ms ASC"
    ))
    .bind(session_id)
    .bind(ExecutionStatus::Running.as_str())
    .fetch_all(&mut *conn)
    .await?;

    if rows.len() > 1 {
        tracing::error!(
            session_id = %session_id,
            running = rows.len(),
            "More than one running execution recorded for session"
        );
    }

    rows.into_iter().next().map(Execution::try_from).transpose()
}

/// Move an execution to `target` if the transition table allows it.
///
/// Entering `running` stamps `started_at`; entering a terminal state stamps
/// `completed_at`. A rejected or missing execution is left untouched.
pub async fn apply_transition(
    conn: &mut SqliteConnection,
    execution_id: &str,
    target: ExecutionStatus,
    now: DateTime<Utc>,
) -> Result<Transition, StoreError> {
    let Some(mut execution) = get(conn, execution_id).await? else {
        return Ok(Transition::Missing);
    };

    let previous = execution.status;
    if !previous.can_transition_to(target) {
        return Ok(Transition::Rejected { current: previous });
    }

    let stamp = from_millis(to_millis(now))?;
    if target == ExecutionStatus::Running {
        execution.started_at = Some(stamp);
    }
    if target.is_terminal() {
        execution.completed_at = Some(stamp);
    }
    execution.status = target;

    sqlx::query(
        r#"
        UPDATE executions
        SET status = ?1, started_at_ms = ?2, completed_at_ms = ?3
        WHERE execution_id = ?4 AND status = ?5
        "#,
    )
    .bind(target.as_str())
    .bind(execution.started_at.map(to_millis))
    .bind(execution.completed_at.map(to_millis))
    .bind(execution_id)
    .bind(previous.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(Transition::Applied {
        previous,
        execution,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SessionStore, StoreLocation};

    async fn open_store() -> SessionStore {
        SessionStore::open(&StoreLocation::InMemory).await.unwrap()
    }

    async fn force_status(conn: &mut SqliteConnection, execution_id: &str, status: ExecutionStatus) {
        sqlx::query("UPDATE executions SET status = ?1 WHERE execution_id = ?2")
            .bind(status.as_str())
            .bind(execution_id)
            .execute(&mut *conn)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = open_store().await;
        let mut conn = store.connection().await.unwrap();

        let inserted = insert_pending(
            &mut conn,
            "exec-1",
            "session-1",
            "owner-1",
            &ExecutionPayload::new("write docs"),
            Utc::now(),
        )
        .await
        .unwrap();

        let fetched = get(&mut conn, "exec-1").await.unwrap().unwrap();
        assert_eq!(fetched, inserted);
        assert_eq!(fetched.status, ExecutionStatus::Pending);
        assert!(fetched.started_at.is_none());
        assert!(get(&mut conn, "exec-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_execution_id_is_rejected_by_store() {
        let store = open_store().await;
        let mut conn = store.connection().await.unwrap();
        let payload = ExecutionPayload::new("x");

        insert_pending(&mut conn, "exec-1", "s", "o", &payload, Utc::now())
            .await
            .unwrap();
        let duplicate = insert_pending(&mut conn, "exec-1", "s", "o", &payload, Utc::now()).await;
        assert!(matches!(duplicate, Err(StoreError::Database(_))));
    }

    #[tokio::test]
    async fn test_transition_table_persisted() {
        let store = open_store().await;
        let mut conn = store.connection().await.unwrap();
        let now = Utc::now();

        for (i, current) in ExecutionStatus::ALL.iter().enumerate() {
            for (j, target) in ExecutionStatus::ALL.iter().enumerate() {
                let id = format!("exec-{i}-{j}");
                insert_pending(&mut conn, &id, "s", "o", &ExecutionPayload::new("x"), now)
                    .await
                    .unwrap();
                force_status(&mut conn, &id, *current).await;

                let result = apply_transition(&mut conn, &id, *target, now).await.unwrap();
                let stored = get(&mut conn, &id).await.unwrap().unwrap();

                if current.can_transition_to(*target) {
                    assert!(
                        matches!(result, Transition::Applied { previous, .. } if previous == *current),
                        "{current} -> {target}"
                    );
                    assert_eq!(stored.status, *target);
                } else {
                    assert_eq!(result, Transition::Rejected { current: *current });
                    assert_eq!(stored.status, *current, "{current} -> {target} must not write");
                }
            }
        }
    }

    #[tokio::test]
    async fn test_pending_cannot_complete_without_running() {
        let store = open_store().await;
        let mut conn = store.connection().await.unwrap();
        let now = Utc::now();

        insert_pending(&mut conn, "exec-1", "s", "o", &ExecutionPayload::new("x"), now)
            .await
            .unwrap();

        for target in [ExecutionStatus::Completed, ExecutionStatus::Failed] {
            let result = apply_transition(&mut conn, "exec-1", target, now)
                .await
                .unwrap();
            assert_eq!(
                result,
                Transition::Rejected {
                    current: ExecutionStatus::Pending
                }
            );
        }
    }

    #[tokio::test]
    async fn test_transition_stamps_timestamps() {
        let store = open_store().await;
        let mut conn = store.connection().await.unwrap();
        let created = Utc::now();
        let started = created + chrono::Duration::seconds(1);
        let finished = created + chrono::Duration::seconds(5);

        insert_pending(&mut conn, "exec-1", "s", "o", &ExecutionPayload::new("x"), created)
            .await
            .unwrap();
        apply_transition(&mut conn, "exec-1", ExecutionStatus::Running, started)
            .await
            .unwrap();
        apply_transition(&mut conn, "exec-1", ExecutionStatus::Completed, finished)
            .await
            .unwrap();

        let stored = get(&mut conn, "exec-1").await.unwrap().unwrap();
        assert_eq!(
            stored.started_at.map(|t| t.timestamp_millis()),
            Some(started.timestamp_millis())
        );
        assert_eq!(
            stored.completed_at.map(|t| t.timestamp_millis()),
            Some(finished.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn test_missing_execution() {
        let store = open_store().await;
        let mut conn = store.connection().await.unwrap();

        let result = apply_transition(&mut conn, "nope", ExecutionStatus::Running, Utc::now())
            .await
            .unwrap();
        assert_eq!(result, Transition::Missing);
    }

    #[tokio::test]
    async fn test_running_for_session() {
        let store = open_store().await;
        let mut conn = store.connection().await.unwrap();
        let now = Utc::now();

        insert_pending(&mut conn, "exec-1", "s1", "o", &ExecutionPayload::new("x"), now)
            .await
            .unwrap();
        insert_pending(&mut conn, "exec-2", "s2", "o", &ExecutionPayload::new("y"), now)
            .await
            .unwrap();
        assert!(running_for_session(&mut conn, "s1").await.unwrap().is_none());

        apply_transition(&mut conn, "exec-2", ExecutionStatus::Running, now)
            .await
            .unwrap();
        assert!(running_for_session(&mut conn, "s1").await.unwrap().is_none());
        let running = running_for_session(&mut conn, "s2").await.unwrap().unwrap();
        assert_eq!(running.execution_id, "exec-2");
    }
}
