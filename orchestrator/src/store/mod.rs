//! SessionStore - transactional SQLite storage private to one session actor
//!
//! Every session actor owns exactly one store. Nothing outside the actor
//! touches it, so there is no locking beyond SQLite's own transactions.
//!
//! # Layout
//!
//! - `executions` - execution records and the persisted state machine
//! - `queued_commands` - FIFO of follow-ups, ordered by `seq`
//! - `leases` - one row per leased execution
//! - `prepared_sessions` - initial request stored before the first start
//!
//! Each module exposes free functions over `&mut SqliteConnection` so the
//! dispatcher can compose several of them inside a single transaction.

pub mod executions;
pub mod leases;
pub mod queue;
pub mod sessions;

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};

/// Where a session store keeps its data
#[derive(Debug, Clone)]
pub enum StoreLocation {
    /// File-based database path
    File(PathBuf),
    /// In-memory database (for testing)
    InMemory,
}

/// Errors that can occur in the session store
#[derive(Debug, thiserror::Error, Clone)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub async fn open(location: &StoreLocation) -> Result<Self, StoreError> {
        let options = match location {
            StoreLocation::File(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
            }
            StoreLocation::InMemory => SqliteConnectOptions::from_str("sqlite::memory:")?,
        };

        // One connection: the actor is the only writer, and an in-memory
        // database lives exactly as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                execution_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                started_at_ms INTEGER,
                completed_at_ms INTEGER
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_executions_session_status ON executions(session_id, status)",
            r#"
            CREATE TABLE IF NOT EXISTS queued_commands (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                execution_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_queued_commands_session_seq ON queued_commands(session_id, seq)",
            "CREATE INDEX IF NOT EXISTS idx_queued_commands_created ON queued_commands(created_at_ms)",
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                execution_id TEXT PRIMARY KEY,
                holder_token TEXT NOT NULL,
                request_id TEXT NOT NULL,
                acquired_at_ms INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_leases_expiry ON leases(expires_at_ms)",
            r#"
            CREATE TABLE IF NOT EXISTS prepared_sessions (
                session_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                initial_execution_id TEXT,
                created_at_ms INTEGER NOT NULL,
                initiated_at_ms INTEGER
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Start the transaction that carries all mutations of one public call.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    /// Connection for read-only lookups.
    pub async fn connection(&self) -> Result<PoolConnection<Sqlite>, StoreError> {
        Ok(self.pool.acquire().await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::CorruptRow(format!("timestamp out of range: {ms}")))
}

pub(crate) fn from_optional_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(from_millis).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_is_idempotent_on_schema() {
        let store = SessionStore::open(&StoreLocation::InMemory).await.unwrap();
        store.run_migrations().await.unwrap();

        let mut conn = store.connection().await.unwrap();
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&mut *conn)
        .await
        .unwrap();

        let names: Vec<&str> = tables.iter().map(|(name,)| name.as_str()).collect();
        assert_eq!(
            names,
            vec!["executions", "leases", "prepared_sessions", "queued_commands"]
        );
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("owner-1").join("session-1.db");
        let location = StoreLocation::File(path.clone());

        let store = SessionStore::open(&location).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        queue::enqueue(
            &mut tx,
            "session-1",
            "exec-1",
            &shared_types::ExecutionPayload::new("hello"),
            Utc::now(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        store.close().await;

        assert!(path.exists());
        let reopened = SessionStore::open(&location).await.unwrap();
        let mut conn = reopened.connection().await.unwrap();
        assert_eq!(queue::count(&mut conn, "session-1").await.unwrap(), 1);
    }

    #[test]
    fn test_millis_conversion() {
        let now = Utc::now();
        let restored = from_millis(to_millis(now)).unwrap();
        assert_eq!(restored.timestamp_millis(), now.timestamp_millis());
        assert!(from_millis(i64::MAX).is_err());
    }
}
