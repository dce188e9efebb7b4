//! Sandbox runner port.
//!
//! The session actor calls `dispatch` after the `running` state is committed.
//! A runner only has to accept the work; completion is reported back later
//! through the completion endpoint.

use async_trait::async_trait;
use shared_types::Execution;
use std::sync::Arc;
use std::time::Duration;

pub type SharedSandboxRunner = Arc<dyn SandboxRunner>;

#[derive(Debug, thiserror::Error, Clone)]
pub enum RunnerError {
    #[error("runner request failed: {0}")]
    Transport(String),

    #[error("runner rejected execution with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn dispatch(&self, execution: &Execution) -> Result<(), RunnerError>;
}

/// POSTs the execution as JSON to a configured endpoint
#[derive(Debug, Clone)]
pub struct HttpSandboxRunner {
    endpoint: String,
    http_client: reqwest::Client,
}

impl HttpSandboxRunner {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            endpoint: endpoint.into(),
            http_client,
        }
    }
}

#[async_trait]
impl SandboxRunner for HttpSandboxRunner {
    async fn dispatch(&self, execution: &Execution) -> Result<(), RunnerError> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .json(execution)
            .send()
            .await
            .map_err(|e| RunnerError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(
                execution_id = %execution.execution_id,
                endpoint = %self.endpoint,
                "Execution handed to sandbox runner"
            );
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(RunnerError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Accepts everything. Used when runners pull work instead of being pushed.
#[derive(Debug, Default, Clone)]
pub struct NoopRunner;

#[async_trait]
impl SandboxRunner for NoopRunner {
    async fn dispatch(&self, execution: &Execution) -> Result<(), RunnerError> {
        tracing::debug!(
            execution_id = %execution.execution_id,
            session_id = %execution.session_id,
            "No sandbox runner configured, execution left for polling"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared_types::{ExecutionPayload, ExecutionStatus};

    fn execution() -> Execution {
        Execution {
            execution_id: "exec-1".to_string(),
            session_id: "session-1".to_string(),
            owner_id: "owner-1".to_string(),
            status: ExecutionStatus::Running,
            payload: ExecutionPayload::new("hello"),
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_noop_runner_accepts() {
        assert!(NoopRunner.dispatch(&execution()).await.is_ok());
    }

    #[tokio::test]
    async fn test_http_runner_reports_transport_errors() {
        // Port 9 (discard) on localhost is not expected to accept HTTP.
        let runner = HttpSandboxRunner::new("http://127.0.0.1:9/dispatch");
        let err = runner.dispatch(&execution()).await.unwrap_err();
        assert!(matches!(err, RunnerError::Transport(_)));
    }
}
