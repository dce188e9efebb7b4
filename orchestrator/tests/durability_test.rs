//! Restart tests against file-backed session stores
//!
//! A stopped SessionActor must leave behind everything needed for a fresh
//! actor on the same files to carry on: the running execution, queue order,
//! leases and the prepared session.

use shared_types::{
    ExecutionOutcome, ExecutionPayload, ExecutionStatus, StartExecutionRequest, StartStatus,
};
use std::sync::Arc;

use orchestrator::actors::session::{SessionKey, SessionMsg, SessionSettings};
use orchestrator::registry::{SessionRegistry, StoragePolicy};
use orchestrator::runner::NoopRunner;
use orchestrator::store::leases::LeaseAcquisition;

fn registry_at(root: &std::path::Path) -> SessionRegistry {
    SessionRegistry::new(
        StoragePolicy::Directory(root.to_path_buf()),
        Arc::new(NoopRunner),
        SessionSettings {
            sweep_interval: None,
            ..Default::default()
        },
    )
}

async fn enqueue(
    registry: &SessionRegistry,
    key: &SessionKey,
    execution_id: &str,
    start_immediately: bool,
) -> StartStatus {
    registry
        .ask(key, |reply| SessionMsg::EnqueueExecution {
            execution_id: execution_id.to_string(),
            payload: ExecutionPayload::new(execution_id),
            start_immediately,
            reply,
        })
        .await
        .unwrap()
        .unwrap()
        .status
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let key = SessionKey::new("owner-1", "session-1").unwrap();

    let registry = registry_at(temp_dir.path());
    assert_eq!(enqueue(&registry, &key, "exec1", true).await, StartStatus::Started);
    assert_eq!(enqueue(&registry, &key, "exec2", true).await, StartStatus::Queued);
    assert_eq!(enqueue(&registry, &key, "exec3", true).await, StartStatus::Queued);
    let lease = registry
        .ask(&key, |reply| SessionMsg::AcquireLease {
            execution_id: "exec1".to_string(),
            request_id: Some("req-1".to_string()),
            holder_token: "runner-a".to_string(),
            reply,
        })
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(lease, LeaseAcquisition::Acquired { .. }));
    registry.shutdown().await;

    assert!(temp_dir.path().join("owner-1").join("session-1.db").exists());

    let restarted = registry_at(temp_dir.path());
    let snapshot = restarted
        .ask(&key, |reply| SessionMsg::QueueSnapshot { reply })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        snapshot.active.map(|e| e.execution_id),
        Some("exec1".to_string())
    );
    let queued: Vec<String> = snapshot
        .queued
        .into_iter()
        .map(|c| c.execution_id)
        .collect();
    assert_eq!(queued, vec!["exec2", "exec3"]);

    let held = restarted
        .ask(&key, |reply| SessionMsg::AcquireLease {
            execution_id: "exec1".to_string(),
            request_id: None,
            holder_token: "runner-b".to_string(),
            reply,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        held,
        LeaseAcquisition::AlreadyHeld {
            holder: "runner-a".to_string()
        }
    );

    let report = restarted
        .ask(&key, |reply| SessionMsg::ExecutionComplete {
            execution_id: "exec1".to_string(),
            outcome: ExecutionOutcome::Completed,
            reply,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.next_execution_id.as_deref(), Some("exec2"));
    restarted.shutdown().await;
}

#[tokio::test]
async fn test_idle_backlog_resumes_on_start() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let key = SessionKey::new("owner-1", "session-1").unwrap();

    let registry = registry_at(temp_dir.path());
    assert_eq!(enqueue(&registry, &key, "exec1", false).await, StartStatus::Queued);
    registry.shutdown().await;

    let restarted = registry_at(temp_dir.path());
    let execution = restarted
        .ask(&key, |reply| SessionMsg::GetExecution {
            execution_id: "exec1".to_string(),
            reply,
        })
        .await
        .unwrap()
        .unwrap()
        .expect("execution persisted");
    assert_eq!(execution.status, ExecutionStatus::Running);
    restarted.shutdown().await;
}

#[tokio::test]
async fn test_initiated_session_stays_initiated() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let key = SessionKey::new("owner-1", "session-1").unwrap();

    let registry = registry_at(temp_dir.path());
    registry
        .ask(&key, |reply| SessionMsg::PrepareSession {
            payload: ExecutionPayload::new("first prompt"),
            reply,
        })
        .await
        .unwrap()
        .unwrap();
    let first = registry
        .ask(&key, |reply| SessionMsg::StartExecution {
            request: StartExecutionRequest::InitiatePrepared { execution_id: None },
            reply,
        })
        .await
        .unwrap();
    registry.shutdown().await;

    let restarted = registry_at(temp_dir.path());
    let replay = restarted
        .ask(&key, |reply| SessionMsg::StartExecution {
            request: StartExecutionRequest::InitiatePrepared { execution_id: None },
            reply,
        })
        .await
        .unwrap();
    assert!(replay.success);
    assert_eq!(replay.execution_id, first.execution_id);

    let conflict = restarted
        .ask(&key, |reply| SessionMsg::PrepareSession {
            payload: ExecutionPayload::new("second prompt"),
            reply,
        })
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(conflict.code(), shared_types::CODE_CONFLICT);
    restarted.shutdown().await;
}
