//! Shared types between the session orchestrator and its callers
//!
//! These types are used by both:
//! - the per-session actors (native Rust)
//! - HTTP callers (API handlers, sandbox runners, retry wrappers)
//!
//! Serializable with serde for JSON over HTTP. Field names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Error Codes
// ============================================================================

pub const CODE_NOT_FOUND: &str = "NOT_FOUND";
pub const CODE_BAD_REQUEST: &str = "BAD_REQUEST";
pub const CODE_CONFLICT: &str = "CONFLICT";
pub const CODE_INTERNAL_ERROR: &str = "INTERNAL_ERROR";
pub const CODE_INVALID_TRANSITION: &str = "INVALID_TRANSITION";
pub const CODE_ALREADY_HELD: &str = "ALREADY_HELD";
pub const CODE_SESSION_BUSY: &str = "SESSION_BUSY";

/// Machine-readable error body returned by the HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

// ============================================================================
// Execution Lifecycle
// ============================================================================

/// Lifecycle state of one execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 5] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Transition table. An execution must be observed `running` before it can
    /// complete or fail; only cancellation may skip `running`.
    pub fn can_transition_to(&self, target: ExecutionStatus) -> bool {
        matches!(
            (self, target),
            (ExecutionStatus::Pending, ExecutionStatus::Running)
                | (ExecutionStatus::Running, ExecutionStatus::Completed)
                | (ExecutionStatus::Running, ExecutionStatus::Failed)
                | (ExecutionStatus::Pending, ExecutionStatus::Cancelled)
                | (ExecutionStatus::Running, ExecutionStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result reported by a sandbox runner
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOutcome {
    Completed,
    Failed,
}

impl ExecutionOutcome {
    pub fn target_status(&self) -> ExecutionStatus {
        match self {
            ExecutionOutcome::Completed => ExecutionStatus::Completed,
            ExecutionOutcome::Failed => ExecutionStatus::Failed,
        }
    }
}

/// Opaque work description handed to the sandbox runner.
///
/// The orchestrator only routes it; nothing in here affects scheduling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPayload {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl ExecutionPayload {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

/// Execution - one attempt to run the agent for a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub execution_id: String,
    pub session_id: String,
    pub owner_id: String,
    pub status: ExecutionStatus,
    pub payload: ExecutionPayload,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Follow-up waiting behind the active execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedCommand {
    /// Store-wide sequence number (strictly increasing)
    pub seq: i64,
    pub session_id: String,
    pub execution_id: String,
    pub payload: ExecutionPayload,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Start / Enqueue
// ============================================================================

/// Request accepted by `startExecutionV2`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StartExecutionRequest {
    /// Start the execution stored by a previous prepare call.
    #[serde(rename_all = "camelCase")]
    InitiatePrepared {
        #[serde(default)]
        execution_id: Option<String>,
    },
    /// Follow-up message for an already initiated session. The caller picks
    /// the id so a retried request lands on the same execution.
    #[serde(rename_all = "camelCase")]
    Followup {
        #[serde(default)]
        execution_id: String,
        message: String,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        metadata: serde_json::Value,
    },
}

/// Whether an accepted request started right away or waits in the queue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StartStatus {
    Queued,
    Started,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StartStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StartExecutionResponse {
    pub fn accepted(
        execution_id: impl Into<String>,
        status: StartStatus,
        stream_url: impl Into<String>,
    ) -> Self {
        Self {
            success: true,
            execution_id: Some(execution_id.into()),
            status: Some(status),
            stream_url: Some(stream_url.into()),
            code: None,
            error: None,
        }
    }

    pub fn failed(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            execution_id: None,
            status: None,
            stream_url: None,
            code: Some(code.into()),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueExecutionRequest {
    pub execution_id: String,
    pub payload: ExecutionPayload,
    #[serde(default)]
    pub start_immediately: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueExecutionResponse {
    pub status: StartStatus,
    pub execution: Execution,
}

/// Stored initial request for a session that has not started yet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreparedSession {
    pub session_id: String,
    pub owner_id: String,
    pub payload: ExecutionPayload,
    pub initial_execution_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub initiated_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Status / Completion
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusRequest {
    pub status: ExecutionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_status: Option<ExecutionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_execution_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompleteExecutionRequest {
    pub outcome: ExecutionOutcome,
}

/// What a completion or cancellation call changed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    /// False when the call was a replay or arrived out of order.
    pub applied: bool,
    pub status: Option<ExecutionStatus>,
    /// Execution started by the drain that followed, if any.
    pub next_execution_id: Option<String>,
}

// ============================================================================
// Leases
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcquireLeaseRequest {
    pub holder_token: String,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcquireLeaseResponse {
    pub acquired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseTokenRequest {
    pub holder_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseTokenResponse {
    pub ok: bool,
}

// ============================================================================
// Inspection
// ============================================================================

/// Point-in-time view of one session's work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub owner_id: String,
    pub session_id: String,
    pub active: Option<Execution>,
    pub queued: Vec<QueuedCommand>,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_is_exhaustive() {
        let legal = [
            (ExecutionStatus::Pending, ExecutionStatus::Running),
            (ExecutionStatus::Running, ExecutionStatus::Completed),
            (ExecutionStatus::Running, ExecutionStatus::Failed),
            (ExecutionStatus::Pending, ExecutionStatus::Cancelled),
            (ExecutionStatus::Running, ExecutionStatus::Cancelled),
        ];

        for current in ExecutionStatus::ALL {
            for target in ExecutionStatus::ALL {
                assert_eq!(
                    current.can_transition_to(target),
                    legal.contains(&(current, target)),
                    "{current} -> {target}"
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for current in ExecutionStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(ExecutionStatus::ALL
                .iter()
                .all(|target| !current.can_transition_to(*target)));
        }
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in ExecutionStatus::ALL {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExecutionStatus::parse("RUNNING"), None);
    }

    #[test]
    fn test_start_request_wire_format() {
        let followup: StartExecutionRequest = serde_json::from_value(serde_json::json!({
            "kind": "followup",
            "executionId": "exec-2",
            "message": "also add tests"
        }))
        .unwrap();
        assert_eq!(
            followup,
            StartExecutionRequest::Followup {
                execution_id: "exec-2".to_string(),
                message: "also add tests".to_string(),
                mode: None,
                model: None,
                metadata: serde_json::Value::Null,
            }
        );

        let initiate: StartExecutionRequest =
            serde_json::from_value(serde_json::json!({ "kind": "initiatePrepared" })).unwrap();
        assert_eq!(
            initiate,
            StartExecutionRequest::InitiatePrepared { execution_id: None }
        );
    }

    #[test]
    fn test_failed_start_response_omits_success_fields() {
        let json =
            serde_json::to_value(StartExecutionResponse::failed(CODE_NOT_FOUND, "missing"))
                .unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "NOT_FOUND");
        assert!(json.get("executionId").is_none());
    }
}
