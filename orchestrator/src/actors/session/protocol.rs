//! SessionActor message protocol
//!
//! Defines the messages a session actor accepts, the key that names a session,
//! and the error type shared by the dispatcher and the HTTP layer.

use chrono::{DateTime, Utc};
use ractor::RpcReplyPort;
use shared_types::{
    CompletionReport, Execution, ExecutionOutcome, ExecutionPayload, ExecutionStatus,
    PreparedSession, QueueSnapshot, StartExecutionRequest, StartExecutionResponse, StartStatus,
};

use crate::store::leases::LeaseAcquisition;
use crate::store::StoreError;

/// Identity of one session actor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub owner_id: String,
    pub session_id: String,
}

impl SessionKey {
    /// Both ids end up in a file path, so separators and dot segments are refused.
    pub fn new(
        owner_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Result<Self, SessionError> {
        let owner_id = owner_id.into();
        let session_id = session_id.into();
        validate_id("owner_id", &owner_id)?;
        validate_id("session_id", &session_id)?;
        Ok(Self {
            owner_id,
            session_id,
        })
    }

    /// Name used when registering the actor.
    pub fn actor_name(&self) -> String {
        format!("session:{}:{}", self.owner_id, self.session_id)
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.session_id)
    }
}

fn validate_id(field: &str, value: &str) -> Result<(), SessionError> {
    if value.trim().is_empty() {
        return Err(SessionError::BadRequest(format!("{field} must not be empty")));
    }
    if value == "." || value == ".." || value.contains(['/', '\\', '\0']) {
        return Err(SessionError::BadRequest(format!(
            "{field} contains invalid characters"
        )));
    }
    Ok(())
}

// ============================================================================
// Messages
// ============================================================================

/// Messages handled by SessionActor
#[derive(Debug)]
pub enum SessionMsg {
    /// Store the initial request for a session that has not started yet
    PrepareSession {
        payload: ExecutionPayload,
        reply: RpcReplyPort<Result<PreparedSession, SessionError>>,
    },
    /// Start the prepared execution or submit a follow-up
    StartExecution {
        request: StartExecutionRequest,
        reply: RpcReplyPort<StartExecutionResponse>,
    },
    /// Create an execution, starting it now or queueing it
    EnqueueExecution {
        execution_id: String,
        payload: ExecutionPayload,
        start_immediately: bool,
        reply: RpcReplyPort<Result<EnqueueOutcome, SessionError>>,
    },
    GetExecution {
        execution_id: String,
        reply: RpcReplyPort<Result<Option<Execution>, SessionError>>,
    },
    /// Explicit state machine move
    UpdateExecutionStatus {
        execution_id: String,
        status: ExecutionStatus,
        reply: RpcReplyPort<Result<StatusUpdate, SessionError>>,
    },
    /// Final result reported by the runner
    ExecutionComplete {
        execution_id: String,
        outcome: ExecutionOutcome,
        reply: RpcReplyPort<Result<CompletionReport, SessionError>>,
    },
    CancelExecution {
        execution_id: String,
        reply: RpcReplyPort<Result<CompletionReport, SessionError>>,
    },
    AcquireLease {
        execution_id: String,
        request_id: Option<String>,
        holder_token: String,
        reply: RpcReplyPort<Result<LeaseAcquisition, SessionError>>,
    },
    ExtendLease {
        execution_id: String,
        holder_token: String,
        reply: RpcReplyPort<Result<bool, SessionError>>,
    },
    ReleaseLease {
        execution_id: String,
        holder_token: String,
        reply: RpcReplyPort<Result<bool, SessionError>>,
    },
    QueueSnapshot {
        reply: RpcReplyPort<Result<QueueSnapshot, SessionError>>,
    },
    /// Housekeeping. The interval ticker casts this without a reply port.
    Sweep {
        reply: Option<RpcReplyPort<Result<SweepReport, SessionError>>>,
    },
    /// Drop queued commands created before `cutoff`
    PurgeQueueOlderThan {
        cutoff: DateTime<Utc>,
        reply: RpcReplyPort<Result<SweepReport, SessionError>>,
    },
    /// The sandbox runner refused an execution after it was committed as running
    DispatchFailed { execution_id: String, error: String },
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOutcome {
    pub status: StartStatus,
    pub execution: Execution,
}

/// Accepted start request, before the stream URL is attached
#[derive(Debug, Clone, PartialEq)]
pub struct StartAccepted {
    pub execution_id: String,
    pub status: StartStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Applied {
        execution: Execution,
        next_execution_id: Option<String>,
    },
    /// The transition table refused the move; nothing was written.
    Rejected { current: ExecutionStatus },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cancelled_executions: u64,
    pub deleted_commands: u64,
    pub purged_leases: u64,
    pub next_execution_id: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by SessionActor operations
#[derive(Debug, thiserror::Error, Clone)]
pub enum SessionError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Another execution already holds the session's running slot
    #[error("session busy: execution {0} is running")]
    Busy(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("session actor unavailable: {0}")]
    ActorUnavailable(String),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotFound(_) => shared_types::CODE_NOT_FOUND,
            SessionError::BadRequest(_) => shared_types::CODE_BAD_REQUEST,
            SessionError::Conflict(_) => shared_types::CODE_CONFLICT,
            SessionError::Busy(_) => shared_types::CODE_SESSION_BUSY,
            SessionError::Store(_) | SessionError::ActorUnavailable(_) => {
                shared_types::CODE_INTERNAL_ERROR
            }
        }
    }

    /// Message safe to hand to callers. Infrastructure detail stays in the logs.
    pub fn public_message(&self) -> String {
        match self {
            SessionError::Store(_) | SessionError::ActorUnavailable(_) => {
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<sqlx::Error> for SessionError {
    fn from(e: sqlx::Error) -> Self {
        SessionError::Store(StoreError::from(e))
    }
}
