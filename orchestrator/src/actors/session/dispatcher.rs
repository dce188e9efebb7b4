//! Dispatcher - start-or-enqueue, drain-on-terminal and the public operations
//!
//! Every function here runs inside the transaction the actor opened for one
//! message. None of them talk to the sandbox runner: an execution that must be
//! handed off is returned in `Step::handoff` and the actor dispatches it only
//! after the transaction commits.
//!
//! ```text
//!  start ──► idle & queue empty? ──yes──► pending → running ──► handoff
//!                   │no
//!                   ▼
//!              enqueue(seq)
//!
//!  terminal transition ──► drain: peek oldest ─► pending? ─► running + dequeue ─► handoff
//!                                               └─ stale ──► dequeue, next
//! ```

use chrono::{DateTime, Duration, Utc};
use shared_types::{
    CompletionReport, Execution, ExecutionOutcome, ExecutionPayload, ExecutionStatus,
    PreparedSession, QueueSnapshot, StartExecutionRequest, StartStatus,
};
use sqlx::SqliteConnection;

use crate::actors::session::protocol::{
    EnqueueOutcome, SessionError, SessionKey, StartAccepted, StatusUpdate, SweepReport,
};
use crate::store::executions::{self, Transition};
use crate::store::leases::{self, LeaseAcquisition};
use crate::store::{queue, sessions, StoreError};

/// Result of one operation plus the execution, if any, that the actor must
/// hand to the runner once the transaction commits.
#[derive(Debug, Clone, PartialEq)]
pub struct Step<T> {
    pub reply: T,
    pub handoff: Option<Execution>,
}

impl<T> Step<T> {
    fn new(reply: T, handoff: Option<Execution>) -> Self {
        Self { reply, handoff }
    }

    fn only(reply: T) -> Self {
        Self {
            reply,
            handoff: None,
        }
    }
}

fn start_status(execution: &Execution) -> StartStatus {
    if execution.status == ExecutionStatus::Pending {
        StartStatus::Queued
    } else {
        StartStatus::Started
    }
}

fn new_execution_id(requested: Option<String>) -> String {
    requested
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| ulid::Ulid::new().to_string())
}

/// Look up an execution that belongs to this session.
async fn session_execution(
    conn: &mut SqliteConnection,
    key: &SessionKey,
    execution_id: &str,
) -> Result<Option<Execution>, SessionError> {
    Ok(executions::get(conn, execution_id)
        .await?
        .filter(|e| e.session_id == key.session_id && e.owner_id == key.owner_id))
}

/// Move a pending execution to running. Anything but `Applied` means the
/// caller's view of the store is wrong.
async fn start_pending(
    conn: &mut SqliteConnection,
    execution_id: &str,
    now: DateTime<Utc>,
) -> Result<Execution, SessionError> {
    match executions::apply_transition(conn, execution_id, ExecutionStatus::Running, now).await? {
        Transition::Applied { execution, .. } => Ok(execution),
        Transition::Rejected { current } => Err(StoreError::CorruptRow(format!(
            "execution {execution_id} expected pending, found {current}"
        ))
        .into()),
        Transition::Missing => {
            Err(StoreError::CorruptRow(format!("execution {execution_id} vanished")).into())
        }
    }
}

pub async fn get_execution(
    conn: &mut SqliteConnection,
    key: &SessionKey,
    execution_id: &str,
) -> Result<Option<Execution>, SessionError> {
    session_execution(conn, key, execution_id).await
}

/// Create an execution and either start it or queue it.
///
/// A replayed `execution_id` returns the stored record untouched. When the
/// session is idle but commands are already waiting, the new execution queues
/// behind them and the drain starts the oldest one.
pub async fn enqueue_execution(
    conn: &mut SqliteConnection,
    key: &SessionKey,
    execution_id: &str,
    payload: &ExecutionPayload,
    start_immediately: bool,
    now: DateTime<Utc>,
) -> Result<Step<EnqueueOutcome>, SessionError> {
    if execution_id.trim().is_empty() {
        return Err(SessionError::BadRequest(
            "execution_id must not be empty".to_string(),
        ));
    }

    if let Some(existing) = executions::get(conn, execution_id).await? {
        if existing.session_id != key.session_id || existing.owner_id != key.owner_id {
            return Err(SessionError::BadRequest(format!(
                "execution {execution_id} belongs to another session"
            )));
        }
        tracing::debug!(
            session_id = %key.session_id,
            execution_id = %execution_id,
            status = %existing.status,
            "Replayed enqueue for existing execution"
        );
        return Ok(Step::only(EnqueueOutcome {
            status: start_status(&existing),
            execution: existing,
        }));
    }

    let execution = executions::insert_pending(
        conn,
        execution_id,
        &key.session_id,
        &key.owner_id,
        payload,
        now,
    )
    .await?;

    let idle = executions::running_for_session(conn, &key.session_id)
        .await?
        .is_none();
    let waiting = queue::count(conn, &key.session_id).await?;

    if start_immediately && idle && waiting == 0 {
        let started = start_pending(conn, execution_id, now).await?;
        tracing::info!(
            owner_id = %key.owner_id,
            session_id = %key.session_id,
            execution_id = %execution_id,
            "Execution started"
        );
        return Ok(Step::new(
            EnqueueOutcome {
                status: StartStatus::Started,
                execution: started.clone(),
            },
            Some(started),
        ));
    }

    let seq = queue::enqueue(conn, &key.session_id, execution_id, payload, now).await?;
    tracing::info!(
        owner_id = %key.owner_id,
        session_id = %key.session_id,
        execution_id = %execution_id,
        seq,
        waiting_ahead = waiting,
        "Execution queued"
    );

    let handoff = if start_immediately && idle {
        drain(conn, key, now).await?
    } else {
        None
    };

    let execution = match &handoff {
        Some(started) if started.execution_id == execution_id => started.clone(),
        _ => execution,
    };

    Ok(Step::new(
        EnqueueOutcome {
            status: start_status(&execution),
            execution,
        },
        handoff,
    ))
}

/// Start the oldest queued command if nothing is running.
///
/// Entries whose execution is no longer `pending` are dequeued and skipped. An
/// entry whose execution row is missing is recreated from its payload. Returns
/// the execution that was started, if any.
pub async fn drain(
    conn: &mut SqliteConnection,
    key: &SessionKey,
    now: DateTime<Utc>,
) -> Result<Option<Execution>, SessionError> {
    if let Some(running) = executions::running_for_session(conn, &key.session_id).await? {
        tracing::debug!(
            session_id = %key.session_id,
            running = %running.execution_id,
            "Drain skipped, session busy"
        );
        return Ok(None);
    }

    while let Some(command) = queue::peek_oldest(conn, &key.session_id).await? {
        let transition = executions::apply_transition(
            conn,
            &command.execution_id,
            ExecutionStatus::Running,
            now,
        )
        .await?;

        let started = match transition {
            Transition::Applied { execution, .. } => execution,
            Transition::Rejected { current } => {
                tracing::debug!(
                    session_id = %key.session_id,
                    execution_id = %command.execution_id,
                    seq = command.seq,
                    status = %current,
                    "Dropping stale queued command"
                );
                queue::dequeue_by_id(conn, command.seq).await?;
                continue;
            }
            Transition::Missing => {
                executions::insert_pending(
                    conn,
                    &command.execution_id,
                    &key.session_id,
                    &key.owner_id,
                    &command.payload,
                    command.created_at,
                )
                .await?;
                start_pending(conn, &command.execution_id, now).await?
            }
        };

        queue::dequeue_by_id(conn, command.seq).await?;
        tracing::info!(
            owner_id = %key.owner_id,
            session_id = %key.session_id,
            execution_id = %started.execution_id,
            seq = command.seq,
            "Drained queued execution"
        );
        return Ok(Some(started));
    }

    Ok(None)
}

/// Bookkeeping shared by every terminal transition: leases go, queue drains.
async fn after_terminal(
    conn: &mut SqliteConnection,
    key: &SessionKey,
    execution: &Execution,
    now: DateTime<Utc>,
) -> Result<Option<Execution>, SessionError> {
    let cleared = leases::clear(conn, &execution.execution_id).await?;
    if cleared > 0 {
        tracing::debug!(
            execution_id = %execution.execution_id,
            "Released lease of finished execution"
        );
    }
    drain(conn, key, now).await
}

pub async fn update_execution_status(
    conn: &mut SqliteConnection,
    key: &SessionKey,
    execution_id: &str,
    target: ExecutionStatus,
    now: DateTime<Utc>,
) -> Result<Step<StatusUpdate>, SessionError> {
    let Some(current) = session_execution(conn, key, execution_id).await? else {
        return Err(SessionError::NotFound(format!("execution {execution_id}")));
    };

    if !current.status.can_transition_to(target) {
        tracing::warn!(
            session_id = %key.session_id,
            execution_id = %execution_id,
            from = %current.status,
            to = %target,
            "Rejected invalid transition"
        );
        return Ok(Step::only(StatusUpdate::Rejected {
            current: current.status,
        }));
    }

    if target == ExecutionStatus::Running {
        if let Some(running) = executions::running_for_session(conn, &key.session_id).await? {
            return Err(SessionError::Busy(running.execution_id));
        }
    }

    let execution = match executions::apply_transition(conn, execution_id, target, now).await? {
        Transition::Applied { execution, .. } => execution,
        Transition::Rejected { current } => {
            return Ok(Step::only(StatusUpdate::Rejected { current }));
        }
        Transition::Missing => {
            return Err(SessionError::NotFound(format!("execution {execution_id}")));
        }
    };

    tracing::info!(
        session_id = %key.session_id,
        execution_id = %execution_id,
        from = %current.status,
        to = %target,
        "Execution status updated"
    );

    let handoff = if target == ExecutionStatus::Running {
        queue::remove_for_execution(conn, execution_id).await?;
        None
    } else if current.status == ExecutionStatus::Pending {
        // A pending execution never held the running slot, so nothing drains.
        queue::remove_for_execution(conn, execution_id).await?;
        leases::clear(conn, execution_id).await?;
        None
    } else if target.is_terminal() {
        after_terminal(conn, key, &execution, now).await?
    } else {
        None
    };

    Ok(Step::new(
        StatusUpdate::Applied {
            execution,
            next_execution_id: handoff.as_ref().map(|e| e.execution_id.clone()),
        },
        handoff,
    ))
}

/// Apply the runner's final outcome. A replay, or an outcome for an execution
/// that is not running, changes nothing and reports `applied: false`.
pub async fn on_execution_complete(
    conn: &mut SqliteConnection,
    key: &SessionKey,
    execution_id: &str,
    outcome: ExecutionOutcome,
    now: DateTime<Utc>,
) -> Result<Step<CompletionReport>, SessionError> {
    let Some(current) = session_execution(conn, key, execution_id).await? else {
        tracing::debug!(
            session_id = %key.session_id,
            execution_id = %execution_id,
            "Completion for unknown execution ignored"
        );
        return Ok(Step::only(CompletionReport {
            applied: false,
            status: None,
            next_execution_id: None,
        }));
    };

    let target = outcome.target_status();
    match executions::apply_transition(conn, &current.execution_id, target, now).await? {
        Transition::Applied { execution, .. } => {
            tracing::info!(
                session_id = %key.session_id,
                execution_id = %execution_id,
                status = %target,
                "Execution finished"
            );
            let handoff = after_terminal(conn, key, &execution, now).await?;
            Ok(Step::new(
                CompletionReport {
                    applied: true,
                    status: Some(target),
                    next_execution_id: handoff.as_ref().map(|e| e.execution_id.clone()),
                },
                handoff,
            ))
        }
        Transition::Rejected { current } => {
            tracing::debug!(
                session_id = %key.session_id,
                execution_id = %execution_id,
                status = %current,
                outcome = %target,
                "Completion ignored"
            );
            Ok(Step::only(CompletionReport {
                applied: false,
                status: Some(current),
                next_execution_id: None,
            }))
        }
        Transition::Missing => Ok(Step::only(CompletionReport {
            applied: false,
            status: None,
            next_execution_id: None,
        })),
    }
}

pub async fn cancel_execution(
    conn: &mut SqliteConnection,
    key: &SessionKey,
    execution_id: &str,
    now: DateTime<Utc>,
) -> Result<Step<CompletionReport>, SessionError> {
    let Some(current) = session_execution(conn, key, execution_id).await? else {
        return Err(SessionError::NotFound(format!("execution {execution_id}")));
    };

    if current.status.is_terminal() {
        return Ok(Step::only(CompletionReport {
            applied: false,
            status: Some(current.status),
            next_execution_id: None,
        }));
    }

    let (previous, execution) = match executions::apply_transition(
        conn,
        execution_id,
        ExecutionStatus::Cancelled,
        now,
    )
    .await?
    {
        Transition::Applied {
            previous,
            execution,
        } => (previous, execution),
        Transition::Rejected { current } => {
            return Ok(Step::only(CompletionReport {
                applied: false,
                status: Some(current),
                next_execution_id: None,
            }));
        }
        Transition::Missing => {
            return Err(SessionError::NotFound(format!("execution {execution_id}")));
        }
    };

    tracing::info!(
        session_id = %key.session_id,
        execution_id = %execution_id,
        from = %previous,
        "Execution cancelled"
    );

    let handoff = if previous == ExecutionStatus::Pending {
        queue::remove_for_execution(conn, execution_id).await?;
        leases::clear(conn, execution_id).await?;
        None
    } else {
        after_terminal(conn, key, &execution, now).await?
    };

    Ok(Step::new(
        CompletionReport {
            applied: true,
            status: Some(ExecutionStatus::Cancelled),
            next_execution_id: handoff.as_ref().map(|e| e.execution_id.clone()),
        },
        handoff,
    ))
}

/// Store the initial request. Refused once the session has started.
pub async fn prepare_session(
    conn: &mut SqliteConnection,
    key: &SessionKey,
    payload: &ExecutionPayload,
    now: DateTime<Utc>,
) -> Result<PreparedSession, SessionError> {
    if payload.prompt.trim().is_empty() {
        return Err(SessionError::BadRequest("prompt must not be empty".to_string()));
    }

    if let Some(existing) = sessions::get(conn, &key.session_id).await? {
        if existing.initiated_at.is_some() {
            return Err(SessionError::Conflict(format!(
                "session {} already initiated",
                key.session_id
            )));
        }
    }

    let prepared =
        sessions::upsert_prepared(conn, &key.session_id, &key.owner_id, payload, now).await?;
    tracing::info!(
        owner_id = %key.owner_id,
        session_id = %key.session_id,
        "Session prepared"
    );
    Ok(prepared)
}

pub async fn start_execution_v2(
    conn: &mut SqliteConnection,
    key: &SessionKey,
    request: StartExecutionRequest,
    now: DateTime<Utc>,
) -> Result<Step<StartAccepted>, SessionError> {
    match request {
        StartExecutionRequest::InitiatePrepared { execution_id } => {
            let Some(prepared) = sessions::get(conn, &key.session_id).await? else {
                return Err(SessionError::NotFound(format!(
                    "session {} has not been prepared",
                    key.session_id
                )));
            };

            if let Some(initial_id) = prepared.initial_execution_id {
                let initial = executions::get(conn, &initial_id).await?.ok_or_else(|| {
                    StoreError::CorruptRow(format!("initial execution {initial_id} missing"))
                })?;
                tracing::debug!(
                    session_id = %key.session_id,
                    execution_id = %initial_id,
                    "Session already initiated"
                );
                return Ok(Step::only(StartAccepted {
                    status: start_status(&initial),
                    execution_id: initial_id,
                }));
            }

            let execution_id = new_execution_id(execution_id);
            let step =
                enqueue_execution(conn, key, &execution_id, &prepared.payload, true, now).await?;
            sessions::mark_initiated(conn, &key.session_id, &execution_id, now).await?;

            Ok(Step::new(
                StartAccepted {
                    execution_id,
                    status: step.reply.status,
                },
                step.handoff,
            ))
        }
        StartExecutionRequest::Followup {
            execution_id,
            message,
            mode,
            model,
            metadata,
        } => {
            if execution_id.trim().is_empty() {
                return Err(SessionError::BadRequest(
                    "execution_id must not be empty".to_string(),
                ));
            }
            if message.trim().is_empty() {
                return Err(SessionError::BadRequest("message must not be empty".to_string()));
            }

            let initiated = sessions::get(conn, &key.session_id)
                .await?
                .is_some_and(|s| s.initiated_at.is_some());
            if !initiated {
                return Err(SessionError::NotFound(format!(
                    "session {} has not been initiated",
                    key.session_id
                )));
            }

            let payload = ExecutionPayload {
                prompt: message,
                mode,
                model,
                metadata,
            };
            let step = enqueue_execution(conn, key, &execution_id, &payload, true, now).await?;

            Ok(Step::new(
                StartAccepted {
                    execution_id,
                    status: step.reply.status,
                },
                step.handoff,
            ))
        }
    }
}

pub async fn acquire_lease(
    conn: &mut SqliteConnection,
    execution_id: &str,
    request_id: &str,
    holder_token: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<LeaseAcquisition, SessionError> {
    if holder_token.trim().is_empty() {
        return Err(SessionError::BadRequest(
            "holder_token must not be empty".to_string(),
        ));
    }

    let result = leases::acquire(conn, execution_id, request_id, holder_token, now, ttl).await?;
    match &result {
        LeaseAcquisition::Acquired { expires_at } => tracing::info!(
            execution_id = %execution_id,
            holder = %holder_token,
            expires_at = %expires_at,
            "Lease acquired"
        ),
        LeaseAcquisition::AlreadyHeld { holder } => tracing::debug!(
            execution_id = %execution_id,
            holder = %holder,
            requested_by = %holder_token,
            "Lease already held"
        ),
    }
    Ok(result)
}

pub async fn queue_snapshot(
    conn: &mut SqliteConnection,
    key: &SessionKey,
) -> Result<QueueSnapshot, SessionError> {
    let active = executions::running_for_session(conn, &key.session_id).await?;
    let queued = queue::list(conn, &key.session_id).await?;
    Ok(QueueSnapshot {
        owner_id: key.owner_id.clone(),
        session_id: key.session_id.clone(),
        active,
        count: queued.len() as i64,
        queued,
    })
}

/// Cancel pending executions whose queued command was created before `cutoff`.
async fn cancel_expired_commands(
    conn: &mut SqliteConnection,
    key: &SessionKey,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64, SessionError> {
    let mut cancelled = 0;
    for command in queue::list(conn, &key.session_id).await? {
        // Queue order follows seq, not created_at, so every entry is checked.
        if command.created_at >= cutoff {
            continue;
        }
        let pending = executions::get(conn, &command.execution_id)
            .await?
            .is_some_and(|e| e.status == ExecutionStatus::Pending);
        if !pending {
            continue;
        }
        if let Transition::Applied { .. } = executions::apply_transition(
            conn,
            &command.execution_id,
            ExecutionStatus::Cancelled,
            now,
        )
        .await?
        {
            tracing::info!(
                session_id = %key.session_id,
                execution_id = %command.execution_id,
                seq = command.seq,
                "Cancelled expired queued execution"
            );
            cancelled += 1;
        }
    }
    Ok(cancelled)
}

/// Periodic housekeeping: expire old queued commands, purge dead leases, and
/// start the queue head if the session is idle.
pub async fn sweep(
    conn: &mut SqliteConnection,
    key: &SessionKey,
    now: DateTime<Utc>,
) -> Result<Step<SweepReport>, SessionError> {
    let cutoff = queue::retention_cutoff(now);
    let cancelled_executions = cancel_expired_commands(conn, key, cutoff, now).await?;
    let deleted_commands = queue::delete_expired(conn, &key.session_id, now).await?;
    let purged_leases = leases::purge_expired(conn, now).await?;
    let handoff = drain(conn, key, now).await?;

    Ok(Step::new(
        SweepReport {
            cancelled_executions,
            deleted_commands,
            purged_leases,
            next_execution_id: handoff.as_ref().map(|e| e.execution_id.clone()),
        },
        handoff,
    ))
}

/// Drop every queued command older than `cutoff`, cancelling the pending
/// executions they would have started.
pub async fn purge_queue_older_than(
    conn: &mut SqliteConnection,
    key: &SessionKey,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<SweepReport, SessionError> {
    let cancelled_executions = cancel_expired_commands(conn, key, cutoff, now).await?;
    let deleted_commands = queue::delete_older_than(conn, cutoff).await?;
    Ok(SweepReport {
        cancelled_executions,
        deleted_commands,
        ..Default::default()
    })
}
