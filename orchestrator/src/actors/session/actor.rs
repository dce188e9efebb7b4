//! SessionActor - the single writer for one session's executions
//!
//! The actor owns the session's store. Each message opens one transaction,
//! runs the dispatcher operation inside it and commits before replying. Work
//! that has to leave the process (runner dispatch) is spawned only after the
//! commit and reports failures back as `SessionMsg::DispatchFailed`.

use async_trait::async_trait;
use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use shared_types::{
    CompletionReport, Execution, ExecutionOutcome, ExecutionPayload, ExecutionStatus,
    PreparedSession, QueueSnapshot, StartExecutionRequest, StartExecutionResponse,
};
use std::time::Duration;

use crate::actors::session::dispatcher;
use crate::actors::session::protocol::{
    EnqueueOutcome, SessionError, SessionKey, SessionMsg, StatusUpdate, SweepReport,
};
use crate::runner::SharedSandboxRunner;
use crate::store::leases::{self, LeaseAcquisition};
use crate::store::{SessionStore, StoreLocation};

/// Tunables shared by every session actor
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub lease_ttl: chrono::Duration,
    /// `None` disables the housekeeping ticker.
    pub sweep_interval: Option<Duration>,
    pub stream_base_url: String,
    /// How long a quiescent session keeps its actor before the registry stops
    /// it. `None` keeps actors until shutdown.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            lease_ttl: chrono::Duration::seconds(60),
            sweep_interval: Some(Duration::from_secs(300)),
            stream_base_url: "http://localhost:8080".to_string(),
            idle_timeout: Some(Duration::from_secs(1800)),
        }
    }
}

impl SessionSettings {
    pub fn stream_url(&self, key: &SessionKey, execution_id: &str) -> String {
        format!(
            "{}/sessions/{}/{}/executions/{}/stream",
            self.stream_base_url.trim_end_matches('/'),
            key.owner_id,
            key.session_id,
            execution_id
        )
    }
}

/// Arguments for spawning SessionActor
#[derive(Clone)]
pub struct SessionArguments {
    pub key: SessionKey,
    pub location: StoreLocation,
    pub runner: SharedSandboxRunner,
    pub settings: SessionSettings,
}

pub struct SessionState {
    key: SessionKey,
    store: SessionStore,
    runner: SharedSandboxRunner,
    settings: SessionSettings,
    ticker: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Debug, Default)]
pub struct SessionActor;

#[async_trait]
impl Actor for SessionActor {
    type Msg = SessionMsg;
    type State = SessionState;
    type Arguments = SessionArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            owner_id = %args.key.owner_id,
            session_id = %args.key.session_id,
            "SessionActor starting"
        );

        let store = SessionStore::open(&args.location)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to open session store: {e}")))?;

        Ok(SessionState {
            key: args.key,
            store,
            runner: args.runner,
            settings: args.settings,
            ticker: None,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        // Work queued before a restart must not sit idle.
        match self.recover(&myself, state).await {
            Ok(Some(execution_id)) => tracing::info!(
                session_id = %state.key.session_id,
                execution_id = %execution_id,
                "Resumed queue after restart"
            ),
            Ok(None) => {}
            Err(e) => tracing::error!(
                session_id = %state.key.session_id,
                error = %e,
                "Queue recovery failed"
            ),
        }

        if let Some(interval) = state.settings.sweep_interval {
            let tick_ref = myself.clone();
            state.ticker = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if tick_ref.cast(SessionMsg::Sweep { reply: None }).is_err() {
                        break;
                    }
                }
            }));
        }

        tracing::info!(actor_id = %myself.get_id(), "SessionActor started successfully");
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SessionMsg::PrepareSession { payload, reply } => {
                let result = self.handle_prepare(state, payload).await;
                let _ = reply.send(result);
            }
            SessionMsg::StartExecution { request, reply } => {
                let response = self.handle_start(&myself, state, request).await;
                let _ = reply.send(response);
            }
            SessionMsg::EnqueueExecution {
                execution_id,
                payload,
                start_immediately,
                reply,
            } => {
                let result = self
                    .handle_enqueue(&myself, state, execution_id, payload, start_immediately)
                    .await;
                let _ = reply.send(result);
            }
            SessionMsg::GetExecution {
                execution_id,
                reply,
            } => {
                let result = self.handle_get_execution(state, &execution_id).await;
                let _ = reply.send(result);
            }
            SessionMsg::UpdateExecutionStatus {
                execution_id,
                status,
                reply,
            } => {
                let result = self
                    .handle_update_status(&myself, state, &execution_id, status)
                    .await;
                let _ = reply.send(result);
            }
            SessionMsg::ExecutionComplete {
                execution_id,
                outcome,
                reply,
            } => {
                let result = self
                    .handle_complete(&myself, state, &execution_id, outcome)
                    .await;
                let _ = reply.send(result);
            }
            SessionMsg::CancelExecution {
                execution_id,
                reply,
            } => {
                let result = self.handle_cancel(&myself, state, &execution_id).await;
                let _ = reply.send(result);
            }
            SessionMsg::AcquireLease {
                execution_id,
                request_id,
                holder_token,
                reply,
            } => {
                let result = self
                    .handle_acquire_lease(state, &execution_id, request_id, &holder_token)
                    .await;
                let _ = reply.send(result);
            }
            SessionMsg::ExtendLease {
                execution_id,
                holder_token,
                reply,
            } => {
                let result = self
                    .handle_extend_lease(state, &execution_id, &holder_token)
                    .await;
                let _ = reply.send(result);
            }
            SessionMsg::ReleaseLease {
                execution_id,
                holder_token,
                reply,
            } => {
                let result = self
                    .handle_release_lease(state, &execution_id, &holder_token)
                    .await;
                let _ = reply.send(result);
            }
            SessionMsg::QueueSnapshot { reply } => {
                let result = self.handle_queue_snapshot(state).await;
                let _ = reply.send(result);
            }
            SessionMsg::Sweep { reply } => {
                let result = self.handle_sweep(&myself, state).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::error!(
                                session_id = %state.key.session_id,
                                error = %e,
                                "Scheduled sweep failed"
                            );
                        }
                    }
                }
            }
            SessionMsg::PurgeQueueOlderThan { cutoff, reply } => {
                let result = self.handle_purge(state, cutoff).await;
                let _ = reply.send(result);
            }
            SessionMsg::DispatchFailed {
                execution_id,
                error,
            } => {
                tracing::warn!(
                    session_id = %state.key.session_id,
                    execution_id = %execution_id,
                    error = %error,
                    "Sandbox runner refused execution, marking failed"
                );
                if let Err(e) = self
                    .handle_complete(&myself, state, &execution_id, ExecutionOutcome::Failed)
                    .await
                {
                    tracing::error!(
                        session_id = %state.key.session_id,
                        execution_id = %execution_id,
                        error = %e,
                        "Failed to record dispatch failure"
                    );
                }
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
        state.store.close().await;
        tracing::info!(actor_id = %myself.get_id(), "SessionActor stopped");
        Ok(())
    }
}

impl SessionActor {
    /// Spawn the runner call for a committed `running` execution.
    fn hand_off(
        &self,
        myself: &ActorRef<SessionMsg>,
        state: &SessionState,
        execution: Option<Execution>,
    ) {
        let Some(execution) = execution else {
            return;
        };
        let runner = state.runner.clone();
        let myself = myself.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.dispatch(&execution).await {
                let _ = myself.cast(SessionMsg::DispatchFailed {
                    execution_id: execution.execution_id.clone(),
                    error: e.to_string(),
                });
            }
        });
    }

    async fn recover(
        &self,
        myself: &ActorRef<SessionMsg>,
        state: &SessionState,
    ) -> Result<Option<String>, SessionError> {
        let mut tx = state.store.begin().await?;
        let started = dispatcher::drain(&mut tx, &state.key, Utc::now()).await?;
        tx.commit().await?;
        let execution_id = started.as_ref().map(|e| e.execution_id.clone());
        self.hand_off(myself, state, started);
        Ok(execution_id)
    }

    async fn handle_prepare(
        &self,
        state: &SessionState,
        payload: ExecutionPayload,
    ) -> Result<PreparedSession, SessionError> {
        let mut tx = state.store.begin().await?;
        let prepared =
            dispatcher::prepare_session(&mut tx, &state.key, &payload, Utc::now()).await?;
        tx.commit().await?;
        Ok(prepared)
    }

    async fn handle_start(
        &self,
        myself: &ActorRef<SessionMsg>,
        state: &SessionState,
        request: StartExecutionRequest,
    ) -> StartExecutionResponse {
        let result = async {
            let mut tx = state.store.begin().await?;
            let step =
                dispatcher::start_execution_v2(&mut tx, &state.key, request, Utc::now()).await?;
            tx.commit().await?;
            Ok::<_, SessionError>(step)
        }
        .await;

        match result {
            Ok(step) => {
                let accepted = step.reply;
                self.hand_off(myself, state, step.handoff);
                let stream_url = state.settings.stream_url(&state.key, &accepted.execution_id);
                StartExecutionResponse::accepted(accepted.execution_id, accepted.status, stream_url)
            }
            Err(e) => {
                if matches!(e, SessionError::Store(_)) {
                    tracing::error!(
                        session_id = %state.key.session_id,
                        error = %e,
                        "Start execution failed"
                    );
                }
                StartExecutionResponse::failed(e.code(), e.public_message())
            }
        }
    }

    async fn handle_enqueue(
        &self,
        myself: &ActorRef<SessionMsg>,
        state: &SessionState,
        execution_id: String,
        payload: ExecutionPayload,
        start_immediately: bool,
    ) -> Result<EnqueueOutcome, SessionError> {
        let mut tx = state.store.begin().await?;
        let step = dispatcher::enqueue_execution(
            &mut tx,
            &state.key,
            &execution_id,
            &payload,
            start_immediately,
            Utc::now(),
        )
        .await?;
        tx.commit().await?;
        self.hand_off(myself, state, step.handoff);
        Ok(step.reply)
    }

    async fn handle_get_execution(
        &self,
        state: &SessionState,
        execution_id: &str,
    ) -> Result<Option<Execution>, SessionError> {
        let mut conn = state.store.connection().await?;
        dispatcher::get_execution(&mut conn, &state.key, execution_id).await
    }

    async fn handle_update_status(
        &self,
        myself: &ActorRef<SessionMsg>,
        state: &SessionState,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> Result<StatusUpdate, SessionError> {
        let mut tx = state.store.begin().await?;
        let step = dispatcher::update_execution_status(
            &mut tx,
            &state.key,
            execution_id,
            status,
            Utc::now(),
        )
        .await?;
        tx.commit().await?;
        self.hand_off(myself, state, step.handoff);
        Ok(step.reply)
    }

    async fn handle_complete(
        &self,
        myself: &ActorRef<SessionMsg>,
        state: &SessionState,
        execution_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<CompletionReport, SessionError> {
        let mut tx = state.store.begin().await?;
        let step = dispatcher::on_execution_complete(
            &mut tx,
            &state.key,
            execution_id,
            outcome,
            Utc::now(),
        )
        .await?;
        tx.commit().await?;
        self.hand_off(myself, state, step.handoff);
        Ok(step.reply)
    }

    async fn handle_cancel(
        &self,
        myself: &ActorRef<SessionMsg>,
        state: &SessionState,
        execution_id: &str,
    ) -> Result<CompletionReport, SessionError> {
        let mut tx = state.store.begin().await?;
        let step =
            dispatcher::cancel_execution(&mut tx, &state.key, execution_id, Utc::now()).await?;
        tx.commit().await?;
        self.hand_off(myself, state, step.handoff);
        Ok(step.reply)
    }

    async fn handle_acquire_lease(
        &self,
        state: &SessionState,
        execution_id: &str,
        request_id: Option<String>,
        holder_token: &str,
    ) -> Result<LeaseAcquisition, SessionError> {
        let request_id = request_id.unwrap_or_else(|| ulid::Ulid::new().to_string());
        let mut tx = state.store.begin().await?;
        let result = dispatcher::acquire_lease(
            &mut tx,
            execution_id,
            &request_id,
            holder_token,
            Utc::now(),
            state.settings.lease_ttl,
        )
        .await?;
        tx.commit().await?;
        Ok(result)
    }

    async fn handle_extend_lease(
        &self,
        state: &SessionState,
        execution_id: &str,
        holder_token: &str,
    ) -> Result<bool, SessionError> {
        let mut tx = state.store.begin().await?;
        let extended = leases::extend(
            &mut tx,
            execution_id,
            holder_token,
            Utc::now(),
            state.settings.lease_ttl,
        )
        .await?;
        tx.commit().await?;
        if !extended {
            tracing::debug!(
                execution_id = %execution_id,
                holder = %holder_token,
                "Lease extension refused"
            );
        }
        Ok(extended)
    }

    async fn handle_release_lease(
        &self,
        state: &SessionState,
        execution_id: &str,
        holder_token: &str,
    ) -> Result<bool, SessionError> {
        let mut tx = state.store.begin().await?;
        let released = leases::release(&mut tx, execution_id, holder_token, Utc::now()).await?;
        tx.commit().await?;
        if released {
            tracing::info!(execution_id = %execution_id, holder = %holder_token, "Lease released");
        }
        Ok(released)
    }

    async fn handle_queue_snapshot(
        &self,
        state: &SessionState,
    ) -> Result<QueueSnapshot, SessionError> {
        let mut conn = state.store.connection().await?;
        dispatcher::queue_snapshot(&mut conn, &state.key).await
    }

    async fn handle_sweep(
        &self,
        myself: &ActorRef<SessionMsg>,
        state: &SessionState,
    ) -> Result<SweepReport, SessionError> {
        let mut tx = state.store.begin().await?;
        let step = dispatcher::sweep(&mut tx, &state.key, Utc::now()).await?;
        tx.commit().await?;

        let report = &step.reply;
        if report.cancelled_executions > 0 || report.deleted_commands > 0 || report.purged_leases > 0
        {
            tracing::info!(
                session_id = %state.key.session_id,
                cancelled = report.cancelled_executions,
                deleted = report.deleted_commands,
                purged_leases = report.purged_leases,
                "Session sweep"
            );
        }
        self.hand_off(myself, state, step.handoff);
        Ok(step.reply)
    }

    async fn handle_purge(
        &self,
        state: &SessionState,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<SweepReport, SessionError> {
        let mut tx = state.store.begin().await?;
        let report =
            dispatcher::purge_queue_older_than(&mut tx, &state.key, cutoff, Utc::now()).await?;
        tx.commit().await?;
        tracing::info!(
            session_id = %state.key.session_id,
            cutoff = %cutoff,
            deleted = report.deleted_commands,
            "Purged queued commands"
        );
        Ok(report)
    }
}
