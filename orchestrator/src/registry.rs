//! Session registry - one live SessionActor per `(owner, session)` key
//!
//! Lookups take the DashMap fast path. Creation goes through a single async
//! lock and re-checks the map, so concurrent first requests for a key still end
//! up on the same actor. An entry whose actor has stopped is replaced on the
//! next lookup.
//!
//! Every call through the registry marks its entry busy for the duration of
//! the call. The idle watchdog only stops actors with no calls in flight, no
//! running execution and an empty queue, and it does so under the creation
//! lock so a replacement never opens the same database while the old actor
//! still holds it.

use dashmap::DashMap;
use ractor::{Actor, ActorRef, ActorStatus, RpcReplyPort};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::actors::session::{
    SessionActor, SessionArguments, SessionError, SessionKey, SessionMsg, SessionSettings,
};
use crate::runner::SharedSandboxRunner;
use crate::store::StoreLocation;

/// Where session actors keep their databases
#[derive(Debug, Clone)]
pub enum StoragePolicy {
    /// `{root}/{owner_id}/{session_id}.db`
    Directory(PathBuf),
    /// Every actor gets a fresh in-memory database (for testing)
    InMemory,
}

impl StoragePolicy {
    pub fn location_for(&self, key: &SessionKey) -> StoreLocation {
        match self {
            StoragePolicy::Directory(root) => StoreLocation::File(
                root.join(&key.owner_id)
                    .join(format!("{}.db", key.session_id)),
            ),
            StoragePolicy::InMemory => StoreLocation::InMemory,
        }
    }
}

struct SessionEntry {
    actor: ActorRef<SessionMsg>,
    created: Instant,
    in_flight: AtomicUsize,
    /// Milliseconds after `created`
    last_activity_ms: AtomicU64,
}

impl SessionEntry {
    fn new(actor: ActorRef<SessionMsg>) -> Self {
        Self {
            actor,
            created: Instant::now(),
            in_flight: AtomicUsize::new(0),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_activity_ms.store(elapsed, Ordering::SeqCst);
    }

    fn idle_for(&self) -> Duration {
        self.created
            .elapsed()
            .saturating_sub(Duration::from_millis(self.last_activity_ms.load(Ordering::SeqCst)))
    }

    fn is_idle(&self, idle_timeout: Duration) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0 && self.idle_for() >= idle_timeout
    }
}

/// Marks an entry busy until dropped.
struct InFlight(Arc<SessionEntry>);

impl InFlight {
    fn enter(entry: &Arc<SessionEntry>) -> Self {
        entry.in_flight.fetch_add(1, Ordering::SeqCst);
        entry.touch();
        Self(entry.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.touch();
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: DashMap<SessionKey, Arc<SessionEntry>>,
    create_lock: Mutex<()>,
    storage: StoragePolicy,
    runner: SharedSandboxRunner,
    settings: SessionSettings,
}

impl SessionRegistry {
    pub fn new(
        storage: StoragePolicy,
        runner: SharedSandboxRunner,
        settings: SessionSettings,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                create_lock: Mutex::new(()),
                storage,
                runner,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    /// Check out a running actor. The entry is marked busy while the map
    /// guard is held, so eviction cannot remove it underneath the caller.
    fn checkout_live(&self, key: &SessionKey) -> Option<(ActorRef<SessionMsg>, InFlight)> {
        let entry = self.inner.sessions.get(key)?;
        if entry.actor.get_status() != ActorStatus::Running {
            return None;
        }
        let in_flight = InFlight::enter(entry.value());
        Some((entry.actor.clone(), in_flight))
    }

    async fn checkout(
        &self,
        key: &SessionKey,
    ) -> Result<(ActorRef<SessionMsg>, InFlight), SessionError> {
        // Fast path: check if exists
        if let Some(found) = self.checkout_live(key) {
            return Ok(found);
        }

        // Slow path: create under the lock, re-checking first
        let _guard = self.inner.create_lock.lock().await;
        if let Some(found) = self.checkout_live(key) {
            return Ok(found);
        }

        let (actor, _handle) = Actor::spawn(
            None,
            SessionActor,
            SessionArguments {
                key: key.clone(),
                location: self.inner.storage.location_for(key),
                runner: self.inner.runner.clone(),
                settings: self.inner.settings.clone(),
            },
        )
        .await
        .map_err(|e| {
            tracing::error!(session = %key, error = %e, "Failed to spawn SessionActor");
            SessionError::ActorUnavailable(e.to_string())
        })?;

        let entry = Arc::new(SessionEntry::new(actor.clone()));
        let in_flight = InFlight::enter(&entry);
        self.inner.sessions.insert(key.clone(), entry);
        tracing::debug!(session = %key, "SessionActor registered");
        Ok((actor, in_flight))
    }

    /// Get the session's actor, spawning it on first use.
    pub async fn get_or_spawn(&self, key: &SessionKey) -> Result<ActorRef<SessionMsg>, SessionError> {
        let (actor, _in_flight) = self.checkout(key).await?;
        Ok(actor)
    }

    /// Send a request to the session's actor and wait for the reply.
    pub async fn ask<T, F>(&self, key: &SessionKey, build: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<T>) -> SessionMsg,
    {
        let (actor, _in_flight) = self.checkout(key).await?;
        ractor::call!(actor, build).map_err(|e| {
            tracing::error!(session = %key, error = %e, "SessionActor call failed");
            if actor.get_status() != ActorStatus::Running {
                self.inner
                    .sessions
                    .remove_if(key, |_, entry| entry.actor.get_id() == actor.get_id());
            }
            SessionError::ActorUnavailable(e.to_string())
        })
    }

    /// Stop a session's actor and wait for its store to close.
    pub async fn stop(&self, key: &SessionKey) {
        if let Some((_, entry)) = self.inner.sessions.remove(key) {
            stop_actor(key, &entry.actor).await;
        }
    }

    pub async fn shutdown(&self) {
        let keys: Vec<SessionKey> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.stop(&key).await;
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Stop every actor that has been idle for the configured timeout and has
    /// no work left. In-memory sessions are never evicted since their state
    /// lives only in the actor. Returns how many actors were stopped.
    pub async fn evict_idle(&self) -> usize {
        let Some(idle_timeout) = self.inner.settings.idle_timeout else {
            return 0;
        };
        if matches!(self.inner.storage, StoragePolicy::InMemory) {
            return 0;
        }

        let candidates: Vec<(SessionKey, Arc<SessionEntry>)> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.is_idle(idle_timeout))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut evicted = 0;
        for (key, entry) in candidates {
            let _guard = self.inner.create_lock.lock().await;
            if !entry.is_idle(idle_timeout) || !is_quiescent(&entry.actor).await {
                continue;
            }

            let removed = self.inner.sessions.remove_if(&key, |_, current| {
                Arc::ptr_eq(current, &entry) && current.is_idle(idle_timeout)
            });
            if removed.is_none() {
                continue;
            }

            tracing::info!(
                session = %key,
                idle_secs = entry.idle_for().as_secs(),
                "Session idle timeout, stopping actor"
            );
            stop_actor(&key, &entry.actor).await;
            evicted += 1;
        }
        evicted
    }

    /// Background task: stop idle session actors.
    pub async fn run_idle_watchdog(self) {
        let Some(idle_timeout) = self.inner.settings.idle_timeout else {
            return;
        };
        let period = idle_timeout
            .min(Duration::from_secs(60))
            .max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = self.evict_idle().await;
            if evicted > 0 {
                tracing::debug!(
                    evicted,
                    active = self.active_sessions(),
                    "Idle session sweep"
                );
            }
        }
    }
}

/// A session may be stopped only when nothing is running or queued. An actor
/// that no longer answers counts as quiescent so its entry gets cleaned up.
async fn is_quiescent(actor: &ActorRef<SessionMsg>) -> bool {
    match ractor::call!(actor, |reply| SessionMsg::QueueSnapshot { reply }) {
        Ok(Ok(snapshot)) => snapshot.active.is_none() && snapshot.count == 0,
        Ok(Err(_)) => false,
        Err(_) => true,
    }
}

async fn stop_actor(key: &SessionKey, actor: &ActorRef<SessionMsg>) {
    if let Err(e) = actor
        .stop_and_wait(Some("session stopped".to_string()), Some(Duration::from_secs(5)))
        .await
    {
        tracing::warn!(session = %key, error = %e, "SessionActor did not stop cleanly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::NoopRunner;
    use shared_types::{ExecutionOutcome, ExecutionPayload, ExecutionStatus};

    fn registry() -> SessionRegistry {
        SessionRegistry::new(
            StoragePolicy::InMemory,
            Arc::new(NoopRunner),
            SessionSettings {
                sweep_interval: None,
                ..Default::default()
            },
        )
    }

    fn evicting_registry(root: &std::path::Path) -> SessionRegistry {
        SessionRegistry::new(
            StoragePolicy::Directory(root.to_path_buf()),
            Arc::new(NoopRunner),
            SessionSettings {
                sweep_interval: None,
                idle_timeout: Some(Duration::ZERO),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_directory_layout() {
        let policy = StoragePolicy::Directory(PathBuf::from("/data/sessions"));
        let key = SessionKey::new("owner-1", "session-1").unwrap();
        match policy.location_for(&key) {
            StoreLocation::File(path) => {
                assert_eq!(path, PathBuf::from("/data/sessions/owner-1/session-1.db"))
            }
            StoreLocation::InMemory => panic!("expected file location"),
        }
    }

    #[tokio::test]
    async fn test_same_key_same_actor() {
        let registry = registry();
        let key = SessionKey::new("owner-1", "session-1").unwrap();

        let (a, b) = tokio::join!(registry.get_or_spawn(&key), registry.get_or_spawn(&key));
        assert_eq!(a.unwrap().get_id(), b.unwrap().get_id());
        assert_eq!(registry.active_sessions(), 1);

        let other = SessionKey::new("owner-1", "session-2").unwrap();
        registry.get_or_spawn(&other).await.unwrap();
        assert_eq!(registry.active_sessions(), 2);

        registry.shutdown().await;
        assert_eq!(registry.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_stopped_actor_is_replaced() {
        let registry = registry();
        let key = SessionKey::new("owner-1", "session-1").unwrap();

        let first = registry.get_or_spawn(&key).await.unwrap();
        first
            .stop_and_wait(None, Some(Duration::from_secs(5)))
            .await
            .unwrap();

        let second = registry.get_or_spawn(&key).await.unwrap();
        assert_ne!(first.get_id(), second.get_id());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_session_is_evicted_once_quiescent() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let registry = evicting_registry(temp_dir.path());
        let key = SessionKey::new("owner-1", "session-1").unwrap();

        registry
            .ask(&key, |reply| SessionMsg::EnqueueExecution {
                execution_id: "exec-1".to_string(),
                payload: ExecutionPayload::new("build"),
                start_immediately: true,
                reply,
            })
            .await
            .unwrap()
            .unwrap();

        // A running execution keeps the actor alive.
        assert_eq!(registry.evict_idle().await, 0);
        assert_eq!(registry.active_sessions(), 1);

        registry
            .ask(&key, |reply| SessionMsg::ExecutionComplete {
                execution_id: "exec-1".to_string(),
                outcome: ExecutionOutcome::Completed,
                reply,
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(registry.evict_idle().await, 1);
        assert_eq!(registry.active_sessions(), 0);

        // The next request reopens the same store.
        let execution = registry
            .ask(&key, |reply| SessionMsg::GetExecution {
                execution_id: "exec-1".to_string(),
                reply,
            })
            .await
            .unwrap()
            .unwrap()
            .expect("execution persisted");
        assert_eq!(execution.status, ExecutionStatus::Completed);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_queued_work_blocks_eviction() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let registry = evicting_registry(temp_dir.path());
        let key = SessionKey::new("owner-1", "session-1").unwrap();

        registry
            .ask(&key, |reply| SessionMsg::EnqueueExecution {
                execution_id: "exec-deferred".to_string(),
                payload: ExecutionPayload::new("later"),
                start_immediately: false,
                reply,
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(registry.evict_idle().await, 0);
        assert_eq!(registry.active_sessions(), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_in_memory_sessions_are_not_evicted() {
        let registry = SessionRegistry::new(
            StoragePolicy::InMemory,
            Arc::new(NoopRunner),
            SessionSettings {
                sweep_interval: None,
                idle_timeout: Some(Duration::ZERO),
                ..Default::default()
            },
        );
        let key = SessionKey::new("owner-1", "session-1").unwrap();
        registry.get_or_spawn(&key).await.unwrap();

        assert_eq!(registry.evict_idle().await, 0);
        assert_eq!(registry.active_sessions(), 1);
        registry.shutdown().await;
    }
}
