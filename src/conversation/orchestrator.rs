//! Process-wide registry of running conversation sessions.
//!
//! Every session token is a child of the orchestrator token, so cancelling
//! the orchestrator stops all sessions. A completion handler per session
//! removes it from the registry and disposes it exactly once, however its
//! run ended.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapters::SessionFactory;
use crate::config::ConversationConfig;
use crate::conversation::context::ConversationContext;
use crate::conversation::session::ConversationSession;
use crate::conversation::types::SessionId;
use crate::error::{Result, SessionError};
use crate::metrics::{MetricsCollector, NoopMetrics};

struct SessionEntry {
    session: Arc<ConversationSession>,
    run_task: Option<JoinHandle<()>>,
}

type SessionMap = Arc<Mutex<HashMap<SessionId, SessionEntry>>>;

fn lock(sessions: &SessionMap) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
    match sessions.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Creates, tracks and stops conversation sessions.
pub struct ConversationOrchestrator {
    factory: Arc<dyn SessionFactory>,
    config: ConversationConfig,
    metrics: Arc<dyn MetricsCollector>,
    cancel: CancellationToken,
    sessions: SessionMap,
}

impl ConversationOrchestrator {
    pub fn new(factory: Arc<dyn SessionFactory>, config: ConversationConfig) -> Self {
        Self {
            factory,
            config,
            metrics: Arc::new(NoopMetrics),
            cancel: CancellationToken::new(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Use a metrics collector shared by every session.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    /// Parent of every session token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Create a session, register it and start running it in the background.
    ///
    /// # Errors
    ///
    /// Fails if the orchestrator is shutting down, the factory cannot build
    /// the session's components, or the session cannot be registered. A
    /// session that fails registration is stopped and disposed first.
    pub async fn start_new_session(&self) -> Result<SessionId> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Registry(
                "orchestrator is shutting down".to_owned(),
            ));
        }

        let id = SessionId::new();
        let components = self.factory.components(id)?;
        let context =
            ConversationContext::new(self.config.context.clone(), &self.config.conversation);
        let session = Arc::new(ConversationSession::new(
            id,
            context,
            components,
            &self.config,
            Arc::clone(&self.metrics),
            self.cancel.child_token(),
        ));

        let registered = {
            let mut sessions = lock(&self.sessions);
            if sessions.contains_key(&id) {
                false
            } else {
                sessions.insert(
                    id,
                    SessionEntry {
                        session: Arc::clone(&session),
                        run_task: None,
                    },
                );
                true
            }
        };
        if !registered {
            session.stop();
            session.dispose().await;
            return Err(SessionError::Registry(format!(
                "session {id} is already registered"
            )));
        }

        let handle = tokio::spawn(run_and_release(session, Arc::clone(&self.sessions)));
        if let Some(entry) = lock(&self.sessions).get_mut(&id) {
            entry.run_task = Some(handle);
        }
        info!("session {id} started ({} active)", self.len());
        Ok(id)
    }

    /// Ask a session to stop. Returns without waiting; `false` if it is unknown.
    pub fn stop_session(&self, id: SessionId) -> bool {
        let session = lock(&self.sessions)
            .get(&id)
            .map(|entry| Arc::clone(&entry.session));
        match session {
            Some(session) => {
                session.stop();
                true
            }
            None => {
                warn!("stop requested for unknown session {id}");
                false
            }
        }
    }

    /// Stop every session and wait for their run tasks.
    ///
    /// No new sessions can be started afterwards. Per-session failures are
    /// logged, not returned.
    pub async fn stop_all_sessions(&self) {
        self.cancel.cancel();

        let entries: Vec<_> = lock(&self.sessions)
            .iter_mut()
            .map(|(id, entry)| (*id, Arc::clone(&entry.session), entry.run_task.take()))
            .collect();
        info!("stopping {} session(s)", entries.len());

        for (_, session, _) in &entries {
            session.stop();
        }
        for (id, _, run_task) in entries {
            let Some(run_task) = run_task else {
                continue;
            };
            if let Err(e) = run_task.await {
                error!("session {id} completion handler failed: {e}");
            }
        }
    }

    /// Stop all sessions, then dispose any that are still registered.
    pub async fn shutdown(&self) {
        self.stop_all_sessions().await;

        let leftovers: Vec<_> = lock(&self.sessions)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in leftovers {
            warn!("force-disposing session {}", entry.session.id());
            if let Some(run_task) = entry.run_task {
                run_task.abort();
            }
            entry.session.dispose().await;
        }
        info!("orchestrator shut down");
    }

    pub fn active_session_ids(&self) -> Vec<SessionId> {
        lock(&self.sessions).keys().copied().collect()
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<ConversationSession>> {
        lock(&self.sessions)
            .get(&id)
            .map(|entry| Arc::clone(&entry.session))
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }
}

impl Drop for ConversationOrchestrator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Completion handler: run the session, log how it ended, then deregister
/// and dispose it.
async fn run_and_release(session: Arc<ConversationSession>, sessions: SessionMap) {
    let id = session.id();
    let runner = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.run().await }
    });
    match runner.await {
        Ok(Ok(())) => info!("session {id} completed"),
        Ok(Err(e)) => warn!("session {id} did not run: {e}"),
        Err(e) if e.is_cancelled() => info!("session {id} run was cancelled"),
        Err(e) => error!("session {id} run faulted: {e}"),
    }

    lock(&sessions).remove(&id);
    session.dispose().await;
}
