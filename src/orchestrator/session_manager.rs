//! Session lifecycle management: initialize, enqueue, teardown.
//!
//! The manager owns the registry of live [`ActiveSession`]s and their
//! notifiers, starts one worker task per session, and tears sessions down
//! in a fixed order: cancel, await the worker, verify subprocess exit,
//! return unconfirmed messages, evict. A session id is not re-registered
//! until the previous teardown for it has finished. All registry mutation goes through `tokio::sync::Mutex`-guarded
//! maps; no lock is held across a backend call.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::process_registry::{ExitOutcome, ProcessRegistry};
use crate::agents::BackendAgent;
use crate::config::GlobalConfig;
use crate::models::active_session::{ActiveSession, SessionState};
use crate::models::identity::restore_memory_session_id;
use crate::models::message::{MessagePayload, ObservationInput};
use crate::persistence::pending_repo::PendingMessageStore;
use crate::persistence::session_repo::SessionRepo;
use crate::{AppError, Result};

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Queue activity snapshot broadcast after enqueue and teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Live in-memory sessions.
    pub active_sessions: usize,
    /// Pending plus processing messages across live sessions.
    pub queue_depth: u64,
    /// Whether any live session has queued work.
    pub processing: bool,
}

/// Process-wide registry and lifecycle manager for live sessions.
#[derive(Clone)]
pub struct SessionManager {
    sessions_repo: SessionRepo,
    store: PendingMessageStore,
    config: Arc<GlobalConfig>,
    processes: ProcessRegistry,
    sessions: Arc<Mutex<HashMap<i64, Arc<ActiveSession>>>>,
    notifiers: Arc<Mutex<HashMap<i64, Arc<Notify>>>>,
    agent: Option<Arc<dyn BackendAgent>>,
    status_tx: broadcast::Sender<QueueStatus>,
}

impl SessionManager {
    /// Create a manager with no backend attached.
    ///
    /// Without a backend, messages are persisted but no worker is started.
    #[must_use]
    pub fn new(
        sessions_repo: SessionRepo,
        store: PendingMessageStore,
        config: Arc<GlobalConfig>,
        processes: ProcessRegistry,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            sessions_repo,
            store,
            config,
            processes,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            notifiers: Arc::new(Mutex::new(HashMap::new())),
            agent: None,
            status_tx,
        }
    }

    /// Attach the backend that serves every session.
    #[must_use]
    pub fn with_agent(mut self, agent: Arc<dyn BackendAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// The subprocess registry used during teardown.
    #[must_use]
    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    /// Return the live session for `session_db_id`, creating it if needed.
    ///
    /// A cached session gets its project refreshed from the database, and
    /// its prompt and prompt number when supplied. A new session applies the
    /// memory-session restart rule and starts with zeroed counters and an
    /// empty conversation. A cached session that is already being torn down
    /// is replaced once its teardown has finished.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no session row exists.
    pub async fn initialize(
        &self,
        session_db_id: i64,
        current_prompt: Option<&str>,
        prompt_number: Option<u32>,
    ) -> Result<Arc<ActiveSession>> {
        let record = self
            .sessions_repo
            .get_by_id(session_db_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {session_db_id} not found")))?;

        loop {
            let cached = self.sessions.lock().await.get(&session_db_id).cloned();
            if let Some(existing) = cached {
                if existing.is_cancelled() {
                    // The old worker may still hold claimed messages; replacing
                    // the session before its teardown finishes would reorder them.
                    debug!(session_db_id, "waiting for teardown before replacing session");
                    self.teardown_session(&existing).await;
                    continue;
                }

                let mut state = existing.state().await;
                state.project.clone_from(&record.project);
                if let Some(prompt) = current_prompt {
                    prompt.clone_into(&mut state.user_prompt);
                }
                if let Some(number) = prompt_number {
                    state.last_prompt_number = number;
                }
                drop(state);
                return Ok(existing);
            }

            let latest = self
                .sessions_repo
                .latest_prompt(&record.content_session_id)
                .await?;
            let memory_session_id = restore_memory_session_id(
                record.memory_session_id.as_deref(),
                &record.content_session_id,
            );
            if record.memory_session_id.is_some() && memory_session_id.is_none() {
                info!(
                    session_db_id,
                    "discarding provider-issued memory session id from a previous run"
                );
            }

            let state = SessionState {
                memory_session_id,
                project: record.project.clone(),
                user_prompt: current_prompt.map_or_else(
                    || {
                        latest
                            .as_ref()
                            .map_or_else(|| record.user_prompt.clone(), |(_, text)| text.clone())
                    },
                    str::to_owned,
                ),
                last_prompt_number: prompt_number
                    .or_else(|| latest.as_ref().map(|(number, _)| *number))
                    .unwrap_or_default(),
                ..SessionState::default()
            };

            let mut sessions = self.sessions.lock().await;
            // Another caller may have registered the session while we were
            // loading; go round again so a cancelled one is waited for.
            if sessions.contains_key(&session_db_id) {
                continue;
            }

            let notify = Arc::new(Notify::new());
            self.notifiers
                .lock()
                .await
                .insert(session_db_id, Arc::clone(&notify));
            let session = Arc::new(ActiveSession::new(
                session_db_id,
                record.content_session_id.clone(),
                notify,
                state,
            ));
            sessions.insert(session_db_id, Arc::clone(&session));
            info!(session_db_id, "session initialized");
            return Ok(session);
        }
    }

    /// Queue an observation for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session, or `AppError::Db`
    /// if the message cannot be persisted; nothing is signalled then.
    pub async fn enqueue_observation(
        &self,
        session_db_id: i64,
        input: ObservationInput,
    ) -> Result<i64> {
        let prompt_number = input.prompt_number;
        self.enqueue(
            session_db_id,
            prompt_number,
            MessagePayload::Observation(input),
        )
        .await
    }

    /// Queue a summary request for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session, or `AppError::Db`
    /// if the message cannot be persisted; nothing is signalled then.
    pub async fn enqueue_summarize(
        &self,
        session_db_id: i64,
        last_assistant_message: Option<String>,
    ) -> Result<i64> {
        self.enqueue(
            session_db_id,
            None,
            MessagePayload::Summarize {
                last_assistant_message,
            },
        )
        .await
    }

    async fn enqueue(
        &self,
        session_db_id: i64,
        prompt_number: Option<u32>,
        payload: MessagePayload,
    ) -> Result<i64> {
        let mut session = self.initialize(session_db_id, None, prompt_number).await?;
        let message_id = self
            .store
            .enqueue(session_db_id, session.content_session_id(), &payload)
            .await?;

        loop {
            session.notifier().notify_one();
            self.ensure_worker(&session).await;
            if !session.is_cancelled() {
                break;
            }
            // Torn down after the message was persisted; hand it to the
            // replacement session.
            session = self.initialize(session_db_id, None, prompt_number).await?;
        }
        self.broadcast_status().await;
        Ok(message_id)
    }

    /// Start the worker task of `session` unless one is already running.
    pub async fn ensure_worker(&self, session: &Arc<ActiveSession>) {
        let Some(agent) = self.agent.clone() else {
            debug!(
                session_db_id = session.session_db_id(),
                "no backend attached, message stays queued"
            );
            return;
        };

        let mut slot = session.worker.lock().await;
        if slot.running || session.is_cancelled() {
            return;
        }
        slot.running = true;

        let manager = self.clone();
        let task_session = Arc::clone(session);
        let span = info_span!(
            "session_worker",
            session_db_id = session.session_db_id(),
            provider = %agent.kind()
        );
        slot.handle = Some(tokio::spawn(
            async move { manager.run_worker(agent, task_session).await }.instrument(span),
        ));
    }

    async fn run_worker(&self, agent: Arc<dyn BackendAgent>, session: Arc<ActiveSession>) {
        let session_db_id = session.session_db_id();
        loop {
            session.state().await.current_provider = Some(agent.kind());
            match agent.start_session(Arc::clone(&session)).await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => {
                    debug!("worker cancelled");
                    session.worker.lock().await.running = false;
                    return;
                }
                Err(err) => {
                    error!(%err, "backend failed, marking session failed");
                    self.fail_session(&session).await;
                    // Cancel before freeing the slot so no enqueue can start a
                    // worker on a session that is about to be evicted.
                    session.cancel_token().cancel();
                    session.worker.lock().await.running = false;
                    let manager = self.clone();
                    tokio::spawn(async move { manager.teardown_session(&session).await });
                    return;
                }
            }

            // The claimable check runs under the slot lock so an enqueue that
            // raced with this exit either sees `running == false` and starts a
            // new worker, or is counted here and keeps this one going.
            let mut slot = session.worker.lock().await;
            if session.is_cancelled() {
                slot.running = false;
                return;
            }
            match self.store.claimable_count(session_db_id).await {
                Ok(0) => {
                    debug!("worker idle, exiting");
                    slot.running = false;
                    return;
                }
                Ok(remaining) => {
                    debug!(remaining, "work arrived while exiting, restarting backend");
                }
                Err(err) => {
                    warn!(%err, "failed to check remaining work, worker exiting");
                    slot.running = false;
                    return;
                }
            }
        }
    }

    async fn fail_session(&self, session: &ActiveSession) {
        let session_db_id = session.session_db_id();
        if let Err(err) = self.sessions_repo.mark_failed(session_db_id).await {
            warn!(session_db_id, %err, "failed to mark session failed");
        }

        let in_flight = std::mem::take(&mut session.state().await.in_flight);
        for message_id in in_flight {
            if let Err(err) = self
                .store
                .mark_failed(message_id, self.config.queue.max_retries)
                .await
            {
                warn!(session_db_id, message_id, %err, "failed to record message failure");
            }
        }
        session.state().await.earliest_pending_timestamp = None;
    }

    /// Tear a session down. Idempotent; unknown sessions are a no-op.
    ///
    /// Cancels the session, waits for its worker (a panicked or failed
    /// worker is logged, not propagated), verifies that its subprocess
    /// exited, hands unconfirmed messages back to the queue with one retry
    /// consumed, then evicts the session and its notifier. Until eviction,
    /// `initialize` and enqueues for the same id wait for the teardown.
    pub async fn teardown(&self, session_db_id: i64) {
        let session = self.sessions.lock().await.get(&session_db_id).cloned();
        match session {
            Some(session) => self.teardown_session(&session).await,
            None => debug!(session_db_id, "no live session"),
        }
    }

    async fn teardown_session(&self, session: &Arc<ActiveSession>) {
        let session_db_id = session.session_db_id();
        let span = info_span!("teardown", session_db_id);
        async {
            let mut evicted = session.teardown.lock().await;
            if *evicted {
                debug!("already torn down");
                return;
            }

            session.cancel_token().cancel();

            let handle = session.worker.lock().await.handle.take();
            if let Some(handle) = handle {
                if let Err(err) = handle.await {
                    warn!(%err, "session worker ended abnormally");
                }
            }

            let timeout = self.config.process.exit_timeout();
            if self.processes.ensure_exit(session_db_id, timeout).await == ExitOutcome::TimedOut {
                warn!("subprocess exit not confirmed, continuing teardown");
            }

            let in_flight = std::mem::take(&mut session.state().await.in_flight);
            for message_id in in_flight {
                match self
                    .store
                    .mark_failed(message_id, self.config.queue.max_retries)
                    .await
                {
                    Ok(status) => debug!(message_id, ?status, "in-flight message returned"),
                    Err(err) => warn!(message_id, %err, "failed to return in-flight message"),
                }
            }
            session.state().await.earliest_pending_timestamp = None;

            {
                let mut sessions = self.sessions.lock().await;
                if sessions
                    .get(&session_db_id)
                    .is_some_and(|current| Arc::ptr_eq(current, session))
                {
                    sessions.remove(&session_db_id);
                    self.notifiers.lock().await.remove(&session_db_id);
                }
            }
            *evicted = true;
            drop(evicted);

            info!("session torn down");
            self.broadcast_status().await;
        }
        .instrument(span)
        .await;
    }

    /// Tear a session down and mark it completed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the status update fails.
    pub async fn complete(&self, session_db_id: i64) -> Result<()> {
        self.teardown(session_db_id).await;
        self.sessions_repo.mark_completed(session_db_id).await?;
        info!(session_db_id, "session completed");
        Ok(())
    }

    /// Tear down every live session concurrently.
    pub async fn shutdown_all(&self) {
        let ids: Vec<i64> = self.sessions.lock().await.keys().copied().collect();
        info!(count = ids.len(), "shutting down live sessions");
        join_all(ids.into_iter().map(|id| self.teardown(id))).await;
    }

    /// Live session lookup.
    pub async fn get_session(&self, session_db_id: i64) -> Option<Arc<ActiveSession>> {
        self.sessions.lock().await.get(&session_db_id).cloned()
    }

    /// Notifier of a live session.
    pub async fn notifier(&self, session_db_id: i64) -> Option<Arc<Notify>> {
        self.notifiers.lock().await.get(&session_db_id).cloned()
    }

    /// Number of live sessions.
    pub async fn active_session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Pending plus processing messages across live sessions.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a count query fails.
    pub async fn total_queue_depth(&self) -> Result<u64> {
        let ids: Vec<i64> = self.sessions.lock().await.keys().copied().collect();
        let mut total = 0;
        for id in ids {
            total += self.store.pending_count(id).await?;
        }
        Ok(total)
    }

    /// Whether any live session has queued work.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a count query fails.
    pub async fn is_any_session_processing(&self) -> Result<bool> {
        Ok(self.total_queue_depth().await? > 0)
    }

    /// Subscribe to queue activity snapshots.
    #[must_use]
    pub fn subscribe_status(&self) -> broadcast::Receiver<QueueStatus> {
        self.status_tx.subscribe()
    }

    /// Current queue activity snapshot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a count query fails.
    pub async fn status(&self) -> Result<QueueStatus> {
        let queue_depth = self.total_queue_depth().await?;
        Ok(QueueStatus {
            active_sessions: self.active_session_count().await,
            queue_depth,
            processing: queue_depth > 0,
        })
    }

    async fn broadcast_status(&self) {
        match self.status().await {
            // No subscribers is fine.
            Ok(status) => {
                let _ = self.status_tx.send(status);
            }
            Err(err) => warn!(%err, "failed to compute queue status"),
        }
    }

    /// Resume workers for every session that still has queued work.
    ///
    /// Returns the number of sessions resumed. Sessions whose row is gone
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the pending-session query fails.
    pub async fn recover_pending_sessions(&self) -> Result<usize> {
        let ids = self.store.sessions_with_pending_messages().await?;
        let mut resumed = 0;
        for session_db_id in ids {
            match self.initialize(session_db_id, None, None).await {
                Ok(session) => {
                    session.notifier().notify_one();
                    self.ensure_worker(&session).await;
                    resumed += 1;
                }
                Err(err) => {
                    warn!(session_db_id, %err, "cannot resume session with queued work");
                }
            }
        }
        if resumed > 0 {
            info!(resumed, "resumed sessions with queued work");
        }
        Ok(resumed)
    }
}
