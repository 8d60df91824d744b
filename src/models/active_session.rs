//! In-memory state of a live session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::conversation::ConversationTurn;
use super::session::AgentKind;

/// Mutable per-session state shared between the manager and the worker task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Backend conversation handle (see [`crate::models::identity`]).
    pub memory_session_id: Option<String>,
    /// Project name.
    pub project: String,
    /// Latest known user prompt.
    pub user_prompt: String,
    /// Latest prompt number seen.
    pub last_prompt_number: u32,
    /// Input tokens spent across all backends.
    pub cumulative_input_tokens: u64,
    /// Output tokens spent across all backends.
    pub cumulative_output_tokens: u64,
    /// Enqueue time of the oldest claimed-but-unconfirmed message.
    pub earliest_pending_timestamp: Option<DateTime<Utc>>,
    /// Conversation accumulated by every backend that served the session.
    pub conversation: Vec<ConversationTurn>,
    /// Messages claimed by this session but not yet confirmed.
    pub in_flight: Vec<i64>,
    /// Backend currently serving the session.
    pub current_provider: Option<AgentKind>,
}

impl SessionState {
    /// Record a claimed message.
    pub fn track_claim(&mut self, message_id: i64, created_at: DateTime<Utc>) {
        self.in_flight.push(message_id);
        if self
            .earliest_pending_timestamp
            .is_none_or(|earliest| created_at < earliest)
        {
            self.earliest_pending_timestamp = Some(created_at);
        }
    }

    /// Forget a message that was confirmed, released, or failed.
    pub fn settle(&mut self, message_id: i64) {
        self.in_flight.retain(|id| *id != message_id);
        if self.in_flight.is_empty() {
            self.earliest_pending_timestamp = None;
        }
    }

    /// Split a provider's total token count 70/30 into input/output counters.
    pub fn add_tokens(&mut self, total: u64) {
        let input = total * 7 / 10;
        self.cumulative_input_tokens += input;
        self.cumulative_output_tokens += total - input;
    }
}

/// Worker task bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct WorkerSlot {
    pub(crate) handle: Option<JoinHandle<()>>,
    pub(crate) running: bool,
}

/// A live session. Shared as `Arc<ActiveSession>`; at most one exists per
/// session id while it is registered with the session manager.
#[derive(Debug)]
pub struct ActiveSession {
    session_db_id: i64,
    content_session_id: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    notify: Arc<Notify>,
    state: Mutex<SessionState>,
    pub(crate) worker: Mutex<WorkerSlot>,
    /// Held for the whole teardown; `true` once the session was evicted.
    pub(crate) teardown: Mutex<bool>,
}

impl ActiveSession {
    /// Construct a session with fresh cancellation and notification handles.
    #[must_use]
    pub fn new(
        session_db_id: i64,
        content_session_id: String,
        notify: Arc<Notify>,
        state: SessionState,
    ) -> Self {
        Self {
            session_db_id,
            content_session_id,
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            notify,
            state: Mutex::new(state),
            worker: Mutex::new(WorkerSlot::default()),
            teardown: Mutex::new(false),
        }
    }

    /// Database identifier.
    #[must_use]
    pub fn session_db_id(&self) -> i64 {
        self.session_db_id
    }

    /// Stable external key.
    #[must_use]
    pub fn content_session_id(&self) -> &str {
        &self.content_session_id
    }

    /// When the in-memory session was created.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Cancellation token propagated into provider calls and subprocesses.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether teardown has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wake-up signal raised after each enqueue.
    #[must_use]
    pub fn notifier(&self) -> &Arc<Notify> {
        &self.notify
    }

    /// Lock the mutable state.
    pub async fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// Copy of the mutable state.
    pub async fn snapshot(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    /// Whether a worker task is currently attached.
    pub async fn has_worker(&self) -> bool {
        self.worker.lock().await.running
    }
}
