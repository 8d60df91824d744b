//! Shared construction of stores, managers and fake backends so individual
//! test modules can focus on behaviour rather than boilerplate.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use memory_worker::agents::history::ContextLimits;
use memory_worker::agents::provider::{ChatProvider, Completion, CompletionFuture};
use memory_worker::agents::response::ResponseProcessor;
use memory_worker::agents::{AgentContext, AgentFuture, BackendAgent};
use memory_worker::config::GlobalConfig;
use memory_worker::models::active_session::ActiveSession;
use memory_worker::models::conversation::ConversationTurn;
use memory_worker::models::message::ObservationInput;
use memory_worker::models::session::AgentKind;
use memory_worker::orchestrator::process_registry::ProcessRegistry;
use memory_worker::orchestrator::session_manager::SessionManager;
use memory_worker::persistence::db::{self, Database};
use memory_worker::persistence::observation_repo::ObservationRepo;
use memory_worker::persistence::pending_repo::PendingMessageStore;
use memory_worker::persistence::session_repo::SessionRepo;
use memory_worker::Result;

/// Reply containing one observation block.
pub const OBSERVATION_REPLY: &str = "<observation>\
    <type>discovery</type>\
    <title>Queue claims are atomic</title>\
    <facts><fact>claim uses UPDATE RETURNING</fact></facts>\
    <narrative>Read the store.</narrative>\
    </observation>";

/// In-memory stores shared by one test.
pub struct Harness {
    pub db: Arc<Database>,
    pub store: PendingMessageStore,
    pub sessions: SessionRepo,
    pub observations: ObservationRepo,
    pub processes: ProcessRegistry,
    pub config: Arc<GlobalConfig>,
}

impl Harness {
    pub async fn new() -> Self {
        let db = Arc::new(db::connect_memory().await.expect("db connect"));
        let mut config = GlobalConfig::default();
        config.process.exit_timeout_ms = 500;
        Self {
            store: PendingMessageStore::new(Arc::clone(&db)),
            sessions: SessionRepo::new(Arc::clone(&db)),
            observations: ObservationRepo::new(Arc::clone(&db)),
            processes: ProcessRegistry::new(),
            config: Arc::new(config),
            db,
        }
    }

    /// Agent collaborators with a short idle timeout.
    pub fn ctx(&self) -> AgentContext {
        AgentContext {
            store: self.store.clone(),
            sessions: self.sessions.clone(),
            responses: self.responses(),
            processes: self.processes.clone(),
            idle_timeout: Some(Duration::from_millis(200)),
        }
    }

    pub fn responses(&self) -> ResponseProcessor {
        ResponseProcessor::new(
            self.store.clone(),
            self.observations.clone(),
            self.config.queue.max_retries,
        )
    }

    /// Manager without a backend: messages persist but nothing consumes them.
    pub fn manager(&self) -> SessionManager {
        SessionManager::new(
            self.sessions.clone(),
            self.store.clone(),
            Arc::clone(&self.config),
            self.processes.clone(),
        )
    }

    /// Create a session row with a fresh content id and return its db id.
    pub async fn session_row(&self) -> (i64, String) {
        let content = uuid::Uuid::new_v4().to_string();
        let record = self
            .sessions
            .create_or_get(&content, "proj", "fix the queue")
            .await
            .expect("create session");
        (record.id, content)
    }

    /// Wait until a session has no pending or processing messages.
    pub async fn wait_for_drain(&self, session_db_id: i64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.store.pending_count(session_db_id).await.expect("count") > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue drained in time");
    }
}

pub fn read_observation(path: &str, prompt_number: Option<u32>) -> ObservationInput {
    ObservationInput {
        tool_name: "Read".into(),
        tool_input: serde_json::json!({ "file_path": path }),
        tool_response: serde_json::json!("fn main() {}"),
        prompt_number,
        cwd: Some("/repo".into()),
    }
}

/// Stateless provider that replays scripted replies, then answers with a
/// plain acknowledgement.
pub struct ScriptedProvider {
    kind: AgentKind,
    replies: StdMutex<VecDeque<Result<String>>>,
    requests: Arc<StdMutex<Vec<Vec<ConversationTurn>>>>,
}

impl ScriptedProvider {
    pub fn new(kind: AgentKind, replies: Vec<Result<String>>) -> Self {
        Self {
            kind,
            replies: StdMutex::new(replies.into()),
            requests: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    /// Histories received so far, shared with the test.
    pub fn requests(&self) -> Arc<StdMutex<Vec<Vec<ConversationTurn>>>> {
        Arc::clone(&self.requests)
    }
}

impl ChatProvider for ScriptedProvider {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn limits(&self) -> ContextLimits {
        ContextLimits {
            max_messages: 20,
            max_tokens: 100_000,
        }
    }

    fn complete<'a>(&'a self, turns: &'a [ConversationTurn]) -> CompletionFuture<'a> {
        Box::pin(async move {
            self.requests.lock().expect("lock").push(turns.to_vec());
            let reply = self
                .replies
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Ok("acknowledged".into()));
            reply.map(|text| Completion { text, tokens: 100 })
        })
    }
}

/// Stateful stand-in for the Claude backend that records which session
/// objects it was handed and drains their queue.
pub struct RecordingAgent {
    ctx: AgentContext,
    received: Arc<StdMutex<Vec<Arc<ActiveSession>>>>,
    claimable_at_start: Arc<StdMutex<Vec<u64>>>,
}

impl RecordingAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self {
            ctx,
            received: Arc::new(StdMutex::new(Vec::new())),
            claimable_at_start: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    pub fn received(&self) -> Arc<StdMutex<Vec<Arc<ActiveSession>>>> {
        Arc::clone(&self.received)
    }

    pub fn claimable_at_start(&self) -> Arc<StdMutex<Vec<u64>>> {
        Arc::clone(&self.claimable_at_start)
    }
}

impl BackendAgent for RecordingAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Claude
    }

    fn start_session(&self, session: Arc<ActiveSession>) -> AgentFuture<'_> {
        Box::pin(async move {
            let claimable = self
                .ctx
                .store
                .claimable_count(session.session_db_id())
                .await?;
            self.claimable_at_start.lock().expect("lock").push(claimable);
            self.received.lock().expect("lock").push(Arc::clone(&session));

            let mut messages = self.ctx.messages(Arc::clone(&session));
            while let Some(message) = messages.next().await? {
                self.ctx
                    .responses
                    .process(&session, Some(&message), OBSERVATION_REPLY, 10)
                    .await?;
            }
            Ok(())
        })
    }
}
