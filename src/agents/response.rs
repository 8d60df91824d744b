//! Turning a backend reply into stored observations.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::models::active_session::ActiveSession;
use crate::models::conversation::ConversationTurn;
use crate::models::message::{MessagePayload, MessageStatus, PendingMessage};
use crate::persistence::observation_repo::{ObservationRepo, StoredTurn, TurnOutput};
use crate::persistence::pending_repo::PendingMessageStore;
use crate::Result;

use super::parser::{dedup_observations, parse_observations, parse_summary};

/// What happened to a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Parsed output was stored and the source message confirmed.
    Stored(StoredTurn),
    /// The reply was empty; the source message consumed one retry and is
    /// now in the reported status.
    Empty(Option<MessageStatus>),
}

/// Shared reply handling for every backend.
#[derive(Clone)]
pub struct ResponseProcessor {
    store: PendingMessageStore,
    observations: ObservationRepo,
    max_retries: u32,
}

impl ResponseProcessor {
    /// Create a processor.
    #[must_use]
    pub fn new(store: PendingMessageStore, observations: ObservationRepo, max_retries: u32) -> Self {
        Self {
            store,
            observations,
            max_retries,
        }
    }

    /// Handle `reply` to `message` (or to the session prompt when `None`).
    ///
    /// The reply is appended to the conversation, observations and summary
    /// are stored in one transaction, and only then is the message
    /// confirmed. An empty reply is not confirmed: the message is handed
    /// back to the queue with one retry consumed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if storing or confirming fails; the message
    /// then stays claimed and is recovered by the stuck-message sweep.
    pub async fn process(
        &self,
        session: &ActiveSession,
        message: Option<&PendingMessage>,
        reply: &str,
        tokens: u64,
    ) -> Result<ResponseOutcome> {
        let session_db_id = session.session_db_id();

        if reply.trim().is_empty() {
            session.state().await.add_tokens(tokens);
            let Some(message) = message else {
                return Ok(ResponseOutcome::Empty(None));
            };
            warn!(session_db_id, message_id = message.id, "backend returned an empty reply");
            let status = self.store.mark_failed(message.id, self.max_retries).await?;
            session.state().await.settle(message.id);
            return Ok(ResponseOutcome::Empty(status));
        }

        let (memory_session_id, project, last_prompt_number) = {
            let mut state = session.state().await;
            state.conversation.push(ConversationTurn::assistant(reply));
            state.add_tokens(tokens);
            (
                state
                    .memory_session_id
                    .clone()
                    .unwrap_or_else(|| session.content_session_id().to_owned()),
                state.project.clone(),
                state.last_prompt_number,
            )
        };

        let observations = dedup_observations(parse_observations(reply));
        let summary = match message.map(|m| &m.payload) {
            Some(MessagePayload::Summarize { .. }) => parse_summary(reply),
            _ => None,
        };
        let prompt_number = match message.map(|m| &m.payload) {
            Some(MessagePayload::Observation(input)) => input.prompt_number,
            _ => None,
        }
        .or((last_prompt_number > 0).then_some(last_prompt_number));

        let stored = self
            .observations
            .store_turn(&TurnOutput {
                memory_session_id: &memory_session_id,
                project: &project,
                observations: &observations,
                summary: summary.as_ref(),
                prompt_number,
                discovery_tokens: tokens,
                created_at: message.map_or_else(Utc::now, |m| m.created_at),
            })
            .await?;

        if let Some(message) = message {
            if !self.store.confirm(message.id).await? {
                debug!(session_db_id, message_id = message.id, "message already gone at confirm");
            }
            session.state().await.settle(message.id);
        }

        info!(
            session_db_id,
            observations = stored.observation_ids.len(),
            summary = stored.summary_id.is_some(),
            tokens,
            "reply stored"
        );
        Ok(ResponseOutcome::Stored(stored))
    }
}
