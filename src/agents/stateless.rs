//! Backend driver for stateless chat providers.
//!
//! Stateless providers keep nothing between calls, so each call carries the
//! session's conversation, trimmed to the provider's context budget. The
//! conversation lives on the [`ActiveSession`], which lets a fallback
//! backend pick it up unchanged.

use std::sync::Arc;

use tracing::{debug, info};

use crate::models::active_session::ActiveSession;
use crate::models::conversation::{ConversationTurn, Role};
use crate::models::identity::mint_synthetic_id;
use crate::models::message::PendingMessage;
use crate::models::session::AgentKind;
use crate::{AppError, Result};

use super::history::truncate_history;
use super::prompts::build_init_prompt;
use super::provider::{send_with_cancel, ChatProvider};
use super::response::ResponseOutcome;
use super::{message_prompt, AgentContext, AgentFuture, BackendAgent};

/// [`BackendAgent`] over any [`ChatProvider`].
pub struct StatelessAgent<P> {
    provider: P,
    ctx: AgentContext,
}

impl<P: ChatProvider> StatelessAgent<P> {
    /// Wrap `provider`.
    #[must_use]
    pub fn new(provider: P, ctx: AgentContext) -> Self {
        Self { provider, ctx }
    }

    /// The wrapped provider.
    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    async fn run(&self, session: Arc<ActiveSession>) -> Result<()> {
        let kind = self.provider.kind();
        self.ensure_memory_session_id(&session).await?;

        let (needs_init, mut prompt_sent) = {
            let state = session.state().await;
            (state.conversation.is_empty(), state.last_prompt_number)
        };

        if needs_init {
            let prompt = {
                let state = session.state().await;
                build_init_prompt(
                    &state.project,
                    session.content_session_id(),
                    &state.user_prompt,
                )
            };
            info!(provider = %kind, "starting memory session");
            self.exchange(&session, prompt, None).await?;
        }

        let mut messages = self.ctx.messages(Arc::clone(&session));
        while let Some(message) = messages.next().await? {
            let prompt = message_prompt(&session, &message, &mut prompt_sent).await;
            debug!(message_id = message.id, kind = message.payload.message_type(), "sending message");
            self.exchange(&session, prompt, Some(&message)).await?;
        }

        Ok(())
    }

    /// Send one user turn with the trimmed history and process the reply.
    async fn exchange(
        &self,
        session: &ActiveSession,
        prompt: String,
        message: Option<&PendingMessage>,
    ) -> Result<()> {
        let history = {
            let mut state = session.state().await;
            state.conversation.push(ConversationTurn::user(prompt));
            truncate_history(&state.conversation, self.provider.limits()).to_vec()
        };

        let completion =
            send_with_cancel(session.cancel_token(), self.provider.complete(&history)).await?;

        let outcome = self
            .ctx
            .responses
            .process(session, message, &completion.text, completion.tokens)
            .await?;

        if matches!(outcome, ResponseOutcome::Empty(_)) {
            // Drop the unanswered turn; the message will be sent again.
            let mut state = session.state().await;
            if state
                .conversation
                .last()
                .is_some_and(|turn| turn.role == Role::User)
            {
                state.conversation.pop();
            }
        }
        Ok(())
    }

    async fn ensure_memory_session_id(&self, session: &ActiveSession) -> Result<()> {
        let mut state = session.state().await;
        if state.memory_session_id.is_some() {
            return Ok(());
        }

        let id = mint_synthetic_id(self.provider.kind(), session.content_session_id());
        self.ctx
            .sessions
            .update_memory_session_id(session.session_db_id(), &id)
            .await?;
        info!(memory_session_id = %id, "minted memory session id");
        state.memory_session_id = Some(id);
        Ok(())
    }
}

impl<P: ChatProvider + 'static> BackendAgent for StatelessAgent<P> {
    fn kind(&self) -> AgentKind {
        self.provider.kind()
    }

    fn start_session(&self, session: Arc<ActiveSession>) -> AgentFuture<'_> {
        Box::pin(self.run(session))
    }

    fn should_fall_back(&self, err: &AppError) -> bool {
        self.provider.should_fall_back(err)
    }
}
