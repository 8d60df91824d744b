//! Pluggable AI backends that turn queued tool activity into observations.
//!
//! Every backend implements [`BackendAgent`]: it consumes a session's event
//! loop until the loop ends (cancellation or idle timeout) and stores what
//! the provider returns. Stateless backends resend the conversation on each
//! call; the stateful Claude backend resumes its own server-side
//! conversation. A [`fallback::FallbackAgent`] chains a stateless primary
//! to the stateful backend.

pub mod claude;
pub mod fallback;
pub mod gemini;
pub mod history;
pub mod openrouter;
pub mod parser;
pub mod prompts;
pub mod provider;
pub mod response;
pub mod stateless;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GlobalConfig;
use crate::models::active_session::ActiveSession;
use crate::models::message::{MessagePayload, PendingMessage};
use crate::models::session::AgentKind;
use crate::orchestrator::process_registry::ProcessRegistry;
use crate::persistence::pending_repo::PendingMessageStore;
use crate::persistence::session_repo::SessionRepo;
use crate::queue::SessionMessages;
use crate::{AppError, Result};

use self::claude::ClaudeAgent;
use self::fallback::FallbackAgent;
use self::gemini::GeminiProvider;
use self::openrouter::OpenRouterProvider;
use self::prompts::{build_continuation_prompt, build_observation_prompt, build_summary_prompt};
use self::response::ResponseProcessor;
use self::stateless::StatelessAgent;

/// Boxed future returned by [`BackendAgent::start_session`].
pub type AgentFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Contract shared by every backend.
pub trait BackendAgent: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> AgentKind;

    /// Whether the backend keeps conversation state server-side.
    fn is_stateful(&self) -> bool {
        self.kind().is_stateful()
    }

    /// Consume the session's event loop until it ends.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cancelled` when the session is torn down mid-call,
    /// a fallback-eligible error when the provider rejects the session, and
    /// any other error when processing cannot continue.
    fn start_session(&self, session: Arc<ActiveSession>) -> AgentFuture<'_>;

    /// Whether `err` should hand the session to a fallback backend.
    fn should_fall_back(&self, err: &AppError) -> bool {
        err.is_fallback_eligible()
    }
}

/// Collaborators shared by every backend.
#[derive(Clone)]
pub struct AgentContext {
    /// Durable job store.
    pub store: PendingMessageStore,
    /// Session metadata.
    pub sessions: SessionRepo,
    /// Stores parsed replies and confirms their messages.
    pub responses: ResponseProcessor,
    /// Subprocess registry for stateful backends.
    pub processes: ProcessRegistry,
    /// Event loop idle timeout.
    pub idle_timeout: Option<Duration>,
}

impl AgentContext {
    /// Event loop over `session`'s queued messages.
    #[must_use]
    pub fn messages(&self, session: Arc<ActiveSession>) -> SessionMessages {
        SessionMessages::new(self.store.clone(), session, self.idle_timeout)
    }
}

/// Prompt for one queued message.
///
/// An observation carrying a prompt number newer than `prompt_sent` gets the
/// continuation prompt for that user prompt in front of it.
pub(crate) async fn message_prompt(
    session: &ActiveSession,
    message: &PendingMessage,
    prompt_sent: &mut u32,
) -> String {
    match &message.payload {
        MessagePayload::Observation(input) => {
            let observation = build_observation_prompt(input, message.created_at);
            match input.prompt_number.filter(|number| *number > *prompt_sent) {
                Some(number) => {
                    *prompt_sent = number;
                    let user_prompt = session.state().await.user_prompt.clone();
                    format!(
                        "{}\n\n{observation}",
                        build_continuation_prompt(&user_prompt, number)
                    )
                }
                None => observation,
            }
        }
        MessagePayload::Summarize {
            last_assistant_message,
        } => build_summary_prompt(last_assistant_message.as_deref()),
    }
}

/// Build the backend selected by `config.provider`.
///
/// Stateless providers are wrapped in a [`FallbackAgent`] targeting Claude
/// when `fallback_to_claude` is set.
///
/// # Errors
///
/// Returns `AppError::Config` if a provider client cannot be built.
pub fn build_agent(config: &GlobalConfig, ctx: AgentContext) -> Result<Arc<dyn BackendAgent>> {
    let claude = || -> Arc<dyn BackendAgent> {
        Arc::new(ClaudeAgent::new(config.claude.clone(), ctx.clone()))
    };

    let primary: Arc<dyn BackendAgent> = match config.provider {
        AgentKind::Claude => return Ok(claude()),
        AgentKind::Gemini => Arc::new(StatelessAgent::new(
            GeminiProvider::new(config.gemini.clone())?,
            ctx.clone(),
        )),
        AgentKind::OpenRouter => Arc::new(StatelessAgent::new(
            OpenRouterProvider::new(config.openrouter.clone())?,
            ctx.clone(),
        )),
    };

    if !config.fallback_to_claude {
        return Ok(primary);
    }
    Ok(Arc::new(FallbackAgent::new(primary, claude(), ctx.store.clone())?))
}
