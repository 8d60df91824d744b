//! Claude CLI backend.
//!
//! Each turn runs the CLI in print mode with JSON output. The first reply
//! carries the CLI's own session id, which later turns pass to `--resume`
//! so the conversation lives on the Claude side. The child is registered
//! with the [`ProcessRegistry`](crate::orchestrator::process_registry::ProcessRegistry)
//! for the duration of the turn so teardown can make sure it is gone.

use std::process::Stdio;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ClaudeConfig;
use crate::models::active_session::ActiveSession;
use crate::models::conversation::{ConversationTurn, Role};
use crate::models::identity::is_synthetic_id;
use crate::models::message::PendingMessage;
use crate::models::session::AgentKind;
use crate::orchestrator::process_registry::TrackedProcess;
use crate::{AppError, Result};

use super::prompts::{build_init_prompt, build_transcript_replay};
use super::response::ResponseOutcome;
use super::{message_prompt, AgentContext, AgentFuture, BackendAgent};

/// Output of `claude -p --output-format json`.
#[derive(Debug, Deserialize)]
struct CliOutput {
    #[serde(default)]
    result: String,
    session_id: Option<String>,
    #[serde(default)]
    is_error: bool,
    usage: Option<CliUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// One finished CLI turn.
#[derive(Debug)]
struct CliReply {
    text: String,
    session_id: Option<String>,
    tokens: u64,
}

/// Stateful backend driving the Claude CLI.
pub struct ClaudeAgent {
    config: ClaudeConfig,
    ctx: AgentContext,
}

impl ClaudeAgent {
    /// Create the agent.
    #[must_use]
    pub fn new(config: ClaudeConfig, ctx: AgentContext) -> Self {
        Self { config, ctx }
    }

    async fn run(&self, session: Arc<ActiveSession>) -> Result<()> {
        // Synthetic ids belong to stateless backends and cannot be resumed.
        let (mut resume, mut replay, needs_init, mut prompt_sent) = {
            let state = session.state().await;
            let resume = state
                .memory_session_id
                .clone()
                .filter(|id| !is_synthetic_id(id, session.content_session_id()));
            let replay = (resume.is_none() && !state.conversation.is_empty())
                .then(|| build_transcript_replay(&state.conversation));
            (
                resume,
                replay,
                state.conversation.is_empty(),
                state.last_prompt_number,
            )
        };

        if replay.is_some() {
            info!(
                session_db_id = session.session_db_id(),
                "taking over conversation from another backend"
            );
        }

        if needs_init {
            let prompt = {
                let state = session.state().await;
                build_init_prompt(
                    &state.project,
                    session.content_session_id(),
                    &state.user_prompt,
                )
            };
            info!(provider = %AgentKind::Claude, "starting memory session");
            self.exchange(&session, &mut resume, None, prompt, None).await?;
        }

        let mut messages = self.ctx.messages(Arc::clone(&session));
        while let Some(message) = messages.next().await? {
            let prompt = message_prompt(&session, &message, &mut prompt_sent).await;
            debug!(message_id = message.id, kind = message.payload.message_type(), "sending message");
            self.exchange(&session, &mut resume, replay.take(), prompt, Some(&message))
                .await?;
        }

        Ok(())
    }

    /// Run one CLI turn and process its reply. `preamble` is sent ahead of
    /// `prompt` but not recorded in the conversation.
    async fn exchange(
        &self,
        session: &ActiveSession,
        resume: &mut Option<String>,
        preamble: Option<String>,
        prompt: String,
        message: Option<&PendingMessage>,
    ) -> Result<()> {
        let input = match preamble {
            Some(preamble) => format!("{preamble}\n\n{prompt}"),
            None => prompt.clone(),
        };
        session
            .state()
            .await
            .conversation
            .push(ConversationTurn::user(prompt));

        let reply = self.invoke(session, resume.as_deref(), &input).await?;
        if let Some(id) = reply.session_id {
            self.capture_session_id(session, resume, id).await?;
        }

        let outcome = self
            .ctx
            .responses
            .process(session, message, &reply.text, reply.tokens)
            .await?;

        if matches!(outcome, ResponseOutcome::Empty(_)) {
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

    async fn capture_session_id(
        &self,
        session: &ActiveSession,
        resume: &mut Option<String>,
        id: String,
    ) -> Result<()> {
        if resume.as_deref() == Some(id.as_str()) {
            return Ok(());
        }
        self.ctx
            .sessions
            .update_memory_session_id(session.session_db_id(), &id)
            .await?;
        info!(
            session_db_id = session.session_db_id(),
            memory_session_id = %id,
            "captured claude session id"
        );
        session.state().await.memory_session_id = Some(id.clone());
        *resume = Some(id);
        Ok(())
    }

    fn command(&self, resume: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.config.cli);
        cmd.args(["-p", "--output-format", "json", "--model"])
            .arg(&self.config.model);
        if let Some(id) = resume {
            cmd.args(["--resume", id]);
        }
        cmd.args(&self.config.extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Spawn the CLI, feed it `input` and collect its JSON reply.
    ///
    /// On cancellation the child is asked to terminate and left registered
    /// so teardown can verify its exit.
    async fn invoke(
        &self,
        session: &ActiveSession,
        resume: Option<&str>,
        input: &str,
    ) -> Result<CliReply> {
        let session_db_id = session.session_db_id();
        let mut child = self.command(resume).spawn().map_err(|err| {
            AppError::Process(format!("failed to spawn {}: {err}", self.config.cli))
        })?;

        let (Some(mut stdin), Some(mut stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(AppError::Process("claude cli stdio not captured".into()));
        };

        let handle = TrackedProcess::spawn_watch(session_db_id, child);
        self.ctx.processes.register(handle.clone()).await;
        debug!(session_db_id, pid = ?handle.pid(), resume = resume.is_some(), "claude cli spawned");

        let io = async {
            let write = async {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await
            };
            let mut out = String::new();
            let mut err = String::new();
            let (written, read_out, read_err) = tokio::join!(
                write,
                stdout.read_to_string(&mut out),
                stderr.read_to_string(&mut err)
            );
            written?;
            read_out?;
            read_err?;
            Ok::<_, AppError>((out, err))
        };

        let (out, err) = tokio::select! {
            biased;
            () = session.cancel_token().cancelled() => {
                handle.terminate();
                return Err(AppError::Cancelled);
            }
            result = io.instrument(info_span!("claude_turn", session_db_id)) => result?,
        };

        let exit = handle.wait().await;
        self.ctx.processes.unregister(session_db_id).await;

        if out.trim().is_empty() {
            let code = exit.and_then(|exit| exit.code);
            warn!(session_db_id, ?code, stderr = %err.trim(), "claude cli produced no output");
            return Err(classify_cli_error(&format!(
                "claude cli exited ({code:?}) without output: {}",
                err.trim()
            )));
        }

        parse_cli_output(&out)
    }
}

fn parse_cli_output(raw: &str) -> Result<CliReply> {
    let output: CliOutput = serde_json::from_str(raw.trim())
        .map_err(|err| AppError::Provider(format!("unparseable claude output: {err}")))?;
    if output.is_error {
        return Err(classify_cli_error(&output.result));
    }
    let usage = output.usage.unwrap_or_default();
    Ok(CliReply {
        text: output.result,
        session_id: output.session_id.filter(|id| !id.is_empty()),
        tokens: usage.input_tokens + usage.output_tokens,
    })
}

/// Classify an error reported by the CLI from its message text.
fn classify_cli_error(message: &str) -> AppError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("rate limit") || lower.contains("usage limit") || lower.contains("overloaded")
    {
        AppError::RateLimited(message.to_owned())
    } else if lower.contains("api key") || lower.contains("login") || lower.contains("authentication")
    {
        AppError::Unauthorized(message.to_owned())
    } else {
        AppError::Provider(message.to_owned())
    }
}

impl BackendAgent for ClaudeAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Claude
    }

    fn start_session(&self, session: Arc<ActiveSession>) -> AgentFuture<'_> {
        Box::pin(self.run(session))
    }
}
