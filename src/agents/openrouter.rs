//! `OpenRouter` chat-completions provider.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::OpenRouterConfig;
use crate::models::conversation::{ConversationTurn, Role};
use crate::models::session::AgentKind;
use crate::{AppError, Result};

use super::history::ContextLimits;
use super::provider::{
    classify_status, classify_transport, ChatProvider, Completion, CompletionFuture,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct ApiError {
    code: Option<serde_json::Value>,
    message: Option<String>,
}

/// `OpenRouter` REST client.
pub struct OpenRouterProvider {
    config: OpenRouterConfig,
    http: reqwest::Client,
}

impl OpenRouterProvider {
    /// Build a client for `config`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(config: OpenRouterConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| AppError::Config(format!("failed to build openrouter client: {err}")))?;
        Ok(Self { config, http })
    }

    async fn send(&self, turns: &[ConversationTurn]) -> Result<Completion> {
        if self.config.api_key.is_empty() {
            return Err(AppError::Unauthorized(
                "openrouter api key not configured".into(),
            ));
        }

        let body = ChatRequest {
            model: &self.config.model,
            messages: turns
                .iter()
                .map(|turn| ChatMessage {
                    role: match turn.role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    content: &turn.content,
                })
                .collect(),
            temperature: 0.3,
            max_tokens: 4096,
        };

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_key)
            .header("HTTP-Referer", &self.config.site_url)
            .header("X-Title", &self.config.app_name)
            .json(&body)
            .send()
            .await
            .map_err(|err| classify_transport(AgentKind::OpenRouter, &err))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_openrouter_error(status, &text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| AppError::Provider(format!("invalid openrouter response: {err}")))?;

        // Errors can arrive inside a 200 body.
        if let Some(error) = parsed.error {
            let code = error
                .code
                .as_ref()
                .and_then(serde_json::Value::as_u64)
                .and_then(|code| u16::try_from(code).ok())
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            return Err(classify_openrouter_error(
                code,
                error.message.as_deref().unwrap_or("unknown error"),
            ));
        }

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .unwrap_or_default();
        let tokens = parsed
            .usage
            .and_then(|usage| usage.total_tokens)
            .unwrap_or_default();

        Ok(Completion { text, tokens })
    }
}

/// `402 Payment Required` means the account ran out of credits.
#[must_use]
pub fn classify_openrouter_error(status: StatusCode, body: &str) -> AppError {
    if status == StatusCode::PAYMENT_REQUIRED {
        return AppError::RateLimited(format!("openrouter credits exhausted: {body}"));
    }
    classify_status(AgentKind::OpenRouter, status, body)
}

impl ChatProvider for OpenRouterProvider {
    fn kind(&self) -> AgentKind {
        AgentKind::OpenRouter
    }

    fn limits(&self) -> ContextLimits {
        ContextLimits {
            max_messages: self.config.max_context_messages,
            max_tokens: self.config.max_estimated_tokens,
        }
    }

    fn complete<'a>(&'a self, turns: &'a [ConversationTurn]) -> CompletionFuture<'a> {
        Box::pin(self.send(turns))
    }
}
