//! Gemini `generateContent` provider.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::GeminiConfig;
use crate::models::conversation::{ConversationTurn, Role};
use crate::models::session::AgentKind;
use crate::{AppError, Result};

use super::history::ContextLimits;
use super::provider::{
    classify_status, classify_transport, ChatProvider, Completion, CompletionFuture,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const PACING_BUFFER: Duration = Duration::from_millis(100);
const DEFAULT_RPM: u32 = 5;

/// Free-tier requests per minute by model.
const FREE_TIER_RPM: &[(&str, u32)] = &[
    ("gemini-2.5-flash-lite", 10),
    ("gemini-2.5-flash", 10),
    ("gemini-2.5-pro", 5),
    ("gemini-2.0-flash", 15),
    ("gemini-2.0-flash-lite", 30),
    ("gemini-3-flash", 10),
    ("gemini-3-flash-preview", 5),
];

/// Minimum spacing between requests for `model`.
#[must_use]
pub fn min_request_interval(model: &str) -> Duration {
    let rpm = FREE_TIER_RPM
        .iter()
        .find(|(name, _)| *name == model)
        .map_or(DEFAULT_RPM, |(_, rpm)| *rpm);
    Duration::from_millis(60_000_u64.div_ceil(u64::from(rpm))) + PACING_BUFFER
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    total_token_count: Option<u64>,
}

/// Gemini REST client.
pub struct GeminiProvider {
    config: GeminiConfig,
    http: reqwest::Client,
    last_request: Mutex<Option<Instant>>,
}

impl GeminiProvider {
    /// Build a client for `config`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| AppError::Config(format!("failed to build gemini client: {err}")))?;
        Ok(Self {
            config,
            http,
            last_request: Mutex::new(None),
        })
    }

    /// Wait until the model's free-tier spacing since the previous request
    /// has elapsed. The lock is held while waiting so concurrent sessions
    /// queue up behind each other.
    async fn pace(&self) {
        if !self.config.rate_limiting {
            return;
        }
        let interval = min_request_interval(&self.config.model);
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + interval;
            if ready_at > Instant::now() {
                debug!(model = %self.config.model, ?interval, "pacing gemini request");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn send(&self, turns: &[ConversationTurn]) -> Result<Completion> {
        if self.config.api_key.is_empty() {
            return Err(AppError::Unauthorized("gemini api key not configured".into()));
        }

        let body = GenerateRequest {
            contents: turns
                .iter()
                .map(|turn| Content {
                    role: match turn.role {
                        Role::User => "user",
                        Role::Assistant => "model",
                    },
                    parts: [Part {
                        text: &turn.content,
                    }],
                })
                .collect(),
            generation_config: GenerationConfig {
                temperature: 0.3,
                max_output_tokens: 4096,
            },
        };

        self.pace().await;

        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        );
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| classify_transport(AgentKind::Gemini, &err))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_gemini_error(status, &text));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|err| AppError::Provider(format!("invalid gemini response: {err}")))?;

        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().find_map(|p| p.text))
            .unwrap_or_default();
        let tokens = parsed
            .usage_metadata
            .and_then(|u| u.total_token_count)
            .unwrap_or_default();

        Ok(Completion { text, tokens })
    }
}

/// Gemini reports quota exhaustion with several statuses; the body decides.
#[must_use]
pub fn classify_gemini_error(status: reqwest::StatusCode, body: &str) -> AppError {
    if body.contains("RESOURCE_EXHAUSTED") || body.to_ascii_lowercase().contains("quota") {
        return AppError::RateLimited(format!("gemini quota exhausted ({status})"));
    }
    classify_status(AgentKind::Gemini, status, body)
}

impl ChatProvider for GeminiProvider {
    fn kind(&self) -> AgentKind {
        AgentKind::Gemini
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
