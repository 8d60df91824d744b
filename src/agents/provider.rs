//! Stateless chat-completion providers and their error classification.

use std::future::Future;
use std::pin::Pin;

use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::models::conversation::ConversationTurn;
use crate::models::session::AgentKind;
use crate::{AppError, Result};

use super::history::ContextLimits;

/// Text returned by a provider plus its reported token usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    /// Reply text; may be empty.
    pub text: String,
    /// Total tokens reported by the provider.
    pub tokens: u64,
}

/// Boxed future returned by [`ChatProvider::complete`].
pub type CompletionFuture<'a> = Pin<Box<dyn Future<Output = Result<Completion>> + Send + 'a>>;

/// A REST backend that receives the whole conversation on every call.
pub trait ChatProvider: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> AgentKind;

    /// History budget for this provider.
    fn limits(&self) -> ContextLimits;

    /// Send `turns` and return the reply.
    ///
    /// # Errors
    ///
    /// Returns a classified provider error (`RateLimited`, `Unauthorized`,
    /// `Unavailable`, or `Provider`).
    fn complete<'a>(&'a self, turns: &'a [ConversationTurn]) -> CompletionFuture<'a>;

    /// Whether `err` should hand the session to a fallback backend.
    fn should_fall_back(&self, err: &AppError) -> bool {
        err.is_fallback_eligible()
    }
}

/// Run `call`, abandoning it as soon as `cancel` fires.
///
/// Dropping the future aborts any in-flight HTTP request.
///
/// # Errors
///
/// Returns `AppError::Cancelled` on cancellation, otherwise the call's error.
pub async fn send_with_cancel<T, F>(cancel: &CancellationToken, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(AppError::Cancelled),
        result = call => result,
    }
}

/// Map a non-success HTTP status to an error class.
#[must_use]
pub fn classify_status(provider: AgentKind, status: StatusCode, body: &str) -> AppError {
    let detail = format!("{provider} returned {status}: {}", truncate(body, 500));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AppError::Unauthorized(detail),
        StatusCode::TOO_MANY_REQUESTS => AppError::RateLimited(detail),
        s if s.is_server_error() => AppError::Unavailable(detail),
        _ => AppError::Provider(detail),
    }
}

/// Map a transport failure to an error class.
#[must_use]
pub fn classify_transport(provider: AgentKind, err: &reqwest::Error) -> AppError {
    if err.is_connect() || err.is_timeout() {
        AppError::Unavailable(format!("{provider} unreachable: {err}"))
    } else {
        AppError::Provider(format!("{provider} request failed: {err}"))
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    text.char_indices()
        .nth(max_chars)
        .map_or(text, |(index, _)| &text[..index])
}
