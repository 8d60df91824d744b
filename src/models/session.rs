//! Session record model and backend identifiers.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a persisted session row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session is receiving events.
    Active,
    /// Session finished normally.
    Completed,
    /// Session ended on a fatal backend error.
    Failed,
}

impl SessionStatus {
    /// Column representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Interchangeable AI backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Claude CLI; holds conversation state server-side.
    Claude,
    /// Gemini REST API; stateless.
    Gemini,
    /// `OpenRouter` chat completions; stateless.
    #[serde(rename = "openrouter")]
    OpenRouter,
}

impl AgentKind {
    /// Whether the provider keeps conversation state server-side.
    #[must_use]
    pub fn is_stateful(self) -> bool {
        matches!(self, Self::Claude)
    }

    /// Prefix used in synthetic memory-session identifiers.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::OpenRouter => "openrouter",
        }
    }
}

impl Display for AgentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Session metadata owned by the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    /// Database identifier.
    pub id: i64,
    /// Stable external key issued by the coding assistant.
    pub content_session_id: String,
    /// Backend conversation handle, if one was captured or minted.
    pub memory_session_id: Option<String>,
    /// Project name.
    pub project: String,
    /// First user prompt of the session.
    pub user_prompt: String,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Creation timestamp.
    pub started_at: DateTime<Utc>,
    /// Completion or failure timestamp.
    pub completed_at: Option<DateTime<Utc>>,
}
