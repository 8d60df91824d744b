//! Observation and summary records produced by backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Observation extracted from a backend reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedObservation {
    /// Category such as `bugfix` or `discovery`.
    pub kind: String,
    /// Short title.
    pub title: Option<String>,
    /// One-line elaboration.
    pub subtitle: Option<String>,
    /// Discrete facts.
    pub facts: Vec<String>,
    /// Free-form narrative.
    pub narrative: Option<String>,
    /// Concept tags.
    pub concepts: Vec<String>,
    /// Files read during the tool call.
    pub files_read: Vec<String>,
    /// Files modified during the tool call.
    pub files_modified: Vec<String>,
}

/// Session summary extracted from a backend reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedSummary {
    /// What the user asked for.
    pub request: Option<String>,
    /// What was looked at.
    pub investigated: Option<String>,
    /// What was learned.
    pub learned: Option<String>,
    /// What got done.
    pub completed: Option<String>,
    /// Suggested follow-ups.
    pub next_steps: Option<String>,
    /// Anything else.
    pub notes: Option<String>,
}

/// Observation row as stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredObservation {
    /// Row identifier.
    pub id: i64,
    /// Backend conversation handle the observation belongs to.
    pub memory_session_id: String,
    /// Project name.
    pub project: String,
    /// Parsed content.
    pub observation: ParsedObservation,
    /// Prompt number at the time of the tool call.
    pub prompt_number: Option<u32>,
    /// Tokens spent producing the reply.
    pub discovery_tokens: u64,
    /// Original event time (enqueue time of the source message).
    pub created_at: DateTime<Utc>,
}
