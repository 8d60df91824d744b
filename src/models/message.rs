//! Queued work items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue status of a persisted message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a consumer, not yet confirmed.
    Processing,
    /// Abandoned after exhausting its retries.
    Failed,
}

impl MessageStatus {
    /// Column representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
        }
    }
}

/// One captured tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservationInput {
    /// Tool name, e.g. `Read` or `Bash`.
    pub tool_name: String,
    /// Raw tool input.
    #[serde(default)]
    pub tool_input: serde_json::Value,
    /// Raw tool output.
    #[serde(default)]
    pub tool_response: serde_json::Value,
    /// Prompt number the invocation belongs to.
    #[serde(default)]
    pub prompt_number: Option<u32>,
    /// Working directory of the invocation.
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Payload of a queued message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Turn a tool invocation into observations.
    Observation(ObservationInput),
    /// Summarize the session so far.
    Summarize {
        /// Final assistant message of the turn, if known.
        #[serde(default)]
        last_assistant_message: Option<String>,
    },
}

impl MessagePayload {
    /// Value stored in the `message_type` column.
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Observation(_) => "observation",
            Self::Summarize { .. } => "summarize",
        }
    }
}

/// A persisted queue row.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PendingMessage {
    /// Row identifier; also the FIFO order key.
    pub id: i64,
    /// Owning session.
    pub session_db_id: i64,
    /// External session key.
    pub content_session_id: String,
    /// Work to perform.
    pub payload: MessagePayload,
    /// Queue status.
    pub status: MessageStatus,
    /// Number of times the message was reset after getting stuck.
    pub retry_count: u32,
    /// Original enqueue time.
    pub created_at: DateTime<Utc>,
    /// When the current claim happened.
    pub started_processing_at: Option<DateTime<Utc>>,
}
