//! Memory-session identifier rules.
//!
//! Stateful backends hand out opaque conversation identifiers that point at
//! server-side state; after a worker restart that state is gone, so such an
//! identifier must be dropped and recaptured. Stateless backends mint their
//! own identifier of the form `<tag>-<content uuid>-<fresh uuid>`; it carries
//! no server-side state and is kept verbatim across restarts.

use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use super::session::AgentKind;

/// Backends whose identifiers are minted locally.
pub const STATELESS_PROVIDERS: &[AgentKind] = &[AgentKind::Gemini, AgentKind::OpenRouter];

const UUID_PATTERN: &str =
    "[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}";

static SYNTHETIC_ID: LazyLock<Option<Regex>> = LazyLock::new(|| {
    let tags = STATELESS_PROVIDERS
        .iter()
        .map(|kind| kind.tag())
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!("^({tags})-({UUID_PATTERN})-({UUID_PATTERN})$")).ok()
});

/// Mint a synthetic identifier for a stateless backend.
#[must_use]
pub fn mint_synthetic_id(kind: AgentKind, content_session_id: &str) -> String {
    format!("{}-{content_session_id}-{}", kind.tag(), Uuid::new_v4())
}

/// Whether `id` is a well-formed synthetic identifier for `content_session_id`.
#[must_use]
pub fn is_synthetic_id(id: &str, content_session_id: &str) -> bool {
    let Some(pattern) = SYNTHETIC_ID.as_ref() else {
        return false;
    };
    pattern
        .captures(id)
        .and_then(|caps| caps.get(2))
        .is_some_and(|embedded| embedded.as_str() == content_session_id)
}

/// Apply the restart rule to an identifier loaded from the database.
///
/// Empty and whitespace-only values become `None`. A synthetic identifier
/// for this content session is preserved exactly as stored; anything else,
/// including a synthetic identifier with surrounding whitespace, is treated
/// as a stale provider-issued identifier and discarded.
#[must_use]
pub fn restore_memory_session_id(
    stored: Option<&str>,
    content_session_id: &str,
) -> Option<String> {
    let id = stored.filter(|id| !id.trim().is_empty())?;
    is_synthetic_id(id, content_session_id).then(|| id.to_owned())
}
