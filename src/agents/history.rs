//! Context budget for stateless backends.

use tracing::debug;

use crate::models::conversation::ConversationTurn;

const CHARS_PER_TOKEN: usize = 4;

/// Message-count and estimated-token ceilings for resent history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    /// Maximum number of turns sent.
    pub max_messages: usize,
    /// Maximum estimated tokens sent.
    pub max_tokens: usize,
}

/// Rough token estimate: one token per four characters, rounded up.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Most recent suffix of `turns` that fits both ceilings.
///
/// The newest turn is always kept, even when it alone exceeds the token
/// ceiling.
#[must_use]
pub fn truncate_history(turns: &[ConversationTurn], limits: ContextLimits) -> &[ConversationTurn] {
    let mut tokens = 0;
    let mut start = turns.len();

    for (index, turn) in turns.iter().enumerate().rev() {
        let cost = estimate_tokens(&turn.content);
        let kept = turns.len() - index - 1;
        if kept > 0 && (kept >= limits.max_messages || tokens + cost > limits.max_tokens) {
            break;
        }
        tokens += cost;
        start = index;
    }

    if start > 0 {
        debug!(
            dropped = start,
            kept = turns.len() - start,
            estimated_tokens = tokens,
            "truncated conversation history"
        );
    }
    &turns[start..]
}
