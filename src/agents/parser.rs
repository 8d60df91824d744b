//! Extraction of `<observation>` and `<summary>` blocks from backend replies.
//!
//! Replies are loosely formed XML. Missing or placeholder fields become
//! `None`; an unknown observation type falls back to [`FALLBACK_KIND`].
//! Observations are never dropped for missing fields.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::models::observation::{ParsedObservation, ParsedSummary};

/// Observation types a backend may emit.
pub const OBSERVATION_KINDS: &[&str] = &[
    "bugfix",
    "feature",
    "refactor",
    "change",
    "discovery",
    "decision",
];

/// Type assigned when the reply's type is missing or unknown.
pub const FALLBACK_KIND: &str = "discovery";

static SKIP_SUMMARY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"<skip_summary(?:\s+reason="([^"]*)")?\s*/>"#).ok());

/// Every `<observation>` block in `text`, in order.
#[must_use]
pub fn parse_observations(text: &str) -> Vec<ParsedObservation> {
    extract_blocks(text, "observation")
        .into_iter()
        .map(|block| {
            let raw_kind = extract_section(block, "type");
            let kind = raw_kind
                .as_deref()
                .map(str::to_ascii_lowercase)
                .filter(|kind| OBSERVATION_KINDS.contains(&kind.as_str()))
                .unwrap_or_else(|| {
                    warn!(raw = ?raw_kind, fallback = FALLBACK_KIND, "unknown observation type");
                    FALLBACK_KIND.to_owned()
                });

            let concepts = extract_list(block, "concepts", "concept")
                .into_iter()
                .filter(|concept| *concept != kind)
                .collect();

            ParsedObservation {
                title: extract_section(block, "title"),
                subtitle: extract_section(block, "subtitle"),
                facts: extract_list(block, "facts", "fact"),
                narrative: extract_section(block, "narrative"),
                concepts,
                files_read: extract_list(block, "files_read", "file"),
                files_modified: extract_list(block, "files_modified", "file"),
                kind,
            }
        })
        .collect()
}

/// The first `<summary>` block in `text`.
///
/// Returns `None` when there is no block or the backend declined with
/// `<skip_summary/>`.
#[must_use]
pub fn parse_summary(text: &str) -> Option<ParsedSummary> {
    if let Some(caps) = SKIP_SUMMARY.as_ref().and_then(|re| re.captures(text)) {
        let reason = caps.get(1).map_or("", |m| m.as_str());
        info!(reason, "summary skipped by backend");
        return None;
    }

    let block = extract_blocks(text, "summary").into_iter().next()?;
    Some(ParsedSummary {
        request: extract_section(block, "request"),
        investigated: extract_section(block, "investigated"),
        learned: extract_section(block, "learned"),
        completed: extract_section(block, "completed"),
        next_steps: extract_section(block, "next_steps"),
        notes: extract_section(block, "notes"),
    })
}

/// Drop observations repeating an earlier one in the same batch.
///
/// Two observations repeat when type, title and subtitle match after
/// trimming and case folding. Untitled observations are always kept.
#[must_use]
pub fn dedup_observations(observations: Vec<ParsedObservation>) -> Vec<ParsedObservation> {
    let before = observations.len();
    let mut seen = HashSet::new();
    let kept: Vec<_> = observations
        .into_iter()
        .filter(|obs| {
            let Some(title) = obs.title.as_deref().map(normalize).filter(|t| !t.is_empty()) else {
                return true;
            };
            let subtitle = obs.subtitle.as_deref().map(normalize).unwrap_or_default();
            seen.insert((obs.kind.clone(), title, subtitle))
        })
        .collect();

    if kept.len() < before {
        debug!(removed = before - kept.len(), "dropped duplicate observations");
    }
    kept
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Inner text of every `<tag>...</tag>` block (attributes allowed).
fn extract_blocks<'a>(text: &'a str, tag: &str) -> Vec<&'a str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some((inner, after)) = next_element(rest, tag) {
        blocks.push(inner);
        rest = after;
    }
    blocks
}

/// Trimmed text of the first `<tag>` element, `None` when empty or a
/// `[placeholder]`.
fn extract_section(content: &str, tag: &str) -> Option<String> {
    let (inner, _) = next_element(content, tag)?;
    let value = inner.trim();
    let placeholder = value.starts_with('[') && value.ends_with(']');
    (!value.is_empty() && !placeholder).then(|| value.to_owned())
}

/// Non-empty `<item>` values inside the first `<container>` element.
fn extract_list(content: &str, container: &str, item: &str) -> Vec<String> {
    let Some((inner, _)) = next_element(content, container) else {
        return Vec::new();
    };
    extract_blocks(inner, item)
        .into_iter()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Find the next `<tag ...>inner</tag>`; returns `inner` and the text after it.
fn next_element<'a>(text: &'a str, tag: &str) -> Option<(&'a str, &'a str)> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut search_from = 0;

    loop {
        let start = search_from + text[search_from..].find(&open)?;
        let after_name = start + open.len();
        // Reject longer tag names sharing the prefix, e.g. `<files_read>` for `<file`.
        match text[after_name..].chars().next() {
            Some('>') => {}
            Some(c) if c.is_whitespace() => {}
            _ => {
                search_from = after_name;
                continue;
            }
        }
        let body_start = after_name + text[after_name..].find('>')? + 1;
        if text[..body_start].ends_with("/>") {
            search_from = body_start;
            continue;
        }
        let body_end = body_start + text[body_start..].find(&close)?;
        return Some((&text[body_start..body_end], &text[body_end + close.len()..]));
    }
}
