//! Prompt builders shared by every backend.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::models::conversation::{ConversationTurn, Role};
use crate::models::message::ObservationInput;

use super::parser::OBSERVATION_KINDS;

/// First prompt of a memory session.
#[must_use]
pub fn build_init_prompt(project: &str, content_session_id: &str, user_prompt: &str) -> String {
    let kinds = OBSERVATION_KINDS.join(" | ");
    let date = Utc::now().format("%Y-%m-%d");
    format!(
        "You are observing a coding session and writing searchable memory for future sessions.\n\
         Record what was built, fixed, configured or learned in the observed project, \
         not what you as the observer are doing.\n\
         \n\
         Project: {project}\n\
         Session: {content_session_id}\n\
         User's goal: {user_prompt}\n\
         Date: {date}\n\
         \n\
         You will receive tool executions one at a time, each inside <tool_used>. \
         For each one worth remembering, reply with one or more blocks:\n\
         \n\
         <observation>\n\
         \x20 <type>{kinds}</type>\n\
         \x20 <title>short title</title>\n\
         \x20 <subtitle>one sentence</subtitle>\n\
         \x20 <facts><fact>concise fact</fact></facts>\n\
         \x20 <narrative>what happened and why it matters</narrative>\n\
         \x20 <concepts><concept>how-it-works | why-it-exists | what-changed | \
         problem-solution | gotcha | pattern | trade-off</concept></concepts>\n\
         \x20 <files_read><file>path</file></files_read>\n\
         \x20 <files_modified><file>path</file></files_modified>\n\
         </observation>\n\
         \n\
         Routine operations (empty listings, clean installs, repeated reads) need no \
         observation; reply with a short note instead.\n\
         \n\
         MEMORY PROCESSING SESSION START"
    )
}

/// Prompt for a later user request in the same session.
#[must_use]
pub fn build_continuation_prompt(user_prompt: &str, prompt_number: u32) -> String {
    format!("User's request #{prompt_number}: {user_prompt}")
}

/// Prompt describing one tool invocation.
#[must_use]
pub fn build_observation_prompt(input: &ObservationInput, occurred_at: DateTime<Utc>) -> String {
    let cwd = input
        .cwd
        .as_deref()
        .map(|cwd| format!("\n  <tool_cwd>{cwd}</tool_cwd>"))
        .unwrap_or_default();
    format!(
        "<tool_used>\n  <tool_name>{}</tool_name>\n  <tool_time>{}</tool_time>{cwd}\n  \
         <tool_input>{}</tool_input>\n  <tool_output>{}</tool_output>\n</tool_used>",
        input.tool_name,
        occurred_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        render_json(&input.tool_input),
        render_json(&input.tool_response),
    )
}

/// Prompt asking for a progress summary.
#[must_use]
pub fn build_summary_prompt(last_assistant_message: Option<&str>) -> String {
    let last = last_assistant_message
        .map(|message| format!("\nThe assistant's latest message was:\n{message}\n"))
        .unwrap_or_default();
    format!(
        "PROGRESS SUMMARY CHECKPOINT\n\
         Summarize the observed session so far, not this observation process.\n\
         {last}\n\
         Reply in this format:\n\
         <summary>\n\
         \x20 <request>short title of the latest request</request>\n\
         \x20 <investigated>what was examined</investigated>\n\
         \x20 <learned>how things work</learned>\n\
         \x20 <completed>what shipped or changed</completed>\n\
         \x20 <next_steps>what is being worked on next</next_steps>\n\
         \x20 <notes>anything else</notes>\n\
         </summary>\n\
         \n\
         If nothing at all happened, reply with <skip_summary reason=\"...\"/>."
    )
}

/// Transcript of an earlier conversation, replayed to a backend that takes
/// over a session mid-way.
#[must_use]
pub fn build_transcript_replay(turns: &[ConversationTurn]) -> String {
    let mut out = String::from(
        "This memory session is continuing from another model. \
         The conversation so far follows; continue in the same format.\n",
    );
    for turn in turns {
        let speaker = match turn.role {
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
        };
        out.push_str("\n--- ");
        out.push_str(speaker);
        out.push_str(" ---\n");
        out.push_str(&turn.content);
        out.push('\n');
    }
    out
}

fn render_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}
