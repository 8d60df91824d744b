//! Observation and summary repository.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::models::observation::{ParsedObservation, ParsedSummary, StoredObservation};
use crate::Result;

use super::db::{format_ts, parse_ts, Database};

/// Everything produced by one backend reply.
#[derive(Debug, Clone)]
pub struct TurnOutput<'a> {
    /// Backend conversation handle.
    pub memory_session_id: &'a str,
    /// Project name.
    pub project: &'a str,
    /// Parsed observations, already de-duplicated.
    pub observations: &'a [ParsedObservation],
    /// Parsed summary, if the reply carried one.
    pub summary: Option<&'a ParsedSummary>,
    /// Prompt number of the source message.
    pub prompt_number: Option<u32>,
    /// Tokens spent producing the reply.
    pub discovery_tokens: u64,
    /// Original enqueue time of the source message.
    pub created_at: DateTime<Utc>,
}

/// Ids of rows written for one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredTurn {
    /// Observation row ids, in input order.
    pub observation_ids: Vec<i64>,
    /// Summary row id.
    pub summary_id: Option<i64>,
}

/// Repository wrapper around `SQLite` for observations and summaries.
#[derive(Clone)]
pub struct ObservationRepo {
    db: Arc<Database>,
}

impl ObservationRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store observations and an optional summary in a single transaction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if any insert fails; nothing is written then.
    pub async fn store_turn(&self, turn: &TurnOutput<'_>) -> Result<StoredTurn> {
        let created_at = format_ts(turn.created_at);
        let tokens = i64::try_from(turn.discovery_tokens).unwrap_or(i64::MAX);
        let prompt_number = turn.prompt_number.map(i64::from);

        let mut tx = self.db.begin().await?;
        let mut stored = StoredTurn::default();

        for obs in turn.observations {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO observations \
                 (memory_session_id, project, kind, title, subtitle, facts, narrative, concepts, \
                  files_read, files_modified, prompt_number, discovery_tokens, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) RETURNING id",
            )
            .bind(turn.memory_session_id)
            .bind(turn.project)
            .bind(&obs.kind)
            .bind(&obs.title)
            .bind(&obs.subtitle)
            .bind(serde_json::to_string(&obs.facts)?)
            .bind(&obs.narrative)
            .bind(serde_json::to_string(&obs.concepts)?)
            .bind(serde_json::to_string(&obs.files_read)?)
            .bind(serde_json::to_string(&obs.files_modified)?)
            .bind(prompt_number)
            .bind(tokens)
            .bind(&created_at)
            .fetch_one(&mut *tx)
            .await?;
            stored.observation_ids.push(id);
        }

        if let Some(summary) = turn.summary {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO session_summaries \
                 (memory_session_id, project, request, investigated, learned, completed, \
                  next_steps, notes, prompt_number, discovery_tokens, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) RETURNING id",
            )
            .bind(turn.memory_session_id)
            .bind(turn.project)
            .bind(&summary.request)
            .bind(&summary.investigated)
            .bind(&summary.learned)
            .bind(&summary.completed)
            .bind(&summary.next_steps)
            .bind(&summary.notes)
            .bind(prompt_number)
            .bind(tokens)
            .bind(&created_at)
            .fetch_one(&mut *tx)
            .await?;
            stored.summary_id = Some(id);
        }

        tx.commit().await?;
        Ok(stored)
    }

    /// Observations stored under a memory-session identifier, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or a row cannot be decoded.
    pub async fn list_for_session(&self, memory_session_id: &str) -> Result<Vec<StoredObservation>> {
        let rows = sqlx::query(
            "SELECT id, memory_session_id, project, kind, title, subtitle, facts, narrative, \
                    concepts, files_read, files_modified, prompt_number, discovery_tokens, created_at \
             FROM observations WHERE memory_session_id = ?1 ORDER BY id ASC",
        )
        .bind(memory_session_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.iter()
            .map(|row| -> Result<StoredObservation> {
                let facts: String = row.try_get("facts")?;
                let concepts: String = row.try_get("concepts")?;
                let files_read: String = row.try_get("files_read")?;
                let files_modified: String = row.try_get("files_modified")?;
                let prompt_number: Option<i64> = row.try_get("prompt_number")?;
                let tokens: i64 = row.try_get("discovery_tokens")?;
                let created_at: String = row.try_get("created_at")?;
                Ok(StoredObservation {
                    id: row.try_get("id")?,
                    memory_session_id: row.try_get("memory_session_id")?,
                    project: row.try_get("project")?,
                    observation: ParsedObservation {
                        kind: row.try_get("kind")?,
                        title: row.try_get("title")?,
                        subtitle: row.try_get("subtitle")?,
                        facts: serde_json::from_str(&facts)?,
                        narrative: row.try_get("narrative")?,
                        concepts: serde_json::from_str(&concepts)?,
                        files_read: serde_json::from_str(&files_read)?,
                        files_modified: serde_json::from_str(&files_modified)?,
                    },
                    prompt_number: prompt_number.and_then(|n| u32::try_from(n).ok()),
                    discovery_tokens: u64::try_from(tokens).unwrap_or_default(),
                    created_at: parse_ts("created_at", &created_at)?,
                })
            })
            .collect()
    }

    /// Summaries stored under a memory-session identifier, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn summaries_for_session(&self, memory_session_id: &str) -> Result<Vec<ParsedSummary>> {
        let rows = sqlx::query(
            "SELECT request, investigated, learned, completed, next_steps, notes \
             FROM session_summaries WHERE memory_session_id = ?1 ORDER BY id ASC",
        )
        .bind(memory_session_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.iter()
            .map(|row| -> Result<ParsedSummary> {
                Ok(ParsedSummary {
                    request: row.try_get("request")?,
                    investigated: row.try_get("investigated")?,
                    learned: row.try_get("learned")?,
                    completed: row.try_get("completed")?,
                    next_steps: row.try_get("next_steps")?,
                    notes: row.try_get("notes")?,
                })
            })
            .collect()
    }
}
