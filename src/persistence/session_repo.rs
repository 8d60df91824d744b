//! Session repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::models::session::{SessionRecord, SessionStatus};
use crate::{AppError, Result};

use super::db::{format_ts, parse_ts, Database};

const SESSION_COLUMNS: &str = "id, content_session_id, memory_session_id, project, user_prompt, \
     status, started_at, completed_at";

/// Repository wrapper around `SQLite` for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Return the session for `content_session_id`, creating it if needed.
    ///
    /// An existing row keeps its first prompt; a non-empty `project` fills in
    /// a previously blank project.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the upsert fails.
    pub async fn create_or_get(
        &self,
        content_session_id: &str,
        project: &str,
        user_prompt: &str,
    ) -> Result<SessionRecord> {
        sqlx::query(
            "INSERT INTO sdk_sessions (content_session_id, project, user_prompt, status, started_at) \
             VALUES (?1, ?2, ?3, 'active', ?4) \
             ON CONFLICT(content_session_id) DO UPDATE SET \
               project = CASE WHEN excluded.project <> '' THEN excluded.project ELSE project END",
        )
        .bind(content_session_id)
        .bind(project)
        .bind(user_prompt)
        .bind(format_ts(Utc::now()))
        .execute(self.db.as_ref())
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sdk_sessions WHERE content_session_id = ?1"
        ))
        .bind(content_session_id)
        .fetch_one(self.db.as_ref())
        .await?;
        decode_session(&row)
    }

    /// Retrieve a session by database identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<SessionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sdk_sessions WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(self.db.as_ref())
        .await?;
        row.as_ref().map(decode_session).transpose()
    }

    /// Persist a captured or minted memory-session identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn update_memory_session_id(&self, id: i64, memory_session_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE sdk_sessions SET memory_session_id = ?1 WHERE id = ?2")
            .bind(memory_session_id)
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {id} not found")));
        }
        Ok(())
    }

    /// Mark a session completed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_completed(&self, id: i64) -> Result<()> {
        self.set_terminal(id, SessionStatus::Completed).await
    }

    /// Mark a session failed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_failed(&self, id: i64) -> Result<()> {
        self.set_terminal(id, SessionStatus::Failed).await
    }

    /// Re-open a session that receives new work after completing or failing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn reactivate(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE sdk_sessions SET status = 'active', completed_at = NULL \
             WHERE id = ?1 AND status <> 'active'",
        )
        .bind(id)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Append a user prompt and return its prompt number (1-based).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn record_user_prompt(&self, content_session_id: &str, prompt: &str) -> Result<u32> {
        let number: i64 = sqlx::query_scalar(
            "INSERT INTO user_prompts (content_session_id, prompt_number, prompt_text, created_at) \
             VALUES (?1, \
               (SELECT COALESCE(MAX(prompt_number), 0) + 1 FROM user_prompts WHERE content_session_id = ?1), \
               ?2, ?3) \
             RETURNING prompt_number",
        )
        .bind(content_session_id)
        .bind(prompt)
        .bind(format_ts(Utc::now()))
        .fetch_one(self.db.as_ref())
        .await?;
        Ok(u32::try_from(number).unwrap_or_default())
    }

    /// Latest recorded prompt number and text, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn latest_prompt(&self, content_session_id: &str) -> Result<Option<(u32, String)>> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT prompt_number, prompt_text FROM user_prompts \
             WHERE content_session_id = ?1 ORDER BY prompt_number DESC LIMIT 1",
        )
        .bind(content_session_id)
        .fetch_optional(self.db.as_ref())
        .await?;
        Ok(row.map(|(number, text)| (u32::try_from(number).unwrap_or_default(), text)))
    }

    /// Latest recorded prompt number, `0` when none.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn latest_prompt_number(&self, content_session_id: &str) -> Result<u32> {
        Ok(self
            .latest_prompt(content_session_id)
            .await?
            .map_or(0, |(number, _)| number))
    }

    async fn set_terminal(&self, id: i64, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sdk_sessions SET status = ?1, completed_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(format_ts(Utc::now()))
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }
}

fn decode_session(row: &SqliteRow) -> Result<SessionRecord> {
    let status: String = row.try_get("status")?;
    let status = match status.as_str() {
        "active" => SessionStatus::Active,
        "completed" => SessionStatus::Completed,
        "failed" => SessionStatus::Failed,
        other => return Err(AppError::Db(format!("unknown session status: {other}"))),
    };
    let started_at: String = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    Ok(SessionRecord {
        id: row.try_get("id")?,
        content_session_id: row.try_get("content_session_id")?,
        memory_session_id: row.try_get("memory_session_id")?,
        project: row.try_get("project")?,
        user_prompt: row.try_get("user_prompt")?,
        status,
        started_at: parse_ts("started_at", &started_at)?,
        completed_at: completed_at
            .as_deref()
            .map(|value| parse_ts("completed_at", value))
            .transpose()?,
    })
}
