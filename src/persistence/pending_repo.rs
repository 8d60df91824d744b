//! Durable per-session job queue backed by the `pending_messages` table.
//!
//! Rows move `pending -> processing` on claim and are deleted on confirm.
//! Rows stuck in `processing` are recovered by [`PendingMessageStore::reset_stale_processing`],
//! which consumes one retry per reset and abandons a row (`failed`) once the
//! retry ceiling is reached.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, warn};

use crate::models::message::{MessagePayload, MessageStatus, PendingMessage};
use crate::{AppError, Result};

use super::db::{format_ts, parse_ts, Database};

const MESSAGE_COLUMNS: &str = "id, session_db_id, content_session_id, payload, status, \
     retry_count, created_at, started_processing_at";

/// Outcome of a stuck-message sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Rows returned to `pending`.
    pub reset: u64,
    /// Rows abandoned after reaching the retry ceiling.
    pub abandoned: u64,
}

/// Repository for queued messages.
#[derive(Clone)]
pub struct PendingMessageStore {
    db: Arc<Database>,
}

impl PendingMessageStore {
    /// Create a new store instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Persist a new `pending` message and return its id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the payload cannot be encoded or the insert fails.
    pub async fn enqueue(
        &self,
        session_db_id: i64,
        content_session_id: &str,
        payload: &MessagePayload,
    ) -> Result<i64> {
        let encoded = serde_json::to_string(payload)?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO pending_messages \
             (session_db_id, content_session_id, message_type, payload, status, retry_count, created_at) \
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5) RETURNING id",
        )
        .bind(session_db_id)
        .bind(content_session_id)
        .bind(payload.message_type())
        .bind(encoded)
        .bind(format_ts(Utc::now()))
        .fetch_one(self.db.as_ref())
        .await?;

        debug!(session_db_id, message_id = id, kind = payload.message_type(), "message enqueued");
        Ok(id)
    }

    /// Atomically claim the oldest `pending` message of a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails or the row cannot be decoded.
    pub async fn claim_next(&self, session_db_id: i64) -> Result<Option<PendingMessage>> {
        let row = sqlx::query(&format!(
            "UPDATE pending_messages SET status = 'processing', started_processing_at = ?1 \
             WHERE id = (SELECT id FROM pending_messages \
                         WHERE session_db_id = ?2 AND status = 'pending' \
                         ORDER BY id ASC LIMIT 1) \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(format_ts(Utc::now()))
        .bind(session_db_id)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.as_ref().map(decode_message).transpose()
    }

    /// Delete a processed message. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn confirm(&self, message_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pending_messages WHERE id = ?1")
            .bind(message_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Return a claimed message to `pending` without consuming a retry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn release(&self, message_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE pending_messages SET status = 'pending', started_processing_at = NULL \
             WHERE id = ?1 AND status = 'processing'",
        )
        .bind(message_id)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Consume one retry of a claimed message, abandoning it at the ceiling.
    ///
    /// Returns the resulting status, or `None` if the message was not claimed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_failed(
        &self,
        message_id: i64,
        max_retries: u32,
    ) -> Result<Option<MessageStatus>> {
        let status: Option<String> = sqlx::query_scalar(
            "UPDATE pending_messages SET \
               status = CASE WHEN retry_count >= ?2 THEN 'failed' ELSE 'pending' END, \
               failed_at = CASE WHEN retry_count >= ?2 THEN ?3 ELSE NULL END, \
               retry_count = CASE WHEN retry_count >= ?2 THEN retry_count ELSE retry_count + 1 END, \
               started_processing_at = NULL \
             WHERE id = ?1 AND status = 'processing' \
             RETURNING status",
        )
        .bind(message_id)
        .bind(i64::from(max_retries))
        .bind(format_ts(Utc::now()))
        .fetch_optional(self.db.as_ref())
        .await?;

        let status = status.as_deref().map(parse_status).transpose()?;
        if status == Some(MessageStatus::Failed) {
            warn!(message_id, max_retries, "message abandoned after exhausting retries");
        }
        Ok(status)
    }

    /// Recover messages stuck in `processing` for longer than `threshold`.
    ///
    /// Rows that already reached `max_retries` are abandoned; the rest go back
    /// to `pending` with their retry count incremented.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if either update fails.
    pub async fn reset_stale_processing(
        &self,
        threshold: Duration,
        max_retries: u32,
    ) -> Result<SweepReport> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|err| AppError::Config(format!("invalid stale threshold: {err}")))?;
        let now = Utc::now();
        let cutoff = format_ts(now - threshold);

        let mut tx = self.db.begin().await?;

        let abandoned: Vec<(i64, i64)> = sqlx::query_as(
            "UPDATE pending_messages SET status = 'failed', failed_at = ?1, \
               started_processing_at = NULL \
             WHERE status = 'processing' AND started_processing_at <= ?2 AND retry_count >= ?3 \
             RETURNING id, session_db_id",
        )
        .bind(format_ts(now))
        .bind(&cutoff)
        .bind(i64::from(max_retries))
        .fetch_all(&mut *tx)
        .await?;

        let reset = sqlx::query(
            "UPDATE pending_messages SET status = 'pending', retry_count = retry_count + 1, \
               started_processing_at = NULL \
             WHERE status = 'processing' AND started_processing_at <= ?1",
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        for (message_id, session_db_id) in &abandoned {
            warn!(
                message_id,
                session_db_id, max_retries, "stuck message abandoned after exhausting retries"
            );
        }

        Ok(SweepReport {
            reset,
            abandoned: abandoned.len() as u64,
        })
    }

    /// Number of `pending` plus `processing` messages for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn pending_count(&self, session_db_id: i64) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM pending_messages \
             WHERE session_db_id = ?1 AND status IN ('pending', 'processing')",
            session_db_id,
        )
        .await
    }

    /// Number of `pending` messages for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn claimable_count(&self, session_db_id: i64) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM pending_messages WHERE session_db_id = ?1 AND status = 'pending'",
            session_db_id,
        )
        .await
    }

    /// Whether any session has `pending` or `processing` messages.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn has_any_pending_work(&self) -> Result<bool> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM pending_messages WHERE status IN ('pending', 'processing'))",
        )
        .fetch_one(self.db.as_ref())
        .await?;
        Ok(exists != 0)
    }

    /// Sessions that still have `pending` messages, oldest work first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn sessions_with_pending_messages(&self) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT session_db_id FROM pending_messages WHERE status = 'pending' \
             GROUP BY session_db_id ORDER BY MIN(id)",
        )
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(ids)
    }

    /// Every queued message in id order, including abandoned ones.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or a row cannot be decoded.
    pub async fn list_queue(&self) -> Result<Vec<PendingMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM pending_messages ORDER BY id ASC"
        ))
        .fetch_all(self.db.as_ref())
        .await?;
        rows.iter().map(decode_message).collect()
    }

    /// Delete abandoned messages. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn clear_failed(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM pending_messages WHERE status = 'failed'")
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }

    async fn count(&self, sql: &str, session_db_id: i64) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(sql)
            .bind(session_db_id)
            .fetch_one(self.db.as_ref())
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

fn parse_status(value: &str) -> Result<MessageStatus> {
    match value {
        "pending" => Ok(MessageStatus::Pending),
        "processing" => Ok(MessageStatus::Processing),
        "failed" => Ok(MessageStatus::Failed),
        other => Err(AppError::Db(format!("unknown message status: {other}"))),
    }
}

fn decode_message(row: &SqliteRow) -> Result<PendingMessage> {
    let payload: String = row.try_get("payload")?;
    let status: String = row.try_get("status")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let created_at: String = row.try_get("created_at")?;
    let started: Option<String> = row.try_get("started_processing_at")?;

    Ok(PendingMessage {
        id: row.try_get("id")?,
        session_db_id: row.try_get("session_db_id")?,
        content_session_id: row.try_get("content_session_id")?,
        payload: serde_json::from_str(&payload)?,
        status: parse_status(&status)?,
        retry_count: u32::try_from(retry_count).unwrap_or_default(),
        created_at: parse_ts("created_at", &created_at)?,
        started_processing_at: started
            .as_deref()
            .map(|value| parse_ts("started_processing_at", value))
            .transpose()?,
    })
}
