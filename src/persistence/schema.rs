//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`, so this is safe
//! to re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS sdk_sessions (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    content_session_id  TEXT NOT NULL UNIQUE,
    memory_session_id   TEXT,
    project             TEXT NOT NULL,
    user_prompt         TEXT NOT NULL,
    status              TEXT NOT NULL CHECK(status IN ('active','completed','failed')),
    started_at          TEXT NOT NULL,
    completed_at        TEXT
);

CREATE TABLE IF NOT EXISTS user_prompts (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    content_session_id  TEXT NOT NULL,
    prompt_number       INTEGER NOT NULL,
    prompt_text         TEXT NOT NULL,
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_messages (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    session_db_id           INTEGER NOT NULL,
    content_session_id      TEXT NOT NULL,
    message_type            TEXT NOT NULL CHECK(message_type IN ('observation','summarize')),
    payload                 TEXT NOT NULL,
    status                  TEXT NOT NULL CHECK(status IN ('pending','processing','failed')),
    retry_count             INTEGER NOT NULL DEFAULT 0,
    created_at              TEXT NOT NULL,
    started_processing_at   TEXT,
    failed_at               TEXT
);

CREATE TABLE IF NOT EXISTS observations (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_session_id   TEXT NOT NULL,
    project             TEXT NOT NULL,
    kind                TEXT NOT NULL,
    title               TEXT,
    subtitle            TEXT,
    facts               TEXT NOT NULL,
    narrative           TEXT,
    concepts            TEXT NOT NULL,
    files_read          TEXT NOT NULL,
    files_modified      TEXT NOT NULL,
    prompt_number       INTEGER,
    discovery_tokens    INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_summaries (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_session_id   TEXT NOT NULL,
    project             TEXT NOT NULL,
    request             TEXT,
    investigated        TEXT,
    learned             TEXT,
    completed           TEXT,
    next_steps          TEXT,
    notes               TEXT,
    prompt_number       INTEGER,
    discovery_tokens    INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_session_status ON pending_messages(session_db_id, status);
CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_messages(status);
CREATE INDEX IF NOT EXISTS idx_prompts_content ON user_prompts(content_session_id);
CREATE INDEX IF NOT EXISTS idx_observations_memory ON observations(memory_session_id);
CREATE INDEX IF NOT EXISTS idx_summaries_memory ON session_summaries(memory_session_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
