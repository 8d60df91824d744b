//! Persistence layer modules.

pub mod db;
pub mod observation_repo;
pub mod pending_repo;
pub mod schema;
pub mod session_repo;
pub mod sweep;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
