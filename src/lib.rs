#![forbid(unsafe_code)]

//! Durable per-session observation queue with pluggable AI backends.

pub mod agents;
pub mod config;
pub mod errors;
pub mod http;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod queue;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
