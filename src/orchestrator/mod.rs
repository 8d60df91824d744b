//! Session orchestration modules.
//!
//! Covers the live-session registry and lifecycle, and supervision of
//! backend subprocesses.

pub mod process_reaper;
pub mod process_registry;
pub mod session_manager;
