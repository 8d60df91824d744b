//! Background cleanup of subprocess registry entries.
//!
//! Backend subprocesses normally exit at the end of their turn and are
//! removed by their owner. Entries whose owner went away first linger until
//! this task notices the exit and drops them.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::process_registry::ProcessRegistry;

/// Spawn a background task that removes exited subprocesses every `interval`.
#[must_use]
pub fn spawn_process_reaper(
    registry: ProcessRegistry,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("process reaper shutting down");
                    break;
                }
                () = tokio::time::sleep(interval) => {}
            }

            let reaped = registry.reap_exited().await;
            if !reaped.is_empty() {
                debug!(sessions = ?reaped, "reaped exited subprocesses");
            }
        }
    })
}
