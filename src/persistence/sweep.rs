//! Stuck-message sweep for crash recovery.
//!
//! Runs as a background task that returns messages stuck in `processing`
//! beyond the configured grace period to `pending`, abandoning those that
//! have exhausted their retries.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

use super::pending_repo::{PendingMessageStore, SweepReport};
use crate::config::QueueConfig;
use crate::Result;

/// Spawn the periodic stuck-message sweep.
///
/// The first tick fires after one full interval; startup recovery runs its
/// own sweep before workers resume.
#[must_use]
pub fn spawn_sweep_task(
    store: PendingMessageStore,
    config: QueueConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let span = tracing::info_span!("stuck_message_sweep");
    tokio::spawn(
        async move {
            let period = config.sweep_interval();
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("sweep task shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(err) = sweep(&store, &config).await {
                            error!(%err, "stuck-message sweep failed");
                        }
                    }
                }
            }
        }
        .instrument(span),
    )
}

/// Run one sweep pass.
///
/// # Errors
///
/// Returns `AppError::Db` if the reset fails.
pub async fn sweep(store: &PendingMessageStore, config: &QueueConfig) -> Result<SweepReport> {
    let report = store
        .reset_stale_processing(config.stale_threshold(), config.max_retries)
        .await?;
    if report.reset > 0 || report.abandoned > 0 {
        info!(
            reset = report.reset,
            abandoned = report.abandoned,
            "stuck messages recovered"
        );
    }
    Ok(report)
}
