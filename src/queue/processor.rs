//! Claim loop for a single session.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::models::active_session::ActiveSession;
use crate::models::message::PendingMessage;
use crate::persistence::pending_repo::PendingMessageStore;
use crate::Result;

/// Lazy, cancellable sequence of the messages queued for one session.
pub struct SessionMessages {
    store: PendingMessageStore,
    session: Arc<ActiveSession>,
    idle_timeout: Option<Duration>,
}

impl SessionMessages {
    /// Create the event loop for `session`.
    #[must_use]
    pub fn new(
        store: PendingMessageStore,
        session: Arc<ActiveSession>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            session,
            idle_timeout,
        }
    }

    /// Claim the next message, waiting for one if the queue is empty.
    ///
    /// Returns `Ok(None)` once the session is cancelled or the idle timeout
    /// elapses without new work. A claimed message is recorded as in flight
    /// on the session before it is returned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the claim fails.
    pub async fn next(&mut self) -> Result<Option<PendingMessage>> {
        let session_db_id = self.session.session_db_id();
        loop {
            if self.session.is_cancelled() {
                return Ok(None);
            }

            // Arm the waiter before claiming so an enqueue between the empty
            // claim and the wait is not missed.
            let notify = Arc::clone(self.session.notifier());
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.store.claim_next(session_db_id).await? {
                self.session
                    .state()
                    .await
                    .track_claim(message.id, message.created_at);
                debug!(session_db_id, message_id = message.id, "message claimed");
                return Ok(Some(message));
            }

            let cancel = self.session.cancel_token();
            match self.idle_timeout {
                Some(idle) => {
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(None),
                        () = &mut notified => {}
                        () = tokio::time::sleep(idle) => {
                            debug!(session_db_id, "event loop idle, exiting");
                            return Ok(None);
                        }
                    }
                }
                None => {
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(None),
                        () = &mut notified => {}
                    }
                }
            }
        }
    }

    /// The session this loop serves.
    #[must_use]
    pub fn session(&self) -> &Arc<ActiveSession> {
        &self.session
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &PendingMessageStore {
        &self.store
    }
}
