//! Stateless-to-stateful fallback chain.

use std::sync::Arc;

use tracing::{info, warn};

use crate::models::active_session::ActiveSession;
use crate::models::session::AgentKind;
use crate::persistence::pending_repo::PendingMessageStore;
use crate::{AppError, Result};

use super::{AgentFuture, BackendAgent};

/// Runs a stateless primary and hands the session to a stateful fallback
/// when the primary fails with an error it considers recoverable.
pub struct FallbackAgent {
    primary: Arc<dyn BackendAgent>,
    fallback: Arc<dyn BackendAgent>,
    store: PendingMessageStore,
}

impl FallbackAgent {
    /// Chain `primary` to `fallback`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` unless `primary` is stateless and
    /// `fallback` is stateful.
    pub fn new(
        primary: Arc<dyn BackendAgent>,
        fallback: Arc<dyn BackendAgent>,
        store: PendingMessageStore,
    ) -> Result<Self> {
        if primary.is_stateful() {
            return Err(AppError::Config(format!(
                "fallback primary must be stateless, got {}",
                primary.kind()
            )));
        }
        if !fallback.is_stateful() {
            return Err(AppError::Config(format!(
                "fallback target must be stateful, got {}",
                fallback.kind()
            )));
        }
        Ok(Self {
            primary,
            fallback,
            store,
        })
    }

    async fn run(&self, session: Arc<ActiveSession>) -> Result<()> {
        let session_db_id = session.session_db_id();
        session.state().await.current_provider = Some(self.primary.kind());

        let err = match self.primary.start_session(Arc::clone(&session)).await {
            Ok(()) => return Ok(()),
            Err(AppError::Cancelled) => return Err(AppError::Cancelled),
            Err(err) if self.primary.should_fall_back(&err) => err,
            Err(err) => return Err(err),
        };

        warn!(
            session_db_id,
            primary = %self.primary.kind(),
            fallback = %self.fallback.kind(),
            %err,
            "primary backend failed, falling back"
        );

        // Messages the primary claimed go back to the queue untouched.
        let in_flight = std::mem::take(&mut session.state().await.in_flight);
        for message_id in &in_flight {
            self.store.release(*message_id).await?;
        }
        {
            let mut state = session.state().await;
            state.earliest_pending_timestamp = None;
            state.current_provider = Some(self.fallback.kind());
        }
        if !in_flight.is_empty() {
            info!(session_db_id, released = in_flight.len(), "released in-flight messages");
        }

        self.fallback.start_session(session).await
    }
}

impl BackendAgent for FallbackAgent {
    fn kind(&self) -> AgentKind {
        self.primary.kind()
    }

    fn is_stateful(&self) -> bool {
        false
    }

    fn start_session(&self, session: Arc<ActiveSession>) -> AgentFuture<'_> {
        Box::pin(self.run(session))
    }
}
