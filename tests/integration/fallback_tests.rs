use std::sync::Arc;
use std::time::Duration;

use memory_worker::agents::fallback::FallbackAgent;
use memory_worker::agents::stateless::StatelessAgent;
use memory_worker::agents::{AgentContext, AgentFuture, BackendAgent};
use memory_worker::models::active_session::ActiveSession;
use memory_worker::models::session::{AgentKind, SessionStatus};
use memory_worker::AppError;

use super::test_helpers::{read_observation, Harness, RecordingAgent, ScriptedProvider};

/// Stateless backend that fails immediately with a fixed error.
struct FailingAgent {
    error: fn() -> AppError,
}

impl BackendAgent for FailingAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::OpenRouter
    }

    fn start_session(&self, _session: Arc<ActiveSession>) -> AgentFuture<'_> {
        let error = (self.error)();
        Box::pin(async move { Err(error) })
    }
}

fn long_idle(h: &Harness) -> AgentContext {
    AgentContext {
        idle_timeout: Some(Duration::from_secs(10)),
        ..h.ctx()
    }
}

#[tokio::test]
async fn rate_limit_hands_the_same_session_to_the_fallback() {
    let h = Harness::new().await;
    let primary = StatelessAgent::new(
        ScriptedProvider::new(
            AgentKind::Gemini,
            vec![
                Ok("ready".into()),
                Err(AppError::RateLimited("quota exhausted".into())),
            ],
        ),
        h.ctx(),
    );
    let fallback = RecordingAgent::new(long_idle(&h));
    let received = fallback.received();
    let claimable = fallback.claimable_at_start();

    let agent = FallbackAgent::new(Arc::new(primary), Arc::new(fallback), h.store.clone())
        .expect("valid chain");
    let manager = h.manager().with_agent(Arc::new(agent));
    let (id, _) = h.session_row().await;

    manager
        .enqueue_observation(id, read_observation("a.rs", Some(1)))
        .await
        .expect("enqueue");
    h.wait_for_drain(id).await;

    let live = manager.get_session(id).await.expect("live session");
    let received = received.lock().expect("lock").clone();
    assert_eq!(received.len(), 1);
    assert!(Arc::ptr_eq(&received[0], &live));
    assert_eq!(claimable.lock().expect("lock").as_slice(), &[1]);

    let state = live.snapshot().await;
    assert_eq!(state.current_provider, Some(AgentKind::Claude));
    assert_eq!(state.conversation[1].content, "ready");
    assert!(state.in_flight.is_empty());
    assert!(state.earliest_pending_timestamp.is_none());

    let record = h.sessions.get_by_id(id).await.expect("fetch").expect("row");
    assert_eq!(record.status, SessionStatus::Active);
    let queued = h.store.list_queue().await.expect("list");
    assert!(queued.is_empty());

    manager.teardown(id).await;
}

#[tokio::test]
async fn unrecoverable_error_skips_the_fallback() {
    let h = Harness::new().await;
    let fallback = RecordingAgent::new(h.ctx());
    let received = fallback.received();
    let agent = FallbackAgent::new(
        Arc::new(FailingAgent {
            error: || AppError::Provider("bad request".into()),
        }),
        Arc::new(fallback),
        h.store.clone(),
    )
    .expect("valid chain");

    let (id, _) = h.session_row().await;
    let session = h.manager().initialize(id, None, None).await.expect("initialize");
    let err = agent.start_session(session).await.expect_err("provider error");
    assert!(matches!(err, AppError::Provider(_)));
    assert!(received.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn cancellation_skips_the_fallback() {
    let h = Harness::new().await;
    let fallback = RecordingAgent::new(h.ctx());
    let received = fallback.received();
    let agent = FallbackAgent::new(
        Arc::new(FailingAgent {
            error: || AppError::Cancelled,
        }),
        Arc::new(fallback),
        h.store.clone(),
    )
    .expect("valid chain");

    let (id, _) = h.session_row().await;
    let session = h.manager().initialize(id, None, None).await.expect("initialize");
    let err = agent.start_session(session).await.expect_err("cancelled");
    assert!(err.is_cancelled());
    assert!(received.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn chain_requires_stateless_primary_and_stateful_fallback() {
    let h = Harness::new().await;
    let stateless = || -> Arc<dyn BackendAgent> {
        Arc::new(FailingAgent {
            error: || AppError::Cancelled,
        })
    };
    let stateful = || -> Arc<dyn BackendAgent> { Arc::new(RecordingAgent::new(h.ctx())) };

    assert!(matches!(
        FallbackAgent::new(stateful(), stateful(), h.store.clone()),
        Err(AppError::Config(_))
    ));
    assert!(matches!(
        FallbackAgent::new(stateless(), stateless(), h.store.clone()),
        Err(AppError::Config(_))
    ));
    assert!(FallbackAgent::new(stateless(), stateful(), h.store.clone()).is_ok());
}
