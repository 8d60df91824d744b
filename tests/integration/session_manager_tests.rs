//! Session lifecycle: initialization, queue depth, teardown and status.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use memory_worker::agents::{AgentContext, AgentFuture, BackendAgent};
use memory_worker::models::active_session::ActiveSession;
use memory_worker::models::identity::mint_synthetic_id;
use memory_worker::models::message::MessageStatus;
use memory_worker::models::session::AgentKind;
use memory_worker::{AppError, Result};

use super::test_helpers::{read_observation, Harness, OBSERVATION_REPLY};

/// Backend that holds claimed messages until cancelled while `hold` is set,
/// then takes a while to unwind. Records every claim and the peak number of
/// concurrently running instances.
struct HoldingAgent {
    ctx: AgentContext,
    hold: Arc<AtomicBool>,
    claims: Arc<StdMutex<Vec<i64>>>,
    running: AtomicUsize,
    peak: Arc<AtomicUsize>,
}

impl HoldingAgent {
    async fn run(&self, session: Arc<ActiveSession>) -> Result<()> {
        let mut messages = self.ctx.messages(Arc::clone(&session));
        while let Some(message) = messages.next().await? {
            self.claims.lock().expect("lock").push(message.id);
            if self.hold.load(Ordering::SeqCst) {
                session.cancel_token().cancelled().await;
                tokio::time::sleep(Duration::from_millis(300)).await;
                return Err(AppError::Cancelled);
            }
            self.ctx
                .responses
                .process(&session, Some(&message), OBSERVATION_REPLY, 0)
                .await?;
        }
        Ok(())
    }
}

impl BackendAgent for HoldingAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Gemini
    }

    fn start_session(&self, session: Arc<ActiveSession>) -> AgentFuture<'_> {
        Box::pin(async move {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let result = self.run(session).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }
}

#[tokio::test]
async fn initialize_unknown_session_is_not_found() {
    let h = Harness::new().await;
    let err = h
        .manager()
        .initialize(999, None, None)
        .await
        .expect_err("unknown session");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn initialize_reuses_the_live_session() {
    let h = Harness::new().await;
    let manager = h.manager();
    let (id, content) = h.session_row().await;

    let first = manager.initialize(id, None, None).await.expect("initialize");
    assert_eq!(first.content_session_id(), content);
    assert_eq!(first.state().await.user_prompt, "fix the queue");

    let second = manager
        .initialize(id, Some("now add tests"), Some(2))
        .await
        .expect("initialize");
    assert!(Arc::ptr_eq(&first, &second));

    let state = second.state().await;
    assert_eq!(state.user_prompt, "now add tests");
    assert_eq!(state.last_prompt_number, 2);
    assert_eq!(manager.active_session_count().await, 1);
}

#[tokio::test]
async fn new_session_starts_from_latest_prompt() {
    let h = Harness::new().await;
    let (id, content) = h.session_row().await;
    h.sessions.record_user_prompt(&content, "one").await.expect("prompt");
    h.sessions.record_user_prompt(&content, "two").await.expect("prompt");

    let session = h.manager().initialize(id, None, None).await.expect("initialize");
    let state = session.state().await;
    assert_eq!(state.user_prompt, "two");
    assert_eq!(state.last_prompt_number, 2);
    assert_eq!(state.cumulative_input_tokens, 0);
    assert!(state.conversation.is_empty());
}

#[tokio::test]
async fn provider_issued_ids_are_dropped_on_restart() {
    let h = Harness::new().await;
    let (id, _) = h.session_row().await;
    h.sessions
        .update_memory_session_id(id, "5a1c0f3e-claude-conversation")
        .await
        .expect("update");

    let session = h.manager().initialize(id, None, None).await.expect("initialize");
    assert_eq!(session.state().await.memory_session_id, None);
}

#[tokio::test]
async fn synthetic_ids_survive_restart() {
    let h = Harness::new().await;
    let (id, content) = h.session_row().await;
    let synthetic = mint_synthetic_id(AgentKind::OpenRouter, &content);
    h.sessions
        .update_memory_session_id(id, &synthetic)
        .await
        .expect("update");

    let session = h.manager().initialize(id, None, None).await.expect("initialize");
    assert_eq!(session.state().await.memory_session_id, Some(synthetic));
}

#[tokio::test]
async fn bare_uuid_is_dropped_on_restart() {
    let h = Harness::new().await;
    let (id, _) = h.session_row().await;
    h.sessions
        .update_memory_session_id(id, "550e8400-e29b-41d4-a716-446655440000")
        .await
        .expect("update");

    let session = h.manager().initialize(id, None, None).await.expect("initialize");
    assert_eq!(session.state().await.memory_session_id, None);
}

#[tokio::test]
async fn malformed_synthetic_ids_are_dropped_on_restart() {
    let h = Harness::new().await;
    let (id, content) = h.session_row().await;
    let other = mint_synthetic_id(AgentKind::Gemini, "0971eaa4-abcd-4567-8901-234567890abc");
    let padded = format!(" {}", mint_synthetic_id(AgentKind::Gemini, &content));

    for stored in [
        "gemini-NOTAUUID-550e8400-e29b-41d4-a716-446655440000",
        other.as_str(),
        padded.as_str(),
        "",
    ] {
        h.sessions
            .update_memory_session_id(id, stored)
            .await
            .expect("update");
        let manager = h.manager();
        let session = manager.initialize(id, None, None).await.expect("initialize");
        assert_eq!(session.state().await.memory_session_id, None, "{stored:?}");
        manager.teardown(id).await;
    }
}

#[tokio::test]
async fn whitespace_id_is_treated_as_absent() {
    let h = Harness::new().await;
    let (id, _) = h.session_row().await;
    h.sessions.update_memory_session_id(id, "   ").await.expect("update");

    let session = h.manager().initialize(id, None, None).await.expect("initialize");
    assert_eq!(session.state().await.memory_session_id, None);
}

#[tokio::test]
async fn queue_depth_sums_live_sessions_and_counts_claims() {
    let h = Harness::new().await;
    let manager = h.manager();
    let (a, _) = h.session_row().await;
    let (b, _) = h.session_row().await;

    for path in ["a.rs", "b.rs"] {
        manager
            .enqueue_observation(a, read_observation(path, Some(1)))
            .await
            .expect("enqueue");
    }
    manager
        .enqueue_observation(b, read_observation("c.rs", Some(1)))
        .await
        .expect("enqueue");
    assert_eq!(manager.total_queue_depth().await.expect("depth"), 3);

    h.store.claim_next(a).await.expect("claim").expect("message");
    assert_eq!(manager.total_queue_depth().await.expect("depth"), 3);
    assert!(manager.is_any_session_processing().await.expect("processing"));

    manager.teardown(b).await;
    assert_eq!(manager.total_queue_depth().await.expect("depth"), 2);
}

#[tokio::test]
async fn enqueue_to_unknown_session_persists_nothing() {
    let h = Harness::new().await;
    let err = h
        .manager()
        .enqueue_summarize(12345, None)
        .await
        .expect_err("unknown session");
    assert!(matches!(err, AppError::NotFound(_)));
    assert!(h.store.list_queue().await.expect("list").is_empty());
}

#[tokio::test]
async fn teardown_is_idempotent() {
    let h = Harness::new().await;
    let manager = h.manager();
    let (id, _) = h.session_row().await;
    let session = manager.initialize(id, None, None).await.expect("initialize");

    manager.teardown(id).await;
    assert!(session.is_cancelled());
    assert!(manager.get_session(id).await.is_none());
    assert!(manager.notifier(id).await.is_none());

    manager.teardown(id).await;
    manager.teardown(777).await;
    assert_eq!(manager.active_session_count().await, 0);
}

#[tokio::test]
async fn torn_down_session_is_replaced_on_next_enqueue() {
    let h = Harness::new().await;
    let manager = h.manager();
    let (id, _) = h.session_row().await;

    let old = manager.initialize(id, None, None).await.expect("initialize");
    manager.teardown(id).await;

    manager
        .enqueue_observation(id, read_observation("late.rs", None))
        .await
        .expect("enqueue");
    let current = manager.get_session(id).await.expect("live session");
    assert!(!Arc::ptr_eq(&old, &current));
    assert!(!current.is_cancelled());
}

#[tokio::test]
async fn teardown_returns_in_flight_messages_to_the_queue() {
    let h = Harness::new().await;
    let manager = h.manager();
    let (id, _) = h.session_row().await;
    let message_id = manager
        .enqueue_observation(id, read_observation("a.rs", Some(1)))
        .await
        .expect("enqueue");

    let session = manager.get_session(id).await.expect("live session");
    let mut messages = h.ctx().messages(Arc::clone(&session));
    let claimed = messages.next().await.expect("next").expect("message");
    assert_eq!(claimed.id, message_id);
    assert_eq!(session.state().await.in_flight, vec![message_id]);

    manager.teardown(id).await;

    let queued = h.store.list_queue().await.expect("list");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].status, MessageStatus::Pending);
    assert_eq!(queued[0].retry_count, 1);
    assert!(session.state().await.in_flight.is_empty());
}

#[tokio::test]
async fn repeated_teardown_abandons_a_message_at_the_retry_ceiling() {
    let h = Harness::new().await;
    let manager = h.manager();
    let (id, _) = h.session_row().await;
    manager
        .enqueue_observation(id, read_observation("hangs.rs", None))
        .await
        .expect("enqueue");

    let max_retries = h.config.queue.max_retries;
    for _ in 0..=max_retries {
        let session = manager.initialize(id, None, None).await.expect("initialize");
        h.ctx()
            .messages(session)
            .next()
            .await
            .expect("next")
            .expect("message");
        manager.teardown(id).await;
    }

    let queued = h.store.list_queue().await.expect("list");
    assert_eq!(queued[0].status, MessageStatus::Failed);
    assert_eq!(queued[0].retry_count, max_retries);
}

#[tokio::test]
async fn enqueue_during_teardown_keeps_fifo_and_a_single_worker() {
    let h = Harness::new().await;
    let hold = Arc::new(AtomicBool::new(true));
    let claims = Arc::new(StdMutex::new(Vec::new()));
    let peak = Arc::new(AtomicUsize::new(0));
    let agent = HoldingAgent {
        ctx: h.ctx(),
        hold: Arc::clone(&hold),
        claims: Arc::clone(&claims),
        running: AtomicUsize::new(0),
        peak: Arc::clone(&peak),
    };
    let manager = h.manager().with_agent(Arc::new(agent));
    let (id, _) = h.session_row().await;

    let m1 = manager
        .enqueue_observation(id, read_observation("one.rs", Some(1)))
        .await
        .expect("enqueue");
    let m2 = manager
        .enqueue_observation(id, read_observation("two.rs", Some(1)))
        .await
        .expect("enqueue");

    tokio::time::timeout(Duration::from_secs(5), async {
        while claims.lock().expect("lock").is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first message claimed");

    let teardown = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.teardown(id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    hold.store(false, Ordering::SeqCst);

    let m3 = manager
        .enqueue_observation(id, read_observation("three.rs", Some(1)))
        .await
        .expect("enqueue");
    teardown.await.expect("teardown joins");

    h.wait_for_drain(id).await;

    assert_eq!(*claims.lock().expect("lock"), vec![m1, m1, m2, m3]);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(h.store.list_queue().await.expect("list").is_empty());
}

#[tokio::test]
async fn complete_marks_the_row_completed() {
    let h = Harness::new().await;
    let manager = h.manager();
    let (id, _) = h.session_row().await;
    manager.initialize(id, None, None).await.expect("initialize");

    manager.complete(id).await.expect("complete");

    let record = h.sessions.get_by_id(id).await.expect("fetch").expect("row");
    assert_eq!(
        record.status,
        memory_worker::models::session::SessionStatus::Completed
    );
    assert_eq!(manager.active_session_count().await, 0);
}

#[tokio::test]
async fn status_is_broadcast_after_enqueue_and_teardown() {
    let h = Harness::new().await;
    let manager = h.manager();
    let mut status = manager.subscribe_status();
    let (id, _) = h.session_row().await;

    manager
        .enqueue_observation(id, read_observation("a.rs", None))
        .await
        .expect("enqueue");
    let after_enqueue = status.recv().await.expect("status");
    assert_eq!(after_enqueue.active_sessions, 1);
    assert_eq!(after_enqueue.queue_depth, 1);
    assert!(after_enqueue.processing);

    manager.teardown(id).await;
    let after_teardown = status.recv().await.expect("status");
    assert_eq!(after_teardown.active_sessions, 0);
    assert_eq!(after_teardown.queue_depth, 0);
    assert!(!after_teardown.processing);
}

#[tokio::test]
async fn shutdown_all_tears_down_every_session() {
    let h = Harness::new().await;
    let manager = h.manager();
    for _ in 0..3 {
        let (id, _) = h.session_row().await;
        manager.initialize(id, None, None).await.expect("initialize");
    }
    assert_eq!(manager.active_session_count().await, 3);

    manager.shutdown_all().await;
    assert_eq!(manager.active_session_count().await, 0);
}
