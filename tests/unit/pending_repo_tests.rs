use std::sync::Arc;
use std::time::Duration;

use memory_worker::models::message::{MessagePayload, MessageStatus, ObservationInput};
use memory_worker::persistence::db;
use memory_worker::persistence::pending_repo::PendingMessageStore;

async fn store() -> PendingMessageStore {
    let db = db::connect_memory().await.expect("db connect");
    PendingMessageStore::new(Arc::new(db))
}

fn observation(tool: &str) -> MessagePayload {
    MessagePayload::Observation(ObservationInput {
        tool_name: tool.to_owned(),
        tool_input: serde_json::json!({ "path": "src/lib.rs" }),
        tool_response: serde_json::json!("ok"),
        prompt_number: Some(1),
        cwd: Some("/repo".into()),
    })
}

#[tokio::test]
async fn in_memory_connect_creates_tables() {
    let pool = db::connect_memory().await.expect("db connect");
    for table in [
        "sdk_sessions",
        "user_prompts",
        "pending_messages",
        "observations",
        "session_summaries",
    ] {
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&pool)
            .await
            .unwrap_or_else(|e| panic!("table '{table}' should be queryable: {e}"));
        assert_eq!(row.0, 0, "table '{table}' should start empty");
    }
}

#[tokio::test]
async fn claims_in_fifo_order_per_session() {
    let store = store().await;
    let first = store.enqueue(1, "c1", &observation("Read")).await.expect("enqueue");
    let other = store.enqueue(2, "c2", &observation("Edit")).await.expect("enqueue");
    let second = store.enqueue(1, "c1", &observation("Bash")).await.expect("enqueue");

    let claimed = store.claim_next(1).await.expect("claim").expect("message");
    assert_eq!(claimed.id, first);
    assert_eq!(claimed.status, MessageStatus::Processing);
    assert_eq!(claimed.payload, observation("Read"));

    let claimed = store.claim_next(1).await.expect("claim").expect("message");
    assert_eq!(claimed.id, second);

    assert!(store.claim_next(1).await.expect("claim").is_none());
    let claimed = store.claim_next(2).await.expect("claim").expect("message");
    assert_eq!(claimed.id, other);
}

#[tokio::test]
async fn claimed_message_is_not_delivered_twice() {
    let store = store().await;
    store.enqueue(1, "c1", &observation("Read")).await.expect("enqueue");

    let (a, b) = tokio::join!(store.claim_next(1), store.claim_next(1));
    let delivered = [a.expect("claim"), b.expect("claim")]
        .into_iter()
        .flatten()
        .count();
    assert_eq!(delivered, 1);
}

#[tokio::test]
async fn confirm_deletes_the_row() {
    let store = store().await;
    let id = store.enqueue(1, "c1", &observation("Read")).await.expect("enqueue");
    store.claim_next(1).await.expect("claim");

    assert!(store.confirm(id).await.expect("confirm"));
    assert!(!store.confirm(id).await.expect("second confirm"));
    assert_eq!(store.pending_count(1).await.expect("count"), 0);
}

#[tokio::test]
async fn pending_count_includes_processing() {
    let store = store().await;
    for tool in ["Read", "Edit", "Bash"] {
        store.enqueue(7, "c7", &observation(tool)).await.expect("enqueue");
    }
    assert_eq!(store.pending_count(7).await.expect("count"), 3);

    store.claim_next(7).await.expect("claim");
    assert_eq!(store.pending_count(7).await.expect("count"), 3);
    assert_eq!(store.claimable_count(7).await.expect("count"), 2);
}

#[tokio::test]
async fn release_keeps_the_retry_count() {
    let store = store().await;
    let id = store.enqueue(1, "c1", &observation("Read")).await.expect("enqueue");
    store.claim_next(1).await.expect("claim");

    store.release(id).await.expect("release");

    let message = store.claim_next(1).await.expect("claim").expect("message");
    assert_eq!(message.id, id);
    assert_eq!(message.retry_count, 0);
}

#[tokio::test]
async fn mark_failed_abandons_at_the_ceiling() {
    let store = store().await;
    let id = store.enqueue(1, "c1", &observation("Read")).await.expect("enqueue");

    for expected_retries in 1..=2 {
        store.claim_next(1).await.expect("claim").expect("message");
        let status = store.mark_failed(id, 2).await.expect("mark failed");
        assert_eq!(status, Some(MessageStatus::Pending));
        let queued = store.list_queue().await.expect("list");
        assert_eq!(queued[0].retry_count, expected_retries);
    }

    store.claim_next(1).await.expect("claim").expect("message");
    let status = store.mark_failed(id, 2).await.expect("mark failed");
    assert_eq!(status, Some(MessageStatus::Failed));
    assert!(store.claim_next(1).await.expect("claim").is_none());
}

#[tokio::test]
async fn mark_failed_ignores_unclaimed_messages() {
    let store = store().await;
    let id = store.enqueue(1, "c1", &observation("Read")).await.expect("enqueue");
    assert_eq!(store.mark_failed(id, 3).await.expect("mark failed"), None);
}

#[tokio::test]
async fn sweep_resets_until_ceiling_then_abandons() {
    let store = store().await;
    let id = store.enqueue(1, "c1", &observation("Read")).await.expect("enqueue");

    for round in 1..=2_u32 {
        store.claim_next(1).await.expect("claim").expect("message");
        let report = store
            .reset_stale_processing(Duration::ZERO, 2)
            .await
            .expect("sweep");
        assert_eq!(report.reset, 1);
        assert_eq!(report.abandoned, 0);
        let queued = store.list_queue().await.expect("list");
        assert_eq!(queued[0].status, MessageStatus::Pending);
        assert_eq!(queued[0].retry_count, round);
    }

    store.claim_next(1).await.expect("claim").expect("message");
    let report = store
        .reset_stale_processing(Duration::ZERO, 2)
        .await
        .expect("sweep");
    assert_eq!(report.reset, 0);
    assert_eq!(report.abandoned, 1);

    let queued = store.list_queue().await.expect("list");
    assert_eq!(queued[0].id, id);
    assert_eq!(queued[0].status, MessageStatus::Failed);
    assert_eq!(store.pending_count(1).await.expect("count"), 0);
}

#[tokio::test]
async fn sweep_leaves_recent_claims_alone() {
    let store = store().await;
    store.enqueue(1, "c1", &observation("Read")).await.expect("enqueue");
    store.claim_next(1).await.expect("claim");

    let report = store
        .reset_stale_processing(Duration::from_secs(300), 3)
        .await
        .expect("sweep");
    assert_eq!(report.reset, 0);
    assert_eq!(report.abandoned, 0);
    assert_eq!(store.claimable_count(1).await.expect("count"), 0);
}

#[tokio::test]
async fn sessions_with_pending_work_oldest_first() {
    let store = store().await;
    store.enqueue(9, "c9", &observation("Read")).await.expect("enqueue");
    store.enqueue(4, "c4", &observation("Read")).await.expect("enqueue");
    store.enqueue(9, "c9", &observation("Edit")).await.expect("enqueue");
    store.enqueue(5, "c5", &observation("Read")).await.expect("enqueue");
    store.claim_next(5).await.expect("claim");

    let ids = store.sessions_with_pending_messages().await.expect("query");
    assert_eq!(ids, vec![9, 4]);
    assert!(store.has_any_pending_work().await.expect("query"));
}

#[tokio::test]
async fn clear_failed_removes_only_abandoned_rows() {
    let store = store().await;
    let doomed = store.enqueue(1, "c1", &observation("Read")).await.expect("enqueue");
    store
        .enqueue(1, "c1", &MessagePayload::Summarize {
            last_assistant_message: Some("done".into()),
        })
        .await
        .expect("enqueue");

    store.claim_next(1).await.expect("claim");
    store.mark_failed(doomed, 0).await.expect("mark failed");

    assert_eq!(store.clear_failed().await.expect("clear"), 1);
    let queued = store.list_queue().await.expect("list");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].payload.message_type(), "summarize");
}

#[tokio::test]
async fn empty_store_has_no_work() {
    let store = store().await;
    assert!(!store.has_any_pending_work().await.expect("query"));
    assert!(store.sessions_with_pending_messages().await.expect("query").is_empty());
    assert!(store.claim_next(1).await.expect("claim").is_none());
}
