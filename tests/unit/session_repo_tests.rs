use std::sync::Arc;

use memory_worker::models::session::SessionStatus;
use memory_worker::persistence::{db, session_repo::SessionRepo};
use memory_worker::AppError;

async fn repo() -> SessionRepo {
    let db = db::connect_memory().await.expect("db connect");
    SessionRepo::new(Arc::new(db))
}

#[tokio::test]
async fn create_or_get_is_idempotent() {
    let repo = repo().await;

    let created = repo
        .create_or_get("content-1", "", "first prompt")
        .await
        .expect("create");
    assert_eq!(created.status, SessionStatus::Active);
    assert_eq!(created.memory_session_id, None);

    let again = repo
        .create_or_get("content-1", "my-project", "second prompt")
        .await
        .expect("get");
    assert_eq!(again.id, created.id);
    assert_eq!(again.user_prompt, "first prompt");
    assert_eq!(again.project, "my-project");

    let blank = repo
        .create_or_get("content-1", "", "third prompt")
        .await
        .expect("get");
    assert_eq!(blank.project, "my-project");
}

#[tokio::test]
async fn memory_session_id_round_trip() {
    let repo = repo().await;
    let session = repo.create_or_get("content-1", "p", "prompt").await.expect("create");

    repo.update_memory_session_id(session.id, "claude-abc")
        .await
        .expect("update");

    let fetched = repo.get_by_id(session.id).await.expect("fetch").expect("row");
    assert_eq!(fetched.memory_session_id.as_deref(), Some("claude-abc"));
}

#[tokio::test]
async fn updating_unknown_session_is_not_found() {
    let repo = repo().await;
    let err = repo
        .update_memory_session_id(404, "x")
        .await
        .expect_err("unknown session");
    assert!(matches!(err, AppError::NotFound(_)));
    assert!(repo.get_by_id(404).await.expect("fetch").is_none());
}

#[tokio::test]
async fn terminal_status_and_reactivation() {
    let repo = repo().await;
    let session = repo.create_or_get("content-1", "p", "prompt").await.expect("create");

    repo.mark_completed(session.id).await.expect("complete");
    let fetched = repo.get_by_id(session.id).await.expect("fetch").expect("row");
    assert_eq!(fetched.status, SessionStatus::Completed);
    assert!(fetched.completed_at.is_some());

    repo.reactivate(session.id).await.expect("reactivate");
    let fetched = repo.get_by_id(session.id).await.expect("fetch").expect("row");
    assert_eq!(fetched.status, SessionStatus::Active);
    assert_eq!(fetched.completed_at, None);

    repo.mark_failed(session.id).await.expect("fail");
    let fetched = repo.get_by_id(session.id).await.expect("fetch").expect("row");
    assert_eq!(fetched.status, SessionStatus::Failed);
}

#[tokio::test]
async fn prompts_are_numbered_per_content_session() {
    let repo = repo().await;
    assert_eq!(repo.latest_prompt_number("a").await.expect("latest"), 0);

    assert_eq!(repo.record_user_prompt("a", "one").await.expect("record"), 1);
    assert_eq!(repo.record_user_prompt("a", "two").await.expect("record"), 2);
    assert_eq!(repo.record_user_prompt("b", "other").await.expect("record"), 1);

    assert_eq!(repo.latest_prompt_number("a").await.expect("latest"), 2);
    assert_eq!(
        repo.latest_prompt("a").await.expect("latest"),
        Some((2, "two".to_owned()))
    );
}
