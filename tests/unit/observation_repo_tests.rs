use std::sync::Arc;

use chrono::{Duration, SubsecRound, Utc};

use memory_worker::models::observation::{ParsedObservation, ParsedSummary};
use memory_worker::persistence::db;
use memory_worker::persistence::observation_repo::{ObservationRepo, TurnOutput};

fn observation(title: &str) -> ParsedObservation {
    ParsedObservation {
        kind: "feature".into(),
        title: Some(title.to_owned()),
        subtitle: None,
        facts: vec!["queue rows are deleted on confirm".into()],
        narrative: Some("Added confirm.".into()),
        concepts: vec!["how-it-works".into()],
        files_read: vec!["src/queue.rs".into()],
        files_modified: vec![],
    }
}

#[tokio::test]
async fn stores_observations_and_summary_together() {
    let repo = ObservationRepo::new(Arc::new(db::connect_memory().await.expect("db")));
    let created_at = (Utc::now() - Duration::minutes(10)).trunc_subsecs(3);
    let summary = ParsedSummary {
        request: Some("add a queue".into()),
        completed: Some("queue added".into()),
        ..ParsedSummary::default()
    };

    let stored = repo
        .store_turn(&TurnOutput {
            memory_session_id: "mem-1",
            project: "proj",
            observations: &[observation("first"), observation("second")],
            summary: Some(&summary),
            prompt_number: Some(2),
            discovery_tokens: 120,
            created_at,
        })
        .await
        .expect("store");

    assert_eq!(stored.observation_ids.len(), 2);
    assert!(stored.summary_id.is_some());

    let listed = repo.list_for_session("mem-1").await.expect("list");
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].observation, observation("first"));
    assert_eq!(listed[1].observation.title.as_deref(), Some("second"));
    assert_eq!(listed[0].prompt_number, Some(2));
    assert_eq!(listed[0].discovery_tokens, 120);
    assert_eq!(listed[0].created_at, created_at);
    assert_eq!(listed[0].project, "proj");

    let summaries = repo.summaries_for_session("mem-1").await.expect("summaries");
    assert_eq!(summaries, vec![summary]);
}

#[tokio::test]
async fn empty_turn_stores_nothing() {
    let repo = ObservationRepo::new(Arc::new(db::connect_memory().await.expect("db")));

    let stored = repo
        .store_turn(&TurnOutput {
            memory_session_id: "mem-1",
            project: "proj",
            observations: &[],
            summary: None,
            prompt_number: None,
            discovery_tokens: 0,
            created_at: Utc::now(),
        })
        .await
        .expect("store");

    assert!(stored.observation_ids.is_empty());
    assert_eq!(stored.summary_id, None);
    assert!(repo.list_for_session("mem-1").await.expect("list").is_empty());
    assert!(repo.list_for_session("other").await.expect("list").is_empty());
}
