//! Route table and handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::models::message::{ObservationInput, PendingMessage};
use crate::orchestrator::session_manager::QueueStatus;
use crate::{AppError, Result};

use super::AppState;

/// Body of `POST /api/sessions/init`.
#[derive(Debug, Deserialize)]
pub struct InitRequest {
    /// Coding-assistant session key.
    pub content_session_id: String,
    /// Project name.
    #[serde(default)]
    pub project: String,
    /// User prompt that started this turn.
    #[serde(default)]
    pub prompt: String,
}

/// Reply to `POST /api/sessions/init`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitResponse {
    /// Database id used by every other route.
    pub session_db_id: i64,
    /// Number of the recorded prompt.
    pub prompt_number: u32,
}

/// Body of `POST /api/sessions/{id}/summarize`.
#[derive(Debug, Default, Deserialize)]
pub struct SummarizeRequest {
    /// Final assistant message of the turn.
    #[serde(default)]
    pub last_assistant_message: Option<String>,
}

/// Reply to an enqueue.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Enqueued {
    /// Queue row id.
    pub message_id: i64,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    #[serde(flatten)]
    queue: QueueStatus,
}

/// Build the router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions/init", post(init_session))
        .route("/api/sessions/{id}/observations", post(enqueue_observation))
        .route("/api/sessions/{id}/summarize", post(enqueue_summarize))
        .route("/api/sessions/{id}/complete", post(complete_session))
        .route("/api/sessions/{id}", delete(delete_session))
        .route("/api/queue", get(list_queue))
        .route("/api/queue/failed", delete(clear_failed))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let queue = state.manager.status().await?;
    Ok(Json(Health {
        status: "ok",
        queue,
    }))
}

async fn init_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InitRequest>,
) -> Result<Json<InitResponse>> {
    if body.content_session_id.trim().is_empty() {
        return Err(AppError::Config("content_session_id is required".into()));
    }

    let record = state
        .sessions
        .create_or_get(&body.content_session_id, &body.project, &body.prompt)
        .await?;
    state.sessions.reactivate(record.id).await?;

    let prompt_number = if body.prompt.is_empty() {
        state
            .sessions
            .latest_prompt_number(&body.content_session_id)
            .await?
    } else {
        state
            .sessions
            .record_user_prompt(&body.content_session_id, &body.prompt)
            .await?
    };

    let prompt = (!body.prompt.is_empty()).then_some(body.prompt.as_str());
    state
        .manager
        .initialize(record.id, prompt, Some(prompt_number).filter(|n| *n > 0))
        .await?;

    Ok(Json(InitResponse {
        session_db_id: record.id,
        prompt_number,
    }))
}

async fn enqueue_observation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(input): Json<ObservationInput>,
) -> Result<impl IntoResponse> {
    let message_id = state.manager.enqueue_observation(id, input).await?;
    Ok((StatusCode::ACCEPTED, Json(Enqueued { message_id })))
}

async fn enqueue_summarize(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    body: Option<Json<SummarizeRequest>>,
) -> Result<impl IntoResponse> {
    let Json(body) = body.unwrap_or_default();
    let message_id = state
        .manager
        .enqueue_summarize(id, body.last_assistant_message)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(Enqueued { message_id })))
}

async fn complete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    if state.sessions.get_by_id(id).await?.is_none() {
        return Err(AppError::NotFound(format!("session {id} not found")));
    }
    state.manager.complete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> StatusCode {
    state.manager.teardown(id).await;
    StatusCode::NO_CONTENT
}

async fn list_queue(State(state): State<Arc<AppState>>) -> Result<Json<Vec<PendingMessage>>> {
    Ok(Json(state.store.list_queue().await?))
}

async fn clear_failed(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let cleared = state.store.clear_failed().await?;
    Ok(Json(serde_json::json!({ "cleared": cleared })))
}
