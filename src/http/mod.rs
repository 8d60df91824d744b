//! HTTP surface for hooks and status probes.
//!
//! Routes live in [`routes`]; this module binds the listener and maps
//! [`AppError`] onto status codes.

pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::orchestrator::session_manager::SessionManager;
use crate::persistence::pending_repo::PendingMessageStore;
use crate::persistence::session_repo::SessionRepo;
use crate::{AppError, Result};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Live-session lifecycle.
    pub manager: SessionManager,
    /// Session rows and prompts.
    pub sessions: SessionRepo,
    /// Durable job store.
    pub store: PendingMessageStore,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(err = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Serve the API on `127.0.0.1:port` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the listener cannot bind, or `AppError::Io`
/// if the server fails.
pub async fn serve(state: Arc<AppState>, port: u16, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind http on {bind}: {err}")))?;

    info!(%bind, "http api listening");

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("http server error: {err}")))?;

    info!("http api shut down");
    Ok(())
}
