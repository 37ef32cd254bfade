//! Liveness, session and administration routes.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::api::{AppState, Result, SessionUser};
use crate::{ResetReport, Status};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(|| async { "Tally Sync" }))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/session", post(session_handler))
        .route("/admin/reset", post(reset_handler))
}

/// Liveness plus a one-line summary of the local queue.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    ready: bool,
    /// Operations still waiting for the remote, across both queues.
    pending: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    ready: bool,
    /// Whether this request opened the gate.
    opened: bool,
}

/// GET /health - answers while offline; `pending` is the combined queue depth.
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.tally.status();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        ready: status.ready,
        pending: status.pending_stores + status.pending_payments,
    })
}

/// GET /status
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(state.tally.status())
}

/// POST /session - mark the client authenticated and connected.
async fn session_handler(
    State(state): State<AppState>,
    _user: SessionUser,
) -> Json<SessionResponse> {
    let opened = state.tally.authenticate();
    Json(SessionResponse {
        ready: state.tally.is_ready(),
        opened,
    })
}

/// POST /admin/reset - delete every remote document of this namespace.
async fn reset_handler(
    State(state): State<AppState>,
    _user: SessionUser,
) -> Result<Json<ResetReport>> {
    let report = state.tally.admin_reset().await?;
    tracing::warn!(
        stores = report.stores,
        transactions = report.transactions,
        "Remote collections reset"
    );
    Ok(Json(report))
}
