//! Axum router and HTTP handlers for bt-daemon.
//!
//! `build_router` is the single entry point; `main.rs` attaches middleware
//! after this call. Job submission, result queries, and optimization control
//! live outside this crate's scope — this surface is observability only.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tracing::error;

use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/queue/stats", get(queue_stats))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    service: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

async fn healthz(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
            uptime_secs: st.uptime_secs(),
        }),
    )
}

async fn queue_stats(State(st): State<Arc<AppState>>) -> axum::response::Response {
    match st.repo.get_queue_stats(chrono::Utc::now()).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => {
            error!(error = %e, "failed to fetch queue stats");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
