//! Health and configuration endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use cartograph_targets::{ListenerPhase, ListenerStatus};

use crate::state::AppState;

#[derive(Serialize, utoipa::ToSchema)]
pub struct ListenerView {
    /// connecting, listening, reconnecting or stopped
    pub phase: String,
    pub reloads: u64,
    pub reconnects: u64,
    /// RFC 3339 timestamp of the last successful reload.
    pub last_reload_at: Option<String>,
    pub last_error: Option<String>,
}

impl From<ListenerStatus> for ListenerView {
    fn from(status: ListenerStatus) -> Self {
        let phase = match status.phase {
            ListenerPhase::Connecting => "connecting",
            ListenerPhase::Listening => "listening",
            ListenerPhase::Reconnecting => "reconnecting",
            ListenerPhase::Stopped => "stopped",
        };
        Self {
            phase: phase.to_string(),
            reloads: status.reloads,
            reconnects: status.reconnects,
            last_reload_at: status.last_reload_at.map(|t| t.to_rfc3339()),
            last_error: status.last_error,
        }
    }
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    /// "ok" while the change listener is subscribed, "degraded" otherwise.
    pub status: String,
    pub version: String,
    pub backend: String,
    pub rules: usize,
    pub listener: ListenerView,
}

/// Server and change-listener health.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Server health", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let listener = state.targets.listener_status();
    let status = if listener.phase == ListenerPhase::Listening {
        "ok"
    } else {
        "degraded"
    };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: state.targets.backend_name().to_string(),
        rules: state.targets.len(),
        listener: listener.into(),
    })
}

/// Active configuration with secrets removed.
#[utoipa::path(
    get,
    path = "/api/config",
    tag = "Health",
    responses(
        (status = 200, description = "Redacted configuration", body = Object)
    )
)]
pub async fn config_summary(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.config.redacted_summary())
}
