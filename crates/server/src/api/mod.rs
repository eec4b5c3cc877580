//! API handlers, grouped by concern.

pub mod doc;
pub mod health;
pub mod targets;

pub use health::{config_summary, health};
pub use targets::{targets_add, targets_delete, targets_list, targets_reload};

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tracing::warn;

use cartograph_targets::TargetStoreError;

#[derive(Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map a store error to its HTTP status and a JSON body.
pub fn store_error(e: TargetStoreError) -> ApiError {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(error = %e, status = status.as_u16(), "target store request failed");
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}
