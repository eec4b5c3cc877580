//! Target rule endpoints.
//!
//! Thin wrappers over `TargetStore`; every read is served from the
//! in-memory cache.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use cartograph_targets::{RuleKind, Snapshot};

use super::{store_error, ApiError, ErrorResponse};
use crate::state::AppState;

#[derive(Deserialize, utoipa::ToSchema)]
pub struct AddTargetRequest {
    /// `true` suppresses matching traffic, `false` collects it.
    #[serde(default)]
    pub ignore: bool,
    pub hosts: Vec<String>,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct AddTargetResponse {
    pub id: String,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct ReloadResponse {
    pub rules: usize,
}

/// All target rules, keyed by id.
#[utoipa::path(
    get,
    path = "/api/targets",
    tag = "Targets",
    responses(
        (status = 200, description = "Map of rule id to {kind, hosts}", body = Object)
    )
)]
pub async fn targets_list(State(state): State<Arc<AppState>>) -> Json<Snapshot> {
    Json(state.targets.get_all())
}

/// Add a target rule.
#[utoipa::path(
    post,
    path = "/api/targets",
    tag = "Targets",
    request_body = AddTargetRequest,
    responses(
        (status = 201, description = "Rule created", body = AddTargetResponse),
        (status = 400, description = "Empty or blank hosts", body = ErrorResponse),
        (status = 500, description = "Write failed", body = ErrorResponse),
        (status = 503, description = "Store closed", body = ErrorResponse)
    )
)]
pub async fn targets_add(
    State(state): State<Arc<AppState>>,
    Json(input): Json<AddTargetRequest>,
) -> Result<(StatusCode, Json<AddTargetResponse>), ApiError> {
    let id = state
        .targets
        .add(RuleKind::from_ignore(input.ignore), input.hosts)
        .await
        .map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(AddTargetResponse { id })))
}

/// Delete a target rule. Unknown ids succeed too.
#[utoipa::path(
    delete,
    path = "/api/targets/{id}",
    tag = "Targets",
    params(("id" = String, Path, description = "Rule ID")),
    responses(
        (status = 204, description = "Rule deleted (or never existed)"),
        (status = 500, description = "Delete failed", body = ErrorResponse),
        (status = 503, description = "Store closed", body = ErrorResponse)
    )
)]
pub async fn targets_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.targets.delete(&id).await.map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Reload every rule from the backing store.
#[utoipa::path(
    post,
    path = "/api/targets/reload",
    tag = "Targets",
    responses(
        (status = 200, description = "Rules reloaded", body = ReloadResponse),
        (status = 500, description = "Reload failed", body = ErrorResponse)
    )
)]
pub async fn targets_reload(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReloadResponse>, ApiError> {
    let rules = state.targets.reload().await.map_err(store_error)?;
    Ok(Json(ReloadResponse { rules }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Method, Request};
    use axum::Router;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use cartograph_core::Config;
    use cartograph_targets::{MemoryBackend, StoreOptions, TargetStore};

    use super::*;
    use crate::router::build_router;

    async fn app() -> (Router, Arc<MemoryBackend>, Arc<TargetStore>) {
        let backend = Arc::new(MemoryBackend::new());
        let options = StoreOptions {
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            ..StoreOptions::default()
        };
        let targets = Arc::new(TargetStore::open(backend.clone(), options).await.unwrap());
        let state = Arc::new(AppState {
            targets: targets.clone(),
            config: Config::for_profile(""),
        });
        (build_router(state), backend, targets)
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn add_list_delete_over_http() {
        let (app, _backend, targets) = app().await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/targets",
            Some(serde_json::json!({ "ignore": true, "hosts": ["test.example.com"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, Method::GET, "/api/targets", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[&id]["kind"], "ignore");
        assert_eq!(body[&id]["hosts"][0], "test.example.com");

        let (status, _) = call(&app, Method::DELETE, &format!("/api/targets/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, body) = call(&app, Method::GET, "/api/targets", None).await;
        assert!(body.get(&id).is_none());

        targets.close().await;
    }

    #[tokio::test]
    async fn empty_hosts_is_bad_request() {
        let (app, backend, targets) = app().await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/targets",
            Some(serde_json::json!({ "hosts": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("at least one"));
        assert_eq!(backend.row_count(), 0);

        targets.close().await;
    }

    #[tokio::test]
    async fn unknown_id_delete_is_no_content() {
        let (app, _backend, targets) = app().await;
        let (status, _) = call(
            &app,
            Method::DELETE,
            "/api/targets/00000000-0000-0000-0000-000000000000",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        targets.close().await;
    }

    #[tokio::test]
    async fn reload_and_health_report_rule_count() {
        let (app, backend, targets) = app().await;
        backend.insert_external(RuleKind::Accept, vec!["a.example.com".into()]);

        let (status, body) = call(&app, Method::POST, "/api/targets/reload", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rules"], 1);

        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["backend"], "memory");
        assert_eq!(body["rules"], 1);
        assert_eq!(body["listener"]["phase"], "listening");

        targets.close().await;
    }

    #[tokio::test]
    async fn writes_after_close_are_unavailable() {
        let (app, _backend, targets) = app().await;
        targets.close().await;

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/targets",
            Some(serde_json::json!({ "hosts": ["late.example.com"] })),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (_, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["listener"]["phase"], "stopped");
    }

    #[tokio::test]
    async fn config_summary_has_no_password() {
        let (app, _backend, targets) = app().await;
        let (status, body) = call(&app, Method::GET, "/api/config", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["postgres"].get("password").is_none());
        assert!(body["targets"]["channel"].is_string());
        targets.close().await;
    }
}
