//! OpenAPI documentation aggregator.
//!
//! Collects all `#[utoipa::path]`-annotated handlers and `ToSchema`-derived
//! types into a single OpenAPI 3.1 spec, served via Scalar UI at `/docs`.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "cartograph API",
        version = "0.1.0",
        description = "Live target-rule store: accept/ignore host rules kept in sync across processes.",
    ),
    tags(
        (name = "Health", description = "Server and change-listener health, redacted configuration"),
        (name = "Targets", description = "Target rule CRUD and manual reload"),
    ),
    paths(
        // Health
        crate::api::health::health,
        crate::api::health::config_summary,
        // Targets
        crate::api::targets::targets_list,
        crate::api::targets::targets_add,
        crate::api::targets::targets_delete,
        crate::api::targets::targets_reload,
    ),
    components(schemas(
        crate::api::ErrorResponse,
        crate::api::health::HealthResponse,
        crate::api::health::ListenerView,
        crate::api::targets::AddTargetRequest,
        crate::api::targets::AddTargetResponse,
        crate::api::targets::ReloadResponse,
    ))
)]
pub struct ApiDoc;
