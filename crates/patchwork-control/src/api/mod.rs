//! HTTP API for the control service.
//!
//! Provides endpoints for:
//! - Overlay management and overlay content
//! - Links at domain and server-group scope
//! - Selective redeploys of linked deployments
//! - Health and readiness checks
//! - Prometheus metrics

mod links;
mod overlays;

use std::fmt::Write as _;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use tracing::warn;

use crate::error::{ErrorKind, LocationFailure, OverlayError};
use crate::overlay::OverlayManager;

pub use links::{LinkQuery, LinksResponse, RedeployLinksRequest, RemoveLinkResponse, UpdateLinkRequest};
pub use overlays::{CreateOverlayRequest, RemoveOverlayQuery, RemoveOverlayResponse};

/// Default request body limit when none is configured.
pub const DEFAULT_BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Shared application state for the control service.
#[derive(Clone)]
pub struct AppState {
    /// Overlay manager every handler delegates to.
    pub manager: Arc<OverlayManager>,
    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
}

impl AppState {
    /// Create state with the default body limit.
    #[must_use]
    pub fn new(manager: Arc<OverlayManager>) -> Self {
        Self {
            manager,
            max_body_bytes: DEFAULT_BODY_LIMIT,
        }
    }
}

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    let body_limit = state.max_body_bytes;

    Router::new()
        // Health endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        // Overlays
        .route(
            "/overlays",
            get(overlays::list_overlays).post(overlays::create_overlay),
        )
        .route(
            "/overlays/{overlay}",
            get(overlays::get_overlay).delete(overlays::remove_overlay),
        )
        .route(
            "/overlays/{overlay}/content/{*filename}",
            get(overlays::get_content)
                .put(overlays::put_content)
                .delete(overlays::remove_content),
        )
        // Domain links
        .route("/overlays/{overlay}/links", get(links::list_domain_links))
        .route(
            "/overlays/{overlay}/links/{deployment}",
            put(links::add_domain_link)
                .patch(links::update_domain_link)
                .delete(links::remove_domain_link),
        )
        .route(
            "/overlays/{overlay}/redeploy-links",
            post(links::redeploy_domain_links),
        )
        // Server-group links
        .route(
            "/server-groups/{group}/overlays/{overlay}/links",
            get(links::list_group_links),
        )
        .route(
            "/server-groups/{group}/overlays/{overlay}/links/{deployment}",
            put(links::add_group_link)
                .patch(links::update_group_link)
                .delete(links::remove_group_link),
        )
        .route(
            "/server-groups/{group}/overlays/{overlay}/redeploy-links",
            post(links::redeploy_group_links),
        )
        // Content maintenance
        .route("/content/reclaim", post(overlays::reclaim_content))
        // Metrics
        .route("/metrics", get(metrics))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Machine-checkable error kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub error: String,
    /// Failed commands, for redeploy errors.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<LocationFailure>,
}

/// Error half of every handler result.
pub(crate) type ApiError = (StatusCode, Json<ErrorResponse>);

/// Convert an [`OverlayError`] into a status and JSON body.
pub(crate) fn error_response(err: OverlayError) -> ApiError {
    let kind = err.kind();
    let status = error_to_status(kind);
    if status.is_server_error() {
        warn!(error = %err, kind = %kind, "request failed");
    }

    (
        status,
        Json(ErrorResponse {
            kind,
            error: err.to_string(),
            failures: err.failures().to_vec(),
        }),
    )
}

const fn error_to_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound | ErrorKind::UnknownOverlay => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists | ErrorKind::HasActiveLinks => StatusCode::CONFLICT,
        ErrorKind::NotLinked | ErrorKind::InvalidName => StatusCode::BAD_REQUEST,
        ErrorKind::LocationFailure => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Storage | ErrorKind::Config | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Health check endpoint.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// Readiness check endpoint.
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    match state.manager.ready().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                overlays: stats.overlays,
            }),
        ),
        Err(e) => {
            warn!(error = %e, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadyResponse {
                    ready: false,
                    overlays: 0,
                }),
            )
        }
    }
}

/// Metrics endpoint.
async fn metrics(State(state): State<AppState>) -> String {
    let mut output = String::new();

    let Ok(stats) = state.manager.stats() else {
        return output;
    };

    let gauges = [
        (
            "patchwork_overlays_total",
            "Number of overlays",
            stats.overlays,
        ),
        (
            "patchwork_links_total",
            "Number of overlay links, enabled or not",
            stats.links,
        ),
        (
            "patchwork_orphaned_content",
            "Stored content objects awaiting reclaim",
            stats.orphaned_content,
        ),
    ];

    for (name, help, value) in gauges {
        let _ = writeln!(output, "# HELP {name} {help}");
        let _ = writeln!(output, "# TYPE {name} gauge");
        let _ = writeln!(output, "{name} {value}");
    }

    output
}

/// Health response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness response.
#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
    overlays: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::content::ContentStore;
    use crate::executor::{MockExecutor, RedeployExecutor};
    use crate::membership::StaticMembership;
    use crate::store::MemoryStore;
    use crate::types::{DeploymentInfo, Location};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    fn make_app() -> (Router, Arc<MockExecutor>) {
        let executor = Arc::new(MockExecutor::new());
        let main_one = Location::new("master", "main-one");
        executor
            .deploy_base(
                &main_one,
                "main-deployment.jar",
                [(
                    "service.properties".to_owned(),
                    bytes::Bytes::from_static(b"service=is new"),
                )],
            )
            .unwrap();

        let resolver = StaticMembership::new().with_group(
            "main-server-group",
            vec![main_one],
            vec![DeploymentInfo {
                name: "main-deployment.jar".to_owned(),
                runtime_name: "main-deployment.jar".to_owned(),
                enabled: true,
                base_content: None,
            }],
        );

        let manager = OverlayManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ContentStore::in_memory()),
            Arc::new(resolver),
            Arc::clone(&executor) as Arc<dyn RedeployExecutor>,
            Duration::from_secs(5),
        );

        (router(AppState::new(Arc::new(manager))), executor)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Body) -> (StatusCode, Vec<u8>) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    fn json(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let (app, _) = make_app();
        let (status, body) = send(&app, Method::GET, "/health", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["status"], "healthy");
    }

    #[tokio::test]
    async fn ready_endpoint() {
        let (app, _) = make_app();
        let (status, body) = send(&app, Method::GET, "/ready", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["ready"], true);
    }

    #[tokio::test]
    async fn metrics_endpoint() {
        let (app, _) = make_app();
        send(
            &app,
            Method::POST,
            "/overlays",
            Body::from(r#"{"name":"test-overlay"}"#),
        )
        .await;

        let (status, body) = send(&app, Method::GET, "/metrics", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("patchwork_overlays_total 1"), "{text}");
        assert!(text.contains("# TYPE patchwork_links_total gauge"), "{text}");
    }

    #[tokio::test]
    async fn overlay_lifecycle() {
        let (app, _) = make_app();

        let (status, _) = send(
            &app,
            Method::POST,
            "/overlays",
            Body::from(r#"{"name":"test-overlay"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(
            &app,
            Method::POST,
            "/overlays",
            Body::from(r#"{"name":"test-overlay"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json(&body)["kind"], "already_exists");

        let (status, body) = send(
            &app,
            Method::PUT,
            "/overlays/test-overlay/content/service.properties",
            Body::from("service=is added"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["filename"], "service.properties");

        let (status, body) = send(
            &app,
            Method::GET,
            "/overlays/test-overlay/content/service.properties",
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"service=is added");

        let (status, body) = send(&app, Method::GET, "/overlays/test-overlay", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["generation"], 1);

        let (status, body) = send(&app, Method::GET, "/overlays", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body).as_array().unwrap().len(), 1);

        let (status, _) = send(
            &app,
            Method::DELETE,
            "/overlays/test-overlay/content/service.properties",
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&app, Method::DELETE, "/overlays/test-overlay", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, Method::GET, "/overlays/test-overlay", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body)["kind"], "not_found");
    }

    #[tokio::test]
    async fn invalid_overlay_name_is_bad_request() {
        let (app, _) = make_app();
        let (status, body) = send(
            &app,
            Method::POST,
            "/overlays",
            Body::from(r#"{"name":"../escape"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["kind"], "invalid_name");
    }

    #[tokio::test]
    async fn link_and_redeploy() {
        let (app, executor) = make_app();
        send(
            &app,
            Method::POST,
            "/overlays",
            Body::from(r#"{"name":"test-overlay"}"#),
        )
        .await;
        send(
            &app,
            Method::PUT,
            "/overlays/test-overlay/content/service.properties",
            Body::from("service=is added"),
        )
        .await;

        let (status, body) = send(
            &app,
            Method::PUT,
            "/server-groups/main-server-group/overlays/test-overlay/links/main-deployment.jar",
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["enabled"], true);

        let (status, body) = send(
            &app,
            Method::GET,
            "/overlays/test-overlay/links",
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["deployments"], serde_json::json!(["main-deployment.jar"]));

        let (status, body) = send(
            &app,
            Method::POST,
            "/server-groups/main-server-group/overlays/test-overlay/redeploy-links",
            Body::from(r#"{"deployments":["main-deployment.jar"]}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["completed"].as_array().unwrap().len(), 1);

        let running = executor
            .running_content(&Location::new("master", "main-one"), "main-deployment.jar")
            .unwrap()
            .unwrap();
        assert_eq!(
            running.get("service.properties").map(|b| &b[..]),
            Some(&b"service=is added"[..])
        );
    }

    #[tokio::test]
    async fn redeploy_of_unlinked_deployment_is_rejected() {
        let (app, executor) = make_app();
        send(
            &app,
            Method::POST,
            "/overlays",
            Body::from(r#"{"name":"test-overlay"}"#),
        )
        .await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/server-groups/main-server-group/overlays/test-overlay/redeploy-links",
            Body::from(r#"{"deployments":["main-deployment.jar"]}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["kind"], "not_linked");
        assert!(executor.applied().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_redeploy_reports_locations() {
        let (app, executor) = make_app();
        send(
            &app,
            Method::POST,
            "/overlays",
            Body::from(r#"{"name":"test-overlay"}"#),
        )
        .await;
        send(
            &app,
            Method::PUT,
            "/server-groups/main-server-group/overlays/test-overlay/links/main-deployment.jar",
            Body::empty(),
        )
        .await;
        executor
            .fail_at(&Location::new("master", "main-one"), "server restarting")
            .unwrap();

        let (status, body) = send(
            &app,
            Method::POST,
            "/overlays/test-overlay/redeploy-links",
            Body::from("{}"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let body = json(&body);
        assert_eq!(body["kind"], "location_failure");
        assert_eq!(body["failures"][0]["location"]["server"], "main-one");
    }

    #[tokio::test]
    async fn disabled_link_is_hidden_from_list() {
        let (app, _) = make_app();
        send(
            &app,
            Method::POST,
            "/overlays",
            Body::from(r#"{"name":"test-overlay"}"#),
        )
        .await;
        send(
            &app,
            Method::PUT,
            "/overlays/test-overlay/links/main-deployment.jar",
            Body::empty(),
        )
        .await;

        let (status, body) = send(
            &app,
            Method::PATCH,
            "/overlays/test-overlay/links/main-deployment.jar",
            Body::from(r#"{"enabled":false}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["enabled"], false);

        let (_, body) = send(
            &app,
            Method::GET,
            "/overlays/test-overlay/links",
            Body::empty(),
        )
        .await;
        let body = json(&body);
        assert!(body["deployments"].as_array().unwrap().is_empty());
        assert_eq!(body["links"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_link_with_redeploy_returns_report() {
        let (app, _) = make_app();
        send(
            &app,
            Method::POST,
            "/overlays",
            Body::from(r#"{"name":"test-overlay"}"#),
        )
        .await;
        send(
            &app,
            Method::PUT,
            "/server-groups/main-server-group/overlays/test-overlay/links/main-deployment.jar",
            Body::empty(),
        )
        .await;

        let (status, body) = send(
            &app,
            Method::DELETE,
            "/server-groups/main-server-group/overlays/test-overlay/links/main-deployment.jar?redeploy_affected=true",
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["report"]["base_content"], true);

        let (status, _) = send(
            &app,
            Method::DELETE,
            "/server-groups/main-server-group/overlays/test-overlay/links/main-deployment.jar",
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
