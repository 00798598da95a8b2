//! Link and redeploy endpoints.
//!
//! Every operation exists twice: once at domain scope under `/overlays` and
//! once at server-group scope under `/server-groups/{group}/overlays`.

use std::collections::BTreeSet;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::coordinator::RedeployReport;
use crate::types::{Link, Scope};

use super::{error_response, ApiError, AppState};

/// Request to enable or disable a link.
#[derive(Debug, Deserialize)]
pub struct UpdateLinkRequest {
    /// New enabled flag.
    pub enabled: bool,
}

/// Query parameters for removing a link.
#[derive(Debug, Default, Deserialize)]
pub struct LinkQuery {
    /// Redeploy the deployment with base content after removing the link.
    #[serde(default)]
    pub redeploy_affected: bool,
    /// Per-command timeout override, in seconds.
    pub timeout_secs: Option<u64>,
}

/// Request to redeploy linked deployments.
#[derive(Debug, Default, Deserialize)]
pub struct RedeployLinksRequest {
    /// Deployments to redeploy. Absent means every enabled link in scope.
    #[serde(default)]
    pub deployments: Option<Vec<String>>,
    /// Per-command timeout override, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Links visible from a scope.
#[derive(Debug, Serialize)]
pub struct LinksResponse {
    /// Scope that was queried.
    pub scope: Scope,
    /// Overlay name.
    pub overlay: String,
    /// Deployments with an enabled link.
    pub deployments: BTreeSet<String>,
    /// Every link with its enabled flag.
    pub links: Vec<Link>,
}

/// Response for removing a link.
#[derive(Debug, Serialize)]
pub struct RemoveLinkResponse {
    /// The revert report when `redeploy_affected` was set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RedeployReport>,
}

pub(super) async fn list_domain_links(
    State(state): State<AppState>,
    Path(overlay): Path<String>,
) -> Result<Json<LinksResponse>, ApiError> {
    list_links(&state, Scope::Domain, overlay)
}

pub(super) async fn list_group_links(
    State(state): State<AppState>,
    Path((group, overlay)): Path<(String, String)>,
) -> Result<Json<LinksResponse>, ApiError> {
    list_links(&state, Scope::server_group(group), overlay)
}

pub(super) async fn add_domain_link(
    State(state): State<AppState>,
    Path((overlay, deployment)): Path<(String, String)>,
) -> Result<Json<Link>, ApiError> {
    add_link(&state, Scope::Domain, &overlay, &deployment).await
}

pub(super) async fn add_group_link(
    State(state): State<AppState>,
    Path((group, overlay, deployment)): Path<(String, String, String)>,
) -> Result<Json<Link>, ApiError> {
    add_link(&state, Scope::server_group(group), &overlay, &deployment).await
}

pub(super) async fn update_domain_link(
    State(state): State<AppState>,
    Path((overlay, deployment)): Path<(String, String)>,
    Json(request): Json<UpdateLinkRequest>,
) -> Result<Json<Link>, ApiError> {
    update_link(&state, Scope::Domain, &overlay, &deployment, request.enabled).await
}

pub(super) async fn update_group_link(
    State(state): State<AppState>,
    Path((group, overlay, deployment)): Path<(String, String, String)>,
    Json(request): Json<UpdateLinkRequest>,
) -> Result<Json<Link>, ApiError> {
    update_link(
        &state,
        Scope::server_group(group),
        &overlay,
        &deployment,
        request.enabled,
    )
    .await
}

pub(super) async fn remove_domain_link(
    State(state): State<AppState>,
    Path((overlay, deployment)): Path<(String, String)>,
    Query(query): Query<LinkQuery>,
) -> Result<Json<RemoveLinkResponse>, ApiError> {
    remove_link(&state, Scope::Domain, &overlay, &deployment, query).await
}

pub(super) async fn remove_group_link(
    State(state): State<AppState>,
    Path((group, overlay, deployment)): Path<(String, String, String)>,
    Query(query): Query<LinkQuery>,
) -> Result<Json<RemoveLinkResponse>, ApiError> {
    remove_link(
        &state,
        Scope::server_group(group),
        &overlay,
        &deployment,
        query,
    )
    .await
}

pub(super) async fn redeploy_domain_links(
    State(state): State<AppState>,
    Path(overlay): Path<String>,
    Json(request): Json<RedeployLinksRequest>,
) -> Result<Json<RedeployReport>, ApiError> {
    redeploy_links(&state, Scope::Domain, &overlay, request).await
}

pub(super) async fn redeploy_group_links(
    State(state): State<AppState>,
    Path((group, overlay)): Path<(String, String)>,
    Json(request): Json<RedeployLinksRequest>,
) -> Result<Json<RedeployReport>, ApiError> {
    redeploy_links(&state, Scope::server_group(group), &overlay, request).await
}

fn list_links(
    state: &AppState,
    scope: Scope,
    overlay: String,
) -> Result<Json<LinksResponse>, ApiError> {
    let deployments = state
        .manager
        .list_links(&scope, &overlay)
        .map_err(error_response)?;
    let links = state
        .manager
        .describe_links(&scope, &overlay)
        .map_err(error_response)?;

    Ok(Json(LinksResponse {
        scope,
        overlay,
        deployments,
        links,
    }))
}

async fn add_link(
    state: &AppState,
    scope: Scope,
    overlay: &str,
    deployment: &str,
) -> Result<Json<Link>, ApiError> {
    let link = state
        .manager
        .add_link(&scope, overlay, deployment)
        .await
        .map_err(error_response)?;

    info!(scope = %scope, overlay = %overlay, deployment = %deployment, "link added via API");
    Ok(Json(link))
}

async fn update_link(
    state: &AppState,
    scope: Scope,
    overlay: &str,
    deployment: &str,
    enabled: bool,
) -> Result<Json<Link>, ApiError> {
    state
        .manager
        .set_link_enabled(&scope, overlay, deployment, enabled)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn remove_link(
    state: &AppState,
    scope: Scope,
    overlay: &str,
    deployment: &str,
    query: LinkQuery,
) -> Result<Json<RemoveLinkResponse>, ApiError> {
    let report = state
        .manager
        .remove_link(
            &scope,
            overlay,
            deployment,
            query.redeploy_affected,
            query.timeout_secs.map(Duration::from_secs),
        )
        .await
        .map_err(error_response)?;

    info!(scope = %scope, overlay = %overlay, deployment = %deployment, "link removed via API");
    Ok(Json(RemoveLinkResponse { report }))
}

async fn redeploy_links(
    state: &AppState,
    scope: Scope,
    overlay: &str,
    request: RedeployLinksRequest,
) -> Result<Json<RedeployReport>, ApiError> {
    state
        .manager
        .redeploy_links(
            &scope,
            overlay,
            request.deployments.as_deref(),
            request.timeout_secs.map(Duration::from_secs),
        )
        .await
        .map(Json)
        .map_err(error_response)
}
