//! Overlay and overlay content endpoints.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{ContentEntry, OverlayRecord};

use super::{error_response, ApiError, AppState};

/// Request to create an overlay.
#[derive(Debug, Deserialize)]
pub struct CreateOverlayRequest {
    /// Overlay name.
    pub name: String,
}

/// Query parameters for removing an overlay.
#[derive(Debug, Default, Deserialize)]
pub struct RemoveOverlayQuery {
    /// Delete the overlay's links along with it.
    #[serde(default)]
    pub cascade: bool,
}

/// Response for removing an overlay.
#[derive(Debug, Serialize)]
pub struct RemoveOverlayResponse {
    /// Removed overlay name.
    pub name: String,
    /// Links deleted by cascade.
    pub removed_links: usize,
}

#[derive(Debug, Serialize)]
pub(super) struct ReclaimResponse {
    removed: usize,
}

/// Create an empty overlay.
pub(super) async fn create_overlay(
    State(state): State<AppState>,
    Json(request): Json<CreateOverlayRequest>,
) -> Result<(StatusCode, Json<OverlayRecord>), ApiError> {
    let record = state
        .manager
        .add_overlay(&request.name)
        .await
        .map_err(error_response)?;

    info!(overlay = %record.name, "overlay created via API");
    Ok((StatusCode::CREATED, Json(record)))
}

/// List overlays.
pub(super) async fn list_overlays(State(state): State<AppState>) -> Json<Vec<OverlayRecord>> {
    Json(state.manager.list_overlays())
}

/// Describe one overlay.
pub(super) async fn get_overlay(
    State(state): State<AppState>,
    Path(overlay): Path<String>,
) -> Result<Json<OverlayRecord>, ApiError> {
    state
        .manager
        .describe_overlay(&overlay)
        .map(Json)
        .map_err(error_response)
}

/// Remove an overlay.
pub(super) async fn remove_overlay(
    State(state): State<AppState>,
    Path(overlay): Path<String>,
    Query(query): Query<RemoveOverlayQuery>,
) -> Result<Json<RemoveOverlayResponse>, ApiError> {
    let removed_links = state
        .manager
        .remove_overlay(&overlay, query.cascade)
        .await
        .map_err(error_response)?;

    info!(overlay = %overlay, removed_links, "overlay removed via API");
    Ok(Json(RemoveOverlayResponse {
        name: overlay,
        removed_links,
    }))
}

/// Read one file of an overlay as raw bytes.
pub(super) async fn get_content(
    State(state): State<AppState>,
    Path((overlay, filename)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let data = state
        .manager
        .get_content(&overlay, &filename)
        .await
        .map_err(error_response)?;

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    )
        .into_response())
}

/// Insert or replace one file of an overlay from the raw request body.
pub(super) async fn put_content(
    State(state): State<AppState>,
    Path((overlay, filename)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<ContentEntry>, ApiError> {
    state
        .manager
        .put_content(&overlay, &filename, body)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Remove one file from an overlay.
pub(super) async fn remove_content(
    State(state): State<AppState>,
    Path((overlay, filename)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .manager
        .remove_content(&overlay, &filename)
        .await
        .map_err(error_response)?;

    Ok(StatusCode::NO_CONTENT)
}

/// Delete stored content no overlay references.
pub(super) async fn reclaim_content(
    State(state): State<AppState>,
) -> Result<Json<ReclaimResponse>, ApiError> {
    let removed = state
        .manager
        .reclaim_content()
        .await
        .map_err(error_response)?;

    Ok(Json(ReclaimResponse { removed }))
}
