//! Snapshot lifecycle handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::error::ExporterResult;
use crate::models::VmSnapshot;
use crate::router::AppState;

/// Query parameters accepted by the snapshot get endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct SnapshotQuery {
    /// Older snapshot to difference against.
    #[serde(rename = "compareTo")]
    pub compare_to: Option<String>,
    /// Whether to coalesce logically contiguous chunks. Defaults to true.
    #[serde(rename = "squashChunks")]
    pub squash_chunks: Option<bool>,
}

/// GET /api/v1/vms/{vmID}/snapshots
pub async fn list_snapshots(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
) -> ExporterResult<Json<Vec<VmSnapshot>>> {
    let snapshots = state.manager.list_snapshots(&vm_id).await?;
    Ok(Json(snapshots))
}

/// POST /api/v1/vms/{vmID}/snapshots
pub async fn create_snapshot(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
) -> ExporterResult<Json<VmSnapshot>> {
    let snapshot = state.manager.create_snapshot(&vm_id).await?;
    Ok(Json(snapshot))
}

/// GET /api/v1/vms/{vmID}/snapshots/{snapshotID}
///
/// With `compareTo`, the returned chunks are the difference against the
/// named older snapshot. The comparison target must exist, belong to the
/// same VM and be strictly older.
pub async fn get_snapshot(
    State(state): State<AppState>,
    Path((vm_id, snap_id)): Path<(String, String)>,
    Query(query): Query<SnapshotQuery>,
) -> ExporterResult<Json<VmSnapshot>> {
    let squash = query.squash_chunks.unwrap_or(true);
    let snapshot = state
        .manager
        .get_snapshot(&vm_id, &snap_id, query.compare_to.as_deref(), squash)
        .await?;
    Ok(Json(snapshot))
}

/// DELETE /api/v1/vms/{vmID}/snapshots/{snapshotID}
pub async fn delete_snapshot(
    State(state): State<AppState>,
    Path((vm_id, snap_id)): Path<(String, String)>,
) -> ExporterResult<StatusCode> {
    state.manager.delete_snapshot(&vm_id, &snap_id).await?;
    Ok(StatusCode::OK)
}

/// DELETE /api/v1/vms/{vmID}/snapshots
pub async fn purge_snapshots(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
) -> ExporterResult<StatusCode> {
    state.manager.purge_snapshots(&vm_id).await?;
    Ok(StatusCode::OK)
}
