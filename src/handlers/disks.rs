//! Byte-range reads of disk clones.

use axum::{
    body::Body,
    extract::{Path, Request, State},
    response::Response,
};
use tower::util::ServiceExt;
use tower_http::services::ServeFile;

use crate::error::ExporterResult;
use crate::router::AppState;

/// GET/HEAD /api/v1/vms/{vmID}/snapshots/{snapshotID}/disks/{diskID}
///
/// Serves the clone file with HTTP range semantics. The file is opened
/// per request and its current on-disk size is authoritative. The
/// snapshot's shared lock is held while the file is opened so a
/// concurrent delete of the same snapshot cannot race the open.
pub async fn consume_disk(
    State(state): State<AppState>,
    Path((vm_id, snap_id, disk_id)): Path<(String, String, String)>,
    request: Request,
) -> ExporterResult<Response> {
    let (_guard, path) = state
        .manager
        .disk_clone_path(&vm_id, &snap_id, &disk_id)
        .await?;

    match ServeFile::new(&path).oneshot(request).await {
        Ok(response) => Ok(response.map(Body::new)),
        Err(never) => match never {},
    }
}
