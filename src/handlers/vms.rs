//! Virtual machine handlers.

use axum::{
    extract::{Path, State},
    Json,
};

use crate::error::ExporterResult;
use crate::models::VirtualMachine;
use crate::router::AppState;

/// GET /api/v1/vms
pub async fn list_vms(State(state): State<AppState>) -> ExporterResult<Json<Vec<VirtualMachine>>> {
    let vms = state.manager.list_virtual_machines().await?;
    Ok(Json(vms))
}

/// GET /api/v1/vms/{vmID}
pub async fn get_vm(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
) -> ExporterResult<Json<VirtualMachine>> {
    let vm = state.manager.get_virtual_machine(&vm_id).await?;
    Ok(Json(vm))
}
