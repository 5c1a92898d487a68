//! Request routing for the exporter API.

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::auth::{jwt, OvmClient};
use crate::config::Config;
use crate::handlers;
use crate::snapshot::SnapshotManager;

/// Application state shared between handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<SnapshotManager>,
    pub ovm: Arc<OvmClient>,
}

/// Creates the exporter router. Everything except login sits behind the
/// JWT middleware.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/vms", get(handlers::vms::list_vms))
        .route("/vms/:vm_id", get(handlers::vms::get_vm))
        .route(
            "/vms/:vm_id/snapshots",
            get(handlers::snapshots::list_snapshots)
                .post(handlers::snapshots::create_snapshot)
                .delete(handlers::snapshots::purge_snapshots),
        )
        .route(
            "/vms/:vm_id/snapshots/:snapshot_id",
            get(handlers::snapshots::get_snapshot).delete(handlers::snapshots::delete_snapshot),
        )
        .route(
            "/vms/:vm_id/snapshots/:snapshot_id/disks/:disk_id",
            get(handlers::disks::consume_disk),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            jwt::authenticate,
        ));

    let api = Router::new()
        .route("/auth/login", post(handlers::auth::login))
        .merge(protected);

    Router::new()
        .nest("/api/v1", api)
        .fallback(handlers::not_found)
        .with_state(state)
}
