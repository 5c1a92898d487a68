//! HTTPS server for the exporter API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::OvmClient;
use crate::config::Config;
use crate::db::Database;
use crate::error::{ExporterError, ExporterResult};
use crate::inventory::HostInventory;
use crate::router::{create_router, AppState};
use crate::snapshot::{ReflinkBackend, SnapshotManager};
use crate::tls::build_server_config;

/// The exporter server, wired to the host inventory and the reflink
/// backend.
pub struct ExporterServer {
    config: Arc<Config>,
    state: AppState,
}

impl ExporterServer {
    /// Creates a new server from a validated configuration. Opens the
    /// metadata database, which fails if another process holds its lock.
    pub fn new(config: Config) -> ExporterResult<Self> {
        let config = Arc::new(config);
        let db = Database::open(&config.db_file)?;
        let endpoint = config.ovm_endpoint.as_deref().ok_or_else(|| {
            ExporterError::BadRequest("missing ovm_endpoint config option".into())
        })?;
        let ovm = Arc::new(OvmClient::new(endpoint)?);
        let manager = Arc::new(SnapshotManager::new(
            db,
            Arc::new(HostInventory::new()),
            Arc::new(ReflinkBackend),
        ));
        let state = AppState {
            config: config.clone(),
            manager,
            ovm,
        };
        Ok(Self { config, state })
    }

    /// Runs the server until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr: SocketAddr = self.config.api.bind_address().parse()?;
        let tls = RustlsConfig::from_config(build_server_config(&self.config.api.tls)?);

        let app = create_router(self.state).layer(TraceLayer::new_for_http());

        let handle = Handle::new();
        tokio::spawn(shutdown_signal(handle.clone()));

        info!("exporter API listening on {}", addr);
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("signal received, shutting down");
    handle.shutdown();
}
