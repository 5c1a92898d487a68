//! Coriolis OVM exporter.
//!
//! An agent running on OVM compute nodes that exposes crash-consistent,
//! differentially-consumable snapshots of VM disks over an authenticated
//! HTTPS API. Snapshots are reflinked copy-on-write clones; changed
//! regions between two snapshots are detected by comparing the physical
//! addresses of their extents.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod inventory;
pub mod models;
pub mod router;
pub mod server;
pub mod snapshot;
pub mod tls;

// Re-exports for convenience
pub use config::{Config, DEFAULT_CONFIG_FILE};
pub use error::{ExporterError, ExporterResult};
pub use router::{create_router, AppState};
pub use server::ExporterServer;
pub use snapshot::{CloneBackend, ReflinkBackend, SnapshotManager};
