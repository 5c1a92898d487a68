//! The snapshot engine: reflink cloning, extent mapping, differencing and
//! lifecycle management.

pub mod chunks;
pub mod clone;
pub mod fiemap;
pub mod manager;
pub mod reflink;

pub use clone::{CloneBackend, ReflinkBackend, SNAPSHOT_DIR};
pub use manager::SnapshotManager;
