//! API data types shared between the HTTP layer, the snapshot engine and
//! the metadata store.

use serde::{Deserialize, Serialize};

/// A contiguous run of file bytes backed by a contiguous physical block
/// range on the underlying device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Logical offset of the chunk within the file.
    pub start: u64,
    /// Length of the chunk in bytes.
    pub length: u64,
    /// Physical location on disk where this chunk resides. When bytes are
    /// written to a shared extent of a reflinked file, the filesystem
    /// redirects them to a new physical location, so physical addresses are
    /// the identity used when comparing two copies of a file.
    #[serde(rename = "physical_start")]
    pub physical: u64,
}

/// A point in time snapshot of a single VM disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSnapshot {
    /// Path of the disk the clone was created from.
    pub parent_path: String,
    /// Path of the clone file itself.
    pub path: String,
    pub snapshot_id: String,
    pub chunks: Vec<Chunk>,
    /// Disk name, the basename of the backing file.
    pub name: String,
    /// Mount point of the repository hosting the clone.
    #[serde(rename = "repo_mountpoint")]
    pub repo: String,
}

/// A snapshot of all disks of a VM, captured by a single API call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSnapshot {
    pub id: String,
    pub vm_id: String,
    pub disks: Vec<DiskSnapshot>,
}

/// A single disk attached to a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    pub name: String,
    pub path: String,
    pub device_name: String,
    pub snapshot_compatible: bool,
    pub mode: String,
}

/// A virtual machine and its snapshot-related state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub friendly_name: String,
    pub name: String,
    pub uuid: String,
    pub disks: Vec<Disk>,
    pub snapshot_compatible: bool,
    /// Snapshot IDs recorded for this VM in the metadata store.
    pub snapshots: Vec<String>,
}

/// Credentials supplied to the login endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Returned to clients on successful login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

/// Error body returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: String,
    pub details: String,
}
