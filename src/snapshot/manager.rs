//! Snapshot lifecycle management.
//!
//! `SnapshotManager` is the single entry point the HTTP layer talks to.
//! It composes the inventory, the clone backend and the metadata store,
//! and owns the locks that order concurrent operations: a per-VM mutex
//! serializes creates, and a per-snapshot RwLock lets readers proceed
//! concurrently while a delete of the same snapshot is exclusive.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock};
use tokio::task;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{Database, SnapshotRecord};
use crate::error::{ExporterError, ExporterResult};
use crate::inventory::{InventorySource, VmInfo};
use crate::models::{Disk, DiskSnapshot, VirtualMachine, VmSnapshot};

use super::chunks::{compare_chunks, squash_chunks};
use super::clone::{build_clones, delete_disk_snapshot, CloneBackend};

/// Manages all snapshotting operations.
pub struct SnapshotManager {
    db: Database,
    inventory: Arc<dyn InventorySource>,
    backend: Arc<dyn CloneBackend>,
    vm_locks: DashMap<String, Arc<Mutex<()>>>,
    snapshot_locks: DashMap<String, Arc<RwLock<()>>>,
    last_created: DashMap<String, DateTime<Utc>>,
}

impl SnapshotManager {
    pub fn new(
        db: Database,
        inventory: Arc<dyn InventorySource>,
        backend: Arc<dyn CloneBackend>,
    ) -> Self {
        Self {
            db,
            inventory,
            backend,
            vm_locks: DashMap::new(),
            snapshot_locks: DashMap::new(),
            last_created: DashMap::new(),
        }
    }

    /// Lists all virtual machines on this host.
    pub async fn list_virtual_machines(&self) -> ExporterResult<Vec<VirtualMachine>> {
        let inventory = self.inventory.clone();
        let vms = task::spawn_blocking(move || inventory.list_vms())
            .await
            .map_err(join_error)??;
        vms.into_iter()
            .map(|vm| self.vm_to_params(vm))
            .collect()
    }

    /// Fetches information about a single virtual machine.
    pub async fn get_virtual_machine(&self, vm_id: &str) -> ExporterResult<VirtualMachine> {
        let vm = self.fetch_vm(vm_id).await?;
        self.vm_to_params(vm)
    }

    /// Creates a new snapshot of all disks of a VM.
    ///
    /// The per-VM lock is held for the whole call, so overlapping creates
    /// for one VM are serialized and their timestamps reflect that order.
    pub async fn create_snapshot(&self, vm_id: &str) -> ExporterResult<VmSnapshot> {
        let vm = self.fetch_vm(vm_id).await?;

        let lock = self.vm_lock(vm_id);
        let _guard = lock.lock().await;

        let snap_id = Uuid::new_v4().to_string();
        let disks = {
            let backend = self.backend.clone();
            let vm = vm.clone();
            let snap_id = snap_id.clone();
            task::spawn_blocking(move || build_clones(backend.as_ref(), &vm, &snap_id))
                .await
                .map_err(join_error)??
        };

        let record = SnapshotRecord {
            id: snap_id,
            vm_id: vm_id.to_string(),
            created_at: self.next_created_at(vm_id),
            disks,
        };

        if let Err(err) = self.db.create_snapshot(&record) {
            warn!(snapshot = %record.id, error = %err, "failed to save snapshot, cleaning up");
            for disk in &record.disks {
                if let Err(cleanup_err) = delete_disk_snapshot(disk) {
                    warn!(
                        clone = %disk.path,
                        error = %cleanup_err,
                        "failed to cleanup snapshot"
                    );
                }
            }
            return Err(err);
        }

        info!(vm = %vm_id, snapshot = %record.id, "created snapshot");
        Ok(record_to_params(record, false))
    }

    /// Fetches a snapshot, optionally differenced against an older one and
    /// optionally with its chunks coalesced.
    pub async fn get_snapshot(
        &self,
        vm_id: &str,
        snap_id: &str,
        compare_to: Option<&str>,
        squash: bool,
    ) -> ExporterResult<VmSnapshot> {
        let lock = self.snapshot_lock(snap_id);
        let _guard = lock.read().await;

        let record = self.fetch_vm_snapshot(vm_id, snap_id)?;
        let record = match compare_to {
            Some(older_id) => {
                let older = self.fetch_vm_snapshot(vm_id, older_id)?;
                diff_snapshot(record, &older)?
            }
            None => record,
        };
        Ok(record_to_params(record, squash))
    }

    /// Lists all snapshots of a VM, newest last, with coalesced chunks.
    pub async fn list_snapshots(&self, vm_id: &str) -> ExporterResult<Vec<VmSnapshot>> {
        // The VM must exist; snapshots of unknown VMs are not listable.
        self.fetch_vm(vm_id).await?;
        let records = self.db.list_snapshots(vm_id)?;
        Ok(records
            .into_iter()
            .map(|record| record_to_params(record, true))
            .collect())
    }

    /// Deletes a single snapshot: clone files first, then the record.
    /// Deleting an absent snapshot succeeds.
    pub async fn delete_snapshot(&self, vm_id: &str, snap_id: &str) -> ExporterResult<()> {
        let record = match self.db.get_snapshot(snap_id)? {
            Some(record) => record,
            None => return Ok(()),
        };
        if record.vm_id != vm_id {
            return Err(ExporterError::Conflict("VM id mismatch".into()));
        }

        // Exclusive for the whole sequence: file removal, empty-directory
        // cleanup and record removal.
        let lock = self.snapshot_lock(snap_id);
        let _guard = lock.write().await;

        let disks = record.disks.clone();
        task::spawn_blocking(move || -> ExporterResult<()> {
            for disk in &disks {
                delete_disk_snapshot(disk)?;
            }
            Ok(())
        })
        .await
        .map_err(join_error)??;

        self.db.delete_snapshot(snap_id)?;
        info!(vm = %vm_id, snapshot = %snap_id, "deleted snapshot");
        Ok(())
    }

    /// Deletes every snapshot recorded for a VM. Operates on the metadata
    /// store directly, so snapshots of VMs that no longer exist in the
    /// inventory remain purgeable.
    pub async fn purge_snapshots(&self, vm_id: &str) -> ExporterResult<()> {
        for record in self.db.list_snapshots(vm_id)? {
            self.delete_snapshot(vm_id, &record.id).await?;
        }
        Ok(())
    }

    /// Resolves the clone file backing a disk of a snapshot, returning its
    /// path together with the snapshot's shared lock. The range server
    /// holds the guard while opening the file so a concurrent delete of
    /// the same snapshot cannot slip in between lookup and open.
    pub async fn disk_clone_path(
        &self,
        vm_id: &str,
        snap_id: &str,
        disk_id: &str,
    ) -> ExporterResult<(OwnedRwLockReadGuard<()>, String)> {
        let guard = self.snapshot_lock(snap_id).read_owned().await;
        let record = self.fetch_vm_snapshot(vm_id, snap_id)?;
        let disk = record
            .disks
            .iter()
            .find(|disk| disk.name == disk_id)
            .ok_or_else(|| {
                ExporterError::NotFound(format!("snapshot has no disk named {disk_id}"))
            })?;
        Ok((guard, disk.path.clone()))
    }

    async fn fetch_vm(&self, vm_id: &str) -> ExporterResult<VmInfo> {
        let inventory = self.inventory.clone();
        let vm_id = vm_id.to_string();
        task::spawn_blocking(move || inventory.get_vm(&vm_id))
            .await
            .map_err(join_error)?
    }

    /// Fetches a snapshot record, reporting a foreign VM id as a conflict
    /// so callers can tell a present-but-foreign id from an absent one.
    fn fetch_vm_snapshot(&self, vm_id: &str, snap_id: &str) -> ExporterResult<SnapshotRecord> {
        let record = self
            .db
            .get_snapshot(snap_id)?
            .ok_or_else(|| ExporterError::NotFound(format!("snapshot {snap_id} not found")))?;
        if record.vm_id != vm_id {
            return Err(ExporterError::Conflict("VM id mismatch".into()));
        }
        Ok(record)
    }

    fn vm_to_params(&self, vm: VmInfo) -> ExporterResult<VirtualMachine> {
        let snapshots = self
            .db
            .list_snapshots(&vm.name)?
            .into_iter()
            .map(|record| record.id)
            .collect();
        let snapshot_compatible = vm.cloneable();
        let disks = vm
            .disks
            .iter()
            .map(|disk| Disk {
                name: disk.name.clone(),
                path: disk.path.clone(),
                device_name: disk.device_name.clone(),
                snapshot_compatible: disk.cloneable(),
                mode: disk.mode.clone(),
            })
            .collect();
        Ok(VirtualMachine {
            friendly_name: vm.friendly_name.unwrap_or_default(),
            name: vm.name,
            uuid: vm.uuid,
            disks,
            snapshot_compatible,
            snapshots,
        })
    }

    fn vm_lock(&self, vm_id: &str) -> Arc<Mutex<()>> {
        self.vm_locks
            .entry(vm_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn snapshot_lock(&self, snap_id: &str) -> Arc<RwLock<()>> {
        self.snapshot_locks
            .entry(snap_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Returns a creation timestamp strictly greater than any previously
    /// handed out for this VM within this process.
    fn next_created_at(&self, vm_id: &str) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_created.get(vm_id) {
            if now <= *last {
                now = *last + Duration::nanoseconds(1);
            }
        }
        self.last_created.insert(vm_id.to_string(), now);
        now
    }
}

/// Projects a stored record into its API form, optionally coalescing each
/// disk's chunks.
fn record_to_params(record: SnapshotRecord, squash: bool) -> VmSnapshot {
    let disks = record
        .disks
        .into_iter()
        .map(|disk| {
            if squash {
                DiskSnapshot {
                    chunks: squash_chunks(&disk.chunks),
                    ..disk
                }
            } else {
                disk
            }
        })
        .collect();
    VmSnapshot {
        id: record.id,
        vm_id: record.vm_id,
        disks,
    }
}

/// Produces the differential view of `snap` against the older `compare_to`
/// snapshot: per disk (matched by name), only the chunks whose physical
/// location is not present at the same logical position in the older
/// snapshot survive. Runs on unsquashed chunks.
fn diff_snapshot(
    mut snap: SnapshotRecord,
    compare_to: &SnapshotRecord,
) -> ExporterResult<SnapshotRecord> {
    if compare_to.created_at >= snap.created_at {
        return Err(ExporterError::BadRequest(
            "compareTo snapshot must be older than this snapshot".into(),
        ));
    }
    if snap.vm_id != compare_to.vm_id {
        return Err(ExporterError::BadRequest(
            "compareTo snapshot does not belong to this VM".into(),
        ));
    }

    for disk in &mut snap.disks {
        if let Some(older) = compare_to.disks.iter().find(|d| d.name == disk.name) {
            disk.chunks = compare_chunks(&disk.chunks, &older.chunks);
        }
    }
    Ok(snap)
}

fn join_error(err: task::JoinError) -> ExporterError {
    ExporterError::io("background task failed", std::io::Error::other(err))
}
