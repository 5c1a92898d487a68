//! Metadata store for snapshot records, backed by sled.
//!
//! Two trees are kept: `snapshots` maps a snapshot id to its JSON-encoded
//! record, and `vm_index` is a secondary index whose keys are
//! `{vm_id}\0{created_at_nanos_be}\0{snapshot_id}`, so a prefix scan over a
//! VM id yields that VM's snapshots in creation order, ties broken by id.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;

use crate::error::{ExporterError, ExporterResult};
use crate::models::DiskSnapshot;

const SNAPSHOTS_TREE: &str = "snapshots";
const VM_INDEX_TREE: &str = "vm_index";

/// How long to wait for another process to release the database lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// A snapshot as persisted in the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub vm_id: String,
    pub created_at: DateTime<Utc>,
    pub disks: Vec<DiskSnapshot>,
}

/// Handle to the metadata database.
pub struct Database {
    db: sled::Db,
    snapshots: sled::Tree,
    vm_index: sled::Tree,
}

impl Database {
    /// Opens the database at `path`, waiting up to one second for a
    /// concurrent holder of the file lock to release it.
    pub fn open(path: &Path) -> ExporterResult<Self> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        let db = loop {
            match sled::Config::new().path(path).open() {
                Ok(db) => break db,
                Err(err) => {
                    if Instant::now() >= deadline {
                        return Err(err.into());
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        };
        let snapshots = db.open_tree(SNAPSHOTS_TREE)?;
        let vm_index = db.open_tree(VM_INDEX_TREE)?;
        Ok(Self {
            db,
            snapshots,
            vm_index,
        })
    }

    /// Persists a new snapshot record. Fails with `Conflict` if a record
    /// with the same id already exists.
    pub fn create_snapshot(&self, record: &SnapshotRecord) -> ExporterResult<()> {
        let value = serde_json::to_vec(record)
            .map_err(|e| ExporterError::io("encoding snapshot record", e.into()))?;
        let index_key = index_key(&record.vm_id, &record.created_at, &record.id);
        let id = record.id.as_bytes().to_vec();

        (&self.snapshots, &self.vm_index)
            .transaction(|(snaps, index)| {
                if snaps.get(&id)?.is_some() {
                    return Err(ConflictableTransactionError::Abort(
                        ExporterError::Conflict(format!("snapshot {} already exists", record.id)),
                    ));
                }
                snaps.insert(id.as_slice(), value.as_slice())?;
                index.insert(index_key.as_slice(), id.as_slice())?;
                Ok(())
            })
            .map_err(unwrap_tx_error)?;
        self.db.flush()?;
        Ok(())
    }

    /// Fetches a snapshot record by id.
    pub fn get_snapshot(&self, snap_id: &str) -> ExporterResult<Option<SnapshotRecord>> {
        match self.snapshots.get(snap_id.as_bytes())? {
            Some(raw) => Ok(Some(decode_record(&raw)?)),
            None => Ok(None),
        }
    }

    /// Lists all snapshots of a VM, ordered by creation time ascending.
    /// Returns an empty list, not an error, when the VM has none.
    pub fn list_snapshots(&self, vm_id: &str) -> ExporterResult<Vec<SnapshotRecord>> {
        let mut ret = Vec::new();
        for item in self.vm_index.scan_prefix(index_prefix(vm_id)) {
            let (key, id) = item?;
            match self.snapshots.get(&id)? {
                Some(raw) => ret.push(decode_record(&raw)?),
                None => {
                    tracing::warn!(
                        key = %String::from_utf8_lossy(&key),
                        "dangling vm_index entry, skipping"
                    );
                }
            }
        }
        Ok(ret)
    }

    /// Removes a snapshot record. Removing an absent id succeeds.
    pub fn delete_snapshot(&self, snap_id: &str) -> ExporterResult<()> {
        let record = match self.get_snapshot(snap_id)? {
            Some(record) => record,
            None => return Ok(()),
        };
        let index_key = index_key(&record.vm_id, &record.created_at, &record.id);
        let id = record.id.as_bytes().to_vec();

        (&self.snapshots, &self.vm_index)
            .transaction(|(snaps, index)| {
                snaps.remove(id.as_slice())?;
                index.remove(index_key.as_slice())?;
                Ok(())
            })
            .map_err(unwrap_tx_error)?;
        self.db.flush()?;
        Ok(())
    }

    /// Removes every snapshot record belonging to a VM. Idempotent.
    pub fn delete_vm_snapshots(&self, vm_id: &str) -> ExporterResult<()> {
        for record in self.list_snapshots(vm_id)? {
            self.delete_snapshot(&record.id)?;
        }
        Ok(())
    }
}

fn decode_record(raw: &[u8]) -> ExporterResult<SnapshotRecord> {
    serde_json::from_slice(raw)
        .map_err(|e| ExporterError::io("decoding snapshot record", e.into()))
}

fn unwrap_tx_error(err: TransactionError<ExporterError>) -> ExporterError {
    match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => err.into(),
    }
}

fn index_prefix(vm_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(vm_id.len() + 1);
    key.extend_from_slice(vm_id.as_bytes());
    key.push(0);
    key
}

fn index_key(vm_id: &str, created_at: &DateTime<Utc>, snap_id: &str) -> Vec<u8> {
    // Big-endian nanos keep the natural sled key order aligned with
    // creation time; the id suffix breaks ties lexicographically.
    let nanos = created_at.timestamp_nanos_opt().unwrap_or(i64::MAX) as u64;
    let mut key = index_prefix(vm_id);
    key.extend_from_slice(&nanos.to_be_bytes());
    key.push(0);
    key.extend_from_slice(snap_id.as_bytes());
    key
}
