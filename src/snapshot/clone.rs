//! Clone set construction and teardown.
//!
//! A snapshot is a directory `{repo}/CoriolisSnapshots/{snapshot_id}`
//! holding one reflinked clone per VM disk. Creation is all-or-nothing:
//! the first per-disk failure tears down every clone made by the call.

use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use tracing::{info, warn};

use crate::error::{ExporterError, ExporterResult};
use crate::inventory::{Disk, VmInfo};
use crate::models::{Chunk, DiskSnapshot};

use super::fiemap;
use super::reflink;

/// Folder relative to a repository mount point where reflinked snapshots
/// are saved.
pub const SNAPSHOT_DIR: &str = "CoriolisSnapshots";

const SNAPSHOT_DIR_MODE: u32 = 0o750;

/// Clone and extent-map operations the builder depends on. The production
/// implementation drives the filesystem ioctls; tests substitute their
/// own.
pub trait CloneBackend: Send + Sync {
    /// Creates a copy-on-write clone of `src` at `dst`.
    fn clone_file(&self, src: &Path, dst: &Path) -> ExporterResult<()>;

    /// Returns the allocated extents of the file at `path`.
    fn extents(&self, path: &Path) -> ExporterResult<Vec<Chunk>>;
}

/// Backend using the filesystem reflink and FIEMAP ioctls.
pub struct ReflinkBackend;

impl CloneBackend for ReflinkBackend {
    fn clone_file(&self, src: &Path, dst: &Path) -> ExporterResult<()> {
        reflink::reflink(src, dst)
    }

    fn extents(&self, path: &Path) -> ExporterResult<Vec<Chunk>> {
        fiemap::get_extents(path)
    }
}

/// Creates a clone of every disk of `vm` under the given snapshot id.
///
/// Fails with `NotCloneable` before touching the filesystem if any disk
/// cannot be reflinked. On a per-disk failure, all clones already created
/// by this call are removed before the error is returned, so partial
/// snapshots never become visible.
pub fn build_clones(
    backend: &dyn CloneBackend,
    vm: &VmInfo,
    snap_id: &str,
) -> ExporterResult<Vec<DiskSnapshot>> {
    if !vm.cloneable() {
        let culprit = vm
            .disks
            .iter()
            .find(|d| !d.cloneable())
            .map(|d| d.name.clone())
            .unwrap_or_else(|| vm.name.clone());
        return Err(ExporterError::NotCloneable(culprit));
    }

    let mut clones: Vec<DiskSnapshot> = Vec::with_capacity(vm.disks.len());
    for disk in &vm.disks {
        match clone_disk(backend, disk, snap_id) {
            Ok(snap) => clones.push(snap),
            Err(err) => {
                for created in &clones {
                    if let Err(cleanup_err) = delete_disk_snapshot(created) {
                        warn!(
                            clone = %created.path,
                            error = %cleanup_err,
                            "failed to roll back disk clone"
                        );
                    }
                }
                return Err(err);
            }
        }
    }
    Ok(clones)
}

/// Clones a single disk and records its extent list.
fn clone_disk(
    backend: &dyn CloneBackend,
    disk: &Disk,
    snap_id: &str,
) -> ExporterResult<DiskSnapshot> {
    let repo = disk
        .repo
        .as_ref()
        .ok_or_else(|| ExporterError::NotCloneable(disk.name.clone()))?;

    let snapshot_dir = repo.mount_point.join(SNAPSHOT_DIR).join(snap_id);
    if !snapshot_dir.is_dir() {
        info!(dir = %snapshot_dir.display(), "creating snapshot dir");
        DirBuilder::new()
            .recursive(true)
            .mode(SNAPSHOT_DIR_MODE)
            .create(&snapshot_dir)
            .map_err(|e| {
                ExporterError::io(format!("creating {}", snapshot_dir.display()), e)
            })?;
    }

    let clone_path = snapshot_dir.join(&disk.name);
    info!(src = %disk.path, dst = %clone_path.display(), "creating disk clone");

    let result = backend
        .clone_file(Path::new(&disk.path), &clone_path)
        .and_then(|()| backend.extents(&clone_path));

    match result {
        Ok(chunks) => Ok(DiskSnapshot {
            name: disk.name.clone(),
            repo: repo.mount_point.display().to_string(),
            snapshot_id: snap_id.to_string(),
            path: clone_path.display().to_string(),
            parent_path: disk.path.clone(),
            chunks,
        }),
        Err(err) => {
            let _ = fs::remove_file(&clone_path);
            remove_dir_if_empty(&snapshot_dir);
            Err(err)
        }
    }
}

/// Removes the files associated with a disk clone.
///
/// A missing snapshot directory or clone file means desired state equals
/// actual state and counts as success. The snapshot directory itself is
/// removed once the last clone in it is gone.
pub fn delete_disk_snapshot(disk: &DiskSnapshot) -> ExporterResult<()> {
    let snapshot_dir = Path::new(&disk.repo)
        .join(SNAPSHOT_DIR)
        .join(&disk.snapshot_id);
    match fs::metadata(&snapshot_dir) {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(ExporterError::io(
                format!("accessing {}", snapshot_dir.display()),
                err,
            ))
        }
    }

    let clone_path = snapshot_dir.join(&disk.name);
    match fs::remove_file(&clone_path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(ExporterError::io(
                format!("removing {}", clone_path.display()),
                err,
            ))
        }
    }

    remove_dir_if_empty(&snapshot_dir);
    Ok(())
}

fn remove_dir_if_empty(dir: &Path) {
    let Ok(mut entries) = fs::read_dir(dir) else {
        return;
    };
    if entries.next().is_none() {
        let _ = fs::remove_dir(dir);
    }
}
