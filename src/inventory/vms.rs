//! Virtual machine enumeration and disk resolution.
//!
//! VM definitions live in `{repo}/VirtualMachines/{vm}/vm.cfg`. The files
//! are python-style `key = value` assignments with single-quoted strings,
//! which happens to be a TOML-compatible subset once the lines we do not
//! care about are stripped.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::{ExporterError, ExporterResult};
use crate::snapshot::reflink::filesystem_supports_reflink;

use super::repos::Repo;

/// Directory below a repository mount point where VM configs are stored.
pub const VIRTUAL_MACHINES_DIR: &str = "VirtualMachines";

/// Disk object type eligible for snapshotting.
const VIRTUAL_DISK_TYPE: &str = "VIRTUAL_DISK";

/// One VM disk, resolved against its owning repository.
#[derive(Debug, Clone)]
pub struct Disk {
    /// Basename of the backing file.
    pub name: String,
    /// Absolute path of the backing file.
    pub path: String,
    /// Device name the guest sees.
    pub device_name: String,
    /// Access mode as declared in the VM config.
    pub mode: String,
    /// Repository hosting the backing file, when one could be resolved.
    pub repo: Option<Repo>,
    /// Object type classifier from the repository metadata.
    pub object_type: Option<String>,
}

impl Disk {
    /// Returns whether this disk can be reflinked: its repository must be
    /// on a reflink-capable filesystem and the object type, when present,
    /// must name a virtual disk.
    pub fn cloneable(&self) -> bool {
        let Some(repo) = &self.repo else {
            debug!(disk = %self.name, "no repository resolved for disk");
            return false;
        };
        if !filesystem_supports_reflink(&repo.filesystem) {
            debug!(
                disk = %self.name,
                filesystem = %repo.filesystem,
                "filesystem does not support reflink"
            );
            return false;
        }
        match self.object_type.as_deref() {
            None | Some(VIRTUAL_DISK_TYPE) => true,
            Some(_) => false,
        }
    }
}

/// A virtual machine and its resolved disks.
#[derive(Debug, Clone)]
pub struct VmInfo {
    /// Internal VM name, usually the UUID with hyphens removed. This is
    /// the identifier used throughout the API.
    pub name: String,
    /// Friendly name, when the config carries one.
    pub friendly_name: Option<String>,
    pub uuid: String,
    pub disks: Vec<Disk>,
}

impl VmInfo {
    /// Returns true when every disk of this VM is cloneable.
    pub fn cloneable(&self) -> bool {
        self.disks.iter().all(Disk::cloneable)
    }
}

#[derive(Debug, Deserialize)]
struct RawVmConfig {
    #[serde(rename = "OVM_simple_name", default)]
    simple_name: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    uuid: String,
    #[serde(rename = "disk", default)]
    disks: Vec<String>,
}

/// Keeps only the vm.cfg lines holding keys we decode.
fn prune_config(content: &str) -> String {
    const KEEP: [&str; 4] = ["OVM_simple_name", "disk", "uuid", "name"];
    content
        .lines()
        .filter(|line| {
            line.split_once('=')
                .map(|(key, _)| KEEP.contains(&key.trim()))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parses a vm.cfg file into its raw form.
fn parse_vm_config(path: &Path) -> ExporterResult<RawVmConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| ExporterError::io(format!("reading {}", path.display()), e))?;
    toml::from_str(&prune_config(&content))
        .map_err(|e| ExporterError::BadRequest(format!("parsing {}: {e}", path.display())))
}

/// Splits a `file:{path},{device},{mode}` disk entry. Entries with other
/// schemas or an unexpected shape are skipped.
fn parse_disk_entry(entry: &str) -> Option<(String, String, String)> {
    let (schema, rest) = entry.split_once(':')?;
    if schema != "file" {
        debug!(entry, "ignoring non file disk");
        return None;
    }
    let details: Vec<&str> = rest.split(',').collect();
    if details.len() != 3 {
        debug!(
            entry,
            values = details.len(),
            "unexpected number of values for disk entry (expected 3)"
        );
        return None;
    }
    Some((
        details[0].to_string(),
        details[1].to_string(),
        details[2].to_string(),
    ))
}

/// Resolves the repository and object type for a disk path. Repositories
/// carrying metadata for the disk name win; otherwise the first repository
/// whose mount point prefixes the path is used.
fn resolve_repo(name: &str, path: &str, repos: &[Repo]) -> (Option<Repo>, Option<String>) {
    for repo in repos {
        match repo.meta() {
            Ok(meta) => {
                if let Some(item) = meta.get(name) {
                    return (Some(repo.clone()), item.object_type.clone());
                }
            }
            Err(err) => debug!(repo = %repo.id, error = %err, "no repo metadata"),
        }
        if Path::new(path).starts_with(&repo.mount_point) {
            return (Some(repo.clone()), None);
        }
    }
    (None, None)
}

fn disks_for(raw: &RawVmConfig, repos: &[Repo]) -> Vec<Disk> {
    let mut ret = Vec::new();
    for entry in &raw.disks {
        let Some((path, device_name, mode)) = parse_disk_entry(entry) else {
            continue;
        };
        let name = Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        let (repo, object_type) = resolve_repo(&name, &path, repos);
        ret.push(Disk {
            name,
            path,
            device_name,
            mode,
            repo,
            object_type,
        });
    }
    ret
}

/// Lists the VMs defined in a single repository.
pub fn list_vms(repo: &Repo, repos: &[Repo]) -> ExporterResult<Vec<VmInfo>> {
    let vm_dir = repo.mount_point.join(VIRTUAL_MACHINES_DIR);
    if !vm_dir.is_dir() {
        debug!(repo = %repo.id, "repository has no VirtualMachines directory");
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(&vm_dir)
        .map_err(|e| ExporterError::io(format!("listing {}", vm_dir.display()), e))?;

    let mut ret = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ExporterError::io("listing VM dir", e))?;
        let cfg_file = entry.path().join("vm.cfg");
        if !cfg_file.is_file() {
            continue;
        }
        let raw = parse_vm_config(&cfg_file)?;
        let disks = disks_for(&raw, repos);
        ret.push(VmInfo {
            name: raw.name,
            friendly_name: raw.simple_name,
            uuid: raw.uuid,
            disks,
        });
    }
    Ok(ret)
}

/// Lists the VMs of every known repository.
pub fn list_all_vms(repos: &[Repo]) -> ExporterResult<Vec<VmInfo>> {
    let mut ret = Vec::new();
    for repo in repos {
        ret.extend(list_vms(repo, repos)?);
    }
    Ok(ret)
}
