//! Inventory of repositories and virtual machines on this compute node.

pub mod repos;
pub mod vms;

pub use repos::{scan_repos, Repo};
pub use vms::{Disk, VmInfo};

use crate::error::{ExporterError, ExporterResult};

/// Source of VM and repository information consumed by the snapshot
/// lifecycle.
pub trait InventorySource: Send + Sync {
    /// Lists all VMs known to this node.
    fn list_vms(&self) -> ExporterResult<Vec<VmInfo>>;

    /// Returns the VM identified by `vm_id`.
    fn get_vm(&self, vm_id: &str) -> ExporterResult<VmInfo>;
}

/// Inventory backed by the host's mount table. An explicit repository
/// list may be injected for deployments with a fixed layout.
#[derive(Debug, Default)]
pub struct HostInventory {
    repos: Option<Vec<Repo>>,
}

impl HostInventory {
    /// Inventory that discovers repositories from the mount table on
    /// every call.
    pub fn new() -> Self {
        Self { repos: None }
    }

    /// Inventory restricted to a fixed set of repositories.
    pub fn with_repos(repos: Vec<Repo>) -> Self {
        Self { repos: Some(repos) }
    }

    fn repos(&self) -> ExporterResult<Vec<Repo>> {
        match &self.repos {
            Some(repos) => Ok(repos.clone()),
            None => scan_repos(),
        }
    }
}

impl InventorySource for HostInventory {
    fn list_vms(&self) -> ExporterResult<Vec<VmInfo>> {
        let repos = self.repos()?;
        vms::list_all_vms(&repos)
    }

    fn get_vm(&self, vm_id: &str) -> ExporterResult<VmInfo> {
        if vm_id.is_empty() {
            return Err(ExporterError::BadRequest("empty vmID".into()));
        }
        self.list_vms()?
            .into_iter()
            .find(|vm| vm.name == vm_id)
            .ok_or_else(|| ExporterError::NotFound(format!("could not find VM with ID {vm_id}")))
    }
}
