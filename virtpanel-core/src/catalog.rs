//! In-memory catalog of VMs and their snapshots.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{CoreError, EntityKind, Result};
use crate::model::{Snapshot, Vm};

/// A driver operation whose outcome the core has not folded back yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub operation: String,
    pub started_at: DateTime<Utc>,
}

/// A VM together with everything it owns.
#[derive(Debug, Clone)]
pub struct VmRecord {
    pub vm: Vm,
    /// Creation order
    pub snapshots: Vec<Snapshot>,
    pub in_flight: Option<InFlight>,
}

impl VmRecord {
    pub fn new(vm: Vm) -> Self {
        Self {
            vm,
            snapshots: Vec::new(),
            in_flight: None,
        }
    }

    pub fn snapshot(&self, name: &str) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.name == name)
    }

    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.is_current)
    }

    /// Make `name` the only current snapshot.
    pub fn mark_current(&mut self, name: &str) {
        for snapshot in &mut self.snapshots {
            snapshot.is_current = snapshot.name == name;
        }
    }
}

/// VMs keyed by name.
///
/// Every mutation of a VM happens under that VM's entity lock; the catalog
/// lock itself is only held for the duration of a read or a write and never
/// across a driver call.
#[derive(Default)]
pub struct VmCatalog {
    vms: RwLock<BTreeMap<String, VmRecord>>,
}

impl VmCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &str) -> Result<VmRecord> {
        self.vms
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::not_found(EntityKind::Vm, name))
    }

    pub async fn vm(&self, name: &str) -> Result<Vm> {
        self.get(name).await.map(|record| record.vm)
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.vms.read().await.contains_key(name)
    }

    /// Name of the VM with the given UUID.
    pub async fn name_of(&self, uuid: &str) -> Option<String> {
        self.vms
            .read()
            .await
            .values()
            .find(|r| r.vm.uuid == uuid)
            .map(|r| r.vm.name.clone())
    }

    /// Add a new VM. Fails with `Conflict` if the name is taken.
    pub async fn insert(&self, record: VmRecord) -> Result<()> {
        let mut vms = self.vms.write().await;
        let name = record.vm.name.clone();
        if vms.contains_key(&name) {
            return Err(CoreError::conflict(
                EntityKind::Vm,
                name,
                "create",
                "a VM with this name already exists",
            ));
        }
        vms.insert(name, record);
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Option<VmRecord> {
        self.vms.write().await.remove(name)
    }

    /// Apply `f` to a record and return its result.
    pub async fn update<R>(&self, name: &str, f: impl FnOnce(&mut VmRecord) -> R) -> Result<R> {
        let mut vms = self.vms.write().await;
        let record = vms
            .get_mut(name)
            .ok_or_else(|| CoreError::not_found(EntityKind::Vm, name))?;
        Ok(f(record))
    }

    /// Move a record to a new name.
    pub async fn rename(&self, old: &str, new: &str) -> Result<Vm> {
        let mut vms = self.vms.write().await;
        if vms.contains_key(new) {
            return Err(CoreError::conflict(
                EntityKind::Vm,
                old,
                "rename",
                format!("a VM named '{}' already exists", new),
            ));
        }
        let mut record = vms
            .remove(old)
            .ok_or_else(|| CoreError::not_found(EntityKind::Vm, old))?;
        record.vm.name = new.to_string();
        let vm = record.vm.clone();
        vms.insert(new.to_string(), record);
        Ok(vm)
    }

    pub async fn list(&self) -> Vec<Vm> {
        self.vms.read().await.values().map(|r| r.vm.clone()).collect()
    }

    pub async fn records(&self) -> Vec<VmRecord> {
        self.vms.read().await.values().cloned().collect()
    }

    pub async fn set_in_flight(&self, name: &str, operation: &str) -> Result<()> {
        self.update(name, |record| {
            record.in_flight = Some(InFlight {
                operation: operation.to_string(),
                started_at: Utc::now(),
            });
        })
        .await
    }

    /// Clear the marker of the VM with `uuid`. The VM may have been renamed
    /// while the driver call ran, so it is looked up by UUID.
    pub async fn clear_in_flight(&self, uuid: &str) {
        let mut vms = self.vms.write().await;
        if let Some(record) = vms.values_mut().find(|r| r.vm.uuid == uuid) {
            record.in_flight = None;
        }
    }

    // =========================================================================
    // Reference scans
    // =========================================================================

    /// Names of the VMs with a disk backed by `path`.
    ///
    /// Holds the catalog read lock for the scan only.
    pub async fn volume_references(&self, path: &str) -> Vec<String> {
        self.vms
            .read()
            .await
            .values()
            .filter(|r| r.vm.references_volume(path))
            .map(|r| r.vm.name.clone())
            .collect()
    }

    /// Names of the VMs with a disk backed by any of `paths`, with the path.
    pub async fn volumes_references(&self, paths: &[String]) -> Vec<(String, String)> {
        let vms = self.vms.read().await;
        let mut found = Vec::new();
        for record in vms.values() {
            for path in paths {
                if record.vm.references_volume(path) {
                    found.push((record.vm.name.clone(), path.clone()));
                }
            }
        }
        found
    }

    /// Names of the VMs with a NIC on `network`.
    pub async fn network_references(&self, network: &str) -> Vec<String> {
        self.vms
            .read()
            .await
            .values()
            .filter(|r| r.vm.references_network(network))
            .map(|r| r.vm.name.clone())
            .collect()
    }

    /// Names of the VMs whose CD-ROM holds the image at `path`.
    pub async fn iso_references(&self, path: &Path) -> Vec<String> {
        self.vms
            .read()
            .await
            .values()
            .filter(|r| r.vm.iso().is_some_and(|media| Path::new(media) == path))
            .map(|r| r.vm.name.clone())
            .collect()
    }
}
