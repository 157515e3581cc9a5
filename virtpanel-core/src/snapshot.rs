//! Snapshot Manager.
//!
//! At most one snapshot per VM is current: creating or reverting to a
//! snapshot makes it the current one, deleting the current snapshot leaves
//! none current.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use virtpanel_hypervisor::Hypervisor;

use crate::catalog::VmCatalog;
use crate::command::CreateSnapshot;
use crate::dispatch::Dispatcher;
use crate::error::{CoreError, EntityKind, Result};
use crate::locks::{EntityKey, EntityLocks};
use crate::model::{Snapshot, Vm, VmState};

fn snapshot_id(vm: &str, snapshot: &str) -> String {
    format!("{}/{}", vm, snapshot)
}

pub struct SnapshotManager {
    hypervisor: Arc<dyn Hypervisor>,
    catalog: Arc<VmCatalog>,
    locks: Arc<EntityLocks>,
    dispatcher: Arc<Dispatcher>,
}

impl SnapshotManager {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        catalog: Arc<VmCatalog>,
        locks: Arc<EntityLocks>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            hypervisor,
            catalog,
            locks,
            dispatcher,
        }
    }

    /// Snapshots of a VM, oldest first.
    pub async fn list(&self, vm: &str) -> Result<Vec<Snapshot>> {
        Ok(self.catalog.get(vm).await?.snapshots)
    }

    pub async fn get(&self, vm: &str, snapshot: &str) -> Result<Snapshot> {
        self.catalog
            .get(vm)
            .await?
            .snapshot(snapshot)
            .cloned()
            .ok_or_else(|| CoreError::not_found(EntityKind::Snapshot, snapshot_id(vm, snapshot)))
    }

    /// Capture the VM's current definition. The new snapshot becomes the
    /// current one.
    #[instrument(skip(self, cmd, cancel), fields(vm = %vm, snapshot = %cmd.name))]
    pub async fn create(&self, vm: &str, cmd: CreateSnapshot, cancel: &CancellationToken) -> Result<Snapshot> {
        let _guard = self.locks.lock(EntityKey::Vm(vm.to_string())).await;
        let record = self.catalog.get(vm).await?;
        let id = snapshot_id(vm, &cmd.name);

        if let Some(in_flight) = &record.in_flight {
            return Err(CoreError::conflict(
                EntityKind::Snapshot,
                &id,
                "create",
                format!("'{}' is still in progress", in_flight.operation),
            ));
        }
        if record.vm.state.is_transient() {
            return Err(CoreError::conflict(
                EntityKind::Snapshot,
                &id,
                "create",
                format!("vm is {}", record.vm.state),
            ));
        }
        if record.snapshot(&cmd.name).is_some() {
            return Err(CoreError::conflict(
                EntityKind::Snapshot,
                &id,
                "create",
                "a snapshot with this name already exists",
            ));
        }

        let hv = self.hypervisor.clone();
        let (uuid, name, description) = (
            record.vm.uuid.clone(),
            cmd.name.clone(),
            cmd.description.clone(),
        );
        let info = self
            .dispatcher
            .call_vm(vm, &record.vm.uuid, "create snapshot", cancel, async move {
                hv.create_snapshot(&uuid, &name, &description).await
            })
            .await?;

        let snapshot = Snapshot {
            name: cmd.name,
            description: cmd.description,
            state: record.vm.state,
            created_at: info.created_at,
            is_current: true,
            descriptor: record.vm.descriptor(),
        };
        self.catalog
            .update(vm, |r| {
                r.snapshots.push(snapshot.clone());
                r.mark_current(&snapshot.name);
            })
            .await?;
        info!(state = %snapshot.state, "Snapshot created");
        Ok(snapshot)
    }

    /// Revert to a snapshot.
    ///
    /// An active VM is powered off first and the VM is left powered off
    /// afterwards, even when the snapshot was taken while it ran. The
    /// reverted snapshot becomes current.
    #[instrument(skip(self, cancel), fields(vm = %vm, snapshot = %snapshot))]
    pub async fn revert(&self, vm: &str, snapshot: &str, cancel: &CancellationToken) -> Result<Vm> {
        let _guard = self.locks.lock(EntityKey::Vm(vm.to_string())).await;
        let record = self.catalog.get(vm).await?;
        let id = snapshot_id(vm, snapshot);

        let target = record
            .snapshot(snapshot)
            .cloned()
            .ok_or_else(|| CoreError::not_found(EntityKind::Snapshot, &id))?;
        if let Some(in_flight) = &record.in_flight {
            return Err(CoreError::conflict(
                EntityKind::Snapshot,
                &id,
                "revert",
                format!("'{}' is still in progress", in_flight.operation),
            ));
        }

        let uuid = record.vm.uuid.clone();
        if record.vm.state.is_active() {
            self.power_off(vm, &uuid, cancel).await?;
            self.catalog.update(vm, |r| r.vm.set_state(VmState::Stopped)).await?;
        }

        let hv = self.hypervisor.clone();
        let (vm_id, name) = (uuid.clone(), snapshot.to_string());
        self.dispatcher
            .call_vm(vm, &uuid, "revert snapshot", cancel, async move {
                hv.revert_snapshot(&vm_id, &name).await
            })
            .await?;

        // Snapshots of a running guest come back running.
        let hv = self.hypervisor.clone();
        let vm_id = uuid.clone();
        let power = self
            .dispatcher
            .call_vm(vm, &uuid, "revert snapshot", cancel, async move {
                hv.domain_state(&vm_id).await
            })
            .await?;
        if power.is_active() {
            debug!(?power, "Reverted guest is live, powering off");
            self.power_off(vm, &uuid, cancel).await?;
        }

        // Every revert ends stopped, also for a VM that never ran.
        let reverted = self
            .catalog
            .update(vm, |r| {
                r.vm.apply_descriptor(&target.descriptor);
                r.vm.set_state(VmState::Stopped);
                r.mark_current(&target.name);
                r.vm.clone()
            })
            .await?;
        info!(state = %reverted.state, "Reverted to snapshot");
        Ok(reverted)
    }

    async fn power_off(&self, vm: &str, uuid: &str, cancel: &CancellationToken) -> Result<()> {
        let hv = self.hypervisor.clone();
        let vm_id = uuid.to_string();
        self.dispatcher
            .call_vm(vm, uuid, "revert snapshot (power off)", cancel, async move {
                hv.destroy_vm(&vm_id).await
            })
            .await
    }

    /// Delete a snapshot. No other snapshot is promoted to current.
    #[instrument(skip(self, cancel), fields(vm = %vm, snapshot = %snapshot))]
    pub async fn delete(&self, vm: &str, snapshot: &str, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.locks.lock(EntityKey::Vm(vm.to_string())).await;
        let record = self.catalog.get(vm).await?;
        let id = snapshot_id(vm, snapshot);

        let target = record
            .snapshot(snapshot)
            .ok_or_else(|| CoreError::not_found(EntityKind::Snapshot, &id))?;
        if let Some(in_flight) = &record.in_flight {
            return Err(CoreError::conflict(
                EntityKind::Snapshot,
                &id,
                "delete",
                format!("'{}' is still in progress", in_flight.operation),
            ));
        }
        let was_current = target.is_current;

        let hv = self.hypervisor.clone();
        let (uuid, name) = (record.vm.uuid.clone(), snapshot.to_string());
        self.dispatcher
            .call_vm(vm, &record.vm.uuid, "delete snapshot", cancel, async move {
                hv.delete_snapshot(&uuid, &name).await
            })
            .await?;

        self.catalog
            .update(vm, |r| r.snapshots.retain(|s| s.name != snapshot))
            .await?;
        info!(was_current, "Snapshot deleted");
        Ok(())
    }
}
