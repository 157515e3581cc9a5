//! VM Lifecycle Manager.
//!
//! Owns the lifecycle state machine and the attachment rules. Every
//! operation takes the VM's entity lock (plus the pool or network it
//! touches), validates against the catalog and the registry, issues one
//! driver call, and then asks the reconciler for the resulting state instead
//! of assuming it.

use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use virtpanel_hypervisor::{
    generate_mac_address, BootDevice, CdromConfig, CpuConfig, Device, DiskBus, DiskConfig,
    Hypervisor, MachineType, NicConfig, NicKind, VmConfig,
};

use crate::catalog::{VmCatalog, VmRecord};
use crate::command::{
    validate_mac, AttachDisk, AttachIso, AttachNic, Batch, BatchAction, CloneVm, CreateVm,
    CreateVolume, DiskSource, RenameVm, UpdateVm,
};
use crate::config::CoreConfig;
use crate::dispatch::{Dispatcher, Target};
use crate::error::{CoreError, EntityKind, ErrorKind, Result};
use crate::iso::iso_key;
use crate::locks::{EntityKey, EntityLocks};
use crate::model::{StorageVolume, Vm, VmState};
use crate::reconciler::Reconciler;
use crate::registry::ResourceRegistry;
use crate::transition::{plan, Plan, VmOp};

/// Result of one entry of a batch request.
#[derive(Debug)]
pub struct BatchOutcome {
    pub name: String,
    pub result: Result<()>,
}

/// Whether a failed driver call has a known outcome. Only then is it safe
/// to undo the steps that preceded it.
fn outcome_known(err: &CoreError) -> bool {
    !matches!(err.kind(), ErrorKind::Cancelled | ErrorKind::Unavailable)
}

fn ensure_idle(record: &VmRecord, operation: &str) -> Result<()> {
    match &record.in_flight {
        Some(in_flight) => Err(CoreError::conflict(
            EntityKind::Vm,
            &record.vm.name,
            operation,
            format!("'{}' is still in progress", in_flight.operation),
        )),
        None => Ok(()),
    }
}

fn ensure_settled(vm: &Vm, operation: &str) -> Result<()> {
    if vm.state.is_transient() {
        return Err(CoreError::conflict(
            EntityKind::Vm,
            &vm.name,
            operation,
            format!("not allowed while {}", vm.state),
        ));
    }
    Ok(())
}

/// Boot order with `first` moved to the front.
fn boot_first(boot: &[BootDevice], first: BootDevice) -> Vec<BootDevice> {
    let mut order = vec![first];
    order.extend(boot.iter().copied().filter(|d| *d != first));
    order
}

pub struct LifecycleManager {
    config: Arc<CoreConfig>,
    hypervisor: Arc<dyn Hypervisor>,
    catalog: Arc<VmCatalog>,
    registry: Arc<ResourceRegistry>,
    locks: Arc<EntityLocks>,
    dispatcher: Arc<Dispatcher>,
    reconciler: Arc<Reconciler>,
}

impl LifecycleManager {
    pub fn new(
        config: Arc<CoreConfig>,
        hypervisor: Arc<dyn Hypervisor>,
        catalog: Arc<VmCatalog>,
        registry: Arc<ResourceRegistry>,
        locks: Arc<EntityLocks>,
        dispatcher: Arc<Dispatcher>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            config,
            hypervisor,
            catalog,
            registry,
            locks,
            dispatcher,
            reconciler,
        }
    }

    pub async fn get(&self, name: &str) -> Result<Vm> {
        self.catalog.vm(name).await
    }

    pub async fn list(&self) -> Vec<Vm> {
        self.catalog.list().await
    }

    // =========================================================================
    // Create / Clone / Delete
    // =========================================================================

    /// Create a VM around a new or an existing volume. The VM starts out
    /// `defined`. A volume allocated here is removed again if the
    /// definition fails.
    #[instrument(skip(self, cmd, cancel), fields(vm = %cmd.name))]
    pub async fn create(&self, cmd: CreateVm, cancel: &CancellationToken) -> Result<Vm> {
        let pool = match &cmd.disk {
            DiskSource::New { pool, .. } | DiskSource::Existing { pool, .. } => pool
                .clone()
                .unwrap_or_else(|| self.config.default_pool.clone()),
        };
        let mut keys = vec![EntityKey::Vm(cmd.name.clone()), EntityKey::Pool(pool.clone())];
        if let Some(network) = &cmd.network {
            keys.push(EntityKey::Network(network.clone()));
        }
        if let Some(iso) = &cmd.iso {
            keys.push(iso_key(iso));
        }
        let _guards = self.locks.lock_many(keys).await;

        if self.catalog.contains(&cmd.name).await {
            return Err(CoreError::conflict(
                EntityKind::Vm,
                &cmd.name,
                "create",
                "a VM with this name already exists",
            ));
        }
        if let Some(network) = &cmd.network {
            self.registry.get_network(network).await?;
        }
        if let Some(iso) = &cmd.iso {
            self.check_iso(iso)?;
        }

        let (volume, allocated) = match &cmd.disk {
            DiskSource::New {
                size_gib, format, ..
            } => {
                let request = CreateVolume {
                    name: format!("{}.{}", cmd.name, format.extension()),
                    capacity_gib: *size_gib,
                    format: *format,
                };
                let volume = self
                    .registry
                    .create_volume_locked(&pool, &request, cancel)
                    .await?;
                (volume, true)
            }
            DiskSource::Existing { volume, .. } => {
                let volume = self.registry.get_volume(&pool, volume).await?;
                let users = self.catalog.volume_references(&volume.path).await;
                if !users.is_empty() {
                    return Err(CoreError::conflict(
                        EntityKind::Volume,
                        format!("{}/{}", pool, volume.name),
                        "import",
                        format!("already used by vm '{}'", users.join("', '")),
                    ));
                }
                (volume, false)
            }
        };

        let config = self.build_config(&cmd, &volume);
        let hv = self.hypervisor.clone();
        let request = config.clone();
        let defined = self
            .dispatcher
            .call(Target::new(EntityKind::Vm, &cmd.name), "create", cancel, async move {
                hv.define_vm(&request).await
            })
            .await;

        if let Err(e) = defined {
            if allocated && outcome_known(&e) {
                self.discard_volume(&pool, &volume).await;
            } else if allocated {
                warn!(volume = %volume.path, error = %e, "Definition outcome unknown, leaving volume for reconciliation");
            }
            return Err(e);
        }

        let vm = Vm::from_config(&config, VmState::Defined);
        self.catalog.insert(VmRecord::new(vm.clone())).await?;
        info!(uuid = %vm.uuid, disk = %volume.path, "VM created");
        Ok(vm)
    }

    fn build_config(&self, cmd: &CreateVm, volume: &StorageVolume) -> VmConfig {
        let mut config = VmConfig::new(&cmd.name)
            .with_memory(cmd.memory_mib)
            .with_arch(cmd.arch.clone().unwrap_or_else(|| self.config.default_arch.clone()))
            .with_boot_order(cmd.boot_order())
            .with_disk(DiskConfig {
                source: volume.path.clone(),
                target: format!("{}a", cmd.disk_bus.device_prefix()),
                bus: cmd.disk_bus,
                format: volume.format,
                bootable: true,
                readonly: false,
            });
        config.cpu = CpuConfig {
            vcpus: cmd.cpu,
            model: cmd.cpu_model.clone(),
        };
        config.machine = cmd.machine;
        config.clock = cmd.clock;
        config.autostart = cmd.autostart;

        // q35 has no IDE controller.
        let cdrom_bus = match cmd.machine {
            MachineType::Q35 => DiskBus::Sata,
            MachineType::Pc => DiskBus::Ide,
        };
        let mut cdrom = CdromConfig::empty(cdrom_bus);
        cdrom.media = cmd.iso.as_ref().map(|p| p.to_string_lossy().into_owned());
        config.cdrom = Some(cdrom);

        if let Some(network) = &cmd.network {
            config.nics.push(NicConfig {
                kind: NicKind::Network,
                source: network.clone(),
                mac: generate_mac_address(),
                model: cmd.net_model,
            });
        }
        config
    }

    /// Best-effort removal of a volume this manager just allocated.
    async fn discard_volume(&self, pool: &str, volume: &StorageVolume) {
        let cleanup = self
            .registry
            .delete_volume_locked(pool, &volume.name, &CancellationToken::new())
            .await;
        match cleanup {
            Ok(()) => debug!(volume = %volume.path, "Removed volume after failed create"),
            Err(e) => warn!(volume = %volume.path, error = %e, "Failed to remove volume after failed create"),
        }
    }

    /// Copy a VM and its volumes under a new name. Snapshots are not copied;
    /// every NIC gets a fresh MAC.
    #[instrument(skip(self, cmd, cancel), fields(vm = %name, new_name = %cmd.new_name))]
    pub async fn clone_vm(&self, name: &str, cmd: CloneVm, cancel: &CancellationToken) -> Result<Vm> {
        let source = self.catalog.vm(name).await?;
        let mut volumes = Vec::with_capacity(source.disks.len());
        for disk in &source.disks {
            let volume = self
                .registry
                .volume_by_path(&disk.source)
                .await
                .ok_or_else(|| CoreError::not_found(EntityKind::Volume, &disk.source))?;
            volumes.push(volume);
        }

        let mut keys = vec![
            EntityKey::Vm(name.to_string()),
            EntityKey::Vm(cmd.new_name.clone()),
        ];
        keys.extend(volumes.iter().map(|v| EntityKey::Pool(v.pool.clone())));
        let iso = source.iso().map(str::to_string);
        if let Some(iso) = &iso {
            keys.push(iso_key(Path::new(iso)));
        }
        let _guards = self.locks.lock_many(keys).await;

        let record = self.catalog.get(name).await?;
        ensure_idle(&record, "clone")?;
        let source = record.vm;
        if source.state.is_active() {
            return Err(CoreError::conflict(
                EntityKind::Vm,
                name,
                "clone",
                format!("not allowed while {}", source.state),
            ));
        }
        if source.disks.len() != volumes.len()
            || source.disks.iter().zip(&volumes).any(|(d, v)| d.source != v.path)
            || source.iso() != iso.as_deref()
        {
            return Err(CoreError::conflict(
                EntityKind::Vm,
                name,
                "clone",
                "disks or media changed while preparing the clone, retry",
            ));
        }
        if self.catalog.contains(&cmd.new_name).await {
            return Err(CoreError::conflict(
                EntityKind::Vm,
                &cmd.new_name,
                "clone",
                "a VM with this name already exists",
            ));
        }

        let mut config = source.to_config();
        config.id = Uuid::new_v4().to_string();
        config.name = cmd.new_name.clone();
        config.autostart = false;
        for nic in &mut config.nics {
            nic.mac = generate_mac_address();
        }

        let mut copies: Vec<StorageVolume> = Vec::new();
        for (disk, volume) in config.disks.iter_mut().zip(&volumes) {
            let target_name = format!("{}-{}.{}", cmd.new_name, disk.target, volume.format.extension());
            match self
                .registry
                .clone_volume_locked(&volume.pool, &volume.name, &target_name, cancel)
                .await
            {
                Ok(copy) => {
                    disk.source = copy.path.clone();
                    copies.push(copy);
                }
                Err(e) => {
                    self.discard_copies(&copies).await;
                    return Err(e);
                }
            }
        }

        let hv = self.hypervisor.clone();
        let request = config.clone();
        let defined = self
            .dispatcher
            .call(Target::new(EntityKind::Vm, &cmd.new_name), "clone", cancel, async move {
                hv.define_vm(&request).await
            })
            .await;
        if let Err(e) = defined {
            if outcome_known(&e) {
                self.discard_copies(&copies).await;
            }
            return Err(e);
        }

        let vm = Vm::from_config(&config, VmState::Defined);
        self.catalog.insert(VmRecord::new(vm.clone())).await?;
        info!(uuid = %vm.uuid, volumes = copies.len(), "VM cloned");
        Ok(vm)
    }

    async fn discard_copies(&self, copies: &[StorageVolume]) {
        for copy in copies {
            self.discard_volume(&copy.pool, copy).await;
        }
    }

    /// Undefine a VM and drop its snapshots. With `remove_volumes` its disk
    /// volumes are deleted as well, unless another VM still uses them.
    #[instrument(skip(self, cancel), fields(vm = %name))]
    pub async fn delete(&self, name: &str, remove_volumes: bool, cancel: &CancellationToken) -> Result<()> {
        let key = EntityKey::Vm(name.to_string());
        let guard = self.locks.lock(key.clone()).await;

        let record = self.catalog.get(name).await?;
        ensure_idle(&record, "delete")?;
        let planned = plan(name, VmOp::Delete, record.vm.state)?;

        let hv = self.hypervisor.clone();
        let uuid = record.vm.uuid.clone();
        self.dispatcher
            .call_vm(name, &record.vm.uuid, &planned.describe(VmOp::Delete), cancel, async move {
                hv.undefine_vm(&uuid).await
            })
            .await?;

        let removed = self.catalog.remove(name).await;
        let snapshots = removed.map(|r| r.snapshots.len()).unwrap_or_default();
        info!(snapshots, "VM deleted");

        if remove_volumes {
            for disk in &record.vm.disks {
                let Some(volume) = self.registry.volume_by_path(&disk.source).await else {
                    continue;
                };
                let _pool = self.locks.lock(EntityKey::Pool(volume.pool.clone())).await;
                if let Err(e) = self
                    .registry
                    .delete_volume_locked(&volume.pool, &volume.name, &CancellationToken::new())
                    .await
                {
                    warn!(volume = %volume.path, error = %e, "Keeping volume of deleted VM");
                }
            }
        }

        drop(guard);
        self.locks.forget(&key);
        Ok(())
    }

    // =========================================================================
    // Power state transitions
    // =========================================================================

    /// Start a VM. Starting a running VM succeeds without a driver call.
    ///
    /// Every disk must resolve to a volume in an active pool and every NIC
    /// to an active network.
    #[instrument(skip(self, cancel), fields(vm = %name))]
    pub async fn start(&self, name: &str, cancel: &CancellationToken) -> Result<Vm> {
        self.transition(name, VmOp::Start, cancel).await
    }

    /// Ask the guest to power off. The VM passes through `shutting-down`
    /// until the driver reports it off.
    #[instrument(skip(self, cancel), fields(vm = %name))]
    pub async fn shutdown(&self, name: &str, cancel: &CancellationToken) -> Result<Vm> {
        self.transition(name, VmOp::Shutdown, cancel).await
    }

    /// Power a VM off immediately.
    #[instrument(skip(self, cancel), fields(vm = %name))]
    pub async fn destroy(&self, name: &str, cancel: &CancellationToken) -> Result<Vm> {
        self.transition(name, VmOp::Destroy, cancel).await
    }

    #[instrument(skip(self, cancel), fields(vm = %name))]
    pub async fn reboot(&self, name: &str, cancel: &CancellationToken) -> Result<Vm> {
        self.transition(name, VmOp::Reboot, cancel).await
    }

    #[instrument(skip(self, cancel), fields(vm = %name))]
    pub async fn suspend(&self, name: &str, cancel: &CancellationToken) -> Result<Vm> {
        self.transition(name, VmOp::Suspend, cancel).await
    }

    #[instrument(skip(self, cancel), fields(vm = %name))]
    pub async fn resume(&self, name: &str, cancel: &CancellationToken) -> Result<Vm> {
        self.transition(name, VmOp::Resume, cancel).await
    }

    async fn transition(&self, name: &str, op: VmOp, cancel: &CancellationToken) -> Result<Vm> {
        let _guard = self.locks.lock(EntityKey::Vm(name.to_string())).await;

        let record = self.catalog.get(name).await?;
        ensure_idle(&record, op.as_str())?;
        let planned = plan(name, op, record.vm.state)?;
        let via = match planned {
            Plan::Noop => {
                debug!(op = %op, state = %record.vm.state, "Already in requested state");
                return Ok(record.vm);
            }
            Plan::Transition { via, .. } => via,
            Plan::Remove { .. } => {
                return Err(CoreError::conflict(EntityKind::Vm, name, op.as_str(), "not a power operation"))
            }
        };

        if op == VmOp::Start {
            self.check_resources(&record.vm).await?;
        }
        if let Some(via) = via {
            self.catalog.update(name, |r| r.vm.set_state(via)).await?;
        }

        let label = planned.describe(op);
        let hv = self.hypervisor.clone();
        let uuid = record.vm.uuid.clone();
        let result = self
            .dispatcher
            .call_vm(name, &record.vm.uuid, &label, cancel, async move {
                match op {
                    VmOp::Start => hv.start_vm(&uuid).await,
                    VmOp::Shutdown => hv.shutdown_vm(&uuid, true).await,
                    VmOp::Destroy => hv.destroy_vm(&uuid).await,
                    VmOp::Reboot => hv.reboot_vm(&uuid).await,
                    VmOp::Suspend => hv.suspend_vm(&uuid).await,
                    VmOp::Resume => hv.resume_vm(&uuid).await,
                    VmOp::Delete => hv.undefine_vm(&uuid).await,
                }
            })
            .await;

        // The driver may still act on an abandoned call; its completion
        // triggers a reconcile pass that records the outcome.
        if let Err(e) = &result {
            if !outcome_known(e) {
                warn!(op = %label, error = %e, "VM transition outcome unknown");
                return result.map(|_| record.vm);
            }
        }

        let observed = self.reconciler.observe_vm(name).await;
        match (result, observed) {
            (Ok(()), Ok(vm)) => {
                info!(op = %label, state = %vm.state, "VM transition done");
                Ok(vm)
            }
            (Ok(()), Err(e)) => {
                // Acknowledged but unobservable: record the planned target.
                warn!(error = %e, "Cannot observe VM state after transition");
                if let Plan::Transition { to, .. } = planned {
                    self.catalog.update(name, |r| r.vm.set_state(to)).await?;
                }
                self.catalog.vm(name).await
            }
            (Err(e), observed) => {
                match observed {
                    Ok(vm) => warn!(op = %label, state = %vm.state, error = %e, "VM transition failed"),
                    Err(obs) => warn!(op = %label, error = %e, observe_error = %obs, "VM transition failed, state unknown"),
                }
                Err(e)
            }
        }
    }

    async fn check_resources(&self, vm: &Vm) -> Result<()> {
        for disk in &vm.disks {
            let volume = self
                .registry
                .volume_by_path(&disk.source)
                .await
                .ok_or_else(|| CoreError::not_found(EntityKind::Volume, &disk.source))?;
            let pool = self.registry.get_pool(&volume.pool).await?;
            if !pool.active {
                return Err(CoreError::conflict(
                    EntityKind::Vm,
                    &vm.name,
                    "start",
                    format!("pool '{}' of disk {} is not active", pool.name, disk.target),
                ));
            }
        }
        for nic in &vm.nics {
            let network = self.registry.get_network(&nic.source).await?;
            if !network.active {
                return Err(CoreError::conflict(
                    EntityKind::Vm,
                    &vm.name,
                    "start",
                    format!("network '{}' is not active", network.name),
                ));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Definition changes
    // =========================================================================

    /// Change vCPUs and memory. Only while the VM is not running.
    #[instrument(skip(self, cmd, cancel), fields(vm = %name))]
    pub async fn update(&self, name: &str, cmd: UpdateVm, cancel: &CancellationToken) -> Result<Vm> {
        let _guard = self.locks.lock(EntityKey::Vm(name.to_string())).await;
        let record = self.catalog.get(name).await?;
        ensure_idle(&record, "update")?;
        if record.vm.state.is_active() {
            return Err(CoreError::conflict(
                EntityKind::Vm,
                name,
                "update",
                format!("cannot resize while {}, stop the VM first", record.vm.state),
            ));
        }
        if cmd.cpu.is_none() && cmd.memory_mib.is_none() {
            return Ok(record.vm);
        }

        let mut vm = record.vm;
        if let Some(cpu) = cmd.cpu {
            vm.cpu = cpu;
        }
        if let Some(memory) = cmd.memory_mib {
            vm.memory_mib = memory;
        }
        self.redefine(&vm, "update", cancel).await?;

        let updated = self
            .catalog
            .update(name, |r| {
                r.vm.cpu = vm.cpu;
                r.vm.memory_mib = vm.memory_mib;
                r.vm.clone()
            })
            .await?;
        info!(cpu = updated.cpu, memory_mib = updated.memory_mib, "VM resized");
        Ok(updated)
    }

    async fn redefine(&self, vm: &Vm, operation: &str, cancel: &CancellationToken) -> Result<()> {
        let hv = self.hypervisor.clone();
        let config = vm.to_config();
        self.dispatcher
            .call_vm(&vm.name, &vm.uuid, operation, cancel, async move {
                hv.define_vm(&config).await
            })
            .await
    }

    /// Rename a VM that is not running.
    #[instrument(skip(self, cmd, cancel), fields(vm = %name, new_name = %cmd.new_name))]
    pub async fn rename(&self, name: &str, cmd: RenameVm, cancel: &CancellationToken) -> Result<Vm> {
        let old_key = EntityKey::Vm(name.to_string());
        let guards = self
            .locks
            .lock_many(vec![old_key.clone(), EntityKey::Vm(cmd.new_name.clone())])
            .await;

        let record = self.catalog.get(name).await?;
        ensure_idle(&record, "rename")?;
        if !matches!(record.vm.state, VmState::Defined | VmState::Stopped) {
            return Err(CoreError::conflict(
                EntityKind::Vm,
                name,
                "rename",
                format!("not allowed while {}", record.vm.state),
            ));
        }
        if name == cmd.new_name {
            return Ok(record.vm);
        }
        if self.catalog.contains(&cmd.new_name).await {
            return Err(CoreError::conflict(
                EntityKind::Vm,
                name,
                "rename",
                format!("a VM named '{}' already exists", cmd.new_name),
            ));
        }

        let hv = self.hypervisor.clone();
        let (uuid, new_name) = (record.vm.uuid.clone(), cmd.new_name.clone());
        self.dispatcher
            .call_vm(name, &record.vm.uuid, "rename", cancel, async move {
                hv.rename_vm(&uuid, &new_name).await
            })
            .await?;

        let vm = self.catalog.rename(name, &cmd.new_name).await?;
        drop(guards);
        self.locks.forget(&old_key);
        info!("VM renamed");
        Ok(vm)
    }

    /// Set whether the VM starts with the host.
    #[instrument(skip(self, cancel), fields(vm = %name, enabled))]
    pub async fn set_autostart(&self, name: &str, enabled: bool, cancel: &CancellationToken) -> Result<Vm> {
        let _guard = self.locks.lock(EntityKey::Vm(name.to_string())).await;
        let record = self.catalog.get(name).await?;
        ensure_idle(&record, "set autostart")?;
        if record.vm.autostart == enabled {
            return Ok(record.vm);
        }

        let hv = self.hypervisor.clone();
        let uuid = record.vm.uuid.clone();
        self.dispatcher
            .call_vm(name, &record.vm.uuid, "set autostart", cancel, async move {
                hv.set_autostart(&uuid, enabled).await
            })
            .await?;
        self.catalog
            .update(name, |r| {
                r.vm.autostart = enabled;
                r.vm.clone()
            })
            .await
    }

    // =========================================================================
    // Disks
    // =========================================================================

    /// Attach an existing volume. The target is picked from the bus prefix
    /// when the command names none.
    #[instrument(skip(self, cmd, cancel), fields(vm = %name, pool = %cmd.pool, volume = %cmd.volume))]
    pub async fn attach_disk(&self, name: &str, cmd: AttachDisk, cancel: &CancellationToken) -> Result<Vm> {
        let _guards = self
            .locks
            .lock_many(vec![EntityKey::Vm(name.to_string()), EntityKey::Pool(cmd.pool.clone())])
            .await;

        let record = self.catalog.get(name).await?;
        ensure_idle(&record, "attach disk")?;
        let vm = record.vm;
        ensure_settled(&vm, "attach disk")?;

        let volume = self.registry.get_volume(&cmd.pool, &cmd.volume).await?;
        if vm.references_volume(&volume.path) {
            return Err(CoreError::conflict(
                EntityKind::Disk,
                format!("{}/{}", name, volume.name),
                "attach",
                "volume is already attached to this VM",
            ));
        }

        let target = match cmd.target {
            Some(target) => {
                if vm.target_in_use(&target) {
                    return Err(CoreError::conflict(
                        EntityKind::Disk,
                        format!("{}/{}", name, target),
                        "attach",
                        "target is already in use",
                    ));
                }
                target
            }
            None => next_target(&vm, cmd.bus).ok_or_else(|| {
                CoreError::conflict(
                    EntityKind::Disk,
                    name,
                    "attach",
                    format!("no free {} target left", cmd.bus.as_str()),
                )
            })?,
        };

        let disk = DiskConfig {
            source: volume.path.clone(),
            target,
            bus: cmd.bus,
            format: volume.format,
            bootable: false,
            readonly: cmd.readonly,
        };
        self.device_call(&vm, Device::Disk(disk.clone()), true, "attach disk", cancel)
            .await?;

        let updated = self
            .catalog
            .update(name, |r| {
                r.vm.disks.push(disk.clone());
                r.vm.clone()
            })
            .await?;
        info!(target = %disk.target, path = %disk.source, "Disk attached");
        Ok(updated)
    }

    /// Detach a disk by target. The boot disk stays while the VM runs.
    #[instrument(skip(self, cancel), fields(vm = %name, target = %target))]
    pub async fn detach_disk(&self, name: &str, target: &str, cancel: &CancellationToken) -> Result<Vm> {
        let _guard = self.locks.lock(EntityKey::Vm(name.to_string())).await;
        let record = self.catalog.get(name).await?;
        ensure_idle(&record, "detach disk")?;
        let vm = record.vm;
        ensure_settled(&vm, "detach disk")?;

        let disk = vm
            .disk(target)
            .cloned()
            .ok_or_else(|| CoreError::not_found(EntityKind::Disk, format!("{}/{}", name, target)))?;
        if disk.bootable && matches!(vm.state, VmState::Running | VmState::Paused) {
            return Err(CoreError::conflict(
                EntityKind::Disk,
                format!("{}/{}", name, target),
                "detach",
                "the boot disk cannot be removed while the VM is running",
            ));
        }

        self.device_call(&vm, Device::Disk(disk), false, "detach disk", cancel)
            .await?;
        let updated = self
            .catalog
            .update(name, |r| {
                r.vm.disks.retain(|d| d.target != target);
                r.vm.clone()
            })
            .await?;
        info!("Disk detached");
        Ok(updated)
    }

    // =========================================================================
    // NICs
    // =========================================================================

    /// Attach a NIC to a network. A MAC is generated when none is given.
    #[instrument(skip(self, cmd, cancel), fields(vm = %name, network = %cmd.network))]
    pub async fn attach_nic(&self, name: &str, cmd: AttachNic, cancel: &CancellationToken) -> Result<Vm> {
        let _guards = self
            .locks
            .lock_many(vec![
                EntityKey::Vm(name.to_string()),
                EntityKey::Network(cmd.network.clone()),
            ])
            .await;

        let record = self.catalog.get(name).await?;
        ensure_idle(&record, "attach nic")?;
        let vm = record.vm;
        ensure_settled(&vm, "attach nic")?;
        self.registry.get_network(&cmd.network).await?;

        let mac = match cmd.mac {
            Some(mac) => {
                if vm.nic(&mac).is_some() {
                    return Err(CoreError::conflict(
                        EntityKind::Nic,
                        format!("{}/{}", name, mac),
                        "attach",
                        "MAC address is already in use on this VM",
                    ));
                }
                mac
            }
            None => loop {
                let mac = generate_mac_address();
                if vm.nic(&mac).is_none() {
                    break mac;
                }
            },
        };

        let nic = NicConfig {
            kind: NicKind::Network,
            source: cmd.network.clone(),
            mac,
            model: cmd.model,
        };
        self.device_call(&vm, Device::Nic(nic.clone()), true, "attach nic", cancel)
            .await?;
        let updated = self
            .catalog
            .update(name, |r| {
                r.vm.nics.push(nic.clone());
                r.vm.clone()
            })
            .await?;
        info!(mac = %nic.mac, "NIC attached");
        Ok(updated)
    }

    /// Detach the NIC with the given MAC.
    #[instrument(skip(self, cancel), fields(vm = %name, mac = %mac))]
    pub async fn detach_nic(&self, name: &str, mac: &str, cancel: &CancellationToken) -> Result<Vm> {
        let mac = validate_mac(mac)?;
        let _guard = self.locks.lock(EntityKey::Vm(name.to_string())).await;
        let record = self.catalog.get(name).await?;
        ensure_idle(&record, "detach nic")?;
        let vm = record.vm;
        ensure_settled(&vm, "detach nic")?;

        let nic = vm
            .nic(&mac)
            .cloned()
            .ok_or_else(|| CoreError::not_found(EntityKind::Nic, format!("{}/{}", name, mac)))?;
        self.device_call(&vm, Device::Nic(nic), false, "detach nic", cancel)
            .await?;
        let updated = self
            .catalog
            .update(name, |r| {
                r.vm.nics.retain(|n| n.mac != mac);
                r.vm.clone()
            })
            .await?;
        info!("NIC detached");
        Ok(updated)
    }

    async fn device_call(
        &self,
        vm: &Vm,
        device: Device,
        attach: bool,
        operation: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let hv = self.hypervisor.clone();
        let uuid = vm.uuid.clone();
        let live = vm.state.is_active();
        self.dispatcher
            .call_vm(&vm.name, &vm.uuid, operation, cancel, async move {
                if attach {
                    hv.attach_device(&uuid, &device, live).await
                } else {
                    hv.detach_device(&uuid, &device, live).await
                }
            })
            .await
    }

    // =========================================================================
    // ISO media
    // =========================================================================

    fn check_iso(&self, path: &Path) -> Result<()> {
        let dir = &self.config.iso_dir;
        if path == dir || !path.starts_with(dir) {
            return Err(CoreError::invalid(
                "iso",
                format!("must be inside {}", dir.display()),
            ));
        }
        Ok(())
    }

    /// Insert an ISO, replacing any inserted one, and boot from CD-ROM first.
    #[instrument(skip(self, cmd, cancel), fields(vm = %name, iso = %cmd.path.display()))]
    pub async fn attach_iso(&self, name: &str, cmd: AttachIso, cancel: &CancellationToken) -> Result<Vm> {
        self.check_iso(&cmd.path)?;
        let media = cmd.path.to_string_lossy().into_owned();

        let _guards = self
            .locks
            .lock_many(vec![EntityKey::Vm(name.to_string()), iso_key(&cmd.path)])
            .await;
        let record = self.catalog.get(name).await?;
        ensure_idle(&record, "attach iso")?;
        let mut vm = record.vm;
        ensure_settled(&vm, "attach iso")?;

        if vm.cdrom.is_some() {
            let hv = self.hypervisor.clone();
            let (uuid, path) = (vm.uuid.clone(), media.clone());
            self.dispatcher
                .call_vm(name, &vm.uuid, "attach iso", cancel, async move {
                    hv.change_media(&uuid, Some(&path)).await
                })
                .await?;
        } else {
            let bus = match vm.machine {
                MachineType::Q35 => DiskBus::Sata,
                MachineType::Pc => DiskBus::Ide,
            };
            let mut cdrom = CdromConfig::empty(bus);
            cdrom.media = Some(media.clone());
            self.device_call(&vm, Device::Cdrom(cdrom), true, "attach iso", cancel)
                .await?;
            vm.cdrom = Some(CdromConfig::empty(bus));
        }
        if let Some(cdrom) = vm.cdrom.as_mut() {
            cdrom.media = Some(media);
        }

        let boot = boot_first(&vm.boot, BootDevice::Cdrom);
        if boot != vm.boot {
            vm.boot = boot;
            self.redefine(&vm, "set boot order", cancel).await?;
        }

        let updated = self
            .catalog
            .update(name, |r| {
                r.vm.cdrom = vm.cdrom.clone();
                r.vm.boot = vm.boot.clone();
                r.vm.clone()
            })
            .await?;
        info!("ISO attached");
        Ok(updated)
    }

    /// Eject the ISO. Ejecting an empty drive succeeds without a driver call.
    #[instrument(skip(self, cancel), fields(vm = %name))]
    pub async fn detach_iso(&self, name: &str, cancel: &CancellationToken) -> Result<Vm> {
        let _guard = self.locks.lock(EntityKey::Vm(name.to_string())).await;
        let record = self.catalog.get(name).await?;
        if record.vm.iso().is_none() {
            debug!("No ISO attached");
            return Ok(record.vm);
        }
        ensure_idle(&record, "detach iso")?;
        ensure_settled(&record.vm, "detach iso")?;
        self.eject(&record.vm, cancel).await?;
        let updated = self
            .catalog
            .update(name, |r| {
                if let Some(cdrom) = r.vm.cdrom.as_mut() {
                    cdrom.media = None;
                }
                r.vm.clone()
            })
            .await?;
        info!("ISO detached");
        Ok(updated)
    }

    async fn eject(&self, vm: &Vm, cancel: &CancellationToken) -> Result<()> {
        let hv = self.hypervisor.clone();
        let uuid = vm.uuid.clone();
        self.dispatcher
            .call_vm(&vm.name, &vm.uuid, "detach iso", cancel, async move {
                hv.change_media(&uuid, None).await
            })
            .await
    }

    /// Eject the install media and boot from disk first.
    #[instrument(skip(self, cancel), fields(vm = %name))]
    pub async fn finish_install(&self, name: &str, cancel: &CancellationToken) -> Result<Vm> {
        let _guard = self.locks.lock(EntityKey::Vm(name.to_string())).await;
        let record = self.catalog.get(name).await?;
        ensure_idle(&record, "finish install")?;
        let mut vm = record.vm;
        ensure_settled(&vm, "finish install")?;

        if vm.iso().is_some() {
            self.eject(&vm, cancel).await?;
            if let Some(cdrom) = vm.cdrom.as_mut() {
                cdrom.media = None;
            }
        }
        let boot = boot_first(&vm.boot, BootDevice::Disk);
        if boot != vm.boot {
            vm.boot = boot;
            self.redefine(&vm, "set boot order", cancel).await?;
        }

        let updated = self
            .catalog
            .update(name, |r| {
                r.vm.cdrom = vm.cdrom.clone();
                r.vm.boot = vm.boot.clone();
                r.vm.clone()
            })
            .await?;
        info!("Installation finished");
        Ok(updated)
    }

    // =========================================================================
    // Batch
    // =========================================================================

    /// Apply one action to several VMs concurrently.
    #[instrument(skip(self, cmd, cancel), fields(action = cmd.action.as_str(), count = cmd.names.len()))]
    pub async fn batch(&self, cmd: Batch, cancel: &CancellationToken) -> Vec<BatchOutcome> {
        let action = cmd.action;
        let runs = cmd.names.into_iter().map(|name| async move {
            let result = match action {
                BatchAction::Start => self.start(&name, cancel).await.map(|_| ()),
                BatchAction::Shutdown => self.shutdown(&name, cancel).await.map(|_| ()),
                BatchAction::Destroy => self.destroy(&name, cancel).await.map(|_| ()),
                BatchAction::Delete => self.delete(&name, false, cancel).await,
            };
            BatchOutcome { name, result }
        });
        let outcomes = join_all(runs).await;
        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        info!(failed, "Batch finished");
        outcomes
    }
}

/// First free device node on `bus`, e.g. `vdb`.
fn next_target(vm: &Vm, bus: DiskBus) -> Option<String> {
    (b'a'..=b'z')
        .map(|c| format!("{}{}", bus.device_prefix(), c as char))
        .find(|target| !vm.target_in_use(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_first() {
        let order = vec![BootDevice::Disk, BootDevice::Cdrom];
        assert_eq!(
            boot_first(&order, BootDevice::Cdrom),
            vec![BootDevice::Cdrom, BootDevice::Disk]
        );
        assert_eq!(boot_first(&order, BootDevice::Disk), order);
    }

    #[test]
    fn test_next_target_skips_used_nodes() {
        let config = VmConfig::new("web")
            .with_disk(DiskConfig::new("/p/a.qcow2", "vda"))
            .with_disk(DiskConfig::new("/p/b.qcow2", "vdb"));
        let vm = Vm::from_config(&config, VmState::Defined);
        assert_eq!(next_target(&vm, DiskBus::Virtio).as_deref(), Some("vdc"));
        assert_eq!(next_target(&vm, DiskBus::Sata).as_deref(), Some("sda"));
    }

    #[test]
    fn test_unknown_outcomes_skip_cleanup() {
        assert!(!outcome_known(&CoreError::cancelled(EntityKind::Vm, "v", "create")));
        assert!(!outcome_known(&CoreError::unavailable(EntityKind::Vm, "v", "create", "timeout")));
        assert!(outcome_known(&CoreError::conflict(EntityKind::Vm, "v", "create", "dup")));
    }
}
