//! Mock hypervisor and host network backends for testing and development.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{HypervisorError, Result};
use crate::forward::PortForward;
use crate::traits::{HostNetwork, Hypervisor, HypervisorCapabilities};
use crate::types::*;

const GIB: u64 = 1024 * 1024 * 1024;

fn poisoned<T>(_: PoisonError<T>) -> HypervisorError {
    HypervisorError::Internal("Lock poisoned".to_string())
}

/// What a graceful shutdown request does to a running mock domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownBehavior {
    /// The guest powers off before the call returns.
    #[default]
    Immediate,
    /// The guest acknowledges and stays in `ShuttingDown`.
    Acknowledge,
}

#[derive(Debug, Clone)]
enum Fault {
    /// Fail without touching state.
    Fail(HypervisorError),
    /// Apply the change, then report failure.
    ApplyThenFail(HypervisorError),
}

struct MockDomain {
    config: VmConfig,
    state: PowerState,
    snapshots: Vec<MockSnapshot>,
}

struct MockSnapshot {
    info: SnapshotInfo,
    config: VmConfig,
}

struct MockPool {
    config: PoolConfig,
    active: bool,
    capacity_bytes: u64,
    volumes: BTreeMap<String, VolumeInfo>,
}

impl MockPool {
    fn info(&self) -> PoolInfo {
        let allocation: u64 = self.volumes.values().map(|v| v.allocation_bytes).sum();
        PoolInfo {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            pool_type: self.config.pool_type,
            path: self.config.path.clone(),
            active: self.active,
            capacity_bytes: self.capacity_bytes,
            allocation_bytes: allocation,
            available_bytes: self.capacity_bytes.saturating_sub(allocation),
            volumes: self.volumes.values().cloned().collect(),
        }
    }
}

/// Mock hypervisor backend for testing.
///
/// This backend simulates domains, pools and networks in memory without
/// requiring an actual hypervisor. Besides the [`Hypervisor`] contract it
/// offers hooks to simulate what a real host does behind the core's back:
/// injected failures, lost connectivity, slow calls and out-of-band state
/// changes.
pub struct MockBackend {
    domains: RwLock<HashMap<String, MockDomain>>,
    pools: RwLock<BTreeMap<String, MockPool>>,
    networks: RwLock<BTreeMap<String, NetworkInfo>>,
    faults: RwLock<HashMap<String, Fault>>,
    calls: RwLock<Vec<String>>,
    latency: RwLock<Duration>,
    shutdown_behavior: RwLock<ShutdownBehavior>,
    connected: AtomicBool,
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        info!("Creating mock hypervisor backend");
        Self {
            domains: RwLock::new(HashMap::new()),
            pools: RwLock::new(BTreeMap::new()),
            networks: RwLock::new(BTreeMap::new()),
            faults: RwLock::new(HashMap::new()),
            calls: RwLock::new(Vec::new()),
            latency: RwLock::new(Duration::ZERO),
            shutdown_behavior: RwLock::new(ShutdownBehavior::default()),
            connected: AtomicBool::new(true),
        }
    }

    // =========================================================================
    // Test hooks
    // =========================================================================

    /// Make the next call of `op` (a trait method name) fail untouched.
    pub fn fail_next(&self, op: &str, error: HypervisorError) {
        if let Ok(mut faults) = self.faults.write() {
            faults.insert(op.to_string(), Fault::Fail(error));
        }
    }

    /// Make the next call of `op` apply its effect and then fail.
    pub fn fail_after_apply(&self, op: &str, error: HypervisorError) {
        if let Ok(mut faults) = self.faults.write() {
            faults.insert(op.to_string(), Fault::ApplyThenFail(error));
        }
    }

    /// Simulate losing (or regaining) the hypervisor connection.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut current) = self.latency.write() {
            *current = latency;
        }
    }

    pub fn set_shutdown_behavior(&self, behavior: ShutdownBehavior) {
        if let Ok(mut current) = self.shutdown_behavior.write() {
            *current = behavior;
        }
    }

    /// Names of the trait methods called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Change a domain's power state out of band (guest shutdown, crash).
    pub fn set_domain_state(&self, name: &str, state: PowerState) -> Result<()> {
        let mut domains = self.domains.write().map_err(poisoned)?;
        let domain = domains
            .values_mut()
            .find(|d| d.config.name == name)
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))?;
        domain.state = state;
        Ok(())
    }

    /// Undefine a domain out of band.
    pub fn remove_domain(&self, name: &str) -> Result<()> {
        let mut domains = self.domains.write().map_err(poisoned)?;
        let id = domains
            .iter()
            .find(|(_, d)| d.config.name == name)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))?;
        domains.remove(&id);
        Ok(())
    }

    /// Define a domain out of band, as another tool on the host would.
    pub fn insert_domain(&self, config: VmConfig, state: PowerState) -> Result<()> {
        let mut domains = self.domains.write().map_err(poisoned)?;
        domains.insert(
            config.id.clone(),
            MockDomain {
                config,
                state,
                snapshots: Vec::new(),
            },
        );
        Ok(())
    }

    /// Toggle a pool out of band (unmounted storage).
    pub fn set_pool_active(&self, name: &str, active: bool) -> Result<()> {
        let mut pools = self.pools.write().map_err(poisoned)?;
        let pool = pools
            .get_mut(name)
            .ok_or_else(|| HypervisorError::PoolNotFound(name.to_string()))?;
        pool.active = active;
        Ok(())
    }

    /// Current definition and state of a domain, by name.
    pub fn domain(&self, name: &str) -> Option<DomainInfo> {
        let domains = self.domains.read().ok()?;
        domains
            .values()
            .find(|d| d.config.name == name)
            .map(Self::domain_info)
    }

    fn domain_info(domain: &MockDomain) -> DomainInfo {
        DomainInfo {
            config: domain.config.clone(),
            state: domain.state,
            snapshots: domain.snapshots.iter().map(|s| s.info.name.clone()).collect(),
        }
    }

    /// Record the call, apply latency and connectivity, and pop any fault.
    ///
    /// Returns the error to report after applying the change, if any.
    async fn gate(&self, op: &str) -> Result<Option<HypervisorError>> {
        self.calls.write().map_err(poisoned)?.push(op.to_string());

        let latency = *self.latency.read().map_err(poisoned)?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if !self.connected.load(Ordering::SeqCst) {
            return Err(HypervisorError::ConnectionFailed(
                "mock hypervisor is disconnected".to_string(),
            ));
        }

        match self.faults.write().map_err(poisoned)?.remove(op) {
            Some(Fault::Fail(e)) => {
                debug!(op, error = %e, "Injected failure");
                Err(e)
            }
            Some(Fault::ApplyThenFail(e)) => Ok(Some(e)),
            None => Ok(None),
        }
    }

    fn settle(deferred: Option<HypervisorError>) -> Result<()> {
        match deferred {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn with_domain<T>(
        &self,
        vm_id: &str,
        f: impl FnOnce(&mut MockDomain) -> Result<T>,
    ) -> Result<T> {
        let mut domains = self.domains.write().map_err(poisoned)?;
        let domain = domains
            .get_mut(vm_id)
            .ok_or_else(|| HypervisorError::DomainNotFound(vm_id.to_string()))?;
        f(domain)
    }

    fn with_pool<T>(&self, name: &str, f: impl FnOnce(&mut MockPool) -> Result<T>) -> Result<T> {
        let mut pools = self.pools.write().map_err(poisoned)?;
        let pool = pools
            .get_mut(name)
            .ok_or_else(|| HypervisorError::PoolNotFound(name.to_string()))?;
        f(pool)
    }

    fn with_network<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut NetworkInfo) -> Result<T>,
    ) -> Result<T> {
        let mut networks = self.networks.write().map_err(poisoned)?;
        let network = networks
            .get_mut(name)
            .ok_or_else(|| HypervisorError::NetworkNotFound(name.to_string()))?;
        f(network)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn require_state(domain: &MockDomain, allowed: &[PowerState], op: &str) -> Result<()> {
    if allowed.contains(&domain.state) {
        Ok(())
    } else {
        Err(HypervisorError::InvalidState(format!(
            "cannot {} domain '{}' in state {:?}",
            op, domain.config.name, domain.state
        )))
    }
}

/// A live device change needs a running domain.
fn require_live_target(domain: &MockDomain, live: bool, op: &str) -> Result<()> {
    if live && !domain.state.is_active() {
        return Err(HypervisorError::InvalidState(format!(
            "cannot {} a device live: domain '{}' is {:?}",
            op, domain.config.name, domain.state
        )));
    }
    Ok(())
}

#[async_trait]
impl Hypervisor for MockBackend {
    async fn capabilities(&self) -> Result<HypervisorCapabilities> {
        Ok(HypervisorCapabilities {
            name: "mock".to_string(),
            version: "1.0.0".to_string(),
            supports_snapshots: true,
            supports_hotplug: true,
            max_vcpus: 256,
            max_memory_mib: 1024 * 1024, // 1TB
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.connected.load(Ordering::SeqCst))
    }

    #[instrument(skip(self, config), fields(vm_id = %config.id, vm_name = %config.name))]
    async fn define_vm(&self, config: &VmConfig) -> Result<()> {
        let deferred = self.gate("define_vm").await?;

        {
            let mut domains = self.domains.write().map_err(poisoned)?;
            if domains
                .values()
                .any(|d| d.config.name == config.name && d.config.id != config.id)
            {
                return Err(HypervisorError::AlreadyExists(format!(
                    "domain '{}' already exists",
                    config.name
                )));
            }

            match domains.get_mut(&config.id) {
                Some(domain) => {
                    debug!("Redefining mock domain");
                    domain.config = config.clone();
                }
                None => {
                    domains.insert(
                        config.id.clone(),
                        MockDomain {
                            config: config.clone(),
                            state: PowerState::Shutoff,
                            snapshots: Vec::new(),
                        },
                    );
                }
            }
        }

        info!("Mock domain defined");
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    async fn undefine_vm(&self, vm_id: &str) -> Result<()> {
        let deferred = self.gate("undefine_vm").await?;

        {
            let mut domains = self.domains.write().map_err(poisoned)?;
            let domain = domains
                .get(vm_id)
                .ok_or_else(|| HypervisorError::DomainNotFound(vm_id.to_string()))?;
            if domain.state.is_active() {
                return Err(HypervisorError::InvalidState(
                    "cannot undefine an active domain".to_string(),
                ));
            }
            domains.remove(vm_id);
        }

        info!("Mock domain undefined");
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    async fn start_vm(&self, vm_id: &str) -> Result<()> {
        let deferred = self.gate("start_vm").await?;
        self.with_domain(vm_id, |domain| {
            require_state(domain, &[PowerState::Shutoff, PowerState::Crashed], "start")?;
            domain.state = PowerState::Running;
            Ok(())
        })?;
        info!("Mock domain started");
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(vm_id = %vm_id, graceful))]
    async fn shutdown_vm(&self, vm_id: &str, graceful: bool) -> Result<()> {
        let deferred = self.gate("shutdown_vm").await?;
        let behavior = *self.shutdown_behavior.read().map_err(poisoned)?;
        self.with_domain(vm_id, |domain| {
            if graceful {
                require_state(domain, &[PowerState::Running, PowerState::Blocked], "shut down")?;
                domain.state = match behavior {
                    ShutdownBehavior::Immediate => PowerState::Shutoff,
                    ShutdownBehavior::Acknowledge => PowerState::ShuttingDown,
                };
            } else {
                if !domain.state.is_active() {
                    return Err(HypervisorError::InvalidState(
                        "domain is not running".to_string(),
                    ));
                }
                domain.state = PowerState::Shutoff;
            }
            Ok(())
        })?;
        info!("Mock domain shutdown requested");
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    async fn destroy_vm(&self, vm_id: &str) -> Result<()> {
        let deferred = self.gate("destroy_vm").await?;
        self.with_domain(vm_id, |domain| {
            if !domain.state.is_active() {
                return Err(HypervisorError::InvalidState("domain is not running".to_string()));
            }
            domain.state = PowerState::Shutoff;
            Ok(())
        })?;
        info!("Mock domain destroyed");
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    async fn suspend_vm(&self, vm_id: &str) -> Result<()> {
        let deferred = self.gate("suspend_vm").await?;
        self.with_domain(vm_id, |domain| {
            require_state(domain, &[PowerState::Running, PowerState::Blocked], "suspend")?;
            domain.state = PowerState::Paused;
            Ok(())
        })?;
        info!("Mock domain suspended");
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    async fn resume_vm(&self, vm_id: &str) -> Result<()> {
        let deferred = self.gate("resume_vm").await?;
        self.with_domain(vm_id, |domain| {
            require_state(domain, &[PowerState::Paused, PowerState::PmSuspended], "resume")?;
            domain.state = PowerState::Running;
            Ok(())
        })?;
        info!("Mock domain resumed");
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    async fn reboot_vm(&self, vm_id: &str) -> Result<()> {
        let deferred = self.gate("reboot_vm").await?;
        self.with_domain(vm_id, |domain| {
            require_state(domain, &[PowerState::Running, PowerState::Blocked], "reboot")
        })?;
        info!("Mock domain rebooted");
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(vm_id = %vm_id, new_name = %new_name))]
    async fn rename_vm(&self, vm_id: &str, new_name: &str) -> Result<()> {
        let deferred = self.gate("rename_vm").await?;
        {
            let mut domains = self.domains.write().map_err(poisoned)?;
            if domains.values().any(|d| d.config.name == new_name) {
                return Err(HypervisorError::AlreadyExists(format!(
                    "domain '{}' already exists",
                    new_name
                )));
            }
            let domain = domains
                .get_mut(vm_id)
                .ok_or_else(|| HypervisorError::DomainNotFound(vm_id.to_string()))?;
            require_state(domain, &[PowerState::Shutoff, PowerState::Crashed], "rename")?;
            domain.config.name = new_name.to_string();
        }
        info!("Mock domain renamed");
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(vm_id = %vm_id, enabled))]
    async fn set_autostart(&self, vm_id: &str, enabled: bool) -> Result<()> {
        let deferred = self.gate("set_autostart").await?;
        self.with_domain(vm_id, |domain| {
            domain.config.autostart = enabled;
            Ok(())
        })?;
        Self::settle(deferred)
    }

    async fn domain_state(&self, vm_id: &str) -> Result<PowerState> {
        self.gate("domain_state").await?;
        self.with_domain(vm_id, |domain| Ok(domain.state))
    }

    #[instrument(skip(self, device), fields(vm_id = %vm_id, device = %device.key(), live))]
    async fn attach_device(&self, vm_id: &str, device: &Device, live: bool) -> Result<()> {
        let deferred = self.gate("attach_device").await?;
        self.with_domain(vm_id, |domain| {
            require_live_target(domain, live, "attach")?;
            let config = &mut domain.config;
            match device {
                Device::Disk(disk) => {
                    let taken = config.disks.iter().any(|d| d.target == disk.target)
                        || config.cdrom.as_ref().is_some_and(|c| c.target == disk.target);
                    if taken {
                        return Err(HypervisorError::AlreadyExists(format!(
                            "target '{}' already in use",
                            disk.target
                        )));
                    }
                    config.disks.push(disk.clone());
                }
                Device::Cdrom(cdrom) => {
                    if config.cdrom.is_some() {
                        return Err(HypervisorError::AlreadyExists(
                            "domain already has a cdrom drive".to_string(),
                        ));
                    }
                    config.cdrom = Some(cdrom.clone());
                }
                Device::Nic(nic) => {
                    if config.nics.iter().any(|n| n.mac == nic.mac) {
                        return Err(HypervisorError::AlreadyExists(format!(
                            "mac '{}' already in use",
                            nic.mac
                        )));
                    }
                    config.nics.push(nic.clone());
                }
            }
            Ok(())
        })?;
        info!("Mock device attached");
        Self::settle(deferred)
    }

    #[instrument(skip(self, device), fields(vm_id = %vm_id, device = %device.key(), live))]
    async fn detach_device(&self, vm_id: &str, device: &Device, live: bool) -> Result<()> {
        let deferred = self.gate("detach_device").await?;
        self.with_domain(vm_id, |domain| {
            require_live_target(domain, live, "detach")?;
            let config = &mut domain.config;
            let before = config.disks.len() + config.nics.len() + usize::from(config.cdrom.is_some());
            match device {
                Device::Disk(disk) => config.disks.retain(|d| d.target != disk.target),
                Device::Cdrom(_) => config.cdrom = None,
                Device::Nic(nic) => config.nics.retain(|n| n.mac != nic.mac),
            }
            let after = config.disks.len() + config.nics.len() + usize::from(config.cdrom.is_some());
            if before == after {
                return Err(HypervisorError::DeviceNotFound(device.key().to_string()));
            }
            Ok(())
        })?;
        info!("Mock device detached");
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    async fn change_media(&self, vm_id: &str, media: Option<&str>) -> Result<()> {
        let deferred = self.gate("change_media").await?;
        self.with_domain(vm_id, |domain| {
            let cdrom = domain
                .config
                .cdrom
                .as_mut()
                .ok_or_else(|| HypervisorError::DeviceNotFound("cdrom".to_string()))?;
            cdrom.media = media.map(str::to_string);
            Ok(())
        })?;
        info!(media = ?media, "Mock media changed");
        Self::settle(deferred)
    }

    #[instrument(skip(self, description), fields(vm_id = %vm_id, snapshot = %name))]
    async fn create_snapshot(
        &self,
        vm_id: &str,
        name: &str,
        description: &str,
    ) -> Result<SnapshotInfo> {
        let deferred = self.gate("create_snapshot").await?;
        let info = self.with_domain(vm_id, |domain| {
            if domain.snapshots.iter().any(|s| s.info.name == name) {
                return Err(HypervisorError::AlreadyExists(format!(
                    "snapshot '{}' already exists",
                    name
                )));
            }
            let info = SnapshotInfo {
                name: name.to_string(),
                description: description.to_string(),
                created_at: chrono::Utc::now(),
                vm_state: domain.state,
            };
            domain.snapshots.push(MockSnapshot {
                info: info.clone(),
                config: domain.config.clone(),
            });
            Ok(info)
        })?;
        info!("Mock snapshot created");
        Self::settle(deferred)?;
        Ok(info)
    }

    #[instrument(skip(self), fields(vm_id = %vm_id, snapshot = %name))]
    async fn revert_snapshot(&self, vm_id: &str, name: &str) -> Result<()> {
        let deferred = self.gate("revert_snapshot").await?;
        self.with_domain(vm_id, |domain| {
            let snapshot = domain
                .snapshots
                .iter()
                .find(|s| s.info.name == name)
                .ok_or_else(|| HypervisorError::SnapshotNotFound(name.to_string()))?;
            let config = snapshot.config.clone();
            // A snapshot taken while running comes back running.
            let state = if snapshot.info.vm_state.is_active() {
                PowerState::Running
            } else {
                PowerState::Shutoff
            };
            domain.config = VmConfig {
                name: domain.config.name.clone(),
                autostart: domain.config.autostart,
                ..config
            };
            domain.state = state;
            Ok(())
        })?;
        info!("Mock snapshot reverted");
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(vm_id = %vm_id, snapshot = %name))]
    async fn delete_snapshot(&self, vm_id: &str, name: &str) -> Result<()> {
        let deferred = self.gate("delete_snapshot").await?;
        self.with_domain(vm_id, |domain| {
            let before = domain.snapshots.len();
            domain.snapshots.retain(|s| s.info.name != name);
            if domain.snapshots.len() == before {
                return Err(HypervisorError::SnapshotNotFound(name.to_string()));
            }
            Ok(())
        })?;
        info!("Mock snapshot deleted");
        Self::settle(deferred)
    }

    #[instrument(skip(self, config), fields(pool = %config.name))]
    async fn create_pool(&self, config: &PoolConfig) -> Result<()> {
        let deferred = self.gate("create_pool").await?;
        {
            let mut pools = self.pools.write().map_err(poisoned)?;
            if pools.contains_key(&config.name) {
                return Err(HypervisorError::AlreadyExists(format!(
                    "pool '{}' already exists",
                    config.name
                )));
            }
            pools.insert(
                config.name.clone(),
                MockPool {
                    config: config.clone(),
                    active: false,
                    capacity_bytes: 500 * GIB,
                    volumes: BTreeMap::new(),
                },
            );
        }
        info!("Mock pool created");
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(pool = %name))]
    async fn start_pool(&self, name: &str) -> Result<()> {
        let deferred = self.gate("start_pool").await?;
        self.with_pool(name, |pool| {
            if pool.active {
                return Err(HypervisorError::InvalidState("pool is already active".to_string()));
            }
            pool.active = true;
            Ok(())
        })?;
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(pool = %name))]
    async fn stop_pool(&self, name: &str) -> Result<()> {
        let deferred = self.gate("stop_pool").await?;
        self.with_pool(name, |pool| {
            if !pool.active {
                return Err(HypervisorError::InvalidState("pool is not active".to_string()));
            }
            pool.active = false;
            Ok(())
        })?;
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(pool = %name))]
    async fn delete_pool(&self, name: &str) -> Result<()> {
        let deferred = self.gate("delete_pool").await?;
        self.pools
            .write()
            .map_err(poisoned)?
            .remove(name)
            .ok_or_else(|| HypervisorError::PoolNotFound(name.to_string()))?;
        info!("Mock pool deleted");
        Self::settle(deferred)
    }

    async fn pool_info(&self, name: &str) -> Result<PoolInfo> {
        self.gate("pool_info").await?;
        self.with_pool(name, |pool| Ok(pool.info()))
    }

    #[instrument(skip(self, config), fields(pool = %pool, volume = %config.name))]
    async fn create_volume(&self, pool: &str, config: &VolumeConfig) -> Result<VolumeInfo> {
        let deferred = self.gate("create_volume").await?;
        let volume = self.with_pool(pool, |p| {
            if !p.active {
                return Err(HypervisorError::InvalidState(format!("pool '{}' is not active", pool)));
            }
            if p.volumes.contains_key(&config.name) {
                return Err(HypervisorError::AlreadyExists(format!(
                    "volume '{}' already exists",
                    config.name
                )));
            }
            let allocation = match config.format {
                DiskFormat::Raw => config.capacity_bytes,
                _ => 0,
            };
            let volume = VolumeInfo {
                name: config.name.clone(),
                path: format!("{}/{}", p.config.path.trim_end_matches('/'), config.name),
                volume_type: VolumeType::File,
                format: config.format,
                capacity_bytes: config.capacity_bytes,
                allocation_bytes: allocation,
            };
            p.volumes.insert(config.name.clone(), volume.clone());
            Ok(volume)
        })?;
        info!("Mock volume created");
        Self::settle(deferred)?;
        Ok(volume)
    }

    #[instrument(skip(self), fields(pool = %pool, volume = %name))]
    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        let deferred = self.gate("delete_volume").await?;
        self.with_pool(pool, |p| {
            p.volumes
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| HypervisorError::VolumeNotFound(name.to_string()))
        })?;
        info!("Mock volume deleted");
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(pool = %pool, source = %source, target = %target))]
    async fn clone_volume(&self, pool: &str, source: &str, target: &str) -> Result<VolumeInfo> {
        let deferred = self.gate("clone_volume").await?;
        let volume = self.with_pool(pool, |p| {
            if p.volumes.contains_key(target) {
                return Err(HypervisorError::AlreadyExists(format!(
                    "volume '{}' already exists",
                    target
                )));
            }
            let original = p
                .volumes
                .get(source)
                .ok_or_else(|| HypervisorError::VolumeNotFound(source.to_string()))?;
            let volume = VolumeInfo {
                name: target.to_string(),
                path: format!("{}/{}", p.config.path.trim_end_matches('/'), target),
                ..original.clone()
            };
            p.volumes.insert(target.to_string(), volume.clone());
            Ok(volume)
        })?;
        info!("Mock volume cloned");
        Self::settle(deferred)?;
        Ok(volume)
    }

    #[instrument(skip(self, config), fields(network = %config.name))]
    async fn create_network(&self, config: &NetworkConfig) -> Result<()> {
        let deferred = self.gate("create_network").await?;
        {
            let mut networks = self.networks.write().map_err(poisoned)?;
            if networks.contains_key(&config.name) {
                return Err(HypervisorError::AlreadyExists(format!(
                    "network '{}' already exists",
                    config.name
                )));
            }
            networks.insert(
                config.name.clone(),
                NetworkInfo {
                    config: config.clone(),
                    active: false,
                },
            );
        }
        info!("Mock network created");
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(network = %name))]
    async fn start_network(&self, name: &str) -> Result<()> {
        let deferred = self.gate("start_network").await?;
        self.with_network(name, |network| {
            if network.active {
                return Err(HypervisorError::InvalidState("network is already active".to_string()));
            }
            network.active = true;
            Ok(())
        })?;
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(network = %name))]
    async fn stop_network(&self, name: &str) -> Result<()> {
        let deferred = self.gate("stop_network").await?;
        self.with_network(name, |network| {
            if !network.active {
                return Err(HypervisorError::InvalidState("network is not active".to_string()));
            }
            network.active = false;
            Ok(())
        })?;
        Self::settle(deferred)
    }

    #[instrument(skip(self), fields(network = %name))]
    async fn delete_network(&self, name: &str) -> Result<()> {
        let deferred = self.gate("delete_network").await?;
        self.networks
            .write()
            .map_err(poisoned)?
            .remove(name)
            .ok_or_else(|| HypervisorError::NetworkNotFound(name.to_string()))?;
        info!("Mock network deleted");
        Self::settle(deferred)
    }

    async fn network_info(&self, name: &str) -> Result<NetworkInfo> {
        self.gate("network_info").await?;
        self.with_network(name, |network| Ok(network.clone()))
    }

    /// Active domains with a NIC on the network get consecutive addresses
    /// from the DHCP range, in MAC order.
    async fn dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>> {
        self.gate("dhcp_leases").await?;
        let info = self.with_network(network, |n| Ok(n.clone()))?;
        let Some(range) = info.config.dhcp.filter(|_| info.active) else {
            return Ok(Vec::new());
        };

        let mut clients: Vec<(String, String)> = self
            .domains
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|d| d.state.is_active())
            .flat_map(|d| {
                d.config
                    .nics
                    .iter()
                    .filter(|nic| nic.kind == NicKind::Network && nic.source == network)
                    .map(|nic| (nic.mac.clone(), d.config.name.clone()))
            })
            .collect();
        clients.sort();

        let (start, end) = (u32::from(range.start), u32::from(range.end));
        Ok(clients
            .into_iter()
            .zip(start..=end)
            .map(|((mac, hostname), ip)| DhcpLease {
                ip: ip.into(),
                mac,
                hostname,
            })
            .collect())
    }

    async fn poll_state(&self) -> Result<HostState> {
        self.gate("poll_state").await?;
        let domains = self
            .domains
            .read()
            .map_err(poisoned)?
            .values()
            .map(Self::domain_info)
            .collect();
        let pools = self.pools.read().map_err(poisoned)?.values().map(MockPool::info).collect();
        let networks = self.networks.read().map_err(poisoned)?.values().cloned().collect();
        Ok(HostState {
            domains,
            pools,
            networks,
        })
    }
}

// =============================================================================
// HOST NETWORK
// =============================================================================

/// In-memory host network that records programmed forwards.
#[derive(Default)]
pub struct MockHostNetwork {
    rules: RwLock<BTreeMap<String, PortForward>>,
    fail_next: RwLock<Option<HypervisorError>>,
}

impl MockHostNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next apply or remove fail.
    pub fn fail_next(&self, error: HypervisorError) {
        if let Ok(mut next) = self.fail_next.write() {
            *next = Some(error);
        }
    }

    /// Forwards currently programmed, keyed by id.
    pub fn applied(&self) -> BTreeMap<String, PortForward> {
        self.rules.read().map(|r| r.clone()).unwrap_or_default()
    }

    fn take_fault(&self) -> Result<()> {
        match self.fail_next.write().map_err(poisoned)?.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl HostNetwork for MockHostNetwork {
    async fn apply_port_forward(&self, id: &str, forward: &PortForward) -> Result<()> {
        self.take_fault()?;
        self.rules
            .write()
            .map_err(poisoned)?
            .insert(id.to_string(), forward.clone());
        debug!(id, rule = %forward, "Mock port forward applied");
        Ok(())
    }

    async fn remove_port_forward(&self, id: &str, _forward: &PortForward) -> Result<()> {
        self.take_fault()?;
        self.rules.write().map_err(poisoned)?.remove(id);
        debug!(id, "Mock port forward removed");
        Ok(())
    }
}

/// Directory pool definition with a fresh UUID.
pub fn mock_pool_config(name: &str, path: &str) -> PoolConfig {
    PoolConfig {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        pool_type: PoolType::Dir,
        path: path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(target: &str) -> DiskConfig {
        DiskConfig::new(format!("/pool/{}.qcow2", target), target)
    }

    #[tokio::test]
    async fn test_domain_lifecycle() {
        let backend = MockBackend::new();
        let config = VmConfig::new("lifecycle-test").with_disk(disk("vda"));
        let id = config.id.clone();

        backend.define_vm(&config).await.unwrap();
        assert_eq!(backend.domain_state(&id).await.unwrap(), PowerState::Shutoff);

        backend.start_vm(&id).await.unwrap();
        assert_eq!(backend.domain_state(&id).await.unwrap(), PowerState::Running);

        backend.suspend_vm(&id).await.unwrap();
        assert_eq!(backend.domain_state(&id).await.unwrap(), PowerState::Paused);

        backend.resume_vm(&id).await.unwrap();
        backend.shutdown_vm(&id, true).await.unwrap();
        assert_eq!(backend.domain_state(&id).await.unwrap(), PowerState::Shutoff);

        backend.undefine_vm(&id).await.unwrap();
        assert!(backend.domain("lifecycle-test").is_none());
    }

    #[tokio::test]
    async fn test_acknowledged_shutdown_stays_in_flight() {
        let backend = MockBackend::new();
        backend.set_shutdown_behavior(ShutdownBehavior::Acknowledge);
        let config = VmConfig::new("slow-guest");
        let id = config.id.clone();
        backend.define_vm(&config).await.unwrap();
        backend.start_vm(&id).await.unwrap();

        backend.shutdown_vm(&id, true).await.unwrap();
        assert_eq!(backend.domain_state(&id).await.unwrap(), PowerState::ShuttingDown);

        backend.destroy_vm(&id).await.unwrap();
        assert_eq!(backend.domain_state(&id).await.unwrap(), PowerState::Shutoff);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let backend = MockBackend::new();
        let config = VmConfig::new("faulty");
        let id = config.id.clone();
        backend.define_vm(&config).await.unwrap();

        backend.fail_next("start_vm", HypervisorError::OperationFailed("no memory".into()));
        assert!(backend.start_vm(&id).await.is_err());
        assert_eq!(backend.domain_state(&id).await.unwrap(), PowerState::Shutoff);

        backend.fail_after_apply("start_vm", HypervisorError::OperationFailed("agent".into()));
        assert!(backend.start_vm(&id).await.is_err());
        assert_eq!(backend.domain_state(&id).await.unwrap(), PowerState::Running);

        backend.set_connected(false);
        let err = backend.poll_state().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_snapshot_revert_restores_config() {
        let backend = MockBackend::new();
        let config = VmConfig::new("snapshot-test").with_cpu(2);
        let id = config.id.clone();
        backend.define_vm(&config).await.unwrap();
        backend.start_vm(&id).await.unwrap();

        let snapshot = backend.create_snapshot(&id, "s1", "before resize").await.unwrap();
        assert_eq!(snapshot.vm_state, PowerState::Running);

        backend.destroy_vm(&id).await.unwrap();
        backend.define_vm(&config.clone().with_cpu(8)).await.unwrap();

        backend.revert_snapshot(&id, "s1").await.unwrap();
        let domain = backend.domain("snapshot-test").unwrap();
        assert_eq!(domain.config.cpu.vcpus, 2);
        assert_eq!(domain.state, PowerState::Running);

        backend.delete_snapshot(&id, "s1").await.unwrap();
        assert!(backend.delete_snapshot(&id, "s1").await.is_err());
    }

    #[tokio::test]
    async fn test_volumes_need_active_pool() {
        let backend = MockBackend::new();
        backend
            .create_pool(&mock_pool_config("default", "/var/lib/libvirt/images/default"))
            .await
            .unwrap();

        let request = VolumeConfig {
            name: "disk.qcow2".into(),
            capacity_bytes: 20 * GIB,
            format: DiskFormat::Qcow2,
        };
        assert!(backend.create_volume("default", &request).await.is_err());

        backend.start_pool("default").await.unwrap();
        let volume = backend.create_volume("default", &request).await.unwrap();
        assert_eq!(volume.path, "/var/lib/libvirt/images/default/disk.qcow2");

        let copy = backend.clone_volume("default", "disk.qcow2", "copy.qcow2").await.unwrap();
        assert_eq!(copy.capacity_bytes, 20 * GIB);
        assert_eq!(backend.pool_info("default").await.unwrap().volumes.len(), 2);
    }

    #[tokio::test]
    async fn test_live_device_changes_need_running_domain() {
        let backend = MockBackend::new();
        let config = VmConfig::new("devices").with_disk(disk("vda"));
        let id = config.id.clone();
        backend.define_vm(&config).await.unwrap();

        let err = backend
            .attach_device(&id, &Device::Disk(disk("vdb")), true)
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidState(_)));
        assert_eq!(backend.domain("devices").unwrap().config.disks.len(), 1);

        backend.attach_device(&id, &Device::Disk(disk("vdb")), false).await.unwrap();
        backend.start_vm(&id).await.unwrap();
        backend.detach_device(&id, &Device::Disk(disk("vdb")), true).await.unwrap();
        assert_eq!(backend.domain("devices").unwrap().config.disks.len(), 1);
    }

    #[tokio::test]
    async fn test_dhcp_leases_follow_running_domains() {
        let backend = MockBackend::new();
        let network = NetworkConfig {
            id: "net-1".to_string(),
            name: "lab".to_string(),
            forward: ForwardMode::Nat,
            bridge: "virbr1".to_string(),
            gateway: "192.168.100.1".parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
            dhcp: Some(DhcpRange {
                start: "192.168.100.2".parse().unwrap(),
                end: "192.168.100.254".parse().unwrap(),
            }),
        };
        backend.create_network(&network).await.unwrap();
        backend.start_network("lab").await.unwrap();

        let nic = NicConfig {
            kind: NicKind::Network,
            source: "lab".to_string(),
            mac: "52:54:00:00:00:01".to_string(),
            model: NicModel::Virtio,
        };
        let mut config = VmConfig::new("web").with_disk(disk("vda"));
        config.nics.push(nic);
        backend.define_vm(&config).await.unwrap();
        assert!(backend.dhcp_leases("lab").await.unwrap().is_empty());

        backend.start_vm(&config.id).await.unwrap();
        let leases = backend.dhcp_leases("lab").await.unwrap();
        assert_eq!(
            leases,
            vec![DhcpLease {
                ip: "192.168.100.2".parse().unwrap(),
                mac: "52:54:00:00:00:01".to_string(),
                hostname: "web".to_string(),
            }]
        );

        assert!(matches!(
            backend.dhcp_leases("missing").await.unwrap_err(),
            HypervisorError::NetworkNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_mock_host_network() {
        let host = MockHostNetwork::new();
        let forward = PortForward {
            protocol: crate::forward::Protocol::Tcp,
            host_port: 2222,
            host_port_end: None,
            vm_ip: "192.168.122.5".parse().unwrap(),
            vm_port: 22,
        };
        host.apply_port_forward("r1", &forward).await.unwrap();
        assert!(host.applied().contains_key("r1"));

        host.fail_next(HypervisorError::OperationFailed("iptables".into()));
        assert!(host.remove_port_forward("r1", &forward).await.is_err());
        host.remove_port_forward("r1", &forward).await.unwrap();
        assert!(host.applied().is_empty());
    }
}
