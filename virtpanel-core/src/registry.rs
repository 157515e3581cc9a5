//! Resource Registry: storage pools, volumes and virtual networks.
//!
//! The registry keeps its own view of every pool and network the driver
//! manages. Mutations go through the driver first and are recorded only
//! once acknowledged; the reconciler folds out-of-band changes back in.
//!
//! Deletes are guarded by scanning the VM catalog for references rather
//! than by counting them, so edits made behind the core's back cannot leave
//! a stale count. The scan holds the catalog read lock and nothing else, and
//! is finished before the driver call is issued.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use virtpanel_hypervisor::{
    DhcpLease, Hypervisor, NetworkConfig, NetworkInfo, PoolConfig, PoolInfo, VolumeConfig, VolumeInfo,
};

use crate::catalog::VmCatalog;
use crate::command::{CreateNetwork, CreatePool, CreateVolume};
use crate::config::CoreConfig;
use crate::dispatch::{Dispatcher, Target};
use crate::error::{CoreError, EntityKind, Result};
use crate::locks::{EntityKey, EntityLocks};
use crate::model::{Network, StoragePool, StorageVolume, GIB};
use crate::reconciler::DriftEvent;

#[derive(Debug, Clone)]
struct PoolEntry {
    pool: StoragePool,
    volumes: BTreeMap<String, StorageVolume>,
}

impl PoolEntry {
    fn from_info(info: &PoolInfo) -> Self {
        Self {
            pool: StoragePool::from(info),
            volumes: info
                .volumes
                .iter()
                .map(|v| (v.name.clone(), StorageVolume::from_info(&info.name, v)))
                .collect(),
        }
    }
}

fn in_use(kind: EntityKind, id: &str, users: &[String]) -> CoreError {
    CoreError::conflict(
        kind,
        id,
        "delete",
        format!("still referenced by vm {}", quote_list(users)),
    )
}

fn quote_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| format!("'{}'", n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Catalog of storage pools, their volumes, and virtual networks.
pub struct ResourceRegistry {
    config: Arc<CoreConfig>,
    hypervisor: Arc<dyn Hypervisor>,
    catalog: Arc<VmCatalog>,
    locks: Arc<EntityLocks>,
    dispatcher: Arc<Dispatcher>,
    pools: RwLock<BTreeMap<String, PoolEntry>>,
    networks: RwLock<BTreeMap<String, Network>>,
}

impl ResourceRegistry {
    pub fn new(
        config: Arc<CoreConfig>,
        hypervisor: Arc<dyn Hypervisor>,
        catalog: Arc<VmCatalog>,
        locks: Arc<EntityLocks>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            config,
            hypervisor,
            catalog,
            locks,
            dispatcher,
            pools: RwLock::new(BTreeMap::new()),
            networks: RwLock::new(BTreeMap::new()),
        }
    }

    // =========================================================================
    // Pools
    // =========================================================================

    pub async fn list_pools(&self) -> Vec<StoragePool> {
        self.pools.read().await.values().map(|e| e.pool.clone()).collect()
    }

    pub async fn get_pool(&self, name: &str) -> Result<StoragePool> {
        self.pools
            .read()
            .await
            .get(name)
            .map(|e| e.pool.clone())
            .ok_or_else(|| CoreError::not_found(EntityKind::Pool, name))
    }

    /// Define a pool. New pools are inactive until started.
    #[instrument(skip(self, cmd, cancel), fields(pool = %cmd.name))]
    pub async fn create_pool(&self, cmd: CreatePool, cancel: &CancellationToken) -> Result<StoragePool> {
        let _guard = self.locks.lock(EntityKey::Pool(cmd.name.clone())).await;

        let root = &self.config.storage_root;
        let path = cmd.path.clone().unwrap_or_else(|| root.join(&cmd.name));
        if path == *root || !path.starts_with(root) {
            return Err(CoreError::invalid(
                "path",
                format!("must be a directory inside {}", root.display()),
            ));
        }
        let path = path.to_string_lossy().into_owned();

        {
            let pools = self.pools.read().await;
            if pools.contains_key(&cmd.name) {
                return Err(CoreError::conflict(
                    EntityKind::Pool,
                    &cmd.name,
                    "create",
                    "a pool with this name already exists",
                ));
            }
            if let Some(other) = pools.values().find(|e| e.pool.path == path) {
                return Err(CoreError::conflict(
                    EntityKind::Pool,
                    &cmd.name,
                    "create",
                    format!("path {} already belongs to pool '{}'", path, other.pool.name),
                ));
            }
        }

        let config = PoolConfig {
            id: Uuid::new_v4().to_string(),
            name: cmd.name.clone(),
            pool_type: cmd.pool_type,
            path: path.clone(),
        };
        let hv = self.hypervisor.clone();
        let request = config.clone();
        self.dispatcher
            .call(Target::new(EntityKind::Pool, &cmd.name), "create", cancel, async move {
                hv.create_pool(&request).await
            })
            .await?;

        let placeholder = PoolEntry {
            pool: StoragePool {
                name: config.name.clone(),
                uuid: config.id.clone(),
                active: false,
                pool_type: config.pool_type,
                path,
                capacity_bytes: 0,
                allocation_bytes: 0,
                available_bytes: 0,
            },
            volumes: BTreeMap::new(),
        };
        self.pools.write().await.insert(cmd.name.clone(), placeholder);
        let pool = self.refresh_pool_locked(&cmd.name, cancel).await;
        info!(path = %pool.path, "Storage pool created");
        Ok(pool)
    }

    /// Start a pool. Starting an active pool succeeds without a driver call.
    #[instrument(skip(self, cancel), fields(pool = %name))]
    pub async fn start_pool(&self, name: &str, cancel: &CancellationToken) -> Result<StoragePool> {
        self.set_pool_active(name, true, cancel).await
    }

    /// Stop a pool. Stopping an inactive pool succeeds without a driver call.
    #[instrument(skip(self, cancel), fields(pool = %name))]
    pub async fn stop_pool(&self, name: &str, cancel: &CancellationToken) -> Result<StoragePool> {
        self.set_pool_active(name, false, cancel).await
    }

    async fn set_pool_active(
        &self,
        name: &str,
        active: bool,
        cancel: &CancellationToken,
    ) -> Result<StoragePool> {
        let _guard = self.locks.lock(EntityKey::Pool(name.to_string())).await;
        let pool = self.get_pool(name).await?;
        if pool.active == active {
            debug!(active, "Pool already in requested state");
            return Ok(pool);
        }

        let hv = self.hypervisor.clone();
        let pool_name = name.to_string();
        let operation = if active { "start" } else { "stop" };
        self.dispatcher
            .call(Target::new(EntityKind::Pool, name), operation, cancel, async move {
                if active {
                    hv.start_pool(&pool_name).await
                } else {
                    hv.stop_pool(&pool_name).await
                }
            })
            .await?;

        if let Some(entry) = self.pools.write().await.get_mut(name) {
            entry.pool.active = active;
        }
        info!(active, "Storage pool {}", if active { "started" } else { "stopped" });
        Ok(self.refresh_pool_locked(name, cancel).await)
    }

    /// Delete a pool. Fails with `Conflict` while any VM disk uses one of its
    /// volumes.
    #[instrument(skip(self, cancel), fields(pool = %name))]
    pub async fn delete_pool(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let key = EntityKey::Pool(name.to_string());
        let guard = self.locks.lock(key.clone()).await;

        let paths: Vec<String> = {
            let pools = self.pools.read().await;
            let entry = pools
                .get(name)
                .ok_or_else(|| CoreError::not_found(EntityKind::Pool, name))?;
            entry.volumes.values().map(|v| v.path.clone()).collect()
        };

        let references = self.catalog.volumes_references(&paths).await;
        if !references.is_empty() {
            let users: Vec<String> = references
                .iter()
                .map(|(vm, _)| vm.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            return Err(in_use(EntityKind::Pool, name, &users));
        }

        let hv = self.hypervisor.clone();
        let pool_name = name.to_string();
        self.dispatcher
            .call(Target::new(EntityKind::Pool, name), "delete", cancel, async move {
                hv.delete_pool(&pool_name).await
            })
            .await?;

        self.pools.write().await.remove(name);
        drop(guard);
        self.locks.forget(&key);
        info!("Storage pool deleted");
        Ok(())
    }

    /// Re-read a pool from the driver. The caller holds the pool lock.
    ///
    /// A failed read keeps the cached entry.
    pub(crate) async fn refresh_pool_locked(&self, name: &str, cancel: &CancellationToken) -> StoragePool {
        let hv = self.hypervisor.clone();
        let pool_name = name.to_string();
        let fresh = self
            .dispatcher
            .call(Target::new(EntityKind::Pool, name), "refresh", cancel, async move {
                hv.pool_info(&pool_name).await
            })
            .await;

        let mut pools = self.pools.write().await;
        match fresh {
            Ok(info) => {
                let entry = PoolEntry::from_info(&info);
                let pool = entry.pool.clone();
                pools.insert(name.to_string(), entry);
                pool
            }
            Err(e) => {
                warn!(pool = %name, error = %e, "Failed to refresh pool");
                pools.get(name).map(|e| e.pool.clone()).unwrap_or_else(|| StoragePool {
                    name: name.to_string(),
                    uuid: String::new(),
                    active: false,
                    pool_type: Default::default(),
                    path: String::new(),
                    capacity_bytes: 0,
                    allocation_bytes: 0,
                    available_bytes: 0,
                })
            }
        }
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    pub async fn list_volumes(&self, pool: &str) -> Result<Vec<StorageVolume>> {
        self.pools
            .read()
            .await
            .get(pool)
            .map(|e| e.volumes.values().cloned().collect())
            .ok_or_else(|| CoreError::not_found(EntityKind::Pool, pool))
    }

    pub async fn get_volume(&self, pool: &str, name: &str) -> Result<StorageVolume> {
        let pools = self.pools.read().await;
        let entry = pools
            .get(pool)
            .ok_or_else(|| CoreError::not_found(EntityKind::Pool, pool))?;
        entry
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::not_found(EntityKind::Volume, format!("{}/{}", pool, name)))
    }

    /// The volume stored at `path`, if any pool holds it.
    pub async fn volume_by_path(&self, path: &str) -> Option<StorageVolume> {
        self.pools
            .read()
            .await
            .values()
            .flat_map(|e| e.volumes.values())
            .find(|v| v.path == path)
            .cloned()
    }

    /// Allocate a volume. The pool must be active.
    #[instrument(skip(self, cmd, cancel), fields(pool = %pool, volume = %cmd.name))]
    pub async fn create_volume(
        &self,
        pool: &str,
        cmd: CreateVolume,
        cancel: &CancellationToken,
    ) -> Result<StorageVolume> {
        let _guard = self.locks.lock(EntityKey::Pool(pool.to_string())).await;
        self.create_volume_locked(pool, &cmd, cancel).await
    }

    /// Allocate a volume. The caller holds the pool lock.
    pub(crate) async fn create_volume_locked(
        &self,
        pool: &str,
        cmd: &CreateVolume,
        cancel: &CancellationToken,
    ) -> Result<StorageVolume> {
        {
            let pools = self.pools.read().await;
            let entry = pools
                .get(pool)
                .ok_or_else(|| CoreError::not_found(EntityKind::Pool, pool))?;
            if !entry.pool.active {
                return Err(CoreError::conflict(
                    EntityKind::Volume,
                    format!("{}/{}", pool, cmd.name),
                    "create",
                    format!("pool '{}' is not active", pool),
                ));
            }
            if entry.volumes.contains_key(&cmd.name) {
                return Err(CoreError::conflict(
                    EntityKind::Volume,
                    format!("{}/{}", pool, cmd.name),
                    "create",
                    "a volume with this name already exists",
                ));
            }
        }

        let request = VolumeConfig {
            name: cmd.name.clone(),
            capacity_bytes: cmd.capacity_gib * GIB,
            format: cmd.format,
        };
        let hv = self.hypervisor.clone();
        let pool_name = pool.to_string();
        let info = self
            .dispatcher
            .call(
                Target::new(EntityKind::Volume, format!("{}/{}", pool, cmd.name)),
                "create",
                cancel,
                async move { hv.create_volume(&pool_name, &request).await },
            )
            .await?;

        let volume = self.record_volume(pool, &info).await;
        info!(path = %volume.path, capacity_gib = cmd.capacity_gib, "Volume created");
        Ok(volume)
    }

    /// Copy a volume inside its pool. The caller holds the pool lock.
    pub(crate) async fn clone_volume_locked(
        &self,
        pool: &str,
        source: &str,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<StorageVolume> {
        {
            let pools = self.pools.read().await;
            let entry = pools
                .get(pool)
                .ok_or_else(|| CoreError::not_found(EntityKind::Pool, pool))?;
            if !entry.volumes.contains_key(source) {
                return Err(CoreError::not_found(
                    EntityKind::Volume,
                    format!("{}/{}", pool, source),
                ));
            }
            if entry.volumes.contains_key(target) {
                return Err(CoreError::conflict(
                    EntityKind::Volume,
                    format!("{}/{}", pool, target),
                    "clone",
                    "a volume with this name already exists",
                ));
            }
        }

        let hv = self.hypervisor.clone();
        let (pool_name, from, to) = (pool.to_string(), source.to_string(), target.to_string());
        let info = self
            .dispatcher
            .call(
                Target::new(EntityKind::Volume, format!("{}/{}", pool, target)),
                "clone",
                cancel,
                async move { hv.clone_volume(&pool_name, &from, &to).await },
            )
            .await?;
        Ok(self.record_volume(pool, &info).await)
    }

    async fn record_volume(&self, pool: &str, info: &VolumeInfo) -> StorageVolume {
        let volume = StorageVolume::from_info(pool, info);
        if let Some(entry) = self.pools.write().await.get_mut(pool) {
            entry.volumes.insert(volume.name.clone(), volume.clone());
        }
        volume
    }

    /// Delete a volume. Fails with `Conflict` while any VM disk uses it.
    #[instrument(skip(self, cancel), fields(pool = %pool, volume = %name))]
    pub async fn delete_volume(&self, pool: &str, name: &str, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.locks.lock(EntityKey::Pool(pool.to_string())).await;
        self.delete_volume_locked(pool, name, cancel).await
    }

    /// Delete a volume. The caller holds the pool lock.
    pub(crate) async fn delete_volume_locked(
        &self,
        pool: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let volume = self.get_volume(pool, name).await?;
        let id = format!("{}/{}", pool, name);

        let users = self.catalog.volume_references(&volume.path).await;
        if !users.is_empty() {
            return Err(in_use(EntityKind::Volume, &id, &users));
        }

        let hv = self.hypervisor.clone();
        let (pool_name, volume_name) = (pool.to_string(), name.to_string());
        self.dispatcher
            .call(Target::new(EntityKind::Volume, &id), "delete", cancel, async move {
                hv.delete_volume(&pool_name, &volume_name).await
            })
            .await?;

        if let Some(entry) = self.pools.write().await.get_mut(pool) {
            entry.volumes.remove(name);
        }
        info!("Volume deleted");
        Ok(())
    }

    // =========================================================================
    // Networks
    // =========================================================================

    pub async fn list_networks(&self) -> Vec<Network> {
        self.networks.read().await.values().cloned().collect()
    }

    pub async fn get_network(&self, name: &str) -> Result<Network> {
        self.networks
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::not_found(EntityKind::Network, name))
    }

    /// Addresses the network's DHCP server has handed out. An inactive
    /// network, or one without DHCP, has none.
    #[instrument(skip(self, cancel), fields(network = %name))]
    pub async fn dhcp_leases(&self, name: &str, cancel: &CancellationToken) -> Result<Vec<DhcpLease>> {
        let network = self.get_network(name).await?;
        if !network.active {
            return Ok(Vec::new());
        }

        let hv = self.hypervisor.clone();
        let network_name = name.to_string();
        self.dispatcher
            .call(Target::new(EntityKind::Network, name), "dhcp_leases", cancel, async move {
                hv.dhcp_leases(&network_name).await
            })
            .await
    }

    /// Define a network and, unless disabled, start it.
    ///
    /// If the start fails the definition is removed again.
    #[instrument(skip(self, cmd, cancel), fields(network = %cmd.name))]
    pub async fn create_network(&self, cmd: CreateNetwork, cancel: &CancellationToken) -> Result<Network> {
        let _guard = self.locks.lock(EntityKey::Network(cmd.name.clone())).await;

        {
            let networks = self.networks.read().await;
            if networks.contains_key(&cmd.name) {
                return Err(CoreError::conflict(
                    EntityKind::Network,
                    &cmd.name,
                    "create",
                    "a network with this name already exists",
                ));
            }
            if let Some(other) = networks.values().find(|n| n.bridge == cmd.bridge) {
                return Err(CoreError::conflict(
                    EntityKind::Network,
                    &cmd.name,
                    "create",
                    format!("bridge {} already belongs to network '{}'", cmd.bridge, other.name),
                ));
            }
        }

        let config = NetworkConfig {
            id: Uuid::new_v4().to_string(),
            name: cmd.name.clone(),
            forward: cmd.forward,
            bridge: cmd.bridge.clone(),
            gateway: cmd.gateway,
            netmask: cmd.netmask,
            dhcp: cmd.dhcp,
        };
        let hv = self.hypervisor.clone();
        let request = config.clone();
        self.dispatcher
            .call(Target::new(EntityKind::Network, &cmd.name), "create", cancel, async move {
                hv.create_network(&request).await
            })
            .await?;

        let mut network = Network::from(&NetworkInfo {
            config,
            active: false,
        });

        if cmd.autostart {
            let hv = self.hypervisor.clone();
            let name = cmd.name.clone();
            let started = self
                .dispatcher
                .call(Target::new(EntityKind::Network, &cmd.name), "start", cancel, async move {
                    hv.start_network(&name).await
                })
                .await;
            if let Err(e) = started {
                let hv = self.hypervisor.clone();
                let name = cmd.name.clone();
                let cleanup = self
                    .dispatcher
                    .call(
                        Target::new(EntityKind::Network, &cmd.name),
                        "delete",
                        &CancellationToken::new(),
                        async move { hv.delete_network(&name).await },
                    )
                    .await;
                if let Err(cleanup) = cleanup {
                    warn!(error = %cleanup, "Failed to remove network after failed start");
                }
                return Err(e);
            }
            network.active = true;
        }

        self.networks.write().await.insert(cmd.name.clone(), network.clone());
        info!(bridge = %network.bridge, subnet = %network.subnet, active = network.active, "Network created");
        Ok(network)
    }

    /// Start a network. Starting an active network succeeds without a driver call.
    #[instrument(skip(self, cancel), fields(network = %name))]
    pub async fn start_network(&self, name: &str, cancel: &CancellationToken) -> Result<Network> {
        self.set_network_active(name, true, cancel).await
    }

    /// Stop a network. Stopping an inactive network succeeds without a driver call.
    #[instrument(skip(self, cancel), fields(network = %name))]
    pub async fn stop_network(&self, name: &str, cancel: &CancellationToken) -> Result<Network> {
        self.set_network_active(name, false, cancel).await
    }

    async fn set_network_active(
        &self,
        name: &str,
        active: bool,
        cancel: &CancellationToken,
    ) -> Result<Network> {
        let _guard = self.locks.lock(EntityKey::Network(name.to_string())).await;
        let network = self.get_network(name).await?;
        if network.active == active {
            debug!(active, "Network already in requested state");
            return Ok(network);
        }

        let hv = self.hypervisor.clone();
        let network_name = name.to_string();
        let operation = if active { "start" } else { "stop" };
        self.dispatcher
            .call(Target::new(EntityKind::Network, name), operation, cancel, async move {
                if active {
                    hv.start_network(&network_name).await
                } else {
                    hv.stop_network(&network_name).await
                }
            })
            .await?;

        let mut networks = self.networks.write().await;
        let entry = networks
            .get_mut(name)
            .ok_or_else(|| CoreError::not_found(EntityKind::Network, name))?;
        entry.active = active;
        info!(active, "Network {}", if active { "started" } else { "stopped" });
        Ok(entry.clone())
    }

    /// Delete a network. Fails with `Conflict` while any VM has a NIC on it.
    #[instrument(skip(self, cancel), fields(network = %name))]
    pub async fn delete_network(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let key = EntityKey::Network(name.to_string());
        let guard = self.locks.lock(key.clone()).await;
        self.get_network(name).await?;

        let users = self.catalog.network_references(name).await;
        if !users.is_empty() {
            return Err(in_use(EntityKind::Network, name, &users));
        }

        let hv = self.hypervisor.clone();
        let network_name = name.to_string();
        self.dispatcher
            .call(Target::new(EntityKind::Network, name), "delete", cancel, async move {
                hv.delete_network(&network_name).await
            })
            .await?;

        self.networks.write().await.remove(name);
        drop(guard);
        self.locks.forget(&key);
        info!("Network deleted");
        Ok(())
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Fold the driver's pools into the registry. Pools busy with a
    /// foreground operation are left for the next pass.
    pub(crate) async fn merge_pools(&self, infos: &[PoolInfo]) -> Vec<DriftEvent> {
        let mut events = Vec::new();
        let seen: BTreeSet<&str> = infos.iter().map(|p| p.name.as_str()).collect();

        for info in infos {
            let Some(_guard) = self.locks.try_lock(&EntityKey::Pool(info.name.clone())) else {
                debug!(pool = %info.name, "Pool busy, skipping merge");
                continue;
            };
            let fresh = PoolEntry::from_info(info);
            let mut pools = self.pools.write().await;
            match pools.get(&info.name) {
                None => events.push(DriftEvent::PoolDiscovered {
                    pool: info.name.clone(),
                }),
                Some(old) if old.pool.active != fresh.pool.active => {
                    events.push(DriftEvent::PoolActivityChanged {
                        pool: info.name.clone(),
                        active: fresh.pool.active,
                    })
                }
                Some(_) => {}
            }
            pools.insert(info.name.clone(), fresh);
        }

        let known: Vec<String> = self.pools.read().await.keys().cloned().collect();
        for name in known.into_iter().filter(|n| !seen.contains(n.as_str())) {
            let Some(_guard) = self.locks.try_lock(&EntityKey::Pool(name.clone())) else {
                continue;
            };
            self.pools.write().await.remove(&name);
            events.push(DriftEvent::PoolLost { pool: name });
        }
        events
    }

    /// Fold the driver's networks into the registry.
    pub(crate) async fn merge_networks(&self, infos: &[NetworkInfo]) -> Vec<DriftEvent> {
        let mut events = Vec::new();
        let seen: BTreeSet<&str> = infos.iter().map(|n| n.config.name.as_str()).collect();

        for info in infos {
            let name = &info.config.name;
            let Some(_guard) = self.locks.try_lock(&EntityKey::Network(name.clone())) else {
                debug!(network = %name, "Network busy, skipping merge");
                continue;
            };
            let fresh = Network::from(info);
            let mut networks = self.networks.write().await;
            match networks.get(name) {
                None => events.push(DriftEvent::NetworkDiscovered {
                    network: name.clone(),
                }),
                Some(old) if old.active != fresh.active => {
                    events.push(DriftEvent::NetworkActivityChanged {
                        network: name.clone(),
                        active: fresh.active,
                    })
                }
                Some(_) => {}
            }
            networks.insert(name.clone(), fresh);
        }

        let known: Vec<String> = self.networks.read().await.keys().cloned().collect();
        for name in known.into_iter().filter(|n| !seen.contains(n.as_str())) {
            let Some(_guard) = self.locks.try_lock(&EntityKey::Network(name.clone())) else {
                continue;
            };
            self.networks.write().await.remove(&name);
            events.push(DriftEvent::NetworkLost { network: name });
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CreateNetworkRequest, CreatePoolRequest, CreateVolumeRequest, Validate};
    use crate::error::ErrorKind;
    use crate::reconciler::ReconcileTrigger;
    use std::time::Duration;
    use virtpanel_hypervisor::{HypervisorError, MockBackend};

    struct Fixture {
        backend: Arc<MockBackend>,
        registry: ResourceRegistry,
        token: CancellationToken,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MockBackend::new());
        let catalog = Arc::new(VmCatalog::new());
        let (trigger, _rx) = ReconcileTrigger::channel();
        let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(5), catalog.clone(), trigger));
        let registry = ResourceRegistry::new(
            Arc::new(CoreConfig::in_memory()),
            backend.clone(),
            catalog,
            Arc::new(EntityLocks::new()),
            dispatcher,
        );
        Fixture {
            backend,
            registry,
            token: CancellationToken::new(),
        }
    }

    fn pool(name: &str, path: Option<&str>) -> CreatePool {
        CreatePoolRequest {
            name: name.into(),
            path: path.map(str::to_string),
            pool_type: None,
        }
        .validate()
        .unwrap()
    }

    fn volume(name: &str, gib: i64) -> CreateVolume {
        CreateVolumeRequest {
            name: name.into(),
            capacity: gib,
            format: None,
        }
        .validate()
        .unwrap()
    }

    #[tokio::test]
    async fn test_pool_defaults_and_idempotent_toggles() {
        let f = fixture();
        let created = f.registry.create_pool(pool("fast", None), &f.token).await.unwrap();
        assert_eq!(created.path, "/var/lib/libvirt/images/fast");
        assert!(!created.active);

        let started = f.registry.start_pool("fast", &f.token).await.unwrap();
        assert!(started.active);
        let calls = f.backend.calls().len();
        assert!(f.registry.start_pool("fast", &f.token).await.unwrap().active);
        assert_eq!(f.backend.calls().len(), calls);

        f.registry.stop_pool("fast", &f.token).await.unwrap();
        assert!(!f.registry.stop_pool("fast", &f.token).await.unwrap().active);
    }

    #[tokio::test]
    async fn test_pool_path_must_stay_in_storage_root() {
        let f = fixture();
        let err = f
            .registry
            .create_pool(pool("etc", Some("/etc/pool")), &f.token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);

        f.registry.create_pool(pool("a", None), &f.token).await.unwrap();
        let err = f
            .registry
            .create_pool(pool("b", Some("/var/lib/libvirt/images/a")), &f.token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_volume_needs_active_pool_and_unique_name() {
        let f = fixture();
        f.registry.create_pool(pool("default", None), &f.token).await.unwrap();

        let err = f
            .registry
            .create_volume("default", volume("data.qcow2", 10), &f.token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        f.registry.start_pool("default", &f.token).await.unwrap();
        let created = f
            .registry
            .create_volume("default", volume("data.qcow2", 10), &f.token)
            .await
            .unwrap();
        assert_eq!(created.capacity_gib(), 10);
        assert_eq!(created.path, "/var/lib/libvirt/images/default/data.qcow2");

        let err = f
            .registry
            .create_volume("default", volume("data.qcow2", 10), &f.token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = f
            .registry
            .create_volume("missing", volume("x.qcow2", 1), &f.token)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { kind: EntityKind::Pool, .. }));

        f.registry.delete_volume("default", "data.qcow2", &f.token).await.unwrap();
        assert!(f.registry.list_volumes("default").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_network_autostart_and_cleanup_on_failed_start() {
        let f = fixture();
        let lab = CreateNetworkRequest::new("lab").validate().unwrap();
        let created = f.registry.create_network(lab, &f.token).await.unwrap();
        assert!(created.active);
        assert_eq!(created.subnet, "192.168.100.1/24");

        let mut request = CreateNetworkRequest::new("dmz");
        request.subnet = Some("10.10.0.1".into());
        let dmz = request.validate().unwrap();
        f.backend
            .fail_next("start_network", HypervisorError::OperationFailed("dnsmasq".into()));
        let err = f.registry.create_network(dmz, &f.token).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DriverFailure);
        assert!(f.backend.calls().contains(&"delete_network".to_string()));
        assert!(f.registry.get_network("dmz").await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_bridge_is_conflict() {
        let f = fixture();
        let mut a = CreateNetworkRequest::new("a");
        a.bridge = Some("br0".into());
        f.registry.create_network(a.validate().unwrap(), &f.token).await.unwrap();

        let mut b = CreateNetworkRequest::new("b");
        b.bridge = Some("br0".into());
        b.subnet = Some("10.0.0.1".into());
        let err = f.registry.create_network(b.validate().unwrap(), &f.token).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_network_toggles_are_idempotent() {
        let f = fixture();
        let lab = CreateNetworkRequest::new("lab").validate().unwrap();
        f.registry.create_network(lab, &f.token).await.unwrap();

        let calls = f.backend.calls().len();
        assert!(f.registry.start_network("lab", &f.token).await.unwrap().active);
        assert_eq!(f.backend.calls().len(), calls);
        assert!(f.registry.get_network("lab").await.unwrap().active);

        assert!(!f.registry.stop_network("lab", &f.token).await.unwrap().active);
        let calls = f.backend.calls().len();
        assert!(!f.registry.stop_network("lab", &f.token).await.unwrap().active);
        assert_eq!(f.backend.calls().len(), calls);
        assert!(!f.registry.get_network("lab").await.unwrap().active);
    }

    #[tokio::test]
    async fn test_dhcp_leases() {
        let f = fixture();
        let err = f.registry.dhcp_leases("missing", &f.token).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let lab = CreateNetworkRequest::new("lab").validate().unwrap();
        f.registry.create_network(lab, &f.token).await.unwrap();
        assert!(f.registry.dhcp_leases("lab", &f.token).await.unwrap().is_empty());

        f.registry.stop_network("lab", &f.token).await.unwrap();
        let calls = f.backend.calls().len();
        assert!(f.registry.dhcp_leases("lab", &f.token).await.unwrap().is_empty());
        assert_eq!(f.backend.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_merge_tracks_out_of_band_changes() {
        let f = fixture();
        f.registry.create_pool(pool("default", None), &f.token).await.unwrap();
        f.registry.start_pool("default", &f.token).await.unwrap();

        f.backend.set_pool_active("default", false).unwrap();
        let host = f.backend.poll_state().await.unwrap();
        let events = f.registry.merge_pools(&host.pools).await;
        assert_eq!(
            events,
            vec![DriftEvent::PoolActivityChanged {
                pool: "default".into(),
                active: false
            }]
        );
        assert!(!f.registry.get_pool("default").await.unwrap().active);

        let events = f.registry.merge_pools(&[]).await;
        assert_eq!(events, vec![DriftEvent::PoolLost { pool: "default".into() }]);
    }
}
