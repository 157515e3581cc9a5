//! The explicitly constructed host context.
//!
//! A [`HostContext`] owns every manager of one hypervisor host together with
//! the driver handles, the VM catalog, the lock table and the reconcile
//! trigger they share. Nothing in the core is global: tests build one
//! context per case, and a daemon could hold one per host.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use virtpanel_hypervisor::{HostNetwork, Hypervisor};

use crate::catalog::VmCatalog;
use crate::config::CoreConfig;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::iso::IsoLibrary;
use crate::lifecycle::LifecycleManager;
use crate::locks::EntityLocks;
use crate::portforward::PortForwardManager;
use crate::reconciler::{ReconcileReport, ReconcileTrigger, Reconciler};
use crate::registry::ResourceRegistry;
use crate::snapshot::SnapshotManager;

struct Inner {
    config: Arc<CoreConfig>,
    vms: LifecycleManager,
    snapshots: SnapshotManager,
    registry: Arc<ResourceRegistry>,
    isos: IsoLibrary,
    port_forwards: PortForwardManager,
    reconciler: Arc<Reconciler>,
}

/// Handle to everything the core manages on one host. Cheap to clone.
#[derive(Clone)]
pub struct HostContext {
    inner: Arc<Inner>,
}

impl HostContext {
    pub fn new(
        config: CoreConfig,
        hypervisor: Arc<dyn Hypervisor>,
        host_network: Arc<dyn HostNetwork>,
    ) -> Self {
        let config = Arc::new(config);
        let catalog = Arc::new(VmCatalog::new());
        let locks = Arc::new(EntityLocks::new());
        let (trigger, trigger_rx) = ReconcileTrigger::channel();
        let dispatcher = Arc::new(Dispatcher::new(
            config.driver_timeout(),
            catalog.clone(),
            trigger,
        ));

        let registry = Arc::new(ResourceRegistry::new(
            config.clone(),
            hypervisor.clone(),
            catalog.clone(),
            locks.clone(),
            dispatcher.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            config.reconcile_interval(),
            config.driver_timeout(),
            hypervisor.clone(),
            catalog.clone(),
            registry.clone(),
            locks.clone(),
            trigger_rx,
        ));
        let vms = LifecycleManager::new(
            config.clone(),
            hypervisor.clone(),
            catalog.clone(),
            registry.clone(),
            locks.clone(),
            dispatcher.clone(),
            reconciler.clone(),
        );
        let isos = IsoLibrary::new(config.clone(), catalog.clone(), locks.clone());
        let snapshots = SnapshotManager::new(hypervisor, catalog, locks.clone(), dispatcher.clone());
        let port_forwards = PortForwardManager::new(
            host_network,
            locks,
            dispatcher,
            config.port_forward_state.clone(),
        );

        Self {
            inner: Arc::new(Inner {
                config,
                vms,
                snapshots,
                registry,
                isos,
                port_forwards,
                reconciler,
            }),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub fn vms(&self) -> &LifecycleManager {
        &self.inner.vms
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.inner.snapshots
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.inner.registry
    }

    pub fn isos(&self) -> &IsoLibrary {
        &self.inner.isos
    }

    pub fn port_forwards(&self) -> &PortForwardManager {
        &self.inner.port_forwards
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }

    /// Load the host's current state and re-apply saved port forwards.
    ///
    /// A failing port forward restore is logged; the host state must load.
    pub async fn bootstrap(&self) -> Result<ReconcileReport> {
        let report = self.inner.reconciler.reconcile_once().await?;
        info!(
            vms = self.inner.vms.list().await.len(),
            pools = self.inner.registry.list_pools().await.len(),
            networks = self.inner.registry.list_networks().await.len(),
            "Loaded host state"
        );
        if let Err(e) = self.inner.port_forwards.restore().await {
            warn!(error = %e, "Failed to restore port forwards");
        }
        Ok(report)
    }

    /// Run the reconcile loop until `shutdown` fires.
    pub fn spawn_reconciler(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let reconciler = self.inner.reconciler.clone();
        tokio::spawn(async move { reconciler.run(shutdown).await })
    }
}
