//! Reconciler - folds hypervisor ground truth back into the core.
//!
//! The driver is the source of truth for VM power state; the core is
//! authoritative for structure (attachments, names) only between passes.
//! A pass reads everything from the driver without holding any entity lock,
//! then merges entity by entity under `try_lock`, skipping whatever a
//! foreground operation is working on. Those entities are picked up again
//! on the next pass, which every mutation requests through
//! [`ReconcileTrigger`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use virtpanel_hypervisor::{DomainInfo, Hypervisor, HypervisorError, PowerState};

use crate::catalog::{VmCatalog, VmRecord};
use crate::error::{CoreError, EntityKind, Result};
use crate::locks::{EntityKey, EntityLocks};
use crate::model::{Snapshot, Vm, VmState};
use crate::registry::ResourceRegistry;

/// Handle that requests a reconcile pass.
///
/// Requests coalesce: while one is pending, further ones are dropped.
#[derive(Debug, Clone)]
pub struct ReconcileTrigger {
    tx: mpsc::Sender<()>,
}

impl ReconcileTrigger {
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    pub fn fire(&self) {
        let _ = self.tx.try_send(());
    }
}

/// A difference between the core's view and the driver's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DriftEvent {
    VmDiscovered { vm: String, state: VmState },
    VmLost { vm: String },
    VmStateChanged { vm: String, from: VmState, to: VmState },
    VmRenamed { from: String, to: String },
    /// Attachments or sizing were changed outside the core
    VmDefinitionChanged { vm: String },
    SnapshotDiscovered { vm: String, snapshot: String },
    SnapshotPruned { vm: String, snapshot: String },
    PoolDiscovered { pool: String },
    PoolLost { pool: String },
    PoolActivityChanged { pool: String, active: bool },
    NetworkDiscovered { network: String },
    NetworkLost { network: String },
    NetworkActivityChanged { network: String, active: bool },
}

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub events: Vec<DriftEvent>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Core state for a driver power state.
///
/// A VM that never left `defined` stays `defined` while powered off.
pub fn observed_state(current: VmState, power: PowerState) -> VmState {
    match power {
        PowerState::Running | PowerState::Blocked => VmState::Running,
        PowerState::Paused | PowerState::PmSuspended => VmState::Paused,
        PowerState::ShuttingDown => VmState::ShuttingDown,
        PowerState::Shutoff | PowerState::Crashed => {
            if current == VmState::Defined {
                VmState::Defined
            } else {
                VmState::Stopped
            }
        }
        PowerState::Unknown => current,
    }
}

pub struct Reconciler {
    interval: Duration,
    driver_timeout: Duration,
    hypervisor: Arc<dyn Hypervisor>,
    catalog: Arc<VmCatalog>,
    registry: Arc<ResourceRegistry>,
    locks: Arc<EntityLocks>,
    /// Taken by the first `run`
    trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Reconciler {
    pub fn new(
        interval: Duration,
        driver_timeout: Duration,
        hypervisor: Arc<dyn Hypervisor>,
        catalog: Arc<VmCatalog>,
        registry: Arc<ResourceRegistry>,
        locks: Arc<EntityLocks>,
        trigger_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            interval,
            driver_timeout,
            hypervisor,
            catalog,
            registry,
            locks,
            trigger_rx: Mutex::new(Some(trigger_rx)),
        }
    }

    /// Reconcile on every tick and on every trigger until `shutdown` fires.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut trigger_rx = match self.trigger_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                error!("Reconciler::run called more than once");
                return;
            }
        };

        info!(interval_secs = self.interval.as_secs(), "Starting reconciler");
        let mut timer = interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reconciler stopped");
                    return;
                }
                _ = timer.tick() => {
                    self.pass().await;
                }
                Some(_) = trigger_rx.recv() => {
                    debug!("Reconcile triggered");
                    self.pass().await;
                    timer.reset();
                }
            }
        }
    }

    async fn pass(&self) {
        match self.reconcile_once().await {
            Ok(report) if !report.is_empty() => {
                info!(drift = report.events.len(), "Reconciled drift");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, retryable = e.is_retryable(), "Reconcile pass failed"),
        }
    }

    /// Run one pass and report what changed.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        // Read the catalog before the driver so a VM created in between is
        // seen by the driver first and never mistaken for a lost one.
        let known = self.catalog.records().await;

        let host = tokio::time::timeout(self.driver_timeout, self.hypervisor.poll_state())
            .await
            .unwrap_or_else(|_| {
                Err(HypervisorError::Timeout(format!(
                    "no state within {}s",
                    self.driver_timeout.as_secs()
                )))
            })
            .map_err(|e| CoreError::from_driver(EntityKind::Host, "local", "poll", e))?;

        let mut report = ReconcileReport::default();
        report.events.extend(self.merge_vms(&known, &host.domains).await);
        report.events.extend(self.registry.merge_pools(&host.pools).await);
        report.events.extend(self.registry.merge_networks(&host.networks).await);

        for event in &report.events {
            debug!(?event, "Drift");
        }
        Ok(report)
    }

    async fn merge_vms(&self, known: &[VmRecord], domains: &[DomainInfo]) -> Vec<DriftEvent> {
        let mut events = Vec::new();
        let by_uuid: HashMap<&str, &VmRecord> =
            known.iter().map(|r| (r.vm.uuid.as_str(), r)).collect();

        for domain in domains {
            match by_uuid.get(domain.config.id.as_str()) {
                Some(record) => {
                    let name = record.vm.name.clone();
                    let key = EntityKey::Vm(name.clone());
                    let Some(guard) = self.locks.try_lock(&key) else {
                        debug!(vm = %name, "VM busy, skipping merge");
                        continue;
                    };
                    let Ok(current) = self.catalog.get(&name).await else {
                        continue;
                    };
                    if current.vm.uuid != domain.config.id || current.in_flight.is_some() {
                        continue;
                    }
                    events.extend(self.merge_vm(current, domain).await);

                    if domain.config.name != name {
                        if let Some(event) = self.follow_rename(&name, &domain.config.name).await {
                            events.push(event);
                            drop(guard);
                            self.locks.forget(&key);
                        }
                    }
                }
                None => {
                    if let Some(event) = self.discover_vm(domain).await {
                        events.push(event);
                    }
                }
            }
        }

        let live: BTreeSet<&str> = domains.iter().map(|d| d.config.id.as_str()).collect();
        for record in known.iter().filter(|r| !live.contains(r.vm.uuid.as_str())) {
            let key = EntityKey::Vm(record.vm.name.clone());
            let Some(guard) = self.locks.try_lock(&key) else {
                continue;
            };
            match self.catalog.get(&record.vm.name).await {
                Ok(current) if current.vm.uuid == record.vm.uuid && current.in_flight.is_none() => {
                    self.catalog.remove(&record.vm.name).await;
                    warn!(vm = %record.vm.name, "VM disappeared from the hypervisor");
                    events.push(DriftEvent::VmLost {
                        vm: record.vm.name.clone(),
                    });
                }
                _ => continue,
            }
            drop(guard);
            self.locks.forget(&key);
        }
        events
    }

    /// Merge one known VM. The caller holds its lock.
    async fn merge_vm(&self, record: VmRecord, domain: &DomainInfo) -> Vec<DriftEvent> {
        let mut events = Vec::new();
        let name = record.vm.name.clone();
        let driver_vm = Vm::from_config(&domain.config, record.vm.state);
        let state = observed_state(record.vm.state, domain.state);

        let updated = self
            .catalog
            .update(&name, |r| {
                if r.vm.state != state {
                    info!(vm = %name, from = %r.vm.state, to = %state, "VM state drifted");
                    events.push(DriftEvent::VmStateChanged {
                        vm: name.clone(),
                        from: r.vm.state,
                        to: state,
                    });
                    r.vm.set_state(state);
                }

                let descriptor = driver_vm.descriptor();
                if r.vm.descriptor() != descriptor || r.vm.autostart != driver_vm.autostart {
                    info!(vm = %name, "VM definition changed outside the core");
                    r.vm.apply_descriptor(&descriptor);
                    r.vm.autostart = driver_vm.autostart;
                    events.push(DriftEvent::VmDefinitionChanged { vm: name.clone() });
                }

                let on_host: BTreeSet<&str> = domain.snapshots.iter().map(String::as_str).collect();
                r.snapshots.retain(|s| {
                    let keep = on_host.contains(s.name.as_str());
                    if !keep {
                        events.push(DriftEvent::SnapshotPruned {
                            vm: name.clone(),
                            snapshot: s.name.clone(),
                        });
                    }
                    keep
                });
                for snapshot in &domain.snapshots {
                    if r.snapshot(snapshot).is_none() {
                        r.snapshots.push(Snapshot {
                            name: snapshot.clone(),
                            description: String::new(),
                            state: r.vm.state,
                            created_at: Utc::now(),
                            is_current: false,
                            descriptor: r.vm.descriptor(),
                        });
                        events.push(DriftEvent::SnapshotDiscovered {
                            vm: name.clone(),
                            snapshot: snapshot.clone(),
                        });
                    }
                }
            })
            .await;
        if updated.is_err() {
            return events;
        }
        events
    }

    /// Move a VM renamed on the host to its new name. The caller holds the
    /// old name's lock; a busy new name is left for the next pass.
    async fn follow_rename(&self, old: &str, new: &str) -> Option<DriftEvent> {
        let Some(_guard) = self.locks.try_lock(&EntityKey::Vm(new.to_string())) else {
            debug!(vm = %old, to = %new, "Target name busy, skipping rename");
            return None;
        };
        match self.catalog.rename(old, new).await {
            Ok(_) => {
                info!(from = %old, to = %new, "VM renamed outside the core");
                Some(DriftEvent::VmRenamed {
                    from: old.to_string(),
                    to: new.to_string(),
                })
            }
            Err(e) => {
                warn!(vm = %old, error = %e, "Cannot follow out-of-band rename");
                None
            }
        }
    }

    async fn discover_vm(&self, domain: &DomainInfo) -> Option<DriftEvent> {
        let name = domain.config.name.clone();
        // A create of this name may be between its define and its insert.
        let _guard = self.locks.try_lock(&EntityKey::Vm(name.clone()))?;
        if self.catalog.contains(&name).await {
            warn!(vm = %name, uuid = %domain.config.id, "Domain name clashes with a known VM");
            return None;
        }

        let state = observed_state(VmState::Stopped, domain.state);
        let vm = Vm::from_config(&domain.config, state);
        let descriptor = vm.descriptor();
        let mut record = VmRecord::new(vm);
        record.snapshots = domain
            .snapshots
            .iter()
            .map(|s| Snapshot {
                name: s.clone(),
                description: String::new(),
                state,
                created_at: Utc::now(),
                is_current: false,
                descriptor: descriptor.clone(),
            })
            .collect();

        match self.catalog.insert(record).await {
            Ok(()) => {
                info!(vm = %name, state = %state, "Discovered VM");
                Some(DriftEvent::VmDiscovered { vm: name, state })
            }
            Err(_) => None,
        }
    }

    /// Re-read one VM's power state from the driver and record it.
    ///
    /// The caller holds the VM's lock.
    pub(crate) async fn observe_vm(&self, name: &str) -> Result<Vm> {
        let vm = self.catalog.vm(name).await?;
        let power = tokio::time::timeout(self.driver_timeout, self.hypervisor.domain_state(&vm.uuid))
            .await
            .unwrap_or_else(|_| Err(HypervisorError::Timeout("domain state".to_string())))
            .map_err(|e| CoreError::from_driver(EntityKind::Vm, name, "observe", e))?;

        let state = observed_state(vm.state, power);
        self.catalog
            .update(name, |record| {
                if record.vm.state != state {
                    debug!(vm = %name, from = %record.vm.state, to = %state, "Observed state");
                    record.vm.set_state(state);
                }
                record.vm.clone()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::context::HostContext;
    use virtpanel_hypervisor::{MockBackend, MockHostNetwork, VmConfig};

    #[test]
    fn test_power_state_mapping() {
        assert_eq!(observed_state(VmState::Stopped, PowerState::Blocked), VmState::Running);
        assert_eq!(observed_state(VmState::Running, PowerState::PmSuspended), VmState::Paused);
        assert_eq!(observed_state(VmState::Running, PowerState::Crashed), VmState::Stopped);
        assert_eq!(observed_state(VmState::Defined, PowerState::Shutoff), VmState::Defined);
        assert_eq!(
            observed_state(VmState::Running, PowerState::ShuttingDown),
            VmState::ShuttingDown
        );
        assert_eq!(observed_state(VmState::Paused, PowerState::Unknown), VmState::Paused);
    }

    #[tokio::test]
    async fn test_rename_takes_new_name_lock_and_frees_old() {
        let backend = Arc::new(MockBackend::new());
        let ctx = HostContext::new(
            CoreConfig::in_memory(),
            backend.clone(),
            Arc::new(MockHostNetwork::new()),
        );
        let reconciler = ctx.reconciler();
        let config = VmConfig::new("web");
        backend.insert_domain(config.clone(), PowerState::Shutoff).unwrap();
        reconciler.reconcile_once().await.unwrap();
        assert!(ctx.vms().get("web").await.is_ok());

        backend.rename_vm(&config.id, "www").await.unwrap();
        let busy = reconciler.locks.try_lock(&EntityKey::Vm("www".into())).unwrap();
        let report = reconciler.reconcile_once().await.unwrap();
        assert!(report.events.iter().all(|e| !matches!(e, DriftEvent::VmRenamed { .. })));
        assert!(ctx.vms().get("web").await.is_ok());

        drop(busy);
        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(
            report.events,
            vec![DriftEvent::VmRenamed {
                from: "web".into(),
                to: "www".into(),
            }]
        );
        assert!(!reconciler.locks.is_tracked(&EntityKey::Vm("web".into())));
        assert_eq!(ctx.vms().get("www").await.unwrap().uuid, config.id);
    }

    #[tokio::test]
    async fn test_trigger_coalesces() {
        let (trigger, mut rx) = ReconcileTrigger::channel();
        trigger.fire();
        trigger.fire();
        trigger.fire();
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
