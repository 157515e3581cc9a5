//! Bounded, cancellable driver calls.
//!
//! A driver call is spawned onto the runtime so that it always runs to
//! completion, even when the caller stops waiting. The caller waits for the
//! acknowledgement, its cancellation token, or the configured timeout,
//! whichever comes first. When the call finishes the VM's in-flight marker
//! is cleared and a reconcile pass is requested, so the true outcome of an
//! abandoned call still reaches the catalog.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use virtpanel_hypervisor::HypervisorError;

use crate::catalog::VmCatalog;
use crate::error::{CoreError, EntityKind, Result};
use crate::reconciler::ReconcileTrigger;

/// What a driver call acts on, for error context.
#[derive(Debug, Clone)]
pub struct Target {
    pub kind: EntityKind,
    pub id: String,
}

impl Target {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

pub struct Dispatcher {
    timeout: Duration,
    catalog: Arc<VmCatalog>,
    trigger: ReconcileTrigger,
}

impl Dispatcher {
    pub fn new(timeout: Duration, catalog: Arc<VmCatalog>, trigger: ReconcileTrigger) -> Self {
        Self {
            timeout,
            catalog,
            trigger,
        }
    }

    /// Run a driver call against a registry entity or the host network.
    pub async fn call<T, F>(
        &self,
        target: Target,
        operation: &str,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = std::result::Result<T, HypervisorError>> + Send + 'static,
    {
        self.run(target, operation, cancel, None, call).await
    }

    /// Run a driver call against the VM `name`/`uuid`, marking it in flight
    /// until the driver answers.
    pub async fn call_vm<T, F>(
        &self,
        name: &str,
        uuid: &str,
        operation: &str,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = std::result::Result<T, HypervisorError>> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(CoreError::cancelled(EntityKind::Vm, name, operation));
        }
        self.catalog.set_in_flight(name, operation).await?;
        self.run(
            Target::new(EntityKind::Vm, name),
            operation,
            cancel,
            Some(uuid.to_string()),
            call,
        )
        .await
    }

    async fn run<T, F>(
        &self,
        target: Target,
        operation: &str,
        cancel: &CancellationToken,
        vm_uuid: Option<String>,
        call: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = std::result::Result<T, HypervisorError>> + Send + 'static,
    {
        if cancel.is_cancelled() {
            if let Some(uuid) = &vm_uuid {
                self.catalog.clear_in_flight(uuid).await;
            }
            return Err(CoreError::cancelled(target.kind, target.id, operation));
        }

        let catalog = self.catalog.clone();
        let trigger = self.trigger.clone();
        let task_op = operation.to_string();
        let mut handle = tokio::spawn(async move {
            let result = call.await;
            if let Some(uuid) = vm_uuid {
                catalog.clear_in_flight(&uuid).await;
            }
            debug!(op = %task_op, ok = result.is_ok(), "Driver call finished");
            trigger.fire();
            result
        });

        tokio::select! {
            biased;
            joined = &mut handle => match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(CoreError::from_driver(target.kind, target.id, operation, e)),
                Err(e) => Err(CoreError::from_driver(
                    target.kind,
                    target.id,
                    operation,
                    HypervisorError::Internal(format!("driver task failed: {}", e)),
                )),
            },
            _ = cancel.cancelled() => {
                warn!(kind = %target.kind, id = %target.id, op = operation, "Stopped waiting for driver: cancelled");
                Err(CoreError::cancelled(target.kind, target.id, operation))
            }
            _ = tokio::time::sleep(self.timeout) => {
                warn!(kind = %target.kind, id = %target.id, op = operation, timeout_secs = self.timeout.as_secs(), "Stopped waiting for driver: timed out");
                Err(CoreError::unavailable(
                    target.kind,
                    target.id,
                    operation,
                    format!("no acknowledgement within {}s", self.timeout.as_secs()),
                ))
            }
        }
    }
}
