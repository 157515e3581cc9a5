//! # virtpanel Core
//!
//! Control-plane core for one hypervisor host.
//!
//! ## Components
//!
//! - [`LifecycleManager`] - VM state machine, create/clone/delete, and disk,
//!   NIC and ISO attachments
//! - [`ResourceRegistry`] - storage pools, volumes and virtual networks with
//!   referential guards
//! - [`SnapshotManager`] - snapshots with a single current snapshot per VM
//! - [`IsoLibrary`] - installation images in the ISO directory
//! - [`PortForwardManager`] - host port forwarding rules
//! - [`Reconciler`] - folds the hypervisor's ground truth back into the core
//! - [`HostContext`] - builds and owns all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       HostContext                        │
//! │  ┌───────────┐ ┌──────────┐ ┌──────────┐ ┌────────────┐  │
//! │  │ Lifecycle │ │ Snapshot │ │ Registry │ │PortForwards│  │
//! │  └─────┬─────┘ └────┬─────┘ └────┬─────┘ └─────┬──────┘  │
//! │        └────────────┴─────┬──────┴─────────────┘         │
//! │              EntityLocks + Dispatcher ──► trigger        │
//! │                           │                  │           │
//! │                           │            ┌─────▼──────┐    │
//! │                           │            │ Reconciler │    │
//! │                           │            └─────┬──────┘    │
//! └───────────────────────────┼──────────────────┼───────────┘
//!                             ▼                  ▼
//!                  Hypervisor / HostNetwork (virtpanel-hypervisor)
//! ```
//!
//! Requests enter as `*Request` structs, are turned into typed commands by
//! [`Validate`], and are then applied by one manager under the entity locks
//! of everything they touch.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use virtpanel_core::{CoreConfig, CreateVmRequest, HostContext, Validate};
//! use virtpanel_hypervisor::{MockBackend, MockHostNetwork};
//!
//! let ctx = HostContext::new(
//!     CoreConfig::in_memory(),
//!     Arc::new(MockBackend::new()),
//!     Arc::new(MockHostNetwork::new()),
//! );
//! ctx.bootstrap().await?;
//!
//! let token = CancellationToken::new();
//! let cmd = CreateVmRequest::new("v1", 2, 2048, 20).validate()?;
//! let vm = ctx.vms().create(cmd, &token).await?;
//! ctx.vms().start(&vm.name, &token).await?;
//! ```

pub mod catalog;
pub mod command;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod iso;
pub mod lifecycle;
pub mod locks;
pub mod model;
pub mod portforward;
pub mod reconciler;
pub mod registry;
pub mod snapshot;
pub mod transition;

pub use command::*;
pub use config::CoreConfig;
pub use context::HostContext;
pub use error::{CoreError, EntityKind, ErrorKind, Result};
pub use iso::IsoLibrary;
pub use lifecycle::{BatchOutcome, LifecycleManager};
pub use model::*;
pub use portforward::PortForwardManager;
pub use reconciler::{DriftEvent, ReconcileReport, Reconciler};
pub use registry::ResourceRegistry;
pub use snapshot::SnapshotManager;
pub use transition::VmOp;
