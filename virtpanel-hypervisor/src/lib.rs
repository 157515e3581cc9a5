//! # virtpanel Hypervisor
//!
//! Driver contracts between the control-plane core and the host.
//!
//! The core never talks to libvirt or the firewall directly. It consumes two
//! traits:
//! - [`Hypervisor`] - domains, devices, snapshots, storage pools/volumes and
//!   virtual networks, plus a ground-truth `poll_state` read.
//! - [`HostNetwork`] - host firewall/NAT programming for port forwards.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             virtpanel-core              │
//! └──────────┬───────────────────┬──────────┘
//!            ▼                   ▼
//! ┌───────────────────┐ ┌───────────────────┐
//! │  Hypervisor trait │ │ HostNetwork trait │
//! └─────────┬─────────┘ └─────────┬─────────┘
//!           ▼                     ▼
//! ┌───────────────────┐ ┌───────────────────┐
//! │    MockBackend    │ │IptablesHostNetwork│
//! │ (external drivers)│ │  MockHostNetwork  │
//! └───────────────────┘ └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use virtpanel_hypervisor::{Hypervisor, MockBackend, VmConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MockBackend::new();
//!
//!     let config = VmConfig::new("my-vm")
//!         .with_cpu(4)
//!         .with_memory(4096);
//!
//!     backend.define_vm(&config).await.unwrap();
//!     backend.start_vm(&config.id).await.unwrap();
//! }
//! ```

pub mod error;
pub mod forward;
pub mod mac;
pub mod mock;
pub mod traits;
pub mod types;

pub use error::HypervisorError;
pub use forward::{IptablesHostNetwork, PortForward, Protocol};
pub use mac::{generate_mac_address, normalize_mac};
pub use mock::{MockBackend, MockHostNetwork, ShutdownBehavior};
pub use traits::{HostNetwork, Hypervisor, HypervisorCapabilities};
pub use types::*;
