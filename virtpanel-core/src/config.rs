//! Core configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings shared by every manager of a [`crate::HostContext`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Seconds between two reconcile passes
    pub reconcile_interval_secs: u64,
    /// Seconds to wait for a driver acknowledgement
    pub driver_timeout_secs: u64,
    /// Directory that holds every storage pool
    pub storage_root: PathBuf,
    /// Directory ISO images may be attached from
    pub iso_dir: PathBuf,
    /// Pool used when a create request names none
    pub default_pool: String,
    pub default_arch: String,
    /// JSON file the port forward rules are saved to; `None` keeps them in memory
    pub port_forward_state: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 5,
            driver_timeout_secs: 120,
            storage_root: PathBuf::from("/var/lib/libvirt/images"),
            iso_dir: PathBuf::from("/var/lib/libvirt/images/iso"),
            default_pool: "default".to_string(),
            default_arch: "x86_64".to_string(),
            port_forward_state: Some(PathBuf::from("/etc/virtpanel/portforwards.json")),
        }
    }
}

impl CoreConfig {
    /// Defaults with nothing written to disk, for tests and embedding.
    pub fn in_memory() -> Self {
        Self {
            port_forward_state: None,
            ..Self::default()
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn driver_timeout(&self) -> Duration {
        Duration::from_secs(self.driver_timeout_secs.max(1))
    }
}
