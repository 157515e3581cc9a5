//! Configuration management for the host daemon.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use virtpanel_core::CoreConfig;

use crate::cli::Args;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings of the control-plane core
    pub core: CoreConfig,
    pub logging: LoggingConfig,
    pub hypervisor: HypervisorConfig,
    pub host_network: HostNetworkConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if let Some(ref format) = args.log_format {
            self.logging.format = format.clone();
        }

        if let Some(ref path) = args.port_forward_state {
            self.core.port_forward_state = Some(path.clone());
        }

        if let Some(interval) = args.reconcile_interval {
            self.core.reconcile_interval_secs = interval;
        }

        if args.dev {
            self.host_network.backend = HostNetworkBackend::Mock;
            self.hypervisor.seed_defaults = true;
        }

        self
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback level when `RUST_LOG` is unset
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Hypervisor backend configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Create a `default` pool and network on an empty host
    pub seed_defaults: bool,
}

/// Host network configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostNetworkConfig {
    pub backend: HostNetworkBackend,
}

/// Where port forwards are programmed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostNetworkBackend {
    /// iptables NAT rules on the host
    #[default]
    Iptables,
    /// In-memory, for development
    Mock,
}
