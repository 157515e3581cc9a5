//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

/// virtpanel host daemon - VM, storage, network and port forward management
#[derive(Parser, Debug, Default)]
#[command(name = "virtpanel-node")]
#[command(about = "virtpanel host daemon - VM, storage, network and port forward management")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "VIRTPANEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "VIRTPANEL_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, env = "VIRTPANEL_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// File the port forward rules are saved to
    #[arg(long, env = "VIRTPANEL_PORT_FORWARD_STATE")]
    pub port_forward_state: Option<PathBuf>,

    /// Seconds between two reconcile passes
    #[arg(long, env = "VIRTPANEL_RECONCILE_INTERVAL")]
    pub reconcile_interval: Option<u64>,

    /// Development mode: in-memory host network, seeded default pool and network
    #[arg(long)]
    pub dev: bool,
}
