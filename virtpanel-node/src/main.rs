//! # virtpanel Node Daemon
//!
//! Runs on a hypervisor host and keeps the control-plane core in step with
//! it: loads the host's VMs, pools and networks, re-applies saved port
//! forwards, and reconciles drift until stopped.
//!
//! ## Usage
//! ```bash
//! virtpanel-node --config /etc/virtpanel/node.yaml
//! ```

use std::str::FromStr;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use virtpanel_common::LogFormat;

mod cli;
mod config;
mod server;

use cli::Args;
use config::Config;

const DEFAULT_CONFIG_PATH: &str = "/etc/virtpanel/node.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration before logging so the file can pick the format
    let (config, source) = match &args.config {
        Some(path) => (Config::load(path)?, Some(path.display().to_string())),
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => (cfg, Some(DEFAULT_CONFIG_PATH.to_string())),
            Err(_) => (Config::default(), None),
        },
    };
    let config = config.with_cli_overrides(&args);

    // Initialize logging
    let format = LogFormat::from_str(&config.logging.format)?;
    virtpanel_common::init_logging_with(&config.logging.level, format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting virtpanel node daemon"
    );
    match source {
        Some(path) => info!(config_path = %path, "Configuration loaded"),
        None => info!("No config file found, using CLI arguments and defaults"),
    }
    info!(
        host_network = ?config.host_network.backend,
        reconcile_interval_secs = config.core.reconcile_interval_secs,
        "Node daemon configured"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "Daemon failed");
        return Err(e);
    }

    Ok(())
}
