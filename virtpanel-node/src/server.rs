//! Daemon runtime: drivers, host context, reconcile loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use virtpanel_core::{
    CreateNetworkRequest, CreatePoolRequest, ErrorKind, HostContext, Validate,
};
use virtpanel_hypervisor::{
    HostNetwork, Hypervisor, IptablesHostNetwork, MockBackend, MockHostNetwork,
};

use crate::config::{Config, HostNetworkBackend};

/// Run the daemon until ctrl-c.
pub async fn run(config: Config) -> Result<()> {
    // Initialize hypervisor backend
    info!("Using in-memory hypervisor backend");
    let hypervisor: Arc<dyn Hypervisor> = Arc::new(MockBackend::new());

    let host_network: Arc<dyn HostNetwork> = match config.host_network.backend {
        HostNetworkBackend::Iptables => {
            info!("Programming port forwards with iptables");
            Arc::new(IptablesHostNetwork::new())
        }
        HostNetworkBackend::Mock => {
            info!("Using in-memory host network");
            Arc::new(MockHostNetwork::new())
        }
    };

    let ctx = HostContext::new(config.core.clone(), hypervisor, host_network);
    let report = ctx
        .bootstrap()
        .await
        .context("Failed to load host state")?;
    info!(drift = report.events.len(), "Host state loaded");

    if config.hypervisor.seed_defaults {
        seed_defaults(&ctx).await?;
    }

    let shutdown = CancellationToken::new();
    let reconciler = ctx.spawn_reconciler(shutdown.clone());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutdown requested");

    shutdown.cancel();
    if let Err(e) = reconciler.await {
        warn!(error = %e, "Reconciler task ended abnormally");
    }
    info!("virtpanel node stopped");
    Ok(())
}

/// Make sure a `default` pool and a `default` network exist and run.
async fn seed_defaults(ctx: &HostContext) -> Result<()> {
    let token = CancellationToken::new();
    let registry = ctx.registry();
    let pool_name = ctx.config().default_pool.clone();

    match registry.get_pool(&pool_name).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let request = CreatePoolRequest {
                name: pool_name.clone(),
                path: None,
                pool_type: None,
            };
            registry.create_pool(request.validate()?, &token).await?;
            info!(pool = %pool_name, "Seeded storage pool");
        }
        Err(e) => return Err(e.into()),
    }
    registry.start_pool(&pool_name, &token).await?;

    match registry.get_network("default").await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let request = CreateNetworkRequest::new("default");
            registry.create_network(request.validate()?, &token).await?;
            info!(network = "default", "Seeded network");
        }
        Err(e) => return Err(e.into()),
    }
    registry.start_network("default", &token).await?;
    Ok(())
}
