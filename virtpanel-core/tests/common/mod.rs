//! Shared fixture: a host context over the in-memory drivers with an active
//! `default` pool.

#![allow(dead_code)]

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use virtpanel_core::{
    CoreConfig, CreateNetworkRequest, CreatePoolRequest, CreateVmRequest, HostContext, Validate,
    Vm,
};
use virtpanel_hypervisor::{MockBackend, MockHostNetwork};

pub struct Host {
    pub ctx: HostContext,
    pub backend: Arc<MockBackend>,
    pub host_network: Arc<MockHostNetwork>,
    pub token: CancellationToken,
}

pub async fn host() -> Host {
    host_with(CoreConfig::in_memory()).await
}

pub async fn host_with(config: CoreConfig) -> Host {
    let backend = Arc::new(MockBackend::new());
    let host_network = Arc::new(MockHostNetwork::new());
    let ctx = HostContext::new(config, backend.clone(), host_network.clone());
    let token = CancellationToken::new();

    let pool = CreatePoolRequest {
        name: "default".to_string(),
        path: None,
        pool_type: None,
    };
    ctx.registry()
        .create_pool(pool.validate().expect("valid pool"), &token)
        .await
        .expect("create default pool");
    ctx.registry()
        .start_pool("default", &token)
        .await
        .expect("start default pool");

    Host {
        ctx,
        backend,
        host_network,
        token,
    }
}

impl Host {
    /// A 2 vCPU / 2 GiB VM with a new 20 GiB disk in the default pool.
    pub async fn create_vm(&self, name: &str) -> Vm {
        let cmd = CreateVmRequest::new(name, 2, 2048, 20)
            .validate()
            .expect("valid create request");
        self.ctx
            .vms()
            .create(cmd, &self.token)
            .await
            .expect("create vm")
    }

    pub async fn create_network(&self, name: &str) {
        let cmd = CreateNetworkRequest::new(name)
            .validate()
            .expect("valid network");
        self.ctx
            .registry()
            .create_network(cmd, &self.token)
            .await
            .expect("create network");
    }
}
