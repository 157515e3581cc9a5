//! Drift between the core and the hypervisor.

mod common;

use std::time::Duration;

use virtpanel_core::{
    CoreConfig, CreateSnapshotRequest, DriftEvent, ErrorKind, Validate, VmState,
};
use virtpanel_hypervisor::{
    Device, DiskConfig, Hypervisor, PowerState, VmConfig,
};

#[tokio::test]
async fn test_out_of_band_power_changes() {
    let host = common::host().await;
    host.create_vm("web").await;
    host.ctx.vms().start("web", &host.token).await.unwrap();

    // The guest powers itself off.
    host.backend.set_domain_state("web", PowerState::Shutoff).unwrap();
    let report = host.ctx.reconciler().reconcile_once().await.unwrap();
    assert_eq!(
        report.events,
        vec![DriftEvent::VmStateChanged {
            vm: "web".into(),
            from: VmState::Running,
            to: VmState::Stopped,
        }]
    );
    assert_eq!(host.ctx.vms().get("web").await.unwrap().state, VmState::Stopped);

    // Nothing changed since.
    assert!(host.ctx.reconciler().reconcile_once().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_defined_vm_stays_defined_while_off() {
    let host = common::host().await;
    host.create_vm("web").await;
    host.backend.set_domain_state("web", PowerState::Crashed).unwrap();

    let report = host.ctx.reconciler().reconcile_once().await.unwrap();
    assert!(report.is_empty(), "unexpected drift: {:?}", report.events);
    assert_eq!(host.ctx.vms().get("web").await.unwrap().state, VmState::Defined);
}

#[tokio::test]
async fn test_discovers_and_loses_domains() {
    let host = common::host().await;
    host.backend
        .insert_domain(VmConfig::new("foreign").with_cpu(1), PowerState::Running)
        .unwrap();

    let report = host.ctx.reconciler().reconcile_once().await.unwrap();
    assert_eq!(
        report.events,
        vec![DriftEvent::VmDiscovered {
            vm: "foreign".into(),
            state: VmState::Running,
        }]
    );

    // Discovered VMs are managed like any other.
    let vm = host.ctx.vms().destroy("foreign", &host.token).await.unwrap();
    assert_eq!(vm.state, VmState::Stopped);
    assert_eq!(vm.cpu, 1);

    host.backend.remove_domain("foreign").unwrap();
    let report = host.ctx.reconciler().reconcile_once().await.unwrap();
    assert_eq!(
        report.events,
        vec![DriftEvent::VmLost {
            vm: "foreign".into()
        }]
    );
    let err = host.ctx.vms().get("foreign").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_follows_rename_and_definition_changes() {
    let host = common::host().await;
    let vm = host.create_vm("web").await;

    host.backend.rename_vm(&vm.uuid, "www").await.unwrap();
    let disk = DiskConfig::new("/var/lib/libvirt/images/default/extra.qcow2", "vdb");
    host.backend
        .attach_device(&vm.uuid, &Device::Disk(disk), false)
        .await
        .unwrap();

    let report = host.ctx.reconciler().reconcile_once().await.unwrap();
    assert!(report.events.contains(&DriftEvent::VmDefinitionChanged { vm: "web".into() }));
    assert!(report.events.contains(&DriftEvent::VmRenamed {
        from: "web".into(),
        to: "www".into(),
    }));

    let renamed = host.ctx.vms().get("www").await.unwrap();
    assert_eq!(renamed.uuid, vm.uuid);
    assert!(renamed.disk("vdb").is_some());
    assert_eq!(host.ctx.vms().get("web").await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_snapshot_drift() {
    let host = common::host().await;
    let vm = host.create_vm("web").await;
    let request = CreateSnapshotRequest {
        name: "base".into(),
        description: None,
    };
    host.ctx
        .snapshots()
        .create("web", request.validate().unwrap(), &host.token)
        .await
        .unwrap();

    host.backend.delete_snapshot(&vm.uuid, "base").await.unwrap();
    host.backend
        .create_snapshot(&vm.uuid, "manual", "taken with virsh")
        .await
        .unwrap();

    let report = host.ctx.reconciler().reconcile_once().await.unwrap();
    assert!(report.events.contains(&DriftEvent::SnapshotPruned {
        vm: "web".into(),
        snapshot: "base".into(),
    }));
    assert!(report.events.contains(&DriftEvent::SnapshotDiscovered {
        vm: "web".into(),
        snapshot: "manual".into(),
    }));

    // A discovered snapshot never becomes current on its own.
    let snapshots = host.ctx.snapshots().list("web").await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert!(!snapshots[0].is_current);
}

#[tokio::test]
async fn test_pool_drift() {
    let host = common::host().await;
    host.create_vm("web").await;
    host.backend.set_pool_active("default", false).unwrap();

    let report = host.ctx.reconciler().reconcile_once().await.unwrap();
    assert_eq!(
        report.events,
        vec![DriftEvent::PoolActivityChanged {
            pool: "default".into(),
            active: false,
        }]
    );
    assert!(!host.ctx.registry().get_pool("default").await.unwrap().active);

    let err = host.ctx.vms().start("web", &host.token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

/// A lost connection fails the pass without touching the catalog.
#[tokio::test]
async fn test_unreachable_hypervisor_is_retryable() {
    let host = common::host().await;
    host.create_vm("web").await;
    host.backend.set_connected(false);

    let err = host.ctx.reconciler().reconcile_once().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(err.is_retryable());
    assert_eq!(host.ctx.vms().list().await.len(), 1);

    host.backend.set_connected(true);
    assert!(host.ctx.reconciler().reconcile_once().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_background_loop_picks_up_drift() {
    let host = common::host_with(CoreConfig {
        reconcile_interval_secs: 5,
        ..CoreConfig::in_memory()
    })
    .await;
    host.create_vm("web").await;
    host.ctx.vms().start("web", &host.token).await.unwrap();

    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = host.ctx.spawn_reconciler(shutdown.clone());

    host.backend.set_domain_state("web", PowerState::Paused).unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(host.ctx.vms().get("web").await.unwrap().state, VmState::Paused);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_bootstrap_loads_existing_host() {
    let host = common::host().await;
    host.backend
        .insert_domain(VmConfig::new("legacy"), PowerState::Shutoff)
        .unwrap();

    let report = host.ctx.bootstrap().await.unwrap();
    assert!(report.events.contains(&DriftEvent::VmDiscovered {
        vm: "legacy".into(),
        state: VmState::Stopped,
    }));
    assert_eq!(host.ctx.vms().list().await.len(), 1);
}
