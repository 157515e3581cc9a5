//! VM lifecycle, attachments, clone, rename and batch operations.

mod common;

use virtpanel_core::{
    AttachDiskRequest, AttachIsoRequest, AttachNicRequest, BatchRequest, CloneVmRequest,
    CreateSnapshotRequest, CreateVmRequest, CreateVolumeRequest, ErrorKind, RenameVmRequest,
    UpdateVmRequest, Validate, VmOp, VmState,
};
use virtpanel_hypervisor::{BootDevice, DiskFormat, HypervisorError, PowerState, ShutdownBehavior};

use common::Host;

/// Drive a fresh VM into `state`.
async fn vm_in_state(host: &Host, name: &str, state: VmState) {
    let vms = host.ctx.vms();
    let token = &host.token;
    host.create_vm(name).await;
    match state {
        VmState::Defined => {}
        VmState::Running => {
            vms.start(name, token).await.unwrap();
        }
        VmState::Paused => {
            vms.start(name, token).await.unwrap();
            vms.suspend(name, token).await.unwrap();
        }
        VmState::ShuttingDown => {
            vms.start(name, token).await.unwrap();
            host.backend.set_shutdown_behavior(ShutdownBehavior::Acknowledge);
            vms.shutdown(name, token).await.unwrap();
            host.backend.set_shutdown_behavior(ShutdownBehavior::Immediate);
        }
        VmState::Stopped => {
            vms.start(name, token).await.unwrap();
            vms.destroy(name, token).await.unwrap();
        }
    }
    assert_eq!(vms.get(name).await.unwrap().state, state);
}

fn expected(op: VmOp, from: VmState) -> Option<Option<VmState>> {
    use VmState::*;
    match (op, from) {
        (VmOp::Start, Defined | Stopped | Running) => Some(Some(Running)),
        (VmOp::Shutdown, Running) => Some(Some(Stopped)),
        (VmOp::Destroy, Running | ShuttingDown) => Some(Some(Stopped)),
        (VmOp::Reboot, Running) => Some(Some(Running)),
        (VmOp::Suspend, Running) => Some(Some(Paused)),
        (VmOp::Resume, Paused) => Some(Some(Running)),
        // Deleted VMs have no state.
        (VmOp::Delete, Defined | Stopped) => Some(None),
        _ => None,
    }
}

/// Every (operation, state) pair either reaches its target state or fails
/// with `Conflict` and leaves the VM alone.
#[tokio::test]
async fn test_transition_table() {
    let states = [
        VmState::Defined,
        VmState::Running,
        VmState::Paused,
        VmState::ShuttingDown,
        VmState::Stopped,
    ];
    for op in VmOp::ALL {
        for from in states {
            let host = common::host().await;
            vm_in_state(&host, "vm", from).await;

            let vms = host.ctx.vms();
            let token = &host.token;
            let result = match op {
                VmOp::Start => vms.start("vm", token).await.map(Some),
                VmOp::Shutdown => vms.shutdown("vm", token).await.map(Some),
                VmOp::Destroy => vms.destroy("vm", token).await.map(Some),
                VmOp::Reboot => vms.reboot("vm", token).await.map(Some),
                VmOp::Suspend => vms.suspend("vm", token).await.map(Some),
                VmOp::Resume => vms.resume("vm", token).await.map(Some),
                VmOp::Delete => vms.delete("vm", false, token).await.map(|_| None),
            };

            match expected(op, from) {
                Some(to) => {
                    let vm = result.unwrap_or_else(|e| panic!("{} from {}: {}", op, from, e));
                    assert_eq!(vm.map(|v| v.state), to, "{} from {}", op, from);
                }
                None => {
                    let err = result.unwrap_err();
                    assert_eq!(err.kind(), ErrorKind::Conflict, "{} from {}", op, from);
                    assert_eq!(vms.get("vm").await.unwrap().state, from);
                }
            }
        }
    }
}

#[tokio::test]
async fn test_start_running_vm_is_noop() {
    let host = common::host().await;
    vm_in_state(&host, "web", VmState::Running).await;
    let before = host.backend.calls().len();

    let vm = host.ctx.vms().start("web", &host.token).await.unwrap();
    assert_eq!(vm.state, VmState::Running);
    assert_eq!(host.backend.calls().len(), before);
}

/// A start the driver half-applied is reported as the driver sees it.
#[tokio::test]
async fn test_failed_start_reports_observed_state() {
    let host = common::host().await;
    host.create_vm("web").await;
    host.backend.fail_after_apply(
        "start_vm",
        HypervisorError::OperationFailed("qemu exited early".into()),
    );

    let err = host.ctx.vms().start("web", &host.token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DriverFailure);
    assert!(err.to_string().contains("start (defined -> running)"));
    assert_eq!(host.ctx.vms().get("web").await.unwrap().state, VmState::Running);
}

#[tokio::test]
async fn test_failed_shutdown_leaves_vm_running() {
    let host = common::host().await;
    vm_in_state(&host, "web", VmState::Running).await;
    host.backend
        .fail_next("shutdown_vm", HypervisorError::OperationFailed("no acpi".into()));

    let err = host.ctx.vms().shutdown("web", &host.token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DriverFailure);
    assert_eq!(host.ctx.vms().get("web").await.unwrap().state, VmState::Running);
}

#[tokio::test]
async fn test_start_requires_active_resources() {
    let host = common::host().await;
    host.create_vm("web").await;
    host.ctx.registry().stop_pool("default", &host.token).await.unwrap();

    let err = host.ctx.vms().start("web", &host.token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(!host.backend.calls().contains(&"start_vm".to_string()));

    host.ctx.registry().start_pool("default", &host.token).await.unwrap();
    host.ctx.vms().start("web", &host.token).await.unwrap();
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn test_create_rejects_bad_input_and_duplicates() {
    let host = common::host().await;

    for request in [
        CreateVmRequest::new("web", 0, 2048, 20),
        CreateVmRequest::new("web", 2, -1, 20),
        CreateVmRequest::new("web", 2, 2048, 0),
        CreateVmRequest::new("bad name", 2, 2048, 20),
    ] {
        assert_eq!(request.validate().unwrap_err().kind(), ErrorKind::Invalid);
    }

    host.create_vm("web").await;
    let again = CreateVmRequest::new("web", 1, 512, 5).validate().unwrap();
    let err = host.ctx.vms().create(again, &host.token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

/// A left-over root volume blocks a new VM of the same name.
#[tokio::test]
async fn test_create_with_existing_root_volume_is_conflict() {
    let host = common::host().await;
    host.create_vm("web").await;
    host.ctx.vms().delete("web", false, &host.token).await.unwrap();

    let cmd = CreateVmRequest::new("web", 2, 2048, 20).validate().unwrap();
    let err = host.ctx.vms().create(cmd, &host.token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_failed_define_removes_new_volume() {
    let host = common::host().await;
    host.backend
        .fail_next("define_vm", HypervisorError::OperationFailed("bad xml".into()));

    let cmd = CreateVmRequest::new("web", 2, 2048, 20).validate().unwrap();
    let err = host.ctx.vms().create(cmd, &host.token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DriverFailure);

    assert!(host.ctx.vms().list().await.is_empty());
    assert!(host.ctx.registry().list_volumes("default").await.unwrap().is_empty());
    assert!(host.backend.calls().contains(&"delete_volume".to_string()));
}

/// The original error survives a failing cleanup.
#[tokio::test]
async fn test_failed_cleanup_keeps_original_error() {
    let host = common::host().await;
    host.backend
        .fail_next("define_vm", HypervisorError::OperationFailed("bad xml".into()));
    host.backend
        .fail_next("delete_volume", HypervisorError::OperationFailed("busy".into()));

    let cmd = CreateVmRequest::new("web", 2, 2048, 20).validate().unwrap();
    let err = host.ctx.vms().create(cmd, &host.token).await.unwrap_err();
    assert!(err.to_string().contains("bad xml"));
}

#[tokio::test]
async fn test_create_with_unknown_network_allocates_nothing() {
    let host = common::host().await;
    let mut request = CreateVmRequest::new("web", 2, 2048, 20);
    request.network = Some("missing".into());

    let err = host
        .ctx
        .vms()
        .create(request.validate().unwrap(), &host.token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(host.ctx.registry().list_volumes("default").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_presets_and_install_media() {
    let host = common::host().await;
    host.create_network("lan").await;

    let mut request = CreateVmRequest::new("win", 4, 8192, 60);
    request.os_type = Some("windows".into());
    request.network = Some("lan".into());
    request.iso = Some("/var/lib/libvirt/images/iso/win11.iso".into());
    let vm = host
        .ctx
        .vms()
        .create(request.validate().unwrap(), &host.token)
        .await
        .unwrap();

    assert_eq!(vm.disks[0].target, "sda");
    assert_eq!(vm.nics[0].model.as_str(), "e1000");
    assert!(vm.nics[0].mac.starts_with("52:54:00:"));
    assert_eq!(vm.boot, vec![BootDevice::Cdrom, BootDevice::Disk]);
    assert_eq!(vm.iso(), Some("/var/lib/libvirt/images/iso/win11.iso"));
    assert_eq!(vm.cpu_model.as_deref(), Some("host-passthrough"));

    let mut outside = CreateVmRequest::new("other", 1, 512, 5);
    outside.iso = Some("/tmp/other.iso".into());
    let err = host
        .ctx
        .vms()
        .create(outside.validate().unwrap(), &host.token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
}

#[tokio::test]
async fn test_import_existing_volume() {
    let host = common::host().await;
    let volume = CreateVolumeRequest {
        name: "appliance.raw".into(),
        capacity: 8,
        format: Some("raw".into()),
    };
    let volume = host
        .ctx
        .registry()
        .create_volume("default", volume.validate().unwrap(), &host.token)
        .await
        .unwrap();

    let mut request = CreateVmRequest::new("appliance", 1, 1024, 0);
    request.volume = Some("appliance.raw".into());
    let vm = host
        .ctx
        .vms()
        .create(request.clone().validate().unwrap(), &host.token)
        .await
        .unwrap();
    assert_eq!(vm.disks[0].source, volume.path);
    assert_eq!(vm.disks[0].format, DiskFormat::Raw);

    request.name = "second".into();
    let err = host
        .ctx
        .vms()
        .create(request.validate().unwrap(), &host.token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

// =============================================================================
// Update / rename / autostart
// =============================================================================

#[tokio::test]
async fn test_update_only_while_not_running() {
    let host = common::host().await;
    vm_in_state(&host, "web", VmState::Running).await;
    let update = || UpdateVmRequest {
        cpu: Some(4),
        memory: Some(4096),
    };

    let err = host
        .ctx
        .vms()
        .update("web", update().validate().unwrap(), &host.token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    host.ctx.vms().destroy("web", &host.token).await.unwrap();
    let vm = host
        .ctx
        .vms()
        .update("web", update().validate().unwrap(), &host.token)
        .await
        .unwrap();
    assert_eq!((vm.cpu, vm.memory_mib), (4, 4096));
    let domain = host.backend.domain("web").unwrap();
    assert_eq!(domain.config.cpu.vcpus, 4);
    assert_eq!(domain.config.memory_mib, 4096);
}

#[tokio::test]
async fn test_rename() {
    let host = common::host().await;
    vm_in_state(&host, "web", VmState::Running).await;
    host.create_vm("db").await;
    let rename = |name: &str| RenameVmRequest {
        new_name: name.to_string(),
    };

    let err = host
        .ctx
        .vms()
        .rename("web", rename("www").validate().unwrap(), &host.token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    host.ctx.vms().destroy("web", &host.token).await.unwrap();
    let err = host
        .ctx
        .vms()
        .rename("web", rename("db").validate().unwrap(), &host.token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let vm = host
        .ctx
        .vms()
        .rename("web", rename("www").validate().unwrap(), &host.token)
        .await
        .unwrap();
    assert_eq!(vm.name, "www");
    assert_eq!(host.ctx.vms().get("web").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert!(host.backend.domain("www").is_some());
}

#[tokio::test]
async fn test_autostart() {
    let host = common::host().await;
    host.create_vm("web").await;

    let vm = host.ctx.vms().set_autostart("web", true, &host.token).await.unwrap();
    assert!(vm.autostart);
    assert!(host.backend.domain("web").unwrap().config.autostart);

    let report = host.ctx.reconciler().reconcile_once().await.unwrap();
    assert!(report.is_empty(), "unexpected drift: {:?}", report.events);
}

// =============================================================================
// Disks
// =============================================================================

async fn data_volume(host: &Host, name: &str) {
    let request = CreateVolumeRequest {
        name: name.into(),
        capacity: 10,
        format: None,
    };
    host.ctx
        .registry()
        .create_volume("default", request.validate().unwrap(), &host.token)
        .await
        .unwrap();
}

fn disk(volume: &str, target: Option<&str>) -> AttachDiskRequest {
    AttachDiskRequest {
        pool: "default".into(),
        volume: volume.into(),
        target: target.map(str::to_string),
        bus: None,
        readonly: false,
    }
}

#[tokio::test]
async fn test_disk_attach_and_detach() {
    let host = common::host().await;
    let vms = host.ctx.vms();
    let token = &host.token;
    host.create_vm("web").await;
    data_volume(&host, "data1.qcow2").await;
    data_volume(&host, "data2.qcow2").await;

    let vm = vms
        .attach_disk("web", disk("data1.qcow2", None).validate().unwrap(), token)
        .await
        .unwrap();
    let attached = vm.disk("vdb").expect("auto target");
    assert_eq!(attached.format, DiskFormat::Qcow2);

    let err = vms
        .attach_disk("web", disk("data2.qcow2", Some("vdb")).validate().unwrap(), token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = vms
        .attach_disk("web", disk("data1.qcow2", None).validate().unwrap(), token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = vms
        .attach_disk("web", disk("missing.qcow2", None).validate().unwrap(), token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    vms.start("web", token).await.unwrap();
    let err = vms.detach_disk("web", "vda", token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = vms.detach_disk("web", "vdz", token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let vm = vms.detach_disk("web", "vdb", token).await.unwrap();
    assert!(vm.disk("vdb").is_none());
    assert_eq!(host.backend.domain("web").unwrap().config.disks.len(), 1);
}

#[tokio::test]
async fn test_boot_disk_detach_when_stopped() {
    let host = common::host().await;
    host.create_vm("web").await;
    let vm = host.ctx.vms().detach_disk("web", "vda", &host.token).await.unwrap();
    assert!(vm.disks.is_empty());
}

// =============================================================================
// NICs
// =============================================================================

fn nic(network: &str, mac: Option<&str>) -> AttachNicRequest {
    AttachNicRequest {
        network: network.into(),
        model: None,
        mac: mac.map(str::to_string),
    }
}

/// attach -> detach by MAC -> the network can be deleted again.
#[tokio::test]
async fn test_nic_round_trip() {
    let host = common::host().await;
    let vms = host.ctx.vms();
    let token = &host.token;
    host.create_vm("web").await;
    host.create_network("net0").await;

    let vm = vms
        .attach_nic("web", nic("net0", Some("52:54:00:AA:BB:CC")).validate().unwrap(), token)
        .await
        .unwrap();
    assert_eq!(vm.nics[0].mac, "52:54:00:aa:bb:cc");

    let err = host.ctx.registry().delete_network("net0", token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let vm = vms.detach_nic("web", "52-54-00-AA-BB-CC", token).await.unwrap();
    assert!(vm.nic("52:54:00:aa:bb:cc").is_none());
    host.ctx.registry().delete_network("net0", token).await.unwrap();
}

#[tokio::test]
async fn test_nic_conflicts() {
    let host = common::host().await;
    let vms = host.ctx.vms();
    let token = &host.token;
    host.create_vm("web").await;
    host.create_network("lan").await;

    vms.attach_nic("web", nic("lan", Some("52:54:00:00:00:01")).validate().unwrap(), token)
        .await
        .unwrap();
    let err = vms
        .attach_nic("web", nic("lan", Some("52:54:00:00:00:01")).validate().unwrap(), token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = vms
        .attach_nic("web", nic("wan", None).validate().unwrap(), token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = vms.detach_nic("web", "52:54:00:00:00:02", token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = vms.detach_nic("web", "not-a-mac", token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);

    // Generated MACs never collide with an existing NIC.
    let vm = vms
        .attach_nic("web", nic("lan", None).validate().unwrap(), token)
        .await
        .unwrap();
    assert_eq!(vm.nics.len(), 2);
    assert_ne!(vm.nics[0].mac, vm.nics[1].mac);
}

// =============================================================================
// ISO
// =============================================================================

fn iso(path: &str) -> AttachIsoRequest {
    AttachIsoRequest { path: path.into() }
}

#[tokio::test]
async fn test_iso_attach_replace_detach() {
    let host = common::host().await;
    let vms = host.ctx.vms();
    let token = &host.token;
    host.create_vm("web").await;

    let err = vms
        .attach_iso("web", iso("/srv/debian.iso").validate().unwrap(), token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);

    let vm = vms
        .attach_iso("web", iso("/var/lib/libvirt/images/iso/debian.iso").validate().unwrap(), token)
        .await
        .unwrap();
    assert_eq!(vm.iso(), Some("/var/lib/libvirt/images/iso/debian.iso"));
    assert_eq!(vm.boot[0], BootDevice::Cdrom);

    let vm = vms
        .attach_iso("web", iso("/var/lib/libvirt/images/iso/alpine.iso").validate().unwrap(), token)
        .await
        .unwrap();
    assert_eq!(vm.iso(), Some("/var/lib/libvirt/images/iso/alpine.iso"));

    let vm = vms.detach_iso("web", token).await.unwrap();
    assert_eq!(vm.iso(), None);
    let media_calls = host.backend.calls().iter().filter(|c| *c == "change_media").count();

    // Ejecting an empty drive touches nothing.
    let again = vms.detach_iso("web", token).await.unwrap();
    assert_eq!(again, vm);
    assert_eq!(
        host.backend.calls().iter().filter(|c| *c == "change_media").count(),
        media_calls
    );
}

#[tokio::test]
async fn test_finish_install() {
    let host = common::host().await;
    let mut request = CreateVmRequest::new("web", 2, 2048, 20);
    request.iso = Some("/var/lib/libvirt/images/iso/debian.iso".into());
    host.ctx
        .vms()
        .create(request.validate().unwrap(), &host.token)
        .await
        .unwrap();

    let vm = host.ctx.vms().finish_install("web", &host.token).await.unwrap();
    assert_eq!(vm.iso(), None);
    assert_eq!(vm.boot, vec![BootDevice::Disk, BootDevice::Cdrom]);
    assert_eq!(
        host.backend.domain("web").unwrap().config.boot,
        vec![BootDevice::Disk, BootDevice::Cdrom]
    );
}

// =============================================================================
// Clone / delete / batch
// =============================================================================

#[tokio::test]
async fn test_clone_copies_volumes_not_snapshots() {
    let host = common::host().await;
    let token = &host.token;
    host.create_vm("web").await;
    host.create_network("lan").await;
    host.ctx
        .vms()
        .attach_nic("web", nic("lan", None).validate().unwrap(), token)
        .await
        .unwrap();
    let snapshot = CreateSnapshotRequest {
        name: "base".into(),
        description: None,
    };
    host.ctx
        .snapshots()
        .create("web", snapshot.validate().unwrap(), token)
        .await
        .unwrap();

    let request = CloneVmRequest {
        new_name: "web2".into(),
    };
    let copy = host
        .ctx
        .vms()
        .clone_vm("web", request.validate().unwrap(), token)
        .await
        .unwrap();
    let source = host.ctx.vms().get("web").await.unwrap();

    assert_eq!(copy.state, VmState::Defined);
    assert_ne!(copy.uuid, source.uuid);
    assert_ne!(copy.nics[0].mac, source.nics[0].mac);
    assert_ne!(copy.disks[0].source, source.disks[0].source);
    assert!(host.ctx.registry().volume_by_path(&copy.disks[0].source).await.is_some());
    assert!(host.ctx.snapshots().list("web2").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_clone_rules() {
    let host = common::host().await;
    let token = &host.token;
    vm_in_state(&host, "web", VmState::Running).await;
    let request = |name: &str| CloneVmRequest {
        new_name: name.into(),
    };

    let err = host
        .ctx
        .vms()
        .clone_vm("web", request("web2").validate().unwrap(), token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    host.ctx.vms().destroy("web", token).await.unwrap();
    host.backend
        .fail_next("define_vm", HypervisorError::OperationFailed("bad xml".into()));
    let err = host
        .ctx
        .vms()
        .clone_vm("web", request("web2").validate().unwrap(), token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DriverFailure);
    assert_eq!(host.ctx.registry().list_volumes("default").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_with_storage() {
    let host = common::host().await;
    host.create_vm("web").await;
    host.ctx.vms().delete("web", true, &host.token).await.unwrap();

    assert!(host.ctx.registry().list_volumes("default").await.unwrap().is_empty());
    assert!(host.backend.domain("web").is_none());
}

#[tokio::test]
async fn test_batch_reports_each_vm() {
    let host = common::host().await;
    host.create_vm("a").await;
    host.create_vm("b").await;

    let request = BatchRequest {
        action: "start".into(),
        names: vec!["a".into(), "b".into(), "ghost".into()],
    };
    let outcomes = host
        .ctx
        .vms()
        .batch(request.validate().unwrap(), &host.token)
        .await;

    assert_eq!(outcomes.len(), 3);
    for outcome in &outcomes {
        match outcome.name.as_str() {
            "ghost" => assert_eq!(
                outcome.result.as_ref().unwrap_err().kind(),
                ErrorKind::NotFound
            ),
            _ => assert!(outcome.result.is_ok(), "{}: {:?}", outcome.name, outcome.result),
        }
    }
    assert_eq!(host.backend.domain("a").unwrap().state, PowerState::Running);
    assert_eq!(host.backend.domain("b").unwrap().state, PowerState::Running);
}
