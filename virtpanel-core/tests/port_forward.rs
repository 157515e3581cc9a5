//! Port forwards survive a restart of the host context.

mod common;

use virtpanel_core::{AddPortForwardRequest, CoreConfig, ErrorKind, Validate};

fn rule(host_port: i64, end: Option<i64>) -> AddPortForwardRequest {
    AddPortForwardRequest {
        protocol: "tcp".into(),
        host_port,
        host_port_end: end,
        vm_ip: "192.168.122.10".into(),
        vm_port: 22,
        comment: Some("ssh".into()),
    }
}

#[tokio::test]
async fn test_rules_reapplied_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = CoreConfig {
        port_forward_state: Some(dir.path().join("portforwards.json")),
        ..CoreConfig::in_memory()
    };

    let first = common::host_with(config.clone()).await;
    let added = first
        .ctx
        .port_forwards()
        .add(rule(2222, None).validate().unwrap(), &first.token)
        .await
        .unwrap();
    let err = first
        .ctx
        .port_forwards()
        .add(rule(2200, Some(2300)).validate().unwrap(), &first.token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err.to_string().contains(&added.id), "{}", err);

    // A new context over a fresh host network, as after a reboot.
    let second = common::host_with(config).await;
    assert!(second.host_network.applied().is_empty());
    second.ctx.bootstrap().await.unwrap();

    assert_eq!(second.ctx.port_forwards().list().await, vec![added.clone()]);
    assert!(second.host_network.applied().contains_key(&added.id));

    second
        .ctx
        .port_forwards()
        .delete(&added.id, &second.token)
        .await
        .unwrap();
    assert!(second.host_network.applied().is_empty());
    let saved = std::fs::read_to_string(dir.path().join("portforwards.json")).unwrap();
    assert!(!saved.contains(&added.id));
}
