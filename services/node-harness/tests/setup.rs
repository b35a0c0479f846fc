//! Integration tests for node setup and peer resolution.

use std::path::Path;

use node_harness::{
    Address, HarnessError, ManagerConfig, MockBackend, NodeManager, NodeName, NodeSpec, Peer,
    Source,
};

fn image() -> Source {
    Source::Image("aeternity/aeternity:latest".to_string())
}

async fn start_manager(dir: &Path) -> (NodeManager, MockBackend) {
    let mock = MockBackend::new();
    let config = ManagerConfig::new(dir.join("data"), dir.join("tmp")).with_test_id("setup");
    let manager = NodeManager::builder(config)
        .backend(mock.clone())
        .start()
        .await
        .unwrap();
    (manager, mock)
}

#[tokio::test]
async fn test_symbolic_peer_resolves_to_registered_address() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, mock) = start_manager(dir.path()).await;

    manager
        .setup_nodes(vec![NodeSpec::new("node1", "mock", image())])
        .await
        .unwrap();
    manager.start_node("node1").await.unwrap();
    let sync_address = manager.get_service_address("node1", "sync").await.unwrap();

    manager
        .setup_nodes(vec![
            NodeSpec::new("node2", "mock", image()).with_peer(Peer::node("node1"))
        ])
        .await
        .unwrap();

    let inventory = mock.inventory();
    assert_eq!(
        inventory.peers[&NodeName::new("node2")],
        vec![sync_address]
    );

    manager.cleanup().await.unwrap().into_result().unwrap();
}

#[tokio::test]
async fn test_peers_within_one_batch_and_literals() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, mock) = start_manager(dir.path()).await;

    manager
        .setup_nodes(vec![
            NodeSpec::new("node1", "mock", image())
                .with_peer(Peer::node("node2"))
                .with_peer(Peer::literal("aenode://pk_ext@10.0.0.9:3015")),
            NodeSpec::new("node2", "mock", image()).with_peer(Peer::node("node1")),
        ])
        .await
        .unwrap();

    let inventory = mock.inventory();
    let node1_peers = &inventory.peers[&NodeName::new("node1")];
    let node2_peers = &inventory.peers[&NodeName::new("node2")];

    assert_eq!(node1_peers.len(), 2);
    assert!(node1_peers[0].as_str().ends_with("@node2:3015"));
    assert_eq!(node1_peers[1], Address::new("aenode://pk_ext@10.0.0.9:3015"));
    assert!(node2_peers[0].as_str().ends_with("@node1:3015"));

    // The predicted address must match the one the node reports once running.
    manager.start_node("node2").await.unwrap();
    assert_eq!(
        manager.get_service_address("node2", "sync").await.unwrap(),
        node1_peers[0]
    );

    manager.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_unknown_peer_leaves_registry_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, mock) = start_manager(dir.path()).await;

    manager
        .setup_nodes(vec![NodeSpec::new("node1", "mock", image())])
        .await
        .unwrap();

    let err = manager
        .setup_nodes(vec![
            NodeSpec::new("node2", "mock", image()),
            NodeSpec::new("node3", "mock", image()).with_peer(Peer::node("ghost")),
        ])
        .await
        .unwrap_err();

    match err {
        HarnessError::PeerNotFound { node, peer } => {
            assert_eq!(node.as_str(), "node3");
            assert_eq!(peer.as_str(), "ghost");
        }
        other => panic!("unexpected error: {other}"),
    }

    let status = manager.status().await.unwrap();
    assert_eq!(status.nodes, vec![NodeName::new("node1")]);
    assert_eq!(mock.inventory().live.len(), 1);

    manager.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_unknown_backend_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, mock) = start_manager(dir.path()).await;

    let err = manager
        .setup_nodes(vec![
            NodeSpec::new("node1", "mock", image()),
            NodeSpec::new("node2", "docker", image()),
        ])
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::BackendNotProvided(ref id) if id.as_str() == "docker"));
    assert!(err.is_config_error());
    assert!(manager.status().await.unwrap().nodes.is_empty());
    assert!(mock.inventory().calls.is_empty());

    manager.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_resetup_keeps_old_resource_until_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, mock) = start_manager(dir.path()).await;

    manager
        .setup_nodes(vec![NodeSpec::new("node1", "mock", image())])
        .await
        .unwrap();
    manager
        .setup_nodes(vec![NodeSpec::new("node1", "mock", image())])
        .await
        .unwrap();

    assert_eq!(manager.status().await.unwrap().nodes.len(), 1);
    assert_eq!(mock.inventory().live_count("node1"), 2);

    manager.cleanup().await.unwrap();

    // Only the registered instance is torn down.
    assert_eq!(mock.inventory().live_count("node1"), 1);
}

#[tokio::test]
async fn test_failed_setup_keeps_earlier_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockBackend::new();
    let healthy = MockBackend::with_id("healthy");
    let config = ManagerConfig::new(dir.path().join("data"), dir.path().join("tmp"));
    let manager = NodeManager::builder(config)
        .backend(healthy.clone())
        .backend(mock.clone())
        .start()
        .await
        .unwrap();
    mock.fail_on("setup_node");

    let err = manager
        .setup_nodes(vec![
            NodeSpec::new("node1", "healthy", image()),
            NodeSpec::new("node2", "mock", image()),
        ])
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::Backend { op: "setup_node", .. }));
    assert_eq!(
        manager.status().await.unwrap().nodes,
        vec![NodeName::new("node1")]
    );

    manager.cleanup().await.unwrap();
    assert!(healthy.inventory().live.is_empty());
}
