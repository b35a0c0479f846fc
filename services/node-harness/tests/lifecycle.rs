//! Integration tests for per-node lifecycle operations.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use rstest::rstest;

use node_harness::{
    HarnessError, ManagerConfig, MockBackend, NodeManager, NodeName, NodeSpec, Source,
};

async fn running_node(dir: &Path) -> (NodeManager, MockBackend) {
    let mock = MockBackend::new();
    let config = ManagerConfig::new(dir.join("data"), dir.join("tmp")).with_test_id("lifecycle");
    let manager = NodeManager::builder(config)
        .backend(mock.clone())
        .start()
        .await
        .unwrap();

    manager
        .setup_nodes(vec![NodeSpec::new(
            "node1",
            "mock",
            Source::Image("aeternity/aeternity:latest".to_string()),
        )])
        .await
        .unwrap();
    manager.start_node("node1").await.unwrap();
    (manager, mock)
}

#[rstest]
#[case("sync", "mock://")]
#[case("ext_http", "http://node1:3013/")]
#[case("int_http", "http://node1:3113/")]
#[case("ws", "http://node1:3014/")]
#[tokio::test]
async fn test_service_address_after_start(#[case] service: &str, #[case] prefix: &str) {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _mock) = running_node(dir.path()).await;

    let address = manager.get_service_address("node1", service).await.unwrap();
    assert!(address.as_str().starts_with(prefix), "{address}");

    manager.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_service_query_fails_after_stop() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, mock) = running_node(dir.path()).await;

    manager.stop_node("node1", Duration::ZERO).await.unwrap();

    let err = manager
        .get_service_address("node1", "ext_http")
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Backend { op: "get_service_address", .. }));
    assert!(mock.inventory().calls.contains(&"stop_node:node1".to_string()));

    manager.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_service_query_fails_after_kill() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _mock) = running_node(dir.path()).await;

    manager.kill_node("node1").await.unwrap();
    assert!(manager.get_service_address("node1", "sync").await.is_err());

    // A killed node can be started again.
    manager.start_node("node1").await.unwrap();
    assert!(manager.get_service_address("node1", "sync").await.is_ok());

    manager.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_node_state_updates_persist() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _mock) = running_node(dir.path()).await;

    // The mock rejects starting a node it already recorded as running.
    let err = manager.start_node("node1").await.unwrap_err();
    assert!(err.to_string().contains("already running"));

    manager.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_pubkey_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _mock) = running_node(dir.path()).await;

    let first = manager.get_node_pubkey("node1").await.unwrap();
    let second = manager.get_node_pubkey("node1").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.as_bytes().len(), 32);

    let sync = manager.get_service_address("node1", "sync").await.unwrap();
    assert!(sync.as_str().contains(&first.to_hex()));

    manager.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_run_cmd() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _mock) = running_node(dir.path()).await;

    let output = manager
        .run_cmd_in_node_dir(
            "node1",
            vec!["echo".into(), "hello".into(), "world".into()],
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert!(output.success());
    assert_eq!(output.output, "hello world\n");

    let failed = manager
        .run_cmd_in_node_dir("node1", vec!["false".into()], Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(failed.exit_code, 1);

    manager.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_run_cmd_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _mock) = running_node(dir.path()).await;

    let err = manager
        .run_cmd_in_node_dir(
            "node1",
            vec!["sleep".into(), "5".into()],
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();

    match err {
        HarnessError::CommandTimeout { node, timeout } => {
            assert_eq!(node.as_str(), "node1");
            assert_eq!(timeout, Duration::from_millis(50));
        }
        other => panic!("unexpected error: {other}"),
    }

    manager.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_extract_archive_and_networks() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, mock) = running_node(dir.path()).await;

    manager
        .extract_archive("node1", "/home/aeternity/node/plugins", Bytes::from_static(b"tar"))
        .await
        .unwrap();
    assert!(manager
        .extract_archive("node1", "/tmp", Bytes::new())
        .await
        .is_err());

    manager.connect_node("node1", "net_a").await.unwrap();
    assert!(manager.connect_node("node1", "net_a").await.is_err());
    assert!(mock.inventory().networks[&NodeName::new("node1")].contains("net_a"));

    manager.disconnect_node("node1", "net_a").await.unwrap();
    assert!(manager.disconnect_node("node1", "net_a").await.is_err());
    assert!(mock.inventory().networks[&NodeName::new("node1")].is_empty());

    manager.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_unknown_node_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _mock) = running_node(dir.path()).await;

    let err = manager.start_node("ghost").await.unwrap_err();
    assert!(matches!(err, HarnessError::NodeNotFound(ref n) if n.as_str() == "ghost"));
    assert!(err.is_contract_violation());

    // The manager keeps serving after a contract violation.
    assert!(manager.get_node_pubkey("node1").await.is_ok());

    manager.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_call_timeout_does_not_cancel_request() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _mock) = running_node(dir.path()).await;

    // Occupy the manager with a slow command from another handle.
    let busy = manager.clone();
    let slow = tokio::spawn(async move {
        busy.run_cmd_in_node_dir(
            "node1",
            vec!["sleep".into(), "0.3".into()],
            Duration::from_secs(5),
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let impatient = manager.with_timeout(Duration::from_millis(10));
    let err = impatient.kill_node("node1").await.unwrap_err();
    assert!(matches!(err, HarnessError::CallTimeout { op: "kill_node", .. }));

    assert!(slow.await.unwrap().unwrap().success());

    // The timed-out kill was still handled.
    assert!(manager.get_service_address("node1", "sync").await.is_err());

    manager.cleanup().await.unwrap();
}

#[rstest]
#[case("1e30")]
#[case("inf")]
#[case("-5")]
#[tokio::test]
async fn test_run_cmd_out_of_range_sleep(#[case] operand: &str) {
    let dir = tempfile::tempdir().unwrap();
    let (manager, mock) = running_node(dir.path()).await;

    let output = manager
        .run_cmd_in_node_dir(
            "node1",
            vec!["sleep".into(), operand.into()],
            Duration::from_millis(50),
        )
        .await
        .unwrap();
    assert_eq!(output.exit_code, 1);
    assert!(output.output.contains("invalid time interval"));

    assert!(manager.is_running());
    manager.cleanup().await.unwrap().into_result().unwrap();

    let inventory = mock.inventory();
    assert!(inventory.live.is_empty());
    assert!(!inventory.backend_running);
}
