/*
    Multi-node mesh tests

    Every test brings up real nodes on ephemeral 127.0.0.1 ports with
    shortened republish and expiry intervals, then drives them through the
    public node operations.
*/

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::config::OverlayConfig;
use crate::core_overlay::error::OverlayError;
use crate::core_overlay::node::WeftNode;
use crate::core_overlay::node_id::NodeId;

fn test_config() -> OverlayConfig {
    OverlayConfig {
        republish_interval: Duration::from_millis(250),
        object_timeout: Duration::from_millis(900),
        rpc_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn start(prefix: &str) -> Arc<WeftNode> {
    WeftNode::start_with_id(NodeId::from_prefix(prefix).unwrap(), test_config())
        .await
        .unwrap()
}

async fn join(prefix: &str, seed: &WeftNode) -> Arc<WeftNode> {
    let config = OverlayConfig {
        seed: Some(seed.address().to_string()),
        ..test_config()
    };
    WeftNode::start_with_id(NodeId::from_prefix(prefix).unwrap(), config)
        .await
        .unwrap()
}

async fn settle() {
    sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_surrogate_routing_around_dead_nodes() {
    let n1 = start("1").await;
    let n3 = join("3", &n1).await;
    let n5 = join("5", &n1).await;
    let n7 = join("7", &n1).await;
    settle().await;

    assert!(n1.table.contains(n3.local()));
    assert!(n1.table.contains(n5.local()));
    assert!(n1.table.contains(n7.local()));

    n3.kill();
    n5.kill();
    settle().await;

    // Routing for digit 2 moves right over the dead 3 and 5 and lands on 7.
    let target = NodeId::from_prefix("2").unwrap();
    let (root, bad_nodes) = n1.find_root(&target, 0).await;
    assert_eq!(root.id, *n7.id());
    assert!(bad_nodes.contains(n3.local()));
    assert!(bad_nodes.contains(n5.local()));
    assert!(!n1.table.contains(n3.local()));
    assert!(!n1.table.contains(n5.local()));
}

#[tokio::test]
async fn test_store_and_get_across_nodes() {
    let n100 = start("100").await;
    let n456 = join("456", &n100).await;
    let _n1234 = join("1234", &n100).await;
    settle().await;

    n456.store("look at this lad", b"an absolute unit".to_vec())
        .await
        .unwrap();
    settle().await;

    let bytes = n100.get("look at this lad").await.unwrap();
    assert_eq!(bytes, b"an absolute unit".to_vec());
}

#[tokio::test]
async fn test_remove_stops_advertising_within_one_expiry() {
    let n100 = start("100").await;
    let n456 = join("456", &n100).await;
    settle().await;

    n456.store("look at this lad", b"an absolute unit".to_vec())
        .await
        .unwrap();
    settle().await;
    assert!(n100.get("look at this lad").await.is_ok());

    assert!(n456.remove("look at this lad"));
    assert!(!n456.remove("look at this lad"));

    // One republish interval plus the object timeout, with margin.
    sleep(Duration::from_millis(1600)).await;

    match n100.get("look at this lad").await {
        Err(OverlayError::NoReplicas { .. }) => {}
        other => panic!("expected NoReplicas, got {:?}", other.map(|_| "bytes")),
    }
}

#[tokio::test]
async fn test_join_absorbs_surrogated_keys() {
    let n1 = start("1").await;
    n1.store("k", b"payload".to_vec()).await.unwrap();
    assert_eq!(n1.locations.get("k"), vec![n1.local().clone()]);

    // A joiner whose identifier is the key's own hash out-surrogates the
    // original root, so the join hands the registration over.
    let n2 = WeftNode::start_with_id(
        NodeId::hash("k"),
        OverlayConfig {
            seed: Some(n1.address().to_string()),
            ..test_config()
        },
    )
    .await
    .unwrap();
    settle().await;

    assert!(n1.locations.get("k").is_empty());
    assert_eq!(n2.locations.get("k"), vec![n1.local().clone()]);

    let replicas = n1.lookup("k").await.unwrap();
    assert_eq!(replicas, vec![n1.local().clone()]);
    let replicas = n2.lookup("k").await.unwrap();
    assert_eq!(replicas, vec![n1.local().clone()]);
}

#[tokio::test]
async fn test_graceful_leave_suggests_replacements() {
    let n114 = start("114").await;
    let n214 = join("214", &n114).await;
    let n224 = join("224", &n214).await;
    let n234 = join("234", &n224).await;
    let n244 = join("244", &n234).await;
    settle().await;

    // 114's level-0 slot for digit 2 is full with the three closer nodes.
    assert!(!n114.table.contains(n244.local()));
    assert!(n214.table.contains(n244.local()));
    assert!(n224.table.contains(n244.local()));
    assert!(n234.table.contains(n244.local()));

    n214.leave().await;
    settle().await;
    n224.leave().await;
    settle().await;
    n234.leave().await;
    settle().await;

    assert!(!n114.table.contains(n214.local()));
    assert!(!n114.table.contains(n224.local()));
    assert!(!n114.table.contains(n234.local()));
    assert!(n114.table.contains(n244.local()));
}

#[tokio::test]
async fn test_kill_leaves_stale_route_until_next_failed_call() {
    let n1 = start("1").await;
    let n2 = join("2", &n1).await;
    settle().await;
    assert!(n1.table.contains(n2.local()));

    n2.kill();
    settle().await;

    // An ungraceful exit sends no notifications; the stale entry survives
    // until the next call to it fails.
    assert!(n1.table.contains(n2.local()));

    let target = NodeId::from_prefix("2").unwrap();
    let (root, _) = n1.find_root(&target, 0).await;
    assert_eq!(root.id, *n1.id());
    assert!(!n1.table.contains(n2.local()));
}

#[tokio::test]
async fn test_publish_keeps_entry_alive_past_expiry() {
    let n1 = start("1").await;
    let n2 = join("2", &n1).await;
    settle().await;

    n2.store("steady", b"still here".to_vec()).await.unwrap();

    // Well past the object timeout; the republish loop must have refreshed
    // the registration at the root.
    sleep(Duration::from_millis(1800)).await;
    let replicas = n1.lookup("steady").await.unwrap();
    assert_eq!(replicas, vec![n2.local().clone()]);
}

#[tokio::test]
async fn test_overwrite_cancels_previous_publisher() {
    let n1 = start("1").await;
    n1.store("key", b"one".to_vec()).await.unwrap();
    n1.store("key", b"two".to_vec()).await.unwrap();
    settle().await;

    assert_eq!(n1.get("key").await.unwrap(), b"two".to_vec());
    assert_eq!(n1.blobs().len(), 1);
}

#[tokio::test]
async fn test_client_store_lookup_get() {
    let n1 = start("1").await;
    let n2 = join("2", &n1).await;
    settle().await;

    let client = crate::client::WeftClient::connect(n2.address()).await.unwrap();
    assert_eq!(client.node().id, *n2.id());

    client.store("greeting", b"hello".to_vec()).await.unwrap();
    settle().await;

    let replicas = client.lookup("greeting").await.unwrap();
    assert_eq!(replicas, vec![n2.local().clone()]);
    assert_eq!(client.get("greeting").await.unwrap(), b"hello".to_vec());

    match client.get("missing").await {
        Err(OverlayError::NoReplicas { .. }) => {}
        other => panic!("expected NoReplicas, got {:?}", other.map(|_| "bytes")),
    }
}
