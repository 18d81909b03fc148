// Two-node cluster tests over real sockets: invalidation and replication
// propagation, loop suppression, failure detection

use bytes::Bytes;
use cachemesh_cluster::{ClusterMessage, MessageSender, SenderConfig};
use cachemesh_core::config::{CacheOverrides, NodeConfig};
use cachemesh_core::types::{PeerAddress, ReplicationMode};
use cachemesh_node::CacheNode;
use std::time::Duration;

fn free_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

fn node_config(name: &str, port: u16, peer_ports: &[u16], mode: ReplicationMode) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.cluster.node_id = name.to_string();
    config.cluster.communication_port = port;
    config.cluster.heartbeat_interval_ms = 100;
    config.cluster.heartbeat_timeout_ms = 500;
    config.cluster.discovery.static_peers = peer_ports
        .iter()
        .map(|p| format!("127.0.0.1:{}", p))
        .collect::<Vec<_>>()
        .join(",");
    config.caches.insert(
        "test".to_string(),
        CacheOverrides {
            replication_mode: Some(mode),
            ..Default::default()
        },
    );
    config
}

async fn wait_until<F: Fn() -> bool>(deadline: Duration, condition: F) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

fn free_port_pair() -> (u16, u16) {
    let a = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let b = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    (a.local_addr().unwrap().port(), b.local_addr().unwrap().port())
}

async fn start_pair(mode: ReplicationMode) -> (CacheNode, CacheNode) {
    let (p1, p2) = free_port_pair();
    let n1 = CacheNode::new(node_config("node-1", p1, &[p2], mode)).unwrap();
    let n2 = CacheNode::new(node_config("node-2", p2, &[p1], mode)).unwrap();
    n1.start().await.unwrap();
    n2.start().await.unwrap();

    let peer2 = PeerAddress::parse(&format!("127.0.0.1:{}", p2)).unwrap();
    let peer1 = PeerAddress::parse(&format!("127.0.0.1:{}", p1)).unwrap();
    let linked = wait_until(Duration::from_secs(5), || {
        n1.membership().is_peer_healthy(&peer2) && n2.membership().is_peer_healthy(&peer1)
    })
    .await;
    assert!(linked, "nodes never saw each other as healthy");
    (n1, n2)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalidate_mode_propagates_deletes() {
    let (n1, n2) = start_pair(ReplicationMode::Invalidate).await;

    // n2 holds a locally cached view
    n2.manager()
        .put("test", "k", Bytes::from_static(b"stale"), None)
        .unwrap();

    // A put on n1 pushes an invalidation to its peers
    n1.service()
        .put("test", "k", Bytes::from_static(b"fresh"), Some(Duration::from_secs(60)))
        .await
        .unwrap();

    let gone = wait_until(Duration::from_secs(5), || {
        n2.manager().get("test", "k").unwrap().is_none()
    })
    .await;
    assert!(gone, "invalidation never reached the peer");

    // The writer keeps its own fresh value
    assert_eq!(
        n1.service().get("test", "k").unwrap(),
        Some(Bytes::from_static(b"fresh"))
    );

    n1.shutdown().await;
    n2.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replicate_mode_propagates_values() {
    let (n1, n2) = start_pair(ReplicationMode::Replicate).await;

    n1.service()
        .put("test", "k", Bytes::from_static(b"v"), Some(Duration::from_secs(60)))
        .await
        .unwrap();

    let replicated = wait_until(Duration::from_secs(5), || {
        n2.manager().get("test", "k").unwrap() == Some(Bytes::from_static(b"v"))
    })
    .await;
    assert!(replicated, "value never replicated to the peer");

    n1.shutdown().await;
    n2.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_explicit_invalidation_propagates() {
    let (n1, n2) = start_pair(ReplicationMode::Invalidate).await;

    n2.manager()
        .put("test", "k", Bytes::from_static(b"v"), None)
        .unwrap();

    n1.service().invalidate("test", "k").await.unwrap();

    let gone = wait_until(Duration::from_secs(5), || {
        n2.manager().get("test", "k").unwrap().is_none()
    })
    .await;
    assert!(gone);

    n1.shutdown().await;
    n2.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalidate_all_propagates() {
    let (n1, n2) = start_pair(ReplicationMode::Invalidate).await;

    for key in ["a", "b", "c"] {
        n2.manager()
            .put("test", key, Bytes::from_static(b"v"), None)
            .unwrap();
    }

    n1.service().invalidate_all("test").await.unwrap();

    let cleared = wait_until(Duration::from_secs(5), || {
        n2.manager().stats("test").unwrap().size == 0
    })
    .await;
    assert!(cleared);

    n1.shutdown().await;
    n2.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_self_originated_messages_are_dropped() {
    let port = free_port();
    let n1 = CacheNode::new(node_config("node-1", port, &[], ReplicationMode::Invalidate)).unwrap();
    n1.start().await.unwrap();

    n1.manager()
        .put("test", "k", Bytes::from_static(b"v"), None)
        .unwrap();

    let sender = MessageSender::new(SenderConfig::default());
    let peer = PeerAddress::parse(&format!("127.0.0.1:{}", port)).unwrap();

    // Origin equals the receiving node: must be ignored
    sender
        .send(
            &peer,
            &ClusterMessage::Invalidation {
                cache_name: "test".to_string(),
                key: Some("k".to_string()),
                origin_node_id: "node-1".to_string(),
                version: 1,
                timestamp: 1,
            },
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        n1.manager().get("test", "k").unwrap(),
        Some(Bytes::from_static(b"v"))
    );

    // A foreign origin is applied
    sender
        .send(
            &peer,
            &ClusterMessage::Invalidation {
                cache_name: "test".to_string(),
                key: Some("k".to_string()),
                origin_node_id: "node-9".to_string(),
                version: 1,
                timestamp: 1,
            },
        )
        .await
        .unwrap();
    let gone = wait_until(Duration::from_secs(3), || {
        n1.manager().get("test", "k").unwrap().is_none()
    })
    .await;
    assert!(gone);

    n1.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dead_peer_detected() {
    let (n1, n2) = start_pair(ReplicationMode::None).await;
    let peer2 = n1.membership().known_peers()[0].clone();

    n2.shutdown().await;

    let detected = wait_until(Duration::from_secs(10), || {
        !n1.membership().is_peer_healthy(&peer2)
    })
    .await;
    assert!(detected, "dead peer never marked unhealthy");
    assert!(n1.membership().active_peers().is_empty());
    // The peer stays known for when it comes back
    assert_eq!(n1.membership().known_peers().len(), 1);

    n1.shutdown().await;
}
