#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use murmur_core::clock::VectorClock;
use murmur_core::config::GossipConfig;
use murmur_core::coordinator::Coordinator;
use murmur_core::event::GossipEvent;
use murmur_core::rumor::{Envelope, Rumor};
use murmur_core::transport::{InMemoryNetwork, InMemoryNode, SharedTransport};
use serde_json::json;

const CLUSTER_SIZE: usize = 10;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn node_id(idx: usize) -> String {
    format!("node-{idx}")
}

fn sim_config(idx: usize) -> GossipConfig {
    GossipConfig {
        node_id: node_id(idx),
        push_fanout: 3,
        pull_fanout: 3,
        gossip_interval: Duration::from_millis(50),
        anti_entropy_interval: Duration::from_secs(600),
        heartbeat_interval: Duration::from_secs(600),
        retransmission_probability: 1.0,
        convergence_threshold: 0.95,
        ..GossipConfig::default()
    }
}

/// Bring up a fully meshed simulated cluster with live inbox pumps.
fn spawn_cluster(network: &Arc<InMemoryNetwork>) -> Vec<Arc<Coordinator>> {
    let mut nodes = Vec::with_capacity(CLUSTER_SIZE);
    let mut inboxes = Vec::with_capacity(CLUSTER_SIZE);
    for idx in 0..CLUSTER_SIZE {
        let registration = network.register(node_id(idx));
        let transport: SharedTransport = registration.transport.clone();
        let coordinator = Arc::new(Coordinator::new(sim_config(idx), transport).unwrap());
        nodes.push(coordinator);
        inboxes.push(registration.inbox);
    }
    for (idx, coordinator) in nodes.iter().enumerate() {
        coordinator.start().unwrap();
        for peer in 0..CLUSTER_SIZE {
            if peer != idx {
                coordinator.add_peer(node_id(peer), addr(9000 + peer as u16));
            }
        }
    }
    for (coordinator, inbox) in nodes.iter().zip(inboxes) {
        coordinator.attach_inbox(inbox).unwrap();
    }
    nodes
}

async fn stop_cluster(nodes: Vec<Arc<Coordinator>>) {
    for coordinator in nodes {
        coordinator.stop().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_broadcast_reaches_nearly_every_node() {
    let network = InMemoryNetwork::new();
    let nodes = spawn_cluster(&network);
    let mut origin_events = nodes[0].subscribe();

    nodes[0].broadcast(json!({"text": "hello"})).await.unwrap();

    // With fanout 3 in a 10-node mesh the rumor reaches everyone within a
    // handful of 50ms rounds; the deadline is generous, not tight.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let reached = nodes
            .iter()
            .filter(|coordinator| coordinator.metrics().dissemination.stored >= 1)
            .count();
        if reached as f64 / CLUSTER_SIZE as f64 >= 0.95 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "broadcast only reached {reached}/{CLUSTER_SIZE} nodes in time"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The originator's tracker observes relays (duplicates and pull
    // responses) until the coverage threshold is crossed.
    let achieved = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match origin_events.recv().await {
                Ok(GossipEvent::ConvergenceAchieved { coverage, .. }) => break coverage,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(other) => panic!("event stream closed: {other:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert!(achieved >= 0.95);

    stop_cluster(nodes).await;
}

#[tokio::test]
async fn replayed_message_is_stored_and_respread_once() {
    let network = InMemoryNetwork::new();
    // Three quiet nodes, driven by hand: node-a receives, node-b is the
    // sender, node-c is the only forward candidate.
    let quiet = |id: &str| GossipConfig {
        node_id: id.to_string(),
        gossip_interval: Duration::from_secs(600),
        anti_entropy_interval: Duration::from_secs(600),
        heartbeat_interval: Duration::from_secs(600),
        ..GossipConfig::default()
    };
    let spawn = |id: &str| -> (Arc<Coordinator>, InMemoryNode) {
        let registration = network.register(id);
        let transport: SharedTransport = registration.transport.clone();
        let coordinator = Arc::new(Coordinator::new(quiet(id), transport).unwrap());
        coordinator.start().unwrap();
        (coordinator, registration)
    };
    let (node_a, _a) = spawn("node-a");
    let (_node_b, _b) = spawn("node-b");
    let (_node_c, mut c) = spawn("node-c");
    node_a.add_peer("node-b", addr(9001));
    node_a.add_peer("node-c", addr(9002));

    let rumor = Rumor::originate("node-b", json!("once"), None);
    let push = Envelope::Push {
        from: "node-b".to_string(),
        clock: VectorClock::new(),
        rumors: vec![rumor.clone()],
    };
    node_a.handle_envelope(push.clone()).await;
    node_a.handle_envelope(push).await;

    // Exactly one stored copy and one re-spread despite the replay.
    let stats = node_a.metrics().dissemination;
    assert_eq!(stats.stored, 1);
    assert_eq!(stats.rumors_received, 1);
    assert_eq!(stats.duplicates_dropped, 1);

    let forwarded = c.inbox.recv().await.unwrap();
    assert_eq!(forwarded.kind(), "push");
    assert!(c.inbox.try_recv().is_err(), "duplicate was re-spread");

    node_a.stop().await.unwrap();
}
