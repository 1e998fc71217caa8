//! Discovery over a multicast group.

use std::time::Duration;

use cairn_cluster::{ClusterError, MemoryNetwork};

use crate::helpers::{multicast_config, node_addr, wait_until, TestNode, SETTLE};

async fn multicast_cluster(net: &MemoryNetwork, ids: &[&str]) -> Vec<TestNode> {
    let mut nodes = Vec::new();
    for (n, id) in ids.iter().enumerate() {
        let node = TestNode::multicast(net, multicast_config(id), node_addr(n as u8 + 1));
        node.agent.init().await.unwrap();
        nodes.push(node);
    }
    wait_until("convergence", SETTLE, || {
        nodes.iter().all(|n| n.member_ids().len() == ids.len())
    })
    .await;
    nodes
}

#[tokio::test(start_paused = true)]
async fn members_discover_each_other() {
    let net = MemoryNetwork::new();
    let nodes = multicast_cluster(&net, &["a", "b", "c"]).await;

    for node in &nodes {
        assert_eq!(node.member_ids(), ["a", "b", "c"]);
        assert_eq!(node.coordinator_id().as_deref(), Some("a"));
    }
}

#[tokio::test(start_paused = true)]
async fn periodic_announcements_heal_a_partition() {
    let net = MemoryNetwork::new();
    let nodes = multicast_cluster(&net, &["a", "b", "c"]).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    net.isolate(b.addr);
    wait_until("b removed", SETTLE, || {
        a.events.departures() == ["b"] && b.member_ids() == ["b"]
    })
    .await;

    net.heal(b.addr);
    wait_until("group healed", Duration::from_secs(20), || {
        nodes.iter().all(|n| n.member_ids() == ["a", "b", "c"])
    })
    .await;
    assert_eq!(b.coordinator_id().as_deref(), Some("a"));
}

#[tokio::test(start_paused = true)]
async fn leave_is_broadcast() {
    let net = MemoryNetwork::new();
    let nodes = multicast_cluster(&net, &["a", "b", "c"]).await;

    nodes[2].agent.shutdown().await.unwrap();
    wait_until("leave notice", Duration::from_millis(200), || {
        nodes[0].events.departures() == ["c"] && nodes[1].events.departures() == ["c"]
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn broken_transport_fails_discovery() {
    let net = MemoryNetwork::new();
    // something else on the group, so broadcasts actually go out
    let _listener = net.bind_multicast(node_addr(9)).unwrap();
    let node = TestNode::multicast(&net, multicast_config("a"), node_addr(1));
    net.set_faulty(node.addr, true);

    let err = node.agent.init().await.unwrap_err();
    assert!(matches!(
        err.root_cause(),
        ClusterError::MembershipFailed { attempts: 2, .. }
    ));
}
