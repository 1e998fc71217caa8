//! Coordinator election and coordinator-only activities.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cairn_cluster::{ActivityError, CoordinatedActivity, MemoryNetwork};

use crate::helpers::{node_addr, wait_until, wka_cluster, wka_config, TestNode, SETTLE};

/// Counts executions.
#[derive(Default)]
struct Tally(AtomicUsize);

impl Tally {
    fn runs(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl CoordinatedActivity for Tally {
    fn name(&self) -> &str {
        "tally"
    }

    fn execute(&self) -> Result<(), ActivityError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Starts `ids` in order, registering a fresh activity on each node before
/// it joins.
async fn cluster_with_activities(
    net: &MemoryNetwork,
    ids: &[&str],
) -> (Vec<TestNode>, Vec<Arc<Tally>>) {
    let addrs: Vec<_> = (1..=ids.len() as u8).map(node_addr).collect();
    let mut nodes = Vec::new();
    let mut tallies = Vec::new();
    for (id, addr) in ids.iter().zip(&addrs) {
        let node = TestNode::new(net, wka_config(id, &addrs), *addr);
        let tally = Arc::new(Tally::default());
        node.agent.register_coordinated_activity(tally.clone());
        node.agent.init().await.unwrap();
        nodes.push(node);
        tallies.push(tally);
    }
    wait_until("convergence", SETTLE, || {
        nodes.iter().all(|n| n.member_ids().len() == ids.len())
    })
    .await;
    (nodes, tallies)
}

#[tokio::test(start_paused = true)]
async fn activities_run_only_on_the_coordinator() {
    let net = MemoryNetwork::new();
    let (nodes, tallies) = cluster_with_activities(&net, &["a", "b", "c"]).await;

    assert_eq!(tallies[0].runs(), 1);
    assert_eq!(tallies[1].runs(), 0);
    assert_eq!(tallies[2].runs(), 0);
    assert!(nodes[0].agent.is_coordinator());
}

#[tokio::test(start_paused = true)]
async fn next_member_takes_over_when_coordinator_leaves() {
    let net = MemoryNetwork::new();
    let (nodes, tallies) = cluster_with_activities(&net, &["a", "b", "c"]).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    let epoch = c.agent.coordinator_view().epoch;

    a.agent.shutdown().await.unwrap();

    wait_until("b takes over", SETTLE, || b.agent.is_coordinator()).await;
    wait_until("c follows b", SETTLE, || {
        c.coordinator_id().as_deref() == Some("b")
    })
    .await;
    assert_eq!(tallies[1].runs(), 1);
    assert_eq!(tallies[2].runs(), 0);
    // a ran once when it took over and never again
    assert_eq!(tallies[0].runs(), 1);

    assert_eq!(b.events.leaders(), ["a", "b"]);
    assert_eq!(c.events.leaders(), ["a", "b"]);
    assert!(c.agent.coordinator_view().epoch > epoch);
}

#[tokio::test(start_paused = true)]
async fn coordinator_is_stable_while_membership_is() {
    let net = MemoryNetwork::new();
    let nodes = wka_cluster(&net, &["a", "b", "c"]).await;

    let views: Vec<_> = nodes.iter().map(|n| n.agent.coordinator_view()).collect();
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;

    for (node, before) in nodes.iter().zip(&views) {
        let after = node.agent.coordinator_view();
        assert_eq!(after.coordinator_id, before.coordinator_id);
        assert_eq!(node.events.leaders(), ["a"]);
    }
}

#[tokio::test(start_paused = true)]
async fn late_registration_on_coordinator_runs_at_once() {
    let net = MemoryNetwork::new();
    let nodes = wka_cluster(&net, &["a", "b"]).await;

    let on_a = Arc::new(Tally::default());
    let on_b = Arc::new(Tally::default());
    nodes[0].agent.register_coordinated_activity(on_a.clone());
    nodes[1].agent.register_coordinated_activity(on_b.clone());

    assert_eq!(on_a.runs(), 1);
    assert_eq!(on_b.runs(), 0);
}

#[tokio::test(start_paused = true)]
async fn failing_activity_does_not_block_the_rest() {
    let net = MemoryNetwork::new();
    let node = TestNode::new(&net, wka_config("a", &[]), node_addr(1));

    let broken: Arc<dyn CoordinatedActivity> =
        Arc::new(|| -> Result<(), ActivityError> { Err("disk full".into()) });
    let panicky: Arc<dyn CoordinatedActivity> =
        Arc::new(|| -> Result<(), ActivityError> { panic!("boom") });
    let tally = Arc::new(Tally::default());
    node.agent.register_coordinated_activity(broken);
    node.agent.register_coordinated_activity(panicky);
    node.agent.register_coordinated_activity(tally.clone());

    node.agent.init().await.unwrap();
    assert_eq!(tally.runs(), 1);
    assert!(node.agent.is_coordinator());
}
