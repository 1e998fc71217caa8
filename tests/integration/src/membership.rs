//! Discovery, failure detection and rejoining over WKA.

use std::time::Duration;

use cairn_cluster::{
    AgentState, ClusterError, Envelope, Member, MemberId, MemberState, MemoryNetwork, Transport,
    WireMessage,
};
use tokio::time::sleep;

use crate::helpers::{node_addr, wait_until, wka_cluster, wka_config, TestNode, SETTLE};

fn count(ids: &[String], id: &str) -> usize {
    ids.iter().filter(|x| x.as_str() == id).count()
}

fn state_of(node: &TestNode, id: &str) -> Option<MemberState> {
    node.agent
        .directory_snapshot()
        .into_iter()
        .find(|r| r.member.id().as_str() == id)
        .map(|r| r.state)
}

#[tokio::test(start_paused = true)]
async fn well_known_members_converge() {
    let net = MemoryNetwork::new();
    let nodes = wka_cluster(&net, &["a", "b", "c"]).await;

    for node in &nodes {
        assert_eq!(node.member_ids(), ["a", "b", "c"]);
        assert_eq!(node.coordinator_id().as_deref(), Some("a"));
    }
    assert!(nodes[0].agent.is_coordinator());
    assert!(!nodes[1].agent.is_coordinator());

    let mut arrivals = nodes[0].events.arrivals();
    arrivals.sort();
    assert_eq!(arrivals, ["b", "c"]);
    let mut arrivals = nodes[2].events.arrivals();
    arrivals.sort();
    assert_eq!(arrivals, ["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn isolated_member_is_suspected_then_removed_once() {
    let net = MemoryNetwork::new();
    let nodes = wka_cluster(&net, &["a", "b", "c"]).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    net.isolate(b.addr);

    wait_until("b suspected on a", SETTLE, || {
        state_of(a, "b") == Some(MemberState::Suspect)
    })
    .await;
    // suspects drop out of the group but stay in the directory
    assert_eq!(a.member_ids(), ["a", "c"]);

    wait_until("b removed on a and c", SETTLE, || {
        a.events.departures().contains(&"b".to_string())
            && c.events.departures().contains(&"b".to_string())
    })
    .await;
    assert_eq!(state_of(a, "b"), None);

    // give duplicate notifications time to surface
    sleep(Duration::from_secs(2)).await;
    assert_eq!(count(&a.events.departures(), "b"), 1);
    assert_eq!(count(&c.events.departures(), "b"), 1);
    assert_eq!(a.member_ids(), ["a", "c"]);
    assert_eq!(c.member_ids(), ["a", "c"]);
    assert_eq!(a.coordinator_id().as_deref(), Some("a"));
    assert_eq!(c.coordinator_id().as_deref(), Some("a"));
    // a and c never saw a coordinator change
    assert_eq!(a.events.leaders(), ["a"]);
    assert_eq!(c.events.leaders(), ["a"]);
}

#[tokio::test(start_paused = true)]
async fn healed_member_rejoins_with_higher_incarnation() {
    let net = MemoryNetwork::new();
    let nodes = wka_cluster(&net, &["a", "b", "c"]).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    let before = b.agent.local_member().incarnation();

    net.isolate(b.addr);
    wait_until("partition detected", SETTLE, || {
        count(&a.events.departures(), "b") == 1 && b.member_ids() == ["b"]
    })
    .await;
    // alone, b coordinates its own side
    assert_eq!(b.coordinator_id().as_deref(), Some("b"));

    net.heal(b.addr);
    wait_until("group healed", Duration::from_secs(20), || {
        nodes.iter().all(|n| n.member_ids() == ["a", "b", "c"])
    })
    .await;

    assert!(b.agent.local_member().incarnation() > before);
    assert_eq!(count(&a.events.arrivals(), "b"), 2);
    wait_until("b follows a again", SETTLE, || {
        b.coordinator_id().as_deref() == Some("a")
    })
    .await;
    assert_eq!(c.coordinator_id().as_deref(), Some("a"));
}

#[tokio::test(start_paused = true)]
async fn graceful_leave_is_seen_before_any_timeout() {
    let net = MemoryNetwork::new();
    let nodes = wka_cluster(&net, &["a", "b", "c"]).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    c.agent.shutdown().await.unwrap();
    assert_eq!(c.agent.state(), AgentState::Terminated);

    // well inside the 500ms suspect timeout
    wait_until("leave notice", Duration::from_millis(200), || {
        a.events.departures() == ["c"] && b.events.departures() == ["c"]
    })
    .await;
    assert_eq!(a.member_ids(), ["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn restarted_member_outranks_its_old_incarnation() {
    let net = MemoryNetwork::new();
    let seeds = [node_addr(1), node_addr(2)];

    let a = TestNode::new(&net, wka_config("a", &seeds), seeds[0]);
    a.agent.init().await.unwrap();

    let mut config = wka_config("b", &seeds);
    config.initial_incarnation = Some(1);
    let b = TestNode::new(&net, config, seeds[1]);
    b.agent.init().await.unwrap();
    wait_until("b joined", SETTLE, || a.member_ids() == ["a", "b"]).await;

    b.agent.shutdown().await.unwrap();
    drop(b);
    wait_until("b left", SETTLE, || a.events.departures() == ["b"]).await;

    // same id, new process on a new address
    let mut config = wka_config("b", &seeds);
    config.initial_incarnation = Some(2);
    let b = TestNode::new(&net, config, node_addr(3));
    b.agent.init().await.unwrap();

    wait_until("b rejoined", SETTLE, || a.member_ids() == ["a", "b"]).await;
    let record = a
        .agent
        .directory_snapshot()
        .into_iter()
        .find(|r| r.member.id() == &MemberId::new("b"))
        .unwrap();
    assert_eq!(record.member.incarnation(), 2);
    assert_eq!(record.member.addr(), node_addr(3));
    assert_eq!(a.events.arrivals(), ["b", "b"]);
}

#[tokio::test(start_paused = true)]
async fn sole_member_bootstraps_when_peers_are_silent() {
    let net = MemoryNetwork::new();
    let node = TestNode::new(&net, wka_config("a", &[node_addr(1), node_addr(2)]), node_addr(1));

    node.agent.init().await.unwrap();
    assert_eq!(node.agent.state(), AgentState::Active);
    assert_eq!(node.member_ids(), ["a"]);
    assert!(node.agent.is_coordinator());
    assert_eq!(node.events.leaders(), ["a"]);
}

#[tokio::test(start_paused = true)]
async fn unmet_minimum_fails_initialization() {
    let net = MemoryNetwork::new();
    let mut config = wka_config("a", &[node_addr(2)]);
    config.minimum_members_required = 2;
    let node = TestNode::new(&net, config, node_addr(1));

    let err = node.agent.init().await.unwrap_err();
    assert!(matches!(err, ClusterError::Initialization(_)));
    assert!(matches!(
        err.root_cause(),
        ClusterError::MembershipInitialization(_)
    ));
    assert_eq!(node.agent.state(), AgentState::Terminated);
    assert!(matches!(
        node.agent.send_message("late").await,
        Err(ClusterError::IllegalState {
            state: AgentState::Terminated,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn reachable_peer_satisfies_minimum() {
    let net = MemoryNetwork::new();
    let seeds = [node_addr(1), node_addr(2)];
    let a = TestNode::new(&net, wka_config("a", &seeds), seeds[0]);
    a.agent.init().await.unwrap();

    let mut config = wka_config("b", &seeds);
    config.minimum_members_required = 2;
    let b = TestNode::new(&net, config, seeds[1]);
    b.agent.init().await.unwrap();
    assert_eq!(b.member_ids(), ["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn members_known_only_second_hand_do_not_satisfy_minimum() {
    let net = MemoryNetwork::new();
    let seeds = [node_addr(1), node_addr(2)];
    let a = TestNode::new(&net, wka_config("a", &seeds), seeds[0]);
    a.agent.init().await.unwrap();

    // "g" introduces itself to a once and never answers again
    let ghost = net.bind(node_addr(9)).unwrap();
    let announce = Envelope::new(
        "cairn",
        WireMessage::Announce {
            member: Member::new("g", node_addr(9)).with_incarnation(1),
            reply_requested: false,
        },
    );
    ghost.send_to(a.addr, announce.encode()).await.unwrap();
    wait_until("a saw g", SETTLE, || a.member_ids() == ["a", "g"]).await;

    let mut config = wka_config("b", &seeds);
    config.minimum_members_required = 3;
    let b = TestNode::new(&net, config, seeds[1]);

    let err = b.agent.init().await.unwrap_err();
    assert!(matches!(
        err.root_cause(),
        ClusterError::MembershipInitialization(_)
    ));
    assert_eq!(b.agent.state(), AgentState::Terminated);
    // b heard of g through a but g never confirmed
    assert_eq!(state_of(&b, "g"), Some(MemberState::Joining));
}

#[tokio::test(start_paused = true)]
async fn members_learned_from_a_responder_confirm_before_the_check() {
    let net = MemoryNetwork::new();
    let seeds = [node_addr(1), node_addr(2)];
    let a = TestNode::new(&net, wka_config("a", &seeds), seeds[0]);
    a.agent.init().await.unwrap();
    // c is not a well-known member; b only learns of it through a
    let c = TestNode::new(&net, wka_config("c", &[node_addr(1)]), node_addr(3));
    c.agent.init().await.unwrap();
    wait_until("a saw c", SETTLE, || a.member_ids() == ["a", "c"]).await;

    let mut config = wka_config("b", &seeds);
    config.minimum_members_required = 3;
    let b = TestNode::new(&net, config, seeds[1]);

    b.agent.init().await.unwrap();
    assert_eq!(b.member_ids(), ["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn join_response_is_cut_to_one_frame() {
    let net = MemoryNetwork::new();
    let nodes = wka_cluster(&net, &["a", "c"]).await;
    let a = &nodes[0];

    // room for exactly one member in a join response
    let one_member = Envelope::new(
        "cairn",
        WireMessage::JoinResponse {
            nonce: 0,
            responder: MemberId::new("a"),
            members: vec![a.agent.local_member()],
        },
    )
    .encode()
    .len();
    net.set_frame_limit(one_member + 5);

    let b = TestNode::new(&net, wka_config("b", &[a.addr]), node_addr(3));
    b.agent.init().await.unwrap();
    assert_eq!(b.member_ids(), ["a", "b"]);
    assert_eq!(state_of(&b, "c"), None);
}

#[tokio::test(start_paused = true)]
async fn unusable_transport_fails_discovery() {
    let net = MemoryNetwork::new();
    let node = TestNode::new(&net, wka_config("a", &[node_addr(2)]), node_addr(1));
    net.set_faulty(node.addr, true);

    let err = node.agent.init().await.unwrap_err();
    assert!(matches!(
        err.root_cause(),
        ClusterError::MembershipFailed { attempts: 2, .. }
    ));
    assert!(err.is_fatal());
    assert_eq!(node.agent.state(), AgentState::Terminated);
}
