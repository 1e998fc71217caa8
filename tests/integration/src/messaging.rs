//! Group and point-to-point messaging between live agents.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cairn_cluster::{
    AgentState, ClusterError, ClusterMessage, Envelope, MemberId, MemoryNetwork, Transport,
    WireMessage,
};
use tokio::time::{sleep, timeout};

use crate::helpers::{node_addr, wait_until, wka_cluster, wka_config, Shouter, TestNode, SETTLE};

fn msg(sender: &str, payload: &'static str) -> (String, Bytes) {
    (sender.to_string(), Bytes::from_static(payload.as_bytes()))
}

fn data_frame(domain: &str, sequence: u64, payload: &'static str) -> Bytes {
    Envelope::new(
        domain,
        WireMessage::Data(ClusterMessage {
            sender_id: MemberId::new("raw"),
            sender_incarnation: 1,
            sequence_number: sequence,
            payload: Bytes::from_static(payload.as_bytes()),
            target_ids: Vec::new(),
            expects_reply: false,
        }),
    )
    .encode()
}

#[tokio::test(start_paused = true)]
async fn broadcast_reaches_each_member_once() {
    let net = MemoryNetwork::new();
    let nodes = wka_cluster(&net, &["a", "b", "c"]).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    let report = a.agent.send_message("hello").await.unwrap();
    let mut delivered: Vec<String> = report.delivered.iter().map(|id| id.to_string()).collect();
    delivered.sort();
    assert_eq!(delivered, ["b", "c"]);
    assert!(report.is_complete());

    sleep(Duration::from_millis(500)).await;
    assert_eq!(b.events.messages(), [msg("a", "hello")]);
    assert_eq!(c.events.messages(), [msg("a", "hello")]);
    assert!(a.events.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn targeted_send_skips_other_members() {
    let net = MemoryNetwork::new();
    let nodes = wka_cluster(&net, &["a", "b", "c"]).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    let report = a
        .agent
        .send_message_to("psst", &[c.id()])
        .await
        .unwrap();
    assert_eq!(report.delivered, [c.id()]);

    sleep(Duration::from_millis(500)).await;
    assert_eq!(c.events.messages(), [msg("a", "psst")]);
    assert!(b.events.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unknown_target_is_rejected_before_sending() {
    let net = MemoryNetwork::new();
    let nodes = wka_cluster(&net, &["a", "b"]).await;

    let err = nodes[0]
        .agent
        .send_message_to("x", &[nodes[1].id(), MemberId::new("ghost")])
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::InvalidTarget(id) if id.as_str() == "ghost"));

    sleep(Duration::from_millis(500)).await;
    assert!(nodes[1].events.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn sender_order_is_preserved() {
    let net = MemoryNetwork::new();
    let nodes = wka_cluster(&net, &["a", "b"]).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    // three sends in flight at once, then two more one at a time
    let (r1, r2, r3) = tokio::join!(
        a.agent.send_message("1"),
        a.agent.send_message("2"),
        a.agent.send_message("3"),
    );
    let sequences = [r1.unwrap(), r2.unwrap(), r3.unwrap()].map(|r| r.sequence_number);
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    a.agent.send_message("4").await.unwrap();
    a.agent.send_message("5").await.unwrap();

    wait_until("five messages", SETTLE, || b.events.messages().len() == 5).await;
    let payloads: Vec<Bytes> = b.events.messages().into_iter().map(|(_, p)| p).collect();
    let expected: Vec<Bytes> = ["1", "2", "3", "4", "5"]
        .iter()
        .map(|s| Bytes::from_static(s.as_bytes()))
        .collect();
    assert_eq!(payloads, expected);
}

#[tokio::test(start_paused = true)]
async fn request_returns_the_listener_reply() {
    let net = MemoryNetwork::new();
    let nodes = wka_cluster(&net, &["a", "b", "c"]).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    b.agent.add_membership_listener(Arc::new(Shouter));

    let reply = a.agent.request(&b.id(), "ping").await.unwrap();
    assert_eq!(&reply[..], b"PING");

    // nobody on c answers: the reply is empty
    let reply = a.agent.request(&c.id(), "ping").await.unwrap();
    assert!(reply.is_empty());

    // requests are not group messages
    assert!(b.events.messages().is_empty());
    assert!(c.events.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unreachable_target_is_reported() {
    let net = MemoryNetwork::new();
    let nodes = wka_cluster(&net, &["a", "b", "c"]).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    net.isolate(c.addr);
    let report = a.agent.send_message("anyone?").await.unwrap();
    assert_eq!(report.delivered, [b.id()]);
    assert_eq!(report.failed, [c.id()]);
    assert!(!report.is_complete());

    wait_until("delivery failure callback", SETTLE, || {
        a.events.failures() == [("c".to_string(), report.sequence_number)]
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn send_fails_when_no_target_is_reachable() {
    let net = MemoryNetwork::new();
    let nodes = wka_cluster(&net, &["a", "b"]).await;

    net.isolate(nodes[1].addr);
    let err = nodes[0].agent.send_message("lost").await.unwrap_err();
    match err {
        ClusterError::MessageFailed { failed, .. } => assert_eq!(failed, [nodes[1].id()]),
        other => panic!("expected MessageFailed, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn request_to_isolated_member_fails() {
    let net = MemoryNetwork::new();
    let nodes = wka_cluster(&net, &["a", "b"]).await;

    net.isolate(nodes[1].addr);
    let err = nodes[0]
        .agent
        .request(&nodes[1].id(), "ping")
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::MessageFailed { .. }));
}

#[tokio::test(start_paused = true)]
async fn redelivered_frames_reach_listeners_once() {
    let net = MemoryNetwork::new();
    let node = TestNode::new(&net, wka_config("a", &[]), node_addr(1));
    node.agent.init().await.unwrap();
    let raw = net.bind(node_addr(9)).unwrap();

    for _ in 0..3 {
        raw
            .send_to(node.addr, data_frame("cairn", 1, "first"))
            .await
            .unwrap();
    }
    raw
        .send_to(node.addr, data_frame("cairn", 2, "second"))
        .await
        .unwrap();
    // a late copy of an older message
    raw
        .send_to(node.addr, data_frame("cairn", 1, "first"))
        .await
        .unwrap();

    // every copy is acknowledged, duplicates included
    for _ in 0..5 {
        let (frame, from) = timeout(SETTLE, raw.recv()).await.unwrap().unwrap();
        assert_eq!(from, node.addr);
        match Envelope::decode(&frame).unwrap().message {
            WireMessage::DataAck { acker, .. } => assert_eq!(acker.as_str(), "a"),
            other => panic!("expected an ack, got {other:?}"),
        }
    }

    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        node.events.messages(),
        [msg("raw", "first"), msg("raw", "second")]
    );
}

#[tokio::test(start_paused = true)]
async fn frames_from_another_domain_are_ignored() {
    let net = MemoryNetwork::new();
    let node = TestNode::new(&net, wka_config("a", &[]), node_addr(1));
    node.agent.init().await.unwrap();
    let raw = net.bind(node_addr(9)).unwrap();

    raw
        .send_to(node.addr, data_frame("elsewhere", 1, "hi"))
        .await
        .unwrap();

    assert!(timeout(Duration::from_millis(500), raw.recv())
        .await
        .is_err());
    assert!(node.events.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn inbound_overflow_is_dropped_and_counted() {
    let net = MemoryNetwork::new();
    let mut config = wka_config("a", &[]);
    config.event_queue_capacity = 4;
    let node = TestNode::new(&net, config, node_addr(1));
    node.agent.init().await.unwrap();
    let raw = net.bind(node_addr(9)).unwrap();

    // everything lands before the receiver runs
    for sequence in 1..=50 {
        raw
            .send_to(node.addr, data_frame("cairn", sequence, "flood"))
            .await
            .unwrap();
    }
    sleep(Duration::from_millis(500)).await;

    let dropped = node.agent.dropped_events();
    assert!(dropped > 0);
    assert_eq!(node.events.messages().len() as u64 + dropped, 50);
    assert_eq!(node.agent.state(), AgentState::Active);

    // the agent keeps working afterwards
    raw
        .send_to(node.addr, data_frame("cairn", 51, "after"))
        .await
        .unwrap();
    wait_until("late message", SETTLE, || {
        node.events.messages().last() == Some(&msg("raw", "after"))
    })
    .await;
}
