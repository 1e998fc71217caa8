//! Test helpers for building clusters on an in-process network.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use cairn_cluster::{
    ClusterConfig, ClusterMessage, ClusteringAgent, DynTransport, GroupEventListener, MemberId,
    MembershipSchemeConfig, MemoryNetwork, MessagingConfig, DEFAULT_MULTICAST_GROUP,
};
use tokio::time::{sleep, Instant};

/// Default wait for cluster-wide conditions. Tests run on a paused clock,
/// so this costs no wall time.
pub const SETTLE: Duration = Duration::from_secs(5);

/// Address of the `n`th test node.
pub fn node_addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], 7000))
}

/// Fast timings so failure detection finishes within a second of test
/// time.
pub fn fast_config(id: &str) -> ClusterConfig {
    ClusterConfig {
        node_id: id.into(),
        heartbeat_interval_ms: 100,
        suspect_timeout_ms: 500,
        removal_timeout_ms: 500,
        tombstone_ttl_ms: 60_000,
        max_join_attempts: 2,
        join_timeout_ms: 300,
        join_backoff_base_ms: 50,
        join_backoff_max_ms: 200,
        messaging: MessagingConfig {
            max_delivery_attempts: 3,
            ack_timeout_ms: 100,
            retry_backoff_ms: 20,
            request_timeout_ms: 1000,
            ..Default::default()
        },
        shutdown_grace_ms: 500,
        ..Default::default()
    }
}

pub fn wka_config(id: &str, wka: &[SocketAddr]) -> ClusterConfig {
    ClusterConfig {
        membership_scheme: MembershipSchemeConfig::Wka {
            members: wka.iter().map(|a| a.to_string()).collect(),
            wka_retry_interval_ms: 1000,
        },
        ..fast_config(id)
    }
}

pub fn multicast_config(id: &str) -> ClusterConfig {
    ClusterConfig {
        membership_scheme: MembershipSchemeConfig::Multicast {
            group: DEFAULT_MULTICAST_GROUP,
            interface: Ipv4Addr::UNSPECIFIED,
            ttl: 1,
            discovery_interval_ms: 200,
        },
        ..fast_config(id)
    }
}

/// One agent plus a listener recording everything it saw.
pub struct TestNode {
    pub agent: ClusteringAgent,
    pub events: Arc<RecordingListener>,
    pub addr: SocketAddr,
}

impl TestNode {
    /// Creates an agent on `net` at `addr`. Does not call `init()`.
    pub fn new(net: &MemoryNetwork, config: ClusterConfig, addr: SocketAddr) -> Self {
        let transport = net.bind(addr).expect("address is free");
        Self::with_transport(config, Arc::new(transport), addr)
    }

    /// Like [`new`](Self::new) but the endpoint also receives broadcasts.
    pub fn multicast(net: &MemoryNetwork, config: ClusterConfig, addr: SocketAddr) -> Self {
        let transport = net.bind_multicast(addr).expect("address is free");
        Self::with_transport(config, Arc::new(transport), addr)
    }

    fn with_transport(
        config: ClusterConfig,
        transport: DynTransport,
        addr: SocketAddr,
    ) -> Self {
        let agent = ClusteringAgent::new(config, transport).expect("valid config");
        let events = Arc::new(RecordingListener::default());
        agent.add_membership_listener(events.clone());
        Self {
            agent,
            events,
            addr,
        }
    }

    pub fn id(&self) -> MemberId {
        self.agent.local_member().id().clone()
    }

    /// Ids of the active members this node sees, in order.
    pub fn member_ids(&self) -> Vec<String> {
        self.agent
            .members()
            .iter()
            .map(|m| m.id().to_string())
            .collect()
    }

    pub fn coordinator_id(&self) -> Option<String> {
        self.agent.coordinator().map(|m| m.id().to_string())
    }
}

/// Starts one WKA node per id, in order, each listing every node's
/// address. Node `n` (from 1) listens on `node_addr(n)`.
pub async fn wka_cluster(net: &MemoryNetwork, ids: &[&str]) -> Vec<TestNode> {
    let addrs: Vec<SocketAddr> = (1..=ids.len() as u8).map(node_addr).collect();
    let mut nodes = Vec::with_capacity(ids.len());
    for (id, addr) in ids.iter().zip(&addrs) {
        let node = TestNode::new(net, wka_config(id, &addrs), *addr);
        node.agent.init().await.expect("node joins");
        nodes.push(node);
    }
    let expected: Vec<String> = {
        let mut ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        ids.sort();
        ids
    };
    wait_until("cluster convergence", SETTLE, || {
        nodes.iter().all(|n| n.member_ids() == expected)
    })
    .await;
    nodes
}

/// Polls `check` until it holds, panicking after `limit`.
pub async fn wait_until(what: &str, limit: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !check() {
        if Instant::now() >= deadline {
            panic!("timed out after {limit:?} waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Something a listener saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Leader(String),
    Arrived(String),
    Departed(String),
    Message { sender: String, payload: Bytes },
    Failed { target: String, sequence: u64 },
}

/// Records every group event in order.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingListener {
    fn push(&self, event: Recorded) {
        self.events.lock().unwrap().push(event);
    }

    pub fn leaders(&self) -> Vec<String> {
        self.filter(|e| match e {
            Recorded::Leader(id) => Some(id.clone()),
            _ => None,
        })
    }

    pub fn arrivals(&self) -> Vec<String> {
        self.filter(|e| match e {
            Recorded::Arrived(id) => Some(id.clone()),
            _ => None,
        })
    }

    pub fn departures(&self) -> Vec<String> {
        self.filter(|e| match e {
            Recorded::Departed(id) => Some(id.clone()),
            _ => None,
        })
    }

    /// `(sender, payload)` of every group message, in delivery order.
    pub fn messages(&self) -> Vec<(String, Bytes)> {
        self.filter(|e| match e {
            Recorded::Message { sender, payload } => Some((sender.clone(), payload.clone())),
            _ => None,
        })
    }

    pub fn failures(&self) -> Vec<(String, u64)> {
        self.filter(|e| match e {
            Recorded::Failed { target, sequence } => Some((target.clone(), *sequence)),
            _ => None,
        })
    }

    fn filter<T>(&self, pick: impl Fn(&Recorded) -> Option<T>) -> Vec<T> {
        self.events.lock().unwrap().iter().filter_map(pick).collect()
    }
}

impl GroupEventListener for RecordingListener {
    fn on_leader_change(&self, new_leader: &MemberId) {
        self.push(Recorded::Leader(new_leader.to_string()));
    }

    fn on_member_arrival(&self, member: &MemberId) {
        self.push(Recorded::Arrived(member.to_string()));
    }

    fn on_member_departure(&self, member: &MemberId) {
        self.push(Recorded::Departed(member.to_string()));
    }

    fn on_group_message(&self, sender: &MemberId, payload: &Bytes) {
        self.push(Recorded::Message {
            sender: sender.to_string(),
            payload: payload.clone(),
        });
    }

    fn on_delivery_failure(&self, target: &MemberId, message: &ClusterMessage) {
        self.push(Recorded::Failed {
            target: target.to_string(),
            sequence: message.sequence_number,
        });
    }
}

/// Answers peer messages by upper-casing them.
pub struct Shouter;

impl GroupEventListener for Shouter {
    fn on_peer_message(&self, _sender: &MemberId, payload: &Bytes) -> Option<Bytes> {
        Some(Bytes::from(payload.to_ascii_uppercase()))
    }
}
