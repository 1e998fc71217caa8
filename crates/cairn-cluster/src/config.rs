//! Cluster configuration.
//!
//! Every field has a default, so a config file only needs to mention what it
//! changes. Durations are plain milliseconds to keep TOML files readable.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::member::MAX_MEMBER_ID_LEN;

/// Default multicast group.
pub const DEFAULT_MULTICAST_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(228, 0, 0, 4), 45564);

/// Which discovery strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipSchemeType {
    Multicast,
    Wka,
}

/// Discovery strategy and its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MembershipSchemeConfig {
    /// Announce on a multicast group and listen for peers.
    Multicast {
        #[serde(default = "default_multicast_group")]
        group: SocketAddrV4,
        #[serde(default = "default_multicast_interface")]
        interface: Ipv4Addr,
        #[serde(default = "default_multicast_ttl")]
        ttl: u32,
        #[serde(default = "default_discovery_interval_ms")]
        discovery_interval_ms: u64,
    },
    /// Contact a fixed list of well-known addresses.
    Wka {
        /// `host:port` entries. The node's own address may be listed.
        #[serde(default)]
        members: Vec<String>,
        #[serde(default = "default_wka_retry_interval_ms")]
        wka_retry_interval_ms: u64,
    },
}

impl Default for MembershipSchemeConfig {
    fn default() -> Self {
        MembershipSchemeConfig::Wka {
            members: Vec::new(),
            wka_retry_interval_ms: default_wka_retry_interval_ms(),
        }
    }
}

impl MembershipSchemeConfig {
    pub fn multicast(group: SocketAddrV4) -> Self {
        MembershipSchemeConfig::Multicast {
            group,
            interface: default_multicast_interface(),
            ttl: default_multicast_ttl(),
            discovery_interval_ms: default_discovery_interval_ms(),
        }
    }

    pub fn wka<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MembershipSchemeConfig::Wka {
            members: members.into_iter().map(Into::into).collect(),
            wka_retry_interval_ms: default_wka_retry_interval_ms(),
        }
    }

    pub fn scheme_type(&self) -> MembershipSchemeType {
        match self {
            MembershipSchemeConfig::Multicast { .. } => MembershipSchemeType::Multicast,
            MembershipSchemeConfig::Wka { .. } => MembershipSchemeType::Wka,
        }
    }
}

fn default_multicast_group() -> SocketAddrV4 {
    DEFAULT_MULTICAST_GROUP
}

fn default_multicast_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_multicast_ttl() -> u32 {
    1
}

fn default_discovery_interval_ms() -> u64 {
    1000
}

fn default_wka_retry_interval_ms() -> u64 {
    5000
}

/// What an application send does when the event queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait up to `max_wait_ms` for room, then fail with `Backpressure`.
    Block { max_wait_ms: u64 },
    /// Fail with `Backpressure` immediately.
    FailFast,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::Block { max_wait_ms: 1000 }
    }
}

/// Delivery and duplicate-suppression settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Sends per target before it is reported as failed.
    pub max_delivery_attempts: u32,
    pub ack_timeout_ms: u64,
    /// Base delay between delivery attempts; doubles per attempt.
    pub retry_backoff_ms: u64,
    /// How long `request` waits for the reply after delivery.
    pub request_timeout_ms: u64,
    /// Recently seen message keys kept for duplicate suppression.
    pub dedup_capacity: usize,
    pub dedup_ttl_ms: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 5,
            ack_timeout_ms: 500,
            retry_backoff_ms: 100,
            request_timeout_ms: 5000,
            dedup_capacity: 4096,
            dedup_ttl_ms: 5 * 60 * 1000,
        }
    }
}

/// Configuration for one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Member id. Generated when empty.
    pub node_id: String,
    /// Cluster name. Frames tagged with another domain are ignored.
    pub domain: String,
    /// Address peers should use to reach this node. Defaults to the
    /// transport's bound address.
    pub advertise_addr: Option<SocketAddr>,
    /// Free-form member properties advertised to peers.
    pub properties: BTreeMap<String, String>,
    /// Starting incarnation. Defaults to wall-clock milliseconds.
    pub initial_incarnation: Option<u64>,
    pub membership_scheme: MembershipSchemeConfig,

    pub heartbeat_interval_ms: u64,
    /// Silence after which a member becomes suspect.
    pub suspect_timeout_ms: u64,
    /// Time spent suspect before removal.
    pub removal_timeout_ms: u64,
    /// How long departed members are remembered.
    pub tombstone_ttl_ms: u64,

    /// Group size (this node included) required for `init()` to succeed.
    pub minimum_members_required: usize,
    pub max_join_attempts: u32,
    /// How long one discovery round waits for answers.
    pub join_timeout_ms: u64,
    pub join_backoff_base_ms: u64,
    pub join_backoff_max_ms: u64,

    pub messaging: MessagingConfig,

    pub event_queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    /// Time allowed for in-flight deliveries during shutdown.
    pub shutdown_grace_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            domain: "cairn".into(),
            advertise_addr: None,
            properties: BTreeMap::new(),
            initial_incarnation: None,
            membership_scheme: MembershipSchemeConfig::default(),
            heartbeat_interval_ms: 1000,
            suspect_timeout_ms: 5000,
            removal_timeout_ms: 10_000,
            tombstone_ttl_ms: 60_000,
            minimum_members_required: 1,
            max_join_attempts: 3,
            join_timeout_ms: 2000,
            join_backoff_base_ms: 200,
            join_backoff_max_ms: 5000,
            messaging: MessagingConfig::default(),
            event_queue_capacity: 1024,
            backpressure: BackpressurePolicy::default(),
            shutdown_grace_ms: 2000,
        }
    }
}

impl ClusterConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn suspect_timeout(&self) -> Duration {
        Duration::from_millis(self.suspect_timeout_ms)
    }

    pub fn removal_timeout(&self) -> Duration {
        Duration::from_millis(self.removal_timeout_ms)
    }

    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_millis(self.tombstone_ttl_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Checks that the values are usable together.
    pub fn validate(&self) -> Result<(), ClusterError> {
        let fail = |msg: String| Err(ClusterError::Configuration(msg));

        if self.node_id.len() > MAX_MEMBER_ID_LEN {
            return fail(format!("node_id is longer than {MAX_MEMBER_ID_LEN} bytes"));
        }
        if self.domain.is_empty() {
            return fail("domain must not be empty".into());
        }
        if self.heartbeat_interval_ms == 0 {
            return fail("heartbeat_interval_ms must be positive".into());
        }
        if self.suspect_timeout_ms <= self.heartbeat_interval_ms {
            return fail(format!(
                "suspect_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.suspect_timeout_ms, self.heartbeat_interval_ms
            ));
        }
        if self.removal_timeout_ms == 0 {
            return fail("removal_timeout_ms must be positive".into());
        }
        // a tombstone must outlive the silence that created it, or a late
        // heartbeat from the removed incarnation would re-admit it
        let detection_ms = self
            .suspect_timeout_ms
            .saturating_add(self.removal_timeout_ms);
        if self.tombstone_ttl_ms < detection_ms {
            return fail(format!(
                "tombstone_ttl_ms ({}) must be at least suspect_timeout_ms + removal_timeout_ms ({})",
                self.tombstone_ttl_ms, detection_ms
            ));
        }
        if self.minimum_members_required == 0 {
            return fail("minimum_members_required must be at least 1".into());
        }
        if self.max_join_attempts == 0 {
            return fail("max_join_attempts must be at least 1".into());
        }
        if self.event_queue_capacity == 0 {
            return fail("event_queue_capacity must be positive".into());
        }
        if self.messaging.max_delivery_attempts == 0 {
            return fail("messaging.max_delivery_attempts must be at least 1".into());
        }
        if self.messaging.ack_timeout_ms == 0 {
            return fail("messaging.ack_timeout_ms must be positive".into());
        }
        match &self.membership_scheme {
            MembershipSchemeConfig::Multicast {
                group,
                discovery_interval_ms,
                ..
            } => {
                if !group.ip().is_multicast() {
                    return fail(format!("{} is not a multicast address", group.ip()));
                }
                if *discovery_interval_ms == 0 {
                    return fail("discovery_interval_ms must be positive".into());
                }
            }
            MembershipSchemeConfig::Wka {
                members,
                wka_retry_interval_ms,
            } => {
                if let Some(bad) = members.iter().find(|m| !m.contains(':')) {
                    return fail(format!("wka member '{bad}' must be host:port"));
                }
                if *wka_retry_interval_ms == 0 {
                    return fail("wka_retry_interval_ms must be positive".into());
                }
            }
        }
        Ok(())
    }
}
