//! Member identity and lifecycle states.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest member id the wire format accepts, in bytes.
pub const MAX_MEMBER_ID_LEN: usize = 255;

/// Unique identifier for a cluster member.
///
/// Ids compare as plain byte strings. The coordinator is the active member
/// with the smallest id, so operators who care about which node leads can
/// pick ids accordingly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random id for nodes that were not given one.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for MemberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A participant in the cluster.
///
/// Everything except the incarnation is fixed at construction. The
/// incarnation only grows: a member bumps it to refute a suspicion or to
/// come back after being declared departed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    id: MemberId,
    addr: SocketAddr,
    incarnation: u64,
    properties: BTreeMap<String, String>,
}

impl Member {
    pub fn new(id: impl Into<MemberId>, addr: SocketAddr) -> Self {
        Self {
            id: id.into(),
            addr,
            incarnation: 0,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_incarnation(mut self, incarnation: u64) -> Self {
        self.incarnation = incarnation;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn id(&self) -> &MemberId {
        &self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub(crate) fn set_incarnation(&mut self, incarnation: u64) {
        self.incarnation = incarnation;
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.id, self.addr, self.incarnation)
    }
}

/// Liveness state of a member as seen by the local directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberState {
    /// Discovered but no heartbeat confirmed yet.
    Joining,
    /// Heartbeats arriving within the suspect timeout.
    Active,
    /// Missed heartbeats; removed if this lasts past the removal timeout.
    Suspect,
    /// Departed. Kept as a tombstone so stale incarnations are rejected.
    Left,
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberState::Joining => "joining",
            MemberState::Active => "active",
            MemberState::Suspect => "suspect",
            MemberState::Left => "left",
        };
        f.write_str(s)
    }
}

/// Default starting incarnation: wall-clock milliseconds, so a restarted
/// process outranks whatever its previous run announced.
pub fn initial_incarnation() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(1)
}
