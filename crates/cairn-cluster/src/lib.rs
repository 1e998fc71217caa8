//! cairn-cluster: membership and coordination for a group of servers.
//!
//! Independent processes discover each other, agree on who is in the group,
//! elect a coordinator and exchange reliable messages.
//!
//! # Architecture
//!
//! A [`ClusteringAgent`] owns one member's view of the group:
//!
//! - **Discovery**: a [`MembershipScheme`] (multicast or well-known
//!   addresses) finds the initial group
//! - **Membership**: the [`MemberDirectory`] tracks members, incarnations
//!   and liveness; higher incarnations always win
//! - **Failure detection**: heartbeats and timeouts move silent members to
//!   suspect and then remove them
//! - **Election**: the active member with the smallest id coordinates
//! - **Messaging**: at-least-once delivery with per-sender ordering and
//!   duplicate suppression, plus request/reply
//!
//! All of it runs on one event loop per agent, so listeners see membership
//! changes and messages in a single order.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cairn_cluster::{ClusterConfig, ClusteringAgent, MembershipSchemeConfig, UdpTransport};
//!
//! let config = ClusterConfig {
//!     node_id: "node-a".into(),
//!     membership_scheme: MembershipSchemeConfig::wka(["10.0.0.2:4000"]),
//!     ..Default::default()
//! };
//! let transport = UdpTransport::bind("10.0.0.1:4000".parse()?).await?;
//! let agent = ClusteringAgent::new(config, Arc::new(transport))?;
//! agent.init().await?;
//! agent.send_message("hello").await?;
//! ```

mod activity;
mod agent;
mod backoff;
mod config;
mod correlate;
mod dedup;
mod detector;
mod directory;
mod elector;
mod error;
mod event_loop;
mod listener;
mod member;
mod message;
mod messenger;
mod scheme;
mod transport;

pub use activity::{ActivityError, CoordinatedActivity, CoordinatedActivityRunner};
pub use agent::{AgentState, ClusteringAgent};
pub use backoff::Backoff;
pub use config::{
    BackpressurePolicy, ClusterConfig, MembershipSchemeConfig, MembershipSchemeType,
    MessagingConfig, DEFAULT_MULTICAST_GROUP,
};
pub use dedup::{Acceptance, SeenCache};
pub use detector::{DetectionReport, DetectorConfig, FailureDetector};
pub use directory::{Departure, HeartbeatOutcome, MemberDirectory, MemberRecord, MergeOutcome};
pub use elector::{elect, CoordinatorElector, CoordinatorView};
pub use error::ClusterError;
pub use listener::{GroupEvent, GroupEventListener, ListenerId, ListenerRegistry};
pub use member::{initial_incarnation, Member, MemberId, MemberState, MAX_MEMBER_ID_LEN};
pub use message::{ClusterMessage, Envelope, WireMessage, MAX_PAYLOAD_LEN, WIRE_VERSION};
pub use messenger::{DeliveryReport, Dispatch, GroupMessenger, MessengerConfig};
pub use scheme::{
    build_scheme, DynScheme, JoinSettings, MembershipScheme, MulticastScheme, SchemeContext,
    WkaScheme,
};
pub use transport::{
    DynTransport, MemoryNetwork, MemoryTransport, MulticastOptions, Transport, UdpTransport,
    WireChannel,
};
