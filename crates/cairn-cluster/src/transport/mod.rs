//! Datagram transports and the framed channel built on top of them.
//!
//! A transport moves opaque frames between socket addresses. The contract
//! is deliberately weak, matching UDP: frames may be lost, duplicated or
//! reordered, but a frame is never split or merged with another. All
//! reliability lives in the messenger.

mod memory;
mod udp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use udp::{MulticastOptions, UdpTransport};

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ClusterError;
use crate::message::{Envelope, WireMessage};

/// Moves frames between members.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address other members use to reach this transport.
    fn local_addr(&self) -> SocketAddr;

    /// Largest frame `send_to` and `broadcast` accept.
    fn max_frame_len(&self) -> usize;

    /// Sends one frame to `target`.
    async fn send_to(&self, target: SocketAddr, frame: Bytes) -> Result<(), ClusterError>;

    /// Sends one frame to the multicast group. Transports without a group
    /// return `Configuration`.
    async fn broadcast(&self, frame: Bytes) -> Result<(), ClusterError>;

    /// Waits for the next frame. Only one task should call this.
    /// `TransportClosed` means no further frames will arrive.
    async fn recv(&self) -> Result<(Bytes, SocketAddr), ClusterError>;
}

pub type DynTransport = Arc<dyn Transport>;

/// Encodes messages for this node's domain and hands them to the transport.
#[derive(Clone)]
pub struct WireChannel {
    transport: DynTransport,
    domain: Arc<str>,
}

impl WireChannel {
    pub fn new(transport: DynTransport, domain: impl Into<Arc<str>>) -> Self {
        Self {
            transport,
            domain: domain.into(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn transport(&self) -> &DynTransport {
        &self.transport
    }

    pub fn max_frame_len(&self) -> usize {
        self.transport.max_frame_len()
    }

    pub fn encode(&self, message: WireMessage) -> Bytes {
        Envelope::new(self.domain.as_ref(), message).encode()
    }

    /// Encodes `message`, failing with `MessageTooLarge` if the frame does
    /// not fit the transport.
    pub fn encode_checked(&self, message: WireMessage) -> Result<Bytes, ClusterError> {
        let frame = self.encode(message);
        let limit = self.max_frame_len();
        if frame.len() > limit {
            return Err(ClusterError::MessageTooLarge {
                size: frame.len(),
                limit,
            });
        }
        Ok(frame)
    }

    pub async fn send(&self, target: SocketAddr, message: WireMessage) -> Result<(), ClusterError> {
        self.transport.send_to(target, self.encode_checked(message)?).await
    }

    pub async fn send_frame(&self, target: SocketAddr, frame: Bytes) -> Result<(), ClusterError> {
        self.transport.send_to(target, frame).await
    }

    pub async fn broadcast(&self, message: WireMessage) -> Result<(), ClusterError> {
        self.transport.broadcast(self.encode_checked(message)?).await
    }

    /// Sends the same message to several targets, returning how many sends
    /// failed. Used for best-effort traffic like heartbeats and leaves.
    pub async fn send_all(
        &self,
        targets: impl IntoIterator<Item = SocketAddr>,
        message: WireMessage,
    ) -> usize {
        let kind = message.kind();
        let frame = match self.encode_checked(message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("not sending {}: {}", kind, e);
                return targets.into_iter().count();
            }
        };
        let mut failed = 0;
        for target in targets {
            if let Err(e) = self.transport.send_to(target, frame.clone()).await {
                tracing::debug!("send to {} failed: {}", target, e);
                failed += 1;
            }
        }
        failed
    }
}

impl std::fmt::Debug for WireChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireChannel")
            .field("local_addr", &self.transport.local_addr())
            .field("domain", &self.domain)
            .finish()
    }
}
