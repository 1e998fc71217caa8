use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use super::Transport;
use crate::error::ClusterError;
use crate::message::MAX_PAYLOAD_LEN;

/// Frames buffered per endpoint before further frames are dropped.
const ENDPOINT_BUFFER: usize = 1024;

/// Default frame limit: a maximal payload plus room for its header.
const DEFAULT_FRAME_LIMIT: usize = MAX_PAYLOAD_LEN + 64 * 1024;

type Datagram = (Bytes, SocketAddr);

#[derive(Default)]
struct Fabric {
    endpoints: HashMap<SocketAddr, mpsc::Sender<Datagram>>,
    multicast: HashSet<SocketAddr>,
    isolated: HashSet<SocketAddr>,
    faulty: HashSet<SocketAddr>,
    frame_limit: Option<usize>,
}

/// An in-process datagram network.
///
/// Endpoints are addressed by `SocketAddr` without touching real sockets.
/// Frames to unknown addresses vanish, like UDP. Tests can cut a node off
/// with [`isolate`](Self::isolate) or make its sends fail with
/// [`set_faulty`](Self::set_faulty).
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    fabric: Arc<Mutex<Fabric>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn fabric(&self) -> std::sync::MutexGuard<'_, Fabric> {
        self.fabric.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attaches a unicast-only endpoint at `addr`.
    pub fn bind(&self, addr: SocketAddr) -> Result<MemoryTransport, ClusterError> {
        self.attach(addr, false)
    }

    /// Attaches an endpoint that also receives group broadcasts.
    pub fn bind_multicast(&self, addr: SocketAddr) -> Result<MemoryTransport, ClusterError> {
        self.attach(addr, true)
    }

    fn attach(&self, addr: SocketAddr, multicast: bool) -> Result<MemoryTransport, ClusterError> {
        let mut fabric = self.fabric();
        if fabric.endpoints.contains_key(&addr) {
            return Err(ClusterError::Network(format!("address {addr} already in use")));
        }
        let (tx, rx) = mpsc::channel(ENDPOINT_BUFFER);
        fabric.endpoints.insert(addr, tx);
        if multicast {
            fabric.multicast.insert(addr);
        }
        Ok(MemoryTransport {
            addr,
            network: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Drops every frame to or from `addr` until [`heal`](Self::heal).
    pub fn isolate(&self, addr: SocketAddr) {
        self.fabric().isolated.insert(addr);
    }

    pub fn heal(&self, addr: SocketAddr) {
        self.fabric().isolated.remove(&addr);
    }

    /// Caps the frame size every endpoint accepts, like a datagram limit.
    pub fn set_frame_limit(&self, limit: usize) {
        self.fabric().frame_limit = Some(limit);
    }

    fn frame_limit(&self) -> usize {
        self.fabric().frame_limit.unwrap_or(DEFAULT_FRAME_LIMIT)
    }

    /// Makes every send from `addr` fail with a network error.
    pub fn set_faulty(&self, addr: SocketAddr, faulty: bool) {
        let mut fabric = self.fabric();
        if faulty {
            fabric.faulty.insert(addr);
        } else {
            fabric.faulty.remove(&addr);
        }
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, frame: Bytes) -> Result<(), ClusterError> {
        let fabric = self.fabric();
        if fabric.faulty.contains(&from) {
            return Err(ClusterError::Network(format!("send from {from} failed")));
        }
        let limit = fabric.frame_limit.unwrap_or(DEFAULT_FRAME_LIMIT);
        if frame.len() > limit {
            return Err(ClusterError::MessageTooLarge {
                size: frame.len(),
                limit,
            });
        }
        if fabric.isolated.contains(&from) || fabric.isolated.contains(&to) {
            trace!("memory network: dropped frame {} -> {}", from, to);
            return Ok(());
        }
        if let Some(tx) = fabric.endpoints.get(&to) {
            // a full endpoint behaves like a full socket buffer
            let _ = tx.try_send((frame, from));
        }
        Ok(())
    }

    fn deliver_group(&self, from: SocketAddr, frame: Bytes) -> Result<(), ClusterError> {
        let targets: Vec<SocketAddr> = {
            let fabric = self.fabric();
            if !fabric.multicast.contains(&from) {
                return Err(ClusterError::Configuration(
                    "endpoint is not bound for multicast".into(),
                ));
            }
            fabric
                .multicast
                .iter()
                .copied()
                .filter(|addr| *addr != from)
                .collect()
        };
        for to in targets {
            self.deliver(from, to, frame.clone())?;
        }
        Ok(())
    }

    fn detach(&self, addr: SocketAddr) {
        let mut fabric = self.fabric();
        fabric.endpoints.remove(&addr);
        fabric.multicast.remove(&addr);
    }
}

/// An endpoint on a [`MemoryNetwork`]. Detaches when dropped.
pub struct MemoryTransport {
    addr: SocketAddr,
    network: MemoryNetwork,
    rx: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn max_frame_len(&self) -> usize {
        self.network.frame_limit()
    }

    async fn send_to(&self, target: SocketAddr, frame: Bytes) -> Result<(), ClusterError> {
        self.network.deliver(self.addr, target, frame)
    }

    async fn broadcast(&self, frame: Bytes) -> Result<(), ClusterError> {
        self.network.deliver_group(self.addr, frame)
    }

    async fn recv(&self) -> Result<(Bytes, SocketAddr), ClusterError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(ClusterError::TransportClosed)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.detach(self.addr);
    }
}
