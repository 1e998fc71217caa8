use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::info;

use super::Transport;
use crate::error::ClusterError;

/// Largest payload a UDP datagram can carry.
const MAX_DATAGRAM: usize = 65_507;

/// Multicast group membership for a UDP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastOptions {
    pub group: SocketAddrV4,
    /// Local interface to join on; `0.0.0.0` lets the OS choose.
    pub interface: Ipv4Addr,
    pub ttl: u32,
}

/// One frame per UDP datagram.
///
/// Unicast traffic uses the bound socket. With multicast enabled a second
/// socket bound to the group port receives group traffic; broadcasts are
/// sent from the unicast socket so replies come back to it.
pub struct UdpTransport {
    socket: UdpSocket,
    group: Option<(SocketAddrV4, UdpSocket)>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Binds a unicast-only transport.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ClusterError> {
        Self::bind_with(addr, None).await
    }

    /// Binds a transport, optionally joining a multicast group.
    pub async fn bind_with(
        addr: SocketAddr,
        multicast: Option<MulticastOptions>,
    ) -> Result<Self, ClusterError> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;

        let group = match multicast {
            Some(opts) => {
                socket.set_multicast_ttl_v4(opts.ttl)?;
                socket.set_multicast_loop_v4(true)?;
                let listener =
                    UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, opts.group.port())))
                        .await?;
                listener.join_multicast_v4(*opts.group.ip(), opts.interface)?;
                info!("joined multicast group {} on {}", opts.group, opts.interface);
                Some((opts.group, listener))
            }
            None => None,
        };

        Ok(Self {
            socket,
            group,
            local_addr,
        })
    }
}

async fn recv_on(socket: &UdpSocket) -> Result<(Bytes, SocketAddr), ClusterError> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let (len, from) = socket.recv_from(&mut buf).await?;
    buf.truncate(len);
    Ok((Bytes::from(buf), from))
}

fn check_size(frame: &Bytes) -> Result<(), ClusterError> {
    if frame.len() > MAX_DATAGRAM {
        return Err(ClusterError::MessageTooLarge {
            size: frame.len(),
            limit: MAX_DATAGRAM,
        });
    }
    Ok(())
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn max_frame_len(&self) -> usize {
        MAX_DATAGRAM
    }

    async fn send_to(&self, target: SocketAddr, frame: Bytes) -> Result<(), ClusterError> {
        check_size(&frame)?;
        self.socket.send_to(&frame, target).await?;
        Ok(())
    }

    async fn broadcast(&self, frame: Bytes) -> Result<(), ClusterError> {
        let Some((group, _)) = &self.group else {
            return Err(ClusterError::Configuration(
                "transport has no multicast group".into(),
            ));
        };
        check_size(&frame)?;
        self.socket.send_to(&frame, SocketAddr::V4(*group)).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<(Bytes, SocketAddr), ClusterError> {
        match &self.group {
            Some((_, listener)) => tokio::select! {
                r = recv_on(&self.socket) => r,
                r = recv_on(listener) => r,
            },
            None => recv_on(&self.socket).await,
        }
    }
}
