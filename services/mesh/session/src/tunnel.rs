//! Local packet tunnels.
//!
//! The tunnel is where overlay IP packets enter and leave this node. The
//! router only depends on the [`Tunnel`] trait; the daemon bridges to an
//! external TUN helper over UDP and tests use an in-process channel.

use crate::TunnelError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

const MAX_PACKET: usize = 2048;

/// Packet source and sink for locally terminated traffic
#[async_trait]
pub trait Tunnel: Send + Sync + fmt::Debug {
    /// Deliver one IP packet to the local host
    async fn send(&self, packet: &[u8]) -> Result<(), TunnelError>;

    /// Wait for the next IP packet from the local host
    async fn recv(&self) -> Result<Bytes, TunnelError>;

    /// Close the tunnel; pending and later calls fail with [`TunnelError::Closed`]
    fn close(&self);
}

/// In-process tunnel backed by two bounded channels
#[derive(Debug)]
pub struct ChannelTunnel {
    to_host: mpsc::Sender<Bytes>,
    from_host: Mutex<mpsc::Receiver<Bytes>>,
    closed: CancellationToken,
}

/// Host side of a [`ChannelTunnel`]
#[derive(Debug)]
pub struct TunnelPeer {
    /// Packets the node delivered to the host
    pub delivered: mpsc::Receiver<Bytes>,
    /// Inject packets as if written by the host
    pub inject: mpsc::Sender<Bytes>,
}

impl ChannelTunnel {
    /// Create a tunnel and its host side
    pub fn new(capacity: usize) -> (ChannelTunnel, TunnelPeer) {
        let (to_host, delivered) = mpsc::channel(capacity);
        let (inject, from_host) = mpsc::channel(capacity);
        let tunnel = ChannelTunnel {
            to_host,
            from_host: Mutex::new(from_host),
            closed: CancellationToken::new(),
        };
        (tunnel, TunnelPeer { delivered, inject })
    }
}

#[async_trait]
impl Tunnel for ChannelTunnel {
    async fn send(&self, packet: &[u8]) -> Result<(), TunnelError> {
        if self.closed.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        self.to_host
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| TunnelError::Closed)
    }

    async fn recv(&self) -> Result<Bytes, TunnelError> {
        let mut rx = self.from_host.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TunnelError::Closed),
            packet = rx.recv() => packet.ok_or(TunnelError::Closed),
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// UDP bridge to a TUN helper process.
///
/// Each datagram carries exactly one IP packet. Packets are delivered to the
/// configured peer; anything received on the listen socket is treated as
/// outbound host traffic.
#[derive(Debug)]
pub struct UdpTunnel {
    socket: UdpSocket,
    peer: SocketAddr,
    closed: CancellationToken,
}

impl UdpTunnel {
    /// Bind the bridge socket
    pub async fn bind(listen: SocketAddr, peer: SocketAddr) -> Result<Self, TunnelError> {
        let socket = UdpSocket::bind(listen).await?;
        info!(
            "Tunnel bridge listening on {} (host side {})",
            socket.local_addr()?,
            peer
        );
        Ok(Self {
            socket,
            peer,
            closed: CancellationToken::new(),
        })
    }

    /// Local bridge address
    pub fn local_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Tunnel for UdpTunnel {
    async fn send(&self, packet: &[u8]) -> Result<(), TunnelError> {
        if self.closed.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        self.socket.send_to(packet, self.peer).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, TunnelError> {
        let mut buf = BytesMut::zeroed(MAX_PACKET);
        tokio::select! {
            _ = self.closed.cancelled() => Err(TunnelError::Closed),
            received = self.socket.recv_from(&mut buf[..]) => {
                let (n, _) = received?;
                buf.truncate(n);
                Ok(buf.freeze())
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_tunnel() {
        let (tunnel, mut host) = ChannelTunnel::new(4);
        tunnel.send(b"to host").await.unwrap();
        assert_eq!(&host.delivered.recv().await.unwrap()[..], b"to host");

        host.inject.send(Bytes::from_static(b"from host")).await.unwrap();
        assert_eq!(&tunnel.recv().await.unwrap()[..], b"from host");

        tunnel.close();
        assert!(matches!(tunnel.recv().await, Err(TunnelError::Closed)));
        assert!(matches!(tunnel.send(b"x").await, Err(TunnelError::Closed)));
    }

    #[tokio::test]
    async fn test_udp_tunnel_bridge() {
        let helper = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tunnel = UdpTunnel::bind("127.0.0.1:0".parse().unwrap(), helper.local_addr().unwrap())
            .await
            .unwrap();

        tunnel.send(b"packet in").await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = helper.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"packet in");

        helper
            .send_to(b"packet out", tunnel.local_addr().unwrap())
            .await
            .unwrap();
        assert_eq!(&tunnel.recv().await.unwrap()[..], b"packet out");

        tunnel.close();
        assert!(matches!(tunnel.recv().await, Err(TunnelError::Closed)));
    }
}
