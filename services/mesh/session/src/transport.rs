//! Link transports for mesh sessions.
//!
//! A link moves opaque datagrams between this node and one or more peers.
//! The routing core only sees links through the [`Link`] trait and pairs a
//! link with a transport address to form a [`Route`].

use crate::LinkError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Largest datagram accepted from a link
pub const MAX_DATAGRAM: usize = 2048;

/// Transport-specific peer address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkAddr {
    /// UDP socket address
    Socket(SocketAddr),
    /// In-process link endpoint
    Memory(u32),
}

impl fmt::Display for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkAddr::Socket(addr) => write!(f, "{}", addr),
            LinkAddr::Memory(id) => write!(f, "mem#{}", id),
        }
    }
}

/// A datagram transport between this node and its peers.
///
/// `send` must never block: the protocol engine and router call it from
/// their event loops. Datagrams that cannot be queued are dropped.
#[async_trait]
pub trait Link: Send + Sync + fmt::Debug {
    /// Queue one datagram for `addr`
    fn send(&self, payload: &[u8], addr: &LinkAddr) -> Result<(), LinkError>;

    /// Wait for the next datagram and its source address
    async fn recv(&self) -> Result<(BytesMut, LinkAddr), LinkError>;

    /// Configured peer, if this link dials out
    fn peer(&self) -> Option<LinkAddr>;

    /// Per-datagram transport overhead in bytes, -1 when unknown
    fn overhead(&self) -> i32;

    /// Human readable description of the link towards `addr`
    fn describe(&self, addr: &LinkAddr) -> String;

    /// Token cancelled when the link goes down
    fn done(&self) -> &CancellationToken;

    /// Take the link down
    fn cancel(&self) {
        self.done().cancel();
    }
}

/// A link paired with one peer address on it
#[derive(Clone)]
pub struct Route {
    /// Link carrying the traffic
    pub link: Arc<dyn Link>,
    /// Peer address on that link
    pub addr: LinkAddr,
}

impl Route {
    /// Create a route
    pub fn new(link: Arc<dyn Link>, addr: LinkAddr) -> Self {
        Self { link, addr }
    }

    /// Send a datagram along this route
    pub fn send(&self, payload: &[u8]) -> Result<(), LinkError> {
        self.link.send(payload, &self.addr)
    }

    /// Identity of the underlying link, shared by every route on it
    pub fn link_id(&self) -> usize {
        self.link_ptr() as usize
    }

    fn link_ptr(&self) -> *const () {
        Arc::as_ptr(&self.link) as *const ()
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.link_ptr() == other.link_ptr() && self.addr == other.addr
    }
}

impl Eq for Route {}

impl Hash for Route {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.link_ptr() as usize).hash(state);
        self.addr.hash(state);
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.link.describe(&self.addr))
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Route({})", self)
    }
}

/// UDP link bound to a local socket, optionally dialing one peer
#[derive(Debug)]
pub struct UdpLink {
    socket: UdpSocket,
    local: SocketAddr,
    peer: Option<SocketAddr>,
    done: CancellationToken,
}

impl UdpLink {
    /// Bind a UDP link; the link goes down with `parent`
    pub async fn bind(
        listen: SocketAddr,
        peer: Option<SocketAddr>,
        parent: &CancellationToken,
    ) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind(listen).await?;
        let local = socket.local_addr()?;
        info!("UDP link bound on {} (peer: {:?})", local, peer);
        Ok(Self {
            socket,
            local,
            peer,
            done: parent.child_token(),
        })
    }

    /// Local socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

#[async_trait]
impl Link for UdpLink {
    fn send(&self, payload: &[u8], addr: &LinkAddr) -> Result<(), LinkError> {
        if self.done.is_cancelled() {
            return Err(LinkError::Closed);
        }
        let LinkAddr::Socket(target) = addr else {
            return Err(LinkError::AddressMismatch(addr.to_string()));
        };
        match self.socket.try_send_to(payload, *target) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!("UDP send buffer full on {}, dropping datagram", self.local);
                Ok(())
            }
            Err(e) if is_destination_error(&e) => {
                debug!("UDP send from {} to {} failed: {}", self.local, target, e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn recv(&self) -> Result<(BytesMut, LinkAddr), LinkError> {
        let mut buf = BytesMut::zeroed(MAX_DATAGRAM);
        let (n, from) = self.socket.recv_from(&mut buf[..]).await?;
        buf.truncate(n);
        Ok((buf, LinkAddr::Socket(from)))
    }

    fn peer(&self) -> Option<LinkAddr> {
        self.peer.map(LinkAddr::Socket)
    }

    fn overhead(&self) -> i32 {
        // IP + UDP headers
        if self.local.is_ipv4() {
            28
        } else {
            48
        }
    }

    fn describe(&self, addr: &LinkAddr) -> String {
        format!("udp {} -> {}", self.local, addr)
    }

    fn done(&self) -> &CancellationToken {
        &self.done
    }
}

/// Errors that concern one destination and leave the socket usable
fn is_destination_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::NetworkUnreachable
            | ErrorKind::HostUnreachable
            | ErrorKind::PermissionDenied
            | ErrorKind::ConnectionRefused
            | ErrorKind::AddrNotAvailable
    )
}

static NEXT_MEMORY_ID: AtomicU32 = AtomicU32::new(1);

/// In-process link, created in connected pairs
#[derive(Debug)]
pub struct MemoryLink {
    id: u32,
    peer_id: u32,
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    done: CancellationToken,
}

impl MemoryLink {
    /// Create two links wired to each other, each buffering `capacity` datagrams
    pub fn pair(capacity: usize) -> (Arc<MemoryLink>, Arc<MemoryLink>) {
        let a_id = NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed);
        let b_id = NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed);
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        let a = MemoryLink {
            id: a_id,
            peer_id: b_id,
            tx: a_tx,
            rx: Mutex::new(a_rx),
            done: CancellationToken::new(),
        };
        let b = MemoryLink {
            id: b_id,
            peer_id: a_id,
            tx: b_tx,
            rx: Mutex::new(b_rx),
            done: CancellationToken::new(),
        };
        (Arc::new(a), Arc::new(b))
    }

    /// Address of the other end, as seen from this end
    pub fn peer_addr(&self) -> LinkAddr {
        LinkAddr::Memory(self.peer_id)
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn send(&self, payload: &[u8], addr: &LinkAddr) -> Result<(), LinkError> {
        if self.done.is_cancelled() {
            return Err(LinkError::Closed);
        }
        if *addr != self.peer_addr() {
            return Err(LinkError::AddressMismatch(addr.to_string()));
        }
        match self.tx.try_send(Bytes::copy_from_slice(payload)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("memory link {} full, dropping datagram", self.id);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(LinkError::Closed),
        }
    }

    async fn recv(&self) -> Result<(BytesMut, LinkAddr), LinkError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(datagram) => Ok((BytesMut::from(&datagram[..]), self.peer_addr())),
            None => Err(LinkError::Closed),
        }
    }

    fn peer(&self) -> Option<LinkAddr> {
        Some(self.peer_addr())
    }

    fn overhead(&self) -> i32 {
        0
    }

    fn describe(&self, addr: &LinkAddr) -> String {
        format!("mem#{} -> {}", self.id, addr)
    }

    fn done(&self) -> &CancellationToken {
        &self.done
    }
}
