//! Connection layer: framing, sealing and per-link receive loops.
//!
//! Outbound payloads get a [`FrameTail`] appended and are sealed by the
//! session cipher before they reach a link. Inbound datagrams are opened,
//! unframed and pushed into one bounded queue consumed by the router.

use crate::{Link, LinkCipher, Route};
use bytes::BytesMut;
use mesh_wire::{ipv4, FrameFlags, FrameTail, NodeAddress, TAIL_SIZE};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the inbound packet queue
pub const QUEUE_CAPACITY: usize = 16;

/// A frame travelling between the connection layer and the router
#[derive(Debug, Clone)]
pub struct Packet {
    /// Route the frame arrived on, or leaves on
    pub route: Route,
    /// Frame flags
    pub flags: FrameFlags,
    /// Final destination
    pub dst: NodeAddress,
    /// Pinned intermediate hop
    pub via: NodeAddress,
    /// IP packet or routing message
    pub payload: BytesMut,
}

/// Result of [`Connection::forward`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Sent towards the next hop
    Forwarded,
    /// Hop limit exhausted, dropped silently
    HopLimitExceeded,
    /// IP TTL exhausted, ICMP Time Exceeded sent back
    TimeExceeded,
    /// Payload is not an IPv4 packet
    Malformed,
}

/// Framing and sealing shared by every link of a session
#[derive(Debug)]
pub struct Connection {
    cipher: Arc<LinkCipher>,
    queue: mpsc::Sender<Packet>,
    cancel: CancellationToken,
}

impl Connection {
    /// Create the connection layer and the receiving end of its inbound queue
    pub fn new(cipher: Arc<LinkCipher>, cancel: CancellationToken) -> (Self, mpsc::Receiver<Packet>) {
        let (queue, rx) = mpsc::channel(QUEUE_CAPACITY);
        (
            Self {
                cipher,
                queue,
                cancel,
            },
            rx,
        )
    }

    /// Start the receive loop of `link`.
    ///
    /// The loop ends when the session or the link is cancelled, or on the
    /// first receive error, and always leaves the link cancelled.
    pub fn add_link(&self, link: Arc<dyn Link>) -> JoinHandle<()> {
        let cipher = self.cipher.clone();
        let queue = self.queue.clone();
        let session = self.cancel.clone();

        if let Some(peer) = link.peer() {
            info!("Link added: {}", link.describe(&peer));
        }
        let overhead = link.overhead();
        if overhead >= 0 {
            info!(
                "Link overhead: {} bytes per packet",
                overhead as usize + cipher.overhead() + TAIL_SIZE
            );
        }

        tokio::spawn(async move {
            let link_done = link.done().clone();
            loop {
                let received = tokio::select! {
                    biased;
                    _ = session.cancelled() => break,
                    _ = link_done.cancelled() => break,
                    received = link.recv() => received,
                };
                let (datagram, addr) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Link receive failed: {}", e);
                        break;
                    }
                };

                let mut frame = match cipher.decrypt(&datagram) {
                    Ok(opened) => BytesMut::from(&opened[..]),
                    Err(e) => {
                        debug!("Dropping packet from {}: {}", addr, e);
                        continue;
                    }
                };
                let tail = match FrameTail::split_from(&mut frame) {
                    Ok(tail) => tail,
                    Err(e) => {
                        debug!("Dropping packet from {}: {}", addr, e);
                        continue;
                    }
                };

                let packet = Packet {
                    route: Route::new(link.clone(), addr),
                    flags: tail.flags,
                    dst: tail.dst,
                    via: tail.via,
                    payload: frame,
                };
                if packet.flags.is_routing() {
                    match queue.try_send(packet) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => debug!("Inbound queue full, dropping routing packet"),
                        Err(TrySendError::Closed(_)) => break,
                    }
                } else {
                    tokio::select! {
                        _ = session.cancelled() => break,
                        sent = queue.send(packet) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            link.cancel();
            debug!("Link receive loop ended");
        })
    }

    /// Frame, seal and send a packet on its route.
    ///
    /// A send failure takes the route's link down. Returns whether the
    /// frame was handed to the link.
    pub fn send(&self, packet: Packet) -> bool {
        let Packet {
            route,
            flags,
            dst,
            via,
            mut payload,
        } = packet;
        FrameTail::new(flags, dst, via).append(&mut payload);

        let sealed = match self.cipher.encrypt(&payload) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("Failed to seal packet for {}: {}", route, e);
                return false;
            }
        };
        match route.send(&sealed) {
            Ok(()) => true,
            Err(e) => {
                warn!("Send on {} failed: {}", route, e);
                route.link.cancel();
                false
            }
        }
    }

    /// Forward a received data packet towards `next`.
    ///
    /// The hop limit and the IP TTL are both decremented. When the TTL runs
    /// out an ICMP Time Exceeded from `self_addr` goes back on the route the
    /// packet arrived on.
    pub fn forward(&self, self_addr: NodeAddress, next: Route, mut packet: Packet) -> ForwardOutcome {
        if packet.flags.hop_limit() <= 1 {
            debug!("Hop limit exceeded for packet to {}", packet.dst);
            return ForwardOutcome::HopLimitExceeded;
        }
        let Some(ttl) = ipv4::ttl(&packet.payload) else {
            debug!("Dropping non-IPv4 payload to {}", packet.dst);
            return ForwardOutcome::Malformed;
        };

        if ttl <= 1 {
            if let Some(src) = ipv4::source(&packet.payload) {
                let reply = ipv4::time_exceeded(self_addr, src, &packet.payload);
                self.send(Packet {
                    route: packet.route,
                    flags: FrameFlags::data(),
                    dst: src,
                    via: NodeAddress::EMPTY,
                    payload: reply,
                });
            }
            return ForwardOutcome::TimeExceeded;
        }

        ipv4::set_ttl(&mut packet.payload, ttl - 1);
        packet.flags = packet.flags.decrement_hop_limit();
        packet.route = next;
        self.send(packet);
        ForwardOutcome::Forwarded
    }
}
