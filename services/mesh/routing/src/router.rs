//! Forwarding loop between links, the local tunnel and the protocol engine.
//!
//! The router drains three sources: frames received on any link, IP packets
//! written by the local host into the tunnel, and routing messages the engine
//! wants sent. Every decision is taken against the current route snapshot.

use crate::engine::{EngineHandle, RoutingPacket};
use crate::prefix::PrefixTable;
use crate::table::RouteTable;
use crate::RoutingError;
use bytes::{Bytes, BytesMut};
use ipnetwork::Ipv4Network;
use mesh_session::{Connection, ForwardOutcome, Packet, Tunnel, TunnelError};
use mesh_wire::{ipv4, FrameFlags, NodeAddress};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// This node's overlay address
    pub node: NodeAddress,
    /// Overlay subnet
    pub subnet: Ipv4Network,
    /// Default node for destinations outside the overlay
    pub gateway: Option<NodeAddress>,
    /// Static routes for destinations outside the overlay
    pub static_routes: PrefixTable,
}

enum Input {
    Link(Packet),
    Tunnel(Result<Bytes, TunnelError>),
}

/// Next data input. Links and tunnel are polled in random order so a busy
/// link cannot starve tunnel egress.
async fn next_input(from_links: &mut mpsc::Receiver<Packet>, tunnel: &dyn Tunnel) -> Input {
    tokio::select! {
        Some(packet) = from_links.recv() => Input::Link(packet),
        received = tunnel.recv() => Input::Tunnel(received),
    }
}

impl RouterConfig {
    fn in_subnet(&self, addr: NodeAddress) -> bool {
        self.subnet.contains(Ipv4Addr::from(addr))
    }
}

/// Reason for dropping a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Zero-length payload
    Empty,
    /// Payload is not an IPv4 packet
    Malformed,
    /// Destination outside the overlay with no static route or gateway
    OutOfSubnet,
    /// Destination resolves back to this node
    Loop,
    /// No route to the destination yet
    NoRoute,
    /// Frame hop limit exhausted
    HopLimitExceeded,
    /// Engine inbound queue full or stopped
    EngineBusy,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Empty => write!(f, "empty payload"),
            DropReason::Malformed => write!(f, "malformed IPv4 packet"),
            DropReason::OutOfSubnet => write!(f, "destination outside the overlay"),
            DropReason::Loop => write!(f, "destination resolves to this node"),
            DropReason::NoRoute => write!(f, "no route to destination"),
            DropReason::HopLimitExceeded => write!(f, "hop limit exceeded"),
            DropReason::EngineBusy => write!(f, "routing engine busy"),
        }
    }
}

/// What happened to one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handed to the protocol engine
    Routing,
    /// Written to the local tunnel
    Delivered,
    /// Sent on towards its destination
    Forwarded,
    /// Answered with an ICMP Time Exceeded
    TimeExceeded,
    /// Dropped
    Dropped(DropReason),
}

impl From<ForwardOutcome> for Disposition {
    fn from(outcome: ForwardOutcome) -> Self {
        match outcome {
            ForwardOutcome::Forwarded => Disposition::Forwarded,
            ForwardOutcome::TimeExceeded => Disposition::TimeExceeded,
            ForwardOutcome::HopLimitExceeded => Disposition::Dropped(DropReason::HopLimitExceeded),
            ForwardOutcome::Malformed => Disposition::Dropped(DropReason::Malformed),
        }
    }
}

/// Handle for changing a running router
#[derive(Debug, Clone)]
pub struct RouterHandle {
    gateway: mpsc::Sender<Option<NodeAddress>>,
}

impl RouterHandle {
    /// Replace the default gateway; `None` removes it
    pub async fn update_gateway(&self, gateway: Option<NodeAddress>) -> Result<(), RoutingError> {
        self.gateway
            .send(gateway)
            .await
            .map_err(|_| RoutingError::EngineStopped)
    }
}

/// Packet forwarding state
#[derive(Debug)]
pub struct Router {
    config: RouterConfig,
    connection: Arc<Connection>,
    tunnel: Arc<dyn Tunnel>,
    table: Arc<RouteTable>,
    engine: EngineHandle,
}

impl Router {
    /// Create a router forwarding over `connection` with routes from `engine`
    pub fn new(
        config: RouterConfig,
        connection: Arc<Connection>,
        tunnel: Arc<dyn Tunnel>,
        engine: EngineHandle,
    ) -> Self {
        Self {
            table: engine.table(),
            config,
            connection,
            tunnel,
            engine,
        }
    }

    /// Run the forwarding loop on its own task.
    ///
    /// A tunnel failure is fatal to the whole session and cancels `cancel`.
    pub fn spawn(
        self,
        from_links: mpsc::Receiver<Packet>,
        from_engine: mpsc::Receiver<RoutingPacket>,
        cancel: CancellationToken,
    ) -> (RouterHandle, JoinHandle<()>) {
        let (gateway, gateway_rx) = mpsc::channel(1);
        let task = tokio::spawn(self.run(from_links, from_engine, gateway_rx, cancel));
        (RouterHandle { gateway }, task)
    }

    async fn run(
        mut self,
        mut from_links: mpsc::Receiver<Packet>,
        mut from_engine: mpsc::Receiver<RoutingPacket>,
        mut gateway_rx: mpsc::Receiver<Option<NodeAddress>>,
        cancel: CancellationToken,
    ) {
        info!(
            "Router started for {} in {}",
            self.config.node, self.config.subnet
        );

        let result = loop {
            let tunnel = self.tunnel.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                Some(gateway) = gateway_rx.recv() => self.set_gateway(gateway),
                Some(packet) = from_engine.recv() => self.send_routing(packet),
                input = next_input(&mut from_links, tunnel.as_ref()) => {
                    let handled = match input {
                        Input::Link(packet) => self.handle_link_packet(packet).await,
                        Input::Tunnel(Ok(packet)) => self.handle_tunnel_packet(packet).await,
                        Input::Tunnel(Err(e)) => Err(e),
                    };
                    if let Err(e) = handled {
                        break Err(e);
                    }
                }
            }
        };

        if let Err(e) = result {
            if !cancel.is_cancelled() {
                error!("Tunnel failed, stopping session: {}", e);
                cancel.cancel();
            }
        }
        info!("Router stopped");
    }

    fn set_gateway(&mut self, gateway: Option<NodeAddress>) {
        match gateway {
            Some(addr) => info!("Default gateway set to {}", addr),
            None => info!("Default gateway removed"),
        }
        self.config.gateway = gateway;
    }

    fn send_routing(&self, packet: RoutingPacket) {
        self.connection.send(Packet {
            route: packet.route,
            flags: FrameFlags::routing(),
            dst: NodeAddress::EMPTY,
            via: NodeAddress::EMPTY,
            payload: BytesMut::from(&packet.payload[..]),
        });
    }

    /// Handle one frame received on a link
    pub async fn handle_link_packet(&self, mut packet: Packet) -> Result<Disposition, TunnelError> {
        if packet.payload.is_empty() {
            return Ok(self.dropped(DropReason::Empty, packet.dst));
        }

        if packet.flags.is_routing() {
            let routing = RoutingPacket {
                route: packet.route,
                payload: packet.payload.freeze(),
            };
            return Ok(match self.engine.inject(routing) {
                Ok(()) => Disposition::Routing,
                Err(e) => {
                    debug!("Dropping routing message: {}", e);
                    Disposition::Dropped(DropReason::EngineBusy)
                }
            });
        }

        if packet.dst == self.config.node {
            self.tunnel.send(&packet.payload).await?;
            return Ok(Disposition::Delivered);
        }

        if !self.config.in_subnet(packet.dst) {
            return Ok(self.dropped(DropReason::OutOfSubnet, packet.dst));
        }

        let next = if packet.via == self.config.node {
            self.table.adjacent(packet.dst)
        } else if packet.via.is_empty() {
            self.table.balanced(packet.dst).map(|(route, through)| {
                packet.via = through;
                route
            })
        } else {
            self.table.shortest(packet.via)
        };
        let next = match next {
            Ok(route) => route,
            Err(_) => return Ok(self.dropped(DropReason::NoRoute, packet.dst)),
        };

        Ok(self.connection.forward(self.config.node, next, packet).into())
    }

    /// Handle one IP packet read from the local tunnel
    pub async fn handle_tunnel_packet(&self, packet: Bytes) -> Result<Disposition, TunnelError> {
        let Some(mut dst) = ipv4::destination(&packet) else {
            return Ok(self.dropped(DropReason::Malformed, NodeAddress::EMPTY));
        };

        if dst == self.config.node {
            self.tunnel.send(&packet).await?;
            return Ok(Disposition::Delivered);
        }

        if !self.config.in_subnet(dst) {
            let egress = self
                .config
                .static_routes
                .lookup(dst)
                .or(self.config.gateway);
            match egress {
                Some(node) => dst = node,
                None => return Ok(self.dropped(DropReason::OutOfSubnet, dst)),
            }
            if dst == self.config.node {
                return Ok(self.dropped(DropReason::Loop, dst));
            }
        }

        let (route, through) = match self.table.balanced(dst) {
            Ok(selected) => selected,
            Err(_) => return Ok(self.dropped(DropReason::NoRoute, dst)),
        };

        let mut payload = BytesMut::from(&packet[..]);
        let Some(ttl) = ipv4::ttl(&payload) else {
            return Ok(self.dropped(DropReason::Malformed, dst));
        };
        if ttl <= 1 {
            if let Some(src) = ipv4::source(&payload) {
                let reply = ipv4::time_exceeded(self.config.node, src, &payload);
                self.tunnel.send(&reply).await?;
            }
            return Ok(Disposition::TimeExceeded);
        }
        ipv4::set_ttl(&mut payload, ttl - 1);

        self.connection.send(Packet {
            route,
            flags: FrameFlags::data(),
            dst,
            via: through,
            payload,
        });
        Ok(Disposition::Forwarded)
    }

    fn dropped(&self, reason: DropReason, dst: NodeAddress) -> Disposition {
        debug!("Dropping packet to {}: {}", dst, reason);
        Disposition::Dropped(reason)
    }
}
