//! Link-state protocol engine.
//!
//! The engine is a single task that owns the adjacency table and the
//! link-state database. Everything that mutates them arrives through its
//! event loop: routing messages from the router, commands from handles,
//! per-route Hello timers, link closures and the periodic adjacency-check,
//! flood and retransmission timers. Each link is watched once, however
//! many routes run over it.
//!
//! After every change the engine rebuilds the shared [`RouteTable`].

use crate::table::{RouteSnapshot, RouteTable};
use crate::RoutingError;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use mesh_session::Route;
use mesh_topology::{
    shortest_paths, wall_nanos, AdjacencyTable, Clock, LinkStateDatabase, LsdbOutcome,
    HELLO_INTERVAL,
};
use mesh_wire::{Body, Hello, LinkStateAck, LinkStateUpdate, Message, NodeAddress};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Interval between adjacency sweeps
pub const ADJACENCY_CHECK_INTERVAL: Duration = Duration::from_millis(1500);
/// Interval at which a pending flood is performed
pub const FLOOD_INTERVAL: Duration = Duration::from_millis(1000);
/// Interval between retransmissions of unacknowledged link states
pub const RETRY_INTERVAL: Duration = Duration::from_millis(1800);
/// Capacity of the engine's inbound and command queues
pub const ENGINE_QUEUE_CAPACITY: usize = 16;

/// Static engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This node's overlay address
    pub node: NodeAddress,
    /// Name advertised in link-state updates
    pub name: String,
    /// Advertise an empty own state so this node never carries transit traffic
    pub leaf: bool,
    /// Process start time sent with every message
    pub boot_time: u64,
}

/// A routing message together with the route it travels on
#[derive(Debug, Clone)]
pub struct RoutingPacket {
    /// Inbound route, or the route to send on
    pub route: Route,
    /// Encoded [`Message`]
    pub payload: Bytes,
}

/// A node known from the link-state database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Neighbor {
    /// Node address
    pub node: NodeAddress,
    /// Advertised name
    pub name: String,
}

enum EngineCommand {
    AddRoute(Route),
    Dump(oneshot::Sender<Value>),
    Neighbors(oneshot::Sender<Vec<Neighbor>>),
}

/// Cloneable handle to a running engine
#[derive(Debug, Clone)]
pub struct EngineHandle {
    inbound: mpsc::Sender<RoutingPacket>,
    commands: mpsc::Sender<EngineCommand>,
    table: Arc<RouteTable>,
}

impl std::fmt::Debug for EngineCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineCommand::AddRoute(route) => write!(f, "AddRoute({})", route),
            EngineCommand::Dump(_) => f.write_str("Dump"),
            EngineCommand::Neighbors(_) => f.write_str("Neighbors"),
        }
    }
}

impl EngineHandle {
    /// Queue a received routing message; never waits
    pub fn inject(&self, packet: RoutingPacket) -> Result<(), RoutingError> {
        self.inbound.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RoutingError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RoutingError::EngineStopped,
        })
    }

    /// Start sending Hellos on a configured peer route
    pub async fn add_route(&self, route: Route) -> Result<(), RoutingError> {
        self.commands
            .send(EngineCommand::AddRoute(route))
            .await
            .map_err(|_| RoutingError::EngineStopped)
    }

    /// JSON dump of the engine state
    pub async fn dump(&self) -> Result<Value, RoutingError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Dump(tx))
            .await
            .map_err(|_| RoutingError::EngineStopped)?;
        rx.await.map_err(|_| RoutingError::EngineStopped)
    }

    /// Nodes known from the link-state database, this node excluded
    pub async fn neighbors(&self) -> Result<Vec<Neighbor>, RoutingError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Neighbors(tx))
            .await
            .map_err(|_| RoutingError::EngineStopped)?;
        rx.await.map_err(|_| RoutingError::EngineStopped)
    }

    /// Route table maintained by the engine
    pub fn table(&self) -> Arc<RouteTable> {
        self.table.clone()
    }
}

/// The protocol engine task state
pub struct ProtocolEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    adjacencies: AdjacencyTable<Route>,
    lsdb: LinkStateDatabase,
    table: Arc<RouteTable>,
    outbound: mpsc::Sender<RoutingPacket>,
    inbound_rx: mpsc::Receiver<RoutingPacket>,
    commands_rx: mpsc::Receiver<EngineCommand>,
    hello_timers: StreamMap<Route, IntervalStream>,
    closures: FuturesUnordered<BoxFuture<'static, usize>>,
    watched_links: HashSet<usize>,
    pending_flood: bool,
    last_version: u64,
    violations: u64,
}

impl ProtocolEngine {
    /// Create an engine sending its messages to `outbound`
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        outbound: mpsc::Sender<RoutingPacket>,
    ) -> (Self, EngineHandle) {
        let (inbound, inbound_rx) = mpsc::channel(ENGINE_QUEUE_CAPACITY);
        let (commands, commands_rx) = mpsc::channel(ENGINE_QUEUE_CAPACITY);
        let table = Arc::new(RouteTable::new());
        let handle = EngineHandle {
            inbound,
            commands,
            table: table.clone(),
        };
        let engine = Self {
            lsdb: LinkStateDatabase::new(config.node),
            config,
            clock,
            adjacencies: AdjacencyTable::new(),
            table,
            outbound,
            inbound_rx,
            commands_rx,
            hello_timers: StreamMap::new(),
            closures: FuturesUnordered::new(),
            watched_links: HashSet::new(),
            pending_flood: false,
            last_version: 0,
            violations: 0,
        };
        (engine, handle)
    }

    /// Run the engine on its own task until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Event loop
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Routing engine started for {} ({}{})",
            self.config.node,
            self.config.name,
            if self.config.leaf { ", leaf" } else { "" }
        );

        let mut adjacency_check = interval(ADJACENCY_CHECK_INTERVAL);
        adjacency_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flood = interval(FLOOD_INTERVAL);
        flood.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry = interval(RETRY_INTERVAL);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(command) = self.commands_rx.recv() => self.handle_command(command),
                Some(packet) = self.inbound_rx.recv() => self.handle_packet(packet),
                Some((route, _)) = self.hello_timers.next(), if !self.hello_timers.is_empty() => {
                    self.send_hello(&route);
                }
                Some(link) = self.closures.next(), if !self.closures.is_empty() => {
                    self.handle_link_closed(link);
                }
                _ = adjacency_check.tick() => self.check_adjacencies(),
                _ = flood.tick(), if self.pending_flood => self.flood_link_state(),
                _ = retry.tick() => self.send_pending(),
            }
        }

        info!(
            "Routing engine stopped ({} protocol violations)",
            self.violations
        );
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::AddRoute(route) => self.add_route(route),
            EngineCommand::Dump(reply) => {
                let _ = reply.send(self.dump());
            }
            EngineCommand::Neighbors(reply) => {
                let _ = reply.send(self.neighbors());
            }
        }
    }

    fn add_route(&mut self, route: Route) {
        info!("Sending Hellos on {}", route);
        let mut hello = interval(HELLO_INTERVAL);
        hello.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.hello_timers
            .insert(route.clone(), IntervalStream::new(hello));
        self.watch(&route);
    }

    fn watch(&mut self, route: &Route) {
        let id = route.link_id();
        if !self.watched_links.insert(id) {
            return;
        }
        // Holding the link keeps its address from being reused while watched.
        let link = route.link.clone();
        self.closures.push(
            async move {
                link.done().cancelled().await;
                id
            }
            .boxed(),
        );
    }

    fn handle_link_closed(&mut self, id: usize) {
        self.watched_links.remove(&id);
        let timed: Vec<Route> = self
            .hello_timers
            .keys()
            .filter(|route| route.link_id() == id)
            .cloned()
            .collect();
        for route in &timed {
            self.hello_timers.remove(route);
            info!("Route {} closed", route);
        }
        let removed = self.adjacencies.remove_routes(|route| route.link_id() == id);
        if removed {
            info!("Dropped adjacency routes of a closed link");
            self.pending_flood = true;
            self.rebuild_routes();
        }
    }

    fn handle_packet(&mut self, packet: RoutingPacket) {
        let message = match Message::decode(&packet.payload) {
            Ok(message) => message,
            Err(e) => {
                self.violation(format_args!(
                    "undecodable routing message on {}: {}",
                    packet.route, e
                ));
                return;
            }
        };
        match message.body {
            Body::Hello(hello) => {
                self.handle_hello(message.src, message.boot_time, hello, packet.route)
            }
            Body::LinkStateUpdate(update) => {
                self.handle_link_state(message.src, message.boot_time, update, packet.route)
            }
            Body::LinkStateAck(ack) => {
                if !self.lsdb.apply_ack(message.src, message.boot_time, &ack) {
                    trace!("Ignored ack for {} v{} from {}", ack.owner, ack.version, message.src);
                }
            }
        }
    }

    fn handle_hello(&mut self, src: NodeAddress, boot_time: u64, mut hello: Hello, route: Route) {
        if src == self.config.node {
            debug!("Ignoring own Hello on {}", route);
            return;
        }
        let now = self.clock.now();
        let start = match hello.forwarded {
            0 => {
                hello.time2 = now;
                hello.forwarded = 1;
                self.send_message(&route, Body::Hello(hello));
                return;
            }
            1 => {
                hello.forwarded = 2;
                self.send_message(&route, Body::Hello(hello));
                hello.time1
            }
            2 => hello.time2,
            other => {
                self.violation(format_args!(
                    "Hello from {} with forwarded={}",
                    src, other
                ));
                return;
            }
        };
        let rtt = now.saturating_sub(start);
        self.update_metric(src, boot_time, route, rtt, now);
    }

    fn update_metric(&mut self, src: NodeAddress, boot_time: u64, route: Route, rtt: u64, now: u64) {
        let update = self
            .adjacencies
            .update(src, boot_time, route.clone(), rtt, now);
        if update.is_new_route {
            info!("New route to {}: {}", src, route);
            self.watch(&route);
        }
        if update.should_reflood {
            self.pending_flood = true;
        }
        self.rebuild_routes();
    }

    fn handle_link_state(&mut self, src: NodeAddress, boot_time: u64, update: LinkStateUpdate, route: Route) {
        let ack = LinkStateAck {
            owner: update.owner,
            version: update.version,
        };
        self.send_message(&route, Body::LinkStateAck(ack));

        let owner = update.owner;
        match self.lsdb.apply_update(src, boot_time, update, self.clock.now()) {
            LsdbOutcome::SelfOwned => {
                self.violation(format_args!(
                    "received a link state update owned by this node from {}",
                    src
                ));
            }
            LsdbOutcome::Installed => self.rebuild_routes(),
            LsdbOutcome::Acknowledged | LsdbOutcome::Stale => {
                trace!("Link state of {} from {} already known", owner, src);
            }
        }
    }

    fn check_adjacencies(&mut self) {
        let now = self.clock.now();
        if self.adjacencies.sweep(now) {
            self.pending_flood = true;
        }
        let reachable: HashSet<NodeAddress> = shortest_paths(&self.lsdb, self.config.node, None)
            .into_keys()
            .collect();
        self.lsdb.prune_unreachable(&reachable, now);
        self.rebuild_routes();
    }

    fn flood_link_state(&mut self) {
        let version = wall_nanos().max(self.last_version + 1);
        self.last_version = version;
        let update = LinkStateUpdate {
            owner: self.config.node,
            version,
            state: self.adjacencies.metrics(),
            name: self.config.name.clone(),
        };
        debug!(
            "Flooding link state version {} with {} adjacencies",
            version,
            update.state.len()
        );
        self.lsdb.install_own(update, self.clock.now());
        self.pending_flood = false;
        self.rebuild_routes();
    }

    fn send_pending(&mut self) {
        let local = self.config.node;
        let mut outgoing = Vec::new();
        for (neighbor, adjacency) in self.adjacencies.iter() {
            for state in self.lsdb.pending_for(*neighbor, adjacency.boot_time) {
                let mut update = state.update.clone();
                if self.config.leaf && update.owner == local {
                    update.state.clear();
                }
                outgoing.push((*neighbor, update));
            }
        }

        for (neighbor, update) in outgoing {
            let route = match self.table.adjacent(neighbor) {
                Ok(route) => route,
                Err(_) => continue,
            };
            debug!("Sending {}'s link state to {}", update.owner, neighbor);
            self.send_message(&route, Body::LinkStateUpdate(update));
        }
    }

    fn send_hello(&mut self, route: &Route) {
        let hello = Hello {
            time1: self.clock.now(),
            time2: 0,
            forwarded: 0,
        };
        self.send_message(route, Body::Hello(hello));
    }

    fn send_message(&self, route: &Route, body: Body) {
        let message = Message::new(self.config.node, self.config.boot_time, body);
        let packet = RoutingPacket {
            route: route.clone(),
            payload: message.to_bytes(),
        };
        if let Err(e) = self.outbound.try_send(packet) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    debug!("Outbound routing queue full, dropping message to {}", route)
                }
                mpsc::error::TrySendError::Closed(_) => {
                    warn!("Outbound routing queue closed")
                }
            }
        }
    }

    fn rebuild_routes(&mut self) {
        let snapshot = RouteSnapshot::build(&self.adjacencies, &self.lsdb, self.clock.now());
        self.table.install(snapshot);
    }

    fn violation(&mut self, what: std::fmt::Arguments<'_>) {
        self.violations += 1;
        error!("Protocol violation: {}", what);
    }

    fn dump(&self) -> Value {
        json!({
            "node": self.config.node,
            "name": self.config.name,
            "boot_time": self.config.boot_time,
            "leaf": self.config.leaf,
            "adjacencies": self.adjacencies.describe(self.clock.now()),
            "lsdb": self.lsdb.describe(),
            "routes": self.table.snapshot().describe(),
            "protocol_violations": self.violations,
        })
    }

    fn neighbors(&self) -> Vec<Neighbor> {
        self.lsdb
            .iter()
            .filter(|(owner, _)| **owner != self.config.node)
            .map(|(owner, state)| Neighbor {
                node: *owner,
                name: state.update.name.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_session::{Link, LinkAddr, MemoryLink};
    use mesh_topology::{ManualClock, MAX_METRIC};
    use std::collections::BTreeMap;

    const MS: u64 = 1_000_000;

    fn node(last: u8) -> NodeAddress {
        NodeAddress::new(10, 0, 0, last)
    }

    struct Fixture {
        engine: ProtocolEngine,
        handle: EngineHandle,
        clock: Arc<ManualClock>,
        outbound: mpsc::Receiver<RoutingPacket>,
        route: Route,
        _far: Arc<MemoryLink>,
    }

    fn fixture(leaf: bool) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000 * MS));
        let (tx, outbound) = mpsc::channel(64);
        let config = EngineConfig {
            node: node(1),
            name: "alpha".into(),
            leaf,
            boot_time: 11,
        };
        let (engine, handle) = ProtocolEngine::new(config, clock.clone(), tx);
        let (near, far) = MemoryLink::pair(4);
        let link: Arc<dyn Link> = near.clone();
        let route = Route::new(link, near.peer_addr());
        Fixture {
            engine,
            handle,
            clock,
            outbound,
            route,
            _far: far,
        }
    }

    fn packet(route: &Route, src: NodeAddress, boot: u64, body: Body) -> RoutingPacket {
        RoutingPacket {
            route: route.clone(),
            payload: Message::new(src, boot, body).to_bytes(),
        }
    }

    fn sent(rx: &mut mpsc::Receiver<RoutingPacket>) -> Vec<(Route, Message)> {
        let mut out = Vec::new();
        while let Ok(p) = rx.try_recv() {
            out.push((p.route, Message::decode(&p.payload).unwrap()));
        }
        out
    }

    fn hello(time1: u64, time2: u64, forwarded: u8) -> Body {
        Body::Hello(Hello {
            time1,
            time2,
            forwarded,
        })
    }

    #[tokio::test]
    async fn test_hello_first_phase_echoes() {
        let mut f = fixture(false);
        let route = f.route.clone();
        f.engine.handle_packet(packet(&route, node(2), 5, hello(77, 0, 0)));

        let out = sent(&mut f.outbound);
        assert_eq!(out.len(), 1);
        let (via, message) = &out[0];
        assert_eq!(via, &route);
        assert_eq!(message.src, node(1));
        assert_eq!(message.boot_time, 11);
        assert_eq!(message.body, hello(77, 1_000 * MS, 1));
        assert!(f.engine.adjacencies.is_empty());
    }

    #[tokio::test]
    async fn test_hello_second_phase_measures_and_echoes() {
        let mut f = fixture(false);
        let route = f.route.clone();
        let start = f.clock.now();
        f.clock.advance(Duration::from_millis(30));
        f.engine.handle_packet(packet(&route, node(2), 5, hello(start, 999, 1)));

        let out = sent(&mut f.outbound);
        assert_eq!(out[0].1.body, hello(start, 999, 2));
        let adjacency = f.engine.adjacencies.get(&node(2)).unwrap();
        assert_eq!(adjacency.metric(), 30 * MS);
        assert_eq!(adjacency.boot_time, 5);
        assert!(f.engine.pending_flood);
        assert_eq!(f.handle.table().adjacent(node(2)).unwrap(), route);
    }

    #[tokio::test]
    async fn test_hello_third_phase_measures_only() {
        let mut f = fixture(false);
        let route = f.route.clone();
        let echoed_at = f.clock.now();
        f.clock.advance(Duration::from_millis(12));
        f.engine.handle_packet(packet(&route, node(2), 5, hello(123, echoed_at, 2)));

        assert!(sent(&mut f.outbound).is_empty());
        assert_eq!(f.engine.adjacencies.get(&node(2)).unwrap().metric(), 12 * MS);
    }

    #[tokio::test]
    async fn test_bad_messages_are_violations() {
        let mut f = fixture(false);
        let route = f.route.clone();
        f.engine.handle_packet(packet(&route, node(2), 5, hello(1, 2, 3)));
        f.engine.handle_packet(RoutingPacket {
            route: route.clone(),
            payload: Bytes::from_static(&[9, 10, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0]),
        });
        f.engine.handle_packet(RoutingPacket {
            route: route.clone(),
            payload: Bytes::from_static(&[1, 10]),
        });
        assert_eq!(f.engine.violations, 3);
        assert!(f.engine.adjacencies.is_empty());
    }

    #[tokio::test]
    async fn test_own_hello_ignored() {
        let mut f = fixture(false);
        let route = f.route.clone();
        f.engine.handle_packet(packet(&route, node(1), 11, hello(1, 0, 0)));
        assert!(sent(&mut f.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_link_state_acked_on_inbound_route() {
        let mut f = fixture(false);
        let route = f.route.clone();
        let update = LinkStateUpdate {
            owner: node(7),
            version: 42,
            state: BTreeMap::from([(node(2), 3 * MS)]),
            name: "gamma".into(),
        };
        f.engine.handle_packet(packet(&route, node(2), 5, Body::LinkStateUpdate(update)));

        let out = sent(&mut f.outbound);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, route);
        assert_eq!(
            out[0].1.body,
            Body::LinkStateAck(LinkStateAck {
                owner: node(7),
                version: 42
            })
        );
        assert_eq!(f.engine.lsdb.get(&node(7)).unwrap().acked.get(&node(2)), Some(&5));
        assert_eq!(
            f.engine.neighbors(),
            vec![Neighbor {
                node: node(7),
                name: "gamma".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_self_owned_update_flagged() {
        let mut f = fixture(false);
        let route = f.route.clone();
        let forged = LinkStateUpdate {
            owner: node(1),
            version: u64::MAX,
            state: BTreeMap::new(),
            name: "alpha".into(),
        };
        f.engine.handle_packet(packet(&route, node(2), 5, Body::LinkStateUpdate(forged)));
        assert_eq!(f.engine.violations, 1);
        assert!(f.engine.lsdb.get(&node(1)).is_none());
        assert_eq!(f.engine.dump()["protocol_violations"], 1);
    }

    #[tokio::test]
    async fn test_flood_and_retransmit() {
        let mut f = fixture(false);
        let route = f.route.clone();
        let now = f.clock.now();
        f.engine.update_metric(node(2), 5, route.clone(), 20 * MS, now);
        f.engine.flood_link_state();
        assert!(!f.engine.pending_flood);

        let own = f.engine.lsdb.get(&node(1)).unwrap();
        assert_eq!(own.update.state.get(&node(2)), Some(&(20 * MS)));
        assert_eq!(own.update.name, "alpha");
        let first_version = own.update.version;

        f.engine.send_pending();
        let out = sent(&mut f.outbound);
        assert_eq!(out.len(), 1);
        let Body::LinkStateUpdate(update) = &out[0].1.body else {
            panic!("expected a link state update");
        };
        assert_eq!(update.owner, node(1));
        assert_eq!(update.state.len(), 1);

        // once acknowledged by the neighbor's current boot, nothing is resent
        f.engine.handle_packet(packet(
            &route,
            node(2),
            5,
            Body::LinkStateAck(LinkStateAck {
                owner: node(1),
                version: first_version,
            }),
        ));
        f.engine.send_pending();
        assert!(sent(&mut f.outbound).is_empty());

        // versions keep increasing even within the same wall-clock tick
        f.engine.flood_link_state();
        assert!(f.engine.lsdb.get(&node(1)).unwrap().update.version > first_version);
    }

    #[tokio::test]
    async fn test_leaf_advertises_empty_state() {
        let mut f = fixture(true);
        let route = f.route.clone();
        let now = f.clock.now();
        f.engine.update_metric(node(2), 5, route.clone(), 20 * MS, now);
        f.engine.flood_link_state();
        let other = LinkStateUpdate {
            owner: node(7),
            version: 1,
            state: BTreeMap::from([(node(8), 1)]),
            name: String::new(),
        };
        f.engine.lsdb.apply_update(node(9), 1, other, now);

        f.engine.send_pending();
        let updates: Vec<LinkStateUpdate> = sent(&mut f.outbound)
            .into_iter()
            .filter_map(|(_, m)| match m.body {
                Body::LinkStateUpdate(u) => Some(u),
                _ => None,
            })
            .collect();
        assert_eq!(updates.len(), 2);
        let own = updates.iter().find(|u| u.owner == node(1)).unwrap();
        assert!(own.state.is_empty());
        let forwarded = updates.iter().find(|u| u.owner == node(7)).unwrap();
        assert_eq!(forwarded.state.len(), 1);
        // the local database keeps the real state
        assert_eq!(f.engine.lsdb.get(&node(1)).unwrap().update.state.len(), 1);
    }

    #[tokio::test]
    async fn test_route_closure_and_sweep() {
        let mut f = fixture(false);
        let route = f.route.clone();
        let now = f.clock.now();
        f.engine.add_route(route.clone());
        f.engine.update_metric(node(2), 5, route.clone(), 20 * MS, now);
        f.engine.pending_flood = false;

        assert_eq!(f.engine.closures.len(), 1);

        route.link.cancel();
        let closed = f.engine.closures.next().await.unwrap();
        assert_eq!(closed, route.link_id());
        f.engine.handle_link_closed(closed);
        assert!(f.engine.hello_timers.is_empty());
        assert!(f.engine.watched_links.is_empty());
        assert!(f.engine.pending_flood);
        assert!(f.handle.table().adjacent(node(2)).is_err());

        f.engine.check_adjacencies();
        assert!(f.engine.adjacencies.is_empty());
        assert!(f.engine.adjacencies.metrics().values().all(|m| *m < MAX_METRIC));
    }

    #[tokio::test]
    async fn test_one_watcher_per_link() {
        let mut f = fixture(false);
        let link = f.route.link.clone();
        // a peer whose source address keeps changing
        for port in 0..1000u32 {
            let now = f.clock.now();
            let route = Route::new(link.clone(), LinkAddr::Memory(10_000 + port));
            f.engine.update_metric(node(2), 5, route, 20 * MS, now);
            f.clock.advance(Duration::from_secs(300));
            f.engine.check_adjacencies();
        }
        assert!(f.engine.adjacencies.is_empty());
        assert_eq!(f.engine.closures.len(), 1);

        // a route learned again does not add a watcher either
        let now = f.clock.now();
        f.engine.update_metric(node(2), 5, f.route.clone(), 20 * MS, now);
        f.engine.add_route(f.route.clone());
        assert_eq!(f.engine.closures.len(), 1);

        // closing the link drops every route on it
        let other = Route::new(link.clone(), LinkAddr::Memory(42));
        f.engine.update_metric(node(3), 6, other, 20 * MS, now);
        link.cancel();
        let closed = f.engine.closures.next().await.unwrap();
        f.engine.handle_link_closed(closed);
        assert!(f.handle.table().adjacent(node(2)).is_err());
        assert!(f.handle.table().adjacent(node(3)).is_err());
        assert!(f.engine.closures.is_empty());
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let f = fixture(false);
        let cancel = CancellationToken::new();
        let task = f.engine.spawn(cancel.clone());

        let dump = f.handle.dump().await.unwrap();
        assert_eq!(dump["node"], "10.0.0.1");
        assert_eq!(dump["name"], "alpha");
        assert!(f.handle.neighbors().await.unwrap().is_empty());

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(f.handle.dump().await, Err(RoutingError::EngineStopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_engines_converge() {
        let cancel = CancellationToken::new();
        let (a_link, b_link) = MemoryLink::pair(64);
        let a_route = Route::new(a_link.clone(), a_link.peer_addr());
        let b_route = Route::new(b_link.clone(), b_link.peer_addr());

        let spawn_engine = |n: u8, name: &str| {
            let (tx, rx) = mpsc::channel(64);
            let config = EngineConfig {
                node: node(n),
                name: name.into(),
                leaf: false,
                boot_time: n as u64,
            };
            let clock: Arc<dyn Clock> = Arc::new(mesh_topology::MonotonicClock);
            let (engine, handle) = ProtocolEngine::new(config, clock, tx);
            engine.spawn(cancel.clone());
            (handle, rx)
        };
        let (a, a_out) = spawn_engine(1, "alpha");
        let (b, b_out) = spawn_engine(2, "beta");

        // relay each engine's output into the other one's inbound queue
        let relay = |mut rx: mpsc::Receiver<RoutingPacket>, to: EngineHandle, route: Route| {
            tokio::spawn(async move {
                while let Some(p) = rx.recv().await {
                    let _ = to.inject(RoutingPacket {
                        route: route.clone(),
                        payload: p.payload,
                    });
                }
            })
        };
        relay(a_out, b.clone(), b_route.clone());
        relay(b_out, a.clone(), a_route.clone());

        a.add_route(a_route.clone()).await.unwrap();

        let mut converged = false;
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let a_knows = a.neighbors().await.unwrap();
            let b_knows = b.neighbors().await.unwrap();
            if a_knows.len() == 1 && b_knows.len() == 1 {
                assert_eq!(a_knows[0].name, "beta");
                assert_eq!(b_knows[0].name, "alpha");
                converged = true;
                break;
            }
        }
        assert!(converged, "engines did not exchange link states");
        assert_eq!(a.table().adjacent(node(2)).unwrap(), a_route);
        assert_eq!(b.table().adjacent(node(1)).unwrap(), b_route);
        cancel.cancel();
    }
}
