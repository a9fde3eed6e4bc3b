//! Mesh VPN node binary.
//!
//! Wires UDP links, the link cipher, the protocol engine, the router and the
//! tunnel bridge into one session, then waits for a signal. SIGHUP reloads
//! the default gateway from the configuration file.

use anyhow::{Context, Result};
use clap::Parser;
use mesh_routing::{
    EngineConfig, EngineHandle, ProtocolEngine, Router, RouterConfig, ENGINE_QUEUE_CAPACITY,
};
use mesh_session::{Connection, Link, Route, Tunnel, UdpLink, UdpTunnel};
use mesh_topology::{wall_nanos, MonotonicClock};
use mesh_wire::TAIL_SIZE;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::MeshConfig;
use logging::MeshLogFormatter;

/// Mesh VPN node
#[derive(Parser, Debug)]
#[command(name = "vpnmesh", version, about = "Mesh VPN node with latency-driven routing")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "mesh.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Node name, overrides the configuration file
    #[arg(long)]
    name: Option<String>,

    /// Run as a leaf that never carries transit traffic
    #[arg(long)]
    leaf: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut env_filter = EnvFilter::new("info");
    for target in ["vpnmesh", "mesh_wire", "mesh_session", "mesh_topology", "mesh_routing"] {
        env_filter = env_filter.add_directive(format!("{}={}", target, args.log_level).parse()?);
    }
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(MeshLogFormatter::new("vpnmesh"))
        .init();

    info!("Starting vpnmesh v{}", env!("CARGO_PKG_VERSION"));

    let mut config = MeshConfig::load_from_file(&args.config)?;
    if let Some(name) = args.name.clone() {
        config.name = name;
    }
    config.leaf |= args.leaf;
    let settings = config.validate().context("invalid configuration")?;

    let cancel = CancellationToken::new();
    let boot_time = wall_nanos();
    let cipher = Arc::new(settings.cipher);
    info!(
        "Node {} ({}) in {}, cipher {:?}, mtu {}",
        settings.node, config.name, settings.subnet, cipher, config.mtu
    );

    let tunnel: Arc<dyn Tunnel> = Arc::new(
        UdpTunnel::bind(config.tunnel.listen, config.tunnel.peer)
            .await
            .with_context(|| format!("failed to bind tunnel bridge on {}", config.tunnel.listen))?,
    );

    let (connection, from_links) = Connection::new(cipher.clone(), cancel.clone());
    let connection = Arc::new(connection);

    let (engine_tx, engine_rx) = mpsc::channel(ENGINE_QUEUE_CAPACITY);
    let (engine, engine_handle) = ProtocolEngine::new(
        EngineConfig {
            node: settings.node,
            name: config.name.clone(),
            leaf: config.leaf,
            boot_time,
        },
        Arc::new(MonotonicClock),
        engine_tx,
    );
    let engine_task = engine.spawn(cancel.clone());

    let router = Router::new(
        RouterConfig {
            node: settings.node,
            subnet: settings.subnet,
            gateway: settings.gateway,
            static_routes: settings.static_routes,
        },
        connection.clone(),
        tunnel.clone(),
        engine_handle.clone(),
    );
    let (router_handle, router_task) = router.spawn(from_links, engine_rx, cancel.clone());

    let mut link_tasks: Vec<JoinHandle<()>> = Vec::new();
    for link_config in &config.links {
        let link = UdpLink::bind(link_config.listen, link_config.dial, &cancel)
            .await
            .with_context(|| format!("failed to bind link on {}", link_config.listen))?;
        let link: Arc<dyn Link> = Arc::new(link);
        let framing = link.overhead() + (cipher.overhead() + TAIL_SIZE) as i32;
        if framing >= config.mtu as i32 {
            component_warn!(
                "link",
                "Link on {} leaves no room for payload at mtu {}",
                link_config.listen,
                config.mtu
            );
        }
        link_tasks.push(connection.add_link(link.clone()));
        if let Some(peer) = link.peer() {
            engine_handle.add_route(Route::new(link, peer)).await?;
        }
    }

    let dump_task = settings
        .dump_interval
        .map(|every| spawn_state_dump(engine_handle.clone(), every, cancel.clone()));

    component_info!("node", "Mesh node started with {} links", link_tasks.len());

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = cancel.cancelled() => {
                warn!("Session cancelled, shutting down");
                break;
            }
            _ = sighup.recv() => {
                match reload_gateway(&args.config) {
                    Ok(gateway) => {
                        if let Err(e) = router_handle.update_gateway(gateway).await {
                            component_error!("node", "Failed to update gateway: {}", e);
                        }
                    }
                    Err(e) => component_error!("node", "Ignoring configuration reload: {:#}", e),
                }
            }
        }
    }

    // Consumers stop before the sockets they read from are dropped.
    cancel.cancel();
    if let Err(e) = router_task.await {
        warn!("Router task failed: {}", e);
    }
    if let Err(e) = engine_task.await {
        warn!("Engine task failed: {}", e);
    }
    if let Some(task) = dump_task {
        let _ = task.await;
    }
    for task in link_tasks {
        let _ = task.await;
    }
    tunnel.close();

    info!("Mesh node shutdown complete");
    Ok(())
}

/// Re-read the configuration file and return the validated gateway
fn reload_gateway(path: &Path) -> Result<Option<mesh_wire::NodeAddress>> {
    let config = MeshConfig::load_from_file(path)?;
    Ok(config.validate()?.gateway)
}

fn spawn_state_dump(
    engine: EngineHandle,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match engine.dump().await {
                        Ok(dump) => component_info!("dump", "{}", dump),
                        Err(e) => {
                            component_warn!("dump", "State dump unavailable: {}", e);
                            break;
                        }
                    }
                    if let Ok(neighbors) = engine.neighbors().await {
                        let names: Vec<String> = neighbors
                            .iter()
                            .map(|n| format!("{}={}", n.name, n.node))
                            .collect();
                        component_info!("dump", "Known nodes: [{}]", names.join(", "));
                    }
                }
            }
        }
    })
}
