//! Configuration handling for the mesh daemon.
//!
//! Settings are read from a YAML file, then overridden by `MESH_*`
//! environment variables and finally by command line flags. Everything is
//! validated up front so a bad address or secret stops the process before
//! any link or engine is started.

use anyhow::{bail, Context, Result};
use ipnetwork::{IpNetwork, Ipv4Network};
use mesh_routing::PrefixTable;
use mesh_session::{CipherKind, LinkCipher};
use mesh_wire::NodeAddress;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Default MTU of the local tunnel
pub const DEFAULT_MTU: u16 = 1400;

/// Mesh daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MeshConfig {
    /// Name advertised to the rest of the mesh
    pub name: String,
    /// Own overlay address with the overlay prefix length, e.g. `10.0.0.1/24`
    pub cidr: String,
    /// Default node for destinations outside the overlay
    pub gateway: Option<String>,
    /// Static routes, `"<cidr|ip> via <overlay ip>"`
    pub routes: Vec<String>,
    /// Never carry transit traffic
    pub leaf: bool,
    /// Tunnel MTU
    pub mtu: u16,
    /// Hex link key; empty disables encryption
    pub secret: String,
    /// Link cipher family
    pub cipher: CipherKind,
    /// UDP links
    pub links: Vec<LinkConfig>,
    /// UDP bridge to the TUN helper
    pub tunnel: TunnelConfig,
    /// Log the routing state this often, e.g. `30s`
    pub dump_interval: Option<String>,
}

/// One UDP link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    /// Local bind address
    pub listen: SocketAddr,
    /// Peer to send Hellos to; listen-only when absent
    #[serde(default)]
    pub dial: Option<SocketAddr>,
}

/// UDP bridge to the process owning the TUN device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelConfig {
    /// Local bind address
    pub listen: SocketAddr,
    /// Address of the TUN helper
    pub peer: SocketAddr,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7400)),
            peer: SocketAddr::from(([127, 0, 0, 1], 7401)),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            name: "mesh".to_string(),
            cidr: "10.0.0.1/24".to_string(),
            gateway: None,
            routes: Vec::new(),
            leaf: false,
            mtu: DEFAULT_MTU,
            secret: String::new(),
            cipher: CipherKind::default(),
            links: Vec::new(),
            tunnel: TunnelConfig::default(),
            dump_interval: None,
        }
    }
}

/// Validated settings derived from a [`MeshConfig`]
#[derive(Debug)]
pub struct NodeSettings {
    /// Own overlay address
    pub node: NodeAddress,
    /// Overlay subnet
    pub subnet: Ipv4Network,
    /// Default gateway node
    pub gateway: Option<NodeAddress>,
    /// Parsed static routes
    pub static_routes: PrefixTable,
    /// Link cipher built from the secret
    pub cipher: LinkCipher,
    /// Interval of the periodic state dump
    pub dump_interval: Option<Duration>,
}

impl MeshConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing file falls back to defaults; an unreadable or malformed one
    /// is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {:?}", path))?;
            let config = serde_yaml::from_str::<MeshConfig>(&content)
                .with_context(|| format!("failed to parse config file {:?}", path))?;
            info!("Loaded configuration from {:?}", path);
            config
        } else {
            warn!("Config file {:?} not found, using defaults", path);
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;

        info!(
            "Mesh configuration: name={}, cidr={}, leaf={}, links={}, cipher={:?}",
            config.name,
            config.cidr,
            config.leaf,
            config.links.len(),
            config.cipher
        );
        Ok(config)
    }

    /// Apply `MESH_*` overrides looked up through `lookup`
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("MESH_NAME") {
            info!("Name overridden by environment: {}", name);
            self.name = name;
        }
        if let Some(cidr) = lookup("MESH_CIDR") {
            info!("CIDR overridden by environment: {}", cidr);
            self.cidr = cidr;
        }
        if let Some(gateway) = lookup("MESH_GATEWAY") {
            info!("Gateway overridden by environment: {}", gateway);
            self.gateway = Some(gateway).filter(|g| !g.is_empty());
        }
        if let Some(secret) = lookup("MESH_SECRET") {
            info!("Secret overridden by environment");
            self.secret = secret;
        }
        if let Some(leaf) = lookup("MESH_LEAF") {
            self.leaf = leaf
                .parse()
                .with_context(|| format!("MESH_LEAF must be true or false, got {:?}", leaf))?;
        }
        if let Some(mtu) = lookup("MESH_MTU") {
            self.mtu = mtu
                .parse()
                .with_context(|| format!("MESH_MTU must be a number, got {:?}", mtu))?;
        }
        Ok(())
    }

    /// Check every field and derive the runtime settings
    pub fn validate(&self) -> Result<NodeSettings> {
        let network: IpNetwork = self
            .cidr
            .parse()
            .with_context(|| format!("invalid cidr {:?}", self.cidr))?;
        let IpNetwork::V4(network) = network else {
            bail!("cidr {} is IPv6; only IPv4 overlays are supported", self.cidr);
        };
        let own = network.ip();
        if own.is_unspecified() || own == network.network() {
            bail!("cidr {} must name this node's own address", self.cidr);
        }
        let subnet = Ipv4Network::new(network.network(), network.prefix())
            .with_context(|| format!("invalid cidr {:?}", self.cidr))?;

        let gateway = match self.gateway.as_deref() {
            None => None,
            Some(raw) => {
                let addr: Ipv4Addr = raw
                    .parse()
                    .with_context(|| format!("invalid gateway {:?}", raw))?;
                if !subnet.contains(addr) {
                    bail!("gateway {} is outside the overlay {}", addr, subnet);
                }
                Some(NodeAddress::from(addr))
            }
        };

        let static_routes =
            PrefixTable::parse(subnet, &self.routes).context("invalid static route")?;
        let cipher = LinkCipher::new(self.cipher, &self.secret).context("invalid secret")?;

        let dump_interval = match self.dump_interval.as_deref() {
            None => None,
            Some(raw) => Some(
                humantime::parse_duration(raw)
                    .with_context(|| format!("invalid dump_interval {:?}", raw))?,
            ),
        };

        if self.mtu < 576 {
            bail!("mtu {} is below the IPv4 minimum of 576", self.mtu);
        }

        Ok(NodeSettings {
            node: NodeAddress::from(own),
            subnet,
            gateway,
            static_routes,
            cipher,
            dump_interval,
        })
    }
}
