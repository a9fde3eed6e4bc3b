//! Static routes for destinations outside the overlay subnet.
//!
//! Each entry reads `"<cidr|ip> via <overlay ip>"`; a bare IP is a /32.
//! Lookups match the longest prefix first.

use crate::RoutingError;
use ipnetwork::Ipv4Network;
use mesh_wire::NodeAddress;
use std::net::Ipv4Addr;

/// One static route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixRoute {
    /// Matched destinations
    pub prefix: Ipv4Network,
    /// Overlay node that egresses them
    pub via: NodeAddress,
}

/// Longest-prefix-first static route table
#[derive(Debug, Clone, Default)]
pub struct PrefixTable {
    routes: Vec<PrefixRoute>,
}

impl PrefixTable {
    /// Parse route entries; every `via` must lie inside `subnet`
    pub fn parse<S: AsRef<str>>(subnet: Ipv4Network, entries: &[S]) -> Result<Self, RoutingError> {
        let mut routes = entries
            .iter()
            .map(|entry| parse_entry(subnet, entry.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        routes.sort_by(|a, b| b.prefix.prefix().cmp(&a.prefix.prefix()));
        Ok(Self { routes })
    }

    /// Overlay node responsible for `dst`
    pub fn lookup(&self, dst: NodeAddress) -> Option<NodeAddress> {
        let dst = Ipv4Addr::from(dst);
        self.routes
            .iter()
            .find(|route| route.prefix.contains(dst))
            .map(|route| route.via)
    }

    /// Routes, longest prefix first
    pub fn routes(&self) -> &[PrefixRoute] {
        &self.routes
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn parse_entry(subnet: Ipv4Network, entry: &str) -> Result<PrefixRoute, RoutingError> {
    let invalid = || RoutingError::InvalidRoute(entry.to_string());
    let mut parts = entry.split_whitespace();
    let (Some(target), Some("via"), Some(via), None) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
        return Err(invalid());
    };

    let prefix = if target.contains('/') {
        target.parse::<Ipv4Network>().map_err(|_| invalid())?
    } else {
        let host: Ipv4Addr = target.parse().map_err(|_| invalid())?;
        Ipv4Network::new(host, 32).map_err(|_| invalid())?
    };
    let via: Ipv4Addr = via.parse().map_err(|_| invalid())?;
    if !subnet.contains(via) {
        return Err(RoutingError::InvalidRoute(format!(
            "{}: {} is outside {}",
            entry, via, subnet
        )));
    }
    Ok(PrefixRoute {
        prefix,
        via: NodeAddress::from(via),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet() -> Ipv4Network {
        "10.0.0.0/24".parse().unwrap()
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = PrefixTable::parse(
            subnet(),
            &[
                "0.0.0.0/0 via 10.0.0.1",
                "192.168.0.0/16 via 10.0.0.2",
                "192.168.7.9 via 10.0.0.3",
            ],
        )
        .unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.routes()[0].prefix.prefix(), 32);

        let lookup = |ip: &str| table.lookup(ip.parse::<Ipv4Addr>().unwrap().into());
        assert_eq!(lookup("192.168.7.9"), Some(NodeAddress::new(10, 0, 0, 3)));
        assert_eq!(lookup("192.168.7.10"), Some(NodeAddress::new(10, 0, 0, 2)));
        assert_eq!(lookup("8.8.8.8"), Some(NodeAddress::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_empty_table() {
        let table = PrefixTable::parse::<&str>(subnet(), &[]).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.lookup(NodeAddress::new(8, 8, 8, 8)), None);
    }

    #[test]
    fn test_invalid_entries() {
        for entry in [
            "10.10.0.0/16",
            "10.10.0.0/16 through 10.0.0.2",
            "10.10.0.0/33 via 10.0.0.2",
            "bogus via 10.0.0.2",
            "10.10.0.0/16 via 10.0.0.2 extra",
        ] {
            assert!(
                matches!(PrefixTable::parse(subnet(), &[entry]), Err(RoutingError::InvalidRoute(_))),
                "accepted {:?}",
                entry
            );
        }
        let err = PrefixTable::parse(subnet(), &["10.10.0.0/16 via 172.16.0.1"]).unwrap_err();
        assert!(err.to_string().contains("outside"));
    }
}
