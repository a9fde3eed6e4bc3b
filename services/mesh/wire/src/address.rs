//! Overlay node addresses.

use crate::WireError;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Size of an encoded node address
pub const NODE_ADDRESS_SIZE: usize = 4;

/// A node identifier inside the overlay, rendered as an IPv4 address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct NodeAddress(pub [u8; 4]);

impl NodeAddress {
    /// The all-zero address, used as "no address" in frame tails
    pub const EMPTY: NodeAddress = NodeAddress([0; 4]);

    /// Create an address from its four octets
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    /// Whether this is the all-zero address
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Raw octets
    pub fn octets(&self) -> [u8; 4] {
        self.0
    }

    /// Read an address from the front of `buf`
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        if buf.remaining() < NODE_ADDRESS_SIZE {
            return Err(WireError::Truncated {
                needed: NODE_ADDRESS_SIZE,
                available: buf.remaining(),
            });
        }
        let mut octets = [0u8; 4];
        buf.copy_to_slice(&mut octets);
        Ok(Self(octets))
    }

    /// Append the address to `buf`
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.0);
    }
}

impl From<Ipv4Addr> for NodeAddress {
    fn from(ip: Ipv4Addr) -> Self {
        Self(ip.octets())
    }
}

impl From<NodeAddress> for Ipv4Addr {
    fn from(addr: NodeAddress) -> Self {
        Ipv4Addr::from(addr.0)
    }
}

impl From<[u8; 4]> for NodeAddress {
    fn from(octets: [u8; 4]) -> Self {
        Self(octets)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for NodeAddress {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<Ipv4Addr>()
            .map(Self::from)
            .map_err(|_| WireError::InvalidAddress(s.to_string()))
    }
}

impl From<NodeAddress> for String {
    fn from(addr: NodeAddress) -> Self {
        addr.to_string()
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = WireError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let addr: NodeAddress = "10.0.0.5".parse().unwrap();
        assert_eq!(addr, NodeAddress::new(10, 0, 0, 5));
        assert_eq!(addr.to_string(), "10.0.0.5");
        assert!("10.0.0".parse::<NodeAddress>().is_err());
        assert!("::1".parse::<NodeAddress>().is_err());
    }

    #[test]
    fn test_empty_address() {
        assert!(NodeAddress::EMPTY.is_empty());
        assert!(NodeAddress::default().is_empty());
        assert!(!NodeAddress::new(0, 0, 0, 1).is_empty());
    }

    #[test]
    fn test_serde_as_string() {
        let addr = NodeAddress::new(192, 168, 1, 7);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"192.168.1.7\"");
        let back: NodeAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_decode_truncated() {
        let mut buf: &[u8] = &[10, 0, 0];
        assert_eq!(
            NodeAddress::decode(&mut buf),
            Err(WireError::Truncated {
                needed: 4,
                available: 3
            })
        );
    }
}
