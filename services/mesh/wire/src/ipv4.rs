//! Minimal IPv4 header access for forwarding.
//!
//! Only the fields the forwarding path touches are exposed: source,
//! destination, TTL, and the header checksum.

use crate::NodeAddress;
use bytes::{BufMut, BytesMut};

/// Minimum IPv4 header length
pub const HEADER_LEN: usize = 20;
/// Offset of the TTL byte
pub const TTL_OFFSET: usize = 8;
/// Offset of the protocol byte
pub const PROTOCOL_OFFSET: usize = 9;
/// Offset of the header checksum
pub const CHECKSUM_OFFSET: usize = 10;
/// Offset of the source address
pub const SOURCE_OFFSET: usize = 12;
/// Offset of the destination address
pub const DESTINATION_OFFSET: usize = 16;

/// ICMP protocol number
pub const PROTOCOL_ICMP: u8 = 1;
/// ICMP Time Exceeded message type
pub const ICMP_TIME_EXCEEDED: u8 = 11;

const ICMP_HEADER_LEN: usize = 8;
const VERSION_IHL: u8 = 0x45;
const DEFAULT_TTL: u8 = 64;

/// Source address of an IPv4 packet
pub fn source(packet: &[u8]) -> Option<NodeAddress> {
    address_at(packet, SOURCE_OFFSET)
}

/// Destination address of an IPv4 packet
pub fn destination(packet: &[u8]) -> Option<NodeAddress> {
    address_at(packet, DESTINATION_OFFSET)
}

/// TTL of an IPv4 packet
pub fn ttl(packet: &[u8]) -> Option<u8> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    Some(packet[TTL_OFFSET])
}

fn address_at(packet: &[u8], offset: usize) -> Option<NodeAddress> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    let mut octets = [0u8; 4];
    octets.copy_from_slice(&packet[offset..offset + 4]);
    Some(NodeAddress(octets))
}

/// Internet checksum (RFC 1071) of `data`
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    !fold(sum)
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Overwrite one header byte and patch the checksum incrementally (RFC 1624).
///
/// Returns `false` without touching the packet if it has no full header or
/// `offset` falls outside it.
pub fn update_header_byte(packet: &mut [u8], offset: usize, value: u8) -> bool {
    if packet.len() < HEADER_LEN || offset >= HEADER_LEN {
        return false;
    }
    let word = offset & !1;
    let old = u16::from_be_bytes([packet[word], packet[word + 1]]);
    packet[offset] = value;
    let new = u16::from_be_bytes([packet[word], packet[word + 1]]);

    let current = u16::from_be_bytes([packet[CHECKSUM_OFFSET], packet[CHECKSUM_OFFSET + 1]]);
    let sum = (!current as u32) + (!old as u32) + new as u32;
    let patched = !fold(sum);
    packet[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&patched.to_be_bytes());
    true
}

/// Set the TTL and patch the header checksum
pub fn set_ttl(packet: &mut [u8], ttl: u8) -> bool {
    update_header_byte(packet, TTL_OFFSET, ttl)
}

/// Build an ICMP Time Exceeded reply from `from` to `to` quoting `packet`.
///
/// The quote is the offending packet's header plus its first 8 payload
/// bytes, or the whole packet when it is shorter than that.
pub fn time_exceeded(from: NodeAddress, to: NodeAddress, packet: &[u8]) -> BytesMut {
    let header_len = packet.first().map(|b| (b & 0x0f) as usize * 4).unwrap_or(0);
    let quote_len = (header_len + 8).min(packet.len());
    let total = HEADER_LEN + ICMP_HEADER_LEN + quote_len;

    let mut reply = BytesMut::with_capacity(total);
    reply.put_u8(VERSION_IHL);
    reply.put_u8(0);
    reply.put_u16(total as u16);
    reply.put_u32(0);
    reply.put_u8(DEFAULT_TTL);
    reply.put_u8(PROTOCOL_ICMP);
    reply.put_u16(0);
    from.encode(&mut reply);
    to.encode(&mut reply);

    reply.put_u8(ICMP_TIME_EXCEEDED);
    reply.put_u8(0);
    reply.put_u16(0);
    reply.put_u32(0);
    reply.put_slice(&packet[..quote_len]);

    let icmp_sum = checksum(&reply[HEADER_LEN..]);
    reply[HEADER_LEN + 2..HEADER_LEN + 4].copy_from_slice(&icmp_sum.to_be_bytes());
    let ip_sum = checksum(&reply[..HEADER_LEN]);
    reply[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&ip_sum.to_be_bytes());
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A UDP packet with a valid header checksum
    fn sample_packet(src: NodeAddress, dst: NodeAddress, ttl: u8) -> Vec<u8> {
        let mut packet = vec![
            0x45, 0x00, 0x00, 0x24, 0x1c, 0x46, 0x40, 0x00, ttl, 0x11, 0x00, 0x00,
        ];
        packet.extend_from_slice(&src.octets());
        packet.extend_from_slice(&dst.octets());
        packet.extend_from_slice(&[0x30, 0x39, 0x00, 0x35, 0x00, 0x10, 0x00, 0x00]);
        packet.extend_from_slice(b"abcdefgh");
        let sum = checksum(&packet[..HEADER_LEN]);
        packet[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_be_bytes());
        packet
    }

    fn a() -> NodeAddress {
        NodeAddress::new(10, 0, 0, 1)
    }

    fn b() -> NodeAddress {
        NodeAddress::new(10, 0, 0, 5)
    }

    #[test]
    fn test_header_fields() {
        let packet = sample_packet(a(), b(), 33);
        assert_eq!(source(&packet), Some(a()));
        assert_eq!(destination(&packet), Some(b()));
        assert_eq!(ttl(&packet), Some(33));
        assert_eq!(ttl(&packet[..10]), None);
        assert_eq!(checksum(&packet[..HEADER_LEN]), 0);
    }

    #[test]
    fn test_set_ttl_patches_checksum() {
        for start in [2u8, 64, 255] {
            let mut packet = sample_packet(a(), b(), start);
            assert!(set_ttl(&mut packet, start - 1));
            assert_eq!(ttl(&packet), Some(start - 1));
            assert_eq!(checksum(&packet[..HEADER_LEN]), 0);
        }
    }

    #[test]
    fn test_update_rejects_short_packet() {
        let mut packet = [0x45u8; 12];
        assert!(!set_ttl(&mut packet, 3));
        assert_eq!(packet, [0x45u8; 12]);
    }

    #[test]
    fn test_time_exceeded() {
        let packet = sample_packet(a(), b(), 1);
        let router = NodeAddress::new(10, 0, 0, 3);
        let reply = time_exceeded(router, a(), &packet);

        assert_eq!(reply.len(), HEADER_LEN + 8 + HEADER_LEN + 8);
        assert_eq!(source(&reply), Some(router));
        assert_eq!(destination(&reply), Some(a()));
        assert_eq!(reply[PROTOCOL_OFFSET], PROTOCOL_ICMP);
        assert_eq!(ttl(&reply), Some(64));
        assert_eq!(u16::from_be_bytes([reply[2], reply[3]]) as usize, reply.len());
        assert_eq!(checksum(&reply[..HEADER_LEN]), 0);
        assert_eq!(reply[HEADER_LEN], ICMP_TIME_EXCEEDED);
        assert_eq!(checksum(&reply[HEADER_LEN..]), 0);
        assert_eq!(&reply[HEADER_LEN + 8..], &packet[..HEADER_LEN + 8]);
    }

    #[test]
    fn test_time_exceeded_short_quote() {
        let packet = sample_packet(a(), b(), 1);
        let reply = time_exceeded(b(), a(), &packet[..24]);
        assert_eq!(reply.len(), HEADER_LEN + 8 + 24);
    }
}
