//! Inter-node frame tail.
//!
//! Every payload sent over a link carries a 9-byte tail appended after the
//! payload and before encryption:
//!
//! ```text
//! [flags:u8][dst:4B][via:4B]
//! ```
//!
//! The low nibble of `flags` is the hop limit; bit `0x10` marks routing
//! control traffic.

use crate::{NodeAddress, WireError};
use bitflags::bitflags;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Size of the frame tail in bytes
pub const TAIL_SIZE: usize = 9;

/// Hop limit of a freshly originated frame
pub const DEFAULT_HOP_LIMIT: u8 = 0x0f;

bitflags! {
    /// Frame flags byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FrameFlags: u8 {
        /// Payload is a routing protocol message
        const ROUTING = 0x10;
        /// Hop limit nibble
        const HOP_LIMIT = 0x0f;
    }
}

impl FrameFlags {
    /// Flags for a freshly originated data frame
    pub fn data() -> Self {
        Self::HOP_LIMIT
    }

    /// Flags for a routing protocol frame
    pub fn routing() -> Self {
        Self::ROUTING | Self::HOP_LIMIT
    }

    /// Whether the frame carries routing control traffic
    pub fn is_routing(&self) -> bool {
        self.contains(Self::ROUTING)
    }

    /// Remaining hop limit
    pub fn hop_limit(&self) -> u8 {
        self.bits() & Self::HOP_LIMIT.bits()
    }

    /// Flags with the hop limit reduced by one, other bits untouched
    pub fn decrement_hop_limit(self) -> Self {
        let hops = self.hop_limit().saturating_sub(1);
        Self::from_bits_retain((self.bits() & !Self::HOP_LIMIT.bits()) | hops)
    }
}

/// Decoded frame tail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTail {
    /// Flags and hop limit
    pub flags: FrameFlags,
    /// Final destination
    pub dst: NodeAddress,
    /// Pinned intermediate hop, or empty
    pub via: NodeAddress,
}

impl FrameTail {
    /// Create a tail
    pub fn new(flags: FrameFlags, dst: NodeAddress, via: NodeAddress) -> Self {
        Self { flags, dst, via }
    }

    /// Append the tail after the payload in `buf`
    pub fn append(&self, buf: &mut BytesMut) {
        buf.reserve(TAIL_SIZE);
        buf.put_u8(self.flags.bits());
        self.dst.encode(buf);
        self.via.encode(buf);
    }

    /// Remove the tail from the end of `frame`, leaving only the payload
    pub fn split_from(frame: &mut BytesMut) -> Result<Self, WireError> {
        if frame.len() < TAIL_SIZE {
            return Err(WireError::TooShort(frame.len()));
        }
        let tail = frame.split_off(frame.len() - TAIL_SIZE);
        let mut octets = [0u8; 4];
        octets.copy_from_slice(&tail[1..5]);
        let dst = NodeAddress(octets);
        octets.copy_from_slice(&tail[5..9]);
        let via = NodeAddress(octets);
        Ok(Self {
            flags: FrameFlags::from_bits_retain(tail[0]),
            dst,
            via,
        })
    }
}
