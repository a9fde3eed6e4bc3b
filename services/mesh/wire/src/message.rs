//! Routing protocol messages.
//!
//! Every message starts with a fixed header followed by a type-specific body.
//! Integers are little-endian and fields are packed without padding.
//!
//! ```text
//! header:          [type:u8][src:4B][boot_time:u64]
//! Hello:           [time1:u64][time2:u64][forwarded:u8]
//! LinkStateUpdate: [owner:4B][version:u64][count:u16]{[neighbor:4B][metric:u64]}*[name..][0]
//! LinkStateAck:    [owner:4B][version:u64]
//! ```

use crate::{NodeAddress, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Size of the common message header
pub const MESSAGE_HEADER_SIZE: usize = 1 + 4 + 8;

/// Routing message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Latency probe
    Hello = 1,
    /// Flooded link state of one node
    LinkStateUpdate = 4,
    /// Acknowledgment of a link state update
    LinkStateAck = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Hello),
            4 => Ok(MessageType::LinkStateUpdate),
            5 => Ok(MessageType::LinkStateAck),
            _ => Err(WireError::UnknownType(value)),
        }
    }
}

/// Three-phase latency probe.
///
/// `forwarded` counts how many times the probe has been echoed: 0 when first
/// sent, 1 when the receiver echoes it back with `time2` stamped, 2 when the
/// originator echoes it a final time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    /// Originator's monotonic send time
    pub time1: u64,
    /// Responder's monotonic receive time
    pub time2: u64,
    /// Echo counter
    pub forwarded: u8,
}

/// Link state advertised by one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStateUpdate {
    /// Node the state belongs to
    pub owner: NodeAddress,
    /// Owner's wall-clock nanoseconds at flood time
    pub version: u64,
    /// Metric from the owner to each of its adjacencies
    pub state: BTreeMap<NodeAddress, u64>,
    /// Owner's human readable name
    pub name: String,
}

/// Acknowledgment of one `(owner, version)` link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStateAck {
    /// Owner of the acknowledged state
    pub owner: NodeAddress,
    /// Acknowledged version
    pub version: u64,
}

/// Type-specific part of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Latency probe
    Hello(Hello),
    /// Link state flood
    LinkStateUpdate(LinkStateUpdate),
    /// Link state acknowledgment
    LinkStateAck(LinkStateAck),
}

impl Body {
    /// Wire type of this body
    pub fn message_type(&self) -> MessageType {
        match self {
            Body::Hello(_) => MessageType::Hello,
            Body::LinkStateUpdate(_) => MessageType::LinkStateUpdate,
            Body::LinkStateAck(_) => MessageType::LinkStateAck,
        }
    }
}

/// A routing message together with its sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Immediate sender (not necessarily the owner of a flooded state)
    pub src: NodeAddress,
    /// Sender's process start time, used to detect restarts
    pub boot_time: u64,
    /// Message body
    pub body: Body,
}

impl Message {
    /// Create a message from `src`
    pub fn new(src: NodeAddress, boot_time: u64, body: Body) -> Self {
        Self {
            src,
            boot_time,
            body,
        }
    }

    /// Encode into `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.body.message_type() as u8);
        self.src.encode(buf);
        buf.put_u64_le(self.boot_time);

        match &self.body {
            Body::Hello(hello) => {
                buf.put_u64_le(hello.time1);
                buf.put_u64_le(hello.time2);
                buf.put_u8(hello.forwarded);
            }
            Body::LinkStateUpdate(update) => {
                update.owner.encode(buf);
                buf.put_u64_le(update.version);
                // The count field is 16 bits wide; a node never has that many adjacencies.
                let count = update.state.len().min(u16::MAX as usize);
                buf.put_u16_le(count as u16);
                for (neighbor, metric) in update.state.iter().take(count) {
                    neighbor.encode(buf);
                    buf.put_u64_le(*metric);
                }
                let name = update.name.split('\0').next().unwrap_or_default();
                buf.put_slice(name.as_bytes());
                buf.put_u8(0);
            }
            Body::LinkStateAck(ack) => {
                ack.owner.encode(buf);
                buf.put_u64_le(ack.version);
            }
        }
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a message, rejecting unknown types and truncated bodies
    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        ensure(&buf, MESSAGE_HEADER_SIZE)?;
        let typ = MessageType::try_from(buf.get_u8())?;
        let src = NodeAddress::decode(&mut buf)?;
        let boot_time = buf.get_u64_le();

        let body = match typ {
            MessageType::Hello => {
                ensure(&buf, 8 + 8 + 1)?;
                Body::Hello(Hello {
                    time1: buf.get_u64_le(),
                    time2: buf.get_u64_le(),
                    forwarded: buf.get_u8(),
                })
            }
            MessageType::LinkStateUpdate => {
                let owner = NodeAddress::decode(&mut buf)?;
                ensure(&buf, 8 + 2)?;
                let version = buf.get_u64_le();
                let count = buf.get_u16_le() as usize;
                ensure(&buf, count * 12)?;
                let mut state = BTreeMap::new();
                for _ in 0..count {
                    let neighbor = NodeAddress::decode(&mut buf)?;
                    state.insert(neighbor, buf.get_u64_le());
                }
                let end = buf
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or(WireError::MissingNameTerminator)?;
                let name = std::str::from_utf8(&buf[..end])
                    .map_err(|_| WireError::InvalidName)?
                    .to_string();
                Body::LinkStateUpdate(LinkStateUpdate {
                    owner,
                    version,
                    state,
                    name,
                })
            }
            MessageType::LinkStateAck => {
                let owner = NodeAddress::decode(&mut buf)?;
                ensure(&buf, 8)?;
                Body::LinkStateAck(LinkStateAck {
                    owner,
                    version: buf.get_u64_le(),
                })
            }
        };

        Ok(Self {
            src,
            boot_time,
            body,
        })
    }
}

fn ensure(buf: &&[u8], needed: usize) -> Result<(), WireError> {
    if buf.len() < needed {
        return Err(WireError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}
