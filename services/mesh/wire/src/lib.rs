//! Wire formats for the mesh VPN.
//!
//! This crate provides the byte-level formats shared by every node:
//!
//! - **Node addresses**: 4-byte overlay identifiers rendered as IPv4 addresses
//! - **Routing messages**: Hello, LinkStateUpdate and LinkStateAck codec
//! - **Frame tail**: flags, destination and via-hint appended to every payload
//! - **IPv4 helpers**: header field access, incremental checksum updates and
//!   ICMP Time Exceeded construction
//!
//! ## Link Frame
//!
//! ```text
//! +----------------------+----------------------------+
//! | payload              | IP packet or routing msg   |
//! +----------------------+----------------------------+
//! | flags (1B)           | hop limit + routing bit    |
//! +----------------------+----------------------------+
//! | dst (4B)             | final destination          |
//! +----------------------+----------------------------+
//! | via (4B)             | pinned intermediate hop    |
//! +----------------------+----------------------------+
//! ```
//!
//! The whole frame is then sealed by the link cipher.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod error;
pub mod frame;
pub mod ipv4;
pub mod message;

// Re-export main types
pub use address::{NodeAddress, NODE_ADDRESS_SIZE};
pub use error::WireError;
pub use frame::{FrameFlags, FrameTail, DEFAULT_HOP_LIMIT, TAIL_SIZE};
pub use message::{
    Body, Hello, LinkStateAck, LinkStateUpdate, Message, MessageType, MESSAGE_HEADER_SIZE,
};
