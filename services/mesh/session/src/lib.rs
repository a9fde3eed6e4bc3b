//! Links, ciphers, tunnels and the connection layer of the mesh VPN.
//!
//! This crate provides the I/O edges the routing core plugs into:
//!
//! - **Links**: datagram transports behind the [`Link`] trait (UDP and an
//!   in-process pair for tests)
//! - **Ciphers**: AEAD sealing of whole frames with a per-frame nonce
//! - **Tunnels**: the local packet source and sink behind [`Tunnel`]
//! - **Connection**: framing, sealing, per-link receive loops feeding one
//!   bounded queue, and hop-limit/TTL aware forwarding
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_session::{CipherKind, Connection, LinkCipher, UdpLink};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cancel = CancellationToken::new();
//! let cipher = Arc::new(LinkCipher::new(CipherKind::AesGcm, "000102030405060708090a0b0c0d0e0f")?);
//! let (connection, mut inbound) = Connection::new(cipher, cancel.clone());
//!
//! let link = UdpLink::bind("0.0.0.0:5000".parse()?, None, &cancel).await?;
//! connection.add_link(Arc::new(link));
//!
//! while let Some(packet) = inbound.recv().await {
//!     println!("{} bytes for {} via {}", packet.payload.len(), packet.dst, packet.route);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cipher;
pub mod connection;
pub mod error;
pub mod transport;
pub mod tunnel;

// Re-export main types
pub use cipher::{CipherKind, LinkCipher};
pub use connection::{Connection, ForwardOutcome, Packet, QUEUE_CAPACITY};
pub use error::{CipherError, LinkError, TunnelError};
pub use transport::{Link, LinkAddr, MemoryLink, Route, UdpLink};
pub use tunnel::{ChannelTunnel, Tunnel, TunnelPeer, UdpTunnel};
