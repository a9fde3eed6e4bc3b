//! Session layer error types.

use thiserror::Error;

/// Link transport errors
#[derive(Error, Debug)]
pub enum LinkError {
    /// Underlying socket failure
    #[error("link io: {0}")]
    Io(#[from] std::io::Error),

    /// Link was closed locally or by its peer
    #[error("link closed")]
    Closed,

    /// Address family does not belong to this link
    #[error("address {0} is not reachable over this link")]
    AddressMismatch(String),
}

/// Cipher errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Secret is not valid hex
    #[error("secret is not valid hex")]
    InvalidSecret,

    /// Secret has the wrong length for the cipher
    #[error("invalid key length {actual} for {cipher}")]
    KeyLength {
        /// Cipher name
        cipher: &'static str,
        /// Decoded key length in bytes
        actual: usize,
    },

    /// Ciphertext shorter than the nonce and tag
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    /// Authentication tag did not verify
    #[error("authentication failed")]
    Authentication,

    /// Sealing failed
    #[error("encryption failed")]
    Encryption,
}

/// Tunnel device errors
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Underlying socket failure
    #[error("tunnel io: {0}")]
    Io(#[from] std::io::Error),

    /// Tunnel was closed
    #[error("tunnel closed")]
    Closed,
}
