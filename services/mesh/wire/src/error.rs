//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer ended before a field could be read
    #[error("truncated message: need {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required by the next field
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// Unknown routing message type
    #[error("unknown type {0}")]
    UnknownType(u8),

    /// Node name is not NUL-terminated
    #[error("node name is not terminated")]
    MissingNameTerminator,

    /// Node name is not valid UTF-8
    #[error("node name is not valid utf-8")]
    InvalidName,

    /// Frame is shorter than its fixed-size part
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    /// Node address could not be parsed
    #[error("invalid node address {0:?}")]
    InvalidAddress(String),
}
