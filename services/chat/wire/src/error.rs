//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors.
///
/// Every variant is a structural violation: callers drop the offending
/// bytes silently and never surface these to the application layer.
#[derive(Error, Debug)]
pub enum WireError {
    /// Truncated packet (shorter than the fixed header)
    #[error("truncated packet")]
    Truncated,

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Unknown message type
    #[error("unknown type {0}")]
    Type(u8),

    /// TTL outside 0..=7
    #[error("ttl out of range: {0}")]
    Ttl(u8),

    /// Unknown flag bits set
    #[error("unknown flag bits: {0:#04x}")]
    Flags(u8),

    /// Declared payload length does not match the remaining bytes
    #[error("payload length mismatch (declared {declared}, found {found})")]
    Length {
        /// Length byte carried in the header
        declared: u8,
        /// Low byte of the actual remaining payload
        found: u8,
    },

    /// Payload exceeds the absolute message size limit
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Type-specific payload is malformed or too short
    #[error("malformed {0} payload")]
    Payload(&'static str),

    /// Fragment sequence or total is inconsistent
    #[error("invalid fragment geometry (sequence {sequence}, total {total})")]
    FragmentGeometry {
        /// 0-based fragment sequence number
        sequence: u16,
        /// Declared fragment count
        total: u16,
    },
}
