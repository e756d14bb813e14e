//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
///
/// Every variant means the byte stream can no longer be trusted; the caller
/// is expected to close the connection rather than resynchronise.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Unknown message kind
    #[error("unknown kind {0}")]
    Kind(u8),

    /// Invalid CBOR metadata
    #[error("cbor meta invalid")]
    Meta,

    /// Metadata could not be encoded
    #[error("cbor meta encoding failed")]
    MetaEncode,

    /// Malformed frame structure
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}
