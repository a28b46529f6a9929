//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Structural errors raised while encoding or decoding log messages.
///
/// None of these involve keys or state: a message that fails here is
/// malformed no matter which contract state it is applied to.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Raw message exceeds [`crate::message::MAX_MESSAGE_SIZE`].
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Actual size in bytes
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Protocol version not supported by this implementation.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// Unknown operation type code.
    #[error("unknown operation type: {0:?}")]
    UnknownOpType(String),

    /// Head fields contradict each other or the operation value.
    #[error("inconsistent message head: {0}")]
    InconsistentHead(String),

    /// Identifier is not a valid lowercase hex digest.
    #[error("invalid hash {value:?}: {reason}")]
    InvalidHash {
        /// Offending value
        value: String,
        /// What is wrong with it
        reason: &'static str,
    },

    /// Permission string does not parse.
    #[error("invalid permission: {0:?}")]
    InvalidPermission(String),

    /// Foreign key reference does not parse.
    #[error("invalid foreign key reference: {0:?}")]
    InvalidForeignKey(String),

    /// CBOR serialization failed.
    #[error("CBOR encoding failed: {0}")]
    Encode(String),

    /// CBOR deserialization failed.
    #[error("CBOR decoding failed: {0}")]
    Decode(String),
}
