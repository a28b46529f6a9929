//! Error taxonomy for message processing, sync and publishing.
//!
//! Errors are classified by what the engine does with them, not by where
//! they come from:
//!
//! - Ignorable ([`ChelError::is_ignorable`]): the operation (or atomic
//!   sub-operation) is skipped and processing continues.
//! - Unrecoverable ([`ChelError::is_unrecoverable`]): the contract cannot be
//!   advanced until something outside the engine changes.
//! - Everything else rejects the message: in relaxed mode the working copy is
//!   discarded and the head still advances, in strict mode the message is
//!   refused.

use chelonia_crypto::CryptoError;
use chelonia_proto::{ContractId, Hash, KeyId, ProtocolError};
use thiserror::Error;

use crate::{storage::StorageError, transport::TransportError};

/// Engine error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChelError {
    /// Operation rejected without affecting anything else.
    #[error("warning: {0}")]
    Warning(String),

    /// Message is structurally invalid.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A later message arrived before an earlier one.
    #[error("message at height {got} arrived before {expected}")]
    BadPreviousHead {
        /// Next height the log expects
        expected: u64,
        /// Height received
        got: u64,
    },

    /// Message was already applied.
    #[error("message {hash} already processed")]
    AlreadyProcessed {
        /// Duplicate message hash
        hash: Hash,
    },

    /// Signing key does not exist in the contract.
    #[error("signing key {key_id} not found")]
    SignatureKeyNotFound {
        /// Unknown key
        key_id: KeyId,
    },

    /// Signing key exists but may not sign this message.
    #[error("key {key_id} not authorized: {reason}")]
    SignatureKeyUnauthorized {
        /// Offending key
        key_id: KeyId,
        /// Why authorization failed
        reason: String,
    },

    /// Signature bytes do not verify.
    #[error("invalid signature from key {key_id}")]
    SignatureError {
        /// Key the signature claims
        key_id: KeyId,
    },

    /// No local secret for the key the data is encrypted with.
    #[error("decryption key {key_id} not available")]
    DecryptionKeyNotFound {
        /// Missing key
        key_id: KeyId,
    },

    /// Decryption ran and failed.
    #[error("decryption failed: {0}")]
    DecryptionError(String),

    /// Key addition would duplicate an active key.
    #[error("key {key_id} already exists")]
    KeyAlreadyExists {
        /// Duplicate key
        key_id: KeyId,
    },

    /// Signer may not perform this key or action operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Operation is well-formed but not applicable to the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// No contract definition registered for the manifest.
    #[error("no contract definition for manifest {0}")]
    ManifestNotFound(String),

    /// Action is not defined by the contract.
    #[error("unknown action {0}")]
    UnknownAction(String),

    /// Contract action validation or processing failed.
    #[error("action {action} failed: {reason}")]
    ActionFailed {
        /// Action name
        action: String,
        /// Handler error message
        reason: String,
    },

    /// Contract is not known locally.
    #[error("contract {0} not found")]
    ContractNotFound(ContractId),

    /// Contract was deleted on the relay.
    #[error("contract {0} is gone")]
    ResourceGone(ContractId),

    /// Local chain diverged from the relay's chain.
    #[error("forked chain for contract {contract_id}: {reason}")]
    ForkedChain {
        /// Contract being synced
        contract_id: ContractId,
        /// What diverged
        reason: String,
    },

    /// Too many out-of-order messages are waiting for a resync.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    /// Operation was started before an engine reset.
    #[error("operation started before reset")]
    Stale,

    /// Publishing gave up.
    #[error("publish to {contract_id} failed after {attempts} attempts")]
    PublishFailed {
        /// Target contract
        contract_id: ContractId,
        /// Attempts made
        attempts: u32,
    },

    /// Wire-level decoding error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Persistence failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Relay communication failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ChelError {
    /// Skipped without failing the enclosing message.
    #[must_use]
    pub fn is_ignorable(&self) -> bool {
        matches!(
            self,
            Self::Warning(_) | Self::DecryptionKeyNotFound { .. } | Self::KeyAlreadyExists { .. }
        )
    }

    /// The contract cannot make progress until something external changes.
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            Self::Unrecoverable(_) | Self::ForkedChain { .. } | Self::ResourceGone(_) | Self::Storage(_)
        )
    }

    /// Relay errors worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_transient())
    }

    pub(crate) fn unauthorized(key_id: &KeyId, reason: impl Into<String>) -> Self {
        Self::SignatureKeyUnauthorized { key_id: key_id.clone(), reason: reason.into() }
    }

    pub(crate) fn action_failed(action: &str, reason: impl ToString) -> Self {
        Self::ActionFailed { action: action.to_owned(), reason: reason.to_string() }
    }
}

impl From<CryptoError> for ChelError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidSignature => Self::DecryptionError("invalid signature".into()),
            other => Self::DecryptionError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignorable_classification() {
        assert!(ChelError::Warning("x".into()).is_ignorable());
        assert!(ChelError::DecryptionKeyNotFound { key_id: KeyId::from("k") }.is_ignorable());
        assert!(ChelError::KeyAlreadyExists { key_id: KeyId::from("k") }.is_ignorable());
        assert!(!ChelError::SignatureError { key_id: KeyId::from("k") }.is_ignorable());
        assert!(!ChelError::DecryptionError("bad tag".into()).is_ignorable());
    }

    #[test]
    fn unrecoverable_classification() {
        assert!(ChelError::Unrecoverable("too many".into()).is_unrecoverable());
        assert!(!ChelError::Warning("x".into()).is_unrecoverable());
        assert!(!ChelError::Stale.is_unrecoverable());
    }

    #[test]
    fn transient_only_for_network_errors() {
        assert!(ChelError::Transport(TransportError::Network("reset".into())).is_transient());
        assert!(!ChelError::Transport(TransportError::Conflict { status: 409 }).is_transient());
        assert!(!ChelError::Stale.is_transient());
    }
}
