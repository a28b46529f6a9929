//! Side-effect requests emitted by the processor.
//!
//! The processor never talks to the outside world. It returns these requests
//! alongside the new state and the engine runs them once the message has been
//! committed: contract actions inline in the contract queue, everything else
//! in the background.

use chelonia_proto::{ContractId, Hash, KeyId};
use serde_json::Value;

/// Work to run after a message is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// Run the action handler's `side_effect`.
    Action {
        /// Action name
        action: String,
        /// Action data
        data: Value,
        /// Action metadata
        meta: Value,
        /// Outer signing key
        signing_key_id: KeyId,
        /// Inner signing key, if any
        inner_signing_key_id: Option<KeyId>,
    },

    /// Start watching the foreign contract that owns a mirrored key.
    WatchForeignKeys {
        /// Contract owning the original keys
        foreign_contract_id: ContractId,
    },

    /// Stop mirroring a foreign key in this contract.
    UnwatchForeignKey {
        /// Contract owning the original key
        foreign_contract_id: ContractId,
        /// Name of the key there
        key_name: String,
    },

    /// A watched key was revoked; revoke the mirrors in watching contracts.
    MirrorKeyDel {
        /// Name of the revoked key
        key_name: String,
    },

    /// A watched key was rotated; rotate the mirrors in watching contracts.
    MirrorKeyUpdate {
        /// Name of the rotated key
        key_name: String,
    },

    /// A key request was accepted; answer it with `OP_KEY_SHARE`.
    RespondToKeyRequest {
        /// Hash of the `OP_KEY_REQUEST` message
        request_hash: Hash,
    },

    /// Secret keys arrived; contracts that missed them need a rebuild.
    KeysReceived {
        /// Contract the keys belong to
        target_contract_id: ContractId,
        /// Received key ids
        key_ids: Vec<KeyId>,
    },

    /// A key request this client made was answered.
    KeyRequestSettled {
        /// Hash of the `OP_KEY_REQUEST` message
        request_hash: Hash,
        /// Whether keys were shared
        success: bool,
    },
}

impl SideEffect {
    /// Whether this runs inline in the contract queue after commit.
    #[must_use]
    pub fn is_action(&self) -> bool {
        matches!(self, Self::Action { .. })
    }

    /// Short label for logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Action { .. } => "action",
            Self::WatchForeignKeys { .. } => "watch_foreign_keys",
            Self::UnwatchForeignKey { .. } => "unwatch_foreign_key",
            Self::MirrorKeyDel { .. } => "mirror_key_del",
            Self::MirrorKeyUpdate { .. } => "mirror_key_update",
            Self::RespondToKeyRequest { .. } => "respond_to_key_request",
            Self::KeysReceived { .. } => "keys_received",
            Self::KeyRequestSettled { .. } => "key_request_settled",
        }
    }
}

