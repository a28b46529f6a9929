//! Per-contract state.
//!
//! [`ContractState`] splits into three parts with different rules:
//!
//! - `vm`: replicated engine state. Deterministic given the log and the set
//!   of secrets that were available while processing it.
//! - `volatile`: local bookkeeping. Survives a rebuild only where noted and is
//!   never compared across clients.
//! - `data`: the contract's own state, mutated only by action handlers.
//!
//! [`ContractMeta`] is the root index entry: type, HEAD, height and the
//! bookkeeping the ordering engine needs.

use std::collections::{BTreeMap, BTreeSet};

use chelonia_proto::{ContractId, Hash, KeyId, ReplyWith, SignedEnvelope};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::keys::KeyTable;

/// Contract state as seen by one client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractState {
    /// Replicated engine state
    pub vm: VmState,
    /// Local-only bookkeeping
    pub volatile: VolatileState,
    /// Contract-defined state
    pub data: Value,
}

/// Replicated engine state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmState {
    /// Contract type from genesis
    pub contract_type: String,
    /// Every key ever added, revoked ones included
    pub authorized_keys: KeyTable,
    /// Invite keys and their remaining uses
    pub invites: BTreeMap<KeyId, Invite>,
    /// Key requests awaiting a response, by request message hash
    pub pending_keyshares: BTreeMap<Hash, PendingKeyshare>,
    /// Foreign keys this contract mirrors, by foreign contract
    pub pending_watch: BTreeMap<ContractId, Vec<WatchedKey>>,
    /// Keys delivered to this contract through `OP_KEY_SHARE`
    pub shared_key_ids: Vec<SharedKeyRecord>,
    /// Contract properties
    pub props: BTreeMap<String, Value>,
}

/// Invite lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InviteStatus {
    /// Requests may still be made
    Active,
    /// Quantity exhausted
    Used,
    /// Invite key revoked
    Revoked,
}

/// An invite key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
    /// Invite key name
    pub name: String,
    /// Lifecycle state
    pub status: InviteStatus,
    /// Remaining uses; unlimited when absent
    pub quantity: Option<u32>,
    /// Uses granted at creation
    pub initial_quantity: Option<u32>,
    /// Unix-seconds expiry, checked by responders
    pub expires: Option<u64>,
}

/// A key request waiting for `OP_KEY_REQUEST_SEEN`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingKeyshare {
    /// Contract asking for keys
    pub requester: ContractId,
    /// Requester height `reply_with` is bound to
    pub height: u64,
    /// Height of the request message here
    pub request_height: u64,
    /// Key that signed the request
    pub signing_key_id: KeyId,
    /// Reply instructions, verified by the responder
    pub reply_with: SignedEnvelope<ReplyWith>,
    /// Requested key set
    pub request: String,
}

/// A mirrored foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedKey {
    /// Name of the key in the foreign contract
    pub name: String,
    /// Id of the local mirror
    pub key_id: KeyId,
}

/// A key received through `OP_KEY_SHARE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedKeyRecord {
    /// Shared key
    pub id: KeyId,
    /// Contract the key belongs to
    pub contract_id: ContractId,
    /// Height of the share message
    pub height: u64,
    /// Request the share answered
    pub key_request_hash: Option<Hash>,
}

/// Local-only bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolatileState {
    /// Contracts mirroring keys of this one. Preserved across rebuilds.
    pub watch: Vec<Watcher>,
    /// Mirror operations already issued, by local key id
    pub pending_key_revocations: BTreeMap<KeyId, MirrorKind>,
    /// Key requests this contract has made and not yet seen answered
    pub pending_key_requests: Vec<PendingKeyRequest>,
    /// State must be rebuilt from genesis
    pub dirty: bool,
    /// A rebuild is in progress
    pub resyncing: bool,
}

/// A contract mirroring one of our keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watcher {
    /// Name of the watched key here
    pub key_name: String,
    /// Contract holding the mirror
    pub contract_id: ContractId,
}

/// Which mirror operation was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorKind {
    /// Local mirror revoked
    Del,
    /// Local mirror rotated
    Update,
}

/// Outstanding outgoing key request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingKeyRequest {
    /// Contract keys were requested from
    pub contract_id: ContractId,
    /// Request message hash
    pub hash: Hash,
    /// Local key name the reply is encrypted to
    pub name: String,
}

impl ContractState {
    /// Fresh state that keeps the watch list of a state being rebuilt.
    #[must_use]
    pub fn rebuilt_from(previous: &Self) -> Self {
        Self {
            volatile: VolatileState {
                watch: previous.volatile.watch.clone(),
                resyncing: true,
                ..VolatileState::default()
            },
            ..Self::default()
        }
    }
}

/// Root index entry for a contract.
///
/// Reference counts are not stored here. They are engine-wide
/// bookkeeping kept apart from the replication position: persistent counts
/// are saved under [`crate::storage::REFS_KEY`] and ephemeral ones live only
/// in memory. Read them with [`crate::Chelonia::references`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractMeta {
    /// Contract type
    pub contract_type: String,
    /// Hash of the last applied message
    pub head: Hash,
    /// Height of the last applied message
    pub height: u64,
    /// Hash of the last applied key-changing message
    pub previous_key_op: Hash,
    /// Encryption keys that were missing while processing
    pub missing_decryption_key_ids: BTreeSet<KeyId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebuild_keeps_only_watchers() {
        let mut state = ContractState::default();
        state.vm.contract_type = "counter".into();
        state.volatile.watch.push(Watcher {
            key_name: "csk".into(),
            contract_id: ContractId::from_genesis(Hash::digest(b"w")),
        });
        state.volatile.dirty = true;

        let rebuilt = ContractState::rebuilt_from(&state);
        assert_eq!(rebuilt.vm, VmState::default());
        assert_eq!(rebuilt.volatile.watch, state.volatile.watch);
        assert!(!rebuilt.volatile.dirty);
        assert!(rebuilt.volatile.resyncing);
    }

    #[test]
    fn state_survives_cbor_persistence() {
        let mut state = ContractState::default();
        state.vm.props.insert("title".into(), serde_json::json!("hello"));
        state.data = serde_json::json!({"count": 3});

        let bytes = chelonia_proto::codec::encode(&state).unwrap();
        let decoded: ContractState = chelonia_proto::codec::decode(&bytes).unwrap();
        assert_eq!(decoded, state);
    }
}
