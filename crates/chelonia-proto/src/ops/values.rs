use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    envelope::{EncryptedEnvelope, Payload, SignedEnvelope},
    ids::{ContractId, Hash, KeyId},
    key::KeyDescriptor,
};

/// Genesis operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractOp {
    /// Contract type name; action names are prefixed with `<type>/`
    #[serde(rename = "type")]
    pub contract_type: String,
    /// Initial key set
    pub keys: Vec<Payload<KeyDescriptor>>,
    /// Random nonce so identical genesis data yields distinct contracts
    pub nonce: String,
}

/// Contract action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOp {
    /// Fully qualified action name (`<type>/<name>`)
    pub action: String,
    /// Action arguments
    pub data: Value,
    /// Action metadata, validated by the contract definition
    #[serde(default)]
    pub meta: Value,
}

/// Secret keys delivered to the contract this message is posted to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyShareOp {
    /// Contract the shared keys belong to
    pub contract_id: ContractId,
    /// Encrypted secrets
    pub keys: Vec<SharedKey>,
    /// Key request this share answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_request_hash: Option<Hash>,
    /// Height of the request's reply envelope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_request_height: Option<u64>,
}

/// One shared secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedKey {
    /// Id of the shared key
    pub id: KeyId,
    /// Serialized secret key, encrypted to a key of the receiving contract
    pub data: EncryptedEnvelope<String>,
}

/// Request for a contract's shareable secret keys.
///
/// Posted on the target contract, signed by an invite key. Responders read
/// `reply_with` to learn where to deliver the keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRequestOp {
    /// Requesting contract
    pub contract_id: ContractId,
    /// Requester height the `reply_with` envelope is bound to
    pub height: u64,
    /// Reply instructions signed by a requester key
    pub reply_with: SignedEnvelope<ReplyWith>,
    /// Requested key set (`"*"` for everything shareable)
    pub request: String,
}

/// Where and how to deliver requested keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyWith {
    /// Requester key the shared secrets are encrypted to
    pub encryption_key_id: KeyId,
    /// Target contract, so the reply cannot be replayed on another target
    pub target_contract_id: ContractId,
}

/// Settles a pending key request on the target contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRequestSeenOp {
    /// Request being settled
    pub key_request_hash: Hash,
    /// Hash of the `OP_KEY_SHARE` that answered it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_share_hash: Option<Hash>,
    /// Whether keys were delivered
    pub success: bool,
}

/// Set a contract property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropSetOp {
    /// Property name
    pub key: String,
    /// Property value
    pub value: Value,
}

/// Delete a contract property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropDelOp {
    /// Property name
    pub key: String,
}
