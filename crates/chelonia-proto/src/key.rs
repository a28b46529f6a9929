//! Key descriptors as they appear in `OP_CONTRACT`, `OP_KEY_ADD` and
//! `OP_KEY_UPDATE`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    envelope::EncryptedEnvelope,
    ids::{ContractId, ForeignKeyRef, KeyId},
    permission::{Permission, Scope},
};

/// What a key may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyPurpose {
    /// Signing
    Sig,
    /// Encryption
    Enc,
    /// Server-accessible key (readable by the relay, never by other members)
    Sak,
}

/// Public description of a contract key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDescriptor {
    /// Key identifier (derived from `data`)
    pub id: KeyId,
    /// Human-readable name, unique among active keys
    pub name: String,
    /// Allowed uses
    pub purpose: BTreeSet<KeyPurpose>,
    /// Privilege level; lower is more privileged
    pub ring_level: u32,
    /// Operation types this key may sign
    pub permissions: Scope<Permission>,
    /// Action names this key may sign
    pub allowed_actions: Scope<String>,
    /// Serialized public key
    pub data: String,
    /// Mirrored key in another contract
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<ForeignKeyRef>,
    /// Optional key metadata
    #[serde(default, skip_serializing_if = "KeyMeta::is_empty")]
    pub meta: KeyMeta,
}

impl KeyDescriptor {
    /// Whether the key carries an explicit purpose.
    #[must_use]
    pub fn has_purpose(&self, purpose: KeyPurpose) -> bool {
        self.purpose.contains(&purpose)
    }

    /// Whether the key is marked private (its secret is distributed through
    /// the log and must stay private across updates).
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.meta.private.is_some()
    }
}

/// Optional key metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMeta {
    /// Secret material for members who can decrypt it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<PrivateKeyMeta>,
    /// Present on invite keys that may post `OP_KEY_REQUEST`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_request: Option<KeyRequestMeta>,
    /// Number of key requests an invite key may make; unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    /// Invite expiry as Unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
}

impl KeyMeta {
    /// True when no metadata field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.private.is_none()
            && self.key_request.is_none()
            && self.quantity.is_none()
            && self.expires.is_none()
    }
}

/// Encrypted secret key material attached to a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateKeyMeta {
    /// Serialized secret key, encrypted with one of the contract's keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<EncryptedEnvelope<String>>,
    /// Whether responders may hand this key out in `OP_KEY_SHARE`
    #[serde(default)]
    pub shareable: bool,
}

/// Invite key metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRequestMeta {
    /// Free-form reference shown to the inviter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Contract the invite was issued for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<ContractId>,
}

/// One entry of an `OP_KEY_UPDATE`.
///
/// Replaces the active key `old_key_id` under the same `name`. When `id`
/// differs from `old_key_id` the key is rotated: new public material is
/// required and the old key is revoked at the update's height. Otherwise the
/// update adjusts the existing key in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyUpdate {
    /// Name of the key being updated (must match the existing key)
    pub name: String,
    /// Key being replaced
    pub old_key_id: KeyId,
    /// New key identifier, when rotating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<KeyId>,
    /// New public material, required when rotating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Replacement purposes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<BTreeSet<KeyPurpose>>,
    /// Replacement permissions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Scope<Permission>>,
    /// Replacement allowed actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_actions: Option<Scope<String>>,
    /// Replacement metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<KeyMeta>,
}

impl KeyUpdate {
    /// Whether this update introduces a new key id.
    #[must_use]
    pub fn rotates(&self) -> bool {
        self.id.as_ref().is_some_and(|id| *id != self.old_key_id)
    }
}
