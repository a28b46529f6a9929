//! Operation types and values.
//!
//! Each message carries exactly one operation. The operation type code in the
//! head must agree with the variant of [`OpValue`]; `RawMessage::decode`
//! rejects mismatches before anything else looks at the message.

mod values;

use serde::{Deserialize, Serialize};
pub use values::{
    ActionOp, ContractOp, KeyRequestOp, KeyRequestSeenOp, KeyShareOp, PropDelOp, PropSetOp,
    ReplyWith, SharedKey,
};

use crate::{
    envelope::{EncryptedEnvelope, Payload},
    ids::KeyId,
    key::{KeyDescriptor, KeyUpdate},
};

/// Operation type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OpType {
    /// Genesis (`c`)
    #[serde(rename = "c")]
    Contract,
    /// Encrypted action (`ae`)
    #[serde(rename = "ae")]
    ActionEncrypted,
    /// Unencrypted action (`au`)
    #[serde(rename = "au")]
    ActionUnencrypted,
    /// Add keys (`ka`)
    #[serde(rename = "ka")]
    KeyAdd,
    /// Revoke keys (`kd`)
    #[serde(rename = "kd")]
    KeyDel,
    /// Rotate or amend keys (`ku`)
    #[serde(rename = "ku")]
    KeyUpdate,
    /// Deliver secret keys (`ks`)
    #[serde(rename = "ks")]
    KeyShare,
    /// Ask for secret keys (`kr`)
    #[serde(rename = "kr")]
    KeyRequest,
    /// Settle a key request (`krs`)
    #[serde(rename = "krs")]
    KeyRequestSeen,
    /// Several operations applied all-or-nothing (`a`)
    #[serde(rename = "a")]
    Atomic,
    /// Set a contract property (`ps`)
    #[serde(rename = "ps")]
    PropSet,
    /// Delete a contract property (`pd`)
    #[serde(rename = "pd")]
    PropDel,
}

impl OpType {
    /// Every operation type, in code order.
    pub const ALL: [Self; 12] = [
        Self::Contract,
        Self::ActionEncrypted,
        Self::ActionUnencrypted,
        Self::KeyAdd,
        Self::KeyDel,
        Self::KeyUpdate,
        Self::KeyShare,
        Self::KeyRequest,
        Self::KeyRequestSeen,
        Self::Atomic,
        Self::PropSet,
        Self::PropDel,
    ];

    /// Short wire code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Contract => "c",
            Self::ActionEncrypted => "ae",
            Self::ActionUnencrypted => "au",
            Self::KeyAdd => "ka",
            Self::KeyDel => "kd",
            Self::KeyUpdate => "ku",
            Self::KeyShare => "ks",
            Self::KeyRequest => "kr",
            Self::KeyRequestSeen => "krs",
            Self::Atomic => "a",
            Self::PropSet => "ps",
            Self::PropDel => "pd",
        }
    }

    /// Parse a wire code.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.code() == code)
    }

    /// Whether this operation changes the key set.
    #[must_use]
    pub const fn is_key_op(self) -> bool {
        matches!(self, Self::Contract | Self::KeyAdd | Self::KeyDel | Self::KeyUpdate)
    }

    /// Whether this is an action.
    #[must_use]
    pub const fn is_action(self) -> bool {
        matches!(self, Self::ActionEncrypted | Self::ActionUnencrypted)
    }
}

/// Operation value.
///
/// Adjacently tagged with the op code so the wire form is
/// `{"type": "<code>", "value": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum OpValue {
    /// Genesis
    #[serde(rename = "c")]
    Contract(ContractOp),
    /// Encrypted action
    #[serde(rename = "ae")]
    ActionEncrypted(EncryptedEnvelope<ActionOp>),
    /// Unencrypted action, optionally inner-signed
    #[serde(rename = "au")]
    ActionUnencrypted(Payload<ActionOp>),
    /// Keys to add
    #[serde(rename = "ka")]
    KeyAdd(Vec<Payload<KeyDescriptor>>),
    /// Key ids to revoke
    #[serde(rename = "kd")]
    KeyDel(Vec<Payload<KeyId>>),
    /// Key updates
    #[serde(rename = "ku")]
    KeyUpdate(Vec<Payload<KeyUpdate>>),
    /// Secret key delivery
    #[serde(rename = "ks")]
    KeyShare(Payload<KeyShareOp>),
    /// Key request
    #[serde(rename = "kr")]
    KeyRequest(Payload<KeyRequestOp>),
    /// Key request settlement
    #[serde(rename = "krs")]
    KeyRequestSeen(Payload<KeyRequestSeenOp>),
    /// Nested operations
    #[serde(rename = "a")]
    Atomic(Vec<OpValue>),
    /// Property set
    #[serde(rename = "ps")]
    PropSet(PropSetOp),
    /// Property delete
    #[serde(rename = "pd")]
    PropDel(PropDelOp),
}

impl OpValue {
    /// Operation type of this value.
    #[must_use]
    pub fn op_type(&self) -> OpType {
        match self {
            Self::Contract(_) => OpType::Contract,
            Self::ActionEncrypted(_) => OpType::ActionEncrypted,
            Self::ActionUnencrypted(_) => OpType::ActionUnencrypted,
            Self::KeyAdd(_) => OpType::KeyAdd,
            Self::KeyDel(_) => OpType::KeyDel,
            Self::KeyUpdate(_) => OpType::KeyUpdate,
            Self::KeyShare(_) => OpType::KeyShare,
            Self::KeyRequest(_) => OpType::KeyRequest,
            Self::KeyRequestSeen(_) => OpType::KeyRequestSeen,
            Self::Atomic(_) => OpType::Atomic,
            Self::PropSet(_) => OpType::PropSet,
            Self::PropDel(_) => OpType::PropDel,
        }
    }

    /// Whether this value (or any nested value) changes the key set.
    #[must_use]
    pub fn touches_keys(&self) -> bool {
        match self {
            Self::Atomic(ops) => ops.iter().any(Self::touches_keys),
            other => other.op_type().is_key_op(),
        }
    }

    /// Nesting depth; plain operations have depth 1.
    #[must_use]
    pub fn depth(&self) -> usize {
        match self {
            Self::Atomic(ops) => 1 + ops.iter().map(Self::depth).max().unwrap_or(0),
            _ => 1,
        }
    }
}
