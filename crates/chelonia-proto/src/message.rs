//! Log messages.
//!
//! A message is `{head, op, signature}` encoded as CBOR. The head links the
//! message into its contract's chain; the signature covers head and op
//! together.
//!
//! # Invariants
//!
//! - Genesis shape: `height == 0` if and only if the message has no contract
//!   id, no previous head, and carries `OP_CONTRACT`. Every later message
//!   names its contract and previous head.
//! - Type agreement: `head.op` equals `op.op_type()`.
//! - Identity: a message's hash is the SHA-256 of its exact wire bytes.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    codec,
    errors::{ProtocolError, Result},
    ids::{ContractId, Hash, KeyId},
    ops::{OpType, OpValue},
};

/// Protocol version written by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum accepted size of a raw message (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum nesting depth of `OP_ATOMIC` values.
pub const MAX_OP_DEPTH: usize = 4;

const SIGNING_DOMAIN: &str = "chelonia/msg";

/// Chain-linking metadata of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHead {
    /// Protocol version
    pub version: u16,
    /// Contract this message belongs to; absent for genesis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<ContractId>,
    /// Hash of the message at `height - 1`; absent for genesis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_head: Option<Hash>,
    /// Hash of the most recent key-changing message before this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_key_op: Option<Hash>,
    /// Position in the chain, genesis is 0
    pub height: u64,
    /// Operation type
    pub op: OpType,
    /// Manifest hash of the contract definition that interprets actions
    pub manifest: String,
}

/// Outer message signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSignature {
    /// Signing key
    pub key_id: KeyId,
    /// Signature over [`RawMessage::signing_input`]
    pub signature: Bytes,
}

/// Wire form of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Chain metadata
    pub head: MessageHead,
    /// Operation
    pub op: OpValue,
    /// Outer signature
    pub signature: MessageSignature,
}

impl RawMessage {
    /// Bytes the outer signature covers.
    pub fn signing_input(head: &MessageHead, op: &OpValue) -> Result<Vec<u8>> {
        codec::encode(&(SIGNING_DOMAIN, head, op))
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Bytes> {
        let bytes = codec::encode(self)?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge { size: bytes.len(), max: MAX_MESSAGE_SIZE });
        }
        Ok(Bytes::from(bytes))
    }

    /// Decode wire bytes and check structural invariants.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge { size: bytes.len(), max: MAX_MESSAGE_SIZE });
        }
        let raw: Self = codec::decode(bytes)?;
        raw.validate()?;
        Ok(raw)
    }

    /// Check the structural invariants listed in the module docs.
    pub fn validate(&self) -> Result<()> {
        let head = &self.head;
        if head.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(head.version));
        }
        if head.op != self.op.op_type() {
            return Err(ProtocolError::InconsistentHead(format!(
                "head says {} but operation is {}",
                head.op.code(),
                self.op.op_type().code()
            )));
        }
        if self.op.depth() > MAX_OP_DEPTH {
            return Err(ProtocolError::InconsistentHead(format!(
                "atomic nesting exceeds {MAX_OP_DEPTH}"
            )));
        }

        let genesis = head.height == 0;
        if genesis {
            if head.contract_id.is_some() || head.previous_head.is_some() {
                return Err(ProtocolError::InconsistentHead(
                    "genesis must not reference a contract or previous head".into(),
                ));
            }
            if head.op != OpType::Contract {
                return Err(ProtocolError::InconsistentHead("height 0 must be OP_CONTRACT".into()));
            }
        } else {
            if head.contract_id.is_none() || head.previous_head.is_none() {
                return Err(ProtocolError::InconsistentHead(
                    "non-genesis message must name its contract and previous head".into(),
                ));
            }
            if self.op.op_type() == OpType::Contract
                || matches!(&self.op, OpValue::Atomic(ops) if ops.iter().any(|op| op.op_type() == OpType::Contract))
            {
                return Err(ProtocolError::InconsistentHead(
                    "OP_CONTRACT is only valid at height 0".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Whether a message was received from the log or created locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Read from the relay (live event or sync page)
    Incoming,
    /// Built and signed by this client
    Outgoing,
}

/// A decoded message together with its wire bytes and identity.
///
/// Immutable once built: the hash is computed from the exact bytes the
/// message was decoded from (or encoded to), so it never drifts from what
/// peers see.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    raw: Bytes,
    hash: Hash,
    contract_id: ContractId,
    message: RawMessage,
    direction: Direction,
}

impl Message {
    /// Decode wire bytes.
    pub fn deserialize(raw: Bytes, direction: Direction) -> Result<Self> {
        let message = RawMessage::decode(&raw)?;
        Ok(Self::from_parts(raw, message, direction))
    }

    /// Encode a locally built message.
    pub fn from_raw_message(message: RawMessage) -> Result<Self> {
        message.validate()?;
        let raw = message.encode()?;
        Ok(Self::from_parts(raw, message, Direction::Outgoing))
    }

    fn from_parts(raw: Bytes, message: RawMessage, direction: Direction) -> Self {
        let hash = Hash::digest(&raw);
        let contract_id = message
            .head
            .contract_id
            .clone()
            .unwrap_or_else(|| ContractId::from_genesis(hash.clone()));
        Self { raw, hash, contract_id, message, direction }
    }

    /// Wire bytes.
    #[must_use]
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Content hash of the wire bytes.
    #[must_use]
    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Owning contract (the message's own hash for genesis).
    #[must_use]
    pub fn contract_id(&self) -> &ContractId {
        &self.contract_id
    }

    /// Chain metadata.
    #[must_use]
    pub fn head(&self) -> &MessageHead {
        &self.message.head
    }

    /// Operation value.
    #[must_use]
    pub fn op(&self) -> &OpValue {
        &self.message.op
    }

    /// Operation type.
    #[must_use]
    pub fn op_type(&self) -> OpType {
        self.message.head.op
    }

    /// Outer signature.
    #[must_use]
    pub fn signature(&self) -> &MessageSignature {
        &self.message.signature
    }

    /// Position in the chain.
    #[must_use]
    pub fn height(&self) -> u64 {
        self.message.head.height
    }

    /// Manifest hash.
    #[must_use]
    pub fn manifest(&self) -> &str {
        &self.message.head.manifest
    }

    /// Previous head, absent for genesis.
    #[must_use]
    pub fn previous_head(&self) -> Option<&Hash> {
        self.message.head.previous_head.as_ref()
    }

    /// Whether this is the genesis message.
    #[must_use]
    pub fn is_first_message(&self) -> bool {
        self.message.head.height == 0
    }

    /// Whether this message changes the key set.
    #[must_use]
    pub fn is_key_op(&self) -> bool {
        self.message.op.touches_keys()
    }

    /// Where the message came from.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Bytes covered by the outer signature.
    pub fn signing_input(&self) -> Result<Vec<u8>> {
        RawMessage::signing_input(&self.message.head, &self.message.op)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("hash", &self.hash)
            .field("contract_id", &self.contract_id)
            .field("height", &self.height())
            .field("op", &self.op_type())
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{envelope::Payload, ops::ContractOp, ops::PropSetOp};

    fn genesis() -> RawMessage {
        RawMessage {
            head: MessageHead {
                version: PROTOCOL_VERSION,
                contract_id: None,
                previous_head: None,
                previous_key_op: None,
                height: 0,
                op: OpType::Contract,
                manifest: "manifest".into(),
            },
            op: OpValue::Contract(ContractOp {
                contract_type: "counter".into(),
                keys: Vec::<Payload<_>>::new(),
                nonce: "n".into(),
            }),
            signature: MessageSignature { key_id: KeyId::from("k"), signature: Bytes::new() },
        }
    }

    #[test]
    fn genesis_contract_id_is_its_own_hash() {
        let message = Message::from_raw_message(genesis()).unwrap();
        assert!(message.is_first_message());
        assert!(message.is_key_op());
        assert_eq!(message.contract_id().genesis_hash(), message.hash());
    }

    #[test]
    fn decode_matches_encode() {
        let message = Message::from_raw_message(genesis()).unwrap();
        let decoded = Message::deserialize(message.raw().clone(), Direction::Incoming).unwrap();
        assert_eq!(decoded.hash(), message.hash());
        assert_eq!(decoded.head(), message.head());
    }

    #[test]
    fn rejects_op_type_mismatch() {
        let mut raw = genesis();
        raw.head.op = OpType::KeyAdd;
        assert!(matches!(raw.validate(), Err(ProtocolError::InconsistentHead(_))));
    }

    #[test]
    fn rejects_genesis_with_previous_head() {
        let mut raw = genesis();
        raw.head.previous_head = Some(Hash::digest(b"x"));
        assert!(raw.validate().is_err());
    }

    #[test]
    fn rejects_non_genesis_without_links() {
        let mut raw = genesis();
        raw.head.height = 1;
        raw.head.op = OpType::PropSet;
        raw.op = OpValue::PropSet(PropSetOp { key: "a".into(), value: serde_json::Value::Null });
        assert!(raw.validate().is_err());

        raw.head.contract_id = Some(ContractId::from_genesis(Hash::digest(b"g")));
        raw.head.previous_head = Some(Hash::digest(b"g"));
        assert!(raw.validate().is_ok());
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut raw = genesis();
        raw.head.version = 99;
        assert_eq!(raw.validate(), Err(ProtocolError::UnsupportedVersion(99)));
    }

    #[test]
    fn rejects_oversized_input() {
        let bytes = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(RawMessage::decode(&bytes), Err(ProtocolError::MessageTooLarge { .. })));
    }
}
