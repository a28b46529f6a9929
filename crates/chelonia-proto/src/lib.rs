//! Chelonia wire types.
//!
//! A contract is an append-only, hash-chained log of signed messages. This
//! crate defines what travels on that log: the message head (chain links,
//! height, operation type), the operation values, and the signed/encrypted
//! envelopes that wrap operation data.
//!
//! Everything here is pure data plus canonical encoding. Verification,
//! decryption and state transitions live in `chelonia-core`, which is the only
//! place that knows which keys are authorized at which height.
//!
//! # Encoding
//!
//! All structures are encoded with CBOR (`ciborium`). A message's identity is
//! the SHA-256 of its exact serialized bytes, so encoding must be
//! deterministic: struct fields are emitted in declaration order and all maps
//! are `BTreeMap`/`BTreeSet`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod codec;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod key;
pub mod message;
pub mod ops;
pub mod permission;

pub use envelope::{Aad, EncryptedEnvelope, Payload, SignedEnvelope};
pub use errors::{ProtocolError, Result};
pub use ids::{ContractId, ForeignKeyRef, Hash, KeyId};
pub use key::{KeyDescriptor, KeyMeta, KeyPurpose, KeyRequestMeta, KeyUpdate, PrivateKeyMeta};
pub use message::{Direction, Message, MessageHead, MessageSignature, RawMessage};
pub use ops::{
    ActionOp, ContractOp, KeyRequestOp, KeyRequestSeenOp, KeyShareOp, OpType, OpValue, PropDelOp,
    PropSetOp, ReplyWith, SharedKey,
};
pub use permission::{Permission, Scope};
