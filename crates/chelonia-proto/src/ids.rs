//! Identifiers: message hashes, contract IDs, key IDs, foreign key references.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{ProtocolError, Result};

/// Length of a hex-encoded SHA-256 digest.
const HEX_DIGEST_LEN: usize = 64;

/// Content hash of a serialized message (lowercase hex SHA-256).
///
/// Messages are identified by the hash of their exact wire bytes, never by a
/// re-encoding, so a `Hash` is only ever computed from bytes received or about
/// to be sent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash(String);

impl Hash {
    /// Hash raw bytes.
    #[must_use]
    pub fn digest(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Parse a hex digest, rejecting anything that is not 64 lowercase hex
    /// characters.
    pub fn from_hex(value: &str) -> Result<Self> {
        if value.len() != HEX_DIGEST_LEN {
            return Err(ProtocolError::InvalidHash {
                value: value.to_owned(),
                reason: "expected 64 hex characters",
            });
        }
        if !value.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(ProtocolError::InvalidHash {
                value: value.to_owned(),
                reason: "expected lowercase hex",
            });
        }
        Ok(Self(value.to_owned()))
    }

    /// Hex representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Contract identifier: the hash of the contract's genesis message.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractId(Hash);

impl ContractId {
    /// Wrap the genesis message hash.
    #[must_use]
    pub fn from_genesis(hash: Hash) -> Self {
        Self(hash)
    }

    /// Parse from a hex digest.
    pub fn from_hex(value: &str) -> Result<Self> {
        Hash::from_hex(value).map(Self)
    }

    /// Genesis message hash.
    #[must_use]
    pub fn genesis_hash(&self) -> &Hash {
        &self.0
    }

    /// Hex representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Key identifier, derived from the public key material.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    /// Wrap a key identifier string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Reference to a named key in another contract.
///
/// Serialized as `<contractID>?keyName=<name>`. A key carrying this reference
/// mirrors the named key of the foreign contract and follows its rotations and
/// revocation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ForeignKeyRef {
    /// Contract that owns the referenced key
    pub contract_id: ContractId,
    /// Name of the referenced key in that contract
    pub key_name: String,
}

impl ForeignKeyRef {
    const SEPARATOR: &'static str = "?keyName=";

    /// Build a reference.
    #[must_use]
    pub fn new(contract_id: ContractId, key_name: impl Into<String>) -> Self {
        Self { contract_id, key_name: key_name.into() }
    }

    /// Parse the `<contractID>?keyName=<name>` form.
    pub fn parse(value: &str) -> Result<Self> {
        let Some((contract, name)) = value.split_once(Self::SEPARATOR) else {
            return Err(ProtocolError::InvalidForeignKey(value.to_owned()));
        };
        if name.is_empty() {
            return Err(ProtocolError::InvalidForeignKey(value.to_owned()));
        }
        let contract_id = ContractId::from_hex(contract)
            .map_err(|_| ProtocolError::InvalidForeignKey(value.to_owned()))?;
        Ok(Self { contract_id, key_name: name.to_owned() })
    }
}

impl fmt::Display for ForeignKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.contract_id, Self::SEPARATOR, self.key_name)
    }
}

impl TryFrom<String> for ForeignKeyRef {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ForeignKeyRef> for String {
    fn from(value: ForeignKeyRef) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_lowercase_hex() {
        let hash = Hash::digest(b"chelonia");
        assert_eq!(hash.as_str().len(), 64);
        assert!(Hash::from_hex(hash.as_str()).is_ok());
    }

    #[test]
    fn from_hex_rejects_uppercase_and_short_values() {
        let upper = Hash::digest(b"x").as_str().to_uppercase();
        assert!(Hash::from_hex(&upper).is_err());
        assert!(Hash::from_hex("abc").is_err());
    }

    #[test]
    fn foreign_key_ref_parses_and_displays() {
        let contract = ContractId::from_genesis(Hash::digest(b"genesis"));
        let text = format!("{contract}?keyName=csk");

        let parsed = ForeignKeyRef::parse(&text).expect("valid reference");
        assert_eq!(parsed.contract_id, contract);
        assert_eq!(parsed.key_name, "csk");
        assert_eq!(parsed.to_string(), text);
    }

    #[test]
    fn foreign_key_ref_rejects_missing_name() {
        let contract = ContractId::from_genesis(Hash::digest(b"genesis"));
        assert!(ForeignKeyRef::parse(&format!("{contract}?keyName=")).is_err());
        assert!(ForeignKeyRef::parse(contract.as_str()).is_err());
    }
}
