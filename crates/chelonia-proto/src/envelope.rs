//! Signed and encrypted envelopes around operation data.
//!
//! Envelopes are opaque here: the proto layer carries key ids and bytes, the
//! core layer verifies and decrypts them against the contract's authorized
//! keys. Both kinds are bound to a position in the log through [`Aad`], so a
//! signature or ciphertext lifted from one contract (or height) does not
//! verify anywhere else.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    codec,
    errors::Result,
    ids::{ContractId, KeyId},
};

/// Data signed by a contract key.
///
/// `data` holds the CBOR encoding of `T`. The type parameter only documents
/// what the bytes decode to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedEnvelope<T> {
    /// Signing key
    pub key_id: KeyId,
    /// CBOR-encoded value
    pub data: Bytes,
    /// Signature over [`Aad::signing_input`]
    pub signature: Bytes,
    #[serde(skip)]
    marker: PhantomData<fn() -> T>,
}

impl<T> SignedEnvelope<T> {
    /// Assemble an envelope from its parts.
    #[must_use]
    pub fn new(key_id: KeyId, data: Bytes, signature: Bytes) -> Self {
        Self { key_id, data, signature, marker: PhantomData }
    }
}

/// Data encrypted to a contract key.
///
/// The plaintext is the CBOR encoding of a [`Payload<T>`] that is either plain
/// or signed; nested encryption is rejected when opening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope<T> {
    /// Encryption key
    pub key_id: KeyId,
    /// Algorithm-specific ciphertext
    pub ciphertext: Bytes,
    #[serde(skip)]
    marker: PhantomData<fn() -> T>,
}

impl<T> EncryptedEnvelope<T> {
    /// Assemble an envelope from its parts.
    #[must_use]
    pub fn new(key_id: KeyId, ciphertext: Bytes) -> Self {
        Self { key_id, ciphertext, marker: PhantomData }
    }
}

/// Operation data in one of its three wire forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
pub enum Payload<T> {
    /// Unwrapped value
    Plain(T),
    /// Value with an inner signature
    Signed(SignedEnvelope<T>),
    /// Encrypted plain or signed value
    Encrypted(EncryptedEnvelope<T>),
}

impl<T> Payload<T> {
    /// Key id the payload is wrapped with, if any.
    #[must_use]
    pub fn key_id(&self) -> Option<&KeyId> {
        match self {
            Self::Plain(_) => None,
            Self::Signed(env) => Some(&env.key_id),
            Self::Encrypted(env) => Some(&env.key_id),
        }
    }
}

/// Log position that envelopes are bound to.
///
/// Genesis messages have no contract id yet; they bind to the empty string
/// at height 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aad {
    contract_id: String,
    height: u64,
}

impl Aad {
    const SIGNATURE_DOMAIN: &'static str = "chelonia/sig";
    const ENCRYPTION_DOMAIN: &'static str = "chelonia/enc";

    /// Bind to a message position. `None` means the genesis message.
    #[must_use]
    pub fn new(contract_id: Option<&ContractId>, height: u64) -> Self {
        Self {
            contract_id: contract_id.map(|id| id.as_str().to_owned()).unwrap_or_default(),
            height,
        }
    }

    /// Height this AAD is bound to.
    #[must_use]
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Bytes a [`SignedEnvelope`] signature covers.
    pub fn signing_input(&self, data: &[u8]) -> Result<Vec<u8>> {
        codec::encode(&(Self::SIGNATURE_DOMAIN, &self.contract_id, self.height, serde_bytes_ref(data)))
    }

    /// Associated data for [`EncryptedEnvelope`] ciphertexts.
    pub fn encryption_aad(&self) -> Result<Vec<u8>> {
        codec::encode(&(Self::ENCRYPTION_DOMAIN, &self.contract_id, self.height))
    }
}

/// Encode borrowed bytes as a CBOR byte string rather than an array of ints.
fn serde_bytes_ref(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Hash;

    #[test]
    fn aad_binds_contract_and_height() {
        let a = ContractId::from_genesis(Hash::digest(b"a"));
        let b = ContractId::from_genesis(Hash::digest(b"b"));

        let base = Aad::new(Some(&a), 3).encryption_aad().unwrap();
        assert_ne!(base, Aad::new(Some(&b), 3).encryption_aad().unwrap());
        assert_ne!(base, Aad::new(Some(&a), 4).encryption_aad().unwrap());
        assert_ne!(base, Aad::new(None, 3).encryption_aad().unwrap());
    }

    #[test]
    fn signing_and_encryption_domains_differ() {
        let aad = Aad::new(None, 0);
        assert_ne!(aad.signing_input(&[]).unwrap(), aad.encryption_aad().unwrap());
    }

    #[test]
    fn payload_key_id() {
        let plain: Payload<String> = Payload::Plain("x".into());
        assert_eq!(plain.key_id(), None);

        let enc: Payload<String> =
            Payload::Encrypted(EncryptedEnvelope::new(KeyId::from("k1"), Bytes::from_static(b"ct")));
        assert_eq!(enc.key_id(), Some(&KeyId::from("k1")));
    }
}
