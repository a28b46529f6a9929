//! Opening incoming envelopes and sealing outgoing ones.
//!
//! Incoming data is checked against the contract's key table at the
//! message's height: a signature only counts if the signing key was valid
//! there and has the `sig` purpose; a ciphertext only opens with a key valid
//! there that has the `enc` purpose and whose secret is held locally.
//!
//! Outgoing data is described by [`Outgoing`] and sealed lazily. Signatures
//! and ciphertexts are bound to the message height, which is only known once
//! the publisher reads the latest head, so every publish attempt seals again.

use bytes::Bytes;
use chelonia_crypto::{ENCRYPTION_RANDOMNESS, Key};
use chelonia_proto::{Aad, EncryptedEnvelope, KeyId, KeyPurpose, Payload, SignedEnvelope, codec};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    error::ChelError,
    keys::{AuthorizedKey, KeyTable},
    secrets::SecretKeyStore,
};

/// What incoming envelopes are checked against.
#[derive(Debug, Clone, Copy)]
pub struct OpenContext<'a> {
    /// Key table at the time the message is applied
    pub keys: &'a KeyTable,
    /// Locally held secrets
    pub secrets: &'a SecretKeyStore,
    /// Log position the envelope must be bound to
    pub aad: &'a Aad,
}

/// An opened payload and the keys it was wrapped with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened<T> {
    /// Decoded value
    pub value: T,
    /// Inner signing key, if the value was signed
    pub signing_key_id: Option<KeyId>,
    /// Encryption key, if the value was encrypted
    pub encryption_key_id: Option<KeyId>,
}

/// Look up `key_id` and check it may be used for `purpose` at the context
/// height.
pub fn authorize<'a>(keys: &'a KeyTable, key_id: &KeyId, height: u64, purpose: KeyPurpose) -> Result<&'a AuthorizedKey, ChelError> {
    let key = keys.get(key_id).ok_or_else(|| ChelError::SignatureKeyNotFound { key_id: key_id.clone() })?;
    if !key.is_valid_at(height) {
        return Err(ChelError::unauthorized(key_id, format!("not valid at height {height}")));
    }
    if !key.has_purpose(purpose) {
        return Err(ChelError::unauthorized(key_id, format!("missing purpose {purpose:?}")));
    }
    Ok(key)
}

/// Verify a signed envelope and decode its value.
pub fn verify_signed<T: DeserializeOwned>(
    envelope: &SignedEnvelope<T>,
    ctx: &OpenContext<'_>,
) -> Result<(T, KeyId), ChelError> {
    let key = authorize(ctx.keys, &envelope.key_id, ctx.aad.height(), KeyPurpose::Sig)?;
    let public = Key::deserialize(&key.data)
        .map_err(|e| ChelError::unauthorized(&envelope.key_id, format!("unusable public key: {e}")))?;

    let input = ctx.aad.signing_input(&envelope.data)?;
    public
        .verify(&input, &envelope.signature)
        .map_err(|_| ChelError::SignatureError { key_id: envelope.key_id.clone() })?;

    let value = codec::decode(&envelope.data)?;
    Ok((value, envelope.key_id.clone()))
}

/// Decrypt an encrypted envelope to the payload it wraps.
pub fn decrypt<T: DeserializeOwned>(
    envelope: &EncryptedEnvelope<T>,
    ctx: &OpenContext<'_>,
) -> Result<Payload<T>, ChelError> {
    authorize(ctx.keys, &envelope.key_id, ctx.aad.height(), KeyPurpose::Enc)?;
    let secret = ctx
        .secrets
        .get(&envelope.key_id)
        .ok_or_else(|| ChelError::DecryptionKeyNotFound { key_id: envelope.key_id.clone() })?;

    let plaintext = secret
        .decrypt(&envelope.ciphertext, &ctx.aad.encryption_aad()?)
        .map_err(|e| ChelError::DecryptionError(format!("key {}: {e}", envelope.key_id)))?;
    codec::decode(&plaintext).map_err(|e| ChelError::DecryptionError(e.to_string()))
}

/// Open any payload form.
///
/// Encrypted payloads must decrypt to a plain or signed payload; nested
/// encryption is malformed.
pub fn open<T: DeserializeOwned>(payload: &Payload<T>, ctx: &OpenContext<'_>) -> Result<Opened<T>, ChelError>
where
    T: Clone,
{
    match payload {
        Payload::Plain(value) => Ok(Opened { value: value.clone(), signing_key_id: None, encryption_key_id: None }),
        Payload::Signed(envelope) => {
            let (value, key_id) = verify_signed(envelope, ctx)?;
            Ok(Opened { value, signing_key_id: Some(key_id), encryption_key_id: None })
        },
        Payload::Encrypted(envelope) => open_encrypted(envelope, ctx),
    }
}

/// Decrypt and open an encrypted envelope.
pub fn open_encrypted<T: DeserializeOwned>(
    envelope: &EncryptedEnvelope<T>,
    ctx: &OpenContext<'_>,
) -> Result<Opened<T>, ChelError> {
    let encryption_key_id = Some(envelope.key_id.clone());
    match decrypt(envelope, ctx)? {
        Payload::Plain(value) => Ok(Opened { value, signing_key_id: None, encryption_key_id }),
        Payload::Signed(inner) => {
            let (value, key_id) = verify_signed(&inner, ctx)?;
            Ok(Opened { value, signing_key_id: Some(key_id), encryption_key_id })
        },
        Payload::Encrypted(_) => Err(ChelError::MalformedMessage("nested encryption".into())),
    }
}

/// Randomness source for sealing.
pub trait RandomSource {
    /// Fill `buffer` with random bytes.
    fn fill(&self, buffer: &mut [u8]);
}

impl<E: crate::env::Environment> RandomSource for E {
    fn fill(&self, buffer: &mut [u8]) {
        self.random_bytes(buffer);
    }
}

/// What outgoing envelopes are sealed with.
pub struct SealContext<'a> {
    /// Key table of the contract being published to
    pub keys: &'a KeyTable,
    /// Locally held secrets
    pub secrets: &'a SecretKeyStore,
    /// Position of the message being built
    pub aad: &'a Aad,
    /// Nonces and ephemeral keys
    pub rng: &'a dyn RandomSource,
}

/// Outgoing data, sealed on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing<T> {
    /// Sent as is
    Plain(T),
    /// Signed with a local secret
    Signed {
        /// Signing key
        key_id: KeyId,
        /// Value to sign
        value: T,
    },
    /// Encrypted to a contract key, wrapping a plain or signed value
    Encrypted {
        /// Encryption key
        key_id: KeyId,
        /// Value to encrypt
        inner: Box<Outgoing<T>>,
    },
}

impl<T: Serialize + Clone> Outgoing<T> {
    /// Produce the wire payload for the position in `ctx`.
    pub fn seal(&self, ctx: &SealContext<'_>) -> Result<Payload<T>, ChelError> {
        match self {
            Self::Plain(value) => Ok(Payload::Plain(value.clone())),
            Self::Signed { key_id, value } => Ok(Payload::Signed(sign(key_id, value, ctx)?)),
            Self::Encrypted { key_id, inner } => {
                let inner = match inner.as_ref() {
                    Self::Encrypted { .. } => {
                        return Err(ChelError::InvalidOperation("nested encryption".into()));
                    },
                    other => other.seal(ctx)?,
                };
                Ok(Payload::Encrypted(encrypt(key_id, &inner, ctx)?))
            },
        }
    }

    /// Seal and require an encrypted result.
    pub fn seal_encrypted(&self, ctx: &SealContext<'_>) -> Result<EncryptedEnvelope<T>, ChelError> {
        match self.seal(ctx)? {
            Payload::Encrypted(envelope) => Ok(envelope),
            _ => Err(ChelError::InvalidOperation("expected an encrypted payload".into())),
        }
    }
}

/// Sign `value` with the local secret for `key_id`.
pub fn sign<T: Serialize>(key_id: &KeyId, value: &T, ctx: &SealContext<'_>) -> Result<SignedEnvelope<T>, ChelError> {
    let secret = ctx
        .secrets
        .get(key_id)
        .ok_or_else(|| ChelError::InvalidOperation(format!("no secret for signing key {key_id}")))?;
    let data = codec::encode(value)?;
    let signature = secret.sign(&ctx.aad.signing_input(&data)?)?;
    Ok(SignedEnvelope::new(key_id.clone(), Bytes::from(data), Bytes::copy_from_slice(&signature)))
}

/// Encrypt `value` to contract key `key_id`.
///
/// Uses the local secret when held (required for symmetric keys), otherwise
/// the public key from the key table.
pub fn encrypt<T: Serialize, V: Serialize>(
    key_id: &KeyId,
    value: &V,
    ctx: &SealContext<'_>,
) -> Result<EncryptedEnvelope<T>, ChelError> {
    let key = match ctx.secrets.get(key_id) {
        Some(secret) => secret,
        None => {
            let entry = ctx
                .keys
                .get(key_id)
                .ok_or_else(|| ChelError::InvalidOperation(format!("unknown encryption key {key_id}")))?;
            Key::deserialize(&entry.data)?
        },
    };
    encrypt_with(&key, value, ctx)
}

/// Encrypt `value` with an explicit key.
pub fn encrypt_with<T: Serialize, V: Serialize>(
    key: &Key,
    value: &V,
    ctx: &SealContext<'_>,
) -> Result<EncryptedEnvelope<T>, ChelError> {
    let plaintext = codec::encode(value)?;
    let mut randomness = [0u8; ENCRYPTION_RANDOMNESS];
    ctx.rng.fill(&mut randomness);
    let ciphertext = key.encrypt(&plaintext, &ctx.aad.encryption_aad()?, randomness)?;
    Ok(EncryptedEnvelope::new(KeyId::new(key.id()), Bytes::from(ciphertext)))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chelonia_crypto::KeyAlgorithm;
    use chelonia_proto::{ContractId, Hash, KeyDescriptor, KeyMeta, Scope};

    use super::*;

    struct FixedRng;

    impl RandomSource for FixedRng {
        fn fill(&self, buffer: &mut [u8]) {
            buffer.fill(7);
        }
    }

    fn table_with(keys: &[(&Key, KeyPurpose, u64)]) -> KeyTable {
        keys.iter()
            .map(|(key, purpose, height)| {
                let descriptor = KeyDescriptor {
                    id: KeyId::new(key.id()),
                    name: key.id(),
                    purpose: BTreeSet::from([*purpose]),
                    ring_level: 0,
                    permissions: Scope::All,
                    allowed_actions: Scope::All,
                    data: key.serialize(false),
                    foreign_key: None,
                    meta: KeyMeta::default(),
                };
                (descriptor.id.clone(), AuthorizedKey::from_descriptor(descriptor, *height, None))
            })
            .collect()
    }

    fn aad(height: u64) -> Aad {
        Aad::new(Some(&ContractId::from_genesis(Hash::digest(b"c"))), height)
    }

    #[test]
    fn signed_then_encrypted_opens_with_both_ids() {
        let sig = Key::generate(KeyAlgorithm::Ed25519, [1; 32]);
        let enc = Key::generate(KeyAlgorithm::X25519, [2; 32]);
        let keys = table_with(&[(&sig, KeyPurpose::Sig, 0), (&enc, KeyPurpose::Enc, 0)]);
        let secrets = SecretKeyStore::new();
        secrets.insert(sig.clone());
        secrets.insert(enc.clone());
        let aad = aad(4);

        let outgoing = Outgoing::Encrypted {
            key_id: KeyId::new(enc.id()),
            inner: Box::new(Outgoing::Signed { key_id: KeyId::new(sig.id()), value: "hello".to_string() }),
        };
        let seal = SealContext { keys: &keys, secrets: &secrets, aad: &aad, rng: &FixedRng };
        let payload = outgoing.seal(&seal).unwrap();

        let opened = open(&payload, &OpenContext { keys: &keys, secrets: &secrets, aad: &aad }).unwrap();
        assert_eq!(opened.value, "hello");
        assert_eq!(opened.signing_key_id, Some(KeyId::new(sig.id())));
        assert_eq!(opened.encryption_key_id, Some(KeyId::new(enc.id())));
    }

    #[test]
    fn missing_secret_is_distinct_from_bad_ciphertext() {
        let enc = Key::generate(KeyAlgorithm::X25519, [2; 32]);
        let keys = table_with(&[(&enc, KeyPurpose::Enc, 0)]);
        let sender = SecretKeyStore::new();
        let receiver = SecretKeyStore::new();
        let aad = aad(1);

        let seal = SealContext { keys: &keys, secrets: &sender, aad: &aad, rng: &FixedRng };
        let payload = Outgoing::Encrypted {
            key_id: KeyId::new(enc.id()),
            inner: Box::new(Outgoing::Plain(1u32)),
        }
        .seal(&seal)
        .unwrap();

        let result = open(&payload, &OpenContext { keys: &keys, secrets: &receiver, aad: &aad });
        assert!(matches!(result, Err(ChelError::DecryptionKeyNotFound { .. })));

        receiver.insert(enc.clone());
        let wrong_height = Aad::new(Some(&ContractId::from_genesis(Hash::digest(b"c"))), 2);
        let result = open(&payload, &OpenContext { keys: &keys, secrets: &receiver, aad: &wrong_height });
        assert!(matches!(result, Err(ChelError::DecryptionError(_))));
    }

    #[test]
    fn signature_from_key_not_yet_valid_is_unauthorized() {
        let sig = Key::generate(KeyAlgorithm::Ed25519, [1; 32]);
        let keys = table_with(&[(&sig, KeyPurpose::Sig, 5)]);
        let secrets = SecretKeyStore::new();
        secrets.insert(sig.clone());
        let aad = aad(3);

        let seal = SealContext { keys: &keys, secrets: &secrets, aad: &aad, rng: &FixedRng };
        let payload = Outgoing::Signed { key_id: KeyId::new(sig.id()), value: 1u8 }.seal(&seal).unwrap();

        let result = open(&payload, &OpenContext { keys: &keys, secrets: &secrets, aad: &aad });
        assert!(matches!(result, Err(ChelError::SignatureKeyUnauthorized { .. })));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let sig = Key::generate(KeyAlgorithm::Ed25519, [1; 32]);
        let keys = table_with(&[(&sig, KeyPurpose::Sig, 0)]);
        let secrets = SecretKeyStore::new();
        secrets.insert(sig.clone());
        let aad = aad(0);

        let seal = SealContext { keys: &keys, secrets: &secrets, aad: &aad, rng: &FixedRng };
        let Payload::Signed(envelope) = Outgoing::Signed { key_id: KeyId::new(sig.id()), value: 1u8 }.seal(&seal).unwrap()
        else {
            panic!("expected signed payload");
        };
        let forged: SignedEnvelope<u8> =
            SignedEnvelope::new(envelope.key_id.clone(), Bytes::from(codec::encode(&2u8).unwrap()), envelope.signature);

        let result = verify_signed(&forged, &OpenContext { keys: &keys, secrets: &secrets, aad: &aad });
        assert!(matches!(result, Err(ChelError::SignatureError { .. })));
    }
}
