//! Contract keys.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::{
    ecies::{self, NONCE_SIZE},
    error::CryptoError,
};

/// Bytes of caller randomness needed to generate a key.
pub const SEED_SIZE: usize = 32;

/// Bytes of caller randomness consumed by [`Key::encrypt`]
/// (ephemeral X25519 seed followed by the AEAD nonce).
pub const ENCRYPTION_RANDOMNESS: usize = 32 + NONCE_SIZE;

const SYMMETRIC_COMMITMENT_DOMAIN: &[u8] = b"chelonia-xchacha20-commitment";

/// Key algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    /// Ed25519 signing key
    Ed25519,
    /// X25519 encryption key
    X25519,
    /// `XChaCha20-Poly1305` symmetric key
    XChaCha20,
}

impl KeyAlgorithm {
    /// Serialization tag.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::X25519 => "x25519",
            Self::XChaCha20 => "xchacha20",
        }
    }

    /// Parse a serialization tag.
    pub fn from_tag(tag: &str) -> Result<Self, CryptoError> {
        match tag {
            "ed25519" => Ok(Self::Ed25519),
            "x25519" => Ok(Self::X25519),
            "xchacha20" => Ok(Self::XChaCha20),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_owned())),
        }
    }
}

/// A contract key, public-only or with its secret.
///
/// Serialized as `<alg>:pub:<hex>` or `<alg>:sec:<hex>`. The secret form is
/// what gets encrypted into `OP_KEY_SHARE` and private key metadata; the
/// public form is what descriptors carry in their `data` field.
///
/// # Security
///
/// Secret material is held in [`Zeroizing`] and wiped on drop. `Debug` never
/// prints it.
#[derive(Clone)]
pub struct Key {
    algorithm: KeyAlgorithm,
    public: [u8; 32],
    secret: Option<Zeroizing<[u8; 32]>>,
}

impl Key {
    /// Derive a key from caller-provided random bytes.
    #[must_use]
    pub fn generate(algorithm: KeyAlgorithm, seed: [u8; SEED_SIZE]) -> Self {
        let public = public_from_secret(algorithm, &seed);
        Self { algorithm, public, secret: Some(Zeroizing::new(seed)) }
    }

    /// Algorithm.
    #[must_use]
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Whether the secret half is loaded.
    #[must_use]
    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Copy without the secret half.
    #[must_use]
    pub fn public_only(&self) -> Self {
        Self { algorithm: self.algorithm, public: self.public, secret: None }
    }

    /// Key id: hex SHA-256 over the algorithm tag and public material.
    #[must_use]
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.algorithm.tag().as_bytes());
        hasher.update(b":");
        hasher.update(self.public);
        hex::encode(hasher.finalize())
    }

    /// Serialize, including the secret only when asked and available.
    #[must_use]
    pub fn serialize(&self, include_secret: bool) -> String {
        match (&self.secret, include_secret) {
            (Some(secret), true) => format!("{}:sec:{}", self.algorithm.tag(), hex::encode(secret.as_slice())),
            _ => format!("{}:pub:{}", self.algorithm.tag(), hex::encode(self.public)),
        }
    }

    /// Parse a serialized key.
    pub fn deserialize(value: &str) -> Result<Self, CryptoError> {
        let mut parts = value.splitn(3, ':');
        let (Some(tag), Some(kind), Some(material)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(CryptoError::InvalidKeyFormat("expected <alg>:<pub|sec>:<hex>".into()));
        };
        let algorithm = KeyAlgorithm::from_tag(tag)?;

        let mut bytes = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(material, &mut bytes[..])
            .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?;

        match kind {
            "sec" => Ok(Self::generate(algorithm, *bytes)),
            "pub" => {
                if algorithm == KeyAlgorithm::Ed25519 && VerifyingKey::from_bytes(&bytes).is_err() {
                    return Err(CryptoError::InvalidKeyFormat("not an Ed25519 point".into()));
                }
                Ok(Self { algorithm, public: *bytes, secret: None })
            },
            other => Err(CryptoError::InvalidKeyFormat(format!("unknown key kind {other:?}"))),
        }
    }

    /// Sign `data`. Only Ed25519 keys sign.
    pub fn sign(&self, data: &[u8]) -> Result<[u8; 64], CryptoError> {
        self.require_algorithm(KeyAlgorithm::Ed25519, "sign")?;
        let secret = self.secret.as_ref().ok_or(CryptoError::MissingSecret { operation: "sign" })?;
        Ok(SigningKey::from_bytes(secret).sign(data).to_bytes())
    }

    /// Verify a signature produced by [`Key::sign`].
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        self.require_algorithm(KeyAlgorithm::Ed25519, "verify")?;
        let verifying = VerifyingKey::from_bytes(&self.public).map_err(|_| CryptoError::InvalidSignature)?;
        let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
        verifying.verify_strict(data, &signature).map_err(|_| CryptoError::InvalidSignature)
    }

    /// Encrypt `plaintext` bound to `aad`.
    ///
    /// X25519 keys encrypt with the public half; symmetric keys need the
    /// secret. `randomness` supplies the ephemeral seed and nonce.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        aad: &[u8],
        randomness: [u8; ENCRYPTION_RANDOMNESS],
    ) -> Result<Vec<u8>, CryptoError> {
        let (seed, nonce) = split_randomness(randomness);
        match self.algorithm {
            KeyAlgorithm::X25519 => Ok(ecies::seal_to(&self.public, seed, nonce, plaintext, aad)),
            KeyAlgorithm::XChaCha20 => {
                let secret = self.secret.as_ref().ok_or(CryptoError::MissingSecret { operation: "encrypt" })?;
                Ok(ecies::seal_symmetric(secret, nonce, plaintext, aad))
            },
            KeyAlgorithm::Ed25519 => {
                Err(CryptoError::WrongAlgorithm { algorithm: self.algorithm.tag(), operation: "encrypt" })
            },
        }
    }

    /// Decrypt data produced by [`Key::encrypt`] with the same `aad`.
    pub fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let secret = self.secret.as_ref().ok_or(CryptoError::MissingSecret { operation: "decrypt" })?;
        match self.algorithm {
            KeyAlgorithm::X25519 => ecies::open_from(secret, ciphertext, aad),
            KeyAlgorithm::XChaCha20 => ecies::open_symmetric(secret, ciphertext, aad),
            KeyAlgorithm::Ed25519 => {
                Err(CryptoError::WrongAlgorithm { algorithm: self.algorithm.tag(), operation: "decrypt" })
            },
        }
    }

    fn require_algorithm(&self, expected: KeyAlgorithm, operation: &'static str) -> Result<(), CryptoError> {
        if self.algorithm == expected {
            Ok(())
        } else {
            Err(CryptoError::WrongAlgorithm { algorithm: self.algorithm.tag(), operation })
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm && self.public == other.public
    }
}

impl Eq for Key {}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("algorithm", &self.algorithm)
            .field("id", &self.id())
            .field("has_secret", &self.has_secret())
            .finish()
    }
}

fn public_from_secret(algorithm: KeyAlgorithm, secret: &[u8; 32]) -> [u8; 32] {
    match algorithm {
        KeyAlgorithm::Ed25519 => SigningKey::from_bytes(secret).verifying_key().to_bytes(),
        KeyAlgorithm::X25519 => PublicKey::from(&StaticSecret::from(*secret)).to_bytes(),
        KeyAlgorithm::XChaCha20 => {
            let mut hasher = Sha256::new();
            hasher.update(SYMMETRIC_COMMITMENT_DOMAIN);
            hasher.update(secret);
            hasher.finalize().into()
        },
    }
}

fn split_randomness(randomness: [u8; ENCRYPTION_RANDOMNESS]) -> ([u8; 32], [u8; NONCE_SIZE]) {
    let mut seed = [0u8; 32];
    let mut nonce = [0u8; NONCE_SIZE];
    seed.copy_from_slice(&randomness[..32]);
    nonce.copy_from_slice(&randomness[32..]);
    (seed, nonce)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn sign_and_verify() {
        let key = Key::generate(KeyAlgorithm::Ed25519, [1; 32]);
        let signature = key.sign(b"data").unwrap();

        let public = key.public_only();
        assert!(public.verify(b"data", &signature).is_ok());
        assert_eq!(public.verify(b"other", &signature), Err(CryptoError::InvalidSignature));
        assert_eq!(public.sign(b"data"), Err(CryptoError::MissingSecret { operation: "sign" }));
    }

    #[test]
    fn serialization_preserves_identity() {
        for algorithm in [KeyAlgorithm::Ed25519, KeyAlgorithm::X25519, KeyAlgorithm::XChaCha20] {
            let key = Key::generate(algorithm, [7; 32]);

            let secret = Key::deserialize(&key.serialize(true)).unwrap();
            assert!(secret.has_secret());
            assert_eq!(secret.id(), key.id());

            let public = Key::deserialize(&key.serialize(false)).unwrap();
            assert!(!public.has_secret());
            assert_eq!(public.id(), key.id());
        }
    }

    #[test]
    fn public_only_never_serializes_secret() {
        let key = Key::generate(KeyAlgorithm::X25519, [2; 32]);
        assert!(key.public_only().serialize(true).contains(":pub:"));
    }

    #[test]
    fn ids_differ_across_algorithms() {
        let seed = [4; 32];
        let ed = Key::generate(KeyAlgorithm::Ed25519, seed).id();
        let x = Key::generate(KeyAlgorithm::X25519, seed).id();
        let sym = Key::generate(KeyAlgorithm::XChaCha20, seed).id();
        assert_ne!(ed, x);
        assert_ne!(x, sym);
    }

    #[test]
    fn x25519_public_key_encrypts_secret_decrypts() {
        let key = Key::generate(KeyAlgorithm::X25519, [3; 32]);
        let sealed = key.public_only().encrypt(b"payload", b"aad", [9; ENCRYPTION_RANDOMNESS]).unwrap();

        assert_eq!(key.decrypt(&sealed, b"aad").unwrap(), b"payload");
        assert_eq!(key.decrypt(&sealed, b"other"), Err(CryptoError::DecryptionFailed));
        assert!(key.public_only().decrypt(&sealed, b"aad").is_err());
    }

    #[test]
    fn symmetric_key_needs_secret_to_encrypt() {
        let key = Key::generate(KeyAlgorithm::XChaCha20, [5; 32]);
        assert!(key.public_only().encrypt(b"x", b"", [0; ENCRYPTION_RANDOMNESS]).is_err());

        let sealed = key.encrypt(b"x", b"", [1; ENCRYPTION_RANDOMNESS]).unwrap();
        assert_eq!(key.decrypt(&sealed, b"").unwrap(), b"x");
    }

    #[test]
    fn signing_keys_do_not_encrypt() {
        let key = Key::generate(KeyAlgorithm::Ed25519, [5; 32]);
        assert!(matches!(
            key.encrypt(b"x", b"", [0; ENCRYPTION_RANDOMNESS]),
            Err(CryptoError::WrongAlgorithm { .. })
        ));
    }

    #[test]
    fn malformed_serializations_are_rejected() {
        assert!(Key::deserialize("ed25519:pub").is_err());
        assert!(Key::deserialize("rsa:pub:00").is_err());
        assert!(Key::deserialize("x25519:pub:zz").is_err());
        assert!(Key::deserialize("x25519:raw:0000000000000000000000000000000000000000000000000000000000000000").is_err());
    }

    proptest! {
        #[test]
        fn encryption_round_trips(
            seed in any::<[u8; 32]>(),
            plaintext in prop::collection::vec(any::<u8>(), 0..256),
            aad in prop::collection::vec(any::<u8>(), 0..32),
        ) {
            let key = Key::generate(KeyAlgorithm::X25519, seed);
            let sealed = key.encrypt(&plaintext, &aad, [seed[0]; ENCRYPTION_RANDOMNESS]).unwrap();
            prop_assert_eq!(key.decrypt(&sealed, &aad).unwrap(), plaintext);
        }

        #[test]
        fn tampering_is_detected(seed in any::<[u8; 32]>(), flip in 0usize..80) {
            let key = Key::generate(KeyAlgorithm::X25519, seed);
            let mut sealed = key.encrypt(b"0123456789", b"aad", [1; ENCRYPTION_RANDOMNESS]).unwrap();
            let index = flip % sealed.len();
            sealed[index] ^= 0x01;
            prop_assert!(key.decrypt(&sealed, b"aad").is_err());
        }
    }
}
