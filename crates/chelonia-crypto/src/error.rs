//! Error types for key operations.

use thiserror::Error;

/// Errors from key parsing, signing and envelope encryption.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Serialized key does not parse.
    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// Algorithm tag not recognised.
    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Operation needs the secret half but only the public half is loaded.
    #[error("{operation} requires a secret key")]
    MissingSecret {
        /// Operation attempted
        operation: &'static str,
    },

    /// Algorithm cannot perform the operation (e.g. encrypting with Ed25519).
    #[error("{algorithm} keys cannot {operation}")]
    WrongAlgorithm {
        /// Algorithm tag of the key
        algorithm: &'static str,
        /// Operation attempted
        operation: &'static str,
    },

    /// Signature is malformed or does not verify.
    #[error("signature verification failed")]
    InvalidSignature,

    /// Ciphertext is shorter than its fixed-size prefix plus tag.
    #[error("ciphertext too short: {len} bytes")]
    CiphertextTooShort {
        /// Actual length
        len: usize,
    },

    /// AEAD authentication failed: wrong key, wrong AAD, or tampering.
    #[error("decryption failed")]
    DecryptionFailed,
}
