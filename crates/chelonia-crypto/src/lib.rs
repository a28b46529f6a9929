//! Chelonia cryptographic primitives.
//!
//! Contract keys come in three algorithms:
//!
//! - `Ed25519` for signing messages and envelopes
//! - `X25519` for encrypting to a key whose secret only some members hold
//! - `XChaCha20` for symmetric keys shared through the log
//!
//! All functions are pure. Operations that need randomness (key generation,
//! encryption) take the random bytes from the caller so that simulation runs
//! are reproducible from a seed.
//!
//! # Key identity
//!
//! A key id is the hex SHA-256 of the algorithm tag and the public material.
//! Symmetric keys have no public half, so their "public" material is a
//! SHA-256 commitment to the secret. Either way the id can be checked against
//! any serialized copy of the key, which is how shared secrets are matched to
//! the ids announced in the log.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod ecies;
pub mod error;
pub mod key;

pub use error::CryptoError;
pub use key::{ENCRYPTION_RANDOMNESS, Key, KeyAlgorithm, SEED_SIZE};
