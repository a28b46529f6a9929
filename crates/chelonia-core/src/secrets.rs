//! Local secret key store.
//!
//! Secrets arrive from the host (keys it generated), from private key
//! metadata in `OP_KEY_ADD`, and from `OP_KEY_SHARE`. The store is shared by
//! every contract: a key shared for one contract may decrypt another that
//! mirrors it.

#![allow(clippy::disallowed_types, reason = "Synchronous map access only")]

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use chelonia_crypto::Key;
use chelonia_proto::KeyId;

/// Shared secret key store.
#[derive(Debug, Clone, Default)]
pub struct SecretKeyStore {
    keys: Arc<RwLock<HashMap<KeyId, Key>>>,
}

impl SecretKeyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret key, returning its id. Public-only keys are ignored.
    pub fn insert(&self, key: Key) -> Option<KeyId> {
        if !key.has_secret() {
            return None;
        }
        let id = KeyId::new(key.id());
        self.keys.write().unwrap_or_else(PoisonError::into_inner).insert(id.clone(), key);
        Some(id)
    }

    /// Secret key by id.
    #[must_use]
    pub fn get(&self, id: &KeyId) -> Option<Key> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    /// Whether the secret for `id` is held.
    #[must_use]
    pub fn contains(&self, id: &KeyId) -> bool {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).contains_key(id)
    }

    /// Forget a secret.
    pub fn remove(&self, id: &KeyId) -> bool {
        self.keys.write().unwrap_or_else(PoisonError::into_inner).remove(id).is_some()
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.keys.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Number of held secrets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use chelonia_crypto::KeyAlgorithm;

    use super::*;

    #[test]
    fn public_keys_are_not_stored() {
        let store = SecretKeyStore::new();
        let key = Key::generate(KeyAlgorithm::Ed25519, [1; 32]);

        assert_eq!(store.insert(key.public_only()), None);
        assert!(store.is_empty());

        let id = store.insert(key).unwrap();
        assert!(store.contains(&id));
        assert!(store.get(&id).unwrap().has_secret());
    }

    #[test]
    fn clones_share_contents() {
        let store = SecretKeyStore::new();
        let clone = store.clone();
        let id = store.insert(Key::generate(KeyAlgorithm::X25519, [2; 32])).unwrap();
        assert!(clone.contains(&id));

        clone.clear();
        assert!(!store.contains(&id));
    }
}
