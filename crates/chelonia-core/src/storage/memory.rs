#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chelonia_proto::{ContractId, Hash};

use super::{LogEntry, Storage, StorageError, check_append};

/// In-memory storage for tests and simulation.
///
/// Clones share the same maps, so a restarted engine can be built over the
/// storage of the one it replaces.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    values: HashMap<String, Vec<u8>>,
    /// Entries per contract, in height order starting at 0
    logs: HashMap<ContractId, Vec<LogEntry>>,
}

impl MemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of contracts with a log.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn contract_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").logs.len()
    }

    /// Number of stored key/value entries.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn value_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").values.len()
    }
}

impl Storage for MemoryStorage {
    #[allow(clippy::expect_used)]
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").values.get(key).cloned())
    }

    #[allow(clippy::expect_used)]
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.inner.lock().expect("Mutex poisoned").values.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.lock().expect("Mutex poisoned").values.remove(key);
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn append_entry(&self, contract_id: &ContractId, entry: &LogEntry) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        let log = inner.logs.entry(contract_id.clone()).or_default();

        let latest = log.last().map(|last| (&last.hash, last.height));
        check_append(latest, entry)?;
        log.push(entry.clone());

        debug_assert_eq!(log.len() as u64 - 1, entry.height);
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn latest_entry(&self, contract_id: &ContractId) -> Result<Option<(Hash, u64)>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.logs.get(contract_id).and_then(|log| log.last()).map(|last| (last.hash.clone(), last.height)))
    }

    #[allow(clippy::expect_used)]
    fn load_entries(
        &self,
        contract_id: &ContractId,
        from_height: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        let Some(log) = inner.logs.get(contract_id) else {
            return Ok(Vec::new());
        };
        let start = usize::try_from(from_height).unwrap_or(usize::MAX).min(log.len());
        Ok(log[start..].iter().take(limit).cloned().collect())
    }

    #[allow(clippy::expect_used)]
    fn clear_log(&self, contract_id: &ContractId) -> Result<(), StorageError> {
        self.inner.lock().expect("Mutex poisoned").logs.remove(contract_id);
        Ok(())
    }
}
