//! Storage wrapper that injects failures.
//!
//! Used to check that a failed write never leaves in-memory contract state
//! ahead of the durable log.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use chelonia_proto::{ContractId, Hash};

use super::{LogEntry, Storage, StorageError};

/// Wrapper that fails operations with a fixed probability.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 never fails, 1.0 always fails)
    failure_rate: f64,
    rng: Arc<Mutex<ChaoticRng>>,
    injected: Arc<AtomicUsize>,
}

/// LCG so chaos runs are reproducible from a seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn next(&mut self) -> f64 {
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Wrap `inner` with a reproducible failure sequence.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in `[0.0, 1.0]`.
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );
        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng { state: seed })),
            injected: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying storage.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Failures injected so far.
    pub fn injected_failures(&self) -> usize {
        self.injected.load(Ordering::Relaxed)
    }

    fn chaos(&self) -> Result<(), StorageError> {
        #[allow(clippy::expect_used)]
        let fail = self.rng.lock().expect("ChaoticRng mutex poisoned").next() < self.failure_rate;
        if fail {
            self.injected.fetch_add(1, Ordering::Relaxed);
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.chaos()?;
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.chaos()?;
        self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.chaos()?;
        self.inner.delete(key)
    }

    fn append_entry(&self, contract_id: &ContractId, entry: &LogEntry) -> Result<(), StorageError> {
        self.chaos()?;
        self.inner.append_entry(contract_id, entry)
    }

    fn latest_entry(&self, contract_id: &ContractId) -> Result<Option<(Hash, u64)>, StorageError> {
        self.chaos()?;
        self.inner.latest_entry(contract_id)
    }

    fn load_entries(
        &self,
        contract_id: &ContractId,
        from_height: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StorageError> {
        self.chaos()?;
        self.inner.load_entries(contract_id, from_height, limit)
    }

    fn clear_log(&self, contract_id: &ContractId) -> Result<(), StorageError> {
        self.chaos()?;
        self.inner.clear_log(contract_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn zero_rate_never_fails() {
        let storage = ChaoticStorage::with_seed(MemoryStorage::new(), 0.0, 1);
        for i in 0..100 {
            storage.set(&format!("k{i}"), b"v").unwrap();
        }
        assert_eq!(storage.injected_failures(), 0);
    }

    #[test]
    fn full_rate_always_fails() {
        let storage = ChaoticStorage::with_seed(MemoryStorage::new(), 1.0, 1);
        assert!(storage.get("k").is_err());
        assert_eq!(storage.injected_failures(), 1);
        assert_eq!(storage.inner().value_count(), 0);
    }

    #[test]
    fn same_seed_same_failures() {
        let run = |seed| {
            let storage = ChaoticStorage::with_seed(MemoryStorage::new(), 0.5, seed);
            (0..64).map(|_| storage.get("k").is_err()).collect::<Vec<_>>()
        };
        assert_eq!(run(7), run(7));
    }
}
