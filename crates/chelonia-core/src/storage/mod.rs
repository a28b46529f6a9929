//! Persistence abstraction.
//!
//! Two kinds of data live here: a key/value store for the root index and
//! cached contract state, and one append-only log per contract. The log is
//! the durable record; cached state can always be rebuilt from it.
//!
//! The trait is synchronous. Implementations share internal state, so clones
//! see the same data.

mod chaotic;
mod error;
mod memory;

use bytes::Bytes;
pub use chaotic::ChaoticStorage;
use chelonia_proto::{ContractId, Hash};
pub use error::StorageError;
pub use memory::MemoryStorage;

/// Key under which a contract's [`crate::state::ContractMeta`] is stored.
#[must_use]
pub fn meta_key(contract_id: &ContractId) -> String {
    format!("chelonia/meta/{contract_id}")
}

/// Key under which a contract's cached [`crate::state::ContractState`] is
/// stored.
#[must_use]
pub fn state_key(contract_id: &ContractId) -> String {
    format!("chelonia/state/{contract_id}")
}

/// Key of the list of known contracts.
pub const INDEX_KEY: &str = "chelonia/index";

/// Key of the persistent reference counts.
pub const REFS_KEY: &str = "chelonia/refs";

/// Key marking a contract as permanently deleted.
#[must_use]
pub fn tombstone_key(contract_id: &ContractId) -> String {
    format!("chelonia/tombstone/{contract_id}")
}

/// One entry of a contract log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Message hash
    pub hash: Hash,
    /// Hash of the preceding entry; absent for genesis
    pub previous_head: Option<Hash>,
    /// Message height
    pub height: u64,
    /// Wire bytes
    pub raw: Bytes,
}

/// Storage backend.
///
/// # Panics
///
/// In-memory implementations may panic if an internal lock is poisoned.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Append to a contract's log.
    ///
    /// # Invariants
    ///
    /// - Pre: the log is empty and `entry` is genesis (height 0, no previous
    ///   head), or `entry.height` is one past the latest entry and
    ///   `entry.previous_head` is the latest entry's hash.
    /// - Errors: `AlreadyProcessed` when `entry.height` is at or below the
    ///   latest height, `BadPreviousHead` for any other mismatch.
    fn append_entry(&self, contract_id: &ContractId, entry: &LogEntry) -> Result<(), StorageError>;

    /// Hash and height of the latest entry.
    fn latest_entry(&self, contract_id: &ContractId) -> Result<Option<(Hash, u64)>, StorageError>;

    /// Entries with height in `[from_height, from_height + limit)`.
    fn load_entries(
        &self,
        contract_id: &ContractId,
        from_height: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StorageError>;

    /// Drop a contract's log.
    fn clear_log(&self, contract_id: &ContractId) -> Result<(), StorageError>;
}

/// Check an append against the current tip. Shared by implementations.
pub(crate) fn check_append(latest: Option<(&Hash, u64)>, entry: &LogEntry) -> Result<(), StorageError> {
    match latest {
        None if entry.height == 0 && entry.previous_head.is_none() => Ok(()),
        None => Err(StorageError::BadPreviousHead { expected_height: 0, got_height: entry.height }),
        Some((_, height)) if entry.height <= height => {
            Err(StorageError::AlreadyProcessed { height: entry.height })
        },
        Some((hash, height)) => {
            if entry.height != height + 1 || entry.previous_head.as_ref() != Some(hash) {
                return Err(StorageError::BadPreviousHead { expected_height: height + 1, got_height: entry.height });
            }
            Ok(())
        },
    }
}
