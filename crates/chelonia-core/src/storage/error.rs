use thiserror::Error;

/// Storage failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Append does not extend the current tip.
    #[error("bad previous head: expected height {expected_height}, got {got_height}")]
    BadPreviousHead {
        /// Height the log expects next
        expected_height: u64,
        /// Height of the rejected entry
        got_height: u64,
    },

    /// An entry at this height is already stored.
    #[error("entry at height {height} already stored")]
    AlreadyProcessed {
        /// Height of the rejected entry
        height: u64,
    },

    /// Backend I/O failure.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Stored value does not decode.
    #[error("storage serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
