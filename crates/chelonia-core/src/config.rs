//! Engine configuration.
//!
//! Deserializable so hosts can load it from whatever format they already use;
//! every field has a default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CheloniaConfig {
    /// Reject out-of-order and duplicate messages instead of scheduling a
    /// resync or ignoring them. Relays run with this set.
    pub strict_ordering: bool,
    /// Reject messages whose processing fails instead of advancing the head
    /// past them.
    pub strict_processing: bool,
    /// Verify and record actions without running contract `process` handlers.
    pub skip_action_processing: bool,
    /// Never run contract side effects.
    pub skip_side_effects: bool,
    /// Out-of-order messages that may wait for a resync before the engine
    /// reports an unrecoverable error.
    pub max_reingestions: usize,
    /// Publishing retry policy.
    pub publish: PublishConfig,
    /// Sync paging.
    pub sync: SyncConfig,
}

impl Default for CheloniaConfig {
    fn default() -> Self {
        Self {
            strict_ordering: false,
            strict_processing: false,
            skip_action_processing: false,
            skip_side_effects: false,
            max_reingestions: 100,
            publish: PublishConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl CheloniaConfig {
    /// Configuration a relay uses: strict ordering and processing, no side
    /// effects.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            strict_ordering: true,
            strict_processing: true,
            skip_side_effects: true,
            ..Self::default()
        }
    }
}

/// Publishing retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PublishConfig {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Backoff after the first conflict
    #[serde(with = "millis")]
    pub base_backoff: Duration,
    /// Backoff ceiling
    #[serde(with = "millis")]
    pub max_backoff: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl PublishConfig {
    /// Backoff before retry `attempt` (1-based) plus `jitter` in
    /// `[0, base_backoff)`.
    #[must_use]
    pub fn backoff(&self, attempt: u32, jitter: u64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.base_backoff.saturating_mul(1 << exponent).min(self.max_backoff);
        let base_ms = self.base_backoff.as_millis().max(1) as u64;
        base + Duration::from_millis(jitter % base_ms)
    }
}

/// Sync paging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Messages requested per page
    pub page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { page_size: 50 }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
