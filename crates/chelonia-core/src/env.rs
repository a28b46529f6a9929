//! Environment abstraction for deterministic testing.
//!
//! The engine never reads the clock or the OS RNG directly. Production uses
//! [`crate::SystemEnv`]; simulation swaps in a seeded RNG and tokio's paused
//! clock so that a failing run can be replayed from its seed.

use std::time::Duration;

/// Time, randomness and sleeping.
///
/// # Invariants
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production and
///   is reproducible from a seed in simulation
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant type.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current monotonic time.
    fn now(&self) -> Self::Instant;

    /// Sleep for `duration`. Used for publish backoff only.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Wall-clock time in Unix seconds.
    ///
    /// Only consulted for invite expiry, which is a local policy decision and
    /// never feeds into replicated state.
    fn wall_clock_secs(&self) -> u64;

    /// Random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Random fixed-size array.
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.random_bytes(&mut bytes);
        bytes
    }
}
