//! Seeded simulation environment.
//!
//! Randomness comes from a `ChaCha20Rng` seeded per client, time from tokio's
//! clock (paused in tests, so publish backoff costs nothing), and the wall
//! clock is a counter tests move by hand to expire invites.

#![allow(clippy::disallowed_types, reason = "RNG lock is never held across await")]

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chelonia_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Wall clock every simulated client starts at (2024-01-01T00:00:00Z).
pub const SIM_EPOCH_SECS: u64 = 1_704_067_200;

/// Deterministic environment.
#[derive(Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
    wall_clock: Arc<AtomicU64>,
    seed: u64,
}

impl SimEnv {
    /// Environment whose randomness is fully determined by `seed`.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            wall_clock: Arc::new(AtomicU64::new(SIM_EPOCH_SECS)),
            seed,
        }
    }

    /// Seed this environment was created with.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Move the wall clock forward.
    pub fn advance_wall_clock(&self, by: Duration) {
        self.wall_clock.fetch_add(by.as_secs(), Ordering::SeqCst);
    }
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEnv")
            .field("seed", &self.seed)
            .field("wall_clock", &self.wall_clock.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Environment for SimEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }

    fn wall_clock_secs(&self) -> u64 {
        self.wall_clock.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_bytes() {
        let a: [u8; 16] = SimEnv::with_seed(7).random_array();
        let b: [u8; 16] = SimEnv::with_seed(7).random_array();
        let c: [u8; 16] = SimEnv::with_seed(8).random_array();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn clones_share_rng_and_clock() {
        let env = SimEnv::with_seed(1);
        let clone = env.clone();
        let first: [u8; 8] = env.random_array();
        let second: [u8; 8] = clone.random_array();
        assert_ne!(first, second);

        clone.advance_wall_clock(Duration::from_secs(60));
        assert_eq!(env.wall_clock_secs(), SIM_EPOCH_SECS + 60);
    }
}
