//! Production environment using system time and the OS RNG.

use std::time::Duration;

use crate::env::Environment;

/// Production environment.
///
/// Uses `std::time::Instant` for time, `tokio::time::sleep` for backoff, and
/// getrandom for key generation, nonces and jitter.
///
/// # Panics
///
/// Panics if the OS RNG fails. A client without working randomness cannot
/// generate keys or nonces safely, and continuing would silently weaken every
/// ciphertext it produces.
#[derive(Debug, Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }

    #[allow(clippy::disallowed_methods)]
    fn wall_clock_secs(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_bytes_differ() {
        let env = SystemEnv::new();
        let a: [u8; 32] = env.random_array();
        let b: [u8; 32] = env.random_array();
        assert_ne!(a, b);
    }

    #[test]
    fn wall_clock_is_after_2020() {
        assert!(SystemEnv::new().wall_clock_secs() > 1_577_836_800);
    }

    #[tokio::test]
    async fn now_is_monotonic_across_sleep() {
        let env = SystemEnv::new();
        let before = env.now();
        env.sleep(Duration::from_millis(1)).await;
        assert!(env.now() >= before);
    }
}
