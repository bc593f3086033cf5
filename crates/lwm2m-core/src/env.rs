//! Environment abstraction for deterministic testing.
//!
//! The device never reads the clock, sleeps or draws randomness on its own.
//! Everything time- or entropy-dependent goes through [`Environment`], so the
//! same state machine runs against the system clock in production and
//! against a virtual clock in simulation.
//!
//! # Invariants
//!
//! - Monotonicity: `env.now()` never goes backwards
//! - Determinism: with the same seed, `random_bytes()` yields the same
//!   sequence
//! - Isolation: implementations must not share global state

use std::time::{Duration, Instant};

/// Time, randomness and sleeping for the device and its drivers.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current time.
    ///
    /// Successive calls within one execution context never decrease.
    fn now(&self) -> Instant;

    /// Sleep for `duration`.
    ///
    /// Only driver code awaits this; the sans-IO device never does.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    ///
    /// Production implementations use OS entropy. Simulation implementations
    /// use a seeded generator and log the seed.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random `u64`, used for peer identities and session tickets.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}
