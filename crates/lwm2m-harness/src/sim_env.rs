//! Seeded environment for simulation.
//!
//! Two clocks are available:
//!
//! - Tokio time ([`SimEnv::with_seed`]): inside a turmoil host this is the
//!   simulated clock, so timers and `now()` agree with the network.
//! - A manual clock ([`SimEnv::manual`]): time only moves through
//!   [`SimEnv::advance`] or `sleep`, for driving the sans-IO device directly.
//!
//! Randomness comes from a ChaCha generator seeded once; clones share it.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use lwm2m_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

#[derive(Debug, Clone)]
enum Clock {
    Tokio,
    Manual { epoch: Instant, elapsed: Arc<Mutex<Duration>> },
}

/// Simulation environment.
#[derive(Debug, Clone)]
pub struct SimEnv {
    seed: u64,
    rng: Arc<Mutex<ChaCha8Rng>>,
    clock: Clock,
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEnv {
    /// Tokio-clocked environment with seed 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Tokio-clocked environment with a specific seed.
    pub fn with_seed(seed: u64) -> Self {
        tracing::debug!(seed, "simulation environment");
        let rng = Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed)));
        Self { seed, rng, clock: Clock::Tokio }
    }

    /// Manually clocked environment, starting at the current instant.
    pub fn manual(seed: u64) -> Self {
        let clock = Clock::Manual { epoch: Instant::now(), elapsed: Arc::default() };
        Self { clock, ..Self::with_seed(seed) }
    }

    /// Seed the generator was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Move a manual clock forward. Tokio time is advanced by its runtime,
    /// so this does nothing on a tokio-clocked environment.
    pub fn advance(&self, by: Duration) {
        if let Clock::Manual { elapsed, .. } = &self.clock {
            *elapsed.lock().unwrap_or_else(PoisonError::into_inner) += by;
        }
    }
}

impl Environment for SimEnv {
    fn now(&self) -> Instant {
        match &self.clock {
            Clock::Tokio => tokio::time::Instant::now().into_std(),
            Clock::Manual { epoch, elapsed } => {
                *epoch + *elapsed.lock().unwrap_or_else(PoisonError::into_inner)
            },
        }
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        let env = self.clone();
        async move {
            match env.clock {
                Clock::Tokio => tokio::time::sleep(duration).await,
                Clock::Manual { .. } => env.advance(duration),
            }
        }
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}
