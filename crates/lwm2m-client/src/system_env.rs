//! Wall-clock environment for the production runtime.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use lwm2m_core::Environment;

/// System clock, tokio timers and OS entropy.
///
/// Entropy feeds peer identities and nothing security-critical; the NoSec
/// development transport carries no key material.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        if let Err(err) = getrandom::fill(buffer) {
            // Peer ids only need to be distinct, fall back to the clock.
            tracing::error!(%err, "getrandom failed");
            let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_nanos());
            let seed = nanos.to_le_bytes();
            for (byte, seed) in buffer.iter_mut().zip(seed.iter().cycle()) {
                *byte = *seed;
            }
        }
    }
}
