//! Reconnect backoff with full jitter.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Exponential backoff with full jitter for the reconnect loop.
///
/// The delay for each attempt is drawn uniformly from
/// `[0, current)` where `current` doubles per attempt up to the cap.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
    rng: StdRng,
}

impl Backoff {
    /// Base delay for the first attempt.
    pub const BASE: Duration = Duration::from_millis(32);
    /// Growth factor applied after each attempt.
    pub const FACTOR: u32 = 2;
    /// Upper bound for the undithered delay.
    pub const CAP: Duration = Duration::from_millis(4096);

    /// Creates a backoff seeded from the OS.
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Creates a backoff with a fixed seed, for deterministic tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            base: Self::BASE,
            cap: Self::CAP,
            current: Self::BASE,
            rng,
        }
    }

    /// Draws the delay for the next attempt and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.current.as_millis() as u64;
        let jittered = self.rng.gen_range(0..ceiling);
        self.current = (self.current * Self::FACTOR).min(self.cap);
        Duration::from_millis(jittered)
    }

    /// Restarts the schedule from the base delay.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("current", &self.current)
            .finish()
    }
}
