//! Per-endpoint circuit breaker.
//!
//! The breaker gates `send` with three states:
//!
//! - **Closed**: normal operation, requests pass through
//! - **Open**: the endpoint looks unhealthy, requests are rejected
//! - **HalfOpen**: a bounded number of probes test recovery
//!
//! Failure accounting runs over a rolling window of timestamped
//! samples; samples older than the window are evicted lazily on each
//! mutation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation - requests pass through.
    Closed,
    /// The endpoint is failing - requests are rejected.
    Open,
    /// Testing recovery - limited probes pass through.
    HalfOpen,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

struct Window {
    /// Timestamped samples; `true` records a success.
    samples: VecDeque<(Instant, bool)>,
    state: BreakerState,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
}

/// Failure-rate gate fronting an endpoint's `send`.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    /// Lock-free snapshot of the current state for cross-thread reads.
    state: AtomicU8,
    window: Mutex<Window>,
}

impl CircuitBreaker {
    /// Creates a breaker with the given configuration, starting
    /// closed.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(STATE_CLOSED),
            window: Mutex::new(Window {
                samples: VecDeque::new(),
                state: BreakerState::Closed,
                opened_at: None,
                probes_in_flight: 0,
            }),
        }
    }

    /// Whether a dispatch may pass right now.
    ///
    /// In `HalfOpen` a `true` return reserves one probe slot; the slot
    /// is released when the outcome is recorded (or by
    /// [`CircuitBreaker::abort_probe`] if the dispatch never happens).
    pub fn allow(&self) -> bool {
        if !self.config.enabled {
            return true;
        }

        let now = Instant::now();
        let mut window = self.window.lock().expect("breaker lock poisoned");
        self.evict(&mut window, now);

        match window.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let slept_enough = window
                    .opened_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= self.config.sleep_window);
                if slept_enough && self.config.half_open_probe_limit > 0 {
                    window.state = BreakerState::HalfOpen;
                    window.probes_in_flight = 1;
                    self.state.store(STATE_HALF_OPEN, Ordering::Release);
                    tracing::info!("Circuit breaker transitioning to half-open");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if window.probes_in_flight < self.config.half_open_probe_limit {
                    window.probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful outcome.
    pub fn track_success(&self) {
        self.track(true);
    }

    /// Records a failed outcome (transport error, timeout, or a
    /// response the codec labeled a server-health failure).
    pub fn track_failure(&self) {
        self.track(false);
    }

    /// Releases a reserved half-open probe slot when the dispatch was
    /// abandoned before producing an outcome.
    pub fn abort_probe(&self) {
        if !self.config.enabled {
            return;
        }
        let mut window = self.window.lock().expect("breaker lock poisoned");
        if window.state == BreakerState::HalfOpen {
            window.probes_in_flight = window.probes_in_flight.saturating_sub(1);
        }
    }

    /// Current state snapshot; possibly stale across threads.
    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// Whether the breaker participates in gating at all.
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn track(&self, success: bool) {
        if !self.config.enabled {
            return;
        }

        let now = Instant::now();
        let mut window = self.window.lock().expect("breaker lock poisoned");
        self.evict(&mut window, now);
        window.samples.push_back((now, success));

        match window.state {
            BreakerState::Closed => {
                if self.should_open(&window) {
                    window.state = BreakerState::Open;
                    window.opened_at = Some(now);
                    self.state.store(STATE_OPEN, Ordering::Release);
                    tracing::warn!(
                        samples = window.samples.len(),
                        "Circuit breaker opened due to failures"
                    );
                }
            }
            BreakerState::HalfOpen => {
                window.probes_in_flight = window.probes_in_flight.saturating_sub(1);
                if success {
                    // One good probe closes the breaker; the rolling
                    // window keeps its samples.
                    window.state = BreakerState::Closed;
                    window.opened_at = None;
                    window.probes_in_flight = 0;
                    self.state.store(STATE_CLOSED, Ordering::Release);
                    tracing::info!("Circuit breaker closed after successful probe");
                } else {
                    window.state = BreakerState::Open;
                    window.opened_at = Some(now);
                    window.probes_in_flight = 0;
                    self.state.store(STATE_OPEN, Ordering::Release);
                    tracing::warn!("Circuit breaker reopened after failed probe");
                }
            }
            // Late outcomes from requests dispatched before opening;
            // the sample is recorded, no transition.
            BreakerState::Open => {}
        }
    }

    fn evict(&self, window: &mut Window, now: Instant) {
        while let Some(&(at, _)) = window.samples.front() {
            if now.saturating_duration_since(at) > self.config.rolling_window {
                window.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn should_open(&self, window: &Window) -> bool {
        let total = window.samples.len() as u64;
        if total < u64::from(self.config.volume_threshold) {
            return false;
        }
        let failures = window.samples.iter().filter(|(_, ok)| !ok).count() as u64;
        // Integer percent, inclusive threshold.
        failures * 100 >= u64::from(self.config.error_threshold_percent) * total
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("enabled", &self.config.enabled)
            .field("state", &self.state())
            .finish()
    }
}
