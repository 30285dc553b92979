//! Idle-connection watchdog.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Tracks channel activity against an idle deadline.
///
/// Pipelines touch the tracker on every write and inbound frame and
/// await [`IdleTracker::idle`] to learn when the connection went
/// quiet for longer than `idle_http_timeout`.
#[derive(Debug)]
pub struct IdleTracker {
    timeout: Duration,
    last_activity: Mutex<Instant>,
}

impl IdleTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Records activity, pushing the idle deadline out.
    pub fn touch(&self) {
        *self.last_activity.lock().expect("idle lock poisoned") = Instant::now();
    }

    /// The instant at which the connection counts as idle, given no
    /// further activity.
    pub fn deadline(&self) -> Instant {
        *self.last_activity.lock().expect("idle lock poisoned") + self.timeout
    }

    /// Whether the idle deadline has already passed.
    pub fn is_idle(&self) -> bool {
        Instant::now() >= self.deadline()
    }

    /// Resolves once the connection has been inactive for the full
    /// timeout. Activity recorded while waiting pushes the wakeup out.
    pub async fn idle(&self) {
        loop {
            let deadline = self.deadline();
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_quiet_period() {
        let tracker = IdleTracker::new(Duration::from_millis(100));
        assert!(!tracker.is_idle());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(tracker.is_idle());
        tracker.idle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn touch_pushes_the_deadline_out() {
        let tracker = IdleTracker::new(Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(60)).await;
        tracker.touch();
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(!tracker.is_idle());

        tokio::time::advance(Duration::from_millis(40)).await;
        assert!(tracker.is_idle());
    }
}
