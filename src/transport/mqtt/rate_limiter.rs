//! Minimum-spacing gate for outbound commands
//!
//! Denied calls are rejected outright; nothing is queued or retried.

use std::time::Duration;
use tokio::time::Instant;

/// Grants at most one acquisition per `min_interval`
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    last_granted: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_granted: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Try to take a slot now
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Grant and record `now` if at least `min_interval` passed since the last grant.
    /// A denied call leaves the limiter untouched.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        let allowed = match self.last_granted {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
        };

        if allowed {
            self.last_granted = Some(now);
        }
        allowed
    }
}
