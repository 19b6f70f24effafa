//! Backoff for reconnecting to trackers and re-attempting neighbors.

use std::time::{Duration, Instant};

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Whether to add up to 25% jitter.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy starting at `initial_delay`.
    #[must_use]
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            ..Default::default()
        }
    }

    /// Calculates the delay after `failures` consecutive failures.
    #[must_use]
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as f64) as u64);
        if self.jitter {
            let jitter_factor = 1.0 + rand::random::<f64>() * 0.25;
            Duration::from_millis((capped.as_millis() as f64 * jitter_factor) as u64)
        } else {
            capped
        }
    }
}

/// Failure count and next allowed attempt for one target.
#[derive(Debug, Clone)]
pub struct Backoff {
    failures: u32,
    next_attempt: Instant,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            failures: 0,
            next_attempt: Instant::now(),
        }
    }
}

impl Backoff {
    /// Returns true if an attempt may start now.
    #[must_use]
    pub fn ready(&self, now: Instant) -> bool {
        now >= self.next_attempt
    }

    /// Records a failure and pushes the next attempt out.
    pub fn failed(&mut self, policy: &RetryPolicy) {
        self.failures = self.failures.saturating_add(1);
        self.next_attempt = Instant::now() + policy.delay_for_attempt(self.failures);
    }

    /// Clears the failure count.
    pub fn succeeded(&mut self) {
        self.failures = 0;
        self.next_attempt = Instant::now();
    }

    /// Returns the number of consecutive failures.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
