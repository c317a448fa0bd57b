//! Reconnection Backoff
//!
//! Exponential backoff with a capped delay, non-negative jitter and a
//! maximum-attempts policy. The delay before retry `k` (after `k`
//! consecutive failures) is `min(cap, base * multiplier^k)` plus jitter,
//! never exceeding `cap`.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Base delay.
    pub base_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential growth.
    pub multiplier: f64,
    /// Jitter as a fraction of the computed delay, added on top (never subtracted).
    pub jitter_factor: f64,
    /// Maximum number of consecutive failed attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 10,
        }
    }
}

/// Tracks consecutive failures and hands out retry delays.
///
/// ```rust
/// use monitoring_pipeline::domain::connection::{BackoffConfig, BackoffPolicy};
///
/// let mut policy = BackoffPolicy::new(BackoffConfig::default());
/// let delay = policy.record_failure();
/// assert!(delay.is_some());
///
/// policy.reset();
/// assert_eq!(policy.failures(), 0);
/// ```
#[derive(Debug)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    failures: u32,
}

impl BackoffPolicy {
    /// Create a new policy.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self { config, failures: 0 }
    }

    /// Record a failed attempt and return the delay before the next one.
    ///
    /// Returns `None` once the maximum attempt count has been reached.
    #[must_use]
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.exhausted() {
            return None;
        }
        Some(self.apply_jitter(self.delay_for(self.failures)))
    }

    /// Reset after a successful connection.
    pub const fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures recorded since the last reset.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether the attempt budget is spent.
    #[must_use]
    pub const fn exhausted(&self) -> bool {
        self.config.max_attempts > 0 && self.failures >= self.config.max_attempts
    }

    /// Un-jittered delay after `failures` consecutive failures.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let base_millis = self.config.base_delay.as_millis() as f64;
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let scaled = base_millis * self.config.multiplier.powi(exponent);
        self.clamp_millis(scaled)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = delay.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(0.0..=jitter_range);
        self.clamp_millis(base_millis + jitter)
    }

    fn clamp_millis(&self, millis: f64) -> Duration {
        let max = self.config.max_delay;
        if !millis.is_finite() {
            return max;
        }
        #[allow(clippy::cast_precision_loss)]
        if millis >= max.as_millis() as f64 {
            return max;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let whole = millis.max(0.0).round() as u64;
        Duration::from_millis(whole).min(max)
    }
}
