//! Connect-retry policy with jittered exponential back-off.

use std::time::Duration;

/// Controls how often and how patiently we retry a failed server connect.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of connect attempts (first try included).
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Cap on the computed delay (before jitter).
    pub max_delay: Duration,
    /// Multiplier applied per failed attempt.
    pub backoff_factor: f64,
    /// Upper bound of the additive jitter.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-indexed):
    /// `initial * factor^(attempt-1) + jitter(0..jitter_max)`, capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.backoff_factor.powi(exponent as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        let jitter_ms = self.jitter.as_millis() as f64 * pseudo_random_fraction(attempt);
        Duration::from_millis((capped_ms + jitter_ms) as u64)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Cheap deterministic "random" fraction in [0, 1) derived from the attempt
/// number. Not cryptographic — just enough to spread reconnect storms.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_mul(2654435761); // Knuth multiplicative hash
    (hash as f64) / (u32::MAX as f64)
}
