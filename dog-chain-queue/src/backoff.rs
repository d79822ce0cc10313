use std::time::Duration;

use rand::Rng;

/// Delay before the next retry.
///
/// `min(initial_delay * multiplier^(attempt - 1), max_delay)`, where `attempt`
/// is the 1-based number of the attempt that just failed. Attempt 0 is treated
/// as 1, and an overflowing product clamps to `max_delay`.
pub fn backoff_delay(
    attempt: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let nanos = initial_delay.as_nanos() as f64 * multiplier.powi(exponent);

    if !nanos.is_finite() || nanos >= max_delay.as_nanos() as f64 {
        return max_delay;
    }
    if nanos >= u64::MAX as f64 {
        // Beyond what `from_nanos` can hold
        return Duration::try_from_secs_f64(nanos / 1e9).map_or(max_delay, |delay| delay.min(max_delay));
    }
    Duration::from_nanos(nanos.max(0.0).round() as u64)
}

/// Retry spacing for one engine instance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,

    /// Fraction of the delay that may be shaved off at random, in `[0, 1]`
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Deterministic delay after `attempt` failures
    pub fn delay(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.initial_delay, self.max_delay, self.multiplier)
    }

    /// Delay with jitter applied, drawn from `[delay * (1 - jitter), delay]`
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter.min(1.0))..=1.0);
        let nanos = base.as_nanos() as f64 * factor;
        if nanos >= u64::MAX as f64 {
            return base.mul_f64(factor);
        }
        Duration::from_nanos(nanos.round() as u64)
    }
}
