//! Construction-time engine configuration.
//!
//! Values can be overridden from the environment using the DogRS
//! `PREFIX__KEY` convention:
//!
//! ```bash
//! export DOG_CHAIN_QUEUE__MAX_ATTEMPTS=5
//! export DOG_CHAIN_QUEUE__INITIAL_DELAY_MS=1000
//! ```

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{backoff::BackoffPolicy, QueueError, QueueResult};

pub const DEFAULT_ENV_PREFIX: &str = "DOG_CHAIN_QUEUE__";

/// Longest accepted `max_delay` (one year)
pub const MAX_DELAY_LIMIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Configuration for a queue engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    /// Attempts before a job is dead-lettered
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    #[serde(rename = "initialDelayMs", with = "duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound for any retry delay
    #[serde(rename = "maxDelayMs", with = "duration_ms")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// How long one processor call may run before it counts as failed
    #[serde(rename = "processingTimeoutMs", with = "duration_ms")]
    pub processing_timeout: Duration,
    /// Random fraction shaved off retry delays, `0.0` disables
    pub jitter: f64,
    /// Jobs processed at once within a single pass
    pub concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300), // 5 minutes
            backoff_multiplier: 2.0,
            processing_timeout: Duration::from_secs(30),
            jitter: 0.0,
            concurrency: 1,
        }
    }
}

impl QueueConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Backoff parameters as a policy
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.initial_delay, self.max_delay, self.backoff_multiplier)
            .with_jitter(self.jitter)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.max_attempts == 0 {
            return Err(QueueError::invalid_config("maxAttempts must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(QueueError::invalid_config(format!(
                "backoffMultiplier must be >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(QueueError::invalid_config(format!(
                "initialDelayMs ({}) exceeds maxDelayMs ({})",
                self.initial_delay.as_millis(),
                self.max_delay.as_millis()
            )));
        }
        if self.max_delay > MAX_DELAY_LIMIT {
            return Err(QueueError::invalid_config(format!(
                "maxDelayMs ({}) exceeds the one year limit",
                self.max_delay.as_millis()
            )));
        }
        if self.processing_timeout.is_zero() {
            return Err(QueueError::invalid_config("processingTimeoutMs must be positive"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(QueueError::invalid_config(format!(
                "jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }
        if self.concurrency == 0 {
            return Err(QueueError::invalid_config("concurrency must be at least 1"));
        }
        Ok(())
    }

    /// Defaults overridden by `DOG_CHAIN_QUEUE__*` variables
    pub fn from_env() -> QueueResult<Self> {
        Self::from_env_with_prefix(DEFAULT_ENV_PREFIX)
    }

    pub fn from_env_with_prefix(prefix: &str) -> QueueResult<Self> {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    fn from_lookup(prefix: &str, lookup: impl Fn(&str) -> Option<String>) -> QueueResult<Self> {
        let read = |name: &str| lookup(&format!("{prefix}{name}"));
        let mut config = Self::default();

        if let Some(v) = read("MAX_ATTEMPTS") {
            config.max_attempts = parse_var(prefix, "MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = read("INITIAL_DELAY_MS") {
            config.initial_delay = Duration::from_millis(parse_var(prefix, "INITIAL_DELAY_MS", &v)?);
        }
        if let Some(v) = read("MAX_DELAY_MS") {
            config.max_delay = Duration::from_millis(parse_var(prefix, "MAX_DELAY_MS", &v)?);
        }
        if let Some(v) = read("BACKOFF_MULTIPLIER") {
            config.backoff_multiplier = parse_var(prefix, "BACKOFF_MULTIPLIER", &v)?;
        }
        if let Some(v) = read("PROCESSING_TIMEOUT_MS") {
            config.processing_timeout =
                Duration::from_millis(parse_var(prefix, "PROCESSING_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = read("JITTER") {
            config.jitter = parse_var(prefix, "JITTER", &v)?;
        }
        if let Some(v) = read("CONCURRENCY") {
            config.concurrency = parse_var(prefix, "CONCURRENCY", &v)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: FromStr>(prefix: &str, name: &str, raw: &str) -> QueueResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| {
        QueueError::invalid_config(format!("{prefix}{name}={raw:?}: {e}"))
    })
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
