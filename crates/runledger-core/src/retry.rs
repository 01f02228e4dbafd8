//! Retry with exponential backoff and jitter.
//!
//! One policy type drives both local store writes and collector delivery.
//! Jitter spreads retries from concurrent writers so they do not stampede
//! the lock or the collector in lockstep.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::{Result, is_retryable};

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Delay ceiling.
    pub max_delay: Duration,
    /// Multiplier applied per retry (default 2.0).
    pub backoff_factor: f64,
    /// Random jitter range as a fraction of the delay (0.1 = ±10%).
    pub jitter_percent: f64,
    /// Attempt ceiling, counting the first try.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Policy for local store writes under contention: 5 attempts, 50ms
    /// initial.
    #[must_use]
    pub fn db_write() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: 5,
        }
    }

    /// Policy for collector delivery: 1s initial, 5 minute ceiling.
    #[must_use]
    pub fn collector() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: 10,
        }
    }

    /// Collector policy tuned from configuration.
    #[must_use]
    pub fn from_sync_config(config: &SyncConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_secs(config.max_delay_secs),
            max_attempts: u32::try_from(config.max_attempts).unwrap_or(u32::MAX),
            ..Self::collector()
        }
    }

    /// Delay for a given attempt number (0-indexed), jitter applied.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // ms values are well within f64 precision
    #[allow(clippy::cast_possible_wrap)] // exponent capped at 31
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        // Cap the exponent to keep powi finite.
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 {
            let mut rng = rand::rng();
            let jitter_range = base_ms * self.jitter_percent;
            rng.random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((base_ms + jitter).max(0.0) as u64)
    }
}

/// Run an async operation with retry and exponential backoff.
///
/// Non-retryable errors (validation, corruption, 4xx rejection) short-circuit
/// immediately; everything else retries until the policy's attempt ceiling.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(retries = attempt, "operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) => {
                attempt += 1;
                if !is_retryable(&e) || attempt >= policy.max_attempts {
                    if attempt > 1 {
                        warn!(attempt, error = %e, "operation failed after retries");
                    }
                    return Err(e);
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after failure");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
