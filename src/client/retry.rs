//! Retry manager for handling transient failures with exponential backoff
//!
//! Shared by the API client and the connection pool. The loop is bounded:
//! an operation runs at most `max_retries + 1` times.

use crate::config::RetryConfig;
use crate::error::RetryableError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry manager with exponential backoff support
#[derive(Debug, Clone)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    /// Create a new RetryManager with the given configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Execute an async operation with retry logic
    ///
    /// Retryable errors are retried up to `max_retries` times. The wait before
    /// each retry is the exponential backoff for that attempt, raised to the
    /// error's `retry_after` hint when one is present. The last error is
    /// returned once retries are exhausted.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError + std::fmt::Display,
    {
        let mut attempt = 0u32;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    if attempt >= self.config.max_retries {
                        warn!(
                            attempts = attempt + 1,
                            max_retries = self.config.max_retries,
                            error = %err,
                            "Max retries exhausted"
                        );
                        return Err(err);
                    }

                    let delay = self.delay_for(attempt, err.retry_after());
                    debug!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after transient error"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Wait before retry number `attempt + 1`, honoring a server hint
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.calculate_backoff(attempt);
        match retry_after {
            Some(hint) => backoff.max(hint),
            None => backoff,
        }
    }

    /// Calculate backoff duration for a given attempt number
    ///
    /// `initial_backoff * multiplier^attempt` plus additive jitter, capped at
    /// `max_backoff_ms`. Jitter never exceeds the gap to the next attempt's
    /// base delay, so successive delays are non-decreasing.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let multiplier = self.config.backoff_multiplier.max(1.0);
        let base = self.config.initial_backoff_ms as f64 * multiplier.powi(attempt as i32);
        let max = self.config.max_backoff_ms as f64;

        let jitter = if self.config.jitter {
            let bound = (self.config.max_jitter_ms as f64).min(base * (multiplier - 1.0));
            if bound > 0.0 {
                rand::thread_rng().gen_range(0.0..=bound)
            } else {
                0.0
            }
        } else {
            0.0
        };

        let delay = (base + jitter).min(max);
        if delay.is_finite() && delay > 0.0 {
            Duration::from_secs_f64(delay / 1000.0)
        } else {
            Duration::ZERO
        }
    }
}
