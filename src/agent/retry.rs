//! Retry with exponential backoff for transient model failures.

use crate::error::ModelError;
use backoff::{backoff::Backoff, ExponentialBackoff};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy for model calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 means a single attempt).
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_interval: Duration::from_millis(1000),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            randomization_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_interval: Duration) -> Self {
        Self {
            max_retries,
            initial_interval,
            ..Self::default()
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            current_interval: self.initial_interval,
            max_interval: self.max_interval.max(self.initial_interval),
            multiplier: self.multiplier,
            randomization_factor: self.randomization_factor,
            // The attempt count bounds retrying, not wall time.
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// Run `operation` until it succeeds, fails permanently, or retries run out.
    ///
    /// A server-supplied `retry_after` wins over the computed backoff when longer.
    pub async fn run<F, Fut, T>(&self, what: &str, mut operation: F) -> Result<T, ModelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ModelError>>,
    {
        let mut backoff = self.backoff();
        let mut attempts = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempts < self.max_retries => {
                    let computed = backoff.next_backoff().unwrap_or(self.max_interval);
                    let delay = err.retry_after().map_or(computed, |after| after.max(computed));
                    attempts += 1;
                    warn!(
                        "{} failed ({}), retrying in {:?} (attempt {}/{})",
                        what, err, delay, attempts, self.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
