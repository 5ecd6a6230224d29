//! Exponential backoff for feed pages and LLM calls.

use crate::error::{AnalysisError, FetchError};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Errors that can tell whether another attempt may succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        FetchError::is_retryable(self)
    }
}

impl Retryable for AnalysisError {
    fn is_retryable(&self) -> bool {
        AnalysisError::is_retryable(self)
    }
}

/// Retry ceiling and backoff curve.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            ..Self::default()
        }
    }

    /// No sleeping between attempts.
    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Delay before attempt `attempt + 1` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// The last error seen once the ceiling is hit or a permanent error occurs.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub error: E,
}

/// Run `operation` until it succeeds, fails permanently, or the policy runs out.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, Exhausted<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if !error.is_retryable() || attempt >= max_attempts {
                    return Err(Exhausted {
                        attempts: attempt,
                        error,
                    });
                }

                let delay = policy.backoff(attempt - 1);
                warn!(
                    attempt,
                    max = max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %error,
                    "{} failed, retrying",
                    label
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
