//! Retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;
use crate::tracing::prelude::*;

/// How often and how patiently to retry a failed call.
///
/// Attempt `n` (counting from zero) that fails is followed by a delay of
/// `base_delay * backoff_multiplier^n` before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 means a single attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(400),
            backoff_multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::default()
    }

    /// Default backoff with `max_retries` retries.
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay after failed attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor)
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// The error of the final attempt is returned unchanged.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(operation, attempt, error = %e, ?delay, "Attempt failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(operation, attempt, error = %e, "Giving up");
                return Err(e);
            }
        }
    }
}
