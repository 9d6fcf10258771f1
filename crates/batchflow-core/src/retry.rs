//! Retry with exponential backoff for worker invocations
//!
//! The operator never retries a failed batch itself. Workers that want
//! retries wrap their own call in [`retry_with_backoff`] before returning
//! their output stream.

use std::future::Future;
use std::time::Duration;

/// How often and how patiently to retry a failing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = try once)
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Try once, never retry
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Exponential backoff: base, 2*base, 4*base, ... capped at `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Retry a fallible async operation with exponential backoff.
///
/// Errors for which `is_retryable` returns `true` are retried up to
/// `policy.max_retries` times, sleeping [`RetryPolicy::backoff`] in between.
///
/// Returns `Ok(T)` on first success, or the final `Err` on exhaustion / non-retryable error.
pub async fn retry_with_backoff<T, E, Fut>(
    label: &str,
    policy: &RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
    mut attempt_fn: impl FnMut() -> Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_retries = policy.max_retries;
    let mut attempt = 0u32;
    loop {
        match attempt_fn().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries && is_retryable(&e) => {
                attempt += 1;
                log::debug!("{label}: attempt {attempt}/{max_retries} failed: {e}, retrying...");
                tokio::time::sleep(policy.backoff(attempt)).await;
            }
            Err(e) => {
                log::error!("{label}: failed permanently: {e}");
                return Err(e);
            }
        }
    }
}
