//! Bounded retry for rotation passes that hit transient store failures.
//!
//! Delays grow as `initial_backoff * 2^attempt`, are capped at
//! `max_backoff`, and get up to 50% random jitter so replicas that failed
//! together do not retry in lockstep. Errors that
//! [`RotateError::is_transient`] rejects are returned immediately.

use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::debug;

use super::RotateError;

/// How hard to retry a failed rotation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);
        let half_ms = u64::try_from(base.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter = if half_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=half_ms)
        };
        base + Duration::from_millis(jitter)
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of retries.
///
/// Returns the first success, or the last error seen.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RotateError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RotateError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                let delay = policy.backoff(attempt);
                debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = policy.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient error, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
