use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::{
    constants::{
        BACKOFF_FACTOR, BALANCE_QUERY_BASE_DELAY_MS, BALANCE_QUERY_JITTER,
        BALANCE_QUERY_MAX_ATTEMPTS, SYNC_BASE_DELAY_MS, SYNC_MAX_ATTEMPTS, SYNC_MAX_DELAY_MS,
    },
    error::Result,
};

/// Exponential backoff schedule. `max_attempts` counts the first try.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Option<Duration>,
    /// Relative jitter, e.g. 0.2 for ±20%.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn balance_query() -> Self {
        Self {
            max_attempts: BALANCE_QUERY_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(BALANCE_QUERY_BASE_DELAY_MS),
            factor: BACKOFF_FACTOR,
            max_delay: None,
            jitter: BALANCE_QUERY_JITTER,
        }
    }

    pub fn backend_sync() -> Self {
        Self {
            max_attempts: SYNC_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(SYNC_BASE_DELAY_MS),
            factor: BACKOFF_FACTOR,
            max_delay: Some(Duration::from_millis(SYNC_MAX_DELAY_MS)),
            jitter: 0.0,
        }
    }

    /// Un-jittered delay before retry number `retry` (0-based).
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let multiplier = self.factor.max(1).saturating_pow(retry.min(16));
        let delay = self.base_delay.saturating_mul(multiplier);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let jitter = self.jitter.min(1.0);
        let scale = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        nominal.mul_f64(scale)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up. Returns the last error in the latter cases.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && err.is_retryable() => {
                let delay = policy.delay_for(attempt - 1);
                tracing::debug!(
                    "{} attempt {}/{} failed: {}; retrying in {}ms",
                    label,
                    attempt,
                    policy.max_attempts,
                    err,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
