//! Consolidated retry policy.
//!
//! One policy, applied uniformly to source fetches, delegation issuance and
//! uploads. Whether an error is worth re-attempting is decided by
//! [`MigrationError::is_retryable`], not by call sites.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{MigrationError, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u8,
    /// Base backoff time in milliseconds.
    pub base_backoff_ms: u64,
    /// Maximum backoff time in milliseconds.
    pub max_backoff_ms: u64,
    /// Jitter range in milliseconds (added to backoff).
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            jitter_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with cap and jitter.
    pub fn backoff(&self, attempt: u8) -> Duration {
        let exponential = self
            .base_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1) as u32));
        let capped = exponential.min(self.max_backoff_ms);
        let jitter = if self.jitter_ms > 0 {
            rand::rng().random_range(0..self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }
}

/// Run `op` until it succeeds, fails terminally, or the policy gives up.
///
/// Retryable errors sleep for the backoff and re-attempt; non-retryable
/// errors propagate immediately. Exhausting the policy converts the last
/// error into [`MigrationError::RetriesExhausted`].
pub async fn retry_with<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u8;

    loop {
        attempt += 1;

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= policy.max_attempts => {
                return Err(MigrationError::RetriesExhausted {
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }
            Err(e) => {
                let wait = policy.backoff(attempt);
                tracing::warn!(
                    operation = label,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %e,
                    "operation failed, retrying"
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
}
