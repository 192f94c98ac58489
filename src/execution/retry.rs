//! Uniform retry-with-backoff wrapper
//!
//! Every exchange-mutating call goes through this one helper instead of
//! per-call-site retry loops, so attempt limits and the retryable/fatal
//! split are consistent everywhere.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

use crate::config::RouterConfig;
use crate::error::Result;

/// Retry policy: max attempts, exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

impl From<&RouterConfig> for RetryPolicy {
    fn from(config: &RouterConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `n` (1-based): base * 2^(n-1), capped,
    /// plus up to 20% jitter to spread retries under load.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
        let capped = exp.min(self.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0..=capped / 5);
        Duration::from_millis(capped + jitter)
    }
}

/// Run `operation` until it succeeds, a fatal error is returned, or the
/// attempt budget is exhausted. `op_name` labels the log lines.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => {
                return Err(e);
            }
            Err(e) => {
                if attempt >= policy.max_attempts {
                    error!(
                        "{} failed after {} attempts: {}",
                        op_name, attempt, e
                    );
                    return Err(e);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "{} attempt {} failed: {}. Retrying in {:?}",
                    op_name, attempt, e, delay
                );
                sleep(delay).await;
            }
        }
    }
}
