//! Fixed-interval retry for calls that hit a temporarily unavailable cluster.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::Result;

/// Retry policy: attempts after the first, and the delay between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            interval: Duration::ZERO,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            interval: config.retry_interval(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted. Only `Unavailable` errors are retried.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                warn!(
                    op = op_name,
                    attempt,
                    max_retries = policy.max_retries,
                    error = %e,
                    "Cluster unavailable, retrying"
                );
                tokio::time::sleep(policy.interval).await;
            }
            result => return result,
        }
    }
}
