//! Retry with exponential backoff for store operations.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::core::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// Only [`StoreError::Transient`] is retried.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                    what, attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay);
                attempt += 1;
            }
            result => return result,
        }
    }
}
