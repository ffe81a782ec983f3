// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry with exponential backoff, and per-call timeouts.
//!
//! Vault and remote-source calls have no natural bound, so every call the
//! flow machine makes against them goes through [`with_timeout`]. Connection
//! setup and vault listing during seeding go through [`retry`].
//!
//! # Example
//!
//! ```
//! use flow_sync::RetryConfig;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! let vault = RetryConfig::vault();
//! assert_eq!(vault.max_retries, Some(4));
//! ```

use crate::storage::traits::StorageError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Backoff policy for a retried operation.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// `None` retries forever
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Fail fast on bad connection config: 5 attempts, roughly 5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// 3 quick attempts, then hand the error back to the tick.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Vault listings while seeding a table.
    #[must_use]
    pub fn vault() -> Self {
        Self {
            max_retries: Some(4),
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, attempts, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                match config.max_retries {
                    Some(max) if attempts >= max => return Err(err),
                    Some(max) => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        max,
                        error = %err,
                        "Operation failed, retrying in {:?}", delay
                    ),
                    None => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        error = %err,
                        "Operation failed, retrying forever. Next in {:?}", delay
                    ),
                }

                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Bound `fut` by `after`. A zero duration disables the bound.
pub async fn with_timeout<T, Fut>(
    operation: &str,
    after: Duration,
    fut: Fut,
) -> Result<T, StorageError>
where
    Fut: Future<Output = Result<T, StorageError>>,
{
    if after.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => {
            crate::metrics::record_timeout(operation);
            Err(StorageError::Timeout {
                operation: operation.to_string(),
                after,
            })
        }
    }
}
