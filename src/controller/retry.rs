//! Bounded retry policy for admin-client and object-storage calls
//!
//! Calls are awaited sequentially inside one event; a call is retried only
//! while its error is transient, and the caller sees the last error once
//! attempts run out.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::debug;

use crate::constants::{
    DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MAX_DELAY_MS,
};
use crate::controller::error::{Error, Result};

/// Retry policy injected into every component that calls out
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy without delays, for tests and simulations
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Exponential backoff builder matching this policy
    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Run `operation`, retrying while it fails with a transient error
    pub async fn run<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        operation
            .retry(self.backoff())
            .when(Error::is_retryable)
            .notify(|err, delay| {
                debug!(
                    operation = operation_name,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after transient failure"
                );
            })
            .await
    }
}
