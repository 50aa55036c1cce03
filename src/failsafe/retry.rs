//! Retry logic with exponential backoff for idempotent operations

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::debug;

use crate::config::ConnectivityConfig;

/// Retry policy configuration
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: usize,
    /// Initial backoff
    pub initial_backoff: Duration,
    /// Maximum backoff
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub const NONE: Self = Self {
        max_attempts: 1,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
    };

    /// Policy for management-cluster reads
    #[must_use]
    pub fn from_connectivity(config: &ConnectivityConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            initial_backoff: config.retry_backoff,
            max_backoff: config.retry_backoff.saturating_mul(8),
        }
    }

    /// Policy for credential store lookups
    #[must_use]
    pub fn storage_lookup() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }

    fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_max_times(self.max_attempts.saturating_sub(1))
            .with_jitter()
    }
}

/// Execute an idempotent operation, retrying while `is_transient` says so.
///
/// # Errors
///
/// Returns the last error from `f` once attempts are exhausted, or the first
/// error that is not transient.
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    name: &str,
    f: F,
    is_transient: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    if policy.max_attempts <= 1 {
        let mut f = f;
        return f().await;
    }

    f.retry(policy.builder())
        .when(|e| is_transient(e))
        .notify(|e, delay| {
            debug!(operation = name, error = %e, delay_ms = delay.as_millis(), "Retrying after transient error");
        })
        .await
}
