//! Retry configuration, delay calculation, and the retrying backend decorator.
//!
//! Retries happen inside a single dispatch slot: the dispatcher sees one
//! call with one latency, and the retry loop never outlives the deadline
//! the call was given.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{instrument, warn};

use crate::telemetry;

use super::traits::Backend;
use crate::types::{BackendId, BackendReply, GenerationParams};
use crate::{OrchesityError, Result};

/// Configuration for retry behaviour on transient errors.
///
/// Uses exponential backoff. `max_attempts = 1` (the default) disables
/// retries.
///
/// ```rust
/// # use orchesity::backend::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .max_attempts(3)
///     .initial_delay(Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial request). Default: 1.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay before the first retry. Default: 250ms.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Maximum delay between retries. Default: 5s.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum attempts (including the initial request).
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set the base delay before the first retry.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the maximum delay between retries.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 1
    }

    /// `initial_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = Duration::from_millis(self.initial_delay_ms)
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(Duration::from_millis(self.max_delay_ms))
    }

    /// Backoff for `attempt`, preferring a provider `retry_after` hint.
    pub fn effective_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or_else(|| self.delay_for_attempt(attempt))
    }
}

/// Run `f` until it succeeds, fails permanently, runs out of attempts, or
/// the next backoff would cross `budget`.
///
/// `f` receives the budget remaining for that attempt.
#[instrument(name = "retry", skip_all, fields(backend = %backend, max_attempts = config.max_attempts))]
pub(crate) async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    backend: &BackendId,
    budget: Duration,
    f: F,
) -> Result<T>
where
    F: Fn(Duration) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + budget.min(crate::dispatch::MAX_DEADLINE);
    let mut last_err = None;
    for attempt in 0..config.max_attempts.max(1) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match f(remaining).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() => {
                if attempt + 1 < config.max_attempts {
                    let delay = config.effective_delay(attempt, e.retry_after());
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if delay >= remaining {
                        return Err(e);
                    }
                    metrics::counter!(telemetry::RETRIES_TOTAL,
                        "backend" => backend.to_string(),
                    )
                    .increment(1);
                    warn!(
                        backend = %backend,
                        attempt = attempt + 1,
                        max_attempts = config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| OrchesityError::Backend {
        backend: backend.clone(),
        message: "no attempts made".into(),
    }))
}

/// Decorator that wraps a [`Backend`] with retry logic.
///
/// On transient errors (see [`OrchesityError::is_transient()`]) it retries
/// with exponential backoff within the budget it was invoked with.
/// Permanent errors are returned immediately.
pub struct RetryingBackend {
    inner: Arc<dyn Backend>,
    config: RetryConfig,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn Backend>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl Backend for RetryingBackend {
    fn id(&self) -> &BackendId {
        self.inner.id()
    }

    async fn invoke(
        &self,
        prompt: &str,
        params: &GenerationParams,
        deadline: Duration,
    ) -> Result<BackendReply> {
        with_retry(&self.config, self.inner.id(), deadline, |remaining| {
            self.inner.invoke(prompt, params, remaining)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_disabled_by_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 1);
        assert!(!config.is_enabled());
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let config = RetryConfig::new()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(350));
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(config.delay_for_attempt(30), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_hint_wins() {
        let config = RetryConfig::new();
        assert_eq!(
            config.effective_delay(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
    }
}
