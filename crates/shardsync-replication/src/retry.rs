//! Retry with exponential backoff
//!
//! Transient transport failures (`Error::is_retryable`) inside one
//! replication attempt are retried under the same replication id.
//! Integrity failures and cancellations are never retried here; they end
//! the attempt.
//!
//! ```text
//! backoff(n) = min(initial_backoff * multiplier^n, max_backoff)
//!
//! defaults: 100ms, 200ms, 400ms, 800ms (5 attempts total)
//! ```

use shardsync_common::config::RetryConfig;
use shardsync_common::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total tries, the first one included
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
        }
    }

    /// A policy that tries once, for tests and one-shot callers
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (0-indexed)
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether another try is allowed after `tries` failed ones
    pub fn should_retry(&self, error: &Error, tries: u32) -> bool {
        error.is_retryable() && tries < self.max_attempts
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// runs out of attempts or `cancel` fires. Cancellation during a
    /// backoff sleep is reported through `on_cancel`.
    pub async fn run<T, F, Fut, C>(
        &self,
        name: &str,
        cancel: &CancellationToken,
        on_cancel: C,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn() -> Error,
    {
        let mut tries = 0u32;
        loop {
            tries += 1;
            match operation().await {
                Ok(value) => {
                    if tries > 1 {
                        debug!("{} succeeded after {} tries", name, tries);
                    }
                    return Ok(value);
                }
                Err(e) if self.should_retry(&e, tries) => {
                    let backoff = self.backoff(tries - 1);
                    warn!(
                        "{} failed (try {}/{}): {}, retrying in {:?}",
                        name, tries, self.max_attempts, e, backoff
                    );
                    self.sleep(backoff, cancel, &on_cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sleep for `backoff` unless cancelled first
    pub async fn sleep<C>(
        &self,
        backoff: Duration,
        cancel: &CancellationToken,
        on_cancel: &C,
    ) -> Result<()>
    where
        C: Fn() -> Error,
    {
        tokio::select! {
            () = cancel.cancelled() => Err(on_cancel()),
            () = tokio::time::sleep(backoff) => Ok(()),
        }
    }
}
