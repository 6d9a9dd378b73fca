//! Exponential backoff for transient transport failures

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{Error, Result};

/// Retry behaviour for transport calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub add_jitter: bool,
}

impl RetryConfig {
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = (self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());
        let delay_secs = if self.add_jitter {
            delay_secs + delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..1.0)
        } else {
            delay_secs
        };
        Duration::from_secs_f64(delay_secs)
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only [`Error::is_retryable`] failures are retried. Cancellation is
    /// observed before each attempt and during backoff sleeps.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::cancelled());
            }

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if !error.is_retryable() || attempt >= self.max_attempts {
                return Err(error);
            }

            let delay = self.delay_for_attempt(attempt);
            warn!(
                "{label} failed (attempt {attempt}/{}), retrying in {delay:?}: {error}",
                self.max_attempts
            );
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::cancelled()),
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
