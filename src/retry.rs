//! `RetryExecutor`: exponential backoff applied only to retryable errors.
//!
//! Retry only on a recognized transient condition, bubble everything else;
//! the backoff schedule itself is delegated to the `backoff` crate rather
//! than a hand-rolled sleep loop.

use crate::errors::DomainError;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Concrete retry executor: exponential backoff with jitter, bounded by a
/// max number of attempts and a max total elapsed time. Only errors whose
/// `is_retryable()` is true are retried.
pub struct BackoffRetryExecutor {
    max_attempts: u32,
    initial_interval: Duration,
    max_interval: Duration,
    max_elapsed: Duration,
}

impl Default for BackoffRetryExecutor {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(300),
        }
    }
}

impl BackoffRetryExecutor {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    fn backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build()
    }

    /// Runs `f` until it succeeds, a non-retryable error is returned, or the
    /// attempt/time budget is exhausted. `notify` is called before each
    /// retry sleep with the attempt number and the error that triggered it.
    pub async fn execute_with_notify<F, Fut, T>(
        &self,
        mut f: F,
        notify: impl Fn(u32, &DomainError),
    ) -> Result<T, DomainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DomainError>>,
    {
        let mut backoff = self.backoff();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    notify(attempt, &err);
                    match backoff.next_backoff() {
                        Some(delay) => {
                            warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying after transient error");
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, DomainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DomainError>>,
    {
        self.execute_with_notify(f, |_, _| {}).await
    }
}
