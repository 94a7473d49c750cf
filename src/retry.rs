//! Bounded retries with capped exponential backoff.
//!
//! A step body is attempted up to `max_attempts` times. Only errors for which
//! [`StepError::is_retryable`] holds are retried; the delay before retry `n`
//! is `backoff_initial * 2^(n-1)`, capped at `backoff_max`. Each attempt may
//! be bounded by a timeout, which counts as a transient failure.

use crate::errors::StepError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_millis(3, 300, 3000)
    }
}

/// Emitted between a failed attempt and the next one.
#[derive(Debug, Clone)]
pub struct RetryNotice {
    pub attempt: u32,
    pub delay: Duration,
    pub error: StepError,
}

/// A successful result and the number of attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// The error that ended the retry loop.
#[derive(Debug, Clone)]
pub struct RetryFailure {
    pub error: StepError,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_initial: Duration, backoff_max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_initial,
            backoff_max,
        }
    }

    pub fn from_millis(max_attempts: u32, backoff_initial_ms: u64, backoff_max_ms: u64) -> Self {
        Self::new(
            max_attempts,
            Duration::from_millis(backoff_initial_ms),
            Duration::from_millis(backoff_max_ms),
        )
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.backoff_initial
            .saturating_mul(factor)
            .min(self.backoff_max)
    }

    /// Run `op` until it succeeds, fails fatally, exhausts its attempts, or
    /// `cancel` fires. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut, R>(
        &self,
        cancel: &CancellationToken,
        attempt_timeout: Option<Duration>,
        mut op: F,
        mut on_retry: R,
    ) -> Result<Attempted<T>, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
        R: FnMut(&RetryNotice),
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryFailure {
                    error: StepError::Cancelled,
                    attempts: attempt - 1,
                });
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StepError::Cancelled),
                result = with_timeout(op(attempt), attempt_timeout) => result,
            };

            match result {
                Ok(value) => {
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, %error, "retrying step");
                    on_retry(&RetryNotice {
                        attempt,
                        delay,
                        error,
                    });
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(RetryFailure { error: StepError::Cancelled, attempts: attempt });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(error) => {
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}

async fn with_timeout<T, Fut>(fut: Fut, limit: Option<Duration>) -> Result<T, StepError>
where
    Fut: Future<Output = Result<T, StepError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(StepError::Timeout(limit))),
        None => fut.await,
    }
}
