use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::errors::{ConduitError, ConduitResult};

/// Exponential backoff around a fallible attempt.
///
/// Only errors for which [`ConduitError::is_retryable`] holds are retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    /// A policy that makes exactly one attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Sleep after the given failed attempt (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }

    /// Invoke `attempt` until it succeeds, fails with a non-retryable error,
    /// or the attempts run out. The attempt receives the token and its
    /// 1-based number.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut attempt: F) -> ConduitResult<T>
    where
        F: FnMut(CancellationToken, u32) -> Fut,
        Fut: Future<Output = ConduitResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut number = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(ConduitError::Cancelled);
            }

            let error = match attempt(cancel.clone(), number).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if !error.is_retryable() {
                return Err(error);
            }
            if number >= max_attempts {
                return Err(ConduitError::RetryExhausted {
                    attempts: number,
                    last: Box::new(error),
                });
            }

            let delay = self.delay_for_attempt(number);
            tracing::warn!(
                attempt = number,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConduitError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            number += 1;
        }
    }
}
