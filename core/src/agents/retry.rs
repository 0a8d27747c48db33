//! Bounded retry with exponential backoff and per-attempt deadlines.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::backend::TokenSink;
use crate::errors::GenerationError;
use crate::settings::RetrySettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base × 2^(attempt−1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Handed to each attempt.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 1-based.
    pub number: u32,
    /// Cancelled when the attempt times out or the caller cancels.
    pub cancel: CancellationToken,
}

/// Drive `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// Each attempt gets a child of `cancel` and is bounded by `timeout`; expiry
/// cancels the child, drops the in-flight future and counts as
/// [`GenerationError::Timeout`]. An attempt that already pushed tokens into
/// `sink` is never repeated.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    cancel: &CancellationToken,
    sink: &TokenSink,
    mut op: F,
) -> Result<T, GenerationError>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, GenerationError>>,
{
    let max_attempts = policy.max_attempts();
    let mut number = 0;
    loop {
        number += 1;
        let attempt_token = cancel.child_token();
        let attempt = Attempt {
            number,
            cancel: attempt_token.clone(),
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(GenerationError::Cancelled),
            result = tokio::time::timeout(timeout, op(attempt)) => match result {
                Ok(result) => result,
                Err(_) => Err(GenerationError::Timeout(Some(timeout.as_millis() as u64))),
            },
        };
        attempt_token.cancel();

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_retryable() || sink.delivered() {
            return Err(err);
        }
        if number >= max_attempts {
            log::warn!("giving up after {number} attempts: {err}");
            return Err(GenerationError::RetriesExhausted {
                attempts: number,
                last: Box::new(err),
            });
        }

        let delay = policy.delay_for(number);
        log::info!(
            "attempt {number}/{max_attempts} failed ({}), retrying in {}ms",
            err.code(),
            delay.as_millis()
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
