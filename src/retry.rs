//! Bounded retry with exponential backoff for calls to external services.
//!
//! Each call walks a small state machine: attempt, then on a retryable failure
//! back off and attempt again, until it succeeds or the attempt budget runs out.
//! Every attempt is wrapped in a timeout so a stalled service surfaces as
//! [`BalerError::Timeout`] instead of hanging the caller.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{BalerError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 16_000,
            attempt_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Attempt(usize),
    BackingOff { attempt: usize, delay: Duration },
}

impl RetryPolicy {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms.max(1))
    }

    fn backoff(&self, attempt: usize) -> Duration {
        let capped = (attempt.saturating_sub(1)).min(5) as u32;
        let exp = self.base_delay_ms.saturating_mul(1 << capped);
        let delay = exp.min(self.max_delay_ms.max(self.base_delay_ms));
        let jitter = if self.base_delay_ms > 1 {
            rand::rng().random_range(0..=self.base_delay_ms / 2)
        } else {
            0
        };
        Duration::from_millis(delay + jitter)
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let timeout = self.attempt_timeout();
        let mut state = CallState::Attempt(1);

        loop {
            match state {
                CallState::Attempt(attempt) => {
                    let outcome = match tokio::time::timeout(timeout, call()).await {
                        Ok(result) => result,
                        Err(_) => Err(BalerError::Timeout {
                            operation: operation.to_string(),
                            after: timeout,
                        }),
                    };

                    match outcome {
                        Ok(value) => {
                            if attempt > 1 {
                                tracing::debug!(operation, attempt, "succeeded after retry");
                            }
                            return Ok(value);
                        }
                        Err(err) if err.is_retryable() && attempt < max_attempts => {
                            let delay = self.backoff(attempt);
                            tracing::warn!(
                                operation,
                                attempt,
                                ?delay,
                                error = %err,
                                "retryable failure, backing off"
                            );
                            state = CallState::BackingOff { attempt, delay };
                        }
                        Err(err) if err.is_retryable() => {
                            tracing::error!(operation, attempts = attempt, error = %err, "retries exhausted");
                            return Err(BalerError::RetriesExhausted {
                                operation: operation.to_string(),
                                attempts: attempt,
                                last: err.to_string(),
                            });
                        }
                        Err(err) => return Err(err),
                    }
                }
                CallState::BackingOff { attempt, delay } => {
                    tokio::time::sleep(delay).await;
                    state = CallState::Attempt(attempt + 1);
                }
            }
        }
    }
}
