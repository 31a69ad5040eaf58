use crate::resilience::classifier::{ClassifiedFailure, Outcome};
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff configuration shared read-only by every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential: bool,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            exponential: true,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Un-jittered delay after the given 1-based attempt:
    /// `min(base * 2^(attempt-1), max)`, or `min(base, max)` when growth is off.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = if self.exponential {
            attempt.saturating_sub(1).min(32)
        } else {
            0
        };
        let delay_ms = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }

    /// Delay to wait after a failed attempt.
    ///
    /// An explicit provider hint replaces the computed backoff; both are
    /// capped at `max_delay`. Jitter scales the computed backoff by a
    /// uniform factor in `[0.5, 1.0]`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_delay());
        }

        let delay = self.backoff_delay(attempt);
        if self.jitter {
            let factor = rand::rng().random_range(0.5..=1.0);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }
}

/// Suspends the retry loop between attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()>;
}

/// [`Sleeper`] backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Successful result together with the number of attempts it took.
#[derive(Debug, Clone)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RetryError {
    /// The operation failed with an outcome the engine does not retry.
    #[error("not retried after attempt {attempts}: {failure}")]
    NonRetryable {
        failure: ClassifiedFailure,
        attempts: u32,
    },
    /// Every attempt failed with a retryable outcome.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: ClassifiedFailure,
    },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::NonRetryable { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn failure(&self) -> &ClassifiedFailure {
        match self {
            RetryError::NonRetryable { failure, .. } => failure,
            RetryError::Exhausted { last, .. } => last,
        }
    }

    pub fn outcome(&self) -> Outcome {
        self.failure().outcome
    }
}

/// Exponential-backoff executor.
///
/// Knows nothing about providers, keys or tiers: it calls an operation until
/// it succeeds, fails with a non-retryable outcome, or runs out of attempts.
#[derive(Clone)]
pub struct RetryEngine {
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryEngine").finish_non_exhaustive()
    }
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryEngine {
    pub fn new() -> Self {
        Self::with_sleeper(Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(sleeper: Arc<dyn Sleeper>) -> Self {
        Self { sleeper }
    }

    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<Retried<T>, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClassifiedFailure>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let failure = match operation().await {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                    });
                }
                Err(failure) => failure,
            };

            if !failure.outcome.is_retryable() {
                debug!(
                    "Attempt {} failed with {}, not retrying",
                    attempt, failure.outcome
                );
                return Err(RetryError::NonRetryable {
                    failure,
                    attempts: attempt,
                });
            }

            if attempt >= max_attempts {
                warn!(
                    "Giving up after {} attempts, last outcome: {}",
                    attempt, failure.outcome
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: failure,
                });
            }

            let delay = policy.delay_for(attempt, failure.retry_after);
            warn!(
                "Attempt {}/{} failed ({}), retrying in {:?}",
                attempt, max_attempts, failure.outcome, delay
            );
            self.sleeper.sleep(delay).await;
        }
    }
}
