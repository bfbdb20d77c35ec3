// src/retry.rs
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::EngineError;

/// A terminal failure plus how many attempts were spent reaching it.
#[derive(Debug)]
pub struct RetryError {
    pub error: EngineError,
    pub attempts: u32,
}

/// Runs units of work with bounded retry.
///
/// The closure is re-entered in full on every retryable conflict, so the
/// caller must put the idempotency probe inside it: a prior attempt may
/// have committed before the store reported the conflict back.
#[derive(Debug, Clone)]
pub struct Coordinator {
    retry_budget: u32,
    initial_backoff: Duration,
}

impl Coordinator {
    pub fn new(retry_budget: u32, initial_backoff: Duration) -> Self {
        Self {
            retry_budget,
            initial_backoff,
        }
    }

    /// Run `op` until it succeeds, fails terminally, or the retry budget is
    /// spent. Cancellation wins over an in-flight attempt (the attempt
    /// future is dropped, rolling back any open transaction) and over a
    /// backoff sleep.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError {
                    error: EngineError::Canceled,
                    attempts,
                });
            }

            attempts += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError {
                        error: EngineError::Canceled,
                        attempts,
                    });
                }
                outcome = op() => outcome,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempts <= self.retry_budget => {
                    metrics::counter!("centime_retries_total").increment(1);
                    tracing::debug!(attempt = attempts, %error, "conflict, backing off");

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(RetryError {
                                error: EngineError::Canceled,
                                attempts,
                            });
                        }
                        _ = tokio::time::sleep(self.backoff_for(attempts)) => {}
                    }
                }
                Err(error) => return Err(RetryError { error, attempts }),
            }
        }
    }

    // initial * 2^(n-1), plus up to 10ms of jitter to spread thundering
    // retries of the same contended rows.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..10u64);
        self.initial_backoff * (1u32 << (attempt - 1).min(31)) + Duration::from_millis(jitter)
    }
}
