//! Fixed-count retry policy
//!
//! Retries do not back off on their own: pacing against the venue is the
//! rate limiter's job. An optional constant delay can be set between
//! attempts; it honours cancellation like every other wait.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a retried operation did not produce a value
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// Cancellation fired before or during an attempt
    Cancelled { attempts: u32 },
    /// Every attempt failed; `last` is the final error
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryFailure<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryFailure::Cancelled { attempts } | RetryFailure::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryFailure::Cancelled { attempts } => {
                write!(f, "cancelled after {} attempt(s)", attempts)
            }
            RetryFailure::Exhausted { attempts, last } => {
                write!(f, "failed after {} attempt(s): {}", attempts, last)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Pause between attempts
    pub delay: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Run `op` until it succeeds, attempts run out, or `cancel` fires.
    ///
    /// On success returns the value together with the number of attempts made.
    pub async fn execute<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<(T, u32), RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut attempt = 0u32;
        let mut last_error: Option<E> = None;

        while attempt <= self.max_retries {
            if attempt > 0 {
                if let Some(delay) = self.delay {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(RetryFailure::Cancelled { attempts: attempt });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
            if cancel.is_cancelled() {
                return Err(RetryFailure::Cancelled { attempts: attempt });
            }

            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryFailure::Cancelled { attempts: attempt });
                }
                outcome = op(attempt) => outcome,
            };

            match outcome {
                Ok(value) => return Ok((value, attempt)),
                Err(e) => {
                    if attempt <= self.max_retries {
                        tracing::debug!(
                            attempt,
                            max_attempts = self.max_attempts(),
                            error = %e,
                            "Attempt failed, retrying"
                        );
                    }
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(last) => Err(RetryFailure::Exhausted {
                attempts: attempt,
                last,
            }),
            // Unreachable: the loop runs at least once
            None => Err(RetryFailure::Cancelled { attempts: attempt }),
        }
    }
}
