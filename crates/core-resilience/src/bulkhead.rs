//! Bulkhead: caps how many operations run against a shared resource at once
//!
//! Waiters are not served in any particular order; under sustained overload
//! a caller can wait indefinitely unless its cancellation token fires.

use super::error::ResilienceError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Waits longer than this are logged
pub const SLOW_ACQUIRE_THRESHOLD: Duration = Duration::from_secs(1);

/// Fixed-capacity concurrency limiter
///
/// The returned permit releases its slot when dropped, on every exit path.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrency: usize) -> Result<Self, ResilienceError> {
        if max_concurrency == 0 {
            return Err(ResilienceError::InvalidConfig(
                "max_concurrency must be greater than zero".to_string(),
            ));
        }
        if max_concurrency > Semaphore::MAX_PERMITS {
            return Err(ResilienceError::InvalidConfig(format!(
                "max_concurrency must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        })
    }

    /// Wait for a free slot, or fail with [`ResilienceError::Cancelled`]
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, ResilienceError> {
        let started = Instant::now();

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ResilienceError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => permit,
        };
        // The semaphore is never closed
        let permit = permit.map_err(|_| ResilienceError::Cancelled)?;

        let waited = started.elapsed();
        if waited > SLOW_ACQUIRE_THRESHOLD {
            tracing::warn!(
                waited_ms = waited.as_millis() as u64,
                max_concurrency = self.max_concurrency,
                "Concurrency slot acquisition was slow"
            );
        }

        Ok(permit)
    }

    /// Slots free right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}
