//! Tradegate Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the building blocks the Tradegate gateway composes to
//! protect calls against a rate-limited, occasionally unhealthy remote venue:
//!
//! - **Rate Limit Bucket**: Sliding-window quota with adaptive backoff and jitter
//! - **Circuit Breaker**: Fails fast while the venue is unhealthy, lets one trial call through to recover
//! - **Bulkhead**: Caps how many operations run at the same time
//! - **Retry Policy**: Fixed attempt count, cancellable
//! - **Cost Analyzer**: Pre-flight weight and order-rate estimates for a batch
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Venue protocols (REST, WebSocket, FIX)
//! - Client handles or credentials
//! - Application-specific concerns
//!
//! Every wait honours a [`tokio_util::sync::CancellationToken`], and no lock
//! is held across an `.await`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │   (Cost Analyzer: pre-flight, no I/O)
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (Tracks failures, opens on threshold)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Bulkhead                          │  ← Bounded concurrency
//! │  (Semaphore permit, released on drop)   │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limit Bucket                 │  ← Stay under venue quotas
//! │  (Sliding window, backoff + jitter)     │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Retry Policy                      │  ← Fixed attempts
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         Remote Venue API
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use tradegate_core_resilience::prelude::*;
//! use tokio_util::sync::CancellationToken;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let bucket = RateLimitBucket::new("orders", BucketConfig::new(10, Duration::from_secs(1)))?;
//! let breaker = CircuitBreaker::new("orders", CircuitBreakerConfig::default())?;
//! let cancel = CancellationToken::new();
//!
//! bucket.acquire(&cancel).await?;
//! let filled = breaker.execute(|| async {
//!     // Your venue call
//!     Ok::<_, ResilienceError>(true)
//! }).await?;
//!
//! if filled {
//!     bucket.record_success();
//! }
//! # Ok(())
//! # }
//! ```

pub mod bulkhead;
pub mod circuit_breaker;
pub mod cost_analyzer;
pub mod error;
pub mod rate_limiter;
pub mod retry;

// Re-export main types for convenience
pub use bulkhead::ConcurrencyLimiter;
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
    StateTransition,
};
pub use cost_analyzer::{
    estimate_batch, CallCost, CostAnalyzer, CostLimits, OrderRateVerdict, SimulationReport,
    SimulationRequest, TimedCall,
};
pub use error::ResilienceError;
pub use rate_limiter::{BucketConfig, BucketStats, RateLimitBucket};
pub use retry::{RetryFailure, RetryPolicy};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use tradegate_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::bulkhead::ConcurrencyLimiter;
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::cost_analyzer::{CallCost, CostAnalyzer, CostLimits};
    pub use super::error::ResilienceError;
    pub use super::rate_limiter::{BucketConfig, RateLimitBucket};
    pub use super::retry::{RetryFailure, RetryPolicy};
}
