/*!
 * Tradegate - resilience gateway for rate-limited trading venue APIs
 *
 * All calls to a shared venue client go through one [`Gateway`], which
 * combines:
 * - A fixed-size concurrency throttle
 * - Named sliding-window rate limit buckets with adaptive backoff
 * - An optional circuit breaker in front of the venue
 * - A fixed-count retry policy
 * - Health checks with automatic client recreation
 * - Pre-flight batch cost analysis
 *
 * The primitives live in the `tradegate-core-resilience` crate and are
 * re-exported here.
 */

pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod simulation;

// Re-export commonly used types
pub use config::{BucketSettings, CircuitBreakerSettings, GatewayConfig, LogLevel};
pub use error::{BoxError, CancelStage, ErrorKind, GatewayError, Result};
pub use gateway::{ClientFactory, Gateway};
pub use tradegate_core_resilience as resilience;
pub use tradegate_core_resilience::{CallCost, CircuitState, CostAnalyzer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
