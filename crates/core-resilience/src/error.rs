//! Error types for the resilience primitives

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in resilience operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResilienceError {
    /// Circuit breaker is open, rejecting requests without attempting them
    #[error("Circuit breaker is open, retry in {:.1}s", .retry_in.as_secs_f64())]
    CircuitOpen { retry_in: Duration },

    /// Rate limit window is full (only returned by non-waiting admission)
    #[error("Rate limit exceeded, retry after the window reopens")]
    RateLimitExceeded,

    /// The caller's cancellation token fired while waiting
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration rejected at setup time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ResilienceError {
    /// Check if this error should contribute to circuit breaker failure count
    pub fn should_trip_breaker(&self) -> bool {
        !matches!(
            self,
            ResilienceError::CircuitOpen { .. } | ResilienceError::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_classification() {
        assert!(ResilienceError::RateLimitExceeded.should_trip_breaker());
        assert!(ResilienceError::InvalidConfig("limit".to_string()).should_trip_breaker());
        assert!(!ResilienceError::Cancelled.should_trip_breaker());
        assert!(!ResilienceError::CircuitOpen {
            retry_in: Duration::from_secs(3),
        }
        .should_trip_breaker());
    }

    #[test]
    fn test_circuit_open_message() {
        let open = ResilienceError::CircuitOpen {
            retry_in: Duration::from_millis(2500),
        };
        assert_eq!(open.to_string(), "Circuit breaker is open, retry in 2.5s");
    }
}
