/*!
 * Error types for Tradegate
 */

use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Type-erased cause carried by remote failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Where in the execution pipeline cancellation was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStage {
    /// Waiting for a concurrency slot
    ConcurrencySlot,
    /// Checking or replacing the client
    HealthCheck,
    /// Waiting for rate limit admission
    RateLimit,
    /// Running or retrying the operation
    Operation,
}

impl fmt::Display for CancelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelStage::ConcurrencySlot => write!(f, "concurrency slot"),
            CancelStage::HealthCheck => write!(f, "health check"),
            CancelStage::RateLimit => write!(f, "rate limit admission"),
            CancelStage::Operation => write!(f, "operation"),
        }
    }
}

/// Failure of a gateway call
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The gateway was used before `configure`
    #[error("Gateway is not configured")]
    NotConfigured,

    /// Configuration rejected at setup
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The venue client could not be built
    #[error("Failed to create venue client: {0}")]
    ClientCreation(#[source] BoxError),

    /// Rejected by the circuit breaker without attempting the call
    #[error("Circuit breaker is open, retry in {:.1}s", .retry_in.as_secs_f64())]
    CircuitOpen { retry_in: Duration },

    /// The caller's cancellation token fired
    #[error("Cancelled while waiting for {stage}")]
    Cancelled { stage: CancelStage },

    /// The wrapped operation failed on every attempt
    #[error("Remote call failed after {attempts} attempt(s): {reason}")]
    RemoteFailure {
        attempts: u32,
        reason: String,
        #[source]
        source: BoxError,
    },
}

impl GatewayError {
    /// Build a remote failure from the last error of an operation
    pub fn remote(attempts: u32, source: BoxError) -> Self {
        GatewayError::RemoteFailure {
            attempts,
            reason: source.to_string(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::NotConfigured => ErrorKind::NotConfigured,
            GatewayError::InvalidConfig(_) => ErrorKind::Configuration,
            GatewayError::ClientCreation(_) => ErrorKind::Client,
            GatewayError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            GatewayError::Cancelled { .. } => ErrorKind::Cancelled,
            GatewayError::RemoteFailure { .. } => ErrorKind::RemoteFailure,
        }
    }

    /// Whether trying the same call again later can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            // Fatal to the caller
            GatewayError::NotConfigured => false,
            GatewayError::InvalidConfig(_) => false,
            GatewayError::Cancelled { .. } => false,

            // Recoverable once the venue or the breaker settles
            GatewayError::ClientCreation(_) => true,
            GatewayError::CircuitOpen { .. } => true,
            GatewayError::RemoteFailure { .. } => true,
        }
    }
}

/// Flat classification for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotConfigured,
    Configuration,
    Client,
    CircuitOpen,
    Cancelled,
    RemoteFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotConfigured => write!(f, "not_configured"),
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::Client => write!(f, "client"),
            ErrorKind::CircuitOpen => write!(f, "circuit_open"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::RemoteFailure => write!(f, "remote_failure"),
        }
    }
}
