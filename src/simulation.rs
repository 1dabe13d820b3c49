/*!
 * In-process simulated venue
 *
 * Stands in for a real exchange client when exercising the gateway: every
 * call sleeps for a configurable latency and fails with a configurable
 * probability. Used by `tradegate simulate` and by tests.
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;
use crate::gateway::ClientFactory;

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedVenueConfig {
    /// Time every call takes
    pub latency: Duration,
    /// Probability in `[0, 1]` that a call fails with a connectivity error
    pub failure_rate: f64,
    /// Probability in `[0, 1]` that an order is rejected by venue validation
    pub rejection_rate: f64,
    /// Probability in `[0, 1]` that the health check fails
    pub health_failure_rate: f64,
}

impl Default for SimulatedVenueConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(5),
            failure_rate: 0.0,
            rejection_rate: 0.0,
            health_failure_rate: 0.0,
        }
    }
}

impl SimulatedVenueConfig {
    fn clamped(mut self) -> Self {
        self.failure_rate = self.failure_rate.clamp(0.0, 1.0);
        self.rejection_rate = self.rejection_rate.clamp(0.0, 1.0);
        self.health_failure_rate = self.health_failure_rate.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VenueError {
    /// Connectivity problem; a fresh client may help
    #[error("venue unavailable: {0}")]
    Unavailable(String),

    /// The venue refused the request itself
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderAck {
    pub order_id: u64,
    pub symbol: String,
    pub quantity: f64,
}

/// One connection to the simulated venue
#[derive(Debug)]
pub struct VenueClient {
    id: u64,
    config: SimulatedVenueConfig,
    requests: AtomicU64,
}

impl VenueClient {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Requests served by this client
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub async fn ping(&self, cancel: &CancellationToken) -> Result<(), VenueError> {
        self.round_trip(cancel).await?;
        if roll(self.config.health_failure_rate) {
            return Err(VenueError::Unavailable("ping timed out".to_string()));
        }
        Ok(())
    }

    pub async fn ticker(&self, symbol: &str, cancel: &CancellationToken) -> Result<Ticker, VenueError> {
        self.round_trip(cancel).await?;
        self.maybe_drop()?;

        let price = rand::rng().random_range(20_000.0..80_000.0);
        Ok(Ticker {
            symbol: symbol.to_string(),
            price,
        })
    }

    pub async fn place_order(
        &self,
        symbol: &str,
        quantity: f64,
        cancel: &CancellationToken,
    ) -> Result<OrderAck, VenueError> {
        self.round_trip(cancel).await?;
        self.maybe_drop()?;

        if quantity <= 0.0 {
            return Err(VenueError::Rejected(format!(
                "quantity must be positive, got {quantity}"
            )));
        }
        if roll(self.config.rejection_rate) {
            return Err(VenueError::Rejected("insufficient balance".to_string()));
        }

        let order_id = (self.id << 32) | self.requests();
        Ok(OrderAck {
            order_id,
            symbol: symbol.to_string(),
            quantity,
        })
    }

    async fn round_trip(&self, cancel: &CancellationToken) -> Result<(), VenueError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(VenueError::Cancelled),
            _ = tokio::time::sleep(self.config.latency) => Ok(()),
        }
    }

    fn maybe_drop(&self) -> Result<(), VenueError> {
        if roll(self.config.failure_rate) {
            return Err(VenueError::Unavailable("connection reset by peer".to_string()));
        }
        Ok(())
    }
}

fn roll(probability: f64) -> bool {
    probability > 0.0 && rand::rng().random_bool(probability)
}

/// [`ClientFactory`] for [`VenueClient`]s
#[derive(Debug)]
pub struct SimulatedVenue {
    config: SimulatedVenueConfig,
    created: AtomicU64,
}

impl SimulatedVenue {
    pub fn new(config: SimulatedVenueConfig) -> Self {
        Self {
            config: config.clamped(),
            created: AtomicU64::new(0),
        }
    }

    /// Clients built so far
    pub fn clients_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ClientFactory<VenueClient> for SimulatedVenue {
    async fn create(&self) -> Result<VenueClient, BoxError> {
        let id = self.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(client_id = id, "Simulated venue client created");
        Ok(VenueClient {
            id,
            config: self.config.clone(),
            requests: AtomicU64::new(0),
        })
    }

    async fn is_healthy(&self, client: &VenueClient, cancel: &CancellationToken) -> Result<(), BoxError> {
        client.ping(cancel).await.map_err(BoxError::from)
    }

    /// Rejections are the venue working as intended; only connectivity
    /// errors warrant a new client.
    fn should_recreate(&self, error: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
        !matches!(
            error.downcast_ref::<VenueError>(),
            Some(VenueError::Rejected(_))
        )
    }
}
