/*!
 * Gateway: the composition root every venue call goes through
 *
 * Call path:
 *
 *   circuit breaker (optional) -> concurrency slot -> health check
 *     -> rate limit admission -> operation under retry policy
 *     -> success/failure reporting -> slot released
 *
 * The venue client is a single shared handle. It is replaced, never mutated:
 * readers clone the current `Arc` and keep using it, while replacement is
 * serialised by an async mutex and tagged with a generation so that a burst
 * of failures observed on one generation only recreates the client once.
 */

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

use tradegate_core_resilience::{
    BucketStats, CallCost, CircuitBreaker, CircuitBreakerStats, ConcurrencyLimiter, CostAnalyzer,
    RateLimitBucket, RetryFailure, RetryPolicy, StateTransition,
};

use crate::config::GatewayConfig;
use crate::error::{BoxError, CancelStage, GatewayError, Result};

/// Builds and health-checks venue clients
#[async_trait]
pub trait ClientFactory<C: Send + Sync + 'static>: Send + Sync {
    /// Create a new client
    async fn create(&self) -> std::result::Result<C, BoxError>;

    /// Inexpensive read-only check; an error marks the client as dead
    async fn is_healthy(
        &self,
        client: &C,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), BoxError>;

    /// Whether a failed operation should cause the client to be replaced
    fn should_recreate(&self, _error: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
        true
    }
}

/// One generation of the venue client
struct ClientHandle<C> {
    generation: u64,
    client: Arc<C>,
}

impl<C> Clone for ClientHandle<C> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            client: Arc::clone(&self.client),
        }
    }
}

struct ClientSlot<C> {
    current: RwLock<ClientHandle<C>>,
    recreate_guard: Mutex<()>,
}

impl<C: Send + Sync + 'static> ClientSlot<C> {
    fn new(client: C) -> Self {
        Self {
            current: RwLock::new(ClientHandle {
                generation: 0,
                client: Arc::new(client),
            }),
            recreate_guard: Mutex::new(()),
        }
    }

    fn current(&self) -> ClientHandle<C> {
        self.current.read().clone()
    }

    /// Replace the client unless someone already replaced generation `observed`
    async fn recreate(
        &self,
        factory: &dyn ClientFactory<C>,
        observed: u64,
        reason: &str,
    ) -> Result<ClientHandle<C>> {
        let _guard = self.recreate_guard.lock().await;

        let current = self.current();
        if current.generation != observed {
            tracing::debug!(
                observed,
                current = current.generation,
                "Venue client already replaced"
            );
            return Ok(current);
        }

        let client = factory
            .create()
            .await
            .map_err(GatewayError::ClientCreation)?;
        let handle = ClientHandle {
            generation: observed + 1,
            client: Arc::new(client),
        };
        *self.current.write() = handle.clone();

        tracing::info!(generation = handle.generation, reason, "Venue client recreated");
        Ok(handle)
    }

    async fn ensure_healthy(
        &self,
        factory: &dyn ClientFactory<C>,
        cancel: &CancellationToken,
    ) -> Result<ClientHandle<C>> {
        let handle = self.current();
        match factory.is_healthy(&handle.client, cancel).await {
            Ok(()) => Ok(handle),
            Err(e) => {
                tracing::warn!(
                    generation = handle.generation,
                    error = %e,
                    "Venue client unreachable, recreating"
                );
                self.recreate(factory, handle.generation, "health check failed")
                    .await
            }
        }
    }
}

/// Everything built by `configure`
struct Runtime<C> {
    config: GatewayConfig,
    limiter: ConcurrencyLimiter,
    buckets: HashMap<String, RateLimitBucket>,
    retry: RetryPolicy,
    breaker: Option<CircuitBreaker>,
    analyzer: CostAnalyzer,
    client: ClientSlot<C>,
}

impl<C: Send + Sync + 'static> Runtime<C> {
    async fn build(factory: &dyn ClientFactory<C>, config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let limiter = ConcurrencyLimiter::new(config.max_concurrent_requests)
            .map_err(|e| GatewayError::InvalidConfig(e.to_string()))?;

        let mut buckets = HashMap::with_capacity(config.limits.len());
        for (key, bucket_config) in config.bucket_configs()? {
            let bucket = RateLimitBucket::new(key.clone(), bucket_config)
                .map_err(|e| GatewayError::InvalidConfig(format!("limits.{key}: {e}")))?;
            buckets.insert(key, bucket);
        }

        let breaker = match &config.circuit_breaker {
            Some(settings) => Some(
                CircuitBreaker::new("venue", settings.to_breaker_config()?)
                    .map_err(|e| GatewayError::InvalidConfig(e.to_string()))?,
            ),
            None => None,
        };

        let client = factory
            .create()
            .await
            .map_err(GatewayError::ClientCreation)?;

        tracing::info!(
            max_concurrent_requests = config.max_concurrent_requests,
            retry_count = config.retry_count,
            buckets = buckets.len(),
            circuit_breaker = breaker.is_some(),
            "Gateway configured"
        );

        Ok(Self {
            retry: RetryPolicy::new(config.retry_count),
            analyzer: CostAnalyzer::new(config.cost_analyzer.into()),
            client: ClientSlot::new(client),
            config,
            limiter,
            buckets,
            breaker,
        })
    }
}

/// Resilience gateway in front of a shared venue client
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
/// use tradegate::config::{BucketSettings, GatewayConfig};
/// use tradegate::gateway::Gateway;
/// use tradegate::simulation::{SimulatedVenue, SimulatedVenueConfig, VenueClient};
///
/// # async fn example() -> tradegate::error::Result<()> {
/// let venue = SimulatedVenue::new(SimulatedVenueConfig::default());
/// let gateway: Gateway<VenueClient> = Gateway::new(Arc::new(venue));
///
/// let mut config = GatewayConfig::default();
/// config.limits.insert("weight".to_string(), BucketSettings::new(1200, "1m"));
/// gateway.configure(config).await?;
///
/// let cancel = CancellationToken::new();
/// let ticker = gateway
///     .execute("weight", &cancel, |client, cancel| async move {
///         client.ticker("BTCUSDT", &cancel).await
///     })
///     .await?;
/// println!("{} {}", ticker.symbol, ticker.price);
/// # Ok(())
/// # }
/// ```
pub struct Gateway<C: Send + Sync + 'static> {
    factory: Arc<dyn ClientFactory<C>>,
    runtime: OnceCell<Runtime<C>>,
}

impl<C: Send + Sync + 'static> Gateway<C> {
    /// Unconfigured gateway; every call fails with `NotConfigured` until `configure`
    pub fn new(factory: Arc<dyn ClientFactory<C>>) -> Self {
        Self {
            factory,
            runtime: OnceCell::new(),
        }
    }

    /// Build throttle, buckets, retry policy and the initial client.
    ///
    /// Idempotent: the first successful call wins and later calls are
    /// ignored. A failed call leaves the gateway unconfigured.
    pub async fn configure(&self, config: GatewayConfig) -> Result<()> {
        if self.runtime.initialized() {
            tracing::debug!("Gateway already configured, ignoring new settings");
            return Ok(());
        }

        let factory = self.factory.as_ref();
        self.runtime
            .get_or_try_init(|| Runtime::build(factory, config))
            .await?;
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.runtime.initialized()
    }

    /// Settings in effect, once configured
    pub fn config(&self) -> Option<&GatewayConfig> {
        self.runtime.get().map(|runtime| &runtime.config)
    }

    /// Run `op` against the venue client.
    ///
    /// `limit_key` selects the rate limit bucket; unknown keys run without
    /// rate limiting. `op` may be invoked several times under the retry
    /// policy and receives the current client and the caller's token.
    pub async fn execute<T, E, F, Fut>(
        &self,
        limit_key: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(Arc<C>, CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let runtime = self.runtime.get().ok_or(GatewayError::NotConfigured)?;

        // Held across the whole call; dropping it hands a half-open trial back
        let permit = match &runtime.breaker {
            Some(breaker) => Some(breaker.try_acquire().ok_or_else(|| {
                GatewayError::CircuitOpen {
                    retry_in: breaker.time_until_retry(),
                }
            })?),
            None => None,
        };

        let result = self.run_throttled(runtime, limit_key, cancel, op).await;

        if let Some(permit) = permit {
            match &result {
                Ok(_) => permit.record_success(),
                Err(GatewayError::Cancelled { .. }) => drop(permit),
                Err(e) => permit.record_failure(e),
            }
        }

        result
    }

    async fn run_throttled<T, E, F, Fut>(
        &self,
        runtime: &Runtime<C>,
        limit_key: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(Arc<C>, CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let _permit = runtime
            .limiter
            .acquire(cancel)
            .await
            .map_err(|_| GatewayError::Cancelled {
                stage: CancelStage::ConcurrencySlot,
            })?;

        let handle = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(GatewayError::Cancelled { stage: CancelStage::HealthCheck });
            }
            handle = runtime.client.ensure_healthy(self.factory.as_ref(), cancel) => handle?,
        };

        let bucket = runtime.buckets.get(limit_key);
        if let Some(bucket) = bucket {
            bucket
                .acquire(cancel)
                .await
                .map_err(|_| GatewayError::Cancelled {
                    stage: CancelStage::RateLimit,
                })?;
        }

        let outcome = runtime
            .retry
            .execute(cancel, |_| {
                let attempt = op(Arc::clone(&handle.client), cancel.clone());
                async move { attempt.await.map_err(|e| -> BoxError { e.into() }) }
            })
            .await;

        match outcome {
            Ok((value, attempts)) => {
                if let Some(bucket) = bucket {
                    bucket.record_success();
                }
                tracing::trace!(limit_key, attempts, "Venue call succeeded");
                Ok(value)
            }
            Err(RetryFailure::Cancelled { .. }) => Err(GatewayError::Cancelled {
                stage: CancelStage::Operation,
            }),
            Err(RetryFailure::Exhausted { attempts, last }) => {
                if let Some(bucket) = bucket {
                    bucket.record_failure();
                }
                tracing::error!(
                    limit_key,
                    attempts,
                    generation = handle.generation,
                    error = %last,
                    "Error during venue call"
                );

                if self.factory.should_recreate(last.as_ref()) {
                    self.recreate_after_failure(runtime, handle.generation, cancel)
                        .await;
                }
                Err(GatewayError::remote(attempts, last))
            }
        }
    }

    /// Failures here are logged only; the caller gets the operation's error
    async fn recreate_after_failure(
        &self,
        runtime: &Runtime<C>,
        generation: u64,
        cancel: &CancellationToken,
    ) {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(generation, "Cancelled before venue client recreation");
            }
            result = runtime.client.recreate(self.factory.as_ref(), generation, "operation failed") => {
                if let Err(e) = result {
                    tracing::warn!(generation, error = %e, "Venue client recreation failed");
                }
            }
        }
    }

    /// Usage of the named bucket in `[0, 1]`; `0.0` for unknown keys
    pub fn rate_limit_usage(&self, limit_key: &str) -> f64 {
        self.bucket(limit_key).map_or(0.0, |bucket| bucket.usage())
    }

    /// `false` for unknown keys
    pub fn is_approaching_limit(&self, limit_key: &str) -> bool {
        self.bucket(limit_key)
            .is_some_and(|bucket| bucket.is_approaching_limit())
    }

    /// `true` for unknown keys
    pub fn is_below_recovery_limit(&self, limit_key: &str) -> bool {
        self.bucket(limit_key)
            .map_or(true, |bucket| bucket.is_below_recovery_threshold())
    }

    /// Pre-flight weight estimate of a batch against the per-minute weight limit.
    ///
    /// Pure: live bucket state is never consulted. Available before `configure`,
    /// using default venue limits.
    pub fn analyze_batch(&self, calls: &[CallCost]) -> (u64, bool) {
        self.cost_analyzer().calculate_weight_usage(calls)
    }

    pub fn cost_analyzer(&self) -> CostAnalyzer {
        self.runtime
            .get()
            .map(|runtime| runtime.analyzer)
            .unwrap_or_default()
    }

    pub fn bucket_stats(&self, limit_key: &str) -> Option<BucketStats> {
        self.bucket(limit_key).map(|bucket| bucket.stats())
    }

    /// Stats of every bucket, sorted by key
    pub fn all_bucket_stats(&self) -> Vec<BucketStats> {
        let mut stats: Vec<_> = self
            .runtime
            .get()
            .map(|runtime| runtime.buckets.values().map(|b| b.stats()).collect())
            .unwrap_or_default();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// `None` when no circuit breaker is configured
    pub fn circuit_stats(&self) -> Option<CircuitBreakerStats> {
        self.breaker().map(|breaker| breaker.stats())
    }

    pub fn subscribe_circuit(&self) -> Option<broadcast::Receiver<StateTransition>> {
        self.breaker().map(|breaker| breaker.subscribe())
    }

    /// Number of times the client has been replaced
    pub fn client_generation(&self) -> Option<u64> {
        self.runtime
            .get()
            .map(|runtime| runtime.client.current().generation)
    }

    /// The client currently handed to operations
    pub fn current_client(&self) -> Option<Arc<C>> {
        self.runtime
            .get()
            .map(|runtime| runtime.client.current().client)
    }

    pub fn available_slots(&self) -> Option<usize> {
        self.runtime.get().map(|runtime| runtime.limiter.available())
    }

    fn bucket(&self, limit_key: &str) -> Option<&RateLimitBucket> {
        self.runtime.get()?.buckets.get(limit_key)
    }

    fn breaker(&self) -> Option<&CircuitBreaker> {
        self.runtime.get()?.breaker.as_ref()
    }
}
