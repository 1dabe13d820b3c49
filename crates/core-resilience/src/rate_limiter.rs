//! Sliding-window rate limiting with adaptive backoff
//!
//! A [`RateLimitBucket`] keeps the timestamps of recent admissions in
//! chronological order. Admission evicts everything older than the interval
//! (a prefix trim, since the queue is time ordered) and admits immediately
//! while the window holds fewer than `limit` events. When the window is full
//! the caller sleeps for the time until the oldest event leaves the window,
//! stretched by an exponential multiplier driven by reported failures and
//! padded with random jitter so that waiters do not wake in lockstep.
//!
//! # Example
//!
//! ```no_run
//! use tradegate_core_resilience::{BucketConfig, RateLimitBucket, ResilienceError};
//! use tokio_util::sync::CancellationToken;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! // 1200 request weight per minute
//! let bucket = RateLimitBucket::new("weight", BucketConfig::new(1200, Duration::from_secs(60)))?;
//!
//! let cancel = CancellationToken::new();
//! bucket.acquire(&cancel).await?;
//! // ... call the venue ...
//! bucket.record_success();
//! # Ok(())
//! # }
//! ```

use super::error::ResilienceError;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Upper bound of the failure-driven backoff multiplier
pub const MAX_BACKOFF_MULTIPLIER: f64 = 64.0;

/// Configuration for a single rate limit bucket
#[derive(Debug, Clone, PartialEq)]
pub struct BucketConfig {
    /// Maximum admissions within any rolling `interval`
    pub limit: u32,
    /// Length of the sliding window
    pub interval: Duration,
    /// Fraction of `limit` above which a warning is emitted
    pub alert_threshold: f64,
    /// Fraction of `limit` below which normal operation is considered restored
    pub recovery_threshold: f64,
    /// Jitter scale: jitter is drawn from `[0, base_delay / 2]`
    pub base_delay: Duration,
    /// Cap on any single computed wait
    pub max_delay: Duration,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            limit: 1200,
            interval: Duration::from_secs(60),
            alert_threshold: 0.8,
            recovery_threshold: 0.5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BucketConfig {
    /// Bucket allowing `limit` admissions per `interval` with default thresholds
    pub fn new(limit: u32, interval: Duration) -> Self {
        Self {
            limit,
            interval,
            ..Default::default()
        }
    }

    /// Reject configurations that could never admit anything or that carry
    /// nonsensical thresholds.
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.limit == 0 {
            return Err(ResilienceError::InvalidConfig(
                "limit must be greater than zero".to_string(),
            ));
        }
        if self.interval.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "interval must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("alert_threshold", self.alert_threshold),
            ("recovery_threshold", self.recovery_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ResilienceError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.max_delay < self.base_delay {
            return Err(ResilienceError::InvalidConfig(
                "max_delay must not be smaller than base_delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of a bucket, for diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct BucketStats {
    pub name: String,
    pub limit: u32,
    /// Admissions currently inside the window
    pub in_window: usize,
    /// `in_window / limit`
    pub usage: f64,
    pub consecutive_failures: u32,
    pub approaching_limit: bool,
    pub below_recovery: bool,
}

enum Admission {
    Admitted,
    Wait(Duration),
}

/// Named sliding-window rate limiter with failure-driven backoff.
///
/// Thread-safe: the timestamp queue sits behind its own mutex, which is never
/// held across an `.await`.
#[derive(Debug)]
pub struct RateLimitBucket {
    name: String,
    config: BucketConfig,
    timestamps: Mutex<VecDeque<Instant>>,
    consecutive_failures: AtomicU32,
}

impl RateLimitBucket {
    /// Create a bucket, failing fast on invalid configuration
    pub fn new(name: impl Into<String>, config: BucketConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        let capacity = config.limit.min(4096) as usize;
        Ok(Self {
            name: name.into(),
            config,
            timestamps: Mutex::new(VecDeque::with_capacity(capacity)),
            consecutive_failures: AtomicU32::new(0),
        })
    }

    /// Wait until the window has room, then record an admission.
    ///
    /// Returns [`ResilienceError::Cancelled`] if `cancel` fires first; in that
    /// case nothing is recorded.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), ResilienceError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled);
            }

            let delay = match self.poll_admission(Instant::now()) {
                Admission::Admitted => return Ok(()),
                Admission::Wait(delay) => delay,
            };

            tracing::debug!(
                bucket = %self.name,
                delay_ms = delay.as_millis() as u64,
                "Rate limited, waiting"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ResilienceError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Admit without waiting.
    ///
    /// Returns [`ResilienceError::RateLimitExceeded`] and records nothing when
    /// the window is full.
    pub fn try_acquire(&self) -> Result<(), ResilienceError> {
        match self.poll_admission(Instant::now()) {
            Admission::Admitted => Ok(()),
            Admission::Wait(_) => Err(ResilienceError::RateLimitExceeded),
        }
    }

    /// Record a successful call, clearing the backoff multiplier
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Record a failed call; each consecutive failure doubles future waits
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            bucket = %self.name,
            consecutive_failures = failures,
            "Rate limit failure recorded"
        );
    }

    /// Fraction of the limit used by the current window, in `[0, 1]`
    pub fn usage(&self) -> f64 {
        let in_window = self.in_window(Instant::now());
        (in_window as f64 / self.config.limit as f64).min(1.0)
    }

    /// Whether the window holds more than `alert_threshold * limit` events
    pub fn is_approaching_limit(&self) -> bool {
        let in_window = self.in_window(Instant::now());
        in_window as f64 > self.config.limit as f64 * self.config.alert_threshold
    }

    /// Whether the window holds fewer than `recovery_threshold * limit` events
    pub fn is_below_recovery_threshold(&self) -> bool {
        let in_window = self.in_window(Instant::now());
        (in_window as f64) < self.config.limit as f64 * self.config.recovery_threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Snapshot of the bucket for diagnostics
    pub fn stats(&self) -> BucketStats {
        let in_window = self.in_window(Instant::now());
        let limit = self.config.limit as f64;
        BucketStats {
            name: self.name.clone(),
            limit: self.config.limit,
            in_window,
            usage: (in_window as f64 / limit).min(1.0),
            consecutive_failures: self.consecutive_failures(),
            approaching_limit: in_window as f64 > limit * self.config.alert_threshold,
            below_recovery: (in_window as f64) < limit * self.config.recovery_threshold,
        }
    }

    fn in_window(&self, now: Instant) -> usize {
        let mut timestamps = self.timestamps.lock();
        evict_expired(&mut timestamps, now, self.config.interval);
        timestamps.len()
    }

    fn poll_admission(&self, now: Instant) -> Admission {
        let mut timestamps = self.timestamps.lock();
        evict_expired(&mut timestamps, now, self.config.interval);

        if timestamps.len() < self.config.limit as usize {
            timestamps.push_back(now);
            let in_window = timestamps.len();
            drop(timestamps);

            let limit = self.config.limit as f64;
            if in_window as f64 > limit * self.config.alert_threshold {
                tracing::warn!(
                    bucket = %self.name,
                    in_window,
                    limit = self.config.limit,
                    usage = in_window as f64 / limit,
                    "Rate limit approaching"
                );
            }
            return Admission::Admitted;
        }

        let oldest = timestamps.front().copied();
        drop(timestamps);
        Admission::Wait(self.backoff_delay(now, oldest))
    }

    /// `min(max_delay, base_wait * multiplier + jitter)`
    fn backoff_delay(&self, now: Instant, oldest: Option<Instant>) -> Duration {
        let base_wait = oldest
            .map(|oldest| {
                self.config
                    .interval
                    .saturating_sub(now.saturating_duration_since(oldest))
            })
            .unwrap_or_default();

        let multiplier = backoff_multiplier(self.consecutive_failures());
        let jitter_cap = self.config.base_delay.as_secs_f64() * 0.5;
        let jitter = rand::rng().random_range(0.0..=jitter_cap);

        let total = (base_wait.as_secs_f64() * multiplier + jitter)
            .min(self.config.max_delay.as_secs_f64());
        // f64 rounding can push a huge max_delay past Duration::MAX
        Duration::try_from_secs_f64(total.max(0.0))
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }
}

/// Events exactly `interval` old have left the window.
fn evict_expired(timestamps: &mut VecDeque<Instant>, now: Instant, interval: Duration) {
    while let Some(&oldest) = timestamps.front() {
        if now.saturating_duration_since(oldest) >= interval {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

/// `2^failures` capped at [`MAX_BACKOFF_MULTIPLIER`]; `1.0` without failures
pub fn backoff_multiplier(consecutive_failures: u32) -> f64 {
    if consecutive_failures == 0 {
        return 1.0;
    }
    2f64.powi(consecutive_failures.min(10) as i32)
        .min(MAX_BACKOFF_MULTIPLIER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bucket(limit: u32, interval: Duration) -> RateLimitBucket {
        RateLimitBucket::new("test", BucketConfig::new(limit, interval)).unwrap()
    }

    #[test]
    fn test_rejects_zero_limit() {
        let result = RateLimitBucket::new("bad", BucketConfig::new(0, Duration::from_secs(1)));
        assert!(matches!(result, Err(ResilienceError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_thresholds_out_of_range() {
        let config = BucketConfig {
            alert_threshold: 1.5,
            ..BucketConfig::new(10, Duration::from_secs(1))
        };
        assert!(config.validate().is_err());

        let config = BucketConfig {
            recovery_threshold: -0.1,
            ..BucketConfig::new(10, Duration::from_secs(1))
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_multiplier() {
        assert_eq!(backoff_multiplier(0), 1.0);
        assert_eq!(backoff_multiplier(1), 2.0);
        assert_eq!(backoff_multiplier(3), 8.0);
        assert_eq!(backoff_multiplier(6), 64.0);
        assert_eq!(backoff_multiplier(40), 64.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_admits_immediately_then_waits_for_window() {
        let bucket = bucket(5, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let start = Instant::now();
        for _ in 0..5 {
            bucket.acquire(&cancel).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(bucket.usage(), 1.0);

        tokio::time::advance(Duration::from_secs(10)).await;
        let before_sixth = Instant::now();
        bucket.acquire(&cancel).await.unwrap();
        let waited = before_sixth.elapsed();

        // 60s window minus the 10s already elapsed, plus at most 50ms jitter per poll
        assert!(waited >= Duration::from_secs(50), "waited {:?}", waited);
        assert!(waited < Duration::from_secs(51), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_window_exceeds_quota_under_contention() {
        let interval = Duration::from_secs(1);
        let bucket = Arc::new(bucket(5, interval));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..17 {
            let bucket = bucket.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                bucket.acquire(&cancel).await.unwrap();
                Instant::now()
            }));
        }

        let mut admitted = Vec::new();
        for handle in handles {
            admitted.push(handle.await.unwrap());
        }
        admitted.sort();

        for pair in admitted.windows(6) {
            assert!(
                pair[5].duration_since(pair[0]) >= interval,
                "six admissions within one window"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_stretch_the_wait() {
        let config = BucketConfig {
            max_delay: Duration::from_secs(30),
            ..BucketConfig::new(1, Duration::from_secs(1))
        };
        let bucket = RateLimitBucket::new("weight", config).unwrap();
        let cancel = CancellationToken::new();

        bucket.acquire(&cancel).await.unwrap();
        bucket.record_failure();
        bucket.record_failure();
        assert_eq!(bucket.consecutive_failures(), 2);

        let start = Instant::now();
        bucket.acquire(&cancel).await.unwrap();
        // base wait of 1s multiplied by 2^2
        assert!(start.elapsed() >= Duration::from_secs(4));

        bucket.record_success();
        assert_eq!(bucket.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_capped_by_max_delay() {
        let config = BucketConfig {
            max_delay: Duration::from_secs(2),
            ..BucketConfig::new(1, Duration::from_secs(60))
        };
        let bucket = RateLimitBucket::new("capped", config).unwrap();
        for _ in 0..8 {
            bucket.record_failure();
        }

        let delay = bucket.backoff_delay(Instant::now(), Some(Instant::now()));
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_max_delay_does_not_overflow() {
        let config = BucketConfig {
            max_delay: Duration::MAX,
            ..BucketConfig::new(1, Duration::MAX)
        };
        let bucket = RateLimitBucket::new("unbounded", config).unwrap();
        for _ in 0..8 {
            bucket.record_failure();
        }

        let delay = bucket.backoff_delay(Instant::now(), Some(Instant::now()));
        assert!(delay > Duration::from_secs(86400 * 365));
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting() {
        let bucket = Arc::new(bucket(1, Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        bucket.acquire(&cancel).await.unwrap();

        let waiter = {
            let bucket = bucket.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bucket.acquire(&cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert_eq!(result, Err(ResilienceError::Cancelled));
        assert_eq!(bucket.stats().in_window, 1);
    }

    #[test]
    fn test_try_acquire_does_not_record_when_full() {
        let bucket = bucket(2, Duration::from_secs(60));
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_ok());
        assert_eq!(
            bucket.try_acquire(),
            Err(ResilienceError::RateLimitExceeded)
        );
        assert_eq!(bucket.stats().in_window, 2);
    }

    #[test]
    fn test_thresholds() {
        let config = BucketConfig {
            alert_threshold: 0.5,
            recovery_threshold: 0.3,
            ..BucketConfig::new(10, Duration::from_secs(60))
        };
        let bucket = RateLimitBucket::new("orders", config).unwrap();
        assert!(bucket.is_below_recovery_threshold());
        assert!(!bucket.is_approaching_limit());

        for _ in 0..6 {
            bucket.try_acquire().unwrap();
        }
        assert!(bucket.is_approaching_limit());
        assert!(!bucket.is_below_recovery_threshold());

        let stats = bucket.stats();
        assert_eq!(stats.in_window, 6);
        assert!((stats.usage - 0.6).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let bucket = bucket(3, Duration::from_secs(10));
        for _ in 0..3 {
            bucket.try_acquire().unwrap();
        }
        assert_eq!(bucket.usage(), 1.0);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(bucket.usage(), 0.0);
        assert!(bucket.try_acquire().is_ok());
    }
}
