//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a service
//! is experiencing issues. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Service is unhealthy, requests fail immediately
//! - HalfOpen: Testing if service has recovered with a single trial
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open ◀──────────┐
//!     ▲                                │              │ trial failed
//!     │ trial succeeded                │ timeout      │
//!     │                                ▼ elapsed      │
//!     └──────────────────────────── HalfOpen ─────────┘
//! ```
//!
//! Every transition is published on a broadcast channel (see
//! [`CircuitBreaker::subscribe`]) after the state lock has been released, so
//! slow subscribers never stall the breaker.

use super::error::ResilienceError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Stand-in deadline for recovery timeouts too large to add to an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately until the next attempt time
    Open,
    /// Circuit is half-open, a single trial is in flight
    HalfOpen,
}

impl CircuitState {
    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(name)
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: u32,
    /// Duration to wait before transitioning from open to half-open
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::InvalidConfig(
                "failure_threshold must be greater than zero".to_string(),
            ));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "recovery_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A state change, as delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Read-only snapshot for observability
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub last_failure: Option<Instant>,
    pub next_attempt: Option<Instant>,
    pub recovery_timeout: Duration,
}

/// The single call allowed through while half-open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trial {
    /// Handed out by `can_execute`; considered lost after one recovery timeout
    Leased { id: u64, since: Instant },
    /// Held by a [`CallPermit`] until it reports or is dropped
    Guarded { id: u64 },
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    next_attempt: Option<Instant>,
    trial: Option<Trial>,
    next_trial_id: u64,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            next_attempt: None,
            trial: None,
            next_trial_id: 0,
        }
    }

    fn attempt_due(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |next| now >= next)
    }

    fn trial_in_flight(&self, now: Instant, lease: Duration) -> bool {
        match self.trial {
            None => false,
            Some(Trial::Leased { since, .. }) => now.saturating_duration_since(since) < lease,
            Some(Trial::Guarded { .. }) => true,
        }
    }

    fn claim_trial(&mut self, now: Instant, guarded: bool) -> u64 {
        let id = self.next_trial_id;
        self.next_trial_id = self.next_trial_id.wrapping_add(1);
        self.trial = Some(if guarded {
            Trial::Guarded { id }
        } else {
            Trial::Leased { id, since: now }
        });
        id
    }
}

enum Admission {
    Rejected,
    Passed,
    Trial(u64),
}

/// `now + timeout`, clamped for timeouts beyond what `Instant` can represent
fn deadline(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[derive(Debug)]
struct Shared {
    state: RwLock<CircuitBreakerState>,
    /// Lock-free mirror of `state.state`, eventually consistent
    state_hint: AtomicU8,
    transitions: broadcast::Sender<StateTransition>,
}

/// Circuit breaker for protecting against cascading failures
///
/// Cheap to clone; clones share state.
///
/// # Example
/// ```no_run
/// use tradegate_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     let breaker = CircuitBreaker::new("orders", CircuitBreakerConfig::default())?;
///
///     let result = breaker.execute(|| async {
///         // Your operation here
///         Ok::<_, ResilienceError>(42)
///     }).await?;
///
///     println!("Result: {}", result);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker guarding the operation class `name`
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Ok(Self {
            name: Arc::from(name.into()),
            config: Arc::new(config),
            shared: Arc::new(Shared {
                state: RwLock::new(CircuitBreakerState::new()),
                state_hint: AtomicU8::new(CircuitState::Closed.as_u8()),
                transitions,
            }),
        })
    }

    /// Current state without taking the lock; may briefly lag a concurrent transition
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.shared.state_hint.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> u32 {
        self.shared.state.read().failure_count
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Receive every future state transition
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.shared.transitions.subscribe()
    }

    /// Whether a call may proceed right now.
    ///
    /// When the circuit is open and the recovery timeout has elapsed, this
    /// moves the breaker to half-open and grants the caller the single trial.
    /// A trial granted this way that never reports back is reissued after one
    /// recovery timeout; use [`CircuitBreaker::try_acquire`] to hold it for
    /// exactly as long as the call is alive.
    pub fn can_execute(&self) -> bool {
        !matches!(self.admit(false), Admission::Rejected)
    }

    /// Ask to run one call, returning `None` when the breaker rejects it.
    ///
    /// The permit reports the call's outcome. Dropping it without reporting
    /// gives a half-open trial back at once, so cancelled or abandoned calls
    /// neither count as failures nor keep the breaker waiting.
    pub fn try_acquire(&self) -> Option<CallPermit> {
        let trial = match self.admit(true) {
            Admission::Rejected => return None,
            Admission::Passed => None,
            Admission::Trial(id) => Some(id),
        };
        Some(CallPermit {
            breaker: self.clone(),
            trial,
            reported: false,
        })
    }

    fn admit(&self, guarded: bool) -> Admission {
        let now = Instant::now();
        let lease = self.config.recovery_timeout;

        {
            let state = self.shared.state.read();
            match state.state {
                CircuitState::Closed => return Admission::Passed,
                CircuitState::Open if !state.attempt_due(now) => return Admission::Rejected,
                CircuitState::HalfOpen if state.trial_in_flight(now, lease) => {
                    return Admission::Rejected
                }
                _ => {}
            }
        }

        let (id, transition) = {
            let mut state = self.shared.state.write();
            match state.state {
                CircuitState::Closed => return Admission::Passed,
                CircuitState::Open => {
                    if !state.attempt_due(now) {
                        return Admission::Rejected;
                    }
                    let id = state.claim_trial(now, guarded);
                    (id, self.transition(&mut state, CircuitState::HalfOpen))
                }
                CircuitState::HalfOpen => {
                    if state.trial_in_flight(now, lease) {
                        return Admission::Rejected;
                    }
                    (state.claim_trial(now, guarded), None)
                }
            }
        };

        self.publish(transition);
        Admission::Trial(id)
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// Fails with [`ResilienceError::CircuitOpen`] without invoking `op` when
    /// the breaker does not allow the call.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let Some(permit) = self.try_acquire() else {
            return Err(ResilienceError::CircuitOpen {
                retry_in: self.time_until_retry(),
            });
        };

        match op().await {
            Ok(result) => {
                permit.record_success();
                Ok(result)
            }
            Err(e) => {
                if e.should_trip_breaker() {
                    permit.record_failure(&e);
                }
                Err(e)
            }
        }
    }

    /// Report a successful call. Closes a half-open circuit.
    pub fn record_success(&self) {
        let transition = {
            let mut state = self.shared.state.write();
            match state.state {
                CircuitState::HalfOpen => {
                    state.failure_count = 0;
                    state.trial = None;
                    state.next_attempt = None;
                    self.transition(&mut state, CircuitState::Closed)
                }
                CircuitState::Closed | CircuitState::Open => None,
            }
        };
        self.publish(transition);
    }

    /// Report a failed call.
    pub fn record_failure(&self, cause: &dyn fmt::Display) {
        let now = Instant::now();
        let transition = {
            let mut state = self.shared.state.write();
            state.failure_count = state.failure_count.saturating_add(1);
            state.last_failure = Some(now);

            tracing::warn!(
                breaker = %self.name,
                failure_count = state.failure_count,
                error = %cause,
                "Circuit breaker failure"
            );

            let trip = match state.state {
                CircuitState::Closed => state.failure_count >= self.config.failure_threshold,
                CircuitState::HalfOpen | CircuitState::Open => true,
            };

            if trip {
                state.next_attempt = Some(deadline(now, self.config.recovery_timeout));
                state.trial = None;
                self.transition(&mut state, CircuitState::Open)
            } else {
                None
            }
        };
        self.publish(transition);
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let transition = {
            let mut state = self.shared.state.write();
            state.failure_count = 0;
            state.last_failure = None;
            state.next_attempt = None;
            state.trial = None;
            self.transition(&mut state, CircuitState::Closed)
        };
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset");
        self.publish(transition);
    }

    /// Time left before an open circuit admits its trial; zero otherwise
    pub fn time_until_retry(&self) -> Duration {
        let state = self.shared.state.read();
        match (state.state, state.next_attempt) {
            (CircuitState::Open, Some(next)) => next.saturating_duration_since(Instant::now()),
            _ => Duration::ZERO,
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.shared.state.read();
        CircuitBreakerStats {
            state: state.state,
            failure_count: state.failure_count,
            failure_threshold: self.config.failure_threshold,
            last_failure: state.last_failure,
            next_attempt: state.next_attempt,
            recovery_timeout: self.config.recovery_timeout,
        }
    }

    /// Give back a half-open trial whose outcome says nothing about the
    /// guarded service, e.g. because the caller cancelled.
    pub fn release_trial(&self) {
        let mut state = self.shared.state.write();
        if state.state == CircuitState::HalfOpen {
            state.trial = None;
        }
    }

    /// Release trial `id` only if it is still the current one
    fn release_guarded(&self, id: u64) {
        let mut state = self.shared.state.write();
        if state.state == CircuitState::HalfOpen && state.trial == Some(Trial::Guarded { id }) {
            state.trial = None;
        }
    }

    /// Must be called with the write lock held
    fn transition(
        &self,
        state: &mut CircuitBreakerState,
        to: CircuitState,
    ) -> Option<StateTransition> {
        let from = state.state;
        if from == to {
            return None;
        }
        state.state = to;
        self.shared.state_hint.store(to.as_u8(), Ordering::Release);

        tracing::info!(breaker = %self.name, %from, %to, "Circuit breaker state changed");
        Some(StateTransition {
            from,
            to,
            at: Utc::now(),
        })
    }

    fn publish(&self, transition: Option<StateTransition>) {
        if let Some(transition) = transition {
            // No subscribers is not an error
            let _ = self.shared.transitions.send(transition);
        }
    }
}

/// Permission to run one call, from [`CircuitBreaker::try_acquire`]
#[derive(Debug)]
#[must_use = "dropping the permit without reporting gives the trial back"]
pub struct CallPermit {
    breaker: CircuitBreaker,
    trial: Option<u64>,
    reported: bool,
}

impl CallPermit {
    /// Whether this call is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    /// Report success. Only the trial can close a half-open circuit.
    pub fn record_success(mut self) {
        self.reported = true;
        if self.trial.is_some() {
            self.breaker.record_success();
        }
    }

    pub fn record_failure(mut self, cause: &dyn fmt::Display) {
        self.reported = true;
        self.breaker.record_failure(cause);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if let (false, Some(id)) = (self.reported, self.trial) {
            self.breaker.release_guarded(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn breaker(threshold: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: timeout,
            },
        )
        .unwrap()
    }

    fn fail(breaker: &CircuitBreaker, times: usize) {
        for _ in 0..times {
            breaker.record_failure(&"venue unavailable");
        }
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let result = CircuitBreaker::new(
            "bad",
            CircuitBreakerConfig {
                failure_threshold: 0,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(ResilienceError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_closed_to_open() {
        let breaker = breaker(3, Duration::from_secs(30));

        fail(&breaker, 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());

        fail(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());

        let stats = breaker.stats();
        assert!(stats.next_attempt.unwrap() > stats.last_failure.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_to_half_open_after_recovery_timeout() {
        let breaker = breaker(3, Duration::from_secs(30));
        fail(&breaker, 3);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Only the single trial is allowed through
        assert!(!breaker.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let breaker = breaker(2, Duration::from_secs(10));
        fail(&breaker, 2);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.can_execute());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_deadline() {
        let breaker = breaker(2, Duration::from_secs(10));
        fail(&breaker, 2);
        let first_deadline = breaker.stats().next_attempt.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.can_execute());

        fail(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
        let second_deadline = breaker.stats().next_attempt.unwrap();
        assert!(second_deadline > first_deadline);
        assert_eq!(breaker.time_until_retry(), Duration::from_secs(10));
        assert!(!breaker.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_trial_is_reissued_after_timeout() {
        let breaker = breaker(1, Duration::from_secs(5));
        fail(&breaker, 1);
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(breaker.can_execute());
        assert!(!breaker.can_execute());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_trial_is_available_immediately() {
        let breaker = breaker(1, Duration::from_secs(5));
        fail(&breaker, 1);
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(breaker.can_execute());
        breaker.release_trial();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.can_execute());
        assert!(!breaker.can_execute());

        // No effect outside half-open
        breaker.record_success();
        breaker.release_trial();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_permit_trial_does_not_expire() {
        let breaker = breaker(1, Duration::from_secs(1));
        fail(&breaker, 1);
        tokio::time::advance(Duration::from_secs(1)).await;

        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());

        // Far beyond the lease a bare `can_execute` trial would get
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.try_acquire().is_none());
        assert!(!breaker.can_execute());

        trial.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_permit_gives_trial_back() {
        let breaker = breaker(1, Duration::from_secs(1));
        fail(&breaker, 1);
        tokio::time::advance(Duration::from_secs(1)).await;

        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.failure_count(), 1);

        let trial = breaker.try_acquire().unwrap();
        trial.record_failure(&"venue unavailable");
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_permit_leaves_newer_trial_alone() {
        let breaker = breaker(1, Duration::from_secs(1));
        let stale = breaker.try_acquire().unwrap();
        assert!(!stale.is_trial());

        fail(&breaker, 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.try_acquire().unwrap();

        // Success of a call admitted while closed does not close the circuit
        stale.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_none());

        drop(trial);
        assert!(breaker.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_recovery_timeout_does_not_overflow() {
        let breaker = breaker(1, Duration::MAX);
        fail(&breaker, 1);

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
        assert!(breaker.time_until_retry() > Duration::from_secs(86400 * 365));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_while_closed_keeps_failure_count() {
        let breaker = breaker(3, Duration::from_secs(5));
        fail(&breaker, 2);
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 2);

        fail(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_fails_fast_when_open() {
        let breaker = breaker(1, Duration::from_secs(30));
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let result: Result<(), ResilienceError> = breaker
            .execute(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ResilienceError::RateLimitExceeded)
            })
            .await;
        assert!(matches!(result, Err(ResilienceError::RateLimitExceeded)));

        let result = breaker
            .execute(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ResilienceError>(())
            })
            .await;
        match result {
            Err(ResilienceError::CircuitOpen { retry_in }) => {
                assert_eq!(retry_in, Duration::from_secs(30))
            }
            other => panic!("Expected CircuitOpen, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_are_published() {
        let breaker = breaker(1, Duration::from_secs(1));
        let mut events = breaker.subscribe();

        fail(&breaker, 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.can_execute());
        breaker.record_success();

        let observed: Vec<_> = (0..3)
            .map(|_| {
                let event = events.try_recv().unwrap();
                (event.from, event.to)
            })
            .collect();
        assert_eq!(
            observed,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let breaker = breaker(1, Duration::from_secs(60));
        fail(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.stats().last_failure, None);
        assert!(breaker.can_execute());
    }
}
