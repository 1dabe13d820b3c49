//! Pre-flight cost estimation for batches of venue calls
//!
//! Everything here is pure: the analyzer only looks at statically declared
//! call weights and never at a bucket's live usage, so an estimate can
//! disagree with what the venue actually counts. Use it to reject or reshape
//! a batch before it is submitted, not as a guarantee.
//!
//! # Example
//!
//! ```
//! use tradegate_core_resilience::cost_analyzer::{CallCost, CostAnalyzer};
//!
//! let analyzer = CostAnalyzer::default();
//! let batch = vec![
//!     CallCost::new("exchangeInfo", 20),
//!     CallCost::order("newOrder", 1),
//! ];
//!
//! let (total, exceeds) = analyzer.calculate_weight_usage(&batch);
//! assert_eq!(total, 21);
//! assert!(!exceeds);
//! ```

use std::fmt;
use std::time::Duration;

/// Length of the rolling window used for burst detection
pub const WEIGHT_WINDOW: Duration = Duration::from_secs(60);

/// Declared cost of one planned call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallCost {
    pub operation: String,
    pub weight: u32,
    /// Whether the call places or cancels orders
    pub is_order: bool,
}

impl CallCost {
    pub fn new(operation: impl Into<String>, weight: u32) -> Self {
        Self {
            operation: operation.into(),
            weight,
            is_order: false,
        }
    }

    pub fn order(operation: impl Into<String>, weight: u32) -> Self {
        Self {
            operation: operation.into(),
            weight,
            is_order: true,
        }
    }
}

/// A planned call together with its offset from the start of the batch
#[derive(Debug, Clone, PartialEq)]
pub struct TimedCall {
    pub offset: Duration,
    pub call: CallCost,
}

/// Venue-side limits the analyzer checks against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostLimits {
    pub weight_limit_per_min: u64,
    pub order_limit_per_min: u64,
    pub order_limit_per_10s: u64,
}

impl Default for CostLimits {
    fn default() -> Self {
        Self {
            weight_limit_per_min: 2400,
            order_limit_per_min: 1200,
            order_limit_per_10s: 300,
        }
    }
}

/// Outcome of [`CostAnalyzer::check_order_rate`]
#[derive(Debug, Clone, PartialEq)]
pub enum OrderRateVerdict {
    WithinLimits,
    PerMinuteExceeded { limit: u64, rate_per_min: f64 },
    BurstExceeded { limit: u64, rate_per_10s: f64 },
}

impl OrderRateVerdict {
    pub fn is_within_limits(&self) -> bool {
        matches!(self, OrderRateVerdict::WithinLimits)
    }
}

impl fmt::Display for OrderRateVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderRateVerdict::WithinLimits => write!(f, "Order rate within limits."),
            OrderRateVerdict::PerMinuteExceeded {
                limit,
                rate_per_min,
            } => write!(
                f,
                "Order rate exceeds {limit}/min limit (rate ~{rate_per_min:.1} orders/min)"
            ),
            OrderRateVerdict::BurstExceeded {
                limit,
                rate_per_10s,
            } => write!(
                f,
                "Order burst exceeds {limit}/10s limit (rate ~{rate_per_10s:.1} orders/10s)"
            ),
        }
    }
}

/// Input for [`CostAnalyzer::simulate`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SimulationRequest {
    pub timed_calls: Vec<TimedCall>,
    pub order_count: u64,
    pub batch_duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationReport {
    pub total_weight: u64,
    pub weight_limit_exceeded: bool,
    pub burst_violation: bool,
    pub order_rate: OrderRateVerdict,
    pub suggested_delay: Duration,
}

/// Sum declared weights and compare against `quota`.
///
/// Returns `(total_weight, total_weight > quota)`.
pub fn estimate_batch(calls: &[CallCost], quota: u64) -> (u64, bool) {
    let total: u64 = calls.iter().map(|call| u64::from(call.weight)).sum();
    (total, total > quota)
}

/// Stateless estimator for batches of planned calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CostAnalyzer {
    limits: CostLimits,
}

impl CostAnalyzer {
    pub fn new(limits: CostLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> CostLimits {
        self.limits
    }

    /// Total weight of the batch and whether it exceeds the per-minute weight limit
    pub fn calculate_weight_usage(&self, calls: &[CallCost]) -> (u64, bool) {
        estimate_batch(calls, self.limits.weight_limit_per_min)
    }

    /// Whether any rolling 60 second window of the batch exceeds the weight limit.
    ///
    /// `timed_calls` must be ordered by offset.
    pub fn detect_weight_burst_violation(&self, timed_calls: &[TimedCall]) -> bool {
        for (i, start) in timed_calls.iter().enumerate() {
            let end = start.offset.saturating_add(WEIGHT_WINDOW);
            let mut sum = 0u64;
            for timed in timed_calls[i..].iter().take_while(|t| t.offset < end) {
                sum = sum.saturating_add(u64::from(timed.call.weight));
                if sum > self.limits.weight_limit_per_min {
                    return true;
                }
            }
        }
        false
    }

    /// Check sending `order_count` orders evenly over `batch_duration`.
    pub fn check_order_rate(&self, order_count: u64, batch_duration: Duration) -> OrderRateVerdict {
        let secs = batch_duration.as_secs_f64();
        if order_count == 0 {
            return OrderRateVerdict::WithinLimits;
        }
        if secs <= 0.0 {
            // Everything at once: the whole batch lands in a single 10s window
            return if order_count > self.limits.order_limit_per_10s {
                OrderRateVerdict::BurstExceeded {
                    limit: self.limits.order_limit_per_10s,
                    rate_per_10s: order_count as f64,
                }
            } else {
                OrderRateVerdict::WithinLimits
            };
        }

        let per_min = order_count as f64 / (secs / 60.0);
        if per_min > self.limits.order_limit_per_min as f64 {
            return OrderRateVerdict::PerMinuteExceeded {
                limit: self.limits.order_limit_per_min,
                rate_per_min: per_min,
            };
        }

        let per_10s = order_count as f64 / (secs / 10.0);
        if per_10s > self.limits.order_limit_per_10s as f64 {
            return OrderRateVerdict::BurstExceeded {
                limit: self.limits.order_limit_per_10s,
                rate_per_10s: per_10s,
            };
        }

        OrderRateVerdict::WithinLimits
    }

    /// Smallest even spacing between orders that keeps within the 10 second burst cap
    pub fn suggest_order_stagger_delay(&self, orders_to_place: u64) -> Duration {
        let burst = self.limits.order_limit_per_10s;
        if orders_to_place <= burst || burst == 0 {
            return Duration::ZERO;
        }

        let windows = u128::from(orders_to_place.div_ceil(burst));
        let required_nanos = windows * 10 * 1_000_000_000;
        let spacing = required_nanos / u128::from(orders_to_place);
        Duration::from_nanos(u64::try_from(spacing).unwrap_or(u64::MAX))
    }

    /// Run every check over one planned batch
    pub fn simulate(&self, request: &SimulationRequest) -> SimulationReport {
        let calls: Vec<CallCost> = request
            .timed_calls
            .iter()
            .map(|timed| timed.call.clone())
            .collect();
        let (total_weight, weight_limit_exceeded) = self.calculate_weight_usage(&calls);

        SimulationReport {
            total_weight,
            weight_limit_exceeded,
            burst_violation: self.detect_weight_burst_violation(&request.timed_calls),
            order_rate: self.check_order_rate(request.order_count, request.batch_duration),
            suggested_delay: self.suggest_order_stagger_delay(request.order_count),
        }
    }
}
