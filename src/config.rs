/*!
 * Gateway configuration: TOML loading, defaults and validation
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

use tradegate_core_resilience::{BucketConfig, CircuitBreakerConfig, CostLimits};

use crate::error::{GatewayError, Result};

/// Top-level gateway configuration
///
/// ```toml
/// max_concurrent_requests = 5
/// retry_count = 3
/// log_level = "info"
///
/// [limits.orders]
/// limit = 10
/// interval = "00:00:01"
///
/// [limits.weight]
/// limit = 1200
/// interval = "1m"
/// alert_threshold = 0.8
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Operations allowed to run against the venue at once
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Retries after the first attempt of an operation
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default)]
    pub log_level: LogLevel,

    /// Rate limit buckets by limit key
    #[serde(default)]
    pub limits: BTreeMap<String, BucketSettings>,

    /// Gateway-level circuit breaker (disabled when absent)
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerSettings>,

    #[serde(default)]
    pub cost_analyzer: CostAnalyzerSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent_requests(),
            retry_count: default_retry_count(),
            log_level: LogLevel::default(),
            limits: BTreeMap::new(),
            circuit_breaker: None,
            cost_analyzer: CostAnalyzerSettings::default(),
        }
    }
}

/// Settings of one named rate limit bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSettings {
    /// Maximum admissions per interval
    pub limit: i64,

    /// Window length: `hh:mm:ss[.fff]` or `250ms`, `10s`, `1m`, `2h`
    pub interval: String,

    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,

    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: f64,

    #[serde(default = "default_base_delay")]
    pub base_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,
}

impl BucketSettings {
    pub fn new(limit: i64, interval: impl Into<String>) -> Self {
        Self {
            limit,
            interval: interval.into(),
            alert_threshold: default_alert_threshold(),
            recovery_threshold: default_recovery_threshold(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }

    /// Resolve into a validated bucket configuration
    pub fn to_bucket_config(&self, key: &str) -> Result<BucketConfig> {
        let invalid = |msg: String| GatewayError::InvalidConfig(format!("limits.{key}: {msg}"));

        if self.limit <= 0 {
            return Err(invalid(format!(
                "limit must be greater than zero, got {}",
                self.limit
            )));
        }
        let limit = u32::try_from(self.limit)
            .map_err(|_| invalid(format!("limit {} is too large", self.limit)))?;

        let interval = parse_duration(&self.interval).map_err(|e| invalid(e.to_string()))?;
        let base_delay = parse_duration(&self.base_delay).map_err(|e| invalid(e.to_string()))?;
        let max_delay = parse_duration(&self.max_delay).map_err(|e| invalid(e.to_string()))?;

        let config = BucketConfig {
            limit,
            interval,
            alert_threshold: self.alert_threshold,
            recovery_threshold: self.recovery_threshold,
            base_delay,
            max_delay,
        };
        config.validate().map_err(|e| invalid(e.to_string()))?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: String,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_breaker_config(&self) -> Result<CircuitBreakerConfig> {
        let recovery_timeout = parse_duration(&self.recovery_timeout).map_err(|e| {
            GatewayError::InvalidConfig(format!("circuit_breaker.recovery_timeout: {e}"))
        })?;
        let config = CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout,
        };
        config
            .validate()
            .map_err(|e| GatewayError::InvalidConfig(format!("circuit_breaker: {e}")))?;
        Ok(config)
    }
}

/// Venue limits used by the pre-flight cost analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostAnalyzerSettings {
    #[serde(default = "default_weight_limit_per_min")]
    pub weight_limit_per_min: u64,

    #[serde(default = "default_order_limit_per_min")]
    pub order_limit_per_min: u64,

    #[serde(default = "default_order_limit_per_10s")]
    pub order_limit_per_10s: u64,
}

impl Default for CostAnalyzerSettings {
    fn default() -> Self {
        Self {
            weight_limit_per_min: default_weight_limit_per_min(),
            order_limit_per_min: default_order_limit_per_min(),
            order_limit_per_10s: default_order_limit_per_10s(),
        }
    }
}

impl From<CostAnalyzerSettings> for CostLimits {
    fn from(settings: CostAnalyzerSettings) -> Self {
        CostLimits {
            weight_limit_per_min: settings.weight_limit_per_min,
            order_limit_per_min: settings.order_limit_per_min,
            order_limit_per_10s: settings.order_limit_per_10s,
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_max_concurrent_requests() -> usize {
    5
}

fn default_retry_count() -> u32 {
    3
}

fn default_alert_threshold() -> f64 {
    0.8
}

fn default_recovery_threshold() -> f64 {
    0.5
}

fn default_base_delay() -> String {
    "100ms".to_string()
}

fn default_max_delay() -> String {
    "30s".to_string()
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> String {
    "30s".to_string()
}

fn default_weight_limit_per_min() -> u64 {
    2400
}

fn default_order_limit_per_min() -> u64 {
    1200
}

fn default_order_limit_per_10s() -> u64 {
    300
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| GatewayError::InvalidConfig(e.to_string()))
    }

    /// Check every setting; the first problem found is returned
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(GatewayError::InvalidConfig(
                "max_concurrent_requests must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_requests > Semaphore::MAX_PERMITS {
            return Err(GatewayError::InvalidConfig(format!(
                "max_concurrent_requests must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        for (key, settings) in &self.limits {
            settings.to_bucket_config(key)?;
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.to_breaker_config()?;
        }
        Ok(())
    }

    /// Resolved bucket configurations, keyed by limit key
    pub fn bucket_configs(&self) -> Result<BTreeMap<String, BucketConfig>> {
        self.limits
            .iter()
            .map(|(key, settings)| Ok((key.clone(), settings.to_bucket_config(key)?)))
            .collect()
    }
}

/// Error from [`parse_duration`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration '{input}': {reason}")]
pub struct DurationParseError {
    input: String,
    reason: &'static str,
}

/// Parse `hh:mm:ss[.fff]` or a number with a `ms`, `s`, `m` or `h` suffix.
///
/// Zero-length durations are rejected.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, DurationParseError> {
    let fail = |reason| DurationParseError {
        input: input.to_string(),
        reason,
    };
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(fail("empty"));
    }

    let duration = if trimmed.contains(':') {
        parse_clock(trimmed).ok_or_else(|| fail("expected hh:mm:ss[.fff]"))?
    } else {
        parse_suffixed(trimmed).ok_or_else(|| fail("expected a number followed by ms, s, m or h"))?
    };

    if duration.is_zero() {
        return Err(fail("must be greater than zero"));
    }
    Ok(duration)
}

fn parse_clock(input: &str) -> Option<Duration> {
    let parts: Vec<&str> = input.split(':').collect();
    let [hours, minutes, seconds] = parts.as_slice() else {
        return None;
    };

    let hours: u64 = hours.parse().ok()?;
    let minutes: u64 = minutes.parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    let seconds: f64 = seconds.parse().ok()?;
    if !(0.0..60.0).contains(&seconds) {
        return None;
    }

    let whole = hours.checked_mul(3600)?.checked_add(minutes * 60)?;
    Duration::from_secs(whole).checked_add(Duration::try_from_secs_f64(seconds).ok()?)
}

fn parse_suffixed(input: &str) -> Option<Duration> {
    let split = input
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }

    let secs = match unit.trim() {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.max_concurrent_requests, 5);
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.limits.is_empty());
        assert!(config.circuit_breaker.is_none());
        assert_eq!(config.cost_analyzer.weight_limit_per_min, 2400);
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("00:01:00").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("01:00:00").unwrap(), Duration::from_secs(3600));
        assert_eq!(
            parse_duration("00:00:00.250").unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        for input in ["", "abc", "10", "10d", "00:61:00", "1:2", "0s", "00:00:00", "-5s"] {
            assert!(parse_duration(input).is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn test_parse_duration_rejects_out_of_range() {
        for input in [
            "99999999999999999999999h",
            "99999999999999999999999999999ms",
            "18446744073709551615:00:00",
            "5124095576030432:00:00",
        ] {
            assert!(parse_duration(input).is_err(), "accepted {input:?}");
        }
        // Large but representable
        assert_eq!(
            parse_duration("1000000:00:00").unwrap(),
            Duration::from_secs(3_600_000_000)
        );
    }

    #[test]
    fn test_out_of_range_interval_is_invalid_config() {
        let err = BucketSettings::new(1, "99999999999999999999999h")
            .to_bucket_config("orders")
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
        assert!(err.to_string().contains("limits.orders"));

        let breaker = CircuitBreakerSettings {
            failure_threshold: 1,
            recovery_timeout: "99999999999999999999999h".to_string(),
        };
        assert!(matches!(
            breaker.to_breaker_config(),
            Err(GatewayError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            max_concurrent_requests = 8
            retry_count = 2
            log_level = "debug"

            [limits.orders]
            limit = 10
            interval = "00:00:01"

            [limits.weight]
            limit = 1200
            interval = "1m"
            alert_threshold = 0.9
            recovery_threshold = 0.4

            [circuit_breaker]
            failure_threshold = 3
        "#;

        let config = GatewayConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.max_concurrent_requests, 8);
        assert_eq!(config.retry_count, 2);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.limits.len(), 2);

        let buckets = config.bucket_configs().unwrap();
        assert_eq!(buckets["orders"].limit, 10);
        assert_eq!(buckets["orders"].interval, Duration::from_secs(1));
        assert_eq!(buckets["weight"].alert_threshold, 0.9);
        assert_eq!(buckets["weight"].base_delay, Duration::from_millis(100));

        let breaker = config.circuit_breaker.as_ref().unwrap();
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(
            breaker.to_breaker_config().unwrap().recovery_timeout,
            Duration::from_secs(30)
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_buckets() {
        let mut config = GatewayConfig::default();
        config
            .limits
            .insert("orders".to_string(), BucketSettings::new(0, "1s"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("limits.orders"));

        config
            .limits
            .insert("orders".to_string(), BucketSettings::new(-3, "1s"));
        assert!(config.validate().is_err());

        config
            .limits
            .insert("orders".to_string(), BucketSettings::new(5, "soon"));
        assert!(config.validate().is_err());

        let mut settings = BucketSettings::new(5, "1s");
        settings.alert_threshold = 1.5;
        config.limits.insert("orders".to_string(), settings);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = GatewayConfig {
            max_concurrent_requests: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(GatewayError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_concurrency_beyond_semaphore_limit() {
        let config = GatewayConfig {
            max_concurrent_requests: usize::MAX,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_requests"));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "retry_count = 1\n[limits.weight]\nlimit = 50\ninterval = \"10s\""
        )
        .unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.retry_count, 1);
        assert_eq!(config.limits["weight"].limit, 50);
    }

    #[test]
    fn test_from_missing_file() {
        let result = GatewayConfig::from_file("/nonexistent/tradegate.toml");
        assert!(matches!(result, Err(GatewayError::InvalidConfig(_))));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Warn.to_tracing_level(), tracing::Level::WARN);
        assert_eq!(LogLevel::Info.to_tracing_level(), tracing::Level::INFO);
        assert_eq!(LogLevel::Debug.to_tracing_level(), tracing::Level::DEBUG);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }
}
