//! Tradegate CLI - validate gateway configuration, analyse planned batches and
//! drive the gateway against a simulated venue.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tradegate::{
    config::{parse_duration, GatewayConfig, LogLevel},
    logging,
    resilience::{CallCost, CostAnalyzer, SimulationRequest, TimedCall},
    simulation::{SimulatedVenue, SimulatedVenueConfig, VenueClient},
    Gateway,
};

/// Tradegate - resilience gateway for rate-limited trading venue APIs
#[derive(Parser, Debug)]
#[command(name = "tradegate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Gateway configuration file (TOML)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevelArg>,

    /// Write JSON logs to this file instead of stdout
    #[arg(long, global = true, value_name = "FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and print the resolved buckets
    Check,

    /// Estimate the cost of a planned batch of calls
    Analyze {
        /// JSON array of {"operation", "weight", "is_order"?, "offset_ms"?}
        #[arg(short, long, value_name = "FILE")]
        batch: PathBuf,

        /// Spread orders over this duration when checking order rates
        #[arg(long, default_value = "1m")]
        duration: String,
    },

    /// Drive the gateway against an in-process simulated venue
    Simulate {
        /// Number of calls to issue concurrently
        #[arg(short = 'n', long, default_value = "50")]
        calls: usize,

        /// Limit key the calls are charged to
        #[arg(short, long, default_value = "default")]
        key: String,

        /// Probability that a venue call fails
        #[arg(long, default_value = "0.0")]
        failure_rate: f64,

        /// Latency of every venue call
        #[arg(long, default_value = "20ms")]
        latency: String,

        /// Place orders instead of reading tickers
        #[arg(long)]
        orders: bool,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

/// One planned call in an `analyze` batch file
#[derive(Debug, Deserialize)]
struct BatchEntry {
    operation: String,
    weight: u32,
    #[serde(default)]
    is_order: bool,
    #[serde(default)]
    offset_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => GatewayConfig::default(),
    };

    let level = cli.log_level.map(LogLevel::from).unwrap_or(config.log_level);
    logging::init_logging(level, cli.log_file.as_deref()).context("Failed to initialise logging")?;

    match cli.command {
        Command::Check => check(&config),
        Command::Analyze { batch, duration } => analyze(&config, &batch, &duration),
        Command::Simulate {
            calls,
            key,
            failure_rate,
            latency,
            orders,
        } => simulate(config, calls, &key, failure_rate, &latency, orders).await,
    }
}

fn check(config: &GatewayConfig) -> Result<()> {
    config.validate().context("Configuration is invalid")?;

    println!("Configuration OK");
    println!("  max concurrent requests: {}", config.max_concurrent_requests);
    println!("  retry count:             {}", config.retry_count);
    println!("  log level:               {:?}", config.log_level);
    match &config.circuit_breaker {
        Some(breaker) => println!(
            "  circuit breaker:         {} failures, recover after {}",
            breaker.failure_threshold, breaker.recovery_timeout
        ),
        None => println!("  circuit breaker:         disabled"),
    }

    let buckets = config.bucket_configs()?;
    if buckets.is_empty() {
        println!("  no rate limit buckets configured");
    }
    for (key, bucket) in &buckets {
        println!(
            "  bucket {key}: {} per {:?} (alert {:.0}%, recovery {:.0}%, backoff {:?}..{:?})",
            bucket.limit,
            bucket.interval,
            bucket.alert_threshold * 100.0,
            bucket.recovery_threshold * 100.0,
            bucket.base_delay,
            bucket.max_delay,
        );
    }
    Ok(())
}

fn analyze(config: &GatewayConfig, batch_path: &Path, duration: &str) -> Result<()> {
    let contents = std::fs::read_to_string(batch_path)
        .with_context(|| format!("Failed to read batch file {}", batch_path.display()))?;
    let mut entries: Vec<BatchEntry> =
        serde_json::from_str(&contents).context("Batch file is not a valid JSON array of calls")?;
    entries.sort_by_key(|entry| entry.offset_ms);

    let batch_duration = parse_duration(duration)?;
    let order_count = entries.iter().filter(|entry| entry.is_order).count() as u64;
    let timed_calls: Vec<TimedCall> = entries
        .into_iter()
        .map(|entry| TimedCall {
            offset: Duration::from_millis(entry.offset_ms),
            call: CallCost {
                operation: entry.operation,
                weight: entry.weight,
                is_order: entry.is_order,
            },
        })
        .collect();

    let mut per_operation: BTreeMap<&str, u64> = BTreeMap::new();
    for timed in &timed_calls {
        *per_operation.entry(timed.call.operation.as_str()).or_default() +=
            u64::from(timed.call.weight);
    }

    let analyzer = CostAnalyzer::new(config.cost_analyzer.into());
    let report = analyzer.simulate(&SimulationRequest {
        timed_calls: timed_calls.clone(),
        order_count,
        batch_duration,
    });

    println!("Batch of {} call(s), {} order(s)", timed_calls.len(), order_count);
    for (operation, weight) in &per_operation {
        println!("  {operation}: weight {weight}");
    }
    println!(
        "Total weight: {} / {} per minute{}",
        report.total_weight,
        analyzer.limits().weight_limit_per_min,
        if report.weight_limit_exceeded {
            " (EXCEEDS LIMIT)"
        } else {
            ""
        }
    );
    if report.burst_violation {
        println!("Weight burst: some 60s window exceeds the per-minute limit");
    }
    println!("{}", report.order_rate);
    if !report.suggested_delay.is_zero() {
        println!("Suggested order spacing: {:?}", report.suggested_delay);
    }
    Ok(())
}

async fn simulate(
    config: GatewayConfig,
    calls: usize,
    key: &str,
    failure_rate: f64,
    latency: &str,
    orders: bool,
) -> Result<()> {
    let venue = Arc::new(SimulatedVenue::new(SimulatedVenueConfig {
        latency: parse_duration(latency)?,
        failure_rate,
        ..Default::default()
    }));
    let gateway: Arc<Gateway<VenueClient>> = Arc::new(Gateway::new(venue.clone()));
    gateway.configure(config).await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    info!(calls, key, failure_rate, "Starting simulation");
    let started = tokio::time::Instant::now();

    let mut handles = Vec::with_capacity(calls);
    for i in 0..calls {
        let gateway = gateway.clone();
        let cancel = cancel.clone();
        let key = key.to_string();
        handles.push(tokio::spawn(async move {
            if orders {
                gateway
                    .execute(&key, &cancel, |client, cancel| async move {
                        client
                            .place_order("BTCUSDT", 0.01 * (i as f64 + 1.0), &cancel)
                            .await
                            .map(|_| ())
                    })
                    .await
            } else {
                gateway
                    .execute(&key, &cancel, |client, cancel| async move {
                        client.ticker("BTCUSDT", &cancel).await.map(|_| ())
                    })
                    .await
            }
        }));
    }

    let mut outcomes: BTreeMap<String, usize> = BTreeMap::new();
    for joined in futures::future::join_all(handles).await {
        let label = match joined.context("Simulation task panicked")? {
            Ok(()) => "ok".to_string(),
            Err(e) => e.kind().to_string(),
        };
        *outcomes.entry(label).or_default() += 1;
    }

    println!("Finished {} call(s) in {:?}", calls, started.elapsed());
    for (label, count) in &outcomes {
        println!("  {label}: {count}");
    }
    println!(
        "Venue clients created: {} (current generation {})",
        venue.clients_created(),
        gateway.client_generation().unwrap_or_default()
    );
    for stats in gateway.all_bucket_stats() {
        println!(
            "  bucket {}: {}/{} in window ({:.0}%), {} consecutive failure(s)",
            stats.name,
            stats.in_window,
            stats.limit,
            stats.usage * 100.0,
            stats.consecutive_failures
        );
    }
    if let Some(stats) = gateway.circuit_stats() {
        println!(
            "  circuit breaker: {} ({} of {} failures)",
            stats.state, stats.failure_count, stats.failure_threshold
        );
    }
    Ok(())
}
