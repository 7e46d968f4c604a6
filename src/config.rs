//! Configuration for the rowcast command line tool.

use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use rowcast_core::{IdentityConfig, IdentityMode};
use rowcast_delivery::{
    BackoffStrategy, CheckpointConfig, CircuitConfig, DataCenter, EngineConfig, Environment,
    HttpTransportConfig, RateLimitConfig, RetryPolicy, SecondPassConfig,
};
use serde::{Deserialize, Serialize};

/// Default configuration file, read from the working directory when present.
pub const CONFIG_FILE: &str = "rowcast.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "ROWCAST_";

/// Deliver CSV rows as events to a rate-limited HTTP API.
#[derive(Debug, Clone, Parser)]
#[command(name = "rowcast", version, about)]
pub struct Cli {
    /// CSV file to deliver.
    pub input: PathBuf,

    /// API key used as the basic auth user.
    #[arg(long)]
    pub api_key: Option<String>,

    /// API secret used as the basic auth password.
    #[arg(long)]
    pub api_secret: Option<String>,

    /// Environment tag for events (development or production).
    #[arg(long)]
    pub environment: Option<String>,

    /// Regional endpoint (us or eu).
    #[arg(long)]
    pub data_center: Option<String>,

    /// Records per request.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Concurrent delivery workers.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Make a single attempt per batch and skip the second pass.
    #[arg(long)]
    pub no_retry: bool,

    /// Write permanently failed rows to this CSV file.
    #[arg(long, value_name = "PATH")]
    pub save_failed: Option<PathBuf>,

    /// Checkpoint file for resuming interrupted runs.
    #[arg(long, value_name = "PATH")]
    pub checkpoint: Option<PathBuf>,

    /// Configuration file.
    #[arg(long, value_name = "PATH", default_value = CONFIG_FILE)]
    pub config: PathBuf,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long)]
    pub verbose: bool,

    /// Also append log output to this file.
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

/// Values given on the command line; unset fields leave lower layers alone.
#[derive(Debug, Default, Serialize)]
struct CliOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_center: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    worker_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_retry_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    second_pass_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    save_failed: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    checkpoint_path: Option<PathBuf>,
}

impl From<&Cli> for CliOverrides {
    fn from(cli: &Cli) -> Self {
        Self {
            api_key: cli.api_key.clone(),
            api_secret: cli.api_secret.clone(),
            environment: cli.environment.clone(),
            data_center: cli.data_center.clone(),
            batch_size: cli.batch_size,
            worker_count: cli.workers,
            max_retry_attempts: cli.no_retry.then_some(1),
            second_pass_enabled: cli.no_retry.then_some(false),
            save_failed: cli.save_failed.clone(),
            checkpoint_path: cli.checkpoint.clone(),
        }
    }
}

/// Complete tool configuration.
///
/// Loaded in priority order, highest first:
/// 1. Command line flags
/// 2. Environment variables (`ROWCAST_BATCH_SIZE`, `ROWCAST_API_KEY`, ...)
/// 3. Configuration file (`rowcast.toml`)
/// 4. Built-in defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Remote API
    /// Basic auth user.
    pub api_key: String,
    /// Basic auth password.
    pub api_secret: String,
    /// Environment tag on every event.
    pub environment: Environment,
    /// Regional endpoint.
    pub data_center: DataCenter,
    /// Base URL override, mainly for testing against a local server.
    pub endpoint: Option<String>,
    /// Name of the custom event sent per row.
    pub event_name: String,
    /// Per-request timeout in seconds.
    pub request_timeout_seconds: u64,

    // Input
    /// Columns the input must have.
    pub required_columns: Vec<String>,
    /// Fields that identify a row.
    pub identity_fields: Vec<String>,
    /// Hash every non-blank field instead of only the identity fields.
    pub identity_all_fields: bool,
    /// Rows read at a time; 0 reads the whole file at once.
    pub chunk_size: usize,

    // Delivery
    /// Records per request.
    pub batch_size: usize,
    /// Concurrent delivery workers.
    pub worker_count: usize,
    /// Batches buffered ahead of the workers.
    pub queue_capacity: usize,
    /// Age in milliseconds at which a partial batch is sent; 0 disables.
    pub flush_interval_ms: u64,
    /// Skip rows whose identity was already seen in this run.
    pub dedup_enabled: bool,
    /// Shrink concurrency when the remote pushes back.
    pub adaptive_concurrency: bool,
    /// Requests per second across all workers; unlimited when unset.
    pub rate_limit_per_second: Option<f64>,
    /// Requests allowed in a burst.
    pub rate_limit_burst: u32,

    // Retry
    /// Attempts per batch, including the first.
    pub max_retry_attempts: u32,
    /// Backoff base delay in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Extra random delay as a fraction of the backoff.
    pub retry_jitter_factor: f64,
    /// Give leftovers a sequential second pass.
    pub second_pass_enabled: bool,
    /// Records per second-pass request.
    pub second_pass_batch_size: usize,
    /// Pause between second-pass requests in milliseconds.
    pub second_pass_delay_ms: u64,

    // Circuit breaker
    /// Failures inside the window that open the circuit.
    pub circuit_failure_threshold: u32,
    /// Trailing failure window in seconds.
    pub circuit_failure_window_seconds: u64,
    /// Seconds the circuit stays open before a trial.
    pub circuit_open_timeout_seconds: u64,
    /// Trial successes that close the circuit.
    pub circuit_success_threshold: u32,

    // Progress and output
    /// Checkpoint file; resuming is off when unset.
    pub checkpoint_path: Option<PathBuf>,
    /// Completed rows between checkpoint writes.
    pub checkpoint_interval: u64,
    /// CSV file receiving permanently failed rows.
    pub save_failed: Option<PathBuf>,
    /// Seconds in-flight requests get after Ctrl-C.
    pub shutdown_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        let engine = EngineConfig::default();
        let retry = RetryPolicy::default();
        let circuit = CircuitConfig::default();
        let checkpoint = CheckpointConfig::default();
        let http = HttpTransportConfig::default();

        Self {
            api_key: String::new(),
            api_secret: String::new(),
            environment: http.environment,
            data_center: http.data_center,
            endpoint: None,
            event_name: http.event_name,
            request_timeout_seconds: http.timeout.as_secs(),
            required_columns: rowcast_core::source::DEFAULT_REQUIRED_COLUMNS
                .iter()
                .map(ToString::to_string)
                .collect(),
            identity_fields: engine.identity.fields.clone(),
            identity_all_fields: false,
            chunk_size: engine.chunk_size,
            batch_size: engine.batch_size,
            worker_count: engine.worker_count,
            queue_capacity: engine.queue_capacity,
            flush_interval_ms: engine.flush_interval.map_or(0, millis),
            dedup_enabled: engine.dedup_enabled,
            adaptive_concurrency: engine.adaptive_concurrency,
            rate_limit_per_second: None,
            rate_limit_burst: 10,
            max_retry_attempts: retry.max_attempts,
            retry_base_delay_ms: millis(retry.base_delay),
            retry_max_delay_ms: millis(retry.max_delay),
            retry_jitter_factor: retry.jitter_factor,
            second_pass_enabled: engine.second_pass.enabled,
            second_pass_batch_size: engine.second_pass.batch_size,
            second_pass_delay_ms: millis(engine.second_pass.delay),
            circuit_failure_threshold: circuit.failure_threshold,
            circuit_failure_window_seconds: circuit.failure_window.as_secs(),
            circuit_open_timeout_seconds: circuit.open_timeout.as_secs(),
            circuit_success_threshold: circuit.success_threshold,
            checkpoint_path: None,
            checkpoint_interval: checkpoint.interval,
            save_failed: None,
            shutdown_timeout_seconds: engine.shutdown_timeout.as_secs(),
        }
    }
}

impl Config {
    /// Loads defaults, the configuration file, environment variables and
    /// command line flags, in increasing priority.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be parsed or the result is invalid.
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::figment(cli).extract::<Self>().context("failed to load configuration")?.validated()
    }

    fn figment(cli: &Cli) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(&cli.config))
            .merge(Env::prefixed(ENV_PREFIX))
            .merge(Serialized::defaults(CliOverrides::from(cli)))
    }

    fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }

    /// Validates configuration values.
    fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            bail!("API key and secret are required (--api-key/--api-secret or ROWCAST_API_KEY/ROWCAST_API_SECRET)");
        }

        if self.batch_size == 0 {
            bail!("batch_size must be greater than 0");
        }

        if self.worker_count == 0 {
            bail!("worker_count must be greater than 0");
        }

        if self.max_retry_attempts == 0 {
            bail!("max_retry_attempts must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if self.identity_fields.is_empty() {
            bail!("identity_fields must name at least one column");
        }

        if self.circuit_failure_threshold == 0 {
            bail!("circuit_failure_threshold must be greater than 0");
        }

        Ok(())
    }

    /// Converts to the engine configuration.
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            batch_size: self.batch_size,
            worker_count: self.worker_count,
            queue_capacity: self.queue_capacity,
            chunk_size: self.chunk_size,
            flush_interval: (self.flush_interval_ms > 0)
                .then(|| Duration::from_millis(self.flush_interval_ms)),
            dedup_enabled: self.dedup_enabled,
            identity: IdentityConfig {
                fields: self.identity_fields.clone(),
                mode: if self.identity_all_fields {
                    IdentityMode::AllFields
                } else {
                    IdentityMode::Fields
                },
            },
            rate_limit: self.rate_limit_per_second.map(|requests_per_second| RateLimitConfig {
                requests_per_second,
                burst: self.rate_limit_burst,
            }),
            circuit: self.to_circuit_config(),
            retry: self.to_retry_policy(),
            checkpoint: CheckpointConfig {
                path: self.checkpoint_path.clone(),
                interval: self.checkpoint_interval,
                ..Default::default()
            },
            second_pass: SecondPassConfig {
                enabled: self.second_pass_enabled,
                batch_size: self.second_pass_batch_size,
                delay: Duration::from_millis(self.second_pass_delay_ms),
            },
            adaptive_concurrency: self.adaptive_concurrency,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    /// Converts to retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    /// Converts to circuit breaker configuration. The half-open trial limit
    /// is not exposed.
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            failure_window: Duration::from_secs(self.circuit_failure_window_seconds),
            open_timeout: Duration::from_secs(self.circuit_open_timeout_seconds),
            success_threshold: self.circuit_success_threshold,
            ..Default::default()
        }
    }

    /// Converts to HTTP transport configuration.
    pub fn to_transport_config(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            endpoint: self.endpoint.clone(),
            data_center: self.data_center,
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
            environment: self.environment,
            event_name: self.event_name.clone(),
            timeout: Duration::from_secs(self.request_timeout_seconds),
            ..Default::default()
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
