//! Rowcast command line tool.
//!
//! Reads a CSV file and delivers every row as an event to the remote API,
//! resuming from a checkpoint when one exists and writing rows that could
//! not be delivered to a failure file.

mod config;

use std::{
    fs::{File, OpenOptions},
    path::Path,
    process::ExitCode,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use clap::Parser;
use rowcast_core::{
    Clock, CsvFailureFile, CsvRecordSource, FailureCollector, MemoryFailureCollector, RealClock,
};
use rowcast_delivery::{DeliveryEngine, HttpTransport};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Cli, Config};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.verbose, cli.log_file.as_deref()) {
        eprintln!("rowcast: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = format!("{e:#}"), "Run failed");
            ExitCode::FAILURE
        },
    }
}

/// Runs one delivery. Returns whether every record reached the remote.
async fn run(cli: Cli) -> Result<bool> {
    let config = Config::load(&cli)?;
    info!(
        input = %cli.input.display(),
        data_center = ?config.data_center,
        environment = %config.environment,
        batch_size = config.batch_size,
        workers = config.worker_count,
        "Configuration loaded"
    );

    let source = CsvRecordSource::open(&cli.input, &config.required_columns)
        .with_context(|| format!("failed to open {}", cli.input.display()))?;

    let collector: Arc<dyn FailureCollector> = match &config.save_failed {
        Some(path) => Arc::new(
            CsvFailureFile::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Arc::new(MemoryFailureCollector::new()),
    };

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let transport = HttpTransport::new(config.to_transport_config(), Arc::clone(&clock))?;
    let engine =
        DeliveryEngine::new(config.to_engine_config(), Arc::new(transport), collector, clock)?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let result = engine.run(Box::new(source), shutdown).await?;

    info!(
        total = result.total,
        duplicates = result.duplicates,
        resumed_from = ?result.resumed_from,
        "{result}"
    );

    if result.interrupted {
        warn!("Run interrupted; rerun with the same checkpoint to resume");
    }

    if result.permanent_failure > 0 {
        match &config.save_failed {
            Some(path) => info!(path = %path.display(), "Failed rows written"),
            None => {
                for failure in result.failures.iter().take(10) {
                    warn!(offset = failure.record.offset(), reason = %failure.reason, "Record failed");
                }
            },
        }
    }

    Ok(result.is_clean())
}

/// Initializes tracing with environment-based configuration.
///
/// When `log_file` is set, events are also appended to it without colours.
fn init_tracing(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_directives = if verbose { "debug" } else { "info,rowcast=debug" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(verbose)
        .with_file(verbose)
        .with_line_number(verbose);

    let file_layer = match log_file {
        Some(path) => Some(
            fmt::layer().with_ansi(false).with_target(true).with_writer(open_log_file(path)?),
        ),
        None => None,
    };

    tracing_subscriber::registry().with(filter).with(fmt_layer).with(file_layer).init();
    Ok(())
}

/// Opens `path` for appending, creating it if needed.
fn open_log_file(path: &Path) -> Result<Mutex<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    Ok(Mutex::new(file))
}

/// Cancels `shutdown` on the first Ctrl-C or SIGTERM.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, finishing in-flight batches");
    shutdown.cancel();
}
