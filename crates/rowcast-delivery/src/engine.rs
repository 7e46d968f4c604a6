//! Record delivery engine with worker pool and reliability guarantees.
//!
//! The engine streams records from a [`RecordSource`], resolves identities,
//! drops duplicates, groups the rest into batches and hands them to a pool of
//! workers that deliver through a shared rate limiter and circuit breaker.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ RecordSource │──▶│   Producer   │──▶│ Worker Pool  │──▶│  Transport  │
//! └──────────────┘   └──────────────┘   └──────────────┘   └─────────────┘
//!                      │ identity           │ limiter          │
//!                      │ dedup              │ circuit          ▼
//!                      ▼ batching           ▼ retry      ┌─────────────┐
//!                ┌──────────────┐    ┌──────────────┐    │ Remote API  │
//!                │  Collector   │    │  Checkpoint  │    └─────────────┘
//!                └──────────────┘    └──────────────┘
//! ```
//!
//! Batches that exhaust their retries in the main pass get one more chance in
//! a sequential second pass once the pool has drained.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use rowcast_core::{
    Batch, Clock, CoreError, FailedRecord, FailureCollector, IdentityConfig, IdentityResolver,
    KeyedRecord, RecordSource,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    batch::BatchAssembler,
    checkpoint::{CheckpointConfig, CheckpointManager, ProgressTracker},
    circuit::{CircuitBreaker, CircuitConfig},
    client::DeliveryClient,
    concurrency::AdaptiveLimiter,
    dedup::DedupCache,
    error::{DeliveryError, Result},
    rate_limit::{RateLimitConfig, RateLimiter},
    retry::RetryPolicy,
    transport::Transport,
    worker::{EngineStats, RunContext},
    worker_pool::WorkerPool,
};

/// Settings for the sequential retry pass over leftover records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecondPassConfig {
    /// Whether leftovers get a second pass at all.
    pub enabled: bool,
    /// Records per second-pass batch.
    pub batch_size: usize,
    /// Pause between second-pass batches.
    pub delay: Duration,
}

impl Default for SecondPassConfig {
    fn default() -> Self {
        Self { enabled: true, batch_size: 10, delay: Duration::from_secs(1) }
    }
}

/// Configuration for the delivery engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum records per batch.
    pub batch_size: usize,
    /// Number of concurrent delivery workers.
    pub worker_count: usize,
    /// Batches buffered between the producer and the workers.
    pub queue_capacity: usize,
    /// Records read from the source at a time; 0 reads everything at once.
    pub chunk_size: usize,
    /// Age at which a partial batch is sent anyway.
    pub flush_interval: Option<Duration>,
    /// Whether repeated identity keys are skipped.
    pub dedup_enabled: bool,
    /// How identity keys are derived.
    pub identity: IdentityConfig,
    /// Shared request rate; unlimited when unset.
    pub rate_limit: Option<RateLimitConfig>,
    /// Circuit breaker thresholds.
    pub circuit: CircuitConfig,
    /// Per-batch retry policy.
    pub retry: RetryPolicy,
    /// Checkpoint location and cadence.
    pub checkpoint: CheckpointConfig,
    /// Sequential retry pass settings.
    pub second_pass: SecondPassConfig,
    /// Whether in-flight deliveries adapt to remote backpressure.
    pub adaptive_concurrency: bool,
    /// Grace period for in-flight batches after cancellation.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: crate::DEFAULT_BATCH_SIZE,
            worker_count: crate::DEFAULT_WORKER_COUNT,
            queue_capacity: crate::DEFAULT_QUEUE_CAPACITY,
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            flush_interval: Some(Duration::from_secs(5)),
            dedup_enabled: true,
            identity: IdentityConfig::default(),
            rate_limit: None,
            circuit: CircuitConfig::default(),
            retry: RetryPolicy::default(),
            checkpoint: CheckpointConfig::default(),
            second_pass: SecondPassConfig::default(),
            adaptive_concurrency: true,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Checks the settings for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DeliveryError::configuration("batch_size must be at least 1"));
        }
        if self.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(DeliveryError::configuration("queue_capacity must be at least 1"));
        }
        if self.identity.fields.is_empty() {
            return Err(DeliveryError::configuration("at least one identity field is required"));
        }
        if self.retry.max_attempts == 0 {
            return Err(DeliveryError::configuration("retry.max_attempts must be at least 1"));
        }
        if self.second_pass.enabled && self.second_pass.batch_size == 0 {
            return Err(DeliveryError::configuration("second_pass.batch_size must be at least 1"));
        }
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        Ok(())
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    /// Records read from the source during this run.
    pub total: u64,
    /// Records delivered.
    pub success: u64,
    /// Records that failed permanently.
    pub permanent_failure: u64,
    /// Delivered records that needed a retry or the second pass.
    pub retried_and_recovered: u64,
    /// Records skipped as duplicates.
    pub duplicates: u64,
    /// Offset the run resumed from, when a checkpoint was found.
    pub resumed_from: Option<u64>,
    /// Whether the run was cancelled before finishing.
    pub interrupted: bool,
    /// Permanently failed records with their reasons.
    pub failures: Vec<FailedRecord>,
}

impl RunResult {
    /// Records delivered on their first attempt.
    pub fn immediate_success(&self) -> u64 {
        self.success.saturating_sub(self.retried_and_recovered)
    }

    /// Whether every record read was delivered or skipped as a duplicate.
    pub fn is_clean(&self) -> bool {
        !self.interrupted && self.permanent_failure == 0
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} successful ({} failed, {} recovered through retry)",
            self.success, self.total, self.permanent_failure, self.retried_and_recovered
        )
    }
}

/// Main delivery engine coordinating producer, workers and second pass.
pub struct DeliveryEngine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    collector: Arc<dyn FailureCollector>,
    circuit: Arc<CircuitBreaker>,
    rate_limiter: Option<Arc<RateLimiter>>,
    stats: Arc<RwLock<EngineStats>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryEngine").field("config", &self.config).finish_non_exhaustive()
    }
}

impl DeliveryEngine {
    /// Creates a new delivery engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the configuration is invalid.
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        collector: Arc<dyn FailureCollector>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let circuit = Arc::new(CircuitBreaker::new(config.circuit.clone(), Arc::clone(&clock)));
        let rate_limiter = config
            .rate_limit
            .clone()
            .map(|rate| RateLimiter::new(rate, Arc::clone(&clock)).map(Arc::new))
            .transpose()?;

        Ok(Self {
            config,
            transport,
            collector,
            circuit,
            rate_limiter,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            clock,
        })
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Shared circuit breaker.
    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    /// Delivers every record of `source`.
    ///
    /// Resumes from the configured checkpoint when one exists for this
    /// source. Cancelling `shutdown` stops intake, lets in-flight batches
    /// finish, skips the second pass and returns a partial result with
    /// `interrupted` set.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be read, the source fails,
    /// a failed record cannot be collected, or a checkpoint cannot be
    /// written. A best-effort checkpoint is attempted before returning.
    pub async fn run(
        &self,
        mut source: Box<dyn RecordSource>,
        shutdown: CancellationToken,
    ) -> Result<RunResult> {
        let source_name = source.describe();
        let cancel = shutdown.child_token();
        *self.stats.write().await = EngineStats::default();

        let checkpoint = self.config.checkpoint.path.as_ref().map(|path| {
            CheckpointManager::new(
                path.clone(),
                source_name.clone(),
                &self.config.checkpoint,
                Arc::clone(&self.clock),
            )
        });

        let resume = match &checkpoint {
            Some(manager) => manager.load().await?,
            None => None,
        };
        let resumed_from = resume.as_ref().map(|cp| cp.next_offset);
        let tracker = resume.as_ref().map_or_else(
            || ProgressTracker::new(0, 0),
            |cp| ProgressTracker::new(cp.next_offset, cp.records_completed),
        );

        if let Some(offset) = resumed_from {
            info!(source = %source_name, next_offset = offset, "skipping records covered by checkpoint");
            source = tokio::task::spawn_blocking(move || source.skip_to(offset).map(|()| source))
                .await
                .map_err(|e| DeliveryError::internal(format!("source task failed: {e}")))??;
        }

        info!(
            source = %source_name,
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            "starting delivery run"
        );

        let client = DeliveryClient::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.circuit),
            self.rate_limiter.clone(),
            Arc::clone(&self.clock),
        );
        let context = Arc::new(RunContext::new(
            client,
            AdaptiveLimiter::new(self.config.worker_count, self.config.adaptive_concurrency),
            self.config.retry.clone(),
            Arc::clone(&self.collector),
            checkpoint,
            self.config.checkpoint.interval,
            self.config.second_pass.enabled,
            tracker,
            Arc::clone(&self.stats),
            cancel.clone(),
        ));

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let mut pool = WorkerPool::new(Arc::clone(&context), rx, self.config.worker_count);
        pool.spawn_workers().await;

        let producer = Producer {
            context: Arc::clone(&context),
            resolver: IdentityResolver::new(self.config.identity.clone()),
            dedup: DedupCache::new(self.config.dedup_enabled),
            assembler: BatchAssembler::new(self.config.batch_size, self.config.flush_interval),
            chunk_size: self.config.chunk_size,
            clock: Arc::clone(&self.clock),
            tx,
        };
        let producer = tokio::spawn(producer.run(source));

        match producer.await {
            Ok(Ok(())) => {},
            Ok(Err(error)) => context.abort(error).await,
            Err(join_error) => {
                let error = DeliveryError::internal(format!("producer task failed: {join_error}"));
                context.abort(error).await;
            },
        }

        if let Err(error) = pool.join(self.config.shutdown_timeout).await {
            match error {
                DeliveryError::ShutdownTimeout { .. } => {
                    warn!(error = %error, "in-flight batches abandoned at shutdown");
                },
                other => context.abort(other).await,
            }
        }

        if !cancel.is_cancelled() {
            self.second_pass(&context).await;
        }

        if let Err(error) = self.collector.flush() {
            context.abort(error.into()).await;
        }

        let (next_offset, records_completed) = context.progress().await;
        if let Some(error) = context.take_fatal().await {
            if let Some(manager) = &context.checkpoint {
                if let Err(write_error) = manager.record(next_offset, records_completed).await {
                    error!(error = %write_error, "could not save checkpoint after fatal error");
                }
            }
            return Err(error);
        }

        let interrupted = shutdown.is_cancelled();
        if let Some(manager) = &context.checkpoint {
            if interrupted {
                manager.record(next_offset, records_completed).await?;
                info!(next_offset, records_completed, "checkpoint saved for resume");
            } else {
                manager.clear().await?;
            }
        }

        let stats = self.stats().await;
        let result = RunResult {
            total: stats.records_read,
            success: stats.successful_deliveries,
            permanent_failure: stats.permanent_failures,
            retried_and_recovered: stats.recovered_deliveries,
            duplicates: stats.duplicates,
            resumed_from,
            interrupted,
            failures: context.take_failures().await,
        };

        info!(
            total = result.total,
            success = result.success,
            failed = result.permanent_failure,
            recovered = result.retried_and_recovered,
            duplicates = result.duplicates,
            interrupted,
            "delivery run finished"
        );
        Ok(result)
    }

    async fn second_pass(&self, context: &RunContext) {
        let queue = context.take_second_pass().await;
        if queue.records.is_empty() {
            return;
        }

        let config = &self.config.second_pass;
        info!(records = queue.records.len(), batch_size = config.batch_size, "starting second pass");

        let first_seq = context.stats.read().await.batches_processed;
        let mut assembler = BatchAssembler::starting_at(config.batch_size, None, first_seq);
        let mut batches: Vec<Batch> = Vec::new();
        let now = self.clock.now();
        for record in queue.records {
            batches.extend(assembler.push(record, now));
        }
        batches.extend(assembler.finish());

        let total = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            if context.cancel.is_cancelled() {
                break;
            }

            let seq = batch.seq();
            let records = batch.len() as u64;
            let report = context.client.deliver(batch, &context.retry_policy, &context.cancel).await;
            debug!(batch_seq = seq, attempts = report.attempts, "second pass batch finished");

            if let Err(error) = context.apply_report(report, Some(&queue.attempts)).await {
                context.abort(error).await;
                return;
            }

            {
                let mut stats = context.stats.write().await;
                stats.second_pass_pending = stats.second_pass_pending.saturating_sub(records);
            }

            if index + 1 < total && !config.delay.is_zero() {
                tokio::select! {
                    biased;
                    () = context.cancel.cancelled() => break,
                    () = self.clock.sleep(config.delay) => {},
                }
            }
        }
    }
}

/// Reads the source and feeds batches to the workers.
struct Producer {
    context: Arc<RunContext>,
    resolver: IdentityResolver,
    dedup: DedupCache,
    assembler: BatchAssembler,
    chunk_size: usize,
    clock: Arc<dyn Clock>,
    tx: mpsc::Sender<Batch>,
}

impl Producer {
    async fn run(mut self, mut source: Box<dyn RecordSource>) -> Result<()> {
        let chunk_size = if self.chunk_size == 0 { usize::MAX } else { self.chunk_size };

        loop {
            if self.context.cancel.is_cancelled() {
                return Ok(());
            }

            let mut read = tokio::task::spawn_blocking(move || {
                let chunk = source.next_chunk(chunk_size);
                (source, chunk)
            });

            // A slow source must not hold a stale partial batch past its flush interval.
            let joined = loop {
                let deadline = self.assembler.flush_deadline();
                tokio::select! {
                    biased;
                    joined = &mut read => break joined,
                    () = flush_timer(self.clock.as_ref(), deadline) => {
                        if let Some(batch) = self.assembler.flush_due(self.clock.now()) {
                            debug!(batch_seq = batch.seq(), records = batch.len(), "flushing stale batch");
                            if !self.send(batch).await? {
                                return Ok(());
                            }
                        }
                    },
                }
            };
            let (returned, chunk) =
                joined.map_err(|e| DeliveryError::internal(format!("source task failed: {e}")))?;
            source = returned;

            let Some(chunk) = chunk? else {
                break;
            };
            debug!(records = chunk.len(), "read source chunk");
            self.context.stats.write().await.records_read += chunk.len() as u64;

            for record in chunk {
                let key = match self.resolver.resolve(&record) {
                    Ok(key) => key,
                    Err(CoreError::MalformedRecord { field }) => {
                        debug!(offset = record.offset(), field = %field, "record has no identity");
                        self.context.fail_malformed(record, field).await?;
                        continue;
                    },
                    Err(other) => return Err(other.into()),
                };

                if !self.dedup.observe(key) {
                    self.context.skip_duplicate(record.offset()).await?;
                    continue;
                }

                let now = self.clock.now();
                let ready = self
                    .assembler
                    .push(KeyedRecord::new(key, record), now)
                    .or_else(|| self.assembler.flush_due(now));
                if let Some(batch) = ready {
                    if !self.send(batch).await? {
                        return Ok(());
                    }
                }
            }
        }

        if let Some(batch) = self.assembler.finish() {
            self.send(batch).await?;
        }
        debug!(duplicates = self.dedup.duplicates(), "source exhausted");
        Ok(())
    }

    /// Queues a batch. Returns `false` if the run was cancelled first.
    async fn send(&self, batch: Batch) -> Result<bool> {
        tokio::select! {
            biased;
            () = self.context.cancel.cancelled() => Ok(false),
            sent = self.tx.send(batch) => {
                sent.map_err(|_| DeliveryError::internal("delivery queue closed"))?;
                Ok(true)
            },
        }
    }
}

/// Resolves at `deadline`, or never when nothing is waiting to be flushed.
async fn flush_timer(clock: &dyn Clock, deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => clock.sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
