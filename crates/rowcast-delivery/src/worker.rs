//! Delivery workers and the run state they share.
//!
//! Every record reaches exactly one terminal outcome through [`RunContext`]:
//! delivered, collected as a failure, or skipped as a duplicate. Only then is
//! its offset handed to the progress tracker, so a checkpoint never covers a
//! record that is still in flight.

use std::{collections::HashMap, sync::Arc};

use rowcast_core::{
    Batch, DeliveryOutcome, FailedRecord, FailureCollector, FailureReason, KeyedRecord, Record,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    checkpoint::{CheckpointManager, ProgressTracker},
    client::{DeliveryClient, DeliveryReport},
    concurrency::AdaptiveLimiter,
    error::{DeliveryError, Result},
    retry::RetryPolicy,
};

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of active delivery workers.
    pub active_workers: usize,
    /// Records read from the source this run.
    pub records_read: u64,
    /// Records delivered.
    pub successful_deliveries: u64,
    /// Delivered records that needed more than one attempt.
    pub recovered_deliveries: u64,
    /// Records that failed permanently.
    pub permanent_failures: u64,
    /// Records skipped as duplicates.
    pub duplicates: u64,
    /// Batches handed to the delivery client.
    pub batches_processed: u64,
    /// Batches currently being delivered.
    pub in_flight_batches: u64,
    /// Records waiting for the second pass.
    pub second_pass_pending: u64,
}

#[derive(Debug)]
struct ProgressState {
    tracker: ProgressTracker,
    since_checkpoint: u64,
}

/// Records left over from the first pass, with the attempts already spent.
#[derive(Debug, Default)]
pub(crate) struct SecondPassQueue {
    pub records: Vec<KeyedRecord>,
    pub attempts: HashMap<u64, u32>,
}

/// State shared by the producer, the workers and the second pass.
pub(crate) struct RunContext {
    pub client: DeliveryClient,
    pub limiter: AdaptiveLimiter,
    pub retry_policy: RetryPolicy,
    pub collector: Arc<dyn FailureCollector>,
    pub checkpoint: Option<CheckpointManager>,
    pub checkpoint_interval: u64,
    pub second_pass_enabled: bool,
    pub stats: Arc<RwLock<EngineStats>>,
    pub cancel: CancellationToken,
    progress: Mutex<ProgressState>,
    second_pass: Mutex<SecondPassQueue>,
    failures: Mutex<Vec<FailedRecord>>,
    fatal: Mutex<Option<DeliveryError>>,
}

impl RunContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: DeliveryClient,
        limiter: AdaptiveLimiter,
        retry_policy: RetryPolicy,
        collector: Arc<dyn FailureCollector>,
        checkpoint: Option<CheckpointManager>,
        checkpoint_interval: u64,
        second_pass_enabled: bool,
        tracker: ProgressTracker,
        stats: Arc<RwLock<EngineStats>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            limiter,
            retry_policy,
            collector,
            checkpoint,
            checkpoint_interval: checkpoint_interval.max(1),
            second_pass_enabled,
            stats,
            cancel,
            progress: Mutex::new(ProgressState { tracker, since_checkpoint: 0 }),
            second_pass: Mutex::new(SecondPassQueue::default()),
            failures: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
        }
    }

    /// Marks offsets terminal and writes a checkpoint when one is due.
    ///
    /// The failure collector is flushed before each checkpoint write, so a
    /// checkpoint never covers a failure that is still buffered.
    ///
    /// # Errors
    ///
    /// Returns `CheckpointWrite` if a due checkpoint cannot be persisted.
    pub async fn complete(&self, offsets: impl IntoIterator<Item = u64>) -> Result<()> {
        let due = {
            let mut progress = self.progress.lock().await;
            let before = progress.tracker.records_completed();
            for offset in offsets {
                progress.tracker.complete(offset);
            }
            progress.since_checkpoint += progress.tracker.records_completed() - before;
            if progress.since_checkpoint >= self.checkpoint_interval {
                progress.since_checkpoint = 0;
                Some((progress.tracker.next_offset(), progress.tracker.records_settled()))
            } else {
                None
            }
        };

        match (due, &self.checkpoint) {
            (Some((next_offset, completed)), Some(checkpoint)) => {
                self.collector.flush()?;
                checkpoint.record(next_offset, completed).await.map(|_| ())
            },
            _ => Ok(()),
        }
    }

    /// Current watermark and the number of records settled below it.
    pub async fn progress(&self) -> (u64, u64) {
        let progress = self.progress.lock().await;
        (progress.tracker.next_offset(), progress.tracker.records_settled())
    }

    /// Collects a permanently failed record and marks it terminal.
    ///
    /// # Errors
    ///
    /// Returns `RecordIo` if the collector cannot persist the record, or
    /// `CheckpointWrite` if a due checkpoint fails.
    pub async fn fail(&self, failure: FailedRecord) -> Result<()> {
        self.collector.collect(&failure)?;
        let offset = failure.record.offset();
        debug!(offset, reason = %failure.reason, "record failed permanently");

        self.stats.write().await.permanent_failures += 1;
        self.failures.lock().await.push(failure);
        self.complete([offset]).await
    }

    /// Collects a record whose identity could not be derived.
    pub async fn fail_malformed(&self, record: Record, field: String) -> Result<()> {
        self.fail(FailedRecord { record, key: None, reason: FailureReason::MalformedRecord { field } })
            .await
    }

    /// Counts a duplicate record and marks it terminal.
    pub async fn skip_duplicate(&self, offset: u64) -> Result<()> {
        self.stats.write().await.duplicates += 1;
        self.complete([offset]).await
    }

    /// Applies a delivery report: successes, rejections and leftovers.
    ///
    /// `prior_attempts` is set for reports produced by the second pass: it
    /// holds the first-pass attempts per offset. Second-pass leftovers fail
    /// permanently and second-pass successes all count as recovered.
    pub async fn apply_report(
        &self,
        report: DeliveryReport,
        prior_attempts: Option<&HashMap<u64, u32>>,
    ) -> Result<()> {
        let second_pass = prior_attempts.is_some();
        let recovered = if second_pass { report.accepted.len() } else { report.recovered() };
        let accepted: Vec<u64> = report.accepted.iter().map(|a| a.record.record.offset()).collect();

        if !accepted.is_empty() {
            let mut stats = self.stats.write().await;
            stats.successful_deliveries += accepted.len() as u64;
            stats.recovered_deliveries += recovered as u64;
        }
        self.complete(accepted).await?;

        for failure in report.rejected {
            self.fail(failure).await?;
        }

        let Some(pending) = report.pending else {
            return Ok(());
        };

        if report.interrupted {
            debug!(
                batch_seq = pending.batch.seq(),
                records = pending.batch.len(),
                "records left undelivered by shutdown"
            );
            return Ok(());
        }

        if self.second_pass_enabled && !second_pass {
            let mut queue = self.second_pass.lock().await;
            for item in pending.batch.into_items() {
                let offset = item.record.offset();
                queue.attempts.insert(offset, pending.attempts);
                queue.records.push(item);
            }
            let queued = queue.records.len() as u64;
            drop(queue);
            self.stats.write().await.second_pass_pending = queued;
            return Ok(());
        }

        for item in pending.batch.into_items() {
            let earlier =
                prior_attempts.and_then(|prior| prior.get(&item.record.offset())).copied().unwrap_or(0);
            let attempts = earlier + pending.attempts;
            self.fail(FailedRecord {
                key: Some(item.key),
                record: item.record,
                reason: FailureReason::RetriesExhausted {
                    attempts,
                    last_error: pending.last_error.clone(),
                },
            })
            .await?;
        }
        Ok(())
    }

    /// Takes everything queued for the second pass.
    pub async fn take_second_pass(&self) -> SecondPassQueue {
        std::mem::take(&mut *self.second_pass.lock().await)
    }

    /// Stores the first fatal error and cancels the run.
    pub async fn abort(&self, error: DeliveryError) {
        error!(error = %error, category = %error.category(), "fatal error, stopping run");
        let mut fatal = self.fatal.lock().await;
        if fatal.is_none() {
            *fatal = Some(error);
        }
        self.cancel.cancel();
    }

    /// The fatal error, if the run was aborted.
    pub async fn take_fatal(&self) -> Option<DeliveryError> {
        self.fatal.lock().await.take()
    }

    /// Permanently failed records collected so far.
    pub async fn take_failures(&self) -> Vec<FailedRecord> {
        std::mem::take(&mut *self.failures.lock().await)
    }
}

/// Individual worker pulling batches from the shared queue.
pub struct DeliveryWorker {
    id: usize,
    context: Arc<RunContext>,
    queue: Arc<Mutex<mpsc::Receiver<Batch>>>,
}

impl DeliveryWorker {
    /// Creates a new delivery worker.
    pub(crate) fn new(
        id: usize,
        context: Arc<RunContext>,
        queue: Arc<Mutex<mpsc::Receiver<Batch>>>,
    ) -> Self {
        Self { id, context, queue }
    }

    /// Main worker loop: delivers batches until the queue drains or the run
    /// is cancelled.
    ///
    /// # Errors
    ///
    /// Returns a fatal error (checkpoint or failure sink) after aborting the
    /// run.
    pub async fn run(&self) -> Result<()> {
        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                tokio::select! {
                    biased;
                    () = self.context.cancel.cancelled() => None,
                    batch = queue.recv() => batch,
                }
            };

            let Some(batch) = next else {
                if self.context.cancel.is_cancelled() {
                    info!(worker_id = self.id, "delivery worker received shutdown signal");
                }
                break;
            };

            if let Err(error) = self.process_batch(batch).await {
                self.context.abort(error.clone()).await;
                return Err(error);
            }
        }

        debug!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    async fn process_batch(&self, batch: Batch) -> Result<()> {
        let Ok(permit) = self.context.limiter.acquire().await else {
            debug!(worker_id = self.id, batch_seq = batch.seq(), "limiter closed, batch left undelivered");
            return Ok(());
        };
        let seq = batch.seq();
        let records = batch.len();
        debug!(worker_id = self.id, batch_seq = seq, records, "delivering batch");

        {
            let mut stats = self.context.stats.write().await;
            stats.in_flight_batches += 1;
            stats.batches_processed += 1;
        }

        let report =
            self.context.client.deliver(batch, &self.context.retry_policy, &self.context.cancel).await;
        drop(permit);

        if report.transient_failures > 0 {
            self.context.limiter.on_backpressure();
        } else {
            self.context.limiter.on_success();
        }

        {
            let mut stats = self.context.stats.write().await;
            stats.in_flight_batches -= 1;
        }

        match report.outcome() {
            DeliveryOutcome::RetryableFailure { reason, .. } if !report.interrupted => warn!(
                worker_id = self.id,
                batch_seq = seq,
                attempts = report.attempts,
                %reason,
                "batch not fully delivered in first pass"
            ),
            DeliveryOutcome::PermanentFailure { reason } => debug!(
                worker_id = self.id,
                batch_seq = seq,
                rejected = report.rejected.len(),
                %reason,
                "batch rejected by remote"
            ),
            _ => debug!(worker_id = self.id, batch_seq = seq, attempts = report.attempts, "batch finished"),
        }

        self.context.apply_report(report, None).await
    }
}
