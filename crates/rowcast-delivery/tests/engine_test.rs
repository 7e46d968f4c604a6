//! Integration tests for the delivery engine.
//!
//! Runs the full producer, worker pool and second pass against a scripted
//! transport and a virtual clock, so retry and rate limit waits finish
//! instantly.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{path::Path, sync::Arc, time::Duration};

use rowcast_core::{Clock, CsvFailureFile, FailureReason, Record};
use rowcast_delivery::{
    CheckpointConfig, CheckpointManager, DeliveryEngine, DeliveryError, EngineConfig,
    RateLimitConfig, RetryPolicy, RunResult, SecondPassConfig,
};
use rowcast_testing::{
    records, Invariants, MemoryFailureCollector, RecordBuilder, ScriptedTransport, TestClock,
    VecRecordSource,
};
use tokio_util::sync::CancellationToken;

const SOURCE: &str = "signups.csv";

struct Harness {
    engine: DeliveryEngine,
    transport: ScriptedTransport,
    collector: Arc<MemoryFailureCollector>,
    clock: TestClock,
}

fn base_config() -> EngineConfig {
    EngineConfig {
        worker_count: 1,
        flush_interval: None,
        second_pass: SecondPassConfig { delay: Duration::from_millis(10), ..Default::default() },
        ..Default::default()
    }
}

fn harness(config: EngineConfig, transport: ScriptedTransport) -> Harness {
    let clock = TestClock::new();
    let collector = Arc::new(MemoryFailureCollector::new());
    let engine = DeliveryEngine::new(
        config,
        Arc::new(transport.clone()),
        collector.clone(),
        Arc::new(clock.clone()),
    )
    .expect("valid engine config");
    Harness { engine, transport, collector, clock }
}

impl Harness {
    async fn run(&self, rows: Vec<Record>) -> RunResult {
        self.run_with(rows, CancellationToken::new()).await.expect("run should succeed")
    }

    async fn run_with(
        &self,
        rows: Vec<Record>,
        cancel: CancellationToken,
    ) -> Result<RunResult, DeliveryError> {
        self.engine.run(Box::new(VecRecordSource::new(SOURCE, rows)), cancel).await
    }
}

fn checkpoint_config(path: &Path) -> CheckpointConfig {
    CheckpointConfig { path: Some(path.to_path_buf()), ..Default::default() }
}

fn manager(path: &Path, source: &str) -> CheckpointManager {
    CheckpointManager::new(path, source, &CheckpointConfig::default(), Arc::new(TestClock::new()))
}

#[tokio::test]
async fn delivers_everything_in_full_batches() {
    let h = harness(base_config(), ScriptedTransport::new());

    let result = h.run(records(250)).await;

    assert_eq!((result.total, result.success, result.permanent_failure), (250, 250, 0));
    assert_eq!(h.transport.batch_sizes(), vec![100, 100, 50]);
    assert_eq!(result.immediate_success(), 250);
    assert!(!result.interrupted);
    Invariants::all_accounted(&result).unwrap();
    Invariants::no_double_delivery(&h.transport.offsets_sent_ok()).unwrap();
}

#[tokio::test]
async fn throttled_batch_recovers_through_retry() {
    let transport = ScriptedTransport::new().then_status(429).then_status(429);
    let h = harness(base_config(), transport);

    let result = h.run(records(10)).await;

    assert_eq!(result.success, 10);
    assert_eq!(result.retried_and_recovered, 10);
    assert_eq!(result.immediate_success(), 0);
    assert_eq!(result.permanent_failure, 0);
    let attempts: Vec<u32> = h.transport.calls().iter().map(|call| call.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(result.to_string(), "10/10 successful (0 failed, 10 recovered through retry)");
}

#[tokio::test]
async fn record_without_identity_is_collected_without_network_attempt() {
    let mut rows = records(5);
    rows[2] = RecordBuilder::with_defaults(2).blank("email").build();
    let h = harness(base_config(), ScriptedTransport::new());

    let result = h.run(rows).await;

    assert_eq!(result.success, 4);
    assert_eq!(result.permanent_failure, 1);
    assert!(!h.transport.offsets_sent_ok().contains(&2));

    let collected = h.collector.failures();
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].record.offset(), 2);
    assert!(collected[0].key.is_none());
    assert!(matches!(
        &collected[0].reason,
        FailureReason::MalformedRecord { field } if field == "email"
    ));
    Invariants::failures_match_counter(&result).unwrap();
}

#[tokio::test]
async fn duplicate_identities_are_sent_once() {
    let mut rows = records(5);
    rows[3] = RecordBuilder::with_defaults(3)
        .field("email", "user0@example.com")
        .field("coupon_code", "SAVE0000")
        .build();
    let h = harness(base_config(), ScriptedTransport::new());

    let result = h.run(rows).await;

    assert_eq!(result.duplicates, 1);
    assert_eq!(result.success, 4);
    assert_eq!(h.transport.offsets_sent_ok(), vec![0, 1, 2, 4]);
    Invariants::all_accounted(&result).unwrap();
}

#[tokio::test]
async fn same_email_with_different_coupons_is_not_a_duplicate() {
    let rows = vec![
        RecordBuilder::with_defaults(0).field("email", "a@example.com").field("coupon_code", "SAVE1").build(),
        RecordBuilder::with_defaults(1).field("email", "a@example.com").field("coupon_code", "SAVE2").build(),
    ];
    let h = harness(base_config(), ScriptedTransport::new());

    let result = h.run(rows).await;

    assert_eq!(result.duplicates, 0);
    assert_eq!(result.success, 2);
    assert_eq!(h.transport.offsets_sent_ok(), vec![0, 1]);
}

#[tokio::test]
async fn disabled_dedup_sends_repeats() {
    let mut rows = records(3);
    rows[2] = RecordBuilder::with_defaults(2)
        .field("email", "user0@example.com")
        .field("coupon_code", "SAVE0000")
        .build();
    let h = harness(EngineConfig { dedup_enabled: false, ..base_config() }, ScriptedTransport::new());

    let result = h.run(rows).await;

    assert_eq!(result.duplicates, 0);
    assert_eq!(result.success, 3);
}

#[tokio::test]
async fn client_errors_fail_permanently_without_retry() {
    let h = harness(base_config(), ScriptedTransport::always(400));

    let result = h.run(records(3)).await;

    assert_eq!(result.success, 0);
    assert_eq!(result.permanent_failure, 3);
    assert_eq!(h.transport.calls().len(), 1);
    assert!(result
        .failures
        .iter()
        .all(|f| matches!(f.reason, FailureReason::Rejected { status: 400, .. })));
    Invariants::all_accounted(&result).unwrap();
}

#[tokio::test]
async fn partial_rejection_fails_only_rejected_items() {
    let h = harness(base_config(), ScriptedTransport::rejecting(vec![1, 3], 422));

    let result = h.run(records(5)).await;

    assert_eq!(result.success, 3);
    assert_eq!(result.permanent_failure, 2);
    let mut failed: Vec<u64> = result.failures.iter().map(|f| f.record.offset()).collect();
    failed.sort_unstable();
    assert_eq!(failed, vec![1, 3]);
    assert_eq!(h.transport.calls().len(), 1);
}

#[tokio::test]
async fn second_pass_recovers_exhausted_batches() {
    let config = EngineConfig {
        retry: RetryPolicy { max_attempts: 2, ..Default::default() },
        ..base_config()
    };
    let transport = ScriptedTransport::new().then_status(503).then_status(503);
    let h = harness(config, transport);

    let result = h.run(records(5)).await;

    assert_eq!(result.success, 5);
    assert_eq!(result.retried_and_recovered, 5);
    assert_eq!(result.permanent_failure, 0);
    assert_eq!(h.transport.calls().len(), 3);
    Invariants::all_accounted(&result).unwrap();
}

#[tokio::test]
async fn second_pass_uses_its_own_batch_size() {
    let config = EngineConfig {
        retry: RetryPolicy { max_attempts: 1, ..Default::default() },
        second_pass: SecondPassConfig {
            batch_size: 2,
            delay: Duration::from_secs(1),
            ..Default::default()
        },
        ..base_config()
    };
    let h = harness(config, ScriptedTransport::new().then_status(500));

    let result = h.run(records(5)).await;

    assert_eq!(result.success, 5);
    assert_eq!(h.transport.batch_sizes(), vec![5, 2, 2, 1]);
    assert!(h.clock.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn exhausted_records_fail_when_second_pass_disabled() {
    let config = EngineConfig {
        retry: RetryPolicy { max_attempts: 2, ..Default::default() },
        second_pass: SecondPassConfig { enabled: false, ..Default::default() },
        ..base_config()
    };
    let h = harness(config, ScriptedTransport::always(503));

    let result = h.run(records(4)).await;

    assert_eq!(result.permanent_failure, 4);
    assert!(result.failures.iter().all(|f| matches!(
        f.reason,
        FailureReason::RetriesExhausted { attempts: 2, .. }
    )));
    assert_eq!(h.collector.failures().len(), 4);
}

#[tokio::test]
async fn second_pass_failures_report_total_attempts() {
    let config = EngineConfig {
        retry: RetryPolicy { max_attempts: 2, ..Default::default() },
        ..base_config()
    };
    let h = harness(config, ScriptedTransport::always(503));

    let result = h.run(records(3)).await;

    assert_eq!(result.permanent_failure, 3);
    assert!(result.failures.iter().all(|f| matches!(
        f.reason,
        FailureReason::RetriesExhausted { attempts: 4, .. }
    )));
}

#[tokio::test]
async fn source_is_read_in_bounded_chunks() {
    let h = harness(EngineConfig { chunk_size: 16, ..base_config() }, ScriptedTransport::new());
    let source = VecRecordSource::new(SOURCE, records(100));
    let counters = source.counters();

    let result = h.engine.run(Box::new(source), CancellationToken::new()).await.unwrap();

    assert_eq!(result.success, 100);
    assert_eq!(counters.largest_chunk(), 16);
    assert_eq!(counters.chunks(), 7);
}

#[tokio::test]
async fn stale_batch_is_flushed_while_source_is_slow() {
    let config = EngineConfig {
        chunk_size: 3,
        flush_interval: Some(Duration::from_secs(1)),
        ..base_config()
    };
    let h = harness(config, ScriptedTransport::new());
    let source =
        VecRecordSource::new(SOURCE, records(6)).with_chunk_delay(Duration::from_millis(50));

    let result = h.engine.run(Box::new(source), CancellationToken::new()).await.unwrap();

    assert_eq!(result.success, 6);
    assert_eq!(h.transport.batch_sizes(), vec![3, 3]);
    assert!(h.clock.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn zero_chunk_size_reads_input_at_once() {
    let h = harness(EngineConfig { chunk_size: 0, ..base_config() }, ScriptedTransport::new());
    let source = VecRecordSource::new(SOURCE, records(40));
    let counters = source.counters();

    h.engine.run(Box::new(source), CancellationToken::new()).await.unwrap();

    assert_eq!(counters.chunks(), 1);
    assert_eq!(counters.largest_chunk(), 40);
}

#[tokio::test]
async fn resumes_after_checkpoint_and_clears_it() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");
    manager(&path, SOURCE).record(3, 3).await.unwrap();

    let config = EngineConfig { checkpoint: checkpoint_config(&path), ..base_config() };
    let h = harness(config, ScriptedTransport::new());
    let source = VecRecordSource::new(SOURCE, records(10));
    let counters = source.counters();

    let result = h.engine.run(Box::new(source), CancellationToken::new()).await.unwrap();

    assert_eq!(result.resumed_from, Some(3));
    assert_eq!(result.total, 7);
    assert_eq!(counters.skipped_to(), 3);
    assert_eq!(h.transport.offsets_sent_ok(), (3..10).collect::<Vec<_>>());
    assert!(!path.exists(), "clean run removes the checkpoint");
}

#[tokio::test]
async fn checkpoint_for_other_input_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");
    manager(&path, "other.csv").record(5, 5).await.unwrap();

    let config = EngineConfig { checkpoint: checkpoint_config(&path), ..base_config() };
    let h = harness(config, ScriptedTransport::new());

    let error = h.run_with(records(10), CancellationToken::new()).await.unwrap_err();

    assert!(matches!(error, DeliveryError::CheckpointMismatch { .. }));
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn cancellation_saves_progress_for_resume() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");
    let config = EngineConfig {
        batch_size: 10,
        checkpoint: checkpoint_config(&path),
        ..base_config()
    };

    let cancel = CancellationToken::new();
    let transport = ScriptedTransport::new().cancel_after(1, cancel.clone());
    let h = harness(config.clone(), transport);

    let result = h.run_with(records(50), cancel).await.unwrap();

    assert!(result.interrupted);
    assert_eq!(result.success, 10);
    let saved = manager(&path, SOURCE).load().await.unwrap().expect("checkpoint written");
    assert_eq!(saved.next_offset, 10);
    assert_eq!(saved.records_completed, 10);

    let resumed = harness(config, ScriptedTransport::new());
    let result = resumed.run(records(50)).await;

    assert_eq!(result.resumed_from, Some(10));
    assert_eq!(result.success, 40);
    assert_eq!(resumed.transport.offsets_sent_ok(), (10..50).collect::<Vec<_>>());
    assert!(!path.exists());
}

fn failure_file_engine(
    config: EngineConfig,
    transport: &ScriptedTransport,
    path: &Path,
) -> DeliveryEngine {
    let collector = Arc::new(CsvFailureFile::create(path).unwrap());
    DeliveryEngine::new(config, Arc::new(transport.clone()), collector, Arc::new(TestClock::new()))
        .unwrap()
}

#[tokio::test]
async fn resumed_run_appends_to_failure_file() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("progress.json");
    let failed = dir.path().join("failed.csv");
    let config = EngineConfig {
        batch_size: 10,
        checkpoint: checkpoint_config(&checkpoint),
        ..base_config()
    };
    let mut rows = records(50);
    rows[2] = RecordBuilder::with_defaults(2).blank("email").build();

    let cancel = CancellationToken::new();
    let first = ScriptedTransport::new().cancel_after(1, cancel.clone());
    let engine = failure_file_engine(config.clone(), &first, &failed);
    let result =
        engine.run(Box::new(VecRecordSource::new(SOURCE, rows.clone())), cancel).await.unwrap();
    drop(engine);

    assert!(result.interrupted);
    assert_eq!(result.permanent_failure, 1);

    let second = ScriptedTransport::rejecting(vec![30], 422);
    let engine = failure_file_engine(config, &second, &failed);
    let result = engine
        .run(Box::new(VecRecordSource::new(SOURCE, rows)), CancellationToken::new())
        .await
        .unwrap();
    drop(engine);

    assert_eq!(result.resumed_from, Some(11));
    assert_eq!(result.permanent_failure, 1);

    let contents = std::fs::read_to_string(&failed).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 3, "one header and one row per run: {contents}");
    assert!(lines[0].starts_with("email,coupon_code"));
    assert!(lines[1].contains("cust-2,"));
    assert!(lines[2].contains("cust-30,"));
}

#[tokio::test]
async fn cancellation_skips_second_pass() {
    let cancel = CancellationToken::new();
    let config = EngineConfig {
        retry: RetryPolicy { max_attempts: 1, ..Default::default() },
        ..base_config()
    };
    let transport = ScriptedTransport::always(503).cancel_after(1, cancel.clone());
    let h = harness(config, transport);

    let result = h.run_with(records(5), cancel).await.unwrap();

    assert!(result.interrupted);
    assert_eq!(result.success, 0);
    assert_eq!(result.permanent_failure, 0);
    assert_eq!(h.transport.calls().len(), 1);
}

#[tokio::test]
async fn unwritable_checkpoint_halts_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("progress.json");
    let config = EngineConfig {
        checkpoint: CheckpointConfig { interval: 1, ..checkpoint_config(&path) },
        ..base_config()
    };
    let h = harness(config, ScriptedTransport::new());

    let error = h.run_with(records(5), CancellationToken::new()).await.unwrap_err();

    assert!(matches!(error, DeliveryError::CheckpointWrite { .. }));
}

#[tokio::test]
async fn source_failure_is_fatal() {
    let h = harness(EngineConfig { chunk_size: 4, ..base_config() }, ScriptedTransport::new());
    let source = VecRecordSource::new(SOURCE, records(10)).failing_at(6);

    let error = h.engine.run(Box::new(source), CancellationToken::new()).await.unwrap_err();

    assert!(matches!(error, DeliveryError::RecordIo { .. }));
}

#[tokio::test]
async fn rate_limit_spaces_requests() {
    let config = EngineConfig {
        batch_size: 1,
        rate_limit: Some(RateLimitConfig { requests_per_second: 2.0, burst: 1 }),
        ..base_config()
    };
    let h = harness(config, ScriptedTransport::new());

    let result = h.run(records(5)).await;

    assert_eq!(result.success, 5);
    assert!(h.clock.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn many_workers_account_for_every_record() {
    let config = EngineConfig { worker_count: 8, batch_size: 7, ..base_config() };
    let transport = ScriptedTransport::new().then_status(503).then_status(429).then_status(502);
    let h = harness(config, transport);

    let result = h.run(records(200)).await;

    assert_eq!(result.success, 200);
    Invariants::all_accounted(&result).unwrap();
    Invariants::no_double_delivery(&h.transport.offsets_sent_ok()).unwrap();
    assert_eq!(h.engine.stats().await.active_workers, 0);
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
    let result = DeliveryEngine::new(
        EngineConfig { batch_size: 0, ..Default::default() },
        Arc::new(ScriptedTransport::new()),
        Arc::new(MemoryFailureCollector::new()),
        clock,
    );

    assert!(matches!(result, Err(DeliveryError::ConfigurationError { .. })));
}
