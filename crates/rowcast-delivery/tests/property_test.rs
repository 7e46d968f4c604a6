//! Property-based tests for batching, backoff and progress tracking.

use std::{collections::BTreeSet, time::Duration};

use proptest::prelude::*;
use rowcast_core::IdentityKey;
use rowcast_delivery::{BatchAssembler, DedupCache, ProgressTracker, RetryPolicy};
use rowcast_testing::strategies::keyed_records_strategy;

proptest! {
    #[test]
    fn assembler_preserves_every_record(
        records in keyed_records_strategy(300),
        batch_size in 1usize..64,
    ) {
        let now = std::time::Instant::now();
        let mut assembler = BatchAssembler::new(batch_size, None);
        let mut batches = Vec::new();
        for record in records.clone() {
            batches.extend(assembler.push(record, now));
        }
        batches.extend(assembler.finish());

        let mut emitted: Vec<u64> = batches.iter().flat_map(|b| b.offsets().collect::<Vec<_>>()).collect();
        emitted.sort_unstable();
        let expected: Vec<u64> = records.iter().map(|r| r.record.offset()).collect();

        prop_assert_eq!(emitted, expected);
        prop_assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= batch_size));
        let seqs: BTreeSet<u64> = batches.iter().map(|b| b.seq()).collect();
        prop_assert_eq!(seqs.len(), batches.len());
    }

    #[test]
    fn backoff_never_exceeds_cap(
        attempt in 1u32..40,
        base_ms in 1u64..5_000,
        cap_ms in 1u64..120_000,
        jitter in 0.0f64..2.0,
        hint_ms in proptest::option::of(0u64..600_000),
    ) {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(cap_ms),
            jitter_factor: jitter,
            ..Default::default()
        };

        let delay = policy.backoff_delay(attempt, hint_ms.map(Duration::from_millis));
        prop_assert!(delay <= policy.max_delay);
    }

    #[test]
    fn watermark_only_covers_completed_prefix(
        order in Just((0u64..60).collect::<Vec<_>>()).prop_shuffle(),
        done in 0usize..60,
    ) {
        let mut tracker = ProgressTracker::new(0, 0);
        let completed: BTreeSet<u64> = order[..done].iter().copied().collect();
        for offset in &order[..done] {
            tracker.complete(*offset);
        }

        let watermark = tracker.next_offset();
        prop_assert!((0..watermark).all(|offset| completed.contains(&offset)));
        prop_assert!(!completed.contains(&watermark));
        prop_assert_eq!(tracker.records_completed(), done as u64);
    }

    #[test]
    fn dedup_admits_first_occurrence_only(keys in proptest::collection::vec(0u8..16, 1..200)) {
        let cache = DedupCache::new(true);
        let mut seen = BTreeSet::new();

        for key in keys {
            let admitted = cache.observe(IdentityKey::from_bytes([key; 32]));
            prop_assert_eq!(admitted, seen.insert(key));
        }
        prop_assert_eq!(cache.len(), seen.len());
    }
}

#[test]
fn backoff_grows_in_expectation() {
    let policy = RetryPolicy {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(3600),
        ..Default::default()
    };

    let mean = |attempt: u32| -> Duration {
        let total: Duration = (0..200).map(|_| policy.backoff_delay(attempt, None)).sum();
        total / 200
    };

    let means: Vec<Duration> = (1..=5).map(mean).collect();
    assert!(means.windows(2).all(|pair| pair[0] < pair[1]), "means: {means:?}");
}
