//! In-run deduplication of identity keys.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashSet;
use rowcast_core::IdentityKey;
use tracing::debug;

/// Concurrent set of identity keys seen during the current run.
///
/// Never persisted: a resumed run starts empty and relies on the checkpoint
/// to skip delivered records.
#[derive(Debug)]
pub struct DedupCache {
    enabled: bool,
    seen: DashSet<IdentityKey>,
    duplicates: AtomicU64,
}

impl DedupCache {
    /// Creates an empty cache. A disabled cache admits every key.
    pub fn new(enabled: bool) -> Self {
        Self { enabled, seen: DashSet::new(), duplicates: AtomicU64::new(0) }
    }

    /// Returns `true` on first sight of `key`, `false` on a repeat.
    pub fn observe(&self, key: IdentityKey) -> bool {
        if !self.enabled {
            return true;
        }

        if self.seen.insert(key) {
            true
        } else {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "duplicate record skipped");
            false
        }
    }

    /// Number of repeats rejected so far.
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Number of distinct keys admitted.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether no key has been admitted yet.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
