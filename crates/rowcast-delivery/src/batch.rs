//! Groups accepted records into bounded batches.

use std::time::{Duration, Instant};

use rowcast_core::{Batch, KeyedRecord};

/// Accumulates records and emits a [`Batch`] when it is full or stale.
///
/// A batch is stale once `flush_interval` has elapsed since its first record
/// was pushed. Every record pushed ends up in exactly one emitted batch.
#[derive(Debug)]
pub struct BatchAssembler {
    batch_size: usize,
    flush_interval: Option<Duration>,
    pending: Vec<KeyedRecord>,
    first_pending_at: Option<Instant>,
    next_seq: u64,
}

impl BatchAssembler {
    /// Creates an assembler. A `batch_size` of 0 is treated as 1.
    pub fn new(batch_size: usize, flush_interval: Option<Duration>) -> Self {
        Self::starting_at(batch_size, flush_interval, 0)
    }

    /// Creates an assembler whose first batch gets sequence number `seq`.
    pub fn starting_at(batch_size: usize, flush_interval: Option<Duration>, seq: u64) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            flush_interval,
            pending: Vec::with_capacity(batch_size),
            first_pending_at: None,
            next_seq: seq,
        }
    }

    /// Adds a record; returns a batch when it reaches `batch_size`.
    pub fn push(&mut self, record: KeyedRecord, now: Instant) -> Option<Batch> {
        if self.pending.is_empty() {
            self.first_pending_at = Some(now);
        }
        self.pending.push(record);

        if self.pending.len() >= self.batch_size {
            self.take()
        } else {
            None
        }
    }

    /// Emits the pending records if the flush interval has elapsed.
    pub fn flush_due(&mut self, now: Instant) -> Option<Batch> {
        let interval = self.flush_interval?;
        let started = self.first_pending_at?;
        if now.saturating_duration_since(started) >= interval {
            self.take()
        } else {
            None
        }
    }

    /// When the pending records become stale, if a flush interval is set.
    pub fn flush_deadline(&self) -> Option<Instant> {
        Some(self.first_pending_at? + self.flush_interval?)
    }

    /// Emits the trailing partial batch, if any.
    pub fn finish(&mut self) -> Option<Batch> {
        self.take()
    }

    /// Records waiting for the next batch.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Sequence number the next batch will carry.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    fn take(&mut self) -> Option<Batch> {
        if self.pending.is_empty() {
            return None;
        }

        let items = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
        self.first_pending_at = None;
        let batch = Batch::new(self.next_seq, items);
        self.next_seq += 1;
        Some(batch)
    }
}
