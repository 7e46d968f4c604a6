//! In-memory record source with chunk instrumentation.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use rowcast_core::{CoreError, Record, RecordSource, Result};

/// Counters shared between a [`VecRecordSource`] and the test that owns it.
///
/// The source is moved into the engine, so tests keep the counters instead.
#[derive(Debug, Clone, Default)]
pub struct ChunkCounters {
    largest: Arc<AtomicUsize>,
    chunks: Arc<AtomicUsize>,
    skipped_to: Arc<AtomicU64>,
}

impl ChunkCounters {
    /// Size of the largest chunk handed out.
    pub fn largest_chunk(&self) -> usize {
        self.largest.load(Ordering::SeqCst)
    }

    /// Number of non-empty chunks handed out.
    pub fn chunks(&self) -> usize {
        self.chunks.load(Ordering::SeqCst)
    }

    /// Offset passed to the last `skip_to` call.
    pub fn skipped_to(&self) -> u64 {
        self.skipped_to.load(Ordering::SeqCst)
    }
}

/// Serves pre-built records in chunks.
#[derive(Debug)]
pub struct VecRecordSource {
    name: String,
    records: Vec<Record>,
    position: usize,
    fail_at: Option<u64>,
    chunk_delay: Option<Duration>,
    counters: ChunkCounters,
}

impl VecRecordSource {
    /// Creates a source named `name` over `records`, in order.
    pub fn new(name: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            name: name.into(),
            records,
            position: 0,
            fail_at: None,
            chunk_delay: None,
            counters: ChunkCounters::default(),
        }
    }

    /// Blocks the reading thread for `delay` before each chunk, like a slow disk.
    #[must_use]
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Makes the read that would return `offset` fail instead.
    #[must_use]
    pub fn failing_at(mut self, offset: u64) -> Self {
        self.fail_at = Some(offset);
        self
    }

    /// Handle for inspecting chunking after the source is moved.
    pub fn counters(&self) -> ChunkCounters {
        self.counters.clone()
    }
}

impl RecordSource for VecRecordSource {
    fn next_chunk(&mut self, max: usize) -> Result<Option<Vec<Record>>> {
        if let Some(delay) = self.chunk_delay {
            std::thread::sleep(delay);
        }

        let end = self.records.len().min(self.position.saturating_add(max.max(1)));
        let chunk: Vec<Record> = self.records[self.position..end].to_vec();

        if let Some(offset) = self.fail_at {
            if chunk.iter().any(|record| record.offset() == offset) {
                return Err(CoreError::Source(format!("injected read failure at offset {offset}")));
            }
        }

        self.position = end;
        if chunk.is_empty() {
            return Ok(None);
        }

        self.counters.chunks.fetch_add(1, Ordering::SeqCst);
        self.counters.largest.fetch_max(chunk.len(), Ordering::SeqCst);
        Ok(Some(chunk))
    }

    fn skip_to(&mut self, offset: u64) -> Result<()> {
        self.counters.skipped_to.store(offset, Ordering::SeqCst);
        while self.position < self.records.len() && self.records[self.position].offset() < offset {
            self.position += 1;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::records;

    #[test]
    fn chunks_respect_max() {
        let mut source = VecRecordSource::new("mem", records(25));
        let counters = source.counters();

        let mut seen = 0;
        while let Some(chunk) = source.next_chunk(10).unwrap() {
            seen += chunk.len();
        }

        assert_eq!(seen, 25);
        assert_eq!(counters.largest_chunk(), 10);
        assert_eq!(counters.chunks(), 3);
    }

    #[test]
    fn skip_to_drops_earlier_offsets() {
        let mut source = VecRecordSource::new("mem", records(5));
        source.skip_to(3).unwrap();

        let chunk = source.next_chunk(10).unwrap().unwrap();
        assert_eq!(chunk.iter().map(Record::offset).collect::<Vec<_>>(), vec![3, 4]);
    }
}
