//! Test infrastructure and utilities for deterministic testing.
//!
//! Provides in-memory record sources, a scripted transport, record fixtures
//! and property-based testing strategies. Combined with [`TestClock`], runs
//! of the delivery engine finish without real sleeps or network access.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod fixtures;
pub mod invariants;
pub mod source;
pub mod strategies;
pub mod transport;

pub use fixtures::{keyed, records, signup, RecordBuilder};
pub use invariants::Invariants;
pub use rowcast_core::{Clock, MemoryFailureCollector, TestClock};
pub use source::{ChunkCounters, VecRecordSource};
pub use transport::{ScriptedTransport, TransportCall};
