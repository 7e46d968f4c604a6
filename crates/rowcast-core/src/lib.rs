//! Record model, identity keys and I/O interfaces for rowcast.
//!
//! Everything the delivery engine needs that does not touch the network:
//! the immutable [`Record`] and its [`IdentityKey`], the [`Clock`]
//! abstraction, and the [`RecordSource`] / [`FailureCollector`] capability
//! traits with their CSV implementations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod collector;
pub mod error;
pub mod identity;
pub mod models;
pub mod source;
pub mod time;

pub use collector::{CsvFailureFile, FailureCollector, MemoryFailureCollector};
pub use error::{CoreError, Result};
pub use identity::{IdentityConfig, IdentityMode, IdentityResolver};
pub use models::{
    Batch, DeliveryOutcome, FailedRecord, FailureReason, IdentityKey, KeyedRecord, Record,
};
pub use source::{CsvRecordSource, RecordSource};
pub use time::{Clock, RealClock, TestClock};
