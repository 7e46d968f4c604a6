//! Resilient delivery of records to a rate-limited remote API.
//!
//! This crate implements the delivery engine that streams records from a
//! [`RecordSource`](rowcast_core::RecordSource), drops duplicates, groups the
//! rest into batches and delivers them with exponential backoff, a shared
//! circuit breaker and checkpointed progress.
//!
//! # Architecture
//!
//! A producer task reads the source on the blocking pool and pushes batches
//! into a bounded channel. A pool of async workers drains it. Each worker
//! handles the complete delivery lifecycle of one batch:
//!
//! 1. **Concurrency Permit** - Adaptive limiter caps in-flight deliveries
//! 2. **Rate Limit** - Token bucket shared by all workers
//! 3. **Circuit Check** - Fail fast while the remote is unhealthy
//! 4. **Delivery** - One transport call, classified and retried as needed
//! 5. **Progress** - Terminal records advance the checkpoint watermark
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rowcast_core::{CsvRecordSource, MemoryFailureCollector, RealClock};
//! use rowcast_delivery::{
//!     DeliveryEngine, DeliveryError, EngineConfig, HttpTransport, HttpTransportConfig,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> std::result::Result<(), DeliveryError> {
//! let clock = Arc::new(RealClock::new());
//! let transport = HttpTransport::new(
//!     HttpTransportConfig { api_key: "key".into(), api_secret: "secret".into(), ..Default::default() },
//!     clock.clone(),
//! )?;
//! let engine = DeliveryEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(transport),
//!     Arc::new(MemoryFailureCollector::new()),
//!     clock,
//! )?;
//!
//! let source = CsvRecordSource::open("signups.csv", &["email".to_string()])?;
//! let result = engine.run(Box::new(source), CancellationToken::new()).await?;
//! println!("{result}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batch;
pub mod checkpoint;
pub mod circuit;
pub mod client;
pub mod concurrency;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod http;
pub mod rate_limit;
pub mod retry;
pub mod transport;
mod worker;
mod worker_pool;

// Re-export main public API
pub use batch::BatchAssembler;
pub use checkpoint::{Checkpoint, CheckpointConfig, CheckpointManager, ProgressTracker};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState, CircuitStats};
pub use client::{DeliveryClient, DeliveryReport};
pub use concurrency::AdaptiveLimiter;
pub use dedup::DedupCache;
pub use engine::{DeliveryEngine, EngineConfig, RunResult, SecondPassConfig};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use http::{DataCenter, Environment, HttpTransport, HttpTransportConfig};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use transport::{ItemResult, Transport, TransportError, TransportResponse};
pub use worker::EngineStats;

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 10;

/// Default number of records per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default number of batches buffered ahead of the workers.
pub const DEFAULT_QUEUE_CAPACITY: usize = 20;

/// Default number of records read from the source at a time.
pub const DEFAULT_CHUNK_SIZE: usize = 1_000;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
