//! Token bucket shared by every delivery worker.
//!
//! One token is taken per network attempt. Waiters queue on a fair
//! `tokio::sync::Mutex`, so they are served in arrival order and none starves.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use rowcast_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::{DeliveryError, Result};

/// Token bucket parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained refill rate.
    pub requests_per_second: f64,
    /// Bucket capacity; the most tokens available at any instant.
    pub burst: u32,
}

impl RateLimitConfig {
    /// Validates the parameters.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a non-positive rate or zero burst.
    pub fn validate(&self) -> Result<()> {
        if !(self.requests_per_second > 0.0) || !self.requests_per_second.is_finite() {
            return Err(DeliveryError::configuration(format!(
                "requests_per_second must be positive, got {}",
                self.requests_per_second
            )));
        }
        if self.burst == 0 {
            return Err(DeliveryError::configuration("burst must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, rate: f64, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

/// Async token bucket driven by the injected clock.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a full bucket.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the parameters are invalid.
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let bucket = Bucket { tokens: f64::from(config.burst), last_refill: clock.now() };
        Ok(Self { config, clock, bucket: Mutex::new(bucket) })
    }

    /// Waits until a token is available and takes it.
    ///
    /// The bucket lock is held while waiting so later callers queue behind
    /// earlier ones.
    #[allow(clippy::significant_drop_tightening)] // Lock held across the wait for FIFO order
    pub async fn acquire(&self) {
        let capacity = f64::from(self.config.burst);
        let rate = self.config.requests_per_second;
        let mut bucket = self.bucket.lock().await;

        loop {
            bucket.refill(self.clock.now(), rate, capacity);
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return;
            }

            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / rate);
            trace!(wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX), "waiting for rate limit token");
            self.clock.sleep(wait).await;
        }
    }

    /// Takes a token only if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let capacity = f64::from(self.config.burst);
        let mut bucket = self.bucket.lock().await;
        bucket.refill(self.clock.now(), self.config.requests_per_second, capacity);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently in the bucket.
    pub async fn available(&self) -> f64 {
        let capacity = f64::from(self.config.burst);
        let mut bucket = self.bucket.lock().await;
        bucket.refill(self.clock.now(), self.config.requests_per_second, capacity);
        bucket.tokens
    }
}
