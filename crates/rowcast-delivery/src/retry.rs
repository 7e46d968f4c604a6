//! Exponential backoff retry strategies with jitter.
//!
//! Implements the per-batch retry state machine used by the delivery client.
//! Delays grow exponentially from `base_delay`, get an additive random jitter
//! proportional to the current delay, and never exceed `max_delay`. A remote
//! `Retry-After` hint replaces the computed delay but is still capped.

use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry policy configuration for batch delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts (including initial attempt).
    pub max_attempts: u32,

    /// Base delay for exponential backoff calculation.
    pub base_delay: Duration,

    /// Maximum delay between retry attempts.
    pub max_delay: Duration,

    /// Upper bound of the random extra delay, as a fraction (0.0 to 1.0) of
    /// the computed delay.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 1.0,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Policy that makes a single attempt and never waits.
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Delay before the attempt following `attempt_number` (1-based).
    ///
    /// With a `retry_after` hint the hint is used as-is, capped at
    /// `max_delay`. Otherwise the strategy's delay gets jitter in
    /// `[0, jitter_factor * delay]` added and the sum is capped.
    pub fn backoff_delay(&self, attempt_number: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }

        let base_delay = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt_number.max(1)),
            BackoffStrategy::Exponential => {
                let exponent = attempt_number.saturating_sub(1).min(20);
                self.base_delay.saturating_mul(2_u32.saturating_pow(exponent))
            },
        };

        apply_jitter(base_delay.min(self.max_delay), self.jitter_factor, self.max_delay)
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff: delay doubles each attempt.
    Exponential,
    /// Linear backoff: delay increases by base amount each attempt.
    Linear,
}

/// Retry decision context for a failed delivery attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Current attempt number (1-based).
    pub attempt_number: u32,
    /// Error that caused the delivery failure.
    pub error: DeliveryError,
    /// Instant of the failed attempt.
    pub failed_at: Instant,
    /// Retry policy to apply.
    pub policy: RetryPolicy,
}

/// Result of retry decision calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the delivery at the specified time.
    Retry {
        /// When the next delivery attempt should be made
        next_attempt_at: Instant,
    },
    /// Do not retry.
    GiveUp {
        /// Reason why the delivery should not be retried
        reason: String,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed delivery.
    pub fn new(
        attempt_number: u32,
        error: DeliveryError,
        failed_at: Instant,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempt_number, error, failed_at, policy }
    }

    /// Determines if and when to retry based on the failure context.
    pub fn decide_retry(&self) -> RetryDecision {
        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {}", self.error),
            };
        }

        if self.attempt_number >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded", self.policy.max_attempts),
            };
        }

        let delay = self.policy.backoff_delay(self.attempt_number, self.error.retry_after());
        RetryDecision::Retry { next_attempt_at: self.failed_at + delay }
    }
}

/// Explicit per-batch retry state: which attempt comes next and when.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
    next_attempt_at: Instant,
    last_error: Option<DeliveryError>,
}

impl RetryState {
    /// Starts at attempt 1, due immediately.
    pub fn new(policy: RetryPolicy, now: Instant) -> Self {
        Self { policy, attempt: 1, next_attempt_at: now, last_error: None }
    }

    /// Attempt number about to be made (1-based).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// When the next attempt is due.
    pub fn next_attempt_at(&self) -> Instant {
        self.next_attempt_at
    }

    /// Most recent failure, if any.
    pub fn last_error(&self) -> Option<&DeliveryError> {
        self.last_error.as_ref()
    }

    /// Records a failed attempt and advances the machine.
    ///
    /// On `Retry` the attempt counter and due time move forward; on `GiveUp`
    /// the state is left at the final attempt.
    pub fn on_failure(&mut self, error: DeliveryError, failed_at: Instant) -> RetryDecision {
        let decision =
            RetryContext::new(self.attempt, error.clone(), failed_at, self.policy.clone())
                .decide_retry();

        if let RetryDecision::Retry { next_attempt_at } = decision {
            self.attempt += 1;
            self.next_attempt_at = next_attempt_at;
        }
        self.last_error = Some(error);
        decision
    }
}

/// Adds a random extra delay of up to `jitter_factor * duration`, capped.
fn apply_jitter(duration: Duration, jitter_factor: f64, cap: Duration) -> Duration {
    if !(jitter_factor > 0.0) {
        return duration.min(cap);
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);
    let extra = rand::rng().random_range(0.0..=clamped_jitter);
    let jittered_secs = duration.as_secs_f64() * (1.0 + extra);

    Duration::from_secs_f64(jittered_secs.max(0.0)).min(cap)
}
