//! Process-wide circuit breaker guarding the remote API.
//!
//! Fails fast during outages and gradually tests recovery. All workers share
//! one breaker; every time decision goes through the injected [`Clock`].
//!
//! # Circuit Breaker State Machine
//!
//! ```text
//!                          ┌──────────────────────────┐
//!                          │         CLOSED           │
//!                          │    (Normal Operation)    │
//!                          │                          │
//!                          │ ● All requests allowed   │
//!                          │ ● Failures kept in a     │
//!                          │   trailing window        │
//!                          └──────────────────────────┘
//!                           │                        ▲
//!          threshold        │                        │ success_threshold
//!          failures within  │                        │ successes
//!          failure_window   ▼                        │
//!    ┌─────────────────────────┐                  ┌───────────────────────┐
//!    │         OPEN            │                  │       HALF-OPEN       │
//!    │      (Fail Fast)        │   open_timeout   │   (Testing Recovery)  │
//!    │                         │ ───────────────▶ │                       │
//!    │ ● CircuitOpen returned  │                  │ ● Limited trial calls │
//!    └─────────────────────────┘ ◀─────────────── └───────────────────────┘
//!                                   any failure
//! ```

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use rowcast_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{DeliveryError, Result};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Failures inside `failure_window` that open the circuit.
    pub failure_threshold: u32,
    /// Trailing window in which failures are counted.
    pub failure_window: Duration,
    /// Time to wait before transitioning from Open to Half-Open.
    pub open_timeout: Duration,
    /// Number of consecutive successes to close circuit from Half-Open.
    pub success_threshold: u32,
    /// Maximum number of trial calls in flight while Half-Open.
    pub half_open_max_requests: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
            success_threshold: 3,
            half_open_max_requests: 3,
        }
    }
}

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - all requests allowed.
    Closed,
    /// Remote unhealthy - requests fail immediately.
    Open,
    /// Testing recovery - limited requests allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Snapshot of the breaker's statistics.
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Current circuit state.
    pub state: CircuitState,
    /// Failures inside the trailing window.
    pub recent_failures: u32,
    /// Consecutive successes while Half-Open.
    pub consecutive_successes: u32,
    /// Trial calls currently in flight while Half-Open.
    pub half_open_in_flight: u32,
    /// Outcomes recorded since creation.
    pub total_requests: u64,
    /// Failed outcomes recorded since creation.
    pub failed_requests: u64,
    /// Number of times the circuit opened.
    pub times_opened: u64,
    /// When circuit was last opened.
    pub last_opened_at: Option<Instant>,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    total_requests: u64,
    failed_requests: u64,
    times_opened: u64,
    last_opened_at: Option<Instant>,
}

impl CircuitInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            consecutive_successes: 0,
            half_open_in_flight: 0,
            total_requests: 0,
            failed_requests: 0,
            times_opened: 0,
            last_opened_at: None,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> CircuitStats {
        CircuitStats {
            state: self.state,
            recent_failures: u32::try_from(self.failures.len()).unwrap_or(u32::MAX),
            consecutive_successes: self.consecutive_successes,
            half_open_in_flight: self.half_open_in_flight,
            total_requests: self.total_requests,
            failed_requests: self.failed_requests,
            times_opened: self.times_opened,
            last_opened_at: self.last_opened_at,
        }
    }
}

/// Thread-safe circuit breaker shared by all delivery workers.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    /// Creates a closed circuit breaker.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, inner: Mutex::new(CircuitInner::new()) }
    }

    /// Determines if a call may proceed.
    ///
    /// Moves Open to Half-Open once the cooldown has elapsed. A `true` result
    /// in Half-Open reserves one trial slot, released by the matching
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    #[allow(clippy::significant_drop_tightening)] // Atomic state transition with check required
    pub async fn should_allow_request(&self) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        if inner.state == CircuitState::Open {
            let cooled_down = inner
                .last_opened_at
                .is_some_and(|opened| now.saturating_duration_since(opened) >= self.config.open_timeout);
            if cooled_down {
                Self::transition_to_half_open(&mut inner);
            }
        }

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_requests {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            },
        }
    }

    /// Records a call that shows the remote is healthy.
    #[allow(clippy::significant_drop_tightening)] // Atomic state transition required
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.total_requests += 1;

        match inner.state {
            CircuitState::Closed => inner.failures.clear(),
            CircuitState::Open => {
                debug!("success recorded for a call admitted before the circuit opened");
            },
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.consecutive_successes += 1;

                if inner.consecutive_successes >= self.config.success_threshold {
                    Self::transition_to_closed(&mut inner);
                }
            },
        }
    }

    /// Records a call that failed because of the remote.
    #[allow(clippy::significant_drop_tightening)] // Atomic state transition required
    pub async fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        inner.total_requests += 1;
        inner.failed_requests += 1;
        inner.consecutive_successes = 0;

        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                inner.prune(now, self.config.failure_window);
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    self.transition_to_open(&mut inner, now);
                }
            },
            CircuitState::Open => {},
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                self.transition_to_open(&mut inner, now);
            },
        }
    }

    /// Current state, without applying the cooldown transition.
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Returns current circuit breaker statistics.
    pub async fn stats(&self) -> CircuitStats {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        inner.prune(now, self.config.failure_window);
        inner.snapshot()
    }

    /// Forces the circuit to the specified state (for testing/admin purposes).
    #[allow(clippy::significant_drop_tightening)] // Atomic state change required
    pub async fn force_state(&self, state: CircuitState) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        match state {
            CircuitState::Open => self.transition_to_open(&mut inner, now),
            CircuitState::HalfOpen => Self::transition_to_half_open(&mut inner),
            CircuitState::Closed => Self::transition_to_closed(&mut inner),
        }
    }

    /// Returns `CircuitOpen` if the call should be short-circuited.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::CircuitOpen` when the breaker rejects the call.
    pub async fn check(&self) -> Result<()> {
        if self.should_allow_request().await {
            Ok(())
        } else {
            Err(DeliveryError::CircuitOpen)
        }
    }

    fn transition_to_open(&self, inner: &mut CircuitInner, now: Instant) {
        error!(
            recent_failures = inner.failures.len(),
            cooldown_ms = u64::try_from(self.config.open_timeout.as_millis()).unwrap_or(u64::MAX),
            "circuit breaker opening, remote is failing"
        );

        inner.state = CircuitState::Open;
        inner.last_opened_at = Some(now);
        inner.times_opened += 1;
        inner.consecutive_successes = 0;
        inner.half_open_in_flight = 0;
    }

    fn transition_to_half_open(inner: &mut CircuitInner) {
        info!("circuit breaker transitioning to half-open");

        inner.state = CircuitState::HalfOpen;
        inner.half_open_in_flight = 0;
        inner.consecutive_successes = 0;
    }

    fn transition_to_closed(inner: &mut CircuitInner) {
        info!("circuit breaker closing, remote recovered");

        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.consecutive_successes = 0;
        inner.half_open_in_flight = 0;
    }
}

#[cfg(test)]
mod tests {
    use rowcast_core::TestClock;

    use super::*;

    fn test_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(10),
            open_timeout: Duration::from_secs(5),
            success_threshold: 2,
            half_open_max_requests: 2,
        }
    }

    fn breaker() -> (CircuitBreaker, TestClock) {
        let clock = TestClock::new();
        (CircuitBreaker::new(test_config(), Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn circuit_starts_closed() {
        let (breaker, _) = breaker();
        assert!(breaker.should_allow_request().await);
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn threshold_failures_open_circuit() {
        let (breaker, _) = breaker();

        for _ in 0..2 {
            breaker.record_failure().await;
            assert!(breaker.should_allow_request().await);
        }

        breaker.record_failure().await;
        assert!(!breaker.should_allow_request().await);
        assert!(matches!(breaker.check().await, Err(DeliveryError::CircuitOpen)));

        let stats = breaker.stats().await;
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.times_opened, 1);
    }

    #[tokio::test]
    async fn failures_outside_window_are_forgotten() {
        let (breaker, clock) = breaker();

        breaker.record_failure().await;
        breaker.record_failure().await;
        clock.advance(Duration::from_secs(11));
        breaker.record_failure().await;

        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.stats().await.recent_failures, 1);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let (breaker, _) = breaker();

        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_failure().await;

        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.stats().await.recent_failures, 1);
    }

    #[tokio::test]
    async fn cooldown_moves_to_half_open_and_successes_close() {
        let (breaker, clock) = breaker();
        breaker.force_state(CircuitState::Open).await;

        clock.advance(Duration::from_secs(4));
        assert!(!breaker.should_allow_request().await);

        clock.advance(Duration::from_secs(1));
        assert!(breaker.should_allow_request().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        assert!(breaker.should_allow_request().await);
        breaker.record_success().await;

        let stats = breaker.stats().await;
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.recent_failures, 0);
    }

    #[tokio::test]
    async fn half_open_limits_trial_calls() {
        let (breaker, _) = breaker();
        breaker.force_state(CircuitState::HalfOpen).await;

        assert!(breaker.should_allow_request().await);
        assert!(breaker.should_allow_request().await);
        assert!(!breaker.should_allow_request().await);

        breaker.record_success().await;
        assert!(breaker.should_allow_request().await);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_and_restarts_cooldown() {
        let (breaker, clock) = breaker();
        breaker.force_state(CircuitState::Open).await;
        clock.advance(Duration::from_secs(5));
        assert!(breaker.should_allow_request().await);

        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        clock.advance(Duration::from_secs(3));
        assert!(!breaker.should_allow_request().await);
        clock.advance(Duration::from_secs(2));
        assert!(breaker.should_allow_request().await);
    }
}
