//! Adaptive cap on in-flight deliveries.
//!
//! Additive increase, multiplicative decrease: the limit halves when the
//! remote pushes back and grows by one after a streak of clean deliveries.
//! It never drops below 1 or exceeds the worker count.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::error::{DeliveryError, Result};

/// Clean deliveries needed before the limit grows by one.
pub const DEFAULT_INCREASE_AFTER: u32 = 10;

#[derive(Debug)]
struct LimitState {
    limit: usize,
    /// Permits still to be retired as they are released.
    debt: usize,
    streak: u32,
}

#[derive(Debug)]
struct Inner {
    semaphore: Arc<Semaphore>,
    max: usize,
    enabled: bool,
    increase_after: u32,
    state: Mutex<LimitState>,
}

impl Inner {
    fn state(&self) -> std::sync::MutexGuard<'_, LimitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Semaphore whose size follows delivery health.
#[derive(Debug, Clone)]
pub struct AdaptiveLimiter {
    inner: Arc<Inner>,
}

/// Slot for one in-flight delivery; released on drop.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<Inner>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };

        let mut state = self.inner.state();
        if state.debt > 0 {
            state.debt -= 1;
            permit.forget();
        }
    }
}

impl AdaptiveLimiter {
    /// Creates a limiter starting at `max` slots. A disabled limiter stays
    /// at `max` forever.
    pub fn new(max: usize, enabled: bool) -> Self {
        Self::with_increase_after(max, enabled, DEFAULT_INCREASE_AFTER)
    }

    /// Like [`new`](Self::new) with a custom growth streak.
    pub fn with_increase_after(max: usize, enabled: bool, increase_after: u32) -> Self {
        let max = max.max(1);
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(max)),
                max,
                enabled,
                increase_after: increase_after.max(1),
                state: Mutex::new(LimitState { limit: max, debt: 0, streak: 0 }),
            }),
        }
    }

    /// Waits for a free slot.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownRequested` if the limiter was closed.
    pub async fn acquire(&self) -> Result<ConcurrencyPermit> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| DeliveryError::ShutdownRequested)?;
        Ok(ConcurrencyPermit { permit: Some(permit), inner: Arc::clone(&self.inner) })
    }

    /// Current limit.
    pub fn limit(&self) -> usize {
        self.inner.state().limit
    }

    /// Signals a clean delivery.
    pub fn on_success(&self) {
        if !self.inner.enabled {
            return;
        }

        let mut state = self.inner.state();
        state.streak += 1;
        if state.streak < self.inner.increase_after || state.limit >= self.inner.max {
            return;
        }

        state.streak = 0;
        state.limit += 1;
        if state.debt > 0 {
            state.debt -= 1;
        } else {
            self.inner.semaphore.add_permits(1);
        }
        debug!(limit = state.limit, "concurrency limit increased");
    }

    /// Signals that the remote pushed back (throttling or transient failure).
    pub fn on_backpressure(&self) {
        if !self.inner.enabled {
            return;
        }

        let mut state = self.inner.state();
        state.streak = 0;
        let target = (state.limit / 2).max(1);
        let shrink = state.limit - target;
        if shrink == 0 {
            return;
        }

        state.limit = target;
        let forgotten = self.inner.semaphore.forget_permits(shrink);
        state.debt += shrink - forgotten;
        info!(limit = target, "concurrency limit reduced after remote backpressure");
    }

    /// Wakes every waiter with an error; used during shutdown.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backpressure_halves_and_streak_grows() {
        let limiter = AdaptiveLimiter::with_increase_after(8, true, 2);

        limiter.on_backpressure();
        assert_eq!(limiter.limit(), 4);
        limiter.on_backpressure();
        limiter.on_backpressure();
        limiter.on_backpressure();
        assert_eq!(limiter.limit(), 1);

        limiter.on_success();
        assert_eq!(limiter.limit(), 1);
        limiter.on_success();
        assert_eq!(limiter.limit(), 2);
    }

    #[tokio::test]
    async fn limit_never_exceeds_max() {
        let limiter = AdaptiveLimiter::with_increase_after(2, true, 1);
        for _ in 0..10 {
            limiter.on_success();
        }
        assert_eq!(limiter.limit(), 2);
    }

    #[tokio::test]
    async fn held_permits_are_retired_on_release() {
        let limiter = AdaptiveLimiter::new(4, true);
        let held: Vec<_> = {
            let mut held = Vec::new();
            for _ in 0..4 {
                held.push(limiter.acquire().await.unwrap());
            }
            held
        };

        limiter.on_backpressure();
        drop(held);

        let first = limiter.acquire().await.unwrap();
        let second = limiter.acquire().await.unwrap();
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), limiter.acquire())
            .await
            .is_err());
        drop((first, second));
    }

    #[tokio::test]
    async fn disabled_limiter_ignores_signals() {
        let limiter = AdaptiveLimiter::new(3, false);
        limiter.on_backpressure();
        assert_eq!(limiter.limit(), 3);
    }

    #[tokio::test]
    async fn closed_limiter_rejects_waiters() {
        let limiter = AdaptiveLimiter::new(1, true);
        limiter.close();
        assert!(matches!(limiter.acquire().await, Err(DeliveryError::ShutdownRequested)));
    }
}
