//! Batch delivery with rate limiting, circuit breaking and retry.
//!
//! Each attempt takes a rate limiter token, asks the circuit breaker for a
//! permit, performs one transport call and classifies what came back.
//! Transient failures never leave the client until the retry policy gives up;
//! the caller then receives the undelivered records as a pending remainder.

use std::{collections::HashMap, sync::Arc, time::Duration};

use rowcast_core::{Batch, Clock, DeliveryOutcome, FailedRecord, FailureReason, KeyedRecord};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    circuit::CircuitBreaker,
    error::DeliveryError,
    rate_limit::RateLimiter,
    retry::{RetryDecision, RetryPolicy, RetryState},
    transport::{Transport, TransportResponse},
};

/// A record the remote accepted.
#[derive(Debug, Clone)]
pub struct AcceptedRecord {
    /// The delivered record.
    pub record: KeyedRecord,
    /// Attempt on which it was accepted (1-based).
    pub attempt: u32,
}

/// Records still undelivered when the client stopped trying.
#[derive(Debug, Clone)]
pub struct PendingRetry {
    /// Undelivered records, keeping the original sequence number.
    pub batch: Batch,
    /// Attempts spent on them.
    pub attempts: u32,
    /// Last transient error seen.
    pub last_error: String,
}

/// Everything that happened to one batch.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    /// Records the remote accepted.
    pub accepted: Vec<AcceptedRecord>,
    /// Records the remote rejected permanently.
    pub rejected: Vec<FailedRecord>,
    /// Records left after retries ran out or shutdown interrupted a wait.
    pub pending: Option<PendingRetry>,
    /// Attempts made.
    pub attempts: u32,
    /// Transient failures seen along the way.
    pub transient_failures: u32,
    /// Whether cancellation cut the retry loop short.
    pub interrupted: bool,
}

impl DeliveryReport {
    /// Records accepted after at least one failed attempt.
    pub fn recovered(&self) -> usize {
        self.accepted.iter().filter(|accepted| accepted.attempt > 1).count()
    }

    /// Batch-level outcome: success only when every record was accepted.
    pub fn outcome(&self) -> DeliveryOutcome {
        if let Some(pending) = &self.pending {
            DeliveryOutcome::RetryableFailure { reason: pending.last_error.clone(), retry_after: None }
        } else if let Some(first) = self.rejected.first() {
            DeliveryOutcome::PermanentFailure { reason: first.reason.to_string() }
        } else {
            DeliveryOutcome::Success
        }
    }
}

/// Delivers batches through a [`Transport`].
pub struct DeliveryClient {
    transport: Arc<dyn Transport>,
    circuit: Arc<CircuitBreaker>,
    rate_limiter: Option<Arc<RateLimiter>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DeliveryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryClient")
            .field("rate_limited", &self.rate_limiter.is_some())
            .finish_non_exhaustive()
    }
}

enum AttemptResult {
    Done,
    Retry { remaining: Batch, error: DeliveryError },
}

impl DeliveryClient {
    /// Creates a client sharing the given breaker and limiter.
    pub fn new(
        transport: Arc<dyn Transport>,
        circuit: Arc<CircuitBreaker>,
        rate_limiter: Option<Arc<RateLimiter>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { transport, circuit, rate_limiter, clock }
    }

    /// Delivers `batch`, retrying transient failures under `policy`.
    ///
    /// Returns once every record is accepted, rejected, or left pending.
    /// Once `cancel` fires no new attempt starts and backoff and rate limit
    /// waits are abandoned; a transport call already in flight completes.
    pub async fn deliver(
        &self,
        batch: Batch,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut state = RetryState::new(policy.clone(), self.clock.now());
        let mut remaining = batch;

        loop {
            if state.next_attempt_at() > self.clock.now() {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        return Self::interrupt(report, remaining, &state);
                    },
                    () = self.clock.sleep_until(state.next_attempt_at()) => {},
                }
            }

            if let Some(limiter) = &self.rate_limiter {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        return Self::interrupt(report, remaining, &state);
                    },
                    () = limiter.acquire() => {},
                }
            }

            if cancel.is_cancelled() {
                return Self::interrupt(report, remaining, &state);
            }

            let attempt = state.attempt();
            report.attempts = attempt;

            let result = match self.circuit.check().await {
                Err(error) => AttemptResult::Retry { remaining, error },
                Ok(()) => self.attempt(remaining, attempt, &mut report).await,
            };

            let (rest, error) = match result {
                AttemptResult::Done => return report,
                AttemptResult::Retry { remaining, error } => (remaining, error),
            };
            remaining = rest;
            report.transient_failures += 1;

            let last_error = error.to_string();
            let category = error.category();
            match state.on_failure(error, self.clock.now()) {
                RetryDecision::Retry { next_attempt_at } => {
                    let delay = next_attempt_at.saturating_duration_since(self.clock.now());
                    warn!(
                        batch_seq = remaining.seq(),
                        records = remaining.len(),
                        attempt,
                        delay_ms = millis(delay),
                        %category,
                        error = %last_error,
                        "delivery attempt failed, backing off"
                    );
                },
                RetryDecision::GiveUp { reason } => {
                    warn!(
                        batch_seq = remaining.seq(),
                        records = remaining.len(),
                        attempts = attempt,
                        %reason,
                        %category,
                        error = %last_error,
                        "giving up on batch for this pass"
                    );
                    report.pending =
                        Some(PendingRetry { batch: remaining, attempts: attempt, last_error });
                    return report;
                },
            }
        }
    }

    async fn attempt(&self, batch: Batch, attempt: u32, report: &mut DeliveryReport) -> AttemptResult {
        let response = match self.transport.send(&batch, attempt).await {
            Ok(response) => response,
            Err(error) => {
                let error = DeliveryError::from(error);
                self.record_circuit(Some(&error)).await;
                return AttemptResult::Retry { remaining: batch, error };
            },
        };

        let error = DeliveryError::from_status(response.status, &response.body, response.retry_after);
        self.record_circuit(error.as_ref()).await;

        match error {
            None => Self::split_partial(batch, attempt, response, report),
            Some(error) if error.is_retryable() => AttemptResult::Retry { remaining: batch, error },
            Some(error) => {
                debug!(batch_seq = batch.seq(), status = response.status, %error, "batch rejected");
                let reason =
                    FailureReason::Rejected { status: response.status, message: response.body };
                report.rejected.extend(batch.into_items().into_iter().map(|item| FailedRecord {
                    key: Some(item.key),
                    record: item.record,
                    reason: reason.clone(),
                }));
                AttemptResult::Done
            },
        }
    }

    /// Feeds one attempt into the circuit breaker. A client error still
    /// proves the remote is up.
    async fn record_circuit(&self, error: Option<&DeliveryError>) {
        match error {
            Some(error) if error.counts_as_remote_failure() => self.circuit.record_failure().await,
            _ => self.circuit.record_success().await,
        }
    }

    /// Applies per-record results of a 2xx response.
    fn split_partial(
        batch: Batch,
        attempt: u32,
        response: TransportResponse,
        report: &mut DeliveryReport,
    ) -> AttemptResult {
        let Some(results) = response.item_results.filter(|results| !results.is_empty()) else {
            report.accepted.extend(
                batch.into_items().into_iter().map(|record| AcceptedRecord { record, attempt }),
            );
            return AttemptResult::Done;
        };

        let mut retry_indices = Vec::new();
        let mut reasons: HashMap<u64, FailureReason> = HashMap::new();
        let mut first_retry_error = None;

        for result in &results {
            let Some(item) = batch.items().get(result.index) else {
                continue;
            };
            if result.is_accepted() {
                continue;
            }
            let message = result.message.clone().unwrap_or_default();
            match DeliveryError::from_status(result.status, &message, response.retry_after) {
                Some(error) if error.is_retryable() => {
                    retry_indices.push(result.index);
                    first_retry_error.get_or_insert(error);
                },
                _ => {
                    reasons.insert(
                        item.record.offset(),
                        FailureReason::Rejected { status: result.status, message },
                    );
                },
            }
        }

        let seq = batch.seq();
        let rejected = reasons.len();
        let (retry, rest) = batch.partition(&retry_indices);
        for item in rest.into_items() {
            match reasons.remove(&item.record.offset()) {
                Some(reason) => report.rejected.push(FailedRecord {
                    key: Some(item.key),
                    record: item.record,
                    reason,
                }),
                None => report.accepted.push(AcceptedRecord { record: item, attempt }),
            }
        }

        debug!(
            batch_seq = seq,
            rejected,
            retrying = retry.len(),
            "partial rejection in bulk response"
        );

        match first_retry_error {
            Some(error) if !retry.is_empty() => AttemptResult::Retry { remaining: retry, error },
            _ => AttemptResult::Done,
        }
    }

    fn interrupt(mut report: DeliveryReport, remaining: Batch, state: &RetryState) -> DeliveryReport {
        debug!(batch_seq = remaining.seq(), records = remaining.len(), "delivery interrupted by shutdown");
        let last_error = state
            .last_error()
            .map_or_else(|| DeliveryError::ShutdownRequested.to_string(), ToString::to_string);
        report.pending = Some(PendingRetry {
            batch: remaining,
            attempts: state.attempt().saturating_sub(1),
            last_error,
        });
        report.interrupted = true;
        report
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
