//! Transport seam between the delivery client and the remote API.
//!
//! A [`Transport`] performs exactly one network call per invocation and
//! reports what came back. Classification into success, retryable and
//! permanent outcomes happens in the client, so transports stay dumb.

use std::{future::Future, pin::Pin, time::Duration};

use rowcast_core::Batch;
use serde::Deserialize;
use thiserror::Error;

use crate::error::DeliveryError;

/// Per-record outcome reported inside a 2xx bulk response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ItemResult {
    /// Index of the record within the batch.
    pub index: usize,
    /// Status the remote assigned to this record.
    pub status: u16,
    /// Remote explanation, if any.
    #[serde(default)]
    pub message: Option<String>,
}

impl ItemResult {
    /// Whether the record was accepted.
    pub fn is_accepted(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Raw result of one transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Parsed `Retry-After` hint.
    pub retry_after: Option<Duration>,
    /// Per-record results, when the remote supplied them.
    pub item_results: Option<Vec<ItemResult>>,
    /// Response body, truncated for logging.
    pub body: String,
}

impl TransportResponse {
    /// Response with just a status code.
    pub fn status(status: u16) -> Self {
        Self { status, retry_after: None, item_results: None, body: String::new() }
    }

    /// Adds a `Retry-After` hint.
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Adds per-record results.
    #[must_use]
    pub fn with_item_results(mut self, item_results: Vec<ItemResult>) -> Self {
        self.item_results = Some(item_results);
        self
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure to obtain any response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No response within the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),
    /// Any other transport failure.
    #[error("transport failure: {0}")]
    Other(String),
}

impl From<TransportError> for DeliveryError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Timeout(timeout) => Self::timeout(timeout),
            TransportError::Connect(message) => Self::network(format!("connection failed: {message}")),
            TransportError::Other(message) => Self::network(message),
        }
    }
}

/// Sends one batch to the remote.
///
/// `attempt` is 1-based and only informational; transports must not retry
/// on their own.
pub trait Transport: Send + Sync {
    /// Performs one network call for `batch`.
    fn send<'a>(
        &'a self,
        batch: &'a Batch,
        attempt: u32,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'a>>;
}
