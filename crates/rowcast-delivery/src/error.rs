//! Error types for record delivery operations.
//!
//! Defines every failure the delivery path can observe, from transport and
//! HTTP errors through circuit breaker rejections to checkpoint persistence.
//! Errors carry enough context for logging and are categorized so the retry
//! loop can tell transient trouble from permanent rejection.

use std::{fmt, path::PathBuf, time::Duration};

use rowcast_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for record delivery.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// Request timeout exceeded.
    #[error("request timeout after {timeout:?}")]
    Timeout {
        /// Configured request timeout
        timeout: Duration,
    },

    /// Remote rejected the request (4xx other than 429).
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Remote failed to process the request (5xx).
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Remote throttled the request (429).
    #[error("rate limited by remote")]
    RateLimited {
        /// Wait hint from the `Retry-After` header
        retry_after: Option<Duration>,
    },

    /// Circuit breaker is open, call short-circuited.
    #[error("circuit breaker open, call short-circuited")]
    CircuitOpen,

    /// Checkpoint could not be persisted after internal retries.
    #[error("checkpoint write to {} failed: {message}", path.display())]
    CheckpointWrite {
        /// Checkpoint location
        path: PathBuf,
        /// Underlying failure
        message: String,
    },

    /// Checkpoint exists but cannot be read or parsed.
    #[error("checkpoint at {} is unreadable: {message}", path.display())]
    CheckpointRead {
        /// Checkpoint location
        path: PathBuf,
        /// Underlying failure
        message: String,
    },

    /// Checkpoint on disk belongs to a different input.
    #[error("checkpoint was written for `{found}`, refusing to resume `{expected}`")]
    CheckpointMismatch {
        /// Source named by the current run
        expected: String,
        /// Source recorded in the checkpoint
        found: String,
    },

    /// Record source or failure sink failed.
    #[error("record I/O failed: {message}")]
    RecordIo {
        /// Underlying failure
        message: String,
    },

    /// Invalid engine or transport configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Shutdown was requested while the operation waited.
    #[error("shutdown requested")]
    ShutdownRequested,

    /// Workers did not stop within the shutdown timeout.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Configured shutdown timeout
        timeout: Duration,
    },

    /// Worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Identifier of the worker
        worker_id: usize,
        /// Join error description
        error: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout }
    }

    /// Creates a client error from an HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from an HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a rate limit error with an optional wait hint.
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::RateLimited { retry_after }
    }

    /// Creates a checkpoint write error.
    pub fn checkpoint_write(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::CheckpointWrite { path: path.into(), message: message.into() }
    }

    /// Creates a checkpoint read error.
    pub fn checkpoint_read(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::CheckpointRead { path: path.into(), message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Maps an HTTP status to the matching error, or `None` for 2xx.
    pub fn from_status(status_code: u16, body: &str, retry_after: Option<Duration>) -> Option<Self> {
        match status_code {
            200..=299 => None,
            429 => Some(Self::rate_limited(retry_after)),
            400..=499 => Some(Self::client_error(status_code, body)),
            _ => Some(Self::server_error(status_code, body)),
        }
    }

    /// Whether this error is transient and the call may be retried.
    ///
    /// Network errors, timeouts, 5xx, 429 and open circuits are retryable.
    /// Client errors and local failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::CircuitOpen => true,

            Self::ClientError { .. }
            | Self::CheckpointWrite { .. }
            | Self::CheckpointRead { .. }
            | Self::CheckpointMismatch { .. }
            | Self::RecordIo { .. }
            | Self::ConfigurationError { .. }
            | Self::ShutdownRequested
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. }
            | Self::InternalError { .. } => false,
        }
    }

    /// Whether the error should count against the circuit breaker.
    ///
    /// Client errors prove the remote is up, and short-circuited calls never
    /// reached it.
    pub fn counts_as_remote_failure(&self) -> bool {
        self.is_retryable() && !matches!(self, Self::CircuitOpen)
    }

    /// Remote supplied wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Category of this error for logging.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        Self::RecordIo { message: error.to_string() }
    }
}

/// Category of delivery error for logging and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues.
    Network,
    /// HTTP client errors (4xx).
    Client,
    /// HTTP server errors (5xx).
    Server,
    /// Rate limiting.
    RateLimit,
    /// Circuit breaker protection.
    Circuit,
    /// Checkpoint persistence.
    Checkpoint,
    /// Source or sink I/O.
    Io,
    /// Configuration problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::CircuitOpen => Self::Circuit,
            DeliveryError::CheckpointWrite { .. }
            | DeliveryError::CheckpointRead { .. }
            | DeliveryError::CheckpointMismatch { .. } => Self::Checkpoint,
            DeliveryError::RecordIo { .. } => Self::Io,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::ShutdownRequested
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Circuit => write!(f, "circuit"),
            Self::Checkpoint => write!(f, "checkpoint"),
            Self::Io => write!(f, "io"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(Duration::from_secs(30)).is_retryable());
        assert!(DeliveryError::server_error(503, "unavailable").is_retryable());
        assert!(DeliveryError::rate_limited(None).is_retryable());
        assert!(DeliveryError::CircuitOpen.is_retryable());

        assert!(!DeliveryError::client_error(400, "bad payload").is_retryable());
        assert!(!DeliveryError::client_error(401, "unauthorized").is_retryable());
        assert!(!DeliveryError::checkpoint_write("/tmp/cp", "disk full").is_retryable());
        assert!(!DeliveryError::ShutdownRequested.is_retryable());
    }

    #[test]
    fn status_codes_classified() {
        assert!(DeliveryError::from_status(204, "", None).is_none());
        assert!(matches!(
            DeliveryError::from_status(429, "", Some(Duration::from_secs(2))),
            Some(DeliveryError::RateLimited { retry_after: Some(d) }) if d == Duration::from_secs(2)
        ));
        assert!(matches!(
            DeliveryError::from_status(422, "invalid", None),
            Some(DeliveryError::ClientError { status_code: 422, .. })
        ));
        assert!(matches!(
            DeliveryError::from_status(502, "", None),
            Some(DeliveryError::ServerError { status_code: 502, .. })
        ));
    }

    #[test]
    fn open_circuit_does_not_feed_the_breaker() {
        assert!(!DeliveryError::CircuitOpen.counts_as_remote_failure());
        assert!(!DeliveryError::client_error(400, "").counts_as_remote_failure());
        assert!(DeliveryError::server_error(500, "").counts_as_remote_failure());
        assert!(DeliveryError::rate_limited(None).counts_as_remote_failure());
    }

    #[test]
    fn error_categories_mapped_correctly() {
        assert_eq!(ErrorCategory::from(&DeliveryError::network("x")), ErrorCategory::Network);
        assert_eq!(ErrorCategory::from(&DeliveryError::CircuitOpen), ErrorCategory::Circuit);
        assert_eq!(
            ErrorCategory::from(&DeliveryError::checkpoint_write("/x", "y")),
            ErrorCategory::Checkpoint
        );
        assert_eq!(DeliveryError::server_error(502, "").category(), ErrorCategory::Server);
        assert_eq!(ErrorCategory::RateLimit.to_string(), "rate_limit");
    }
}
