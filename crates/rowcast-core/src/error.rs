//! Error types for record handling outside the network path.
//!
//! Covers unusable input rows, record source failures and failure sink
//! persistence. Network and delivery errors live in `rowcast-delivery`.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for reading, identifying and collecting records.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Record lacks a required identity field or the field is blank.
    #[error("malformed record: identity field `{field}` is missing or empty")]
    MalformedRecord {
        /// Name of the offending field
        field: String,
    },

    /// Input is missing columns the pipeline depends on.
    #[error("input is missing required columns: {}", columns.join(", "))]
    MissingColumns {
        /// Columns that were expected but not found
        columns: Vec<String>,
    },

    /// Record source could not produce rows.
    #[error("record source error: {0}")]
    Source(String),

    /// Failure collector could not persist a record.
    #[error("failure collector error: {0}")]
    Collector(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV parsing or writing failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl CoreError {
    /// Creates a malformed record error for the given field.
    pub fn malformed(field: impl Into<String>) -> Self {
        Self::MalformedRecord { field: field.into() }
    }

    /// Creates a record source error.
    pub fn source(message: impl Into<String>) -> Self {
        Self::Source(message.into())
    }

    /// Creates a failure collector error.
    pub fn collector(message: impl Into<String>) -> Self {
        Self::Collector(message.into())
    }
}
