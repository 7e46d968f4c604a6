//! Domain models shared by the source, engine and sinks.
//!
//! A [`Record`] is one immutable input row tagged with its source offset. The
//! engine pairs each accepted record with its [`IdentityKey`] and moves them
//! around in [`Batch`]es until every record reaches a terminal outcome.

use std::{fmt, time::Duration};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One input row: ordered field name to value mapping.
///
/// Records are immutable once read; the offset is the zero-based position of
/// the row in the source and drives checkpoint watermarks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    offset: u64,
    fields: IndexMap<String, String>,
}

impl Record {
    /// Creates a record at the given source offset.
    pub fn new(offset: u64, fields: IndexMap<String, String>) -> Self {
        Self { offset, fields }
    }

    /// Zero-based position of this row in the source.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Field value, if the column exists.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Field value when present and not blank.
    pub fn non_blank(&self, field: &str) -> Option<&str> {
        self.get(field).filter(|value| !value.trim().is_empty())
    }

    /// All fields in source column order.
    pub fn fields(&self) -> &IndexMap<String, String> {
        &self.fields
    }

    /// Iterates `(name, value)` pairs in source column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Deterministic SHA-256 identity of a record.
///
/// Used both as the local dedup token and as the vendor-side idempotency key,
/// so it must never depend on wall-clock time or process state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey([u8; 32]);

impl IdentityKey {
    /// Wraps a raw digest.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex rendering of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Renders the first 16 bytes in UUID layout (`8-4-4-4-12`), the form sent to
/// the remote as `event_id`.
impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(&self.0[..16]);
        write!(f, "{}-{}-{}-{}-{}", &hex[..8], &hex[8..12], &hex[12..16], &hex[16..20], &hex[20..])
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({self})")
    }
}

/// A record that passed identity resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedRecord {
    /// Identity of the record.
    pub key: IdentityKey,
    /// The record itself.
    pub record: Record,
}

impl KeyedRecord {
    /// Pairs a record with its identity key.
    pub fn new(key: IdentityKey, record: Record) -> Self {
        Self { key, record }
    }
}

/// Bounded group of records delivered in one network call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    seq: u64,
    items: Vec<KeyedRecord>,
}

impl Batch {
    /// Creates a batch with a run-unique sequence number.
    pub fn new(seq: u64, items: Vec<KeyedRecord>) -> Self {
        Self { seq, items }
    }

    /// Sequence number assigned at assembly time.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Records with their keys, in assembly order.
    pub fn items(&self) -> &[KeyedRecord] {
        &self.items
    }

    /// Source offsets of every record in the batch.
    pub fn offsets(&self) -> impl Iterator<Item = u64> + '_ {
        self.items.iter().map(|item| item.record.offset())
    }

    /// Consumes the batch, yielding its records.
    pub fn into_items(self) -> Vec<KeyedRecord> {
        self.items
    }

    /// Splits the batch by item index, keeping the sequence number on both
    /// halves. Items whose index is in `selected` go to the first half.
    pub fn partition(self, selected: &[usize]) -> (Self, Self) {
        let seq = self.seq;
        let (picked, rest): (Vec<_>, Vec<_>) =
            self.items.into_iter().enumerate().partition(|(index, _)| selected.contains(index));
        (
            Self::new(seq, picked.into_iter().map(|(_, item)| item).collect()),
            Self::new(seq, rest.into_iter().map(|(_, item)| item).collect()),
        )
    }
}

/// Result classification of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Remote accepted the records.
    Success,
    /// Transient failure; eligible for backoff and second-pass retry.
    RetryableFailure {
        /// Human readable cause
        reason: String,
        /// Remote supplied wait hint
        retry_after: Option<Duration>,
    },
    /// Remote rejected the records; never retried.
    PermanentFailure {
        /// Human readable cause
        reason: String,
    },
}

impl DeliveryOutcome {
    /// Whether the outcome is terminal for the records it tags.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::RetryableFailure { .. })
    }
}

/// Why a record ended up in the failure collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Record could not be identified; never sent.
    MalformedRecord {
        /// Missing or blank identity field
        field: String,
    },
    /// Remote rejected the record with a non-retryable status.
    Rejected {
        /// HTTP status returned by the remote
        status: u16,
        /// Remote message, if any
        message: String,
    },
    /// Both retry passes were exhausted.
    RetriesExhausted {
        /// Total attempts across both passes
        attempts: u32,
        /// Last transient error seen
        last_error: String,
    },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedRecord { field } => {
                write!(f, "MalformedRecord: identity field `{field}` missing or empty")
            },
            Self::Rejected { status, message } => write!(f, "Rejected: HTTP {status} {message}"),
            Self::RetriesExhausted { attempts, last_error } => {
                write!(f, "RetriesExhausted: {attempts} attempts, last error: {last_error}")
            },
        }
    }
}

/// A record that will never be delivered in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRecord {
    /// The undelivered record.
    pub record: Record,
    /// Identity key, absent for malformed records.
    pub key: Option<IdentityKey>,
    /// Cause of the terminal failure.
    pub reason: FailureReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed(offset: u64) -> KeyedRecord {
        let mut fields = IndexMap::new();
        fields.insert("email".to_string(), format!("user{offset}@example.com"));
        KeyedRecord::new(IdentityKey::from_bytes([offset as u8; 32]), Record::new(offset, fields))
    }

    #[test]
    fn identity_key_renders_uuid_layout() {
        let key = IdentityKey::from_bytes([0xab; 32]);
        assert_eq!(key.to_string(), "abababab-abab-abab-abab-abababababab");
        assert_eq!(key.to_hex().len(), 64);
    }

    #[test]
    fn non_blank_ignores_whitespace_values() {
        let mut fields = IndexMap::new();
        fields.insert("email".to_string(), "   ".to_string());
        let record = Record::new(0, fields);

        assert_eq!(record.get("email"), Some("   "));
        assert_eq!(record.non_blank("email"), None);
        assert_eq!(record.non_blank("missing"), None);
    }

    #[test]
    fn partition_keeps_every_record_once() {
        let batch = Batch::new(7, (0..5).map(keyed).collect());
        let (picked, rest) = batch.partition(&[1, 3]);

        assert_eq!(picked.seq(), 7);
        assert_eq!(picked.offsets().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(rest.offsets().collect::<Vec<_>>(), vec![0, 2, 4]);
    }

    #[test]
    fn only_retryable_outcome_is_non_terminal() {
        assert!(DeliveryOutcome::Success.is_terminal());
        assert!(DeliveryOutcome::PermanentFailure { reason: "bad".into() }.is_terminal());
        assert!(!DeliveryOutcome::RetryableFailure { reason: "busy".into(), retry_after: None }
            .is_terminal());
    }
}
