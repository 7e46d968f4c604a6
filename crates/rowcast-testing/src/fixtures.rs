//! Record builders and fixtures with sensible defaults.

use indexmap::IndexMap;
use rowcast_core::{IdentityConfig, IdentityResolver, KeyedRecord, Record};

/// Builder for test records.
#[derive(Debug, Clone, Default)]
pub struct RecordBuilder {
    offset: u64,
    fields: IndexMap<String, String>,
}

impl RecordBuilder {
    /// Creates an empty record at offset 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a signup row keyed by `offset`, with every column filled in.
    pub fn with_defaults(offset: u64) -> Self {
        Self::new()
            .offset(offset)
            .field("email", format!("user{offset}@example.com"))
            .field("coupon_code", format!("SAVE{offset:04}"))
            .field("customer_id", format!("cust-{offset}"))
            .field("store_id", "store-1")
    }

    /// Sets the source offset.
    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Sets or replaces a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Blanks a field, keeping the column.
    #[must_use]
    pub fn blank(self, name: impl Into<String>) -> Self {
        self.field(name, "")
    }

    /// Removes a field entirely.
    #[must_use]
    pub fn without(mut self, name: &str) -> Self {
        self.fields.shift_remove(name);
        self
    }

    /// Builds the record.
    pub fn build(self) -> Record {
        Record::new(self.offset, self.fields)
    }
}

/// A complete signup row at `offset`.
pub fn signup(offset: u64) -> Record {
    RecordBuilder::with_defaults(offset).build()
}

/// `count` distinct signup rows at offsets `0..count`.
pub fn records(count: u64) -> Vec<Record> {
    (0..count).map(signup).collect()
}

/// A signup row paired with the key the default resolver gives it.
pub fn keyed(offset: u64) -> KeyedRecord {
    let record = signup(offset);
    let key = IdentityResolver::new(IdentityConfig::default())
        .resolve(&record)
        .unwrap_or_else(|e| panic!("fixture record must resolve: {e}"));
    KeyedRecord::new(key, record)
}
