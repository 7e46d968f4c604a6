//! Property-based test strategies for domain types.

use indexmap::IndexMap;
use proptest::{
    collection::vec,
    prelude::{any, prop_oneof, Just, Strategy},
    string::string_regex,
};
use rowcast_core::{IdentityKey, KeyedRecord, Record};

/// Plausible email addresses, occasionally padded with whitespace.
pub fn email_strategy() -> impl Strategy<Value = String> {
    (
        string_regex("[a-z][a-z0-9._]{0,15}@[a-z]{1,10}\\.(com|org|io)")
            .unwrap_or_else(|e| panic!("email regex: {e}")),
        prop_oneof![Just(""), Just(" ")],
    )
        .prop_map(|(email, pad)| format!("{pad}{email}"))
}

/// Field values including blanks.
pub fn value_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => string_regex("[A-Za-z0-9 _-]{1,12}").unwrap_or_else(|e| panic!("value regex: {e}")),
        1 => Just(String::new()),
    ]
}

/// A signup record at `offset` with a non-blank email.
pub fn record_strategy(offset: u64) -> impl Strategy<Value = Record> {
    (email_strategy(), value_strategy(), value_strategy()).prop_map(move |(email, coupon, store)| {
        let mut fields = IndexMap::new();
        fields.insert("email".to_string(), email);
        fields.insert("coupon_code".to_string(), coupon);
        fields.insert("store_id".to_string(), store);
        Record::new(offset, fields)
    })
}

/// Between `1` and `max` keyed records with consecutive offsets.
pub fn keyed_records_strategy(max: usize) -> impl Strategy<Value = Vec<KeyedRecord>> {
    vec(any::<[u8; 32]>(), 1..=max.max(1)).prop_map(|keys| {
        keys.into_iter()
            .enumerate()
            .map(|(offset, key)| {
                let offset = offset as u64;
                let mut fields = IndexMap::new();
                fields.insert("email".to_string(), format!("user{offset}@example.com"));
                KeyedRecord::new(IdentityKey::from_bytes(key), Record::new(offset, fields))
            })
            .collect()
    })
}
