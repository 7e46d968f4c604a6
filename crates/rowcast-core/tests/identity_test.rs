//! Property-based tests for identity key derivation.

use indexmap::IndexMap;
use proptest::prelude::*;
use rowcast_core::{CoreError, IdentityConfig, IdentityMode, IdentityResolver, Record};

fn record(pairs: &[(String, String)]) -> Record {
    Record::new(0, pairs.iter().cloned().collect::<IndexMap<_, _>>())
}

fn email_only() -> IdentityResolver {
    IdentityResolver::new(IdentityConfig {
        fields: vec!["email".to_string()],
        mode: IdentityMode::Fields,
    })
}

fn all_fields() -> IdentityResolver {
    IdentityResolver::new(IdentityConfig {
        fields: vec!["email".to_string()],
        mode: IdentityMode::AllFields,
    })
}

proptest! {
    #[test]
    fn key_is_deterministic_and_order_independent(
        email in "[a-z]{1,10}@[a-z]{1,8}\\.com",
        extra in proptest::collection::btree_map("[a-z]{1,6}", "[A-Za-z0-9]{1,6}", 0..6),
    ) {
        let mut pairs: Vec<(String, String)> = extra
            .into_iter()
            .filter(|(name, _)| name != "email")
            .collect();
        pairs.push(("email".to_string(), email));

        let forward = all_fields().resolve(&record(&pairs)).unwrap();
        pairs.reverse();
        let reversed = all_fields().resolve(&record(&pairs)).unwrap();

        prop_assert_eq!(forward, reversed);
        prop_assert_eq!(forward, all_fields().resolve(&record(&pairs)).unwrap());
    }

    #[test]
    fn distinct_emails_give_distinct_keys(a in "[a-z]{1,12}", b in "[a-z]{1,12}") {
        prop_assume!(a != b);
        let resolver = email_only();

        let key_a = resolver.resolve(&record(&[("email".into(), a)])).unwrap();
        let key_b = resolver.resolve(&record(&[("email".into(), b)])).unwrap();
        prop_assert_ne!(key_a, key_b);
    }

    #[test]
    fn blank_identity_is_malformed(padding in " {0,4}") {
        let resolver = IdentityResolver::new(IdentityConfig::default());
        let error = resolver.resolve(&record(&[("email".into(), padding)])).unwrap_err();

        let is_email_error = matches!(error, CoreError::MalformedRecord { ref field } if field == "email");
        prop_assert!(is_email_error);
    }
}

#[test]
fn field_boundaries_are_unambiguous() {
    let resolver = IdentityResolver::new(IdentityConfig {
        fields: vec!["a".to_string(), "b".to_string()],
        mode: IdentityMode::Fields,
    });

    let left = resolver
        .resolve(&record(&[("a".into(), "xy".into()), ("b".into(), "z".into())]))
        .unwrap();
    let right = resolver
        .resolve(&record(&[("a".into(), "x".into()), ("b".into(), "yz".into())]))
        .unwrap();

    assert_ne!(left, right);
}
