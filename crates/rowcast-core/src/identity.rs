//! Deterministic identity keys for records.
//!
//! The key is a SHA-256 digest over the canonical form of a record's identity
//! fields: pairs sorted by field name, each name and value length-prefixed so
//! that no two distinct field sets share an encoding. Nothing time- or
//! process-dependent enters the digest, so a resumed run recomputes identical
//! keys.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{CoreError, Result},
    models::{IdentityKey, Record},
};

/// Which fields contribute to the identity digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMode {
    /// Only the configured identity fields.
    #[default]
    Fields,
    /// Every non-blank field of the row; identity fields are still required.
    AllFields,
}

/// Identity resolver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Fields that must be present and non-blank.
    pub fields: Vec<String>,
    /// Digest scope.
    pub mode: IdentityMode,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            fields: vec!["email".to_string(), "coupon_code".to_string()],
            mode: IdentityMode::Fields,
        }
    }
}

/// Derives identity keys from records.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    config: IdentityConfig,
}

impl IdentityResolver {
    /// Creates a resolver for the given configuration.
    pub fn new(config: IdentityConfig) -> Self {
        Self { config }
    }

    /// Computes the identity key of a record.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::MalformedRecord` naming the first configured
    /// identity field that is absent or blank.
    pub fn resolve(&self, record: &Record) -> Result<IdentityKey> {
        let mut pairs = Vec::with_capacity(self.config.fields.len());
        for field in &self.config.fields {
            let value = record.non_blank(field).ok_or_else(|| CoreError::malformed(field))?;
            pairs.push((field.as_str(), value));
        }

        if self.config.mode == IdentityMode::AllFields {
            pairs = record.iter().filter(|(_, value)| !value.trim().is_empty()).collect();
        }

        pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));
        pairs.dedup_by(|a, b| a.0 == b.0);

        let mut hasher = Sha256::new();
        for (name, value) in pairs {
            update_prefixed(&mut hasher, name.as_bytes());
            update_prefixed(&mut hasher, value.as_bytes());
        }

        Ok(IdentityKey::from_bytes(hasher.finalize().into()))
    }
}

fn update_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
