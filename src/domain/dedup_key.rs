//! Dedup key value object
//!
//! `sha256(rule_id || canonical(stable_entities))`, used by the alert
//! generator to find (or create) the open alert a new rule match belongs to.
//! `canonical` sorts entity type keys and their values so two hit sets with
//! the same members in different orders hash identically.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A stable hash identifying the alert a rule match belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    /// Derive a dedup key from a rule id and its stable entity set.
    ///
    /// `entities` maps entity type (`"host"`, `"user"`, ...) to the values
    /// extracted for that type; both the outer map and inner value lists are
    /// sorted before hashing so the result is independent of extraction order.
    pub fn derive(rule_id: Uuid, entities: &BTreeMap<String, Vec<String>>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(rule_id.as_bytes());
        for (entity_type, values) in entities {
            let mut sorted = values.clone();
            sorted.sort();
            sorted.dedup();
            hasher.update(entity_type.as_bytes());
            for value in &sorted {
                hasher.update(value.as_bytes());
            }
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reconstructs a dedup key from a previously-derived hex digest, e.g.
    /// one read back from a store column. Does not re-validate the input.
    pub fn from_raw(digest: String) -> Self {
        Self(digest)
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entities(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, vs)| {
                (
                    k.to_string(),
                    vs.iter().map(|v| v.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn same_entities_different_order_hash_equal() {
        let rule_id = Uuid::nil();
        let a = entities(&[("host", &["web-01", "web-02"])]);
        let b = entities(&[("host", &["web-02", "web-01"])]);
        assert_eq!(DedupKey::derive(rule_id, &a), DedupKey::derive(rule_id, &b));
    }

    #[test]
    fn different_rule_ids_hash_differently() {
        let entities = entities(&[("host", &["web-01"])]);
        let a = DedupKey::derive(Uuid::nil(), &entities);
        let b = DedupKey::derive(Uuid::max(), &entities);
        assert_ne!(a, b);
    }

    #[test]
    fn duplicate_values_do_not_change_hash() {
        let rule_id = Uuid::nil();
        let a = entities(&[("host", &["web-01"])]);
        let b = entities(&[("host", &["web-01", "web-01"])]);
        assert_eq!(DedupKey::derive(rule_id, &a), DedupKey::derive(rule_id, &b));
    }
}
