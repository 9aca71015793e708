//! Entity key value object
//!
//! The correlation engine shards its per-entity state rows by hashing this
//! key; the detection engine and alert generator use it as the grouping
//! field for dedup and entity extraction. Modeled after the teacher's
//! `Hostname` value object: a validated wrapper, not a bare `String`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum byte length of an entity key (matches the `correlation_states.entity_key`
/// column width in the relational store).
pub const MAX_LENGTH: usize = 512;

/// Errors constructing an [`EntityKey`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntityKeyError {
    #[error("entity key must not be empty")]
    Empty,

    #[error("entity key exceeds {MAX_LENGTH} bytes: {0} bytes")]
    TooLong(usize),
}

/// The value a correlation sequence is keyed on (e.g. `host.name` or
/// `user.name`), extracted from an event's canonical fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    /// Validate and construct an entity key.
    pub fn new(value: impl Into<String>) -> Result<Self, EntityKeyError> {
        let value = value.into();
        if value.is_empty() {
            return Err(EntityKeyError::Empty);
        }
        if value.len() > MAX_LENGTH {
            return Err(EntityKeyError::TooLong(value.len()));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for EntityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty() {
        assert_eq!(EntityKey::new("").unwrap_err(), EntityKeyError::Empty);
    }

    #[test]
    fn rejects_oversized() {
        let value = "a".repeat(MAX_LENGTH + 1);
        assert_eq!(
            EntityKey::new(value).unwrap_err(),
            EntityKeyError::TooLong(MAX_LENGTH + 1)
        );
    }

    #[test]
    fn accepts_boundary_length() {
        let value = "a".repeat(MAX_LENGTH);
        assert!(EntityKey::new(value).is_ok());
    }

    #[test]
    fn round_trips_as_str() {
        let key = EntityKey::new("host-01").unwrap();
        assert_eq!(key.as_str(), "host-01");
        assert_eq!(key.to_string(), "host-01");
    }
}
