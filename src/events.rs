//! The normalized event shape that crosses the event buffer.
//!
//! Mirrors the wire contract of §6: parsers and connectors publish this
//! shape, never a dialect-specific one. `fields` stays an open map so
//! upstream producers can carry arbitrary attributes; the canonical subset
//! used for entity extraction and correlation keying is read through typed
//! accessors on [`EventFields`] rather than ad hoc dotted-path lookups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A normalized security event as it crosses the buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique per event, best-effort (producers may retry with the same id).
    pub event_id: String,
    /// Emitter-assigned wall-clock UTC timestamp.
    pub timestamp: DateTime<Utc>,
    /// Source tag, e.g. `okta`, `syslog`, `winlog`.
    pub source: String,
    /// Open map of normalized attributes.
    pub fields: EventFields,
    /// Opaque original record, untouched by the core.
    pub raw: Value,
    /// Assigned by the buffer on ingest; `None` until published.
    pub published_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Construct a new event as a producer would, prior to publishing.
    pub fn new(
        event_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
        fields: EventFields,
        raw: Value,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            timestamp,
            source: source.into(),
            fields,
            raw,
            published_at: None,
        }
    }
}

/// Canonical field subset indexed for entity extraction and correlation
/// keying, with an escape hatch for anything the core doesn't canonicalize.
///
/// Field paths match the original dotted-path contract (`host.name`,
/// `file.hash.sha256`, ...) but are accessed through named methods instead
/// of runtime string traversal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFields {
    pub host_name: Option<String>,
    pub host_ip: Option<String>,
    pub user_name: Option<String>,
    pub source_ip: Option<String>,
    pub destination_ip: Option<String>,
    pub file_path: Option<String>,
    pub file_hash_sha256: Option<String>,
    pub file_hash_sha1: Option<String>,
    pub file_hash_md5: Option<String>,
    pub process_executable: Option<String>,
    pub url: Option<String>,

    /// Everything not covered by the canonical subset above, keyed by its
    /// dotted path (e.g. `"process.command_line"`).
    #[serde(default, flatten)]
    pub other: serde_json::Map<String, Value>,
}

impl EventFields {
    /// Read a field by dotted path, canonical or otherwise.
    ///
    /// Canonical paths resolve through the typed fields above; anything else
    /// falls through to the `other` map, matched against the same key the
    /// producer supplied.
    pub fn get(&self, path: &str) -> Option<&str> {
        match path {
            "host.name" => self.host_name.as_deref(),
            "host.ip" => self.host_ip.as_deref(),
            "user.name" => self.user_name.as_deref(),
            "source.ip" => self.source_ip.as_deref(),
            "destination.ip" => self.destination_ip.as_deref(),
            "file.path" => self.file_path.as_deref(),
            "file.hash.sha256" => self.file_hash_sha256.as_deref(),
            "file.hash.sha1" => self.file_hash_sha1.as_deref(),
            "file.hash.md5" => self.file_hash_md5.as_deref(),
            "process.executable" => self.process_executable.as_deref(),
            "url" => self.url.as_deref(),
            other_path => self.other.get(other_path).and_then(Value::as_str),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_paths_resolve() {
        let fields = EventFields {
            host_name: Some("web-01".into()),
            user_name: Some("alice".into()),
            ..Default::default()
        };
        assert_eq!(fields.get("host.name"), Some("web-01"));
        assert_eq!(fields.get("user.name"), Some("alice"));
        assert_eq!(fields.get("source.ip"), None);
    }

    #[test]
    fn uncanonicalized_path_falls_through_to_other() {
        let mut other = serde_json::Map::new();
        other.insert(
            "process.command_line".to_string(),
            Value::String("cmd.exe /c whoami".into()),
        );
        let fields = EventFields {
            other,
            ..Default::default()
        };
        assert_eq!(
            fields.get("process.command_line"),
            Some("cmd.exe /c whoami")
        );
    }

    #[test]
    fn unknown_path_is_none_not_error() {
        let fields = EventFields::default();
        assert_eq!(fields.get("nonexistent.path"), None);
    }
}
