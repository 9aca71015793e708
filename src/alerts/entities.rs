//! Canonical entity extraction (§4.5): fixed field paths, unknown/missing
//! paths skipped without error. Mirrors the original's
//! `_extract_entities`, replacing its ad hoc dotted-path walk with typed
//! [`crate::events::EventFields`] accessors.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::events::EventFields;
use crate::historical::Hit;

/// Entity sets attached to an alert.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntitySet {
    pub hosts: BTreeSet<String>,
    pub users: BTreeSet<String>,
    pub ips: BTreeSet<String>,
    pub hashes: BTreeSet<String>,
    pub files: BTreeSet<String>,
}

impl EntitySet {
    pub fn extract_from(fields: &EventFields) -> Self {
        let mut set = EntitySet::default();
        if let Some(v) = &fields.host_name {
            set.hosts.insert(v.clone());
        }
        if let Some(v) = &fields.user_name {
            set.users.insert(v.clone());
        }
        for ip in [&fields.source_ip, &fields.destination_ip, &fields.host_ip] {
            if let Some(v) = ip {
                set.ips.insert(v.clone());
            }
        }
        for hash in [&fields.file_hash_sha256, &fields.file_hash_sha1, &fields.file_hash_md5] {
            if let Some(v) = hash {
                set.hashes.insert(v.clone());
            }
        }
        if let Some(v) = &fields.file_path {
            set.files.insert(v.clone());
        }
        if let Some(v) = &fields.process_executable {
            set.files.insert(v.clone());
        }
        set
    }

    pub fn extract_from_hits(hits: &[Hit]) -> Self {
        let mut merged = EntitySet::default();
        for hit in hits {
            merged.merge(Self::extract_from(&hit.fields));
        }
        merged
    }

    pub fn merge(&mut self, other: EntitySet) {
        self.hosts.extend(other.hosts);
        self.users.extend(other.users);
        self.ips.extend(other.ips);
        self.hashes.extend(other.hashes);
        self.files.extend(other.files);
    }

    /// The sorted set of host/user/ip identifiers the dedup key is derived
    /// from (§4.5 "stable_entities"). Hashes and files are excluded: they
    /// identify the artifact, not the actor/asset the alert is about.
    pub fn stable_entities(&self) -> std::collections::BTreeMap<String, Vec<String>> {
        let mut map = std::collections::BTreeMap::new();
        map.insert("host".to_string(), self.hosts.iter().cloned().collect());
        map.insert("user".to_string(), self.users.iter().cloned().collect());
        map.insert("ip".to_string(), self.ips.iter().cloned().collect());
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_canonical_fields_only() {
        let fields = EventFields {
            host_name: Some("web-01".into()),
            user_name: Some("alice".into()),
            source_ip: Some("10.0.0.1".into()),
            file_hash_sha256: Some("abc123".into()),
            file_path: Some("/tmp/evil".into()),
            ..Default::default()
        };
        let set = EntitySet::extract_from(&fields);
        assert_eq!(set.hosts.len(), 1);
        assert_eq!(set.users.len(), 1);
        assert_eq!(set.ips.len(), 1);
        assert_eq!(set.hashes.len(), 1);
        assert_eq!(set.files.len(), 1);
    }

    #[test]
    fn missing_paths_are_skipped_without_error() {
        let set = EntitySet::extract_from(&EventFields::default());
        assert!(set.hosts.is_empty());
        assert!(set.users.is_empty());
    }

    #[test]
    fn merge_unions_without_duplicates() {
        let mut a = EntitySet::default();
        a.hosts.insert("web-01".to_string());
        let mut b = EntitySet::default();
        b.hosts.insert("web-01".to_string());
        b.hosts.insert("web-02".to_string());

        a.merge(b);
        assert_eq!(a.hosts.len(), 2);
    }
}
