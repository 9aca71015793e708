//! Pure projection half of the Alert Generator (§4.5), grounded on the
//! teacher's `projection/pure.rs`: `(State, Event) -> (State, Effects)` with
//! no I/O, so dedup/merge/entity-extraction stay unit-testable without a
//! database or stream broker.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entities::EntitySet;
use super::AlertRecord;
use crate::domain::{AlertStatus, DedupKey, Severity};
use crate::historical::Hit;

/// A synthetic rule execution result handed to the Alert Generator by
/// either the Detection Engine (scheduled-rule hits) or the Correlation
/// Engine (a completed sequence's contributing events).
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub severity: Severity,
    pub hits: Vec<Hit>,
    pub threshold_exceeded: bool,
}

/// `alert.created` | `alert.updated` | `alert.status_changed` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertMessageKind {
    #[serde(rename = "alert.created")]
    Created,
    #[serde(rename = "alert.updated")]
    Updated,
    #[serde(rename = "alert.status_changed")]
    StatusChanged,
}

/// The wire shape published onto the `alerts` stream (§6 "Alert egress").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertMessage {
    pub kind: AlertMessageKind,
    pub alert_id: Uuid,
    pub rule_id: Uuid,
    pub severity: Severity,
    pub status: AlertStatus,
    pub hit_count: i64,
    pub entities: EntitySet,
    pub timestamp: DateTime<Utc>,
}

impl AlertMessage {
    fn from_alert(alert: &AlertRecord, kind: AlertMessageKind, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            alert_id: alert.alert_id,
            rule_id: alert.rule_id,
            severity: alert.severity,
            status: alert.status,
            hit_count: alert.hit_count,
            entities: alert.entities.clone(),
            timestamp: now,
        }
    }
}

/// Side effects returned by [`ingest_match`] for the executor to interpret,
/// mirroring the teacher's `SideEffect` enum.
#[derive(Debug, Clone)]
pub enum AlertEffect {
    Persist(AlertRecord),
    Publish(AlertMessage),
}

/// `sha256(rule_id || canonical(stable_entities))` where `stable_entities`
/// is extracted from the *first* hit only (§4.5 "Dedup key"). An empty hit
/// set (threshold exceeded by a count-only query that returned no sample)
/// falls back to a dedup key scoped by `rule_id` alone.
pub fn derive_dedup_key(rule_id: Uuid, hits: &[Hit]) -> DedupKey {
    let entities = hits
        .first()
        .map(|h| EntitySet::extract_from(&h.fields))
        .unwrap_or_default();
    DedupKey::derive(rule_id, &entities.stable_entities())
}

fn push_hits_into_ring(ring: &mut VecDeque<Hit>, hits: &[Hit], capacity: usize) {
    let mut sorted: Vec<&Hit> = hits.iter().collect();
    sorted.sort_by_key(|h| h.timestamp);
    for hit in sorted {
        ring.push_back(hit.clone());
        while ring.len() > capacity {
            ring.pop_front();
        }
    }
}

/// Pure core of `ingest_match` (§4.5 steps 1-5): given the currently open
/// alert (if any) for `(rule_id, dedup_key)`, folds the match in and returns
/// the updated alert plus the effects the executor must perform. Returns
/// `None` when step 1's no-op condition holds.
pub fn ingest_match(
    existing_open: Option<AlertRecord>,
    rule_match: &RuleMatch,
    dedup_key: DedupKey,
    ring_capacity: usize,
    now: DateTime<Utc>,
) -> Option<(AlertRecord, Vec<AlertEffect>)> {
    if !rule_match.threshold_exceeded && rule_match.hits.is_empty() {
        return None;
    }

    let (alert, kind) = match existing_open {
        Some(mut alert) => {
            alert.hit_count += rule_match.hits.len() as i64;
            if let Some(max_ts) = rule_match.hits.iter().map(|h| h.timestamp).max() {
                alert.last_seen_at = alert.last_seen_at.max(max_ts);
            }
            push_hits_into_ring(&mut alert.events, &rule_match.hits, ring_capacity);
            alert.entities.merge(EntitySet::extract_from_hits(&rule_match.hits));
            alert.updated_at = now;
            alert.version += 1;
            (alert, AlertMessageKind::Updated)
        }
        None => {
            let first_seen = rule_match.hits.iter().map(|h| h.timestamp).min().unwrap_or(now);
            let last_seen = rule_match.hits.iter().map(|h| h.timestamp).max().unwrap_or(now);
            let mut events = VecDeque::new();
            push_hits_into_ring(&mut events, &rule_match.hits, ring_capacity);

            let alert = AlertRecord {
                alert_id: Uuid::new_v4(),
                rule_id: rule_match.rule_id,
                rule_name: rule_match.rule_name.clone(),
                title: format!("{} triggered", rule_match.rule_name),
                description: format!(
                    "Rule '{}' matched {} event(s)",
                    rule_match.rule_name,
                    rule_match.hits.len()
                ),
                severity: rule_match.severity,
                status: AlertStatus::Open,
                hit_count: rule_match.hits.len() as i64,
                first_seen_at: first_seen,
                last_seen_at: last_seen,
                events,
                entities: EntitySet::extract_from_hits(&rule_match.hits),
                dedup_key: dedup_key.clone(),
                related_alert_ids: Vec::new(),
                is_false_positive: false,
                created_at: now,
                updated_at: now,
                version: 0,
            };
            (alert, AlertMessageKind::Created)
        }
    };

    let message = AlertMessage::from_alert(&alert, kind, now);
    Some((alert.clone(), vec![AlertEffect::Persist(alert), AlertEffect::Publish(message)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFields;

    fn hit(host: &str, t: DateTime<Utc>) -> Hit {
        Hit {
            event_id: Uuid::new_v4().to_string(),
            timestamp: t,
            fields: EventFields {
                host_name: Some(host.to_string()),
                ..Default::default()
            },
            raw: serde_json::json!({}),
        }
    }

    #[test]
    fn no_hits_and_threshold_not_exceeded_is_no_op() {
        let rule_match = RuleMatch {
            rule_id: Uuid::new_v4(),
            rule_name: "r".into(),
            severity: Severity::Low,
            hits: vec![],
            threshold_exceeded: false,
        };
        let dedup_key = derive_dedup_key(rule_match.rule_id, &rule_match.hits);
        assert!(ingest_match(None, &rule_match, dedup_key, 100, Utc::now()).is_none());
    }

    #[test]
    fn fresh_match_creates_alert_and_two_effects() {
        let t = Utc::now();
        let rule_match = RuleMatch {
            rule_id: Uuid::new_v4(),
            rule_name: "r".into(),
            severity: Severity::High,
            hits: vec![hit("H1", t), hit("H1", t + chrono::Duration::seconds(1))],
            threshold_exceeded: true,
        };
        let dedup_key = derive_dedup_key(rule_match.rule_id, &rule_match.hits);
        let (alert, effects) = ingest_match(None, &rule_match, dedup_key, 100, t).unwrap();

        assert_eq!(alert.hit_count, 2);
        assert_eq!(alert.first_seen_at, t);
        assert_eq!(effects.len(), 2);
        assert!(matches!(effects[0], AlertEffect::Persist(_)));
        assert!(matches!(effects[1], AlertEffect::Publish(_)));
    }

    #[test]
    fn ring_buffer_evicts_oldest_past_capacity() {
        let t = Utc::now();
        let mut ring = VecDeque::new();
        let hits: Vec<Hit> = (0..5).map(|i| hit("H1", t + chrono::Duration::seconds(i))).collect();
        push_hits_into_ring(&mut ring, &hits, 3);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.front().unwrap().timestamp, t + chrono::Duration::seconds(2));
    }

    #[test]
    fn same_order_entities_produce_same_dedup_key_regardless_of_hit_order() {
        let rule_id = Uuid::new_v4();
        let t = Utc::now();
        let a = derive_dedup_key(rule_id, &[hit("H1", t)]);
        let b = derive_dedup_key(rule_id, &[hit("H1", t)]);
        assert_eq!(a, b);
    }
}
