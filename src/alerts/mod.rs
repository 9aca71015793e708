//! Alert Generator: deduplication, entity extraction, lifecycle (§4.5).
//!
//! Structured as the teacher's pure-projection/executor split
//! (`projection/pure.rs` + `projection/executor.rs`): [`pure::ingest_match`]
//! is a pure function from `(existing open alert, rule match) -> (alert,
//! effects)`, and [`AlertGenerator`] is the executor that looks the open
//! alert up, calls the pure function, and interprets the effects against a
//! real [`AlertStore`] and [`crate::buffer::EventBuffer`].

pub mod entities;
pub mod postgres;
pub mod pure;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

pub use entities::EntitySet;
pub use postgres::PgAlertStore;
pub use pure::{AlertEffect, AlertMessage, AlertMessageKind, RuleMatch};

use crate::buffer::EventBuffer;
use crate::domain::{AlertStatus, DedupKey, Severity};
use crate::errors::PipelineResult;
use crate::events::{Event, EventFields};
use crate::historical::Hit;
use crate::state_machine::alert_lifecycle::AlertAction;
use crate::subjects::StreamName;

/// An alert as described in §3: the record the generator creates, folds hits
/// into while open, and the operator drives through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub alert_id: Uuid,
    pub rule_id: Uuid,
    pub rule_name: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub hit_count: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Bounded ring buffer of the most recent `alert.event_ring_capacity`
    /// (default 100) matched events, oldest first.
    pub events: std::collections::VecDeque<Hit>,
    pub entities: EntitySet,
    pub dedup_key: DedupKey,
    /// Set when an operator opens a new alert that supersedes this one
    /// rather than reopening it (§4.5 "Reopening... not permitted").
    pub related_alert_ids: Vec<Uuid>,
    /// Set by the operator on close; feeds `rule.false_positive_count`
    /// (original's `alert_generator.py`, not excluded by any Non-goal).
    pub is_false_positive: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

/// Persistence for alerts, transactional per §4.5 step 6.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Looks up the open alert (if any) sharing `(rule_id, dedup_key)`.
    /// Only `status == open` alerts are returned — an alert already under
    /// operator investigation (acknowledged/in_progress) is left alone and
    /// a fresh match opens a new alert (see DESIGN.md for this reading of
    /// §4.5 step 3's "look up an *open* alert").
    async fn find_open(&self, rule_id: Uuid, dedup_key: &DedupKey) -> PipelineResult<Option<AlertRecord>>;
    async fn get(&self, alert_id: Uuid) -> PipelineResult<Option<AlertRecord>>;
    async fn upsert(&self, alert: AlertRecord) -> PipelineResult<AlertRecord>;

    /// Applies an operator-driven lifecycle transition, enforcing the DAG
    /// in [`crate::state_machine::alert_lifecycle`].
    async fn apply_transition(
        &self,
        alert_id: Uuid,
        action: AlertAction,
        is_false_positive: bool,
    ) -> PipelineResult<AlertRecord>;
}

/// Executor side of the pure/effect split: owns the per-dedup-key mutex
/// (§4.5 step 3, "under a per-key mutex"), the alert store, and the stream
/// publisher for `alert.created`/`alert.updated` notifications.
pub struct AlertGenerator {
    buffer: Arc<dyn EventBuffer>,
    store: Arc<dyn AlertStore>,
    ring_capacity: usize,
    locks: DashMap<(Uuid, DedupKey), Arc<AsyncMutex<()>>>,
}

impl AlertGenerator {
    pub fn new(buffer: Arc<dyn EventBuffer>, store: Arc<dyn AlertStore>, ring_capacity: usize) -> Self {
        Self {
            buffer,
            store,
            ring_capacity,
            locks: DashMap::new(),
        }
    }

    /// Folds a rule match (scheduled-rule hits or a completed correlation
    /// sequence) into an alert, creating one if none is open, and publishes
    /// the resulting `alert.created`/`alert.updated` message.
    pub async fn ingest_match(&self, rule_match: RuleMatch) -> PipelineResult<Option<AlertRecord>> {
        if !rule_match.threshold_exceeded && rule_match.hits.is_empty() {
            return Ok(None);
        }

        let dedup_key = pure::derive_dedup_key(rule_match.rule_id, &rule_match.hits);
        let lock = self
            .locks
            .entry((rule_match.rule_id, dedup_key.clone()))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let existing = self.store.find_open(rule_match.rule_id, &dedup_key).await?;
        let now = Utc::now();
        let Some((alert, effects)) = pure::ingest_match(existing, &rule_match, dedup_key, self.ring_capacity, now)
        else {
            return Ok(None);
        };

        for effect in effects {
            match effect {
                AlertEffect::Persist(record) => {
                    self.store.upsert(record).await?;
                }
                AlertEffect::Publish(message) => {
                    self.buffer.publish(StreamName::Alerts, alert_message_to_event(&message)?).await?;
                }
            }
        }

        Ok(Some(alert))
    }
}

/// Wraps an [`AlertMessage`] as an [`Event`] so it can travel the same
/// durable buffer as every other stream entry (§6 "alert egress").
fn alert_message_to_event(message: &AlertMessage) -> PipelineResult<Event> {
    let raw = serde_json::to_value(message)?;
    Ok(Event::new(
        message.alert_id.to_string(),
        message.timestamp,
        "alert-generator",
        EventFields::default(),
        raw,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::nats::InMemoryEventBuffer;
    use crate::domain::BackpressurePolicy;
    use std::sync::Mutex;

    #[derive(Default)]
    struct InMemoryAlertStore {
        alerts: Mutex<std::collections::HashMap<Uuid, AlertRecord>>,
    }

    #[async_trait]
    impl AlertStore for InMemoryAlertStore {
        async fn find_open(&self, rule_id: Uuid, dedup_key: &DedupKey) -> PipelineResult<Option<AlertRecord>> {
            Ok(self
                .alerts
                .lock()
                .unwrap()
                .values()
                .find(|a| a.rule_id == rule_id && &a.dedup_key == dedup_key && a.status == AlertStatus::Open)
                .cloned())
        }

        async fn get(&self, alert_id: Uuid) -> PipelineResult<Option<AlertRecord>> {
            Ok(self.alerts.lock().unwrap().get(&alert_id).cloned())
        }

        async fn upsert(&self, alert: AlertRecord) -> PipelineResult<AlertRecord> {
            self.alerts.lock().unwrap().insert(alert.alert_id, alert.clone());
            Ok(alert)
        }

        async fn apply_transition(
            &self,
            alert_id: Uuid,
            action: AlertAction,
            is_false_positive: bool,
        ) -> PipelineResult<AlertRecord> {
            use crate::state_machine::StateMachine;
            let mut alerts = self.alerts.lock().unwrap();
            let alert = alerts.get_mut(&alert_id).expect("alert exists");
            let (next, _) = alert
                .status
                .transition(&action)
                .map_err(|e| crate::errors::PipelineError::StateConflict(e.to_string()))?;
            alert.status = next;
            alert.is_false_positive = is_false_positive;
            alert.updated_at = Utc::now();
            Ok(alert.clone())
        }
    }

    fn sample_hit(host: &str) -> Hit {
        Hit {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            fields: EventFields {
                host_name: Some(host.to_string()),
                ..Default::default()
            },
            raw: serde_json::json!({}),
        }
    }

    fn generator() -> (AlertGenerator, Arc<InMemoryAlertStore>) {
        let buffer = Arc::new(InMemoryEventBuffer::new(1000, BackpressurePolicy::DropOldest));
        let store = Arc::new(InMemoryAlertStore::default());
        (AlertGenerator::new(buffer, store.clone(), 100), store)
    }

    #[tokio::test]
    async fn first_match_creates_alert_with_entities() {
        let (generator, _store) = generator();
        let rule_id = Uuid::new_v4();
        let hits = vec![sample_hit("H1"), sample_hit("H1"), sample_hit("H1")];

        let alert = generator
            .ingest_match(RuleMatch {
                rule_id,
                rule_name: "many failed logins".into(),
                severity: Severity::Medium,
                hits,
                threshold_exceeded: true,
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(alert.hit_count, 3);
        assert_eq!(alert.entities.hosts.len(), 1);
        assert_eq!(alert.status, AlertStatus::Open);
    }

    #[tokio::test]
    async fn rerun_same_dedup_key_updates_existing_alert() {
        let (generator, _store) = generator();
        let rule_id = Uuid::new_v4();

        let first = generator
            .ingest_match(RuleMatch {
                rule_id,
                rule_name: "r".into(),
                severity: Severity::Medium,
                hits: vec![sample_hit("H1"); 5],
                threshold_exceeded: true,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.hit_count, 5);

        let second = generator
            .ingest_match(RuleMatch {
                rule_id,
                rule_name: "r".into(),
                severity: Severity::Medium,
                hits: vec![sample_hit("H1"); 5],
                threshold_exceeded: true,
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(second.alert_id, first.alert_id);
        assert_eq!(second.hit_count, 10);
    }

    #[tokio::test]
    async fn no_hits_and_threshold_not_exceeded_is_a_no_op() {
        let (generator, _store) = generator();
        let result = generator
            .ingest_match(RuleMatch {
                rule_id: Uuid::new_v4(),
                rule_name: "r".into(),
                severity: Severity::Low,
                hits: vec![],
                threshold_exceeded: false,
            })
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
