//! Correlation State Row: the per-`(rule_id, entity_key)` consistency
//! boundary described in §3 and §4.4.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{CorrelationRowStatus, EntityKey};
use crate::errors::{PipelineError, PipelineResult};
use crate::events::Event;
use crate::historical::Hit;

/// Progress captured for one stage of a correlation rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageProgress {
    /// How many events have matched this stage so far.
    pub matched_count: u32,
    /// Values captured from `require_distinct` fields, used to check
    /// distinctness against later stages.
    pub captured_values: HashSet<String>,
    /// This stage's declared `group_by` output fields, captured from the
    /// most recent matching event (§4.4 step 6, "capture any declared
    /// output fields").
    pub group_by_values: std::collections::HashMap<String, String>,
    /// Full events that contributed to this stage, carried along so a
    /// completed row can hand the Alert Generator a real hits bundle
    /// instead of bare ids (§4.4 step 7, "synthetic hits bundle").
    pub contributing_hits: Vec<Hit>,
}

/// A correlation state row (§3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationStateRow {
    pub rule_id: Uuid,
    pub entity_key: EntityKey,
    pub stages: Vec<StageProgress>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub status: CorrelationRowStatus,
    /// Order in which stages were observed to match, for strict-order checks.
    pub match_order: Vec<usize>,
    /// `event_id`s already folded into this row, for idempotent redelivery.
    pub seen_event_ids: HashSet<String>,
    pub version: i64,
}

impl CorrelationStateRow {
    pub fn new(rule_id: Uuid, entity_key: EntityKey, stage_count: usize, event: &Event, window: chrono::Duration) -> Self {
        Self {
            rule_id,
            entity_key,
            stages: vec![StageProgress::default(); stage_count],
            window_start: event.timestamp,
            window_end: event.timestamp + window,
            status: CorrelationRowStatus::Active,
            match_order: Vec::new(),
            seen_event_ids: HashSet::new(),
            version: 0,
        }
    }

    pub fn all_stages_satisfied(&self, min_count_per_stage: u32) -> bool {
        self.stages.iter().all(|s| s.matched_count >= min_count_per_stage)
    }

    /// Whether the observed match order is consistent with strict stage
    /// ordering (non-decreasing stage index across the recorded order).
    pub fn order_is_strict(&self) -> bool {
        self.match_order.windows(2).all(|w| w[0] <= w[1])
    }
}

/// Key under which a row is addressed: `(rule_id, entity_key)`.
pub type RowKey = (Uuid, EntityKey);

/// Persistence for correlation state rows, with compare-and-swap semantics
/// via the `version` counter (§4.4 "Concurrency & locking").
#[async_trait]
pub trait CorrelationStateStore: Send + Sync {
    async fn get_active(&self, rule_id: Uuid, entity_key: &EntityKey) -> PipelineResult<Option<CorrelationStateRow>>;

    /// Inserts a brand-new row; fails with `StateConflict` if one already exists.
    async fn create(&self, row: CorrelationStateRow) -> PipelineResult<CorrelationStateRow>;

    /// Compare-and-swap update: succeeds only if the stored row's version
    /// matches `expected_version`, then increments it.
    async fn update(&self, row: CorrelationStateRow, expected_version: i64) -> PipelineResult<CorrelationStateRow>;

    /// Scans rows eligible for expiry (`window_end < now - grace`).
    async fn scan_expirable(&self, now: DateTime<Utc>, grace: chrono::Duration) -> PipelineResult<Vec<CorrelationStateRow>>;

    async fn mark_expired(&self, rule_id: Uuid, entity_key: &EntityKey, expected_version: i64) -> PipelineResult<()>;

    /// Scans `active` rows whose window has closed (`window_end <= now`) but
    /// are still within `lateness_bound` of it, i.e. eligible to move into
    /// the short-lived `draining` state that still accepts late events
    /// (§4.4 "Late events").
    async fn scan_draining_candidates(
        &self,
        now: DateTime<Utc>,
        lateness_bound: chrono::Duration,
    ) -> PipelineResult<Vec<CorrelationStateRow>>;

    /// Transitions a row from `active` to `draining`.
    async fn mark_draining(&self, rule_id: Uuid, entity_key: &EntityKey, expected_version: i64) -> PipelineResult<()>;

    /// Removes rows that have sat `expired`/`completed` longer than `retention`.
    async fn garbage_collect(&self, now: DateTime<Utc>, retention: chrono::Duration) -> PipelineResult<u64>;
}

/// `dashmap`-backed state store: one shard map per process, write-through
/// is the caller's responsibility (the scheduler wires a durable store in
/// front of this for production; tests use this directly).
#[derive(Default)]
pub struct InMemoryCorrelationStateStore {
    rows: DashMap<RowKey, CorrelationStateRow>,
    terminal_since: DashMap<RowKey, DateTime<Utc>>,
}

impl InMemoryCorrelationStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CorrelationStateStore for InMemoryCorrelationStateStore {
    async fn get_active(&self, rule_id: Uuid, entity_key: &EntityKey) -> PipelineResult<Option<CorrelationStateRow>> {
        Ok(self
            .rows
            .get(&(rule_id, entity_key.clone()))
            .filter(|r| matches!(r.status, CorrelationRowStatus::Active | CorrelationRowStatus::Draining))
            .map(|r| r.clone()))
    }

    async fn create(&self, row: CorrelationStateRow) -> PipelineResult<CorrelationStateRow> {
        let key = (row.rule_id, row.entity_key.clone());
        match self.rows.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(existing) if matches!(existing.get().status, CorrelationRowStatus::Active | CorrelationRowStatus::Draining) => {
                Err(PipelineError::StateConflict(format!(
                    "active row already exists for rule {} entity {}",
                    row.rule_id, row.entity_key
                )))
            }
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                existing.insert(row.clone());
                Ok(row)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(row.clone());
                Ok(row)
            }
        }
    }

    async fn update(&self, mut row: CorrelationStateRow, expected_version: i64) -> PipelineResult<CorrelationStateRow> {
        let key = (row.rule_id, row.entity_key.clone());
        let mut entry = self
            .rows
            .get_mut(&key)
            .ok_or_else(|| PipelineError::StateConflict("row does not exist".to_string()))?;

        if entry.version != expected_version {
            return Err(PipelineError::StateConflict(format!(
                "version mismatch: expected {expected_version}, found {}",
                entry.version
            )));
        }

        row.version = expected_version + 1;
        if matches!(row.status, CorrelationRowStatus::Completed | CorrelationRowStatus::Expired) {
            self.terminal_since.insert(key.clone(), Utc::now());
        }
        *entry = row.clone();
        Ok(row)
    }

    async fn scan_expirable(&self, now: DateTime<Utc>, grace: chrono::Duration) -> PipelineResult<Vec<CorrelationStateRow>> {
        Ok(self
            .rows
            .iter()
            .filter(|r| {
                matches!(r.status, CorrelationRowStatus::Active | CorrelationRowStatus::Draining)
                    && r.window_end < now - grace
            })
            .map(|r| r.clone())
            .collect())
    }

    async fn mark_expired(&self, rule_id: Uuid, entity_key: &EntityKey, expected_version: i64) -> PipelineResult<()> {
        let key = (rule_id, entity_key.clone());
        let mut entry = self
            .rows
            .get_mut(&key)
            .ok_or_else(|| PipelineError::StateConflict("row does not exist".to_string()))?;
        if entry.version != expected_version {
            return Err(PipelineError::StateConflict("version mismatch on expiry".to_string()));
        }
        entry.status = CorrelationRowStatus::Expired;
        entry.version += 1;
        self.terminal_since.insert(key, Utc::now());
        Ok(())
    }

    async fn scan_draining_candidates(
        &self,
        now: DateTime<Utc>,
        lateness_bound: chrono::Duration,
    ) -> PipelineResult<Vec<CorrelationStateRow>> {
        Ok(self
            .rows
            .iter()
            .filter(|r| {
                matches!(r.status, CorrelationRowStatus::Active) && r.window_end <= now && r.window_end + lateness_bound > now
            })
            .map(|r| r.clone())
            .collect())
    }

    async fn mark_draining(&self, rule_id: Uuid, entity_key: &EntityKey, expected_version: i64) -> PipelineResult<()> {
        let key = (rule_id, entity_key.clone());
        let mut entry = self
            .rows
            .get_mut(&key)
            .ok_or_else(|| PipelineError::StateConflict("row does not exist".to_string()))?;
        if entry.version != expected_version {
            return Err(PipelineError::StateConflict("version mismatch on draining transition".to_string()));
        }
        entry.status = CorrelationRowStatus::Draining;
        entry.version += 1;
        Ok(())
    }

    async fn garbage_collect(&self, now: DateTime<Utc>, retention: chrono::Duration) -> PipelineResult<u64> {
        let expired_keys: Vec<RowKey> = self
            .terminal_since
            .iter()
            .filter(|entry| now - *entry.value() > retention)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired_keys {
            self.rows.remove(&key);
            self.terminal_since.remove(&key);
            removed += 1;
        }
        Ok(removed)
    }
}
