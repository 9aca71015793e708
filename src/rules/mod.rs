//! Rule Store: persistent inventory of detection rules and execution history.
//!
//! §4.2. Backed by `sqlx::PgPool`; see [`postgres::PgRuleStore`].

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Dialect, RuleHealth, RuleKind, RuleStatus, Severity, StageOrder};
use crate::errors::PipelineResult;

pub use self::postgres::PgRuleStore;

/// Per-stage predicate/group-by definition within a correlation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationStage {
    /// Opaque predicate, same dialect as the owning rule's `query`.
    pub predicate: String,
    /// Declared output fields: captured from the most recent matching event
    /// into `StageProgress::group_by_values` (§4.4 step 6), independent of
    /// `CorrelationConfig::require_distinct`.
    pub group_by: Vec<String>,
}

/// `correlation_config`, present only when `kind == correlation` (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    pub stages: Vec<CorrelationStage>,
    pub entity_key_fields: Vec<String>,
    pub window_duration_seconds: i64,
    pub stage_order: StageOrder,
    pub min_count_per_stage: u32,
    pub require_distinct: Option<String>,
}

/// A detection rule as stored by the Rule Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRule {
    pub rule_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub kind: RuleKind,
    pub query: String,
    pub dialect: Dialect,
    pub indices: Vec<String>,
    pub schedule_interval_minutes: Option<i64>,
    pub lookback_minutes: i64,
    pub threshold_count: i64,
    pub max_hits: i64,
    pub severity: Severity,
    pub status: RuleStatus,
    pub health: RuleHealth,
    pub correlation_config: Option<CorrelationConfig>,
    pub mitre_tactics: Vec<String>,
    pub mitre_techniques: Vec<String>,
    pub tags: Vec<String>,
    pub hit_count: i64,
    pub false_positive_count: i64,
    pub consecutive_failures: i32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl DetectionRule {
    /// Whether a tick at `now` should dispatch this rule (§4.6).
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        if self.status != RuleStatus::Enabled {
            return false;
        }
        let Some(interval) = self.schedule_interval_minutes else {
            return false;
        };
        match self.last_run_at {
            None => true,
            Some(last_run) => now >= last_run + chrono::Duration::minutes(interval),
        }
    }
}

/// Execution audit trail entry (§3 "Execution Record"); append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub rule_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: crate::domain::ExecutionStatus,
    pub hits_count: i64,
    pub error_message: Option<String>,
}

/// Filter for [`RuleStore::list`].
#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub kind: Option<RuleKind>,
    pub status: Option<RuleStatus>,
}

/// Persistent inventory of rules and their execution history (§4.2).
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn list(&self, filter: RuleFilter) -> PipelineResult<Vec<DetectionRule>>;
    async fn get(&self, rule_id: Uuid) -> PipelineResult<Option<DetectionRule>>;
    async fn upsert(&self, rule: DetectionRule) -> PipelineResult<DetectionRule>;
    async fn record_execution(&self, execution: ExecutionRecord) -> PipelineResult<()>;

    /// Serialized per rule (the store, not the scheduler's lease, is the
    /// last line of defense against clock-skew double-firing).
    async fn update_last_run(&self, rule_id: Uuid, ts: DateTime<Utc>) -> PipelineResult<()>;
    async fn increment_hit_count(&self, rule_id: Uuid, delta: i64) -> PipelineResult<()>;

    /// Flips `health` to `Degraded` after three consecutive execution
    /// failures, `Healthy` on the next success (§7 "user-visible failure
    /// behavior").
    async fn record_execution_outcome(&self, rule_id: Uuid, succeeded: bool) -> PipelineResult<()>;
    async fn increment_false_positive_count(&self, rule_id: Uuid) -> PipelineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn rule_with(last_run_at: Option<DateTime<Utc>>, interval: Option<i64>, status: RuleStatus) -> DetectionRule {
        DetectionRule {
            rule_id: Uuid::new_v4(),
            name: "test".into(),
            description: None,
            kind: RuleKind::Scheduled,
            query: "*".into(),
            dialect: Dialect::Kql,
            indices: vec![],
            schedule_interval_minutes: interval,
            lookback_minutes: 5,
            threshold_count: 0,
            max_hits: 10_000,
            severity: Severity::Medium,
            status,
            health: RuleHealth::Healthy,
            correlation_config: None,
            mitre_tactics: vec![],
            mitre_techniques: vec![],
            tags: vec![],
            hit_count: 0,
            false_positive_count: 0,
            consecutive_failures: 0,
            last_run_at,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            version: 1,
        }
    }

    #[test]
    fn never_run_rule_is_due() {
        let rule = rule_with(None, Some(5), RuleStatus::Enabled);
        assert!(rule.due(Utc::now()));
    }

    #[test]
    fn disabled_rule_is_never_due() {
        let rule = rule_with(None, Some(5), RuleStatus::Disabled);
        assert!(!rule.due(Utc::now()));
    }

    #[test_case(4, false; "before interval elapses")]
    #[test_case(5, true; "exactly at interval")]
    #[test_case(6, true; "after interval")]
    fn due_respects_schedule_interval(minutes_elapsed: i64, expected_due: bool) {
        let now = Utc::now();
        let rule = rule_with(
            Some(now - chrono::Duration::minutes(minutes_elapsed)),
            Some(5),
            RuleStatus::Enabled,
        );
        assert_eq!(rule.due(now), expected_due);
    }
}
