//! Cross-cutting value objects and enums shared by every component.

mod dedup_key;
mod entity_key;

pub use dedup_key::DedupKey;
pub use entity_key::{EntityKey, EntityKeyError};

use serde::{Deserialize, Serialize};

/// Rule severity, propagated onto the alerts it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

/// Query dialect a rule's opaque `query` string is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// KQL/Lucene-style query string.
    Kql,
    /// ES|QL-like pipelined dialect.
    Esql,
}

/// What a detection rule is and how it is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Scheduled,
    Streaming,
    Correlation,
}

/// Operator-controlled enable/disable state of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Enabled,
    Disabled,
    Testing,
}

/// Health derived from consecutive execution failures; surfaced alongside
/// `RuleStatus` but never flips it automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleHealth {
    Healthy,
    Degraded,
}

/// Stream-level backpressure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    DropOldest,
    RejectNew,
}

/// Ordering constraint for a correlation rule's stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOrder {
    Strict,
    AnyOrder,
}

/// Status of a correlation state row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationRowStatus {
    Active,
    /// Short-lived state between `active` and `expired` absorbing W_late.
    Draining,
    Completed,
    Expired,
}

/// Lifecycle status of an alert; see [`crate::alerts`] for the transition DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    InProgress,
    Closed,
}

/// Status of a rule/event execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}
