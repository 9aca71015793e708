//! `sqlx`-backed [`RuleStore`], grounded on the combined sqlx/Postgres usage
//! in `Lowband21-ferrex`'s `core`/`ferrex-server` crates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{CorrelationConfig, DetectionRule, ExecutionRecord, RuleFilter, RuleStore};
use crate::domain::{Dialect, RuleHealth, RuleKind, RuleStatus, Severity};
use crate::errors::{PipelineError, PipelineResult};

pub struct PgRuleStore {
    pool: PgPool,
}

impl PgRuleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_rule(row: &sqlx::postgres::PgRow) -> Result<DetectionRule, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        let dialect: String = row.try_get("dialect")?;
        let severity: String = row.try_get("severity")?;
        let status: String = row.try_get("status")?;
        let health: String = row.try_get("health")?;
        let correlation_config: Option<Json<CorrelationConfig>> =
            row.try_get("correlation_config")?;

        Ok(DetectionRule {
            rule_id: row.try_get("rule_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            kind: parse_kind(&kind),
            query: row.try_get("query")?,
            dialect: parse_dialect(&dialect),
            indices: row.try_get("indices")?,
            schedule_interval_minutes: row.try_get("schedule_interval_minutes")?,
            lookback_minutes: row.try_get("lookback_minutes")?,
            threshold_count: row.try_get("threshold_count")?,
            max_hits: row.try_get("max_hits")?,
            severity: parse_severity(&severity),
            status: parse_status(&status),
            health: parse_health(&health),
            correlation_config: correlation_config.map(|Json(c)| c),
            mitre_tactics: row.try_get("mitre_tactics")?,
            mitre_techniques: row.try_get("mitre_techniques")?,
            tags: row.try_get("tags")?,
            hit_count: row.try_get("hit_count")?,
            false_positive_count: row.try_get("false_positive_count")?,
            consecutive_failures: row.try_get("consecutive_failures")?,
            last_run_at: row.try_get("last_run_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            version: row.try_get("version")?,
        })
    }
}

fn parse_kind(s: &str) -> RuleKind {
    match s {
        "streaming" => RuleKind::Streaming,
        "correlation" => RuleKind::Correlation,
        _ => RuleKind::Scheduled,
    }
}

fn parse_dialect(s: &str) -> Dialect {
    match s {
        "esql" => Dialect::Esql,
        _ => Dialect::Kql,
    }
}

fn parse_severity(s: &str) -> Severity {
    match s {
        "informational" => Severity::Informational,
        "low" => Severity::Low,
        "high" => Severity::High,
        "critical" => Severity::Critical,
        _ => Severity::Medium,
    }
}

fn parse_status(s: &str) -> RuleStatus {
    match s {
        "disabled" => RuleStatus::Disabled,
        "testing" => RuleStatus::Testing,
        _ => RuleStatus::Enabled,
    }
}

fn parse_health(s: &str) -> RuleHealth {
    match s {
        "degraded" => RuleHealth::Degraded,
        _ => RuleHealth::Healthy,
    }
}

#[async_trait]
impl RuleStore for PgRuleStore {
    async fn list(&self, filter: RuleFilter) -> PipelineResult<Vec<DetectionRule>> {
        let kind = filter.kind.map(|k| format!("{k:?}").to_lowercase());
        let status = filter.status.map(|s| format!("{s:?}").to_lowercase());

        let rows = sqlx::query(
            "SELECT * FROM detection_rules \
             WHERE ($1::text IS NULL OR kind = $1) \
               AND ($2::text IS NULL OR status = $2) \
             ORDER BY name",
        )
        .bind(kind)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_rule).collect::<Result<_, _>>().map_err(PipelineError::from)
    }

    async fn get(&self, rule_id: Uuid) -> PipelineResult<Option<DetectionRule>> {
        let row = sqlx::query("SELECT * FROM detection_rules WHERE rule_id = $1")
            .bind(rule_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_rule).transpose().map_err(PipelineError::from)
    }

    async fn upsert(&self, rule: DetectionRule) -> PipelineResult<DetectionRule> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "INSERT INTO detection_rules (
                rule_id, name, description, kind, query, dialect, indices,
                schedule_interval_minutes, lookback_minutes, threshold_count, max_hits,
                severity, status, health, correlation_config,
                mitre_tactics, mitre_techniques, tags,
                hit_count, false_positive_count, consecutive_failures,
                last_run_at, created_at, updated_at, version
             ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19, $20, $21, $22, $23, $24, $25
             )
             ON CONFLICT (rule_id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                kind = EXCLUDED.kind,
                query = EXCLUDED.query,
                dialect = EXCLUDED.dialect,
                indices = EXCLUDED.indices,
                schedule_interval_minutes = EXCLUDED.schedule_interval_minutes,
                lookback_minutes = EXCLUDED.lookback_minutes,
                threshold_count = EXCLUDED.threshold_count,
                max_hits = EXCLUDED.max_hits,
                severity = EXCLUDED.severity,
                status = EXCLUDED.status,
                correlation_config = EXCLUDED.correlation_config,
                mitre_tactics = EXCLUDED.mitre_tactics,
                mitre_techniques = EXCLUDED.mitre_techniques,
                tags = EXCLUDED.tags,
                updated_at = EXCLUDED.updated_at,
                version = detection_rules.version + 1
             RETURNING *",
        )
        .bind(rule.rule_id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(format!("{:?}", rule.kind).to_lowercase())
        .bind(&rule.query)
        .bind(format!("{:?}", rule.dialect).to_lowercase())
        .bind(&rule.indices)
        .bind(rule.schedule_interval_minutes)
        .bind(rule.lookback_minutes)
        .bind(rule.threshold_count)
        .bind(rule.max_hits)
        .bind(format!("{:?}", rule.severity).to_lowercase())
        .bind(format!("{:?}", rule.status).to_lowercase())
        .bind(format!("{:?}", rule.health).to_lowercase())
        .bind(rule.correlation_config.clone().map(Json))
        .bind(&rule.mitre_tactics)
        .bind(&rule.mitre_techniques)
        .bind(&rule.tags)
        .bind(rule.hit_count)
        .bind(rule.false_positive_count)
        .bind(rule.consecutive_failures)
        .bind(rule.last_run_at)
        .bind(rule.created_at)
        .bind(Utc::now())
        .bind(rule.version)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Self::row_to_rule(&row).map_err(PipelineError::from)
    }

    async fn record_execution(&self, execution: ExecutionRecord) -> PipelineResult<()> {
        sqlx::query(
            "INSERT INTO rule_executions (
                execution_id, rule_id, started_at, completed_at, duration_ms,
                status, hits_count, error_message
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(execution.execution_id)
        .bind(execution.rule_id)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.duration_ms)
        .bind(format!("{:?}", execution.status).to_lowercase())
        .bind(execution.hits_count)
        .bind(&execution.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_last_run(&self, rule_id: Uuid, ts: DateTime<Utc>) -> PipelineResult<()> {
        // `last_run_at` only advances forward: a racing scheduler instance
        // that lost its lease mid-tick must not roll this back.
        sqlx::query(
            "UPDATE detection_rules SET last_run_at = $2, version = version + 1 \
             WHERE rule_id = $1 AND (last_run_at IS NULL OR last_run_at < $2)",
        )
        .bind(rule_id)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_hit_count(&self, rule_id: Uuid, delta: i64) -> PipelineResult<()> {
        sqlx::query("UPDATE detection_rules SET hit_count = hit_count + $2 WHERE rule_id = $1")
            .bind(rule_id)
            .bind(delta)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_execution_outcome(&self, rule_id: Uuid, succeeded: bool) -> PipelineResult<()> {
        if succeeded {
            sqlx::query(
                "UPDATE detection_rules SET consecutive_failures = 0, health = 'healthy' \
                 WHERE rule_id = $1",
            )
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE detection_rules SET consecutive_failures = consecutive_failures + 1, \
                 health = CASE WHEN consecutive_failures + 1 >= 3 THEN 'degraded' ELSE health END \
                 WHERE rule_id = $1",
            )
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn increment_false_positive_count(&self, rule_id: Uuid) -> PipelineResult<()> {
        sqlx::query(
            "UPDATE detection_rules SET false_positive_count = false_positive_count + 1 \
             WHERE rule_id = $1",
        )
        .bind(rule_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

