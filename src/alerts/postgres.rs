//! `sqlx`-backed [`AlertStore`], following the same row-mapping shape as
//! [`crate::rules::postgres::PgRuleStore`]: typed columns for the scalar
//! fields, JSON columns for the nested/variable-shape ones.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::entities::EntitySet;
use super::{AlertRecord, AlertStore};
use crate::domain::{AlertStatus, DedupKey};
use crate::errors::{PipelineError, PipelineResult};
use crate::historical::Hit;
use crate::state_machine::alert_lifecycle::AlertAction;
use crate::state_machine::StateMachine;

pub struct PgAlertStore {
    pool: PgPool,
}

impl PgAlertStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_alert(row: &sqlx::postgres::PgRow) -> Result<AlertRecord, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let Json(events): Json<std::collections::VecDeque<Hit>> = row.try_get("events")?;
        let Json(entities): Json<EntitySet> = row.try_get("entities")?;
        let Json(related_alert_ids): Json<Vec<Uuid>> = row.try_get("related_alert_ids")?;
        let dedup_key: String = row.try_get("dedup_key")?;

        Ok(AlertRecord {
            alert_id: row.try_get("alert_id")?,
            rule_id: row.try_get("rule_id")?,
            rule_name: row.try_get("rule_name")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            severity: parse_severity(&row.try_get::<String, _>("severity")?),
            status: parse_status(&status),
            hit_count: row.try_get("hit_count")?,
            first_seen_at: row.try_get("first_seen_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
            events,
            entities,
            dedup_key: DedupKey::from_raw(dedup_key),
            related_alert_ids,
            is_false_positive: row.try_get("is_false_positive")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            version: row.try_get("version")?,
        })
    }
}

fn parse_severity(s: &str) -> crate::domain::Severity {
    use crate::domain::Severity::*;
    match s {
        "informational" => Informational,
        "low" => Low,
        "high" => High,
        "critical" => Critical,
        _ => Medium,
    }
}

fn parse_status(s: &str) -> AlertStatus {
    match s {
        "acknowledged" => AlertStatus::Acknowledged,
        "in_progress" => AlertStatus::InProgress,
        "closed" => AlertStatus::Closed,
        _ => AlertStatus::Open,
    }
}

fn status_str(status: AlertStatus) -> &'static str {
    match status {
        AlertStatus::Open => "open",
        AlertStatus::Acknowledged => "acknowledged",
        AlertStatus::InProgress => "in_progress",
        AlertStatus::Closed => "closed",
    }
}

#[async_trait]
impl AlertStore for PgAlertStore {
    async fn find_open(&self, rule_id: Uuid, dedup_key: &DedupKey) -> PipelineResult<Option<AlertRecord>> {
        let row = sqlx::query(
            "SELECT * FROM alerts WHERE rule_id = $1 AND dedup_key = $2 AND status = 'open'",
        )
        .bind(rule_id)
        .bind(dedup_key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_alert).transpose().map_err(PipelineError::from)
    }

    async fn get(&self, alert_id: Uuid) -> PipelineResult<Option<AlertRecord>> {
        let row = sqlx::query("SELECT * FROM alerts WHERE alert_id = $1")
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_alert).transpose().map_err(PipelineError::from)
    }

    async fn upsert(&self, alert: AlertRecord) -> PipelineResult<AlertRecord> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "INSERT INTO alerts (
                alert_id, rule_id, rule_name, title, description, severity, status,
                hit_count, first_seen_at, last_seen_at, events, entities, dedup_key,
                related_alert_ids, is_false_positive, created_at, updated_at, version
             ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18
             )
             ON CONFLICT (alert_id) DO UPDATE SET
                hit_count = EXCLUDED.hit_count,
                last_seen_at = EXCLUDED.last_seen_at,
                events = EXCLUDED.events,
                entities = EXCLUDED.entities,
                status = EXCLUDED.status,
                is_false_positive = EXCLUDED.is_false_positive,
                updated_at = EXCLUDED.updated_at,
                version = alerts.version + 1
             RETURNING *",
        )
        .bind(alert.alert_id)
        .bind(alert.rule_id)
        .bind(&alert.rule_name)
        .bind(&alert.title)
        .bind(&alert.description)
        .bind(format!("{:?}", alert.severity).to_lowercase())
        .bind(status_str(alert.status))
        .bind(alert.hit_count)
        .bind(alert.first_seen_at)
        .bind(alert.last_seen_at)
        .bind(Json(alert.events.clone()))
        .bind(Json(alert.entities.clone()))
        .bind(alert.dedup_key.as_str())
        .bind(Json(alert.related_alert_ids.clone()))
        .bind(alert.is_false_positive)
        .bind(alert.created_at)
        .bind(Utc::now())
        .bind(alert.version)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Self::row_to_alert(&row).map_err(PipelineError::from)
    }

    async fn apply_transition(
        &self,
        alert_id: Uuid,
        action: AlertAction,
        is_false_positive: bool,
    ) -> PipelineResult<AlertRecord> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM alerts WHERE alert_id = $1 FOR UPDATE")
            .bind(alert_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| PipelineError::StateConflict(format!("alert {alert_id} does not exist")))?;
        let alert = Self::row_to_alert(&row)?;

        let (next_status, _) = alert
            .status
            .transition(&action)
            .map_err(|e| PipelineError::StateConflict(e.to_string()))?;

        let updated = sqlx::query(
            "UPDATE alerts SET status = $2, is_false_positive = $3, updated_at = $4, version = version + 1 \
             WHERE alert_id = $1 RETURNING *",
        )
        .bind(alert_id)
        .bind(status_str(next_status))
        .bind(is_false_positive)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Self::row_to_alert(&updated).map_err(PipelineError::from)
    }
}
