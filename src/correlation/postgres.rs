//! `sqlx`-backed [`CorrelationStateStore`]. One row per `(rule_id,
//! entity_key)` in `correlation_states`, following the same JSON-column
//! shape as [`crate::rules::postgres::PgRuleStore`] and
//! [`crate::alerts::postgres::PgAlertStore`]. The CAS `version` column is
//! the durable half of §4.4's "Concurrency & locking"; the in-process
//! per-shard single-writer worker is the fast-path half.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::state::{CorrelationStateRow, StageProgress};
use super::CorrelationStateStore;
use crate::domain::{CorrelationRowStatus, EntityKey};
use crate::errors::{PipelineError, PipelineResult};

pub struct PgCorrelationStateStore {
    pool: PgPool,
}

impl PgCorrelationStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_state(row: &sqlx::postgres::PgRow) -> Result<CorrelationStateRow, sqlx::Error> {
        let entity_key: String = row.try_get("entity_key")?;
        let status: String = row.try_get("status")?;
        let Json(stages): Json<Vec<StageProgress>> = row.try_get("stages")?;
        let Json(match_order): Json<Vec<usize>> = row.try_get("match_order")?;
        let Json(seen_event_ids): Json<std::collections::HashSet<String>> = row.try_get("seen_event_ids")?;

        Ok(CorrelationStateRow {
            rule_id: row.try_get("rule_id")?,
            entity_key: EntityKey::new(entity_key).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            stages,
            window_start: row.try_get("window_start")?,
            window_end: row.try_get("window_end")?,
            status: parse_status(&status),
            match_order,
            seen_event_ids,
            version: row.try_get("version")?,
        })
    }
}

fn parse_status(s: &str) -> CorrelationRowStatus {
    match s {
        "draining" => CorrelationRowStatus::Draining,
        "completed" => CorrelationRowStatus::Completed,
        "expired" => CorrelationRowStatus::Expired,
        _ => CorrelationRowStatus::Active,
    }
}

fn status_str(status: CorrelationRowStatus) -> &'static str {
    match status {
        CorrelationRowStatus::Active => "active",
        CorrelationRowStatus::Draining => "draining",
        CorrelationRowStatus::Completed => "completed",
        CorrelationRowStatus::Expired => "expired",
    }
}

#[async_trait]
impl CorrelationStateStore for PgCorrelationStateStore {
    async fn get_active(&self, rule_id: Uuid, entity_key: &EntityKey) -> PipelineResult<Option<CorrelationStateRow>> {
        let row = sqlx::query(
            "SELECT * FROM correlation_states WHERE rule_id = $1 AND entity_key = $2 \
             AND status IN ('active', 'draining')",
        )
        .bind(rule_id)
        .bind(entity_key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_state).transpose().map_err(PipelineError::from)
    }

    async fn create(&self, row: CorrelationStateRow) -> PipelineResult<CorrelationStateRow> {
        let existing = sqlx::query(
            "SELECT status FROM correlation_states WHERE rule_id = $1 AND entity_key = $2",
        )
        .bind(row.rule_id)
        .bind(row.entity_key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(existing) = &existing {
            let status: String = existing.try_get("status")?;
            if matches!(parse_status(&status), CorrelationRowStatus::Active | CorrelationRowStatus::Draining) {
                return Err(PipelineError::StateConflict(format!(
                    "active row already exists for rule {} entity {}",
                    row.rule_id, row.entity_key
                )));
            }
        }

        let inserted = sqlx::query(
            "INSERT INTO correlation_states (
                rule_id, entity_key, stages, window_start, window_end, status,
                match_order, seen_event_ids, version
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0)
             ON CONFLICT (rule_id, entity_key) DO UPDATE SET
                stages = EXCLUDED.stages,
                window_start = EXCLUDED.window_start,
                window_end = EXCLUDED.window_end,
                status = EXCLUDED.status,
                match_order = EXCLUDED.match_order,
                seen_event_ids = EXCLUDED.seen_event_ids,
                version = 0
             RETURNING *",
        )
        .bind(row.rule_id)
        .bind(row.entity_key.as_str())
        .bind(Json(row.stages.clone()))
        .bind(row.window_start)
        .bind(row.window_end)
        .bind(status_str(row.status))
        .bind(Json(row.match_order.clone()))
        .bind(Json(row.seen_event_ids.clone()))
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_state(&inserted).map_err(PipelineError::from)
    }

    async fn update(&self, row: CorrelationStateRow, expected_version: i64) -> PipelineResult<CorrelationStateRow> {
        let updated = sqlx::query(
            "UPDATE correlation_states SET
                stages = $3, window_start = $4, window_end = $5, status = $6,
                match_order = $7, seen_event_ids = $8, version = version + 1
             WHERE rule_id = $1 AND entity_key = $2 AND version = $9
             RETURNING *",
        )
        .bind(row.rule_id)
        .bind(row.entity_key.as_str())
        .bind(Json(row.stages.clone()))
        .bind(row.window_start)
        .bind(row.window_end)
        .bind(status_str(row.status))
        .bind(Json(row.match_order.clone()))
        .bind(Json(row.seen_event_ids.clone()))
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            PipelineError::StateConflict(format!(
                "version mismatch updating row for rule {} entity {}",
                row.rule_id, row.entity_key
            ))
        })?;

        Self::row_to_state(&updated).map_err(PipelineError::from)
    }

    async fn scan_expirable(&self, now: DateTime<Utc>, grace: chrono::Duration) -> PipelineResult<Vec<CorrelationStateRow>> {
        let cutoff = now - grace;
        let rows = sqlx::query(
            "SELECT * FROM correlation_states WHERE status IN ('active', 'draining') AND window_end < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_state).collect::<Result<Vec<_>, _>>().map_err(PipelineError::from)
    }

    async fn mark_expired(&self, rule_id: Uuid, entity_key: &EntityKey, expected_version: i64) -> PipelineResult<()> {
        let result = sqlx::query(
            "UPDATE correlation_states SET status = 'expired', version = version + 1 \
             WHERE rule_id = $1 AND entity_key = $2 AND version = $3",
        )
        .bind(rule_id)
        .bind(entity_key.as_str())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::StateConflict("version mismatch on expiry".to_string()));
        }
        Ok(())
    }

    async fn scan_draining_candidates(
        &self,
        now: DateTime<Utc>,
        lateness_bound: chrono::Duration,
    ) -> PipelineResult<Vec<CorrelationStateRow>> {
        let cutoff = now - lateness_bound;
        let rows = sqlx::query(
            "SELECT * FROM correlation_states WHERE status = 'active' AND window_end <= $1 AND window_end > $2",
        )
        .bind(now)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_state).collect::<Result<Vec<_>, _>>().map_err(PipelineError::from)
    }

    async fn mark_draining(&self, rule_id: Uuid, entity_key: &EntityKey, expected_version: i64) -> PipelineResult<()> {
        let result = sqlx::query(
            "UPDATE correlation_states SET status = 'draining', version = version + 1 \
             WHERE rule_id = $1 AND entity_key = $2 AND version = $3 AND status = 'active'",
        )
        .bind(rule_id)
        .bind(entity_key.as_str())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::StateConflict("version mismatch on draining transition".to_string()));
        }
        Ok(())
    }

    async fn garbage_collect(&self, now: DateTime<Utc>, retention: chrono::Duration) -> PipelineResult<u64> {
        let cutoff = now - retention;
        let result = sqlx::query(
            "DELETE FROM correlation_states WHERE status IN ('completed', 'expired') AND window_end < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
