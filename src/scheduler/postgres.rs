//! `sqlx`-backed [`SchedulerLease`], a single row guarded by a conditional
//! `UPDATE`/`INSERT` so only one instance's holder id is current at a time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::SchedulerLease;
use crate::errors::PipelineResult;

pub struct PgSchedulerLease {
    pool: PgPool,
}

impl PgSchedulerLease {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchedulerLease for PgSchedulerLease {
    async fn try_acquire(&self, holder: &str, now: DateTime<Utc>, ttl: chrono::Duration) -> PipelineResult<bool> {
        let expires_at = now + ttl;
        let result = sqlx::query(
            "INSERT INTO scheduler_lease (id, holder, expires_at)
             VALUES (1, $1, $2)
             ON CONFLICT (id) DO UPDATE SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
             WHERE scheduler_lease.expires_at < $3",
        )
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn renew(&self, holder: &str, now: DateTime<Utc>, ttl: chrono::Duration) -> PipelineResult<bool> {
        let expires_at = now + ttl;
        let result = sqlx::query("UPDATE scheduler_lease SET expires_at = $2 WHERE id = 1 AND holder = $1")
            .bind(holder)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, holder: &str) -> PipelineResult<()> {
        sqlx::query("UPDATE scheduler_lease SET expires_at = now() WHERE id = 1 AND holder = $1")
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
