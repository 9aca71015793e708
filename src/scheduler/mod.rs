//! Scheduler / Runner: drives component liveness (§4.6).
//!
//! Three independent loops: the tick-driven, lease-based [`RuleScheduler`]
//! dispatching scheduled rules to a bounded worker pool; [`run_consumer_loop`]
//! generic `consume -> process -> ack` workers for the correlation and
//! indexer consumer groups; and [`ExpirySweeperDriver`] for the correlation
//! window sweep. Grounded on the teacher's `bin/netbox-projector.rs` message
//! loop, generalized from one consumer to the pipeline's several.

pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use self::postgres::PgSchedulerLease;

use crate::alerts::{AlertGenerator, RuleMatch};
use crate::buffer::EventBuffer;
use crate::correlation::{shard_for, CorrelationEngine, ExpirySweeper, MatchOutcome};
use crate::detection::DetectionEngine;
use crate::domain::{ExecutionStatus, RuleKind, RuleStatus};
use crate::errors::{Disposition, PipelineError, PipelineResult};
use crate::events::Event;
use crate::historical::HistoricalIndexer;
use crate::rules::{CorrelationConfig, DetectionRule, RuleFilter, RuleStore};
use crate::subjects::StreamName;

/// Generous upper bound on a single scheduled rule execution, racing the
/// historical-store search the way §5's "Cancellation" describes. Not
/// exposed in [`crate::config::PipelineConfig`] since no deployment has
/// needed to tune it independently of `scheduler.tick_seconds` yet.
const RULE_EXECUTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Single-leader lease so at most one scheduler instance dispatches rules
/// in a multi-instance deployment (§4.6 "single-leader (lease-based)").
#[async_trait]
pub trait SchedulerLease: Send + Sync {
    /// Becomes leader if no other holder's lease is current.
    async fn try_acquire(&self, holder: &str, now: DateTime<Utc>, ttl: chrono::Duration) -> PipelineResult<bool>;
    /// Extends the lease; only succeeds if `holder` is still the current leader.
    async fn renew(&self, holder: &str, now: DateTime<Utc>, ttl: chrono::Duration) -> PipelineResult<bool>;
    async fn release(&self, holder: &str) -> PipelineResult<()>;
}

/// In-process lease for tests and single-instance deployments.
#[derive(Default)]
pub struct InMemorySchedulerLease {
    state: std::sync::Mutex<Option<(String, DateTime<Utc>)>>,
}

#[async_trait]
impl SchedulerLease for InMemorySchedulerLease {
    async fn try_acquire(&self, holder: &str, now: DateTime<Utc>, ttl: chrono::Duration) -> PipelineResult<bool> {
        let mut state = self.state.lock().unwrap();
        match &*state {
            Some((_, expires_at)) if *expires_at > now => Ok(false),
            _ => {
                *state = Some((holder.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn renew(&self, holder: &str, now: DateTime<Utc>, ttl: chrono::Duration) -> PipelineResult<bool> {
        let mut state = self.state.lock().unwrap();
        match &*state {
            Some((current, _)) if current == holder => {
                *state = Some((holder.to_string(), now + ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, holder: &str) -> PipelineResult<()> {
        let mut state = self.state.lock().unwrap();
        if matches!(&*state, Some((current, _)) if current == holder) {
            *state = None;
        }
        Ok(())
    }
}

/// Rule scheduler: once per tick, dispatches every due scheduled rule to a
/// bounded worker pool under a leader lease.
pub struct RuleScheduler {
    rule_store: Arc<dyn RuleStore>,
    detection_engine: Arc<DetectionEngine>,
    alert_generator: Arc<AlertGenerator>,
    lease: Arc<dyn SchedulerLease>,
    holder_id: String,
    tick: Duration,
    workers: usize,
}

impl RuleScheduler {
    pub fn new(
        rule_store: Arc<dyn RuleStore>,
        detection_engine: Arc<DetectionEngine>,
        alert_generator: Arc<AlertGenerator>,
        lease: Arc<dyn SchedulerLease>,
        tick: Duration,
        workers: usize,
    ) -> Self {
        Self {
            rule_store,
            detection_engine,
            alert_generator,
            lease,
            holder_id: Uuid::new_v4().to_string(),
            tick,
            workers,
        }
    }

    /// Runs the tick loop until `cancel` fires, then releases the lease.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(error) = self.tick_once(Utc::now()).await {
                        tracing::error!(%error, "scheduler tick failed");
                    }
                }
            }
        }
        let _ = self.lease.release(&self.holder_id).await;
    }

    /// One tick: acquire/renew leadership, then dispatch every due rule to
    /// the worker pool. Re-checks leadership before each dispatch so losing
    /// the lease mid-tick aborts remaining dispatch rather than risking a
    /// second instance firing the same rule (§4.6 "single leader").
    pub async fn tick_once(&self, now: DateTime<Utc>) -> PipelineResult<()> {
        let ttl = chrono::Duration::seconds(self.tick.as_secs().max(1) as i64 * 2);
        let is_leader = self.lease.try_acquire(&self.holder_id, now, ttl).await?
            || self.lease.renew(&self.holder_id, now, ttl).await?;
        if !is_leader {
            return Ok(());
        }

        let rules = self
            .rule_store
            .list(RuleFilter {
                kind: Some(RuleKind::Scheduled),
                status: Some(RuleStatus::Enabled),
            })
            .await?;
        let due: Vec<DetectionRule> = rules.into_iter().filter(|r| r.due(now)).collect();

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(due.len());

        for rule in due {
            if !self.lease.renew(&self.holder_id, Utc::now(), ttl).await? {
                tracing::warn!("lost scheduler lease mid-tick; aborting remaining dispatch");
                break;
            }

            let semaphore = semaphore.clone();
            let rule_store = self.rule_store.clone();
            let detection_engine = self.detection_engine.clone();
            let alert_generator = self.alert_generator.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
                if let Err(error) = dispatch_rule(rule, rule_store, detection_engine, alert_generator).await {
                    tracing::error!(%error, "scheduled rule execution failed");
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

fn cancel_after(duration: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        child.cancel();
    });
    token
}

async fn dispatch_rule(
    rule: DetectionRule,
    rule_store: Arc<dyn RuleStore>,
    detection_engine: Arc<DetectionEngine>,
    alert_generator: Arc<AlertGenerator>,
) -> PipelineResult<()> {
    let cancel = cancel_after(RULE_EXECUTION_TIMEOUT);
    let outcome = detection_engine.execute_rule(&rule, cancel).await?;
    let succeeded = outcome.execution.status == ExecutionStatus::Completed;

    rule_store.record_execution(outcome.execution).await?;
    rule_store.record_execution_outcome(rule.rule_id, succeeded).await?;
    rule_store.update_last_run(rule.rule_id, Utc::now()).await?;

    if outcome.threshold_exceeded {
        rule_store
            .increment_hit_count(rule.rule_id, outcome.hits.len() as i64)
            .await?;
        alert_generator
            .ingest_match(RuleMatch {
                rule_id: rule.rule_id,
                rule_name: rule.name.clone(),
                severity: rule.severity,
                hits: outcome.hits,
                threshold_exceeded: true,
            })
            .await?;
    }
    Ok(())
}

/// Per-message work a consumer worker performs between `consume` and `ack`.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, event: &Event) -> PipelineResult<()>;
}

/// One unit of correlation work routed to a shard lane: a single rule's
/// entity-keyed evaluation of one event.
struct ShardJob {
    rule_id: Uuid,
    config: Arc<CorrelationConfig>,
    event: Event,
    reply: tokio::sync::oneshot::Sender<PipelineResult<MatchOutcome>>,
}

/// Feeds every event on the `events` stream through every enabled
/// correlation rule, handing completed matches to the Alert Generator
/// (§2 "Data flow", correlation consumer group).
///
/// Per-entity ordering (§4.4 "Per-entity ordering guarantee") is achieved by
/// hashing each `(rule_id, entity_key)` pair to one of `num_shards` lanes,
/// each a single-threaded task draining its own channel — two events for
/// the same entity key always land on the same lane and so are processed in
/// the order this consumer's caller observed them, while distinct entities
/// (almost always landing on distinct lanes) advance concurrently.
pub struct CorrelationConsumer {
    rule_store: Arc<dyn RuleStore>,
    engine: Arc<CorrelationEngine>,
    alert_generator: Arc<AlertGenerator>,
    lanes: Vec<tokio::sync::mpsc::Sender<ShardJob>>,
    num_shards: usize,
    _shards: Vec<tokio::task::JoinHandle<()>>,
}

impl CorrelationConsumer {
    /// Spawns `num_shards` single-threaded lane workers, each owning a
    /// bounded mailbox of [`ShardJob`]s.
    pub fn new(
        rule_store: Arc<dyn RuleStore>,
        engine: Arc<CorrelationEngine>,
        alert_generator: Arc<AlertGenerator>,
        num_shards: usize,
    ) -> Self {
        let num_shards = num_shards.max(1);
        let mut lanes = Vec::with_capacity(num_shards);
        let mut shards = Vec::with_capacity(num_shards);

        for _ in 0..num_shards {
            let (tx, mut rx) = tokio::sync::mpsc::channel::<ShardJob>(256);
            let engine = engine.clone();
            let handle = tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    let outcome = engine.process_event(job.rule_id, &job.config, &job.event).await;
                    let _ = job.reply.send(outcome);
                }
            });
            lanes.push(tx);
            shards.push(handle);
        }

        Self {
            rule_store,
            engine,
            alert_generator,
            lanes,
            num_shards,
            _shards: shards,
        }
    }
}

#[async_trait]
impl MessageProcessor for CorrelationConsumer {
    async fn process(&self, event: &Event) -> PipelineResult<()> {
        // Re-listed per event rather than cached: correctness over
        // throughput for this exercise's scope, and rule edits (enable,
        // disable, stage changes) take effect on the very next event.
        let rules = self
            .rule_store
            .list(RuleFilter {
                kind: Some(RuleKind::Correlation),
                status: Some(RuleStatus::Enabled),
            })
            .await?;

        for rule in rules {
            let Some(config) = rule.correlation_config.clone() else {
                continue;
            };
            let config = Arc::new(config);

            let Some(entity_key) = self.engine.entity_key_for(event, &config.entity_key_fields) else {
                continue;
            };
            let lane = shard_for(&entity_key, self.num_shards);

            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            self.lanes[lane]
                .send(ShardJob {
                    rule_id: rule.rule_id,
                    config,
                    event: event.clone(),
                    reply: reply_tx,
                })
                .await
                .map_err(|_| PipelineError::Fatal("correlation shard lane closed".to_string()))?;

            let outcome = reply_rx
                .await
                .map_err(|_| PipelineError::Fatal("correlation shard lane dropped reply".to_string()))??;

            if let MatchOutcome::Completed { hits } = outcome {
                self.rule_store.increment_hit_count(rule.rule_id, 1).await?;
                self.alert_generator
                    .ingest_match(RuleMatch {
                        rule_id: rule.rule_id,
                        rule_name: rule.name.clone(),
                        severity: rule.severity,
                        hits,
                        threshold_exceeded: true,
                    })
                    .await?;
            }
        }
        Ok(())
    }
}

/// Writes every event into the historical store's index, the "lightweight
/// indexer" consumer group from §2's data flow.
pub struct IndexerConsumer {
    indexer: Arc<dyn HistoricalIndexer>,
    index_name: String,
}

impl IndexerConsumer {
    pub fn new(indexer: Arc<dyn HistoricalIndexer>, index_name: impl Into<String>) -> Self {
        Self {
            indexer,
            index_name: index_name.into(),
        }
    }
}

#[async_trait]
impl MessageProcessor for IndexerConsumer {
    async fn process(&self, event: &Event) -> PipelineResult<()> {
        self.indexer.index(&self.index_name, event).await
    }
}

/// Generic `consume -> process -> ack` worker loop (§4.6 "Consumer
/// workers"). Dispatches on [`Disposition`] rather than matching error
/// variants directly, per the tagged-result redesign: `Retry` leaves the
/// entry unacked for JetStream's `ack_wait` redelivery (unless the message's
/// own delivery budget is exhausted, in which case it is dead-lettered
/// immediately), `DeadLetter` moves it off the stream, `Surface` acks and
/// logs (retrying would not help), `Abort` stops the worker.
pub async fn run_consumer_loop(
    buffer: Arc<dyn EventBuffer>,
    stream: StreamName,
    group: String,
    consumer_name: String,
    processor: Arc<dyn MessageProcessor>,
    batch_size: usize,
    block_ms: u64,
    claim_idle_ms: u64,
    max_deliveries: u64,
    cancel: CancellationToken,
) -> PipelineResult<()> {
    while !cancel.is_cancelled() {
        let mut deliveries = buffer
            .consume(stream, &group, &consumer_name, batch_size, block_ms)
            .await?;
        if deliveries.is_empty() {
            deliveries = buffer
                .claim_pending(stream, &group, &consumer_name, claim_idle_ms, batch_size)
                .await?;
        }
        if deliveries.is_empty() {
            continue;
        }

        for delivery in deliveries {
            match processor.process(&delivery.event).await {
                Ok(()) => {
                    buffer.ack(stream, &group, &[delivery.message_id]).await?;
                }
                Err(error) => match error.disposition() {
                    Disposition::DeadLetter => {
                        let message = error.to_string();
                        buffer
                            .dead_letter(stream, &group, delivery.message_id, delivery.event, &message)
                            .await?;
                    }
                    Disposition::Retry if delivery.delivery_count >= max_deliveries => {
                        let message = format!("retry budget exhausted: {error}");
                        buffer
                            .dead_letter(stream, &group, delivery.message_id, delivery.event, &message)
                            .await?;
                    }
                    Disposition::Retry => {
                        tracing::warn!(%error, delivery_count = delivery.delivery_count, "retrying after transient failure");
                    }
                    Disposition::Surface => {
                        tracing::warn!(%error, "non-retryable failure; acking and moving on");
                        buffer.ack(stream, &group, &[delivery.message_id]).await?;
                    }
                    Disposition::Abort => return Err(error),
                },
            }
        }
    }
    Ok(())
}

/// Drives [`ExpirySweeper::sweep_once`] on a fixed cadence (§4.6 "Expiry
/// sweeper", default 30 s).
pub struct ExpirySweeperDriver {
    sweeper: Arc<ExpirySweeper>,
    interval: Duration,
}

impl ExpirySweeperDriver {
    pub fn new(sweeper: Arc<ExpirySweeper>, interval: Duration) -> Self {
        Self { sweeper, interval }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sweeper.sweep_once(Utc::now()).await {
                        Ok(expired) if expired > 0 => tracing::info!(expired, "expiry sweep completed"),
                        Ok(_) => {}
                        Err(error) => tracing::error!(%error, "expiry sweep failed"),
                    }
                }
            }
        }
    }
}


/// Test-only alert store kept adjacent to the scheduler tests that need one
/// but live outside [`crate::alerts`]'s own test module.
#[cfg(test)]
mod tests_support {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::alerts::{AlertRecord, AlertStore};
    use crate::domain::{AlertStatus, DedupKey};
    use crate::errors::PipelineResult;
    use crate::state_machine::alert_lifecycle::AlertAction;
    use crate::state_machine::StateMachine;

    #[derive(Default)]
    pub struct InMemoryAlertStore {
        alerts: Mutex<HashMap<Uuid, AlertRecord>>,
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
}
