//! Correlation Engine: stateful windowed sequence matching across streaming
//! events sharing an entity key (§4.4). The hardest subsystem in the spec.

pub mod postgres;
pub mod shard;
pub mod state;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{CorrelationRowStatus, EntityKey, StageOrder};
use crate::errors::{PipelineError, PipelineResult};
use crate::events::Event;
use crate::historical::Hit;
use crate::rules::CorrelationConfig;

pub use self::postgres::PgCorrelationStateStore;
pub use self::shard::shard_for;
pub use self::state::{CorrelationStateRow, CorrelationStateStore, InMemoryCorrelationStateStore};

/// Evaluates a stage's opaque predicate against an event. Predicate syntax
/// is deliberately out of scope (query-language design is a Non-goal); this
/// is the seam a real implementation plugs a rule-expression evaluator into.
#[async_trait]
pub trait PredicateEvaluator: Send + Sync {
    async fn evaluate(&self, predicate: &str, event: &Event) -> PipelineResult<bool>;
}

/// Reference evaluator for a minimal `field.path=value` predicate language,
/// sufficient to drive the engine's own tests without depending on a real
/// query grammar.
pub struct FieldEqualityEvaluator;

#[async_trait]
impl PredicateEvaluator for FieldEqualityEvaluator {
    async fn evaluate(&self, predicate: &str, event: &Event) -> PipelineResult<bool> {
        let Some((path, expected)) = predicate.split_once('=') else {
            return Err(PipelineError::PredicateFailure(format!(
                "malformed predicate: {predicate}"
            )));
        };
        Ok(event.fields.get(path) == Some(expected))
    }
}

/// Result of folding one event into the correlation state machine.
#[derive(Debug)]
pub enum MatchOutcome {
    /// No row existed and the event didn't open one, or a field required
    /// for the entity key was missing.
    Dropped { reason: String },
    /// A new row was opened on stage 0 (strict) or any stage (any_order).
    Opened,
    /// An existing row absorbed the event but is not yet complete.
    Advanced,
    /// All stages satisfied; carries the synthetic hits bundle (every event
    /// that contributed to the match) for the Alert Generator.
    Completed { hits: Vec<Hit> },
}

pub struct CorrelationEngine {
    store: Arc<dyn CorrelationStateStore>,
    evaluator: Arc<dyn PredicateEvaluator>,
    lateness_bound: chrono::Duration,
    optimistic_retries: u32,
}

impl CorrelationEngine {
    pub fn new(
        store: Arc<dyn CorrelationStateStore>,
        evaluator: Arc<dyn PredicateEvaluator>,
        lateness_bound: chrono::Duration,
        optimistic_retries: u32,
    ) -> Self {
        Self {
            store,
            evaluator,
            lateness_bound,
            optimistic_retries,
        }
    }

    /// Computes the entity key from `entity_key_fields`; returns `None` if
    /// any required field is missing from the event (step 1).
    pub fn entity_key_for(&self, event: &Event, entity_key_fields: &[String]) -> Option<EntityKey> {
        let mut parts = Vec::with_capacity(entity_key_fields.len());
        for field in entity_key_fields {
            parts.push(event.fields.get(field)?.to_string());
        }
        EntityKey::new(parts.join("|")).ok()
    }

    /// Processes a single event against `rule_id`'s correlation configuration.
    /// Retries up to `optimistic_retries` times on state-conflict before
    /// surfacing the error for dead-lettering (§4.4 failure semantics).
    pub async fn process_event(
        &self,
        rule_id: Uuid,
        config: &CorrelationConfig,
        event: &Event,
    ) -> PipelineResult<MatchOutcome> {
        let Some(entity_key) = self.entity_key_for(event, &config.entity_key_fields) else {
            return Ok(MatchOutcome::Dropped {
                reason: "missing entity key field".to_string(),
            });
        };

        for attempt in 0..=self.optimistic_retries {
            match self.try_process_once(rule_id, config, event, &entity_key).await {
                Ok(outcome) => return Ok(outcome),
                Err(PipelineError::StateConflict(_)) if attempt < self.optimistic_retries => continue,
                Err(other) => return Err(other),
            }
        }
        unreachable!("loop always returns within optimistic_retries + 1 attempts")
    }

    async fn try_process_once(
        &self,
        rule_id: Uuid,
        config: &CorrelationConfig,
        event: &Event,
        entity_key: &EntityKey,
    ) -> PipelineResult<MatchOutcome> {
        let window = chrono::Duration::seconds(config.window_duration_seconds);
        let existing = self.store.get_active(rule_id, entity_key).await?;

        match existing {
            None => self.open_or_drop(rule_id, config, event, entity_key, window).await,
            Some(row) if event.timestamp >= row.window_end => {
                // Step 4: window elapsed; expire then treat as a fresh window.
                self.store.mark_expired(rule_id, entity_key, row.version).await?;
                self.open_or_drop(rule_id, config, event, entity_key, window).await
            }
            Some(row) if event.timestamp < row.window_start - self.lateness_bound => {
                Ok(MatchOutcome::Dropped {
                    reason: "event too late for window".to_string(),
                })
            }
            Some(row) if row.seen_event_ids.contains(&event.event_id) => {
                // Redelivery of an already-folded event must not advance the row twice.
                Ok(MatchOutcome::Advanced)
            }
            Some(row) => self.advance(config, event, row).await,
        }
    }

    async fn open_or_drop(
        &self,
        rule_id: Uuid,
        config: &CorrelationConfig,
        event: &Event,
        entity_key: &EntityKey,
        window: chrono::Duration,
    ) -> PipelineResult<MatchOutcome> {
        let candidate_stage = match config.stage_order {
            StageOrder::Strict => Some(0usize),
            StageOrder::AnyOrder => None,
        };

        let opening_stage = match candidate_stage {
            Some(stage_index) => {
                if self.stage_matches(config, stage_index, event).await? {
                    Some(stage_index)
                } else {
                    None
                }
            }
            None => self.first_matching_stage(config, event).await?,
        };

        let Some(stage_index) = opening_stage else {
            return Ok(MatchOutcome::Dropped {
                reason: "no stage matched to open a window".to_string(),
            });
        };

        let mut row = CorrelationStateRow::new(rule_id, entity_key.clone(), config.stages.len(), event, window);
        self.fold_into_stage(&mut row, config, stage_index, event);
        self.store.create(row).await?;
        Ok(MatchOutcome::Opened)
    }

    async fn advance(
        &self,
        config: &CorrelationConfig,
        event: &Event,
        mut row: CorrelationStateRow,
    ) -> PipelineResult<MatchOutcome> {
        let Some(stage_index) = self.matching_unfilled_stage(config, &row, event).await? else {
            // Nothing advanced, but the event is still acked at the buffer layer.
            return Ok(MatchOutcome::Advanced);
        };

        self.fold_into_stage(&mut row, config, stage_index, event);
        let expected_version = row.version;

        if row.all_stages_satisfied(config.min_count_per_stage)
            && (config.stage_order == StageOrder::AnyOrder || row.order_is_strict())
        {
            row.status = CorrelationRowStatus::Completed;
            let mut hits: Vec<Hit> = row
                .stages
                .iter()
                .flat_map(|s| s.contributing_hits.clone())
                .collect();
            hits.sort_by_key(|h| h.timestamp);
            self.store.update(row, expected_version).await?;
            return Ok(MatchOutcome::Completed { hits });
        }

        self.store.update(row, expected_version).await?;
        Ok(MatchOutcome::Advanced)
    }

    async fn stage_matches(&self, config: &CorrelationConfig, stage_index: usize, event: &Event) -> PipelineResult<bool> {
        let stage = &config.stages[stage_index];
        self.evaluator.evaluate(&stage.predicate, event).await
    }

    async fn first_matching_stage(&self, config: &CorrelationConfig, event: &Event) -> PipelineResult<Option<usize>> {
        for (index, stage) in config.stages.iter().enumerate() {
            if self.evaluator.evaluate(&stage.predicate, event).await? {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Finds an unfilled stage (or, for `any_order`, any stage at all, since
    /// repetition beyond `min_count_per_stage` is permitted and retained)
    /// that this event's predicate satisfies, honoring `require_distinct`.
    async fn matching_unfilled_stage(
        &self,
        config: &CorrelationConfig,
        row: &CorrelationStateRow,
        event: &Event,
    ) -> PipelineResult<Option<usize>> {
        let candidates: Vec<usize> = match config.stage_order {
            StageOrder::Strict => {
                // Only the next unfilled stage in order may advance.
                row.stages
                    .iter()
                    .position(|s| s.matched_count < config.min_count_per_stage)
                    .into_iter()
                    .collect()
            }
            StageOrder::AnyOrder => {
                // Prefer an unfilled stage so distinct slots fill before any
                // stage repeats; only once every stage has its minimum does
                // a match fall through to topping up an already-filled one.
                let mut unfilled: Vec<usize> = Vec::new();
                let mut filled: Vec<usize> = Vec::new();
                for index in 0..config.stages.len() {
                    if row.stages[index].matched_count < config.min_count_per_stage {
                        unfilled.push(index);
                    } else {
                        filled.push(index);
                    }
                }
                unfilled.into_iter().chain(filled).collect()
            }
        };

        for stage_index in candidates {
            if !self.stage_matches(config, stage_index, event).await? {
                continue;
            }
            if let Some(distinct_field) = &config.require_distinct {
                if let Some(value) = event.fields.get(distinct_field) {
                    let already_captured = row
                        .stages
                        .iter()
                        .any(|s| s.captured_values.contains(value));
                    if already_captured {
                        continue;
                    }
                }
            }
            return Ok(Some(stage_index));
        }
        Ok(None)
    }

    fn fold_into_stage(&self, row: &mut CorrelationStateRow, config: &CorrelationConfig, stage_index: usize, event: &Event) {
        let stage_def = &config.stages[stage_index];
        let stage = &mut row.stages[stage_index];
        stage.matched_count += 1;
        stage.contributing_hits.push(Hit {
            event_id: event.event_id.clone(),
            timestamp: event.timestamp,
            fields: event.fields.clone(),
            raw: event.raw.clone(),
        });
        if let Some(distinct_field) = &config.require_distinct {
            if let Some(value) = event.fields.get(distinct_field) {
                stage.captured_values.insert(value.to_string());
            }
        }
        for field in &stage_def.group_by {
            if let Some(value) = event.fields.get(field) {
                stage.group_by_values.insert(field.clone(), value.to_string());
            }
        }
        row.match_order.push(stage_index);
        row.seen_event_ids.insert(event.event_id.clone());
    }
}

/// Background sweeper that expires rows whose window elapsed `grace` ago
/// (§4.6 "Expiry sweeper").
pub struct ExpirySweeper {
    store: Arc<dyn CorrelationStateStore>,
    grace: chrono::Duration,
    dedup_retention: chrono::Duration,
    lateness_bound: chrono::Duration,
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<dyn CorrelationStateStore>,
        grace: chrono::Duration,
        dedup_retention: chrono::Duration,
        lateness_bound: chrono::Duration,
    ) -> Self {
        Self {
            store,
            grace,
            dedup_retention,
            lateness_bound,
        }
    }

    /// One sweep pass: first moves rows whose window has closed but are
    /// still within `lateness_bound` into `draining` (still accepting late
    /// events per §4.4 "Late events"), then hard-expires rows whose window
    /// closed `grace` or more ago, then garbage-collects rows that have sat
    /// terminal past `dedup_retention`. Returns the number of rows expired
    /// this pass.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> PipelineResult<u64> {
        let draining = self.store.scan_draining_candidates(now, self.lateness_bound).await?;
        for row in draining {
            let _ = self.store.mark_draining(row.rule_id, &row.entity_key, row.version).await;
        }

        let expirable = self.store.scan_expirable(now, self.grace).await?;
        let mut expired = 0;
        for row in expirable {
            if self
                .store
                .mark_expired(row.rule_id, &row.entity_key, row.version)
                .await
                .is_ok()
            {
                expired += 1;
            }
        }
        self.store.garbage_collect(now, self.dedup_retention).await?;
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFields;

    fn auth_event(user: &str, action: &str, ip: &str, t: DateTime<Utc>) -> Event {
        Event::new(
            Uuid::new_v4().to_string(),
            t,
            "test",
            EventFields {
                user_name: Some(user.to_string()),
                source_ip: Some(ip.to_string()),
                other: {
                    let mut m = serde_json::Map::new();
                    m.insert("event.action".to_string(), serde_json::Value::String(action.to_string()));
                    m
                },
                ..Default::default()
            },
            serde_json::json!({}),
        )
    }

    fn strict_login_rule() -> CorrelationConfig {
        use crate::rules::CorrelationStage;
        CorrelationConfig {
            stages: vec![
                CorrelationStage { predicate: "event.action=auth.fail".into(), group_by: vec![] },
                CorrelationStage { predicate: "event.action=auth.fail".into(), group_by: vec![] },
                CorrelationStage { predicate: "event.action=auth.fail".into(), group_by: vec![] },
                CorrelationStage { predicate: "event.action=auth.success".into(), group_by: vec![] },
            ],
            entity_key_fields: vec!["user.name".to_string()],
            window_duration_seconds: 600,
            stage_order: StageOrder::Strict,
            min_count_per_stage: 1,
            require_distinct: None,
        }
    }

    async fn engine() -> CorrelationEngine {
        CorrelationEngine::new(
            Arc::new(InMemoryCorrelationStateStore::new()),
            Arc::new(FieldEqualityEvaluator),
            chrono::Duration::minutes(5),
            3,
        )
    }

    #[tokio::test]
    async fn strict_sequence_completes_on_fourth_event() {
        let engine = engine().await;
        let rule_id = Uuid::new_v4();
        let config = strict_login_rule();
        let t = Utc::now();

        for (i, minutes) in [0, 1, 2].iter().enumerate() {
            let event = auth_event("alice", "auth.fail", "1.1.1.1", t + chrono::Duration::minutes(*minutes));
            let outcome = engine.process_event(rule_id, &config, &event).await.unwrap();
            if i == 0 {
                assert!(matches!(outcome, MatchOutcome::Opened));
            } else {
                assert!(matches!(outcome, MatchOutcome::Advanced));
            }
        }

        let success = auth_event("alice", "auth.success", "2.2.2.2", t + chrono::Duration::minutes(3));
        let outcome = engine.process_event(rule_id, &config, &success).await.unwrap();
        assert!(matches!(outcome, MatchOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn event_at_window_end_is_out_of_window() {
        let engine = engine().await;
        let rule_id = Uuid::new_v4();
        let config = strict_login_rule();
        let t = Utc::now();

        let open = auth_event("bob", "auth.fail", "1.1.1.1", t);
        engine.process_event(rule_id, &config, &open).await.unwrap();

        // window_end = t + 600s exactly; an event arriving exactly then is
        // out-of-window (right-open interval) and opens a fresh window.
        let at_boundary = auth_event("bob", "auth.fail", "1.1.1.1", t + chrono::Duration::seconds(600));
        let outcome = engine.process_event(rule_id, &config, &at_boundary).await.unwrap();
        assert!(matches!(outcome, MatchOutcome::Opened));
    }

    #[tokio::test]
    async fn redelivered_event_id_does_not_advance_row_twice() {
        let engine = engine().await;
        let rule_id = Uuid::new_v4();
        let config = strict_login_rule();
        let t = Utc::now();

        let event = auth_event("carol", "auth.fail", "1.1.1.1", t);
        engine.process_event(rule_id, &config, &event).await.unwrap();
        // Redeliver the identical event (same event_id).
        let outcome = engine.process_event(rule_id, &config, &event).await.unwrap();
        assert!(matches!(outcome, MatchOutcome::Advanced));

        let row = engine
            .store
            .get_active(rule_id, &engine.entity_key_for(&event, &config.entity_key_fields).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.stages[0].matched_count, 1);
    }

    #[tokio::test]
    async fn missing_entity_key_field_drops_event() {
        let engine = engine().await;
        let rule_id = Uuid::new_v4();
        let config = strict_login_rule();
        let mut event = auth_event("dave", "auth.fail", "1.1.1.1", Utc::now());
        event.fields.user_name = None;

        let outcome = engine.process_event(rule_id, &config, &event).await.unwrap();
        assert!(matches!(outcome, MatchOutcome::Dropped { .. }));
    }

    #[tokio::test]
    async fn any_order_permits_out_of_order_with_lateness_bound() {
        let engine = engine().await;
        let rule_id = Uuid::new_v4();
        let mut config = strict_login_rule();
        config.stage_order = StageOrder::AnyOrder;
        let t = Utc::now();

        let fail1 = auth_event("erin", "auth.fail", "1.1.1.1", t);
        let success = auth_event("erin", "auth.success", "2.2.2.2", t + chrono::Duration::minutes(3));
        let fail2 = auth_event("erin", "auth.fail", "1.1.1.1", t + chrono::Duration::minutes(1));
        let fail3 = auth_event("erin", "auth.fail", "1.1.1.1", t + chrono::Duration::minutes(2));

        engine.process_event(rule_id, &config, &fail1).await.unwrap();
        engine.process_event(rule_id, &config, &success).await.unwrap();
        engine.process_event(rule_id, &config, &fail2).await.unwrap();
        let outcome = engine.process_event(rule_id, &config, &fail3).await.unwrap();
        assert!(matches!(outcome, MatchOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn window_expiry_sweep_transitions_stale_row() {
        let store = Arc::new(InMemoryCorrelationStateStore::new());
        let engine = CorrelationEngine::new(
            store.clone(),
            Arc::new(FieldEqualityEvaluator),
            chrono::Duration::minutes(5),
            3,
        );
        let rule_id = Uuid::new_v4();
        let config = strict_login_rule();
        let t = Utc::now() - chrono::Duration::minutes(20);

        let open = auth_event("frank", "auth.fail", "1.1.1.1", t);
        engine.process_event(rule_id, &config, &open).await.unwrap();

        let sweeper = ExpirySweeper::new(
            store,
            chrono::Duration::seconds(30),
            chrono::Duration::hours(1),
            chrono::Duration::seconds(10),
        );
        let expired = sweeper.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(expired, 1);
    }

    #[tokio::test]
    async fn group_by_field_is_captured_onto_stage_progress() {
        let engine = engine().await;
        let rule_id = Uuid::new_v4();
        let mut config = strict_login_rule();
        config.stages[0].group_by = vec!["source.ip".to_string()];

        let t = Utc::now();
        let open = auth_event("heidi", "auth.fail", "9.9.9.9", t);
        engine.process_event(rule_id, &config, &open).await.unwrap();

        let entity_key = engine.entity_key_for(&open, &config.entity_key_fields).unwrap();
        let row = engine.store.get_active(rule_id, &entity_key).await.unwrap().unwrap();
        assert_eq!(row.stages[0].group_by_values.get("source.ip").map(String::as_str), Some("9.9.9.9"));
    }

    #[tokio::test]
    async fn row_drains_before_hard_expiry() {
        let store = Arc::new(InMemoryCorrelationStateStore::new());
        let engine = CorrelationEngine::new(
            store.clone(),
            Arc::new(FieldEqualityEvaluator),
            chrono::Duration::minutes(5),
            3,
        );
        let rule_id = Uuid::new_v4();
        let config = strict_login_rule();
        // window_duration_seconds = 600; open at t so window_end = t + 600.
        let t = Utc::now() - chrono::Duration::seconds(605);

        let open = auth_event("gina", "auth.fail", "1.1.1.1", t);
        engine.process_event(rule_id, &config, &open).await.unwrap();

        // window_end has just passed; still well inside a 60s lateness bound
        // and far short of a 600s grace, so the row should move to draining
        // without being hard-expired.
        let sweeper = ExpirySweeper::new(
            store.clone(),
            chrono::Duration::seconds(600),
            chrono::Duration::hours(1),
            chrono::Duration::seconds(60),
        );
        let expired = sweeper.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(expired, 0);

        let entity_key = engine.entity_key_for(&open, &config.entity_key_fields).unwrap();
        let row = store.get_active(rule_id, &entity_key).await.unwrap().unwrap();
        assert_eq!(row.status, CorrelationRowStatus::Draining);
    }
}

/// Idempotence property of §4.4's `seen_event_ids` redelivery guard, fuzzed
/// over random sequences and redelivery prefixes rather than the handful of
/// cases the unit tests above pick by hand.
#[cfg(test)]
mod proptests {
    use super::*;
    use crate::events::EventFields;
    use crate::rules::CorrelationStage;
    use proptest::prelude::*;

    fn auth_fail_event(idx: usize, user: &str, t: DateTime<Utc>) -> Event {
        Event::new(
            format!("evt-{idx}"),
            t,
            "test",
            EventFields {
                user_name: Some(user.to_string()),
                source_ip: Some("1.1.1.1".to_string()),
                other: {
                    let mut m = serde_json::Map::new();
                    m.insert("event.action".to_string(), serde_json::Value::String("auth.fail".to_string()));
                    m
                },
                ..Default::default()
            },
            serde_json::json!({}),
        )
    }

    /// A single always-open stage with a min count high enough that the row
    /// never completes, so every redelivery lands on the same `advance` path.
    fn single_stage_rule() -> CorrelationConfig {
        CorrelationConfig {
            stages: vec![CorrelationStage {
                predicate: "event.action=auth.fail".into(),
                group_by: vec![],
            }],
            entity_key_fields: vec!["user.name".to_string()],
            window_duration_seconds: 3600,
            stage_order: StageOrder::AnyOrder,
            min_count_per_stage: 1_000_000,
            require_distinct: None,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Redelivering any prefix of already-processed events must not
        /// change the stage's `matched_count` a second time: `seen_event_ids`
        /// makes folding an event idempotent per `event_id`.
        #[test]
        fn redelivery_of_any_prefix_is_idempotent(count in 1usize..8, redeliver_count in 0usize..8) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let (matched_before, matched_after) = runtime.block_on(async {
                let engine = CorrelationEngine::new(
                    Arc::new(InMemoryCorrelationStateStore::new()),
                    Arc::new(FieldEqualityEvaluator),
                    chrono::Duration::minutes(5),
                    3,
                );
                let rule_id = Uuid::new_v4();
                let config = single_stage_rule();
                let t = Utc::now();

                let events: Vec<Event> = (0..count)
                    .map(|i| auth_fail_event(i, "proptest-user", t + chrono::Duration::seconds(i as i64)))
                    .collect();

                for event in &events {
                    engine.process_event(rule_id, &config, event).await.unwrap();
                }

                let entity_key = engine.entity_key_for(&events[0], &config.entity_key_fields).unwrap();
                let matched_before = engine
                    .store
                    .get_active(rule_id, &entity_key)
                    .await
                    .unwrap()
                    .unwrap()
                    .stages[0]
                    .matched_count;

                for event in events.iter().take(redeliver_count.min(events.len())) {
                    engine.process_event(rule_id, &config, event).await.unwrap();
                }

                let matched_after = engine
                    .store
                    .get_active(rule_id, &entity_key)
                    .await
                    .unwrap()
                    .unwrap()
                    .stages[0]
                    .matched_count;

                (matched_before, matched_after)
            });

            prop_assert_eq!(matched_before, matched_after);
        }
    }
}
