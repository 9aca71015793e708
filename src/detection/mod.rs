//! Detection Engine: scheduled execution of rules against the historical
//! store plus threshold evaluation (§4.3).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::ExecutionStatus;
use crate::errors::{PipelineError, PipelineResult};
use crate::historical::{HistoricalStore, Hit, SearchResult, SortOrder};
use crate::rules::{DetectionRule, ExecutionRecord};

/// Outcome of [`DetectionEngine::execute_rule`]: the hits the rule matched,
/// whether the configured threshold was exceeded, and the audit record to
/// persist via [`crate::rules::RuleStore::record_execution`].
pub struct RuleExecutionOutcome {
    pub hits: Vec<Hit>,
    pub threshold_exceeded: bool,
    pub execution: ExecutionRecord,
}

pub struct DetectionEngine {
    store: Arc<dyn HistoricalStore>,
    emit_on_timeout: bool,
}

impl DetectionEngine {
    /// How long an in-flight store request is allowed to keep running, past
    /// the cancellation signal, before it's abandoned outright. Only a
    /// response that lands within this window can ever become a "partial
    /// hits" result.
    const CANCEL_GRACE: std::time::Duration = std::time::Duration::from_millis(500);

    pub fn new(store: Arc<dyn HistoricalStore>, emit_on_timeout: bool) -> Self {
        Self { store, emit_on_timeout }
    }

    /// Executes `rule` against the historical store, bounded by `cancel`.
    ///
    /// On cancellation (deadline elapsed): records `status=failed,
    /// error=timeout`; surfaces whatever hits arrived before the deadline
    /// only if `emit_on_timeout` is set, otherwise discards them. The store
    /// call runs on its own task so a response that lands within
    /// `CANCEL_GRACE` of the cancellation signal still counts as "before the
    /// deadline" instead of being unconditionally discarded.
    pub async fn execute_rule(
        &self,
        rule: &DetectionRule,
        cancel: CancellationToken,
    ) -> PipelineResult<RuleExecutionOutcome> {
        let execution_id = Uuid::new_v4();
        let started_at = Utc::now();
        let time_from = started_at - chrono::Duration::minutes(rule.lookback_minutes);
        let time_to = started_at;
        let size = std::cmp::min(10_000, rule.max_hits as usize);

        let store = self.store.clone();
        let indices = rule.indices.clone();
        let query = rule.query.clone();
        let dialect = rule.dialect;
        let mut search_task = tokio::spawn(async move {
            store
                .search(&indices, &query, dialect, time_from, time_to, size, SortOrder::Descending)
                .await
        });

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let partial_hits = match tokio::time::timeout(Self::CANCEL_GRACE, &mut search_task).await {
                    Ok(Ok(Ok(SearchResult { hits, .. }))) => hits,
                    _ => {
                        search_task.abort();
                        Vec::new()
                    }
                };
                return Ok(self.timeout_outcome(rule.rule_id, execution_id, started_at, partial_hits));
            }
            joined = &mut search_task => match joined {
                Ok(result) => result,
                Err(join_error) => return Err(PipelineError::Fatal(format!("historical store search task panicked: {join_error}"))),
            },
        };

        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds();

        match result {
            Ok(SearchResult { hits, total_count }) => {
                let threshold_exceeded = self
                    .check_threshold(rule, hits.len() as i64, total_count, time_from, time_to)
                    .await?;

                Ok(RuleExecutionOutcome {
                    execution: ExecutionRecord {
                        execution_id,
                        rule_id: rule.rule_id,
                        started_at,
                        completed_at: Some(completed_at),
                        duration_ms: Some(duration_ms),
                        status: ExecutionStatus::Completed,
                        hits_count: hits.len() as i64,
                        error_message: None,
                    },
                    threshold_exceeded,
                    hits,
                })
            }
            Err(PipelineError::QuerySyntax(message)) => Ok(RuleExecutionOutcome {
                execution: ExecutionRecord {
                    execution_id,
                    rule_id: rule.rule_id,
                    started_at,
                    completed_at: Some(completed_at),
                    duration_ms: Some(duration_ms),
                    status: ExecutionStatus::Failed,
                    hits_count: 0,
                    error_message: Some(message),
                },
                threshold_exceeded: false,
                hits: Vec::new(),
            }),
            Err(other) => Err(other),
        }
    }

    fn timeout_outcome(
        &self,
        rule_id: Uuid,
        execution_id: Uuid,
        started_at: DateTime<Utc>,
        partial_hits: Vec<Hit>,
    ) -> RuleExecutionOutcome {
        let hits = if self.emit_on_timeout { partial_hits } else { Vec::new() };
        RuleExecutionOutcome {
            execution: ExecutionRecord {
                execution_id,
                rule_id,
                started_at,
                completed_at: Some(Utc::now()),
                duration_ms: Some((Utc::now() - started_at).num_milliseconds()),
                status: ExecutionStatus::Failed,
                hits_count: hits.len() as i64,
                error_message: Some("timeout".to_string()),
            },
            threshold_exceeded: false,
            hits,
        }
    }

    /// `threshold_count == 0` fires on any hit; otherwise fires when the hit
    /// count (re-queried via `count` if the store truncated results) meets
    /// or exceeds `threshold_count`.
    async fn check_threshold(
        &self,
        rule: &DetectionRule,
        returned_hits: i64,
        total_count: i64,
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
    ) -> PipelineResult<bool> {
        if rule.threshold_count == 0 {
            return Ok(returned_hits > 0);
        }

        let effective_count = if total_count > returned_hits {
            self.store
                .count(&rule.indices, &rule.query, rule.dialect, time_from, time_to)
                .await?
        } else {
            returned_hits
        };

        Ok(effective_count >= rule.threshold_count)
    }
}
