//! In-memory [`HistoricalStore`] double used by Detection Engine tests: it
//! echoes back canned hits regardless of the rewritten query, recording
//! every call it received so tests can assert on the rewrite.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Hit, HistoricalIndexer, HistoricalStore, SearchResult, SortOrder};
use crate::domain::Dialect;
use crate::errors::{PipelineError, PipelineResult};
use crate::events::Event;

#[derive(Debug, Clone)]
pub struct RecordedSearchCall {
    pub indices: Vec<String>,
    pub query_string: String,
    pub dialect: Dialect,
    pub time_from: DateTime<Utc>,
    pub time_to: DateTime<Utc>,
    pub size: usize,
}

#[derive(Default)]
pub struct FakeHistoricalStore {
    hits: Mutex<Vec<Hit>>,
    total_count: Mutex<Option<i64>>,
    calls: Mutex<Vec<RecordedSearchCall>>,
    fail_with_syntax_error: Mutex<bool>,
    indexed: Mutex<Vec<Event>>,
}

impl FakeHistoricalStore {
    pub fn new(hits: Vec<Hit>) -> Self {
        Self {
            hits: Mutex::new(hits),
            total_count: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            fail_with_syntax_error: Mutex::new(false),
            indexed: Mutex::new(Vec::new()),
        }
    }

    pub fn indexed_events(&self) -> Vec<Event> {
        self.indexed.lock().unwrap().clone()
    }

    /// Overrides `total_count` independent of `hits.len()`, simulating a
    /// store that truncates results below the real match count.
    pub fn with_total_count(self, total_count: i64) -> Self {
        *self.total_count.lock().unwrap() = Some(total_count);
        self
    }

    pub fn failing_with_syntax_error(self) -> Self {
        *self.fail_with_syntax_error.lock().unwrap() = true;
        self
    }

    pub fn recorded_calls(&self) -> Vec<RecordedSearchCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoricalStore for FakeHistoricalStore {
    async fn search(
        &self,
        indices: &[String],
        query_string: &str,
        dialect: Dialect,
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
        size: usize,
        _sort: SortOrder,
    ) -> PipelineResult<SearchResult> {
        if *self.fail_with_syntax_error.lock().unwrap() {
            return Err(PipelineError::QuerySyntax("malformed query".into()));
        }

        self.calls.lock().unwrap().push(RecordedSearchCall {
            indices: indices.to_vec(),
            query_string: query_string.to_string(),
            dialect,
            time_from,
            time_to,
            size,
        });

        let hits = self.hits.lock().unwrap().clone();
        let total_count = self.total_count.lock().unwrap().unwrap_or(hits.len() as i64);
        let truncated: Vec<Hit> = hits.into_iter().take(size).collect();

        Ok(SearchResult {
            hits: truncated,
            total_count,
        })
    }

    async fn count(
        &self,
        _indices: &[String],
        _query_string: &str,
        _dialect: Dialect,
        _time_from: DateTime<Utc>,
        _time_to: DateTime<Utc>,
    ) -> PipelineResult<i64> {
        if *self.fail_with_syntax_error.lock().unwrap() {
            return Err(PipelineError::QuerySyntax("malformed query".into()));
        }
        let total_count = self.total_count.lock().unwrap();
        Ok(total_count.unwrap_or_else(|| self.hits.lock().unwrap().len() as i64))
    }
}

#[async_trait]
impl HistoricalIndexer for FakeHistoricalStore {
    async fn index(&self, _index: &str, event: &Event) -> PipelineResult<()> {
        self.indexed.lock().unwrap().push(event.clone());
        Ok(())
    }
}
