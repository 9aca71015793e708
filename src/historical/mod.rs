//! Historical store contract (§6): the opaque external index the Detection
//! Engine queries. The store's syntactic validation of queries is
//! authoritative — this crate never parses `query` itself.

pub mod fake;
pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Dialect;
use crate::errors::PipelineResult;
use crate::events::{Event, EventFields};

pub use self::fake::FakeHistoricalStore;
pub use self::http::HttpHistoricalStore;

/// A matching document returned by `search`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub fields: EventFields,
    pub raw: serde_json::Value,
}

/// Result of a `search` call.
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub hits: Vec<Hit>,
    pub total_count: i64,
}

/// Sort order for `search`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// The two capabilities the core calls out with (§6).
#[async_trait]
pub trait HistoricalStore: Send + Sync {
    async fn search(
        &self,
        indices: &[String],
        query_string: &str,
        dialect: Dialect,
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
        size: usize,
        sort: SortOrder,
    ) -> PipelineResult<SearchResult>;

    async fn count(
        &self,
        indices: &[String],
        query_string: &str,
        dialect: Dialect,
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
    ) -> PipelineResult<i64>;
}

/// Write side of the historical store: the "lightweight indexer" consumer
/// group (§2 "Data flow") that writes every event it sees into the same
/// index the Detection Engine later searches. Kept separate from
/// [`HistoricalStore`] since the two capabilities (index vs. query) have
/// independent failure modes and the read side has no legitimate caller for
/// a write method.
#[async_trait]
pub trait HistoricalIndexer: Send + Sync {
    async fn index(&self, index: &str, event: &Event) -> PipelineResult<()>;
}
