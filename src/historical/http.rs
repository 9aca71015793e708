//! `reqwest`-backed [`HistoricalStore`] talking to an Elasticsearch-shaped
//! JSON search API. Grounded on the teacher's `adapters/netbox.rs`
//! reqwest-as-HTTP-collaborator pattern.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{Hit, HistoricalIndexer, HistoricalStore, SearchResult, SortOrder};
use crate::config::HistoricalStoreConfig;
use crate::domain::Dialect;
use crate::errors::{PipelineError, PipelineResult};
use crate::events::Event;

pub struct HttpHistoricalStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHistoricalStore {
    pub fn new(config: &HistoricalStoreConfig) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| PipelineError::Fatal(format!("building historical store client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn rewrite_query(query: &str, dialect: Dialect, time_from: DateTime<Utc>, time_to: DateTime<Utc>) -> String {
        let from = time_from.to_rfc3339();
        let to = time_to.to_rfc3339();
        match dialect {
            Dialect::Kql => format!("({query}) AND @timestamp:[{from} TO {to})"),
            Dialect::Esql => {
                if query.contains("@timestamp") {
                    format!("FROM * METADATA @timestamp >= \"{from}\" AND @timestamp < \"{to}\" | {query}")
                } else {
                    format!("{query} | WHERE @timestamp >= \"{from}\" AND @timestamp < \"{to}\"")
                }
            }
        }
    }

    fn classify_error(status: reqwest::StatusCode, body: &str) -> PipelineError {
        if status.as_u16() == 400 {
            PipelineError::QuerySyntax(body.to_string())
        } else {
            PipelineError::TransientIo(format!("historical store returned {status}: {body}"))
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponseHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source")]
    source: HitSource,
}

#[derive(Debug, Deserialize)]
struct HitSource {
    #[serde(rename = "@timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    fields: crate::events::EventFields,
    #[serde(default)]
    raw: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SearchResponseBody {
    hits: SearchResponseHits,
}

#[derive(Debug, Deserialize)]
struct SearchResponseHits {
    total: SearchResponseTotal,
    hits: Vec<SearchResponseHit>,
}

#[derive(Debug, Deserialize)]
struct SearchResponseTotal {
    value: i64,
}

#[derive(Debug, Deserialize)]
struct CountResponseBody {
    count: i64,
}

#[async_trait]
impl HistoricalStore for HttpHistoricalStore {
    async fn search(
        &self,
        indices: &[String],
        query_string: &str,
        dialect: Dialect,
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
        size: usize,
        sort: SortOrder,
    ) -> PipelineResult<SearchResult> {
        let rewritten = Self::rewrite_query(query_string, dialect, time_from, time_to);
        let order = match sort {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        };
        let index_pattern = indices.join(",");
        let url = format!("{}/{}/_search", self.base_url, index_pattern);

        let response = self
            .client
            .post(url)
            .json(&json!({
                "query": { "query_string": { "query": rewritten } },
                "size": size,
                "sort": [{ "@timestamp": order }],
            }))
            .send()
            .await
            .map_err(|e| PipelineError::TransientIo(format!("search request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_error(status, &body));
        }

        let body: SearchResponseBody = response
            .json()
            .await
            .map_err(|e| PipelineError::TransientIo(format!("decoding search response: {e}")))?;

        let hits = body
            .hits
            .hits
            .into_iter()
            .map(|h| Hit {
                event_id: h.id,
                timestamp: h.source.timestamp,
                fields: h.source.fields,
                raw: h.source.raw,
            })
            .collect();

        Ok(SearchResult {
            hits,
            total_count: body.hits.total.value,
        })
    }

    async fn count(
        &self,
        indices: &[String],
        query_string: &str,
        dialect: Dialect,
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
    ) -> PipelineResult<i64> {
        let rewritten = Self::rewrite_query(query_string, dialect, time_from, time_to);
        let index_pattern = indices.join(",");
        let url = format!("{}/{}/_count", self.base_url, index_pattern);

        let response = self
            .client
            .post(url)
            .json(&json!({ "query": { "query_string": { "query": rewritten } } }))
            .send()
            .await
            .map_err(|e| PipelineError::TransientIo(format!("count request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_error(status, &body));
        }

        let body: CountResponseBody = response
            .json()
            .await
            .map_err(|e| PipelineError::TransientIo(format!("decoding count response: {e}")))?;

        Ok(body.count)
    }
}

#[async_trait]
impl HistoricalIndexer for HttpHistoricalStore {
    async fn index(&self, index: &str, event: &Event) -> PipelineResult<()> {
        let url = format!("{}/{}/_doc/{}", self.base_url, index, event.event_id);

        let mut document = serde_json::to_value(&event.fields)
            .unwrap_or_default()
            .as_object()
            .cloned()
            .unwrap_or_default();
        document.insert("@timestamp".to_string(), json!(event.timestamp));
        document.insert("source".to_string(), json!(event.source));

        let response = self
            .client
            .put(url)
            .json(&document)
            .send()
            .await
            .map_err(|e| PipelineError::TransientIo(format!("index request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_error(status, &body));
        }
        Ok(())
    }
}
