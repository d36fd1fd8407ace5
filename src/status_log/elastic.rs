//! Elasticsearch-backed status log, spoken to over its REST API.
//!
//! Documents are indexed with `refresh=true` so analytics issued right after
//! an ingest see the new event. Aggregations run server side; this module
//! only builds the query bodies and reads the aggregation results back.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use super::{RatioAggregation, StatusEvent, StatusLog, format_timestamp};
use crate::container::ContainerStatus;
use crate::error::{Error, Result};

/// Upper bound on distinct containers returned by a terms aggregation.
const MAX_CONTAINER_BUCKETS: u32 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ElasticError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("elasticsearch error {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("unexpected search response: {0}")]
    Response(String),
}

pub struct ElasticStatusLog {
    client: reqwest::Client,
    base_url: String,
    index: String,
}

impl ElasticStatusLog {
    pub fn new(base_url: &str, index: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.into(),
        }
    }

    async fn search(&self, body: &Value) -> std::result::Result<Value, ElasticError> {
        let url = format!("{}/{}/_search", self.base_url, self.index);
        let response = self
            .client
            .post(&url)
            .query(&[("track_total_hits", "true")])
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!("Elasticsearch search error, status {}: {}", status, body);
            return Err(ElasticError::Status { status, body });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl StatusLog for ElasticStatusLog {
    async fn append(&self, event: &StatusEvent) -> Result<()> {
        let url = format!("{}/{}/_doc", self.base_url, self.index);
        let response = self
            .client
            .post(&url)
            .query(&[("refresh", "true")])
            .json(event)
            .send()
            .await
            .map_err(ElasticError::from)
            .inspect_err(|e| log::error!("ES index request failed: {}", e))
            .map_err(|e| Error::external("index request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!("Elasticsearch response error, status {}: {}", status, body);
            return Err(Error::external(
                "elasticsearch error",
                ElasticError::Status { status, body },
            ));
        }

        log::info!(
            "Container status indexed, id {} status {}",
            event.container_id,
            event.status
        );
        Ok(())
    }

    async fn uptime_ratios(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RatioAggregation> {
        let response = self
            .search(&ratio_query(start, end))
            .await
            .map_err(|e| Error::external("search request failed", e))?;
        parse_ratio_response(&response).map_err(|e| Error::external("decode error", e))
    }

    async fn running_counts(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<i64, u64>> {
        let response = self
            .search(&running_count_query(start, end))
            .await
            .map_err(|e| Error::external("search request failed", e))?;
        parse_running_counts(&response).map_err(|e| Error::external("decode error", e))
    }
}

fn timestamp_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Value {
    json!({
        "range": {
            "timestamp": {
                "gte": format_timestamp(&start),
                "lte": format_timestamp(&end),
            }
        }
    })
}

fn running_term() -> Value {
    json!({ "term": { "status.keyword": ContainerStatus::Running.as_ref() } })
}

fn ratio_query(start: DateTime<Utc>, end: DateTime<Utc>) -> Value {
    json!({
        "size": 0,
        "query": timestamp_range(start, end),
        "aggs": {
            "per_container": {
                "terms": { "field": "id", "size": MAX_CONTAINER_BUCKETS },
                "aggs": {
                    "total_docs": { "value_count": { "field": "id" } },
                    "on_count": { "filter": running_term() },
                    "on_ratio": {
                        "bucket_script": {
                            "buckets_path": {
                                "on": "on_count._count",
                                "all": "total_docs.value"
                            },
                            "script": "params.all > 0 ? params.on / params.all : 0"
                        }
                    }
                }
            },
            "avg_ratio": {
                "avg_bucket": { "buckets_path": "per_container>on_ratio.value" }
            }
        }
    })
}

fn running_count_query(start: DateTime<Utc>, end: DateTime<Utc>) -> Value {
    json!({
        "size": 0,
        "query": {
            "bool": { "must": [timestamp_range(start, end), running_term()] }
        },
        "aggs": {
            "containers": {
                "terms": { "field": "id", "size": MAX_CONTAINER_BUCKETS },
                "aggs": {
                    "running_count": { "value_count": { "field": "id" } }
                }
            }
        }
    })
}

fn buckets<'a>(response: &'a Value, agg: &str) -> std::result::Result<&'a [Value], ElasticError> {
    response["aggregations"][agg]["buckets"]
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| ElasticError::Response(format!("missing {agg} buckets")))
}

/// Terms keys on a numeric field come back as numbers, but tolerate strings.
fn bucket_key(bucket: &Value) -> std::result::Result<i64, ElasticError> {
    let key = &bucket["key"];
    key.as_i64()
        .or_else(|| key.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| ElasticError::Response(format!("invalid bucket key: {key}")))
}

fn parse_ratio_response(response: &Value) -> std::result::Result<RatioAggregation, ElasticError> {
    let mut per_container = BTreeMap::new();
    for bucket in buckets(response, "per_container")? {
        let ratio = bucket["on_ratio"]["value"]
            .as_f64()
            .ok_or_else(|| ElasticError::Response("missing on_ratio value".to_string()))?;
        per_container.insert(bucket_key(bucket)?, ratio);
    }

    // avg_bucket reports null when there are no buckets.
    let average = response["aggregations"]["avg_ratio"]["value"].as_f64();

    Ok(RatioAggregation {
        per_container,
        average,
    })
}

fn parse_running_counts(response: &Value) -> std::result::Result<BTreeMap<i64, u64>, ElasticError> {
    let mut counts = BTreeMap::new();
    for bucket in buckets(response, "containers")? {
        let count = bucket["running_count"]["value"]
            .as_f64()
            .ok_or_else(|| ElasticError::Response("missing running_count value".to_string()))?;
        counts.insert(bucket_key(bucket)?, count as u64);
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_ratio_query_shape() {
        let (start, end) = window();
        let query = ratio_query(start, end);
        assert_eq!(query["size"], 0);
        assert_eq!(query["query"]["range"]["timestamp"]["gte"], "2024-01-01T00:00:00Z");
        assert_eq!(query["query"]["range"]["timestamp"]["lte"], "2024-01-02T00:00:00Z");
        let per_container = &query["aggs"]["per_container"];
        assert_eq!(per_container["terms"]["field"], "id");
        assert_eq!(per_container["terms"]["size"], 10_000);
        assert_eq!(
            per_container["aggs"]["on_count"]["filter"]["term"]["status.keyword"],
            "running"
        );
        assert_eq!(
            query["aggs"]["avg_ratio"]["avg_bucket"]["buckets_path"],
            "per_container>on_ratio.value"
        );
    }

    #[test]
    fn test_running_count_query_filters_running() {
        let (start, end) = window();
        let query = running_count_query(start, end);
        let must = query["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(must.len(), 2);
        assert_eq!(must[1]["term"]["status.keyword"], "running");
        assert_eq!(
            query["aggs"]["containers"]["aggs"]["running_count"]["value_count"]["field"],
            "id"
        );
    }

    #[test]
    fn test_parse_ratio_response() {
        let response = json!({
            "took": 3,
            "aggregations": {
                "per_container": {
                    "buckets": [
                        { "key": 1, "doc_count": 4, "total_docs": { "value": 4 },
                          "on_count": { "doc_count": 3 }, "on_ratio": { "value": 0.75 } },
                        { "key": "2", "doc_count": 2, "total_docs": { "value": 2 },
                          "on_count": { "doc_count": 0 }, "on_ratio": { "value": 0.0 } }
                    ]
                },
                "avg_ratio": { "value": 0.375 }
            }
        });
        let agg = parse_ratio_response(&response).unwrap();
        assert_eq!(agg.per_container[&1], 0.75);
        assert_eq!(agg.per_container[&2], 0.0);
        assert_eq!(agg.average, Some(0.375));
    }

    #[test]
    fn test_parse_ratio_response_without_buckets() {
        let response = json!({
            "aggregations": {
                "per_container": { "buckets": [] },
                "avg_ratio": { "value": null }
            }
        });
        let agg = parse_ratio_response(&response).unwrap();
        assert!(agg.per_container.is_empty());
        assert_eq!(agg.average, None);
    }

    #[test]
    fn test_parse_running_counts() {
        let response = json!({
            "aggregations": {
                "containers": {
                    "buckets": [
                        { "key": 101, "doc_count": 5, "running_count": { "value": 5 } },
                        { "key": 7, "doc_count": 1, "running_count": { "value": 1.0 } }
                    ]
                }
            }
        });
        let counts = parse_running_counts(&response).unwrap();
        assert_eq!(counts[&101], 5);
        assert_eq!(counts[&7], 1);
    }

    #[test]
    fn test_malformed_response_is_an_error() {
        let response = json!({ "error": { "type": "index_not_found_exception" } });
        assert!(matches!(
            parse_running_counts(&response),
            Err(ElasticError::Response(_))
        ));
    }
}
