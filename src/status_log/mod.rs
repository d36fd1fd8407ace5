//! Append-only log of container status events.
//!
//! The log is the only input to uptime analytics. Events are never updated or
//! deleted and duplicates are kept: two identical appends are two entries.

pub mod elastic;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::container::ContainerStatus;
use crate::error::Result;

pub use elastic::ElasticStatusLog;
pub use memory::MemoryStatusLog;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    #[serde(rename = "id")]
    pub container_id: i64,
    pub status: ContainerStatus,
    #[serde(with = "rfc3339_seconds")]
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn now(container_id: i64, status: ContainerStatus) -> Self {
        Self {
            container_id,
            status,
            timestamp: Utc::now(),
        }
    }
}

/// Per-container share of running events plus their unweighted mean.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RatioAggregation {
    pub per_container: BTreeMap<i64, f64>,
    /// `None` when no container has events in the window.
    pub average: Option<f64>,
}

#[async_trait]
pub trait StatusLog: Send + Sync {
    async fn append(&self, event: &StatusEvent) -> Result<()>;

    /// Ratio of running events to all events for every container with at
    /// least one event in `[start, end]`.
    async fn uptime_ratios(&self, start: DateTime<Utc>, end: DateTime<Utc>)
    -> Result<RatioAggregation>;

    /// Number of running events per container in `[start, end]`.
    async fn running_counts(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<i64, u64>>;
}

/// Timestamps go over the wire as second-precision RFC3339 with a `Z` suffix.
pub(crate) fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

mod rfc3339_seconds {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_event_document_shape() {
        let event = StatusEvent {
            container_id: 101,
            status: ContainerStatus::Running,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "id": 101,
                "status": "running",
                "timestamp": "2024-05-01T12:30:00Z"
            })
        );

        let parsed: StatusEvent = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
    }
}
