//! Uptime analytics over the status log.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::status_log::StatusLog;

/// Uptime credited for each running event in the window.
pub const UPTIME_QUANTUM: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UptimeDetails {
    #[serde(serialize_with = "as_secs")]
    pub total_uptime: Duration,
    #[serde(serialize_with = "map_as_secs")]
    pub per_container_uptime: BTreeMap<i64, Duration>,
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

fn map_as_secs<S: serde::Serializer>(
    map: &BTreeMap<i64, Duration>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.collect_map(map.iter().map(|(id, d)| (id, d.as_secs())))
}

pub struct UptimeAnalytics {
    status_log: Arc<dyn StatusLog>,
}

impl UptimeAnalytics {
    pub fn new(status_log: Arc<dyn StatusLog>) -> Self {
        Self { status_log }
    }

    /// Unweighted mean over containers of running events / all events in
    /// `[start, end]`. Containers without events do not count; with no
    /// containers at all the ratio is 0.
    pub async fn uptime_ratio(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<f64> {
        check_window(start, end)?;

        let aggregation = self
            .status_log
            .uptime_ratios(start, end)
            .await
            .inspect_err(|e| log::error!("Failed to get container uptime ratio: {}", e))
            .map_err(|e| e.at_stage("failed to get container uptime ratio"))?;

        let ratio = aggregation.average.unwrap_or(0.0).clamp(0.0, 1.0);
        log::info!(
            "Uptime ratio {:.4} over {} containers",
            ratio,
            aggregation.per_container.len()
        );
        Ok(ratio)
    }

    pub async fn uptime_duration(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UptimeDetails> {
        check_window(start, end)?;

        let counts = self
            .status_log
            .running_counts(start, end)
            .await
            .inspect_err(|e| log::error!("Failed to get container uptime duration: {}", e))
            .map_err(|e| e.at_stage("failed to get container uptime duration"))?;

        let mut details = UptimeDetails::default();
        for (id, running_events) in counts {
            let uptime = UPTIME_QUANTUM.saturating_mul(u32::try_from(running_events).unwrap_or(u32::MAX));
            details.total_uptime = details.total_uptime.saturating_add(uptime);
            details.per_container_uptime.insert(id, uptime);
        }
        Ok(details)
    }
}

fn check_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if start >= end {
        log::error!("Start time {} must be before end time {}", start, end);
        return Err(Error::validation("start time must be before end time"));
    }
    Ok(())
}
