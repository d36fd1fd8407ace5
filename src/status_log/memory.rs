use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{RatioAggregation, StatusEvent, StatusLog};
use crate::container::ContainerStatus;
use crate::error::Result;

/// Status log kept in process memory, with the same windowing and
/// aggregation rules as the search backend.
#[derive(Clone, Default)]
pub struct MemoryStatusLog {
    events: Arc<RwLock<Vec<StatusEvent>>>,
}

impl MemoryStatusLog {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn events(&self) -> Vec<StatusEvent> {
        self.events.read().await.clone()
    }
}

fn in_window(event: &StatusEvent, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    event.timestamp >= start && event.timestamp <= end
}

#[async_trait]
impl StatusLog for MemoryStatusLog {
    async fn append(&self, event: &StatusEvent) -> Result<()> {
        self.events.write().await.push(event.clone());
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
        // (running, total) per container
        let mut counts: BTreeMap<i64, (u64, u64)> = BTreeMap::new();
        for event in self.events.read().await.iter() {
            if !in_window(event, start, end) {
                continue;
            }
            let entry = counts.entry(event.container_id).or_default();
            entry.1 += 1;
            if event.status == ContainerStatus::Running {
                entry.0 += 1;
            }
        }

        let per_container: BTreeMap<i64, f64> = counts
            .into_iter()
            .map(|(id, (running, total))| (id, running as f64 / total as f64))
            .collect();
        let average = (!per_container.is_empty())
            .then(|| per_container.values().sum::<f64>() / per_container.len() as f64);

        Ok(RatioAggregation {
            per_container,
            average,
        })
    }

    async fn running_counts(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<i64, u64>> {
        let mut counts: BTreeMap<i64, u64> = BTreeMap::new();
        for event in self.events.read().await.iter() {
            if event.status == ContainerStatus::Running && in_window(event, start, end) {
                *counts.entry(event.container_id).or_default() += 1;
            }
        }
        Ok(counts)
    }
}
