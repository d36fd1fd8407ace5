//! Status ingestion: applies status-change messages from a queue to the
//! metadata store and the status log.
//!
//! One reader pulls messages; each message is handled on its own task in a
//! bounded pool. When the pool is full the reader waits for a free slot.
//! On shutdown the reader stops and in-flight tasks are awaited.

pub mod kafka;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use crate::container::{ContainerPatch, ContainerStatus};
use crate::status_log::{StatusEvent, StatusLog};
use crate::store::MetadataStore;

pub use kafka::KafkaQueue;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("message has no payload")]
    EmptyPayload,
    #[error("queue closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Wait for the next message. [`QueueError::Closed`] means no message
    /// will ever arrive again.
    async fn read_next(&self) -> Result<QueueMessage, QueueError>;
    async fn close(&self) -> Result<(), QueueError>;
}

/// Wire format of a status-change message.
#[derive(Debug, Deserialize)]
struct StatusMessage {
    id: i64,
    #[serde(default)]
    container_name: String,
    status: bool,
}

pub struct StatusIngestor {
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn MetadataStore>,
    status_log: Arc<dyn StatusLog>,
    max_in_flight: usize,
}

impl StatusIngestor {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn MetadataStore>,
        status_log: Arc<dyn StatusLog>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            queue,
            store,
            status_log,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Consume until `shutdown` flips to `true` (or its sender goes away) or
    /// the queue closes, then wait for in-flight messages.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let slots = Arc::new(Semaphore::new(self.max_in_flight));
        let mut tasks = JoinSet::new();

        log::info!(
            "Starting status consumer, at most {} messages in flight",
            self.max_in_flight
        );

        loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }

            let permit = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let message = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                message = self.queue.read_next() => message,
            };

            match message {
                Ok(message) => {
                    let store = Arc::clone(&self.store);
                    let status_log = Arc::clone(&self.status_log);
                    tasks.spawn(async move {
                        process_message(store.as_ref(), status_log.as_ref(), message).await;
                        drop(permit);
                    });
                }
                Err(QueueError::Closed) => {
                    log::info!("Message queue closed, stopping consumer");
                    break;
                }
                Err(e) => {
                    log::error!("Failed to read message: {}", e);
                }
            }
        }

        if !tasks.is_empty() {
            log::info!("Waiting for {} in-flight messages", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        log::info!("Status consumer stopped");
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        self.queue
            .close()
            .await
            .inspect_err(|e| log::error!("Failed to close message queue: {}", e))?;
        log::info!("Message queue closed successfully");
        Ok(())
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        log::error!("Status message task failed: {}", e);
    }
}

/// Apply one message. Failures are logged and the message is dropped.
async fn process_message(store: &dyn MetadataStore, status_log: &dyn StatusLog, message: QueueMessage) {
    log::debug!(
        "Received message, key {:?}: {}",
        message.key.as_deref().map(String::from_utf8_lossy),
        String::from_utf8_lossy(&message.payload)
    );

    let parsed: StatusMessage = match serde_json::from_slice(&message.payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::error!("Failed to unmarshal message: {}", e);
            return;
        }
    };

    let status = ContainerStatus::from_running_flag(parsed.status);

    if let Err(e) = store
        .update_container(parsed.id, &ContainerPatch::status(status))
        .await
    {
        log::error!(
            "Failed to update container {} ({}) status to {}: {}",
            parsed.id,
            parsed.container_name,
            status,
            e
        );
        return;
    }

    if let Err(e) = status_log.append(&StatusEvent::now(parsed.id, status)).await {
        log::error!(
            "Failed to add status event for container {}: {}",
            parsed.id,
            e
        );
        return;
    }

    log::info!(
        "Container {} ({}) status updated to {}",
        parsed.id,
        parsed.container_name,
        status
    );
}
