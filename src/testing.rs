//! In-crate fakes shared by the unit tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::container::{
    Container, ContainerName, ContainerPatch, ContainerStatus, ListQuery, NewContainer,
};
use crate::error::{Error, Result};
use crate::ingestion::{MessageQueue, QueueError, QueueMessage};
use crate::runtime::{RuntimeClient, RuntimeError};
use crate::store::{BatchInsert, MemoryStore, MetadataStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Start { name: String, image: String },
    Stop(String),
    Remove(String),
    StartExisting(String),
}

/// Runtime that records every call and hands out ids `c1`, `c2`, ...
#[derive(Default)]
pub struct RecordingRuntime {
    calls: Mutex<Vec<RuntimeCall>>,
    started: AtomicUsize,
    fail_start_for: Mutex<HashSet<String>>,
    pub fail_stop: AtomicBool,
    pub fail_remove: AtomicBool,
    pub fail_start_existing: AtomicBool,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_start_for(&self, name: &str) {
        self.fail_start_for.lock().unwrap().insert(name.to_string());
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&RuntimeCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: RuntimeCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn outcome(flag: &AtomicBool, what: &str) -> std::result::Result<(), RuntimeError> {
        if flag.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other(format!("{what} refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeClient for RecordingRuntime {
    async fn start(&self, name: &str, image: &str) -> std::result::Result<String, RuntimeError> {
        self.record(RuntimeCall::Start {
            name: name.to_string(),
            image: image.to_string(),
        });
        if self.fail_start_for.lock().unwrap().contains(name) {
            return Err(RuntimeError::Other(format!("image {image} not found")));
        }
        let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("c{n}"))
    }

    async fn stop(&self, runtime_id: &str) -> std::result::Result<(), RuntimeError> {
        self.record(RuntimeCall::Stop(runtime_id.to_string()));
        Self::outcome(&self.fail_stop, "stop")
    }

    async fn remove(&self, runtime_id: &str) -> std::result::Result<(), RuntimeError> {
        self.record(RuntimeCall::Remove(runtime_id.to_string()));
        Self::outcome(&self.fail_remove, "remove")
    }

    async fn start_existing(&self, runtime_id: &str) -> std::result::Result<(), RuntimeError> {
        self.record(RuntimeCall::StartExisting(runtime_id.to_string()));
        Self::outcome(&self.fail_start_existing, "start")
    }
}

/// Metadata store whose writes can be made to fail or slow down on demand.
/// Tracks the highest number of updates seen running at once.
#[derive(Default)]
pub struct FailingStore {
    pub inner: MemoryStore,
    pub fail_create: AtomicBool,
    pub fail_update: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_batch: AtomicBool,
    update_delay: Mutex<Duration>,
    updates_in_flight: AtomicUsize,
    peak_updates: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_update_delay(inner: MemoryStore, delay: Duration) -> Self {
        Self {
            inner,
            update_delay: Mutex::new(delay),
            ..Self::default()
        }
    }

    pub fn peak_updates(&self) -> usize {
        self.peak_updates.load(Ordering::SeqCst)
    }

    fn check(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(Error::external(
                "database",
                std::io::Error::other("connection refused"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for FailingStore {
    async fn create_container(&self, container: NewContainer) -> Result<Container> {
        Self::check(&self.fail_create)?;
        self.inner.create_container(container).await
    }

    async fn create_many_containers(&self, containers: Vec<NewContainer>) -> Result<BatchInsert> {
        Self::check(&self.fail_batch)?;
        self.inner.create_many_containers(containers).await
    }

    async fn view_all_containers(&self, query: &ListQuery) -> Result<(u64, Vec<Container>)> {
        self.inner.view_all_containers(query).await
    }

    async fn get_container(&self, id: i64) -> Result<Container> {
        self.inner.get_container(id).await
    }

    async fn update_container(&self, id: i64, patch: &ContainerPatch) -> Result<Container> {
        Self::check(&self.fail_update)?;
        let running = self.updates_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_updates.fetch_max(running, Ordering::SeqCst);
        let delay = *self.update_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let updated = self.inner.update_container(id, patch).await;
        self.updates_in_flight.fetch_sub(1, Ordering::SeqCst);
        updated
    }

    async fn delete_container(&self, id: i64) -> Result<()> {
        Self::check(&self.fail_delete)?;
        self.inner.delete_container(id).await
    }

    async fn container_names(&self) -> Result<Vec<ContainerName>> {
        self.inner.container_names().await
    }

    async fn count_containers(&self, status: Option<ContainerStatus>) -> Result<u64> {
        self.inner.count_containers(status).await
    }
}

/// Queue fed from an mpsc channel. Dropping the sender closes the queue.
pub struct ChannelQueue {
    rx: tokio::sync::Mutex<mpsc::Receiver<std::result::Result<QueueMessage, QueueError>>>,
    pub closed: AtomicBool,
}

impl ChannelQueue {
    pub fn new(
        capacity: usize,
    ) -> (mpsc::Sender<std::result::Result<QueueMessage, QueueError>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        let queue = Self {
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        };
        (tx, queue)
    }
}

#[async_trait]
impl MessageQueue for ChannelQueue {
    async fn read_next(&self) -> std::result::Result<QueueMessage, QueueError> {
        match self.rx.lock().await.recv().await {
            Some(message) => message,
            None => Err(QueueError::Closed),
        }
    }

    async fn close(&self) -> std::result::Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        self.rx.lock().await.close();
        Ok(())
    }
}

pub fn message(payload: &str) -> QueueMessage {
    QueueMessage {
        key: None,
        payload: payload.as_bytes().to_vec(),
    }
}
