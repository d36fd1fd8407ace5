//! In-process metadata store.
//!
//! Transactions take the table lock for their whole lifetime and work on a
//! staged copy; the copy replaces the tables only on commit. It backs the
//! `memory` database backend and the orchestrator tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{BatchInsert, MetadataStore};
use crate::container::{
    Container, ContainerName, ContainerPatch, ContainerStatus, ListQuery, NewContainer, SortOrder,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: BTreeMap<i64, Container>,
    last_id: i64,
}

impl Tables {
    fn insert(&mut self, container: NewContainer) -> Result<Container> {
        if container.runtime_id.is_empty() {
            return Err(Error::validation("container_id must not be empty"));
        }
        if self.rows.values().any(|c| c.name == container.name) {
            return Err(Error::conflict(format!(
                "container name {} already exists",
                container.name
            )));
        }
        if self.rows.values().any(|c| c.runtime_id == container.runtime_id) {
            return Err(Error::conflict(format!(
                "container_id {} already exists",
                container.runtime_id
            )));
        }

        self.last_id += 1;
        let now = Utc::now();
        let created = Container {
            id: self.last_id,
            runtime_id: container.runtime_id,
            name: container.name,
            image: container.image,
            status: container.status,
            created_at: now,
            updated_at: now,
        };
        self.rows.insert(created.id, created.clone());
        Ok(created)
    }

    fn get(&self, id: i64) -> Result<&Container> {
        self.rows.get(&id).ok_or(Error::NotFound(id))
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn begin(&self, op: &'static str) -> MemoryTx {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let staged = guard.clone();
        MemoryTx {
            guard,
            staged,
            op,
            committed: false,
        }
    }
}

/// A scoped transaction over the in-process tables. Dropping it without
/// [`MemoryTx::commit`] discards the staged changes, including while
/// unwinding from a panic.
pub(crate) struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
    op: &'static str,
    committed: bool,
}

impl MemoryTx {
    pub(crate) fn insert(&mut self, container: NewContainer) -> Result<Container> {
        self.staged.insert(container)
    }

    pub(crate) fn commit(mut self) {
        *self.guard = std::mem::take(&mut self.staged);
        self.committed = true;
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if std::thread::panicking() {
            log::error!("Recovered from panic in {}, rolling back", self.op);
        } else {
            log::debug!("Rolling back {} transaction", self.op);
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn create_container(&self, container: NewContainer) -> Result<Container> {
        let mut tx = self.begin("create_container").await;
        let name = container.name.clone();
        let created = tx
            .insert(container)
            .inspect_err(|e| log::error!("Failed to create container {}: {}", name, e))?;
        tx.commit();
        log::info!("Container created successfully, id {}", created.id);
        Ok(created)
    }

    async fn create_many_containers(&self, containers: Vec<NewContainer>) -> Result<BatchInsert> {
        let mut tx = self.begin("create_many_containers").await;
        let mut batch = BatchInsert::default();

        for container in containers {
            match tx.insert(container.clone()) {
                Ok(created) => batch.created.push(created),
                Err(e) => {
                    log::error!("Failed to create container {}: {}", container.name, e);
                    batch.failed.push(container);
                }
            }
        }

        if batch.created.is_empty() && !batch.failed.is_empty() {
            log::warn!("No containers created, all {} failed", batch.failed.len());
            return Ok(batch);
        }

        tx.commit();
        log::info!(
            "Containers inserted: {} created, {} failed",
            batch.created.len(),
            batch.failed.len()
        );
        Ok(batch)
    }

    async fn view_all_containers(&self, query: &ListQuery) -> Result<(u64, Vec<Container>)> {
        let (sort_field, sort_order) = query
            .sort()
            .inspect_err(|e| log::warn!("Rejected container listing: {}", e))?;

        let mut matching = self
            .tables
            .lock()
            .await
            .rows
            .values()
            .filter(|c| query.filter.matches(c))
            .cloned()
            .collect::<Vec<_>>();

        matching.sort_by(|left, right| {
            let ordering = sort_field.compare(left, right).then(left.id.cmp(&right.id));
            match sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = matching.len() as u64;
        let offset = usize::try_from(query.offset()).unwrap_or(usize::MAX);
        let limit = usize::try_from(query.page_size()).unwrap_or(usize::MAX);
        let page = matching.into_iter().skip(offset).take(limit).collect();
        Ok((total, page))
    }

    async fn get_container(&self, id: i64) -> Result<Container> {
        self.tables
            .lock()
            .await
            .get(id)
            .cloned()
            .inspect_err(|_| log::warn!("Container {} not found", id))
    }

    async fn update_container(&self, id: i64, patch: &ContainerPatch) -> Result<Container> {
        if patch.name.is_some() {
            return Err(Error::validation("updating container name is not allowed"));
        }

        let mut tx = self.begin("update_container").await;
        let mut updated = tx.staged.get(id)?.clone();
        patch.apply_to(&mut updated);

        if let Some(runtime_id) = &patch.runtime_id {
            if runtime_id.is_empty() {
                return Err(Error::validation("container_id must not be empty"));
            }
            let taken = tx
                .staged
                .rows
                .values()
                .any(|c| c.id != id && &c.runtime_id == runtime_id);
            if taken {
                return Err(Error::conflict(format!(
                    "container_id {runtime_id} already exists"
                )));
            }
        }

        if !patch.is_empty() {
            updated.updated_at = Utc::now();
        }
        tx.staged.rows.insert(id, updated.clone());
        tx.commit();
        log::info!("Container {} updated successfully", id);
        Ok(updated)
    }

    async fn delete_container(&self, id: i64) -> Result<()> {
        let mut tx = self.begin("delete_container").await;
        tx.staged.get(id)?;
        tx.staged.rows.remove(&id);
        tx.commit();
        log::info!("Container {} deleted successfully", id);
        Ok(())
    }

    async fn container_names(&self) -> Result<Vec<ContainerName>> {
        Ok(self
            .tables
            .lock()
            .await
            .rows
            .values()
            .map(|c| ContainerName {
                id: c.id,
                name: c.name.clone(),
            })
            .collect())
    }

    async fn count_containers(&self, status: Option<ContainerStatus>) -> Result<u64> {
        let tables = self.tables.lock().await;
        let count = tables
            .rows
            .values()
            .filter(|c| status.is_none_or(|s| c.status == s))
            .count();
        Ok(count as u64)
    }
}
