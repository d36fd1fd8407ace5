//! Lifecycle orchestration across the container runtime, the metadata store
//! and the status log.
//!
//! Operations run on the caller's task. The three stores are not updated
//! atomically: `create_container` compensates a failed persist with a
//! best-effort stop, every other path stops at the first failing step.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::container::{
    Container, ContainerName, ContainerPatch, ContainerStatus, ListQuery, NewContainer,
};
use crate::error::{Error, Result};
use crate::runtime::RuntimeClient;
use crate::status_log::{StatusEvent, StatusLog};
use crate::store::MetadataStore;

/// One row of a bulk import.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImportRow {
    #[serde(default, alias = "container_name")]
    pub name: String,
    #[serde(default, alias = "image_name")]
    pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub successful_count: usize,
    pub successful_items: Vec<String>,
    pub failed_count: usize,
    pub failed_items: Vec<String>,
}

pub struct LifecycleOrchestrator {
    runtime: Arc<dyn RuntimeClient>,
    store: Arc<dyn MetadataStore>,
    status_log: Arc<dyn StatusLog>,
}

impl LifecycleOrchestrator {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        store: Arc<dyn MetadataStore>,
        status_log: Arc<dyn StatusLog>,
    ) -> Self {
        Self {
            runtime,
            store,
            status_log,
        }
    }

    /// Start a runtime container and record it. Returns the record id.
    pub async fn create_container(&self, name: &str, image: &str) -> Result<i64> {
        let runtime_id = self
            .runtime
            .start(name, image)
            .await
            .inspect_err(|e| log::error!("Failed to start Docker container {}: {}", name, e))
            .map_err(|e| Error::external("failed to start Docker container", e))?;

        let record = NewContainer {
            runtime_id: runtime_id.clone(),
            name: name.to_string(),
            image: image.to_string(),
            status: ContainerStatus::Running,
        };

        let created = match self.store.create_container(record).await {
            Ok(created) => created,
            Err(e) => {
                log::error!("Failed to create container {} in repository: {}", name, e);
                match self.runtime.stop(&runtime_id).await {
                    Ok(()) => log::info!(
                        "Stopped Docker container {} after repository creation failure",
                        runtime_id
                    ),
                    Err(stop_err) => log::error!(
                        "Failed to stop Docker container {} after repository creation failure: {}",
                        runtime_id,
                        stop_err
                    ),
                }
                return Err(e.at_stage("failed to create container in repository"));
            }
        };

        log::info!(
            "Container created successfully, id {} runtime id {}",
            created.id,
            runtime_id
        );
        Ok(created.id)
    }

    pub async fn view_all_containers(&self, query: &ListQuery) -> Result<(u64, Vec<Container>)> {
        let (count, containers) = self
            .store
            .view_all_containers(query)
            .await
            .inspect_err(|e| log::error!("Failed to retrieve containers: {}", e))
            .map_err(|e| e.at_stage("failed to retrieve containers"))?;

        log::info!("Retrieved containers successfully, count {}", count);
        Ok((count, containers))
    }

    pub async fn update_container(&self, id: i64, mut patch: ContainerPatch) -> Result<Container> {
        if patch.name.is_some() {
            log::warn!("Container name update is not allowed, id {}", id);
            return Err(Error::validation("updating container name is not allowed"));
        }

        let current = self
            .store
            .get_container(id)
            .await
            .inspect_err(|e| log::error!("Failed to retrieve container {} for update: {}", id, e))
            .map_err(|e| e.at_stage("failed to retrieve container for update"))?;

        if let Some(image) = patch.image.as_deref().filter(|i| !i.is_empty() && *i != current.image) {
            let runtime_id = self.replace_image(&current, image).await?;
            // The replacement starts out running.
            if patch.status.unwrap_or(current.status) == ContainerStatus::Stopped {
                self.stop_runtime(&runtime_id).await?;
            }
            patch.runtime_id = Some(runtime_id);
        } else if let Some(status) = patch.status.filter(|s| *s != current.status) {
            match status {
                ContainerStatus::Running => self
                    .runtime
                    .start_existing(&current.runtime_id)
                    .await
                    .inspect_err(|e| {
                        log::error!(
                            "Failed to start Docker container {}: {}",
                            current.runtime_id,
                            e
                        )
                    })
                    .map_err(|e| Error::external("failed to start Docker container", e))?,
                ContainerStatus::Stopped => self.stop_runtime(&current.runtime_id).await?,
            }
        }

        let updated = self
            .store
            .update_container(id, &patch)
            .await
            .inspect_err(|e| log::error!("Failed to update container {} in repository: {}", id, e))
            .map_err(|e| e.at_stage("failed to update container in repository"))?;

        log::info!(
            "Container {} updated successfully, runtime id {}",
            id,
            updated.runtime_id
        );
        Ok(updated)
    }

    async fn stop_runtime(&self, runtime_id: &str) -> Result<()> {
        self.runtime
            .stop(runtime_id)
            .await
            .inspect_err(|e| log::error!("Failed to stop Docker container {}: {}", runtime_id, e))
            .map_err(|e| Error::external("failed to stop Docker container", e))
    }

    /// Stop and remove the current runtime container, then start a fresh one
    /// from `image` under the same name. Returns the new runtime id.
    async fn replace_image(&self, current: &Container, image: &str) -> Result<String> {
        self.runtime
            .stop(&current.runtime_id)
            .await
            .inspect_err(|e| {
                log::error!(
                    "Failed to update Docker container image {}: {}",
                    current.runtime_id,
                    e
                )
            })
            .map_err(|e| Error::external("failed to update Docker container image", e))?;

        self.runtime
            .remove(&current.runtime_id)
            .await
            .inspect_err(|e| {
                log::error!(
                    "Failed to remove Docker container {} before updating image: {}",
                    current.runtime_id,
                    e
                )
            })
            .map_err(|e| {
                Error::external("failed to remove Docker container before updating image", e)
            })?;

        self.runtime
            .start(&current.name, image)
            .await
            .inspect_err(|e| {
                log::error!(
                    "Failed to start Docker container {} with new image {}: {}",
                    current.name,
                    image,
                    e
                )
            })
            .map_err(|e| Error::external("failed to start Docker container with new image", e))
    }

    /// Stop, remove, then delete the record. Steps that already succeeded are
    /// not undone when a later one fails.
    pub async fn delete_container(&self, id: i64) -> Result<()> {
        let current = self
            .store
            .get_container(id)
            .await
            .inspect_err(|e| {
                log::error!("Failed to retrieve container {} for deletion: {}", id, e)
            })
            .map_err(|e| e.at_stage("failed to retrieve container for deletion"))?;

        self.runtime
            .stop(&current.runtime_id)
            .await
            .inspect_err(|e| {
                log::error!(
                    "Failed to stop Docker container {} before deletion: {}",
                    current.runtime_id,
                    e
                )
            })
            .map_err(|e| Error::external("failed to stop Docker container before deletion", e))?;

        self.runtime
            .remove(&current.runtime_id)
            .await
            .inspect_err(|e| {
                log::error!("Failed to remove Docker container {}: {}", current.runtime_id, e)
            })
            .map_err(|e| Error::external("failed to remove Docker container", e))?;

        self.store
            .delete_container(id)
            .await
            .inspect_err(|e| {
                log::error!("Failed to delete container {} from repository: {}", id, e)
            })
            .map_err(|e| e.at_stage("failed to delete container from repository"))?;

        log::info!("Container {} deleted successfully", id);
        Ok(())
    }

    /// Start a runtime container per row, then insert the started ones in a
    /// single batch. Rows are numbered from 1.
    pub async fn import_containers(&self, rows: Vec<ImportRow>) -> Result<ImportReport> {
        let mut to_create = Vec::new();
        let mut row_errors = Vec::new();

        for (i, row) in rows.into_iter().enumerate() {
            let row_num = i + 1;
            if row.name.is_empty() || row.image.is_empty() {
                row_errors.push(format!("Row {row_num}: Missing required fields"));
                continue;
            }

            match self.runtime.start(&row.name, &row.image).await {
                Ok(runtime_id) => to_create.push(NewContainer {
                    runtime_id,
                    name: row.name,
                    image: row.image,
                    status: ContainerStatus::Running,
                }),
                Err(e) => {
                    log::error!("Failed to start Docker container {}: {}", row.name, e);
                    row_errors.push(format!("Row {row_num}: Failed to start container - {e}"));
                }
            }
        }

        if to_create.is_empty() {
            if row_errors.is_empty() {
                log::warn!("No valid data found in import");
            } else {
                log::error!("No valid containers to import: {:?}", row_errors);
            }
            return Ok(ImportReport {
                failed_count: row_errors.len(),
                failed_items: row_errors,
                ..Default::default()
            });
        }

        let started = describe_started(&to_create);
        let batch = self
            .store
            .create_many_containers(to_create)
            .await
            .inspect_err(|e| {
                log::error!(
                    "Repository failed during batch insert, runtime containers left running: {}: {}",
                    started,
                    e
                )
            })
            .map_err(|e| e.at_stage("failed to import containers at repository level"))?;

        let mut report = ImportReport {
            successful_count: batch.created.len(),
            successful_items: batch
                .created
                .iter()
                .map(|c| format!("{} (ID: {})", c.name, c.id))
                .collect(),
            failed_count: row_errors.len() + batch.failed.len(),
            failed_items: row_errors,
        };
        report.failed_items.extend(
            batch
                .failed
                .iter()
                .map(|c| format!("{} (repository error)", c.name)),
        );

        log::info!(
            "Containers imported, {} successful, {} failed",
            report.successful_count,
            report.failed_count
        );
        Ok(report)
    }

    pub async fn export_containers(&self, query: &ListQuery) -> Result<Vec<Container>> {
        let (_, containers) = self
            .store
            .view_all_containers(query)
            .await
            .inspect_err(|e| log::error!("Failed to retrieve containers for export: {}", e))
            .map_err(|e| e.at_stage("failed to retrieve containers for export"))?;

        log::info!("Containers exported successfully, count {}", containers.len());
        Ok(containers)
    }

    pub async fn container_names(&self) -> Result<Vec<ContainerName>> {
        self.store
            .container_names()
            .await
            .inspect_err(|e| log::error!("Failed to retrieve container names: {}", e))
            .map_err(|e| e.at_stage("failed to retrieve container names"))
    }

    pub async fn count_containers(&self) -> Result<u64> {
        let count = self
            .store
            .count_containers(None)
            .await
            .inspect_err(|e| log::error!("Failed to get number of containers: {}", e))
            .map_err(|e| e.at_stage("failed to get number of containers"))?;
        log::info!("Number of containers: {}", count);
        Ok(count)
    }

    pub async fn count_running_containers(&self) -> Result<u64> {
        let count = self
            .store
            .count_containers(Some(ContainerStatus::Running))
            .await
            .inspect_err(|e| log::error!("Failed to get number of running containers: {}", e))
            .map_err(|e| e.at_stage("failed to get number of running containers"))?;
        log::info!("Number of running containers: {}", count);
        Ok(count)
    }

    /// Record a status event for container `id` stamped with the current time.
    pub async fn add_container_status(&self, id: i64, status: &str) -> Result<()> {
        let status: ContainerStatus = status
            .parse()
            .inspect_err(|e| log::warn!("Rejected status for container {}: {}", id, e))?;

        self.status_log
            .append(&StatusEvent::now(id, status))
            .await
            .inspect_err(|e| log::error!("Failed to add status {} for container {}: {}", status, id, e))
            .map_err(|e| e.at_stage("failed to add container status"))?;

        log::info!("Container status added successfully, id {} status {}", id, status);
        Ok(())
    }
}

/// `name (runtime id)` for each started container, comma separated.
fn describe_started(containers: &[NewContainer]) -> String {
    containers
        .iter()
        .map(|c| format!("{} ({})", c.name, c.runtime_id))
        .collect::<Vec<_>>()
        .join(", ")
}
