//! Metadata store for container records.
//!
//! Every mutating call runs inside a transaction scoped to that call. The
//! scope guards in each backend roll back on early return *and* on unwind, so
//! a panic inside a store call never leaves a transaction open.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::container::{
    Container, ContainerName, ContainerPatch, ContainerStatus, ListQuery, NewContainer,
};
use crate::error::Result;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Outcome of a bulk insert. Rows are inserted independently; when none
/// succeed the whole transaction is rolled back and every row is in `failed`.
#[derive(Debug, Default)]
pub struct BatchInsert {
    pub created: Vec<Container>,
    pub failed: Vec<NewContainer>,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_container(&self, container: NewContainer) -> Result<Container>;

    async fn create_many_containers(&self, containers: Vec<NewContainer>) -> Result<BatchInsert>;

    /// Returns the number of rows matching the filter and the requested page.
    async fn view_all_containers(&self, query: &ListQuery) -> Result<(u64, Vec<Container>)>;

    async fn get_container(&self, id: i64) -> Result<Container>;

    /// Apply `patch` to record `id` and return the updated record.
    async fn update_container(&self, id: i64, patch: &ContainerPatch) -> Result<Container>;

    async fn delete_container(&self, id: i64) -> Result<()>;

    async fn container_names(&self) -> Result<Vec<ContainerName>>;

    async fn count_containers(&self, status: Option<ContainerStatus>) -> Result<u64>;
}
