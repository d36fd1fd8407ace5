//! PostgreSQL metadata store.

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::{Connection, PgPool, Postgres, QueryBuilder, Row, Transaction};

use super::{BatchInsert, MetadataStore};
use crate::container::{
    Container, ContainerFilter, ContainerName, ContainerPatch, ContainerStatus, ListQuery,
    NewContainer, SortField,
};
use crate::error::{Error, Result};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS containers (
    id             BIGSERIAL PRIMARY KEY,
    container_id   TEXT NOT NULL UNIQUE CHECK (container_id <> ''),
    container_name TEXT NOT NULL UNIQUE,
    image_name     TEXT NOT NULL,
    status         TEXT NOT NULL CHECK (status IN ('running', 'stopped')),
    created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const SELECT_CONTAINERS: &str = "SELECT id, container_id, container_name, image_name, status, \
     created_at, updated_at FROM containers";

const RETURNING_CONTAINER: &str =
    " RETURNING id, container_id, container_name, image_name, status, created_at, updated_at";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| Error::external("failed to connect to database", e))?;
        Ok(Self::new(pool))
    }

    /// Create the containers table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("failed to create containers table", e))?;
        Ok(())
    }

    async fn begin(&self, op: &'static str) -> Result<ScopedTx> {
        let tx = self.pool.begin().await.map_err(|e| {
            log::error!("Failed to begin transaction for {}: {}", op, e);
            map_sqlx_error("failed to begin transaction", e)
        })?;
        Ok(ScopedTx {
            tx,
            guard: RollbackLog { op, armed: true },
        })
    }
}

/// Transaction bound to one store operation.
///
/// Dropping it without [`ScopedTx::commit`] rolls back: sqlx queues the
/// `ROLLBACK` on the connection before it can be reused. This covers early
/// returns through `?` as well as unwinding, after which the panic keeps
/// propagating.
struct ScopedTx {
    tx: Transaction<'static, Postgres>,
    guard: RollbackLog,
}

impl ScopedTx {
    fn conn(&mut self) -> &mut PgConnection {
        &mut *self.tx
    }

    async fn commit(self) -> Result<()> {
        let Self { tx, guard } = self;
        tx.commit().await.map_err(|e| {
            log::error!("Failed to commit transaction for {}: {}", guard.op, e);
            map_sqlx_error("failed to commit transaction", e)
        })?;
        guard.disarm();
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        let Self { tx, guard } = self;
        guard.disarm();
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("failed to roll back transaction", e))
    }
}

/// Logs the implicit rollback of a [`ScopedTx`] that was dropped unfinished.
struct RollbackLog {
    op: &'static str,
    armed: bool,
}

impl RollbackLog {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RollbackLog {
    fn drop(&mut self) {
        if !self.armed {
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
impl MetadataStore for PostgresStore {
    async fn create_container(&self, container: NewContainer) -> Result<Container> {
        let mut tx = self.begin("create_container").await?;

        let row = insert(tx.conn(), &container).await.map_err(|e| {
            log::error!("Failed to create container {}: {}", container.name, e);
            map_sqlx_error("failed to create container", e)
        })?;
        let created = row_to_container(&row)?;

        tx.commit().await?;
        log::info!("Container created successfully, id {}", created.id);
        Ok(created)
    }

    async fn create_many_containers(&self, containers: Vec<NewContainer>) -> Result<BatchInsert> {
        let mut tx = self.begin("create_many_containers").await?;
        let mut batch = BatchInsert::default();

        for container in containers {
            // A failed statement aborts the whole Postgres transaction, so each
            // row gets its own savepoint.
            let mut savepoint = tx
                .conn()
                .begin()
                .await
                .map_err(|e| map_sqlx_error("failed to open savepoint", e))?;

            match insert(&mut savepoint, &container).await {
                Ok(row) => {
                    savepoint
                        .commit()
                        .await
                        .map_err(|e| map_sqlx_error("failed to release savepoint", e))?;
                    batch.created.push(row_to_container(&row)?);
                }
                Err(e) => {
                    log::error!(
                        "Failed to create container {} ({}): {}",
                        container.name,
                        container.runtime_id,
                        e
                    );
                    savepoint
                        .rollback()
                        .await
                        .map_err(|e| map_sqlx_error("failed to roll back savepoint", e))?;
                    batch.failed.push(container);
                }
            }
        }

        if batch.created.is_empty() && !batch.failed.is_empty() {
            tx.rollback().await?;
            log::warn!("No containers created, all {} failed", batch.failed.len());
            return Ok(batch);
        }

        tx.commit().await?;
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

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM containers");
        push_filters(&mut count, &query.filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                log::error!("Failed to count containers: {}", e);
                map_sqlx_error("failed to count containers", e)
            })?;

        let mut select = QueryBuilder::<Postgres>::new(SELECT_CONTAINERS);
        push_filters(&mut select, &query.filter);
        select
            .push(" ORDER BY ")
            .push(sort_field.column())
            .push(" ")
            .push(sort_order.keyword());
        if sort_field != SortField::Id {
            select.push(", id ").push(sort_order.keyword());
        }
        select
            .push(" OFFSET ")
            .push_bind(query.offset())
            .push(" LIMIT ")
            .push_bind(query.page_size());

        let rows = select.build().fetch_all(&self.pool).await.map_err(|e| {
            log::error!("Failed to retrieve containers: {}", e);
            map_sqlx_error("failed to retrieve containers", e)
        })?;
        let containers = rows.iter().map(row_to_container).collect::<Result<Vec<_>>>()?;

        log::info!(
            "Containers retrieved: total {}, page {}",
            total,
            containers.len()
        );
        Ok((u64::try_from(total).unwrap_or(0), containers))
    }

    async fn get_container(&self, id: i64) -> Result<Container> {
        let query = format!("{SELECT_CONTAINERS} WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("failed to retrieve container", e))?;

        match row {
            Some(row) => row_to_container(&row),
            None => {
                log::warn!("Container {} not found", id);
                Err(Error::NotFound(id))
            }
        }
    }

    async fn update_container(&self, id: i64, patch: &ContainerPatch) -> Result<Container> {
        if patch.name.is_some() {
            return Err(Error::validation("updating container name is not allowed"));
        }

        let mut tx = self.begin("update_container").await?;
        let current = fetch_locked(tx.conn(), id).await?;

        if patch.image.is_none() && patch.status.is_none() && patch.runtime_id.is_none() {
            tx.commit().await?;
            return Ok(current);
        }

        let mut update = QueryBuilder::<Postgres>::new("UPDATE containers SET updated_at = NOW()");
        if let Some(image) = &patch.image {
            update.push(", image_name = ").push_bind(image.clone());
        }
        if let Some(status) = patch.status {
            update.push(", status = ").push_bind(status.as_ref().to_string());
        }
        if let Some(runtime_id) = &patch.runtime_id {
            update.push(", container_id = ").push_bind(runtime_id.clone());
        }
        update
            .push(" WHERE id = ")
            .push_bind(id)
            .push(RETURNING_CONTAINER);

        let row = update.build().fetch_one(tx.conn()).await.map_err(|e| {
            log::error!("Failed to update container {}: {}", id, e);
            map_sqlx_error("failed to update container", e)
        })?;
        let updated = row_to_container(&row)?;

        tx.commit().await?;
        log::info!("Container {} updated successfully", id);
        Ok(updated)
    }

    async fn delete_container(&self, id: i64) -> Result<()> {
        let mut tx = self.begin("delete_container").await?;
        fetch_locked(tx.conn(), id).await?;

        sqlx::query("DELETE FROM containers WHERE id = $1")
            .bind(id)
            .execute(tx.conn())
            .await
            .map_err(|e| {
                log::error!("Failed to delete container {}: {}", id, e);
                map_sqlx_error("failed to delete container", e)
            })?;

        tx.commit().await?;
        log::info!("Container {} deleted successfully", id);
        Ok(())
    }

    async fn container_names(&self) -> Result<Vec<ContainerName>> {
        let rows = sqlx::query("SELECT id, container_name FROM containers ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("failed to retrieve container names", e))?;

        rows.iter()
            .map(|row| {
                Ok(ContainerName {
                    id: row.try_get("id").map_err(decode_error)?,
                    name: row.try_get("container_name").map_err(decode_error)?,
                })
            })
            .collect()
    }

    async fn count_containers(&self, status: Option<ContainerStatus>) -> Result<u64> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM containers");
        if let Some(status) = status {
            count
                .push(" WHERE status = ")
                .push_bind(status.as_ref().to_string());
        }
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("failed to count containers", e))?;
        Ok(u64::try_from(total).unwrap_or(0))
    }
}

async fn insert(conn: &mut PgConnection, container: &NewContainer) -> sqlx::Result<PgRow> {
    let query = format!(
        "INSERT INTO containers (container_id, container_name, image_name, status) \
         VALUES ($1, $2, $3, $4){RETURNING_CONTAINER}"
    );
    sqlx::query(&query)
        .bind(&container.runtime_id)
        .bind(&container.name)
        .bind(&container.image)
        .bind(container.status.as_ref())
        .fetch_one(conn)
        .await
}

/// Fetch and row-lock a record inside the caller's transaction.
async fn fetch_locked(conn: &mut PgConnection, id: i64) -> Result<Container> {
    let query = format!("{SELECT_CONTAINERS} WHERE id = $1 FOR UPDATE");
    let row = sqlx::query(&query)
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(|e| map_sqlx_error("failed to retrieve container", e))?;

    match row {
        Some(row) => row_to_container(&row),
        None => {
            log::warn!("Container {} not found", id);
            Err(Error::NotFound(id))
        }
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, filter: &ContainerFilter) {
    let mut has_where = false;

    if let Some(runtime_id) = filter.runtime_id() {
        push_where_prefix(builder, &mut has_where);
        builder
            .push("container_id = ")
            .push_bind(runtime_id.to_string());
    }

    if let Some(name) = filter.name() {
        push_where_prefix(builder, &mut has_where);
        builder
            .push("container_name LIKE ")
            .push_bind(format!("%{}%", escape_like(name)));
    }

    if let Some(image) = filter.image() {
        push_where_prefix(builder, &mut has_where);
        builder
            .push("image_name LIKE ")
            .push_bind(format!("%{}%", escape_like(image)));
    }

    if let Some(status) = filter.status {
        push_where_prefix(builder, &mut has_where);
        builder
            .push("status = ")
            .push_bind(status.as_ref().to_string());
    }
}

fn push_where_prefix(builder: &mut QueryBuilder<'_, Postgres>, has_where: &mut bool) {
    if !*has_where {
        builder.push(" WHERE ");
        *has_where = true;
    } else {
        builder.push(" AND ");
    }
}

/// Make `%`, `_` and `\` match literally inside a LIKE pattern.
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn row_to_container(row: &PgRow) -> Result<Container> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    Ok(Container {
        id: row.try_get("id").map_err(decode_error)?,
        runtime_id: row.try_get("container_id").map_err(decode_error)?,
        name: row.try_get("container_name").map_err(decode_error)?,
        image: row.try_get("image_name").map_err(decode_error)?,
        status: status
            .parse()
            .map_err(|e| Error::external("failed to decode container row", e))?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
    })
}

fn decode_error(error: sqlx::Error) -> Error {
    Error::external("failed to decode container row", error)
}

fn map_sqlx_error(stage: &'static str, error: sqlx::Error) -> Error {
    match error {
        sqlx::Error::Database(db_error) => match db_error.code().as_deref() {
            Some("23505") => Error::conflict(db_error.message().to_string()),
            Some("23514") => Error::validation(db_error.message().to_string()),
            _ => Error::external(stage, sqlx::Error::Database(db_error)),
        },
        other => Error::external(stage, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_log_survives_unwinding() {
        let outcome = std::panic::catch_unwind(|| {
            let _guard = RollbackLog {
                op: "update_container",
                armed: true,
            };
            panic!("query failed");
        });
        let payload = outcome.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"query failed"));
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("web"), "web");
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
        assert_eq!(escape_like("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_push_filters_without_predicates() {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM containers");
        push_filters(&mut builder, &ContainerFilter::default());
        assert_eq!(builder.sql(), "SELECT COUNT(*) FROM containers");
    }

    #[test]
    fn test_push_filters_joins_predicates() {
        let filter = ContainerFilter {
            runtime_id: Some("c1".to_string()),
            name: Some("web".to_string()),
            image: None,
            status: Some(ContainerStatus::Running),
        };
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM containers");
        push_filters(&mut builder, &filter);
        assert_eq!(
            builder.sql(),
            "SELECT COUNT(*) FROM containers WHERE container_id = $1 AND container_name LIKE $2 AND status = $3"
        );
    }

    #[test]
    fn test_count_and_page_share_predicate() {
        let filter = ContainerFilter {
            image: Some("nginx".to_string()),
            ..Default::default()
        };
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM containers");
        let mut select = QueryBuilder::<Postgres>::new(SELECT_CONTAINERS);
        push_filters(&mut count, &filter);
        push_filters(&mut select, &filter);

        let count_where = count.sql().split_once(" WHERE ").map(|(_, w)| w.to_string());
        let select_where = select.sql().split_once(" WHERE ").map(|(_, w)| w.to_string());
        assert_eq!(count_where, select_where);
        assert_eq!(count_where.as_deref(), Some("image_name LIKE $1"));
    }
}
