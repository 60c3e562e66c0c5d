//! SQLite implementation of [`Store`]

use super::retry::retry_on_lock;
use super::transaction::begin_monitored;
use super::{ContainerFilter, ContextFilter, ItemFilter, Mutation, ParentFilter, Store};
use async_trait::async_trait;
use qbank_common::db::models::{
    Container, ContainerId, Context, ContextId, ContextLevel, Item, ItemId, ItemVersion,
    VersionId, VersionStatus,
};
use qbank_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashMap;

/// Content bank backed by an sqlx SQLite pool
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    lock_wait_ms: u64,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            lock_wait_ms: 5000,
        }
    }

    /// Maximum total wait when the database reports lock contention
    pub fn with_lock_wait(mut self, lock_wait_ms: u64) -> Self {
        self.lock_wait_ms = lock_wait_ms;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn apply_all(&self, mutations: &[Mutation]) -> Result<()> {
        let mut tx = begin_monitored(&self.pool, "sqlite_store::run_in_transaction").await?;

        for (index, mutation) in mutations.iter().enumerate() {
            let outcome = apply_mutation(tx.conn()?, mutation).await;
            if let Err(e) = outcome {
                tracing::debug!(index, ?mutation, error = %e, "Mutation failed, rolling back");
                tx.rollback().await?;
                return Err(e);
            }
        }

        tx.commit().await
    }

    async fn version_ids_for(&self, items: &[ItemId]) -> Result<HashMap<ItemId, Vec<VersionId>>> {
        let mut map: HashMap<ItemId, Vec<VersionId>> = HashMap::new();
        if items.is_empty() {
            return Ok(map);
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, item_id FROM item_versions WHERE item_id IN (");
        let mut separated = qb.separated(", ");
        for id in items {
            separated.push_bind(id.0);
        }
        separated.push_unseparated(") ORDER BY item_id, version");

        for row in qb.build().fetch_all(&self.pool).await? {
            let version: i64 = row.try_get("id")?;
            let item: i64 = row.try_get("item_id")?;
            map.entry(ItemId(item)).or_default().push(VersionId(version));
        }

        Ok(map)
    }
}

fn push_in_list(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, values: &[i64]) {
    qb.push(format!(" AND {} IN (", column));
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(*value);
    }
    separated.push_unseparated(")");
}

fn push_level_list(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, levels: &[ContextLevel]) {
    qb.push(format!(" AND {} IN (", column));
    let mut separated = qb.separated(", ");
    for level in levels {
        separated.push_bind(level.as_str());
    }
    separated.push_unseparated(")");
}

fn context_from_row(row: &SqliteRow) -> Result<Context> {
    let level: String = row.try_get("level")?;
    Ok(Context {
        id: ContextId(row.try_get("id")?),
        level: level.parse().map_err(Error::Internal)?,
        instance_id: row.try_get("instance_id")?,
        path: row.try_get("path")?,
        name: row.try_get("name")?,
    })
}

fn container_from_row(row: &SqliteRow) -> Result<Container> {
    let parent: Option<i64> = row.try_get("parent_id")?;
    Ok(Container {
        id: ContainerId(row.try_get("id")?),
        context_id: ContextId(row.try_get("context_id")?),
        parent_id: parent.map(ContainerId),
        name: row.try_get("name")?,
        info: row.try_get("info")?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn find_contexts(&self, filter: &ContextFilter) -> Result<Vec<Context>> {
        if matches!(&filter.ids, Some(ids) if ids.is_empty())
            || matches!(&filter.levels, Some(levels) if levels.is_empty())
        {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, level, instance_id, path, name FROM contexts WHERE 1 = 1");
        if let Some(ids) = &filter.ids {
            let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
            push_in_list(&mut qb, "id", &ids);
        }
        if let Some(levels) = &filter.levels {
            push_level_list(&mut qb, "level", levels);
        }
        qb.push(" ORDER BY id");

        qb.build()
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(context_from_row)
            .collect()
    }

    async fn find_containers(&self, filter: &ContainerFilter) -> Result<Vec<Container>> {
        if matches!(&filter.ids, Some(ids) if ids.is_empty())
            || matches!(&filter.context_ids, Some(ids) if ids.is_empty())
            || matches!(&filter.context_levels, Some(levels) if levels.is_empty())
            || matches!(&filter.parent_ids, Some(ids) if ids.is_empty())
        {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT c.id, c.context_id, c.parent_id, c.name, c.info \
             FROM containers c JOIN contexts x ON x.id = c.context_id WHERE 1 = 1",
        );
        if let Some(ids) = &filter.ids {
            let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
            push_in_list(&mut qb, "c.id", &ids);
        }
        if let Some(ids) = &filter.context_ids {
            let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
            push_in_list(&mut qb, "c.context_id", &ids);
        }
        if let Some(levels) = &filter.context_levels {
            push_level_list(&mut qb, "x.level", levels);
        }
        if let Some(ids) = &filter.parent_ids {
            let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
            push_in_list(&mut qb, "c.parent_id", &ids);
        }
        match filter.parent {
            Some(ParentFilter::Root) => {
                qb.push(" AND c.parent_id IS NULL");
            }
            Some(ParentFilter::Of(parent)) => {
                qb.push(" AND c.parent_id = ").push_bind(parent.0);
            }
            None => {}
        }
        qb.push(" ORDER BY c.id");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        qb.build()
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(container_from_row)
            .collect()
    }

    async fn find_items(&self, filter: &ItemFilter) -> Result<Vec<Item>> {
        if matches!(&filter.ids, Some(ids) if ids.is_empty())
            || matches!(&filter.container_ids, Some(ids) if ids.is_empty())
        {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT i.id, i.container_id, i.type_tag, \
                    v.id AS version_id, v.version, v.status, v.content \
             FROM items i \
             JOIN item_versions v ON v.item_id = i.id \
             WHERE v.version = (SELECT MAX(version) FROM item_versions WHERE item_id = i.id)",
        );
        if let Some(ids) = &filter.ids {
            let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
            push_in_list(&mut qb, "i.id", &ids);
        }
        if let Some(ids) = &filter.container_ids {
            let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
            push_in_list(&mut qb, "i.container_id", &ids);
        }
        if !filter.exclude_ids.is_empty() {
            qb.push(" AND i.id NOT IN (");
            let mut separated = qb.separated(", ");
            for id in &filter.exclude_ids {
                separated.push_bind(id.0);
            }
            separated.push_unseparated(")");
        }
        if let Some(after) = filter.after_id {
            qb.push(" AND i.id > ").push_bind(after.0);
        }
        qb.push(" ORDER BY i.id");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let status: String = row.try_get("status")?;
            items.push(Item {
                id: ItemId(row.try_get("id")?),
                container_id: ContainerId(row.try_get("container_id")?),
                type_tag: row.try_get("type_tag")?,
                live: ItemVersion {
                    id: VersionId(row.try_get("version_id")?),
                    number: row.try_get("version")?,
                    status: status.parse::<VersionStatus>().map_err(Error::Internal)?,
                    content: row.try_get("content")?,
                },
                version_ids: Vec::new(),
            });
        }

        let ids: Vec<ItemId> = items.iter().map(|item| item.id).collect();
        let mut versions = self.version_ids_for(&ids).await?;
        for item in &mut items {
            item.version_ids = versions.remove(&item.id).unwrap_or_default();
        }

        Ok(items)
    }

    async fn count_external_references(&self, version: VersionId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM external_refs WHERE version_id = ?")
            .bind(version.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn run_in_transaction(&self, mutations: &[Mutation]) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        retry_on_lock("run_in_transaction", self.lock_wait_ms, || self.apply_all(mutations)).await
    }

    async fn count_items(&self, container: ContainerId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE container_id = ?")
            .bind(container.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

async fn apply_mutation(conn: &mut SqliteConnection, mutation: &Mutation) -> Result<()> {
    match *mutation {
        Mutation::RelocateItem { item, to } => {
            let result = sqlx::query("UPDATE items SET container_id = ? WHERE id = ?")
                .bind(to.0)
                .bind(item.0)
                .execute(&mut *conn)
                .await?;
            if result.rows_affected() == 0 {
                return Err(Error::NotFound(format!("item {}", item)));
            }
        }
        Mutation::RepointReferences { from, to } => {
            sqlx::query("UPDATE external_refs SET version_id = ? WHERE version_id = ?")
                .bind(to.0)
                .bind(from.0)
                .execute(&mut *conn)
                .await?;
        }
        Mutation::DeleteItem { item } => {
            let remaining: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*)
                FROM external_refs r
                JOIN item_versions v ON v.id = r.version_id
                WHERE v.item_id = ?
                "#,
            )
            .bind(item.0)
            .fetch_one(&mut *conn)
            .await?;
            if remaining > 0 {
                return Err(Error::InvalidInput(format!(
                    "item {} still has {} external reference(s)",
                    item, remaining
                )));
            }

            sqlx::query("DELETE FROM item_versions WHERE item_id = ?")
                .bind(item.0)
                .execute(&mut *conn)
                .await?;
            let result = sqlx::query("DELETE FROM items WHERE id = ?")
                .bind(item.0)
                .execute(&mut *conn)
                .await?;
            if result.rows_affected() == 0 {
                return Err(Error::NotFound(format!("item {}", item)));
            }
        }
        Mutation::MoveContainer {
            container,
            new_parent,
        } => {
            // Re-checked here: the tree may have changed since planning
            let in_subtree: i64 = sqlx::query_scalar(
                r#"
                WITH RECURSIVE subtree(id) AS (
                    SELECT ?
                    UNION
                    SELECT c.id FROM containers c JOIN subtree s ON c.parent_id = s.id
                )
                SELECT COUNT(*) FROM subtree WHERE id = ?
                "#,
            )
            .bind(container.0)
            .bind(new_parent.0)
            .fetch_one(&mut *conn)
            .await?;
            if in_subtree > 0 {
                return Err(Error::InvalidInput(format!(
                    "moving container {} under {} would create a cycle",
                    container, new_parent
                )));
            }

            // Parent must live in the same context
            let result = sqlx::query(
                r#"
                UPDATE containers SET parent_id = ?
                WHERE id = ?
                  AND context_id = (SELECT context_id FROM containers WHERE id = ?)
                "#,
            )
            .bind(new_parent.0)
            .bind(container.0)
            .bind(new_parent.0)
            .execute(&mut *conn)
            .await?;
            if result.rows_affected() == 0 {
                return Err(Error::InvalidInput(format!(
                    "container {} cannot move under {}",
                    container, new_parent
                )));
            }
        }
        Mutation::DeleteContainer { container } => {
            let occupants: i64 = sqlx::query_scalar(
                r#"
                SELECT (SELECT COUNT(*) FROM items WHERE container_id = ?)
                     + (SELECT COUNT(*) FROM containers WHERE parent_id = ?)
                "#,
            )
            .bind(container.0)
            .bind(container.0)
            .fetch_one(&mut *conn)
            .await?;
            if occupants > 0 {
                return Err(Error::InvalidInput(format!(
                    "container {} is not empty",
                    container
                )));
            }

            let result = sqlx::query("DELETE FROM containers WHERE id = ?")
                .bind(container.0)
                .execute(&mut *conn)
                .await?;
            if result.rows_affected() == 0 {
                return Err(Error::NotFound(format!("container {}", container)));
            }
        }
    }

    Ok(())
}
