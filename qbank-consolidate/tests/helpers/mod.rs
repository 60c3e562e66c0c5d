//! Content-bank fixtures for integration tests
//!
//! Item `n` gets live version id `n * 10` (version 1) unless versions are
//! added explicitly with [`Bank::add_version`].

#![allow(dead_code)]

use qbank_common::db::init::init_memory_database;
use qbank_common::ConsolidationConfig;
use qbank_consolidate::reachability::ContextPathOracle;
use qbank_consolidate::store::{SqliteStore, Store};
use qbank_consolidate::Consolidator;
use sqlx::SqlitePool;
use std::sync::Arc;

pub struct Bank {
    pub pool: SqlitePool,
}

impl Bank {
    /// Empty bank with a system context (1) and its root container (1)
    pub async fn new() -> Self {
        let pool = init_memory_database().await.expect("in-memory database");
        let bank = Self { pool };
        bank.context(1, "system", "/1").await;
        bank.container(1, 1, None, "top").await;
        bank
    }

    pub async fn exec(&self, sql: &str) {
        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .unwrap_or_else(|e| panic!("fixture statement failed: {}: {}", sql, e));
    }

    pub async fn context(&self, id: i64, level: &str, path: &str) {
        sqlx::query("INSERT INTO contexts (id, level, path, name) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(level)
            .bind(path)
            .bind(format!("{} {}", level, id))
            .execute(&self.pool)
            .await
            .unwrap();
    }

    pub async fn container(&self, id: i64, context: i64, parent: Option<i64>, name: &str) {
        self.container_with_info(id, context, parent, name, "").await;
    }

    pub async fn container_with_info(&self, id: i64, context: i64, parent: Option<i64>, name: &str, info: &str) {
        sqlx::query("INSERT INTO containers (id, context_id, parent_id, name, info) VALUES (?, ?, ?, ?, ?)")
            .bind(id)
            .bind(context)
            .bind(parent)
            .bind(name)
            .bind(info)
            .execute(&self.pool)
            .await
            .unwrap();
    }

    /// Item with one ready version `id * 10`
    pub async fn item(&self, id: i64, container: i64, type_tag: &str, content: &str) {
        sqlx::query("INSERT INTO items (id, container_id, type_tag) VALUES (?, ?, ?)")
            .bind(id)
            .bind(container)
            .bind(type_tag)
            .execute(&self.pool)
            .await
            .unwrap();
        self.add_version(id, 1, "ready", content).await;
    }

    /// Version `number` of `item`, with id `item * 10 + number - 1`
    pub async fn add_version(&self, item: i64, number: i64, status: &str, content: &str) -> i64 {
        let version_id = item * 10 + number - 1;
        sqlx::query("INSERT INTO item_versions (id, item_id, version, status, content) VALUES (?, ?, ?, ?, ?)")
            .bind(version_id)
            .bind(item)
            .bind(number)
            .bind(status)
            .bind(content)
            .execute(&self.pool)
            .await
            .unwrap();
        version_id
    }

    pub async fn hide(&self, item: i64) {
        sqlx::query("UPDATE item_versions SET status = 'hidden' WHERE item_id = ?")
            .bind(item)
            .execute(&self.pool)
            .await
            .unwrap();
    }

    pub async fn reference(&self, version: i64, component: &str) {
        sqlx::query("INSERT INTO external_refs (version_id, component) VALUES (?, ?)")
            .bind(version)
            .bind(component)
            .execute(&self.pool)
            .await
            .unwrap();
    }

    /// Make every relocation of `item` fail inside the transaction
    pub async fn fail_relocation_of(&self, item: i64) {
        self.exec(&format!(
            "CREATE TRIGGER fail_move_{item} BEFORE UPDATE OF container_id ON items \
             WHEN OLD.id = {item} BEGIN SELECT RAISE(ABORT, 'induced failure'); END"
        ))
        .await;
    }

    pub async fn container_of(&self, item: i64) -> Option<i64> {
        sqlx::query_scalar("SELECT container_id FROM items WHERE id = ?")
            .bind(item)
            .fetch_optional(&self.pool)
            .await
            .unwrap()
    }

    pub async fn container_exists(&self, id: i64) -> bool {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM containers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .unwrap();
        found.is_some()
    }

    pub async fn refs_on(&self, version: i64) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM external_refs WHERE version_id = ?")
            .bind(version)
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    /// References whose version no longer exists
    pub async fn dangling_refs(&self) -> i64 {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM external_refs r \
             LEFT JOIN item_versions v ON v.id = r.version_id WHERE v.id IS NULL",
        )
        .fetch_one(&self.pool)
        .await
        .unwrap()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::new(SqliteStore::new(self.pool.clone()))
    }

    pub fn engine(&self, config: ConsolidationConfig) -> Consolidator {
        let store = self.store();
        let oracle = Arc::new(ContextPathOracle::new(store.clone()));
        Consolidator::new(store, oracle, config).expect("valid configuration")
    }
}

pub fn anchored_config() -> ConsolidationConfig {
    ConsolidationConfig {
        anchor_label: Some("Anchor".to_string()),
        ..Default::default()
    }
}
