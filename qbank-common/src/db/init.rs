//! Database initialization
//!
//! Opens (or creates) the SQLite content-bank file and makes sure the
//! schema exists. Every statement is idempotent so start-up is safe to
//! repeat against an existing database.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Open the database at `db_path`, creating file and tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL lets report queries run while a batch transaction holds the writer
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    // Short busy timeout; longer waits are handled by the store's lock retry
    sqlx::query("PRAGMA busy_timeout = 250").execute(&pool).await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Open a private in-memory database with the full schema
///
/// Uses a single connection: every connection to `sqlite::memory:` would
/// otherwise see its own empty database.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    create_schema(&pool).await?;

    Ok(pool)
}

/// Create every content-bank table and index (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_contexts_table(pool).await?;
    create_containers_table(pool).await?;
    create_items_table(pool).await?;
    create_item_versions_table(pool).await?;
    create_external_refs_table(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_contexts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contexts (
            id INTEGER PRIMARY KEY,
            level TEXT NOT NULL CHECK (level IN ('system', 'coursecat', 'course', 'module')),
            instance_id INTEGER NOT NULL DEFAULT 0,
            path TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_contexts_level ON contexts(level)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_containers_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS containers (
            id INTEGER PRIMARY KEY,
            context_id INTEGER NOT NULL REFERENCES contexts(id),
            parent_id INTEGER REFERENCES containers(id),
            name TEXT NOT NULL,
            info TEXT NOT NULL DEFAULT '',
            sort_order INTEGER NOT NULL DEFAULT 999
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_containers_context ON containers(context_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_containers_parent ON containers(parent_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_items_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id INTEGER PRIMARY KEY,
            container_id INTEGER NOT NULL REFERENCES containers(id),
            type_tag TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_container ON items(container_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_item_versions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS item_versions (
            id INTEGER PRIMARY KEY,
            item_id INTEGER NOT NULL REFERENCES items(id),
            version INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'ready' CHECK (status IN ('ready', 'hidden', 'draft')),
            content TEXT NOT NULL,
            UNIQUE (item_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_external_refs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS external_refs (
            id INTEGER PRIMARY KEY,
            version_id INTEGER NOT NULL REFERENCES item_versions(id),
            component TEXT NOT NULL,
            usage_label TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_external_refs_version ON external_refs(version_id)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_schema_is_idempotent() {
        let pool = init_memory_database().await.unwrap();

        // Second run must not fail or duplicate the version row
        create_schema(&pool).await.unwrap();

        let versions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[tokio::test]
    async fn test_version_status_is_constrained() {
        let pool = init_memory_database().await.unwrap();

        sqlx::query("INSERT INTO contexts (id, level, path) VALUES (1, 'system', '/1')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO containers (id, context_id, name) VALUES (1, 1, 'top')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO items (id, container_id, type_tag) VALUES (1, 1, 'mc')")
            .execute(&pool)
            .await
            .unwrap();

        let result = sqlx::query(
            "INSERT INTO item_versions (item_id, version, status, content) VALUES (1, 1, 'bogus', 'x')",
        )
        .execute(&pool)
        .await;

        assert!(result.is_err(), "Unknown status should violate CHECK constraint");
    }
}
