//! Reachability oracle
//!
//! Answers whether a caller acting from some scope may see (and therefore
//! target) a container.

use crate::store::Store;
use async_trait::async_trait;
use qbank_common::db::models::{Container, Scope};
use std::sync::Arc;

/// Supplied by the surrounding authorization/context layer
#[async_trait]
pub trait ReachabilityOracle: Send + Sync {
    async fn is_container_reachable_from_scope(&self, container: &Container, scope: Scope) -> bool;
}

/// Context-path visibility: a scope sees its own context and every
/// ancestor context (an activity sees its course, a course sees its
/// category chain and the system context)
pub struct ContextPathOracle {
    store: Arc<dyn Store>,
}

impl ContextPathOracle {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ReachabilityOracle for ContextPathOracle {
    async fn is_container_reachable_from_scope(&self, container: &Container, scope: Scope) -> bool {
        let scope_context = match scope {
            Scope::System => return true,
            Scope::Context(id) => id,
        };

        match self.store.get_context(scope_context).await {
            Ok(Some(context)) => context.sees(container.context_id),
            Ok(None) => {
                tracing::warn!(scope = %scope, "Scope context does not exist; nothing is reachable");
                false
            }
            Err(e) => {
                tracing::warn!(scope = %scope, error = %e, "Reachability lookup failed; treating as unreachable");
                false
            }
        }
    }
}

/// Oracle that sees everything; for system-level tooling
pub struct Unrestricted;

#[async_trait]
impl ReachabilityOracle for Unrestricted {
    async fn is_container_reachable_from_scope(&self, _container: &Container, _scope: Scope) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use qbank_common::db::init::init_memory_database;
    use qbank_common::db::models::{ContainerId, ContextId};

    async fn oracle() -> ContextPathOracle {
        let pool = init_memory_database().await.unwrap();
        for sql in [
            "INSERT INTO contexts (id, level, path) VALUES (1, 'system', '/1')",
            "INSERT INTO contexts (id, level, path) VALUES (3, 'coursecat', '/1/3')",
            "INSERT INTO contexts (id, level, path) VALUES (15, 'course', '/1/3/15')",
            "INSERT INTO contexts (id, level, path) VALUES (16, 'course', '/1/3/16')",
        ] {
            sqlx::query(sql).execute(&pool).await.unwrap();
        }
        ContextPathOracle::new(Arc::new(SqliteStore::new(pool)))
    }

    fn container_in(context: i64) -> Container {
        Container {
            id: ContainerId(1),
            context_id: ContextId(context),
            parent_id: None,
            name: "c".to_string(),
            info: String::new(),
        }
    }

    #[tokio::test]
    async fn test_course_sees_ancestors() {
        let oracle = oracle().await;
        let scope = Scope::Context(ContextId(15));

        assert!(oracle.is_container_reachable_from_scope(&container_in(1), scope).await);
        assert!(oracle.is_container_reachable_from_scope(&container_in(3), scope).await);
        assert!(oracle.is_container_reachable_from_scope(&container_in(15), scope).await);
    }

    #[tokio::test]
    async fn test_course_cannot_see_sibling_course() {
        let oracle = oracle().await;

        let reachable = oracle
            .is_container_reachable_from_scope(&container_in(16), Scope::Context(ContextId(15)))
            .await;

        assert!(!reachable);
    }

    #[tokio::test]
    async fn test_system_scope_sees_everything() {
        let oracle = oracle().await;
        assert!(oracle.is_container_reachable_from_scope(&container_in(16), Scope::System).await);
    }
}
