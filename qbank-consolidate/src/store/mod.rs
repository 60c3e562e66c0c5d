//! Store seam
//!
//! The consolidation core reads and mutates the content bank only through
//! [`Store`]. Filters are structured criteria rather than query strings so
//! the core stays independent of the backing database.

use async_trait::async_trait;
use qbank_common::db::models::{
    Container, ContainerId, Context, ContextId, ContextLevel, Item, ItemId, VersionId,
};
use qbank_common::Result;
use serde::Serialize;

pub mod retry;
pub mod sqlite;
pub mod transaction;

pub use sqlite::SqliteStore;

/// Criteria for [`Store::find_contexts`]
#[derive(Debug, Clone, Default)]
pub struct ContextFilter {
    pub ids: Option<Vec<ContextId>>,
    pub levels: Option<Vec<ContextLevel>>,
}

/// Parent constraint for container lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentFilter {
    /// Structural roots (no parent)
    Root,
    /// Direct children of one container
    Of(ContainerId),
}

/// Criteria for [`Store::find_containers`]; results ordered by id
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    pub ids: Option<Vec<ContainerId>>,
    pub context_ids: Option<Vec<ContextId>>,
    pub context_levels: Option<Vec<ContextLevel>>,
    pub parent: Option<ParentFilter>,
    /// Direct children of any of these containers
    pub parent_ids: Option<Vec<ContainerId>>,
    pub limit: Option<usize>,
}

impl ContainerFilter {
    pub fn by_id(id: ContainerId) -> Self {
        Self {
            ids: Some(vec![id]),
            ..Default::default()
        }
    }

    pub fn children_of(id: ContainerId) -> Self {
        Self {
            parent: Some(ParentFilter::Of(id)),
            ..Default::default()
        }
    }
}

/// Criteria for [`Store::find_items`]; results ordered by id
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub ids: Option<Vec<ItemId>>,
    pub container_ids: Option<Vec<ContainerId>>,
    pub exclude_ids: Vec<ItemId>,
    /// Keyset cursor: only items with a greater id
    pub after_id: Option<ItemId>,
    pub limit: Option<usize>,
}

impl ItemFilter {
    pub fn by_ids(ids: Vec<ItemId>) -> Self {
        Self {
            ids: Some(ids),
            ..Default::default()
        }
    }

    pub fn in_container(id: ContainerId) -> Self {
        Self {
            container_ids: Some(vec![id]),
            ..Default::default()
        }
    }
}

/// One store mutation; a transaction applies a slice of these in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    RelocateItem { item: ItemId, to: ContainerId },
    RepointReferences { from: VersionId, to: VersionId },
    /// Fails if any reference still points at one of the item's versions
    DeleteItem { item: ItemId },
    MoveContainer { container: ContainerId, new_parent: ContainerId },
    /// Fails if the container still holds items or child containers
    DeleteContainer { container: ContainerId },
}

impl Mutation {
    pub fn is_container_mutation(&self) -> bool {
        matches!(
            self,
            Mutation::MoveContainer { .. } | Mutation::DeleteContainer { .. }
        )
    }
}

/// Backing store of the content bank
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_contexts(&self, filter: &ContextFilter) -> Result<Vec<Context>>;

    async fn find_containers(&self, filter: &ContainerFilter) -> Result<Vec<Container>>;

    async fn find_items(&self, filter: &ItemFilter) -> Result<Vec<Item>>;

    /// Number of external references pointing at one item version
    async fn count_external_references(&self, version: VersionId) -> Result<i64>;

    /// Apply every mutation atomically: all commit or none do
    async fn run_in_transaction(&self, mutations: &[Mutation]) -> Result<()>;

    /// Number of items directly inside a container
    async fn count_items(&self, container: ContainerId) -> Result<i64> {
        Ok(self.find_items(&ItemFilter::in_container(container)).await?.len() as i64)
    }

    async fn get_container(&self, id: ContainerId) -> Result<Option<Container>> {
        Ok(self
            .find_containers(&ContainerFilter::by_id(id))
            .await?
            .into_iter()
            .next())
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<Item>> {
        Ok(self
            .find_items(&ItemFilter::by_ids(vec![id]))
            .await?
            .into_iter()
            .next())
    }

    async fn get_context(&self, id: ContextId) -> Result<Option<Context>> {
        let filter = ContextFilter {
            ids: Some(vec![id]),
            ..Default::default()
        };
        Ok(self.find_contexts(&filter).await?.into_iter().next())
    }
}
