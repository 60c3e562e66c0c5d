//! Read-only bank reports
//!
//! Protection is advisory here: reports list what the guard would say,
//! they never act on it.

use crate::guard::ProtectionGuard;
use crate::store::{ContainerFilter, ContextFilter, ItemFilter, Store};
use qbank_common::db::models::{ContainerId, ContextId, ItemId, VersionStatus};
use qbank_common::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Whole-bank counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BankOverview {
    pub contexts: usize,
    pub containers: usize,
    pub items: usize,
    /// Items whose live version has at least one reference
    pub referenced_items: usize,
    pub hidden_items: usize,
}

/// Items held directly by one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerCount {
    pub container: ContainerId,
    pub context: ContextId,
    pub name: String,
    pub items: usize,
}

/// Container with no items and no children that the guard would let go
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmptyContainer {
    pub container: ContainerId,
    pub context: ContextId,
    pub name: String,
}

pub struct Reporter {
    store: Arc<dyn Store>,
    guard: ProtectionGuard,
    page_size: usize,
}

impl Reporter {
    pub fn new(store: Arc<dyn Store>, guard: ProtectionGuard, page_size: usize) -> Self {
        Self {
            store,
            guard,
            page_size: page_size.max(1),
        }
    }

    pub async fn overview(&self) -> Result<BankOverview> {
        let contexts = self.store.find_contexts(&ContextFilter::default()).await?.len();
        let containers = self.store.find_containers(&ContainerFilter::default()).await?.len();

        let mut overview = BankOverview {
            contexts,
            containers,
            ..Default::default()
        };

        let mut cursor: Option<ItemId> = None;
        loop {
            let page = self
                .store
                .find_items(&ItemFilter {
                    after_id: cursor,
                    limit: Some(self.page_size),
                    ..Default::default()
                })
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.id);

            for item in &page {
                overview.items += 1;
                if item.live.status == VersionStatus::Hidden {
                    overview.hidden_items += 1;
                }
                if self.store.count_external_references(item.live.id).await? > 0 {
                    overview.referenced_items += 1;
                }
            }

            if page.len() < self.page_size {
                break;
            }
        }

        tracing::debug!(?overview, "Bank overview computed");
        Ok(overview)
    }

    /// Item count of every container, largest first
    pub async fn container_item_counts(&self) -> Result<Vec<ContainerCount>> {
        let containers = self.store.find_containers(&ContainerFilter::default()).await?;
        let mut counts = Vec::with_capacity(containers.len());
        for container in containers {
            let items = self.store.count_items(container.id).await?;
            counts.push(ContainerCount {
                container: container.id,
                context: container.context_id,
                name: container.name,
                items: items as usize,
            });
        }
        counts.sort_by(|a, b| b.items.cmp(&a.items).then(a.container.cmp(&b.container)));
        Ok(counts)
    }

    /// Empty, childless, unprotected containers
    pub async fn empty_containers(&self) -> Result<Vec<EmptyContainer>> {
        let containers = self.store.find_containers(&ContainerFilter::default()).await?;
        let parents: HashSet<ContainerId> = containers.iter().filter_map(|c| c.parent_id).collect();

        let mut empty = Vec::new();
        for container in containers {
            if parents.contains(&container.id) || self.guard.container_veto(&container).is_some() {
                continue;
            }
            if self.store.count_items(container.id).await? == 0 {
                empty.push(EmptyContainer {
                    container: container.id,
                    context: container.context_id,
                    name: container.name,
                });
            }
        }
        Ok(empty)
    }

    /// Number of containers per context
    pub async fn containers_per_context(&self) -> Result<HashMap<ContextId, usize>> {
        let mut per_context: HashMap<ContextId, usize> = HashMap::new();
        for container in self.store.find_containers(&ContainerFilter::default()).await? {
            *per_context.entry(container.context_id).or_default() += 1;
        }
        Ok(per_context)
    }
}
