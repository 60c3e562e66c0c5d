//! Override strategies
//!
//! An override short-circuits score-based resolution with a container
//! confirmed out-of-band. Overrides are pluggable; the resolver still
//! computes the score-based winner and flags any disagreement.

use crate::store::{ContainerFilter, Store};
use async_trait::async_trait;
use qbank_common::db::models::{Container, ContainerId};
use qbank_common::Result;

#[async_trait]
pub trait OverrideStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// The overriding container, or `None` when the override does not apply
    async fn resolve(&self, store: &dyn Store) -> Result<Option<Container>>;
}

/// Anchor record known by stable identity: its parent is the canonical
/// container, provided the parent really has the anchor as a direct child
pub struct AnchorRecordOverride {
    anchor: ContainerId,
}

impl AnchorRecordOverride {
    pub fn new(anchor: ContainerId) -> Self {
        Self { anchor }
    }
}

#[async_trait]
impl OverrideStrategy for AnchorRecordOverride {
    fn name(&self) -> &'static str {
        "anchor_record"
    }

    async fn resolve(&self, store: &dyn Store) -> Result<Option<Container>> {
        let Some(anchor) = store.get_container(self.anchor).await? else {
            tracing::warn!(anchor_id = %self.anchor, "Anchor record no longer exists");
            return Ok(None);
        };

        let Some(parent_id) = anchor.parent_id else {
            tracing::warn!(anchor_id = %self.anchor, "Anchor record is a root; no parent to return");
            return Ok(None);
        };

        let Some(parent) = store.get_container(parent_id).await? else {
            tracing::warn!(anchor_id = %self.anchor, parent_id = %parent_id, "Anchor parent missing");
            return Ok(None);
        };

        // Strict validation: the parent's own child listing must contain the anchor
        let children = store
            .find_containers(&ContainerFilter::children_of(parent.id))
            .await?;
        if !children.iter().any(|child| child.id == anchor.id) {
            tracing::warn!(
                anchor_id = %self.anchor,
                parent_id = %parent.id,
                "Anchor is not a direct child of its recorded parent"
            );
            return Ok(None);
        }

        if parent.context_id != anchor.context_id {
            tracing::warn!(anchor_id = %self.anchor, "Anchor and parent live in different contexts");
            return Ok(None);
        }

        Ok(Some(parent))
    }
}
