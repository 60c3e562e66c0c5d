//! Structure scoring of resolver candidates
//!
//! score = direct children + ANCHOR_BONUS (if a direct child carries the
//! anchor label) + subtree size.

use crate::hierarchy::descendants;
use crate::normalize::normalize;
use crate::store::{ContainerFilter, Store};
use qbank_common::db::models::Container;
use qbank_common::{Error, Result};
use serde::Serialize;

/// Added when a direct child carries the anchor label
pub const ANCHOR_BONUS: i64 = 5000;

/// Score breakdown of one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct StructureScore {
    pub children: usize,
    pub has_direct_anchor: bool,
    /// Descendant count; zero when the walk hit the depth guard
    pub subtree: usize,
    pub total: i64,
}

impl StructureScore {
    fn new(children: usize, has_direct_anchor: bool, subtree: usize) -> Self {
        let bonus = if has_direct_anchor { ANCHOR_BONUS } else { 0 };
        Self {
            children,
            has_direct_anchor,
            subtree,
            total: children as i64 + bonus + subtree as i64,
        }
    }
}

/// Score a candidate from its live structure
///
/// Fails only when the children lookup fails; the caller turns that into
/// a zero score. A subtree walk that trips the depth guard contributes
/// nothing and is logged.
pub async fn score_candidate(
    store: &dyn Store,
    candidate: &Container,
    anchor_label: Option<&str>,
    max_depth: usize,
) -> Result<StructureScore> {
    let children = store
        .find_containers(&ContainerFilter::children_of(candidate.id))
        .await?;

    let has_direct_anchor = match anchor_label.map(normalize) {
        Some(anchor) if !anchor.is_empty() => {
            children.iter().any(|child| normalize(&child.name) == anchor)
        }
        _ => false,
    };

    let subtree = match descendants(store, candidate.id, max_depth).await {
        Ok(found) => found.len(),
        Err(Error::StructuralInconsistency(msg)) => {
            tracing::warn!(
                container_id = %candidate.id,
                reason = %msg,
                "Subtree walk aborted; scoring without subtree size"
            );
            0
        }
        Err(e) => return Err(e),
    };

    Ok(StructureScore::new(children.len(), has_direct_anchor, subtree))
}
