//! Bounded walks over the container hierarchy
//!
//! Parent/child links are supposed to form a finite acyclic tree per
//! context. Walks here never trust that: depth is capped and revisits are
//! detected, and both are reported as structural inconsistencies.

use crate::store::{ContainerFilter, Store};
use qbank_common::db::models::ContainerId;
use qbank_common::{Error, Result};
use std::collections::HashSet;

/// Every descendant of `root` (excluding `root`), breadth-first
pub async fn descendants(
    store: &dyn Store,
    root: ContainerId,
    max_depth: usize,
) -> Result<Vec<ContainerId>> {
    let mut found = Vec::new();
    let mut seen: HashSet<ContainerId> = HashSet::from([root]);
    let mut frontier = vec![root];
    let mut depth = 0;

    while !frontier.is_empty() {
        let children = store.find_containers(&parents_filter(&frontier)).await?;

        if children.is_empty() {
            break;
        }

        depth += 1;
        if depth > max_depth {
            return Err(Error::StructuralInconsistency(format!(
                "container {} has descendants deeper than {} levels",
                root, max_depth
            )));
        }

        frontier = Vec::with_capacity(children.len());
        for child in children {
            if !seen.insert(child.id) {
                return Err(Error::StructuralInconsistency(format!(
                    "container {} reached twice below {}",
                    child.id, root
                )));
            }
            found.push(child.id);
            frontier.push(child.id);
        }
    }

    Ok(found)
}

/// Filter selecting the direct children of any container in `parents`
fn parents_filter(parents: &[ContainerId]) -> ContainerFilter {
    ContainerFilter {
        parent_ids: Some(parents.to_vec()),
        ..Default::default()
    }
}

/// Ancestor chain of `start` (nearest first), excluding `start`
pub async fn ancestors(
    store: &dyn Store,
    start: ContainerId,
    max_depth: usize,
) -> Result<Vec<ContainerId>> {
    let mut chain = Vec::new();
    let mut seen: HashSet<ContainerId> = HashSet::from([start]);
    let mut current = store.get_container(start).await?;

    while let Some(container) = current {
        let Some(parent) = container.parent_id else {
            break;
        };
        if !seen.insert(parent) {
            return Err(Error::StructuralInconsistency(format!(
                "parent loop through container {}",
                parent
            )));
        }
        if chain.len() >= max_depth {
            return Err(Error::StructuralInconsistency(format!(
                "container {} is deeper than {} levels",
                start, max_depth
            )));
        }
        chain.push(parent);
        current = store.get_container(parent).await?;
    }

    Ok(chain)
}
