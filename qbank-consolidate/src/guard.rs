//! Protection guard
//!
//! Pure predicates consulted by the planner and the executor. A veto on a
//! mutation path is never an error: the subject is skipped, counted, and
//! reported in aggregate.

use crate::normalize::normalize;
use qbank_common::db::models::{Container, ContainerId, Item, ItemId, VersionStatus};
use serde::Serialize;
use std::fmt;

/// Why a subject is protected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ProtectionReason {
    /// Live version has external references
    Used { references: i64 },
    /// No other live instance of the signature would survive
    SoleInstance,
    /// Live version is hidden: retention, not staleness
    HiddenRetention,
    /// Container has no parent in its context
    StructuralRoot,
    /// Container name follows the default/system naming convention
    SystemContainer,
    /// Container carries a human-authored description
    Documented,
}

impl fmt::Display for ProtectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectionReason::Used { references } => write!(f, "used by {} reference(s)", references),
            ProtectionReason::SoleInstance => write!(f, "last live instance of its content"),
            ProtectionReason::HiddenRetention => write!(f, "hidden version kept for retention"),
            ProtectionReason::StructuralRoot => write!(f, "root container of its context"),
            ProtectionReason::SystemContainer => write!(f, "default/system container"),
            ProtectionReason::Documented => write!(f, "container has a description"),
        }
    }
}

/// Subject excluded from a mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Subject {
    Item { id: ItemId },
    Container { id: ContainerId },
}

/// A silent exclusion, kept for aggregate reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtectedSkip {
    pub subject: Subject,
    #[serde(flatten)]
    pub reason: ProtectionReason,
}

impl ProtectedSkip {
    pub fn item(id: ItemId, reason: ProtectionReason) -> Self {
        Self {
            subject: Subject::Item { id },
            reason,
        }
    }

    pub fn container(id: ContainerId, reason: ProtectionReason) -> Self {
        Self {
            subject: Subject::Container { id },
            reason,
        }
    }
}

/// Protection predicates
#[derive(Debug, Clone)]
pub struct ProtectionGuard {
    /// Normalized naming conventions; a trailing space marks a prefix,
    /// anything else must match the whole name
    default_patterns: Vec<String>,
}

impl ProtectionGuard {
    pub fn new<I, S>(default_patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let default_patterns = default_patterns
            .into_iter()
            .map(|pattern| {
                let raw = pattern.as_ref();
                let mut normalized = normalize(raw);
                if raw.ends_with(' ') && !normalized.is_empty() {
                    normalized.push(' ');
                }
                normalized
            })
            .filter(|pattern| !pattern.trim().is_empty())
            .collect();

        Self { default_patterns }
    }

    /// Veto deleting (merging away) an item
    ///
    /// `live_references` counts references on the live version;
    /// `surviving_instances` counts other live members of the same
    /// signature that stay after this deletion.
    pub fn item_deletion_veto(
        &self,
        item: &Item,
        live_references: i64,
        surviving_instances: usize,
    ) -> Option<ProtectionReason> {
        if live_references > 0 {
            return Some(ProtectionReason::Used {
                references: live_references,
            });
        }
        if surviving_instances == 0 {
            return Some(ProtectionReason::SoleInstance);
        }
        self.item_relocation_veto(item)
    }

    /// Veto moving an item to another container
    ///
    /// Relocation keeps every reference valid, so only a retention signal
    /// blocks it.
    pub fn item_relocation_veto(&self, item: &Item) -> Option<ProtectionReason> {
        if item.live.status == VersionStatus::Hidden {
            return Some(ProtectionReason::HiddenRetention);
        }
        None
    }

    /// Veto moving or deleting a container
    pub fn container_veto(&self, container: &Container) -> Option<ProtectionReason> {
        if container.parent_id.is_none() {
            return Some(ProtectionReason::StructuralRoot);
        }
        if self.is_system_name(&container.name) {
            return Some(ProtectionReason::SystemContainer);
        }
        if !container.info.trim().is_empty() {
            return Some(ProtectionReason::Documented);
        }
        None
    }

    /// True if the name follows the default/system container convention
    pub fn is_system_name(&self, name: &str) -> bool {
        let name = normalize(name);
        self.default_patterns.iter().any(|pattern| {
            if pattern.ends_with(' ') {
                name.starts_with(pattern.as_str())
            } else {
                name == *pattern
            }
        })
    }
}

impl Default for ProtectionGuard {
    fn default() -> Self {
        Self::new(["default for ", "top"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbank_common::db::models::{ContextId, ItemVersion, VersionId};

    fn item(status: VersionStatus) -> Item {
        Item {
            id: ItemId(1),
            container_id: ContainerId(10),
            type_tag: "mc".to_string(),
            live: ItemVersion {
                id: VersionId(100),
                number: 1,
                status,
                content: "2+2=4".to_string(),
            },
            version_ids: vec![VersionId(100)],
        }
    }

    fn container(name: &str, parent: Option<i64>, info: &str) -> Container {
        Container {
            id: ContainerId(10),
            context_id: ContextId(1),
            parent_id: parent.map(ContainerId),
            name: name.to_string(),
            info: info.to_string(),
        }
    }

    #[test]
    fn test_used_item_never_deletable() {
        let guard = ProtectionGuard::default();
        let veto = guard.item_deletion_veto(&item(VersionStatus::Ready), 2, 5);
        assert_eq!(veto, Some(ProtectionReason::Used { references: 2 }));
    }

    #[test]
    fn test_sole_instance_protected() {
        let guard = ProtectionGuard::default();
        let veto = guard.item_deletion_veto(&item(VersionStatus::Ready), 0, 0);
        assert_eq!(veto, Some(ProtectionReason::SoleInstance));
    }

    #[test]
    fn test_hidden_item_protected_from_deletion_and_move() {
        let guard = ProtectionGuard::default();
        let hidden = item(VersionStatus::Hidden);
        assert_eq!(
            guard.item_deletion_veto(&hidden, 0, 1),
            Some(ProtectionReason::HiddenRetention)
        );
        assert_eq!(guard.item_relocation_veto(&hidden), Some(ProtectionReason::HiddenRetention));
    }

    #[test]
    fn test_unused_duplicate_deletable() {
        let guard = ProtectionGuard::default();
        assert_eq!(guard.item_deletion_veto(&item(VersionStatus::Ready), 0, 1), None);
    }

    #[test]
    fn test_container_protection_rules() {
        let guard = ProtectionGuard::default();

        assert_eq!(
            guard.container_veto(&container("Anything", None, "")),
            Some(ProtectionReason::StructuralRoot)
        );
        assert_eq!(
            guard.container_veto(&container("Default for Course 101", Some(1), "")),
            Some(ProtectionReason::SystemContainer)
        );
        assert_eq!(
            guard.container_veto(&container(" TOP ", Some(1), "")),
            Some(ProtectionReason::SystemContainer)
        );
        assert_eq!(
            guard.container_veto(&container("Week 3", Some(1), "Quiz pool for week 3")),
            Some(ProtectionReason::Documented)
        );
        assert_eq!(guard.container_veto(&container("Week 3", Some(1), "  ")), None);
    }

    #[test]
    fn test_exact_pattern_is_not_a_prefix() {
        let guard = ProtectionGuard::default();
        assert!(!guard.is_system_name("Topology"));
        assert!(guard.is_system_name("Défault for Geography"));
    }
}
