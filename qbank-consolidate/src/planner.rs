//! Consolidation planner
//!
//! Turns a (source, target) pair into a validated, side-effect-free
//! [`Plan`]. Structural problems (missing or unreachable target, cycles,
//! cross-context container moves, depth overruns) refuse the whole plan
//! with [`Error::ValidationRejected`]. Protected candidates are dropped
//! from the plan and listed in [`Plan::skipped`].
//!
//! **Duplicate group rule:**
//! - Used members (live version referenced) are never touched
//! - Survivor: lowest-id used member; if none is used, the lowest-id
//!   unhidden member already in the target, else the lowest-id unhidden
//!   member, which is relocated into the target
//! - Every other unused, unprotected member is merged into the survivor:
//!   references on any of its versions are repointed to the survivor's
//!   live version, then it is deleted

use crate::classifier::{advise, Advice, Classifier};
use crate::detector::{signature, DuplicateGroup};
use crate::guard::{ProtectedSkip, ProtectionGuard, ProtectionReason, Subject};
use crate::hierarchy::descendants;
use crate::reachability::ReachabilityOracle;
use crate::store::{ContainerFilter, ItemFilter, Store};
use qbank_common::config::{ConsolidationConfig, MatchMode};
use qbank_common::db::models::{Container, ContainerId, Item, ItemId, Scope, VersionId};
use qbank_common::error::{RejectedCandidate, Rejection, RejectionReason};
use qbank_common::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, Instrument};

/// What a plan operates on
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PlanSource {
    /// One explicit item
    Item { id: ItemId },
    /// An explicit list of items (one bulk page)
    Items { ids: Vec<ItemId> },
    /// A duplicate group and its resolved target
    Group { group: DuplicateGroup },
    /// Every item directly inside a container, optionally removing the
    /// emptied container afterwards
    ContainerContents { container: ContainerId, delete_emptied: bool },
    /// Re-parent a container under the target
    ContainerMove { container: ContainerId },
}

impl PlanSource {
    fn rejected_candidate(&self) -> RejectedCandidate {
        match self {
            PlanSource::Item { id } => RejectedCandidate::Item { id: *id },
            PlanSource::Items { ids } => match ids.as_slice() {
                [single] => RejectedCandidate::Item { id: *single },
                _ => RejectedCandidate::Group {
                    type_tag: "*".to_string(),
                    members: ids.len(),
                },
            },
            PlanSource::Group { group } => RejectedCandidate::Group {
                type_tag: group.type_tag.clone(),
                members: group.total,
            },
            PlanSource::ContainerContents { container, .. }
            | PlanSource::ContainerMove { container } => RejectedCandidate::Container { id: *container },
        }
    }
}

/// One planned mutation, applied in plan order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlanOperation {
    RelocateItem {
        item: ItemId,
        from: ContainerId,
        to: ContainerId,
    },
    /// Repoint every reference on `superseded_versions` to
    /// `survivor_version`, then delete `superseded`
    MergeItem {
        superseded: ItemId,
        superseded_versions: Vec<VersionId>,
        survivor: ItemId,
        survivor_version: VersionId,
    },
    MoveContainer {
        container: ContainerId,
        new_parent: ContainerId,
    },
    /// Only valid once the container is empty; re-checked in the transaction
    DeleteContainer { container: ContainerId },
}

impl PlanOperation {
    pub fn is_container_operation(&self) -> bool {
        matches!(
            self,
            PlanOperation::MoveContainer { .. } | PlanOperation::DeleteContainer { .. }
        )
    }

    /// Item this operation primarily affects
    pub fn subject_item(&self) -> Option<ItemId> {
        match self {
            PlanOperation::RelocateItem { item, .. } => Some(*item),
            PlanOperation::MergeItem { superseded, .. } => Some(*superseded),
            _ => None,
        }
    }
}

/// References that will move from a superseded version to a survivor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceRepoint {
    pub from_version: VersionId,
    pub to_version: VersionId,
    /// References on `from_version` when the plan was built
    pub references: i64,
}

/// Validated, unapplied description of one consolidation
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub target_container: ContainerId,
    pub scope: Scope,
    pub operations: Vec<PlanOperation>,
    /// Items relocated or merged away
    pub source_items: Vec<ItemId>,
    pub reference_repoints: Vec<ReferenceRepoint>,
    pub skipped: Vec<ProtectedSkip>,
    /// Why nothing (or less than expected) is planned
    pub diagnostic: Option<String>,
    pub advice: Advice,
}

impl Plan {
    fn empty(target: ContainerId, scope: Scope) -> Self {
        Self {
            target_container: target,
            scope,
            operations: Vec::new(),
            source_items: Vec::new(),
            reference_repoints: Vec::new(),
            skipped: Vec::new(),
            diagnostic: None,
            advice: Advice::NotConfigured,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }
}

pub struct ConsolidationPlanner {
    store: Arc<dyn Store>,
    oracle: Arc<dyn ReachabilityOracle>,
    guard: ProtectionGuard,
    classifier: Option<Arc<dyn Classifier>>,
    match_mode: MatchMode,
    max_depth: usize,
}

impl ConsolidationPlanner {
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<dyn ReachabilityOracle>,
        guard: ProtectionGuard,
        match_mode: MatchMode,
        max_depth: usize,
    ) -> Self {
        Self {
            store,
            oracle,
            guard,
            classifier: None,
            match_mode,
            max_depth,
        }
    }

    pub fn from_config(
        store: Arc<dyn Store>,
        oracle: Arc<dyn ReachabilityOracle>,
        config: &ConsolidationConfig,
    ) -> Self {
        Self::new(
            store,
            oracle,
            ProtectionGuard::new(&config.default_container_patterns),
            config.match_mode,
            config.max_tree_depth,
        )
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn guard(&self) -> &ProtectionGuard {
        &self.guard
    }

    /// Build a plan moving or merging `source` into `target`, as seen from `scope`
    pub async fn plan(&self, source: &PlanSource, target: ContainerId, scope: Scope) -> Result<Plan> {
        let span = tracing::info_span!("planner", target = %target, scope = %scope);
        async move {
            let reject = |reason: RejectionReason| {
                let rejection = Rejection {
                    candidate: source.rejected_candidate(),
                    target,
                    scope,
                    reason,
                };
                tracing::warn!(%rejection, "Plan rejected");
                Error::ValidationRejected(rejection)
            };

            let Some(target_container) = self.store.get_container(target).await? else {
                return Err(reject(RejectionReason::TargetMissing));
            };
            if !self
                .oracle
                .is_container_reachable_from_scope(&target_container, scope)
                .await
            {
                return Err(reject(RejectionReason::Unreachable));
            }

            let mut plan = match source {
                PlanSource::Item { id } => {
                    self.plan_items(&[*id], &target_container, scope, true, &reject).await?
                }
                PlanSource::Items { ids } => {
                    self.plan_items(ids, &target_container, scope, false, &reject).await?
                }
                PlanSource::Group { group } => self.plan_group(group, &target_container, scope).await?,
                PlanSource::ContainerContents {
                    container,
                    delete_emptied,
                } => {
                    self.plan_contents(*container, *delete_emptied, &target_container, scope, &reject)
                        .await?
                }
                PlanSource::ContainerMove { container } => {
                    self.plan_container_move(*container, &target_container, scope, &reject)
                        .await?
                }
            };

            plan.advice = self.advice_for(&plan, &target_container).await;

            info!(
                operations = plan.operations.len(),
                skipped = plan.skipped.len(),
                repoints = plan.reference_repoints.len(),
                diagnostic = plan.diagnostic.as_deref().unwrap_or(""),
                "Plan built"
            );
            Ok(plan)
        }
        .instrument(span)
        .await
    }

    async fn plan_items(
        &self,
        ids: &[ItemId],
        target: &Container,
        scope: Scope,
        strict: bool,
        reject: &(dyn Fn(RejectionReason) -> Error + Sync),
    ) -> Result<Plan> {
        let items = self.store.find_items(&ItemFilter::by_ids(ids.to_vec())).await?;
        if items.is_empty() || (strict && items.len() != ids.len()) {
            return Err(reject(RejectionReason::SourceMissing));
        }

        let mut plan = Plan::empty(target.id, scope);
        for item in &items {
            self.push_relocation(&mut plan, item, target.id);
        }

        if plan.is_empty() && plan.skipped.is_empty() {
            plan = plan.with_diagnostic("every item is already in the target container");
        } else if plan.is_empty() {
            plan = plan.with_diagnostic("every candidate is protected");
        }
        Ok(plan)
    }

    fn push_relocation(&self, plan: &mut Plan, item: &Item, target: ContainerId) {
        if item.container_id == target {
            return;
        }
        if let Some(reason) = self.guard.item_relocation_veto(item) {
            debug!(item_id = %item.id, %reason, "Relocation vetoed");
            plan.skipped.push(ProtectedSkip::item(item.id, reason));
            return;
        }
        plan.operations.push(PlanOperation::RelocateItem {
            item: item.id,
            from: item.container_id,
            to: target,
        });
        plan.source_items.push(item.id);
    }

    async fn plan_group(&self, group: &DuplicateGroup, target: &Container, scope: Scope) -> Result<Plan> {
        let mut plan = Plan::empty(target.id, scope);

        // Re-read members: the group may be stale by the time it is planned
        let current = self
            .store
            .find_items(&ItemFilter::by_ids(group.member_ids()))
            .await?;
        let mut members: Vec<(Item, i64)> = Vec::with_capacity(current.len());
        for item in current {
            if signature(self.match_mode, &item.type_tag, &item.live.content) != group.signature {
                debug!(item_id = %item.id, "Content changed since detection; excluded");
                continue;
            }
            let references = self.store.count_external_references(item.live.id).await?;
            members.push((item, references));
        }

        if members.len() < 2 {
            return Ok(plan.with_diagnostic("group no longer has duplicates"));
        }

        let survivor_index = members
            .iter()
            .position(|(_, refs)| *refs > 0)
            .or_else(|| {
                members.iter().position(|(item, _)| {
                    item.container_id == target.id && self.guard.item_relocation_veto(item).is_none()
                })
            })
            .or_else(|| {
                members
                    .iter()
                    .position(|(item, _)| self.guard.item_relocation_veto(item).is_none())
            });

        let Some(survivor_index) = survivor_index else {
            for (item, _) in &members {
                plan.skipped
                    .push(ProtectedSkip::item(item.id, ProtectionReason::HiddenRetention));
            }
            return Ok(plan.with_diagnostic("every member is hidden"));
        };

        let (survivor, survivor_refs) = &members[survivor_index];
        if *survivor_refs == 0 {
            self.push_relocation(&mut plan, survivor, target.id);
        }

        for (index, (item, references)) in members.iter().enumerate() {
            if index == survivor_index {
                continue;
            }
            // One survivor always remains
            if let Some(reason) = self.guard.item_deletion_veto(item, *references, 1) {
                debug!(item_id = %item.id, %reason, "Merge vetoed");
                plan.skipped.push(ProtectedSkip::item(item.id, reason));
                continue;
            }

            for version in &item.version_ids {
                let on_version = self.store.count_external_references(*version).await?;
                if on_version > 0 {
                    plan.reference_repoints.push(ReferenceRepoint {
                        from_version: *version,
                        to_version: survivor.live.id,
                        references: on_version,
                    });
                }
            }
            plan.operations.push(PlanOperation::MergeItem {
                superseded: item.id,
                superseded_versions: item.version_ids.clone(),
                survivor: survivor.id,
                survivor_version: survivor.live.id,
            });
            plan.source_items.push(item.id);
        }

        if plan.is_empty() {
            plan = plan.with_diagnostic("no unused, unprotected duplicate to merge");
        }
        Ok(plan)
    }

    async fn plan_contents(
        &self,
        source: ContainerId,
        delete_emptied: bool,
        target: &Container,
        scope: Scope,
        reject: &(dyn Fn(RejectionReason) -> Error + Sync),
    ) -> Result<Plan> {
        let Some(source_container) = self.store.get_container(source).await? else {
            return Err(reject(RejectionReason::SourceMissing));
        };
        let mut plan = Plan::empty(target.id, scope);
        if source == target.id {
            return Ok(plan.with_diagnostic("source and target are the same container"));
        }

        let items = self.store.find_items(&ItemFilter::in_container(source)).await?;
        for item in &items {
            self.push_relocation(&mut plan, item, target.id);
        }

        if delete_emptied {
            let children = self
                .store
                .find_containers(&ContainerFilter {
                    limit: Some(1),
                    ..ContainerFilter::children_of(source)
                })
                .await?;
            if let Some(reason) = self.guard.container_veto(&source_container) {
                plan.skipped.push(ProtectedSkip::container(source, reason));
            } else if !children.is_empty() {
                plan.diagnostic = Some("source keeps its child containers; not deleted".to_string());
            } else if plan.skipped.iter().any(|s| matches!(s.subject, Subject::Item { .. })) {
                plan.diagnostic = Some("protected items stay in the source; not deleted".to_string());
            } else {
                plan.operations.push(PlanOperation::DeleteContainer { container: source });
            }
        }

        if plan.is_empty() && plan.diagnostic.is_none() {
            plan = plan.with_diagnostic(if items.is_empty() {
                "source container holds no items"
            } else {
                "every candidate is protected"
            });
        }
        Ok(plan)
    }

    async fn plan_container_move(
        &self,
        source: ContainerId,
        target: &Container,
        scope: Scope,
        reject: &(dyn Fn(RejectionReason) -> Error + Sync),
    ) -> Result<Plan> {
        let Some(moving) = self.store.get_container(source).await? else {
            return Err(reject(RejectionReason::SourceMissing));
        };

        if moving.context_id != target.context_id {
            return Err(reject(RejectionReason::CrossContext {
                from: moving.context_id,
                to: target.context_id,
            }));
        }

        if moving.id == target.id {
            return Err(reject(RejectionReason::Cycle));
        }
        match descendants(self.store.as_ref(), moving.id, self.max_depth).await {
            Ok(closure) if closure.contains(&target.id) => {
                return Err(reject(RejectionReason::Cycle));
            }
            Ok(_) => {}
            Err(Error::StructuralInconsistency(msg)) => {
                tracing::warn!(container_id = %moving.id, reason = %msg, "Descendant walk aborted");
                return Err(reject(RejectionReason::DepthExceeded {
                    limit: self.max_depth,
                }));
            }
            Err(e) => return Err(e),
        }

        let mut plan = Plan::empty(target.id, scope);
        if moving.parent_id == Some(target.id) {
            return Ok(plan.with_diagnostic("container is already a child of the target"));
        }
        if let Some(reason) = self.guard.container_veto(&moving) {
            plan.skipped.push(ProtectedSkip::container(moving.id, reason));
            return Ok(plan.with_diagnostic("container is protected"));
        }

        plan.operations.push(PlanOperation::MoveContainer {
            container: moving.id,
            new_parent: target.id,
        });
        Ok(plan)
    }

    /// Classifier opinion on the first planned item; never alters the plan
    async fn advice_for(&self, plan: &Plan, target: &Container) -> Advice {
        let Some(classifier) = self.classifier.as_deref() else {
            return Advice::NotConfigured;
        };
        let Some(first) = plan.source_items.first() else {
            return Advice::NotConfigured;
        };

        let item = match self.store.get_item(*first).await {
            Ok(Some(item)) => item,
            _ => return Advice::NotConfigured,
        };
        let label = match self.store.get_container(item.container_id).await {
            Ok(Some(container)) => container.name,
            _ => String::new(),
        };

        advise(Some(classifier), &label, &item.live.content, &target.name).await
    }
}
