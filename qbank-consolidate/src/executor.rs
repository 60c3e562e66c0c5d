//! Consolidation executor
//!
//! Applies a [`Plan`] in bounded batches. Each batch is one store
//! transaction: every mutation commits or none does. A rolled-back batch
//! is reported and the run moves on to the next batch unless the caller
//! asked to stop on the first error.
//!
//! Batch lifecycle: `Pending -> Applying -> Committed | RolledBack`.
//!
//! Candidates are re-validated against live data when their batch starts,
//! so a plan that went stale (an item became used, a container gained a
//! description) degrades to protected skips instead of damage.

use crate::detector::signature_digest;
use crate::guard::{ProtectedSkip, ProtectionGuard, ProtectionReason};
use crate::planner::{Plan, PlanOperation};
use crate::store::{ContainerFilter, ItemFilter, Mutation, Store};
use chrono::{DateTime, Utc};
use qbank_common::config::{ConsolidationConfig, MatchMode};
use qbank_common::db::models::{ContainerId, Item, ItemId};
use qbank_common::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Caller choices for one execution
#[derive(Debug, Clone, Copy)]
pub struct ExecuteOptions {
    /// Requested operations per batch; clamped by the configured caps
    pub batch_size: usize,
    pub stop_on_first_error: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            stop_on_first_error: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Applying,
    Committed,
    RolledBack,
}

/// Outcome of one batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// 1-based
    pub index: usize,
    pub state: BatchState,
    pub operations: usize,
    pub applied: usize,
    pub skipped: usize,
    pub error: Option<String>,
}

/// Aggregate result of an execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Human-readable failures, capped
    pub errors: Vec<String>,
    /// Failures beyond the cap, counted but not listed
    pub errors_omitted: usize,
    pub protected: Vec<ProtectedSkip>,
    /// Items whose operations failed (for exclusion by bulk loops)
    pub failed_items: Vec<ItemId>,
    /// Operations never attempted after stop-on-first-error
    pub not_attempted: usize,
    pub batches: Vec<BatchReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip)]
    error_cap: usize,
}

impl ExecutionSummary {
    pub fn new(error_cap: usize) -> Self {
        let now = Utc::now();
        Self {
            success: 0,
            failed: 0,
            skipped: 0,
            errors: Vec::new(),
            errors_omitted: 0,
            protected: Vec::new(),
            failed_items: Vec::new(),
            not_attempted: 0,
            batches: Vec::new(),
            started_at: now,
            finished_at: now,
            error_cap,
        }
    }

    pub(crate) fn record_error(&mut self, message: String) {
        if self.errors.len() < self.error_cap {
            self.errors.push(message);
        } else {
            self.errors_omitted += 1;
        }
    }

    fn record_skip(&mut self, skip: ProtectedSkip) {
        self.skipped += 1;
        self.protected.push(skip);
    }

    /// Fold a later summary into this one (bulk loops)
    pub fn absorb(&mut self, other: ExecutionSummary) {
        self.success += other.success;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.not_attempted += other.not_attempted;
        for message in other.errors {
            self.record_error(message);
        }
        self.errors_omitted += other.errors_omitted;
        self.protected.extend(other.protected);
        self.failed_items.extend(other.failed_items);
        let offset = self.batches.len();
        self.batches.extend(other.batches.into_iter().map(|mut batch| {
            batch.index += offset;
            batch
        }));
        self.finished_at = other.finished_at;
    }
}

pub struct ConsolidationExecutor {
    store: Arc<dyn Store>,
    guard: ProtectionGuard,
    /// Must match the detector's mode for apply-time signature checks
    match_mode: MatchMode,
    max_item_batch: usize,
    max_container_batch: usize,
    error_cap: usize,
}

impl ConsolidationExecutor {
    pub fn new(store: Arc<dyn Store>, guard: ProtectionGuard) -> Self {
        Self {
            store,
            guard,
            match_mode: MatchMode::Strict,
            max_item_batch: 500,
            max_container_batch: 100,
            error_cap: 20,
        }
    }

    pub fn from_config(store: Arc<dyn Store>, config: &ConsolidationConfig) -> Self {
        Self {
            store,
            guard: ProtectionGuard::new(&config.default_container_patterns),
            match_mode: config.match_mode,
            max_item_batch: config.max_item_batch.max(1),
            max_container_batch: config.max_container_batch.max(1),
            error_cap: config.error_cap,
        }
    }

    pub fn with_match_mode(mut self, match_mode: MatchMode) -> Self {
        self.match_mode = match_mode;
        self
    }

    /// Apply `plan`; failures are captured in the summary, never returned
    pub async fn execute(&self, plan: &Plan, options: ExecuteOptions) -> ExecutionSummary {
        let span = tracing::info_span!(
            "executor",
            target = %plan.target_container,
            operations = plan.operations.len()
        );
        self.execute_inner(plan, options).instrument(span).await
    }

    async fn execute_inner(&self, plan: &Plan, options: ExecuteOptions) -> ExecutionSummary {
        let mut summary = ExecutionSummary::new(self.error_cap);
        for skip in &plan.skipped {
            summary.record_skip(skip.clone());
        }
        let batches = self.split(&plan.operations, options.batch_size);
        let total_batches = batches.len();

        for (position, batch) in batches.iter().enumerate() {
            let index = position + 1;
            let report = self.run_batch(index, batch, &mut summary).await;
            let rolled_back = report.state == BatchState::RolledBack;
            summary.batches.push(report);

            if rolled_back && options.stop_on_first_error {
                let remaining: usize = batches[index..].iter().map(|b| b.len()).sum();
                summary.not_attempted = remaining;
                warn!(batch = index, remaining, "Stopping after failed batch");
                break;
            }
        }

        summary.finished_at = Utc::now();
        info!(
            success = summary.success,
            failed = summary.failed,
            skipped = summary.skipped,
            batches = total_batches,
            "Plan execution finished"
        );
        summary
    }

    /// Group operations in plan order under both per-batch caps
    fn split<'p>(&self, operations: &'p [PlanOperation], batch_size: usize) -> Vec<&'p [PlanOperation]> {
        let batch_size = batch_size.max(1);
        let item_cap = batch_size.min(self.max_item_batch);
        let container_cap = batch_size.min(self.max_container_batch);

        let mut batches = Vec::new();
        let mut start = 0;
        let mut items = 0;
        let mut containers = 0;

        for (index, operation) in operations.iter().enumerate() {
            if operation.is_container_operation() {
                containers += 1;
            } else {
                items += 1;
            }
            if items == item_cap || containers == container_cap {
                batches.push(&operations[start..=index]);
                start = index + 1;
                items = 0;
                containers = 0;
            }
        }
        if start < operations.len() {
            batches.push(&operations[start..]);
        }
        batches
    }

    async fn run_batch(
        &self,
        index: usize,
        operations: &[PlanOperation],
        summary: &mut ExecutionSummary,
    ) -> BatchReport {
        let mut report = BatchReport {
            index,
            state: BatchState::Pending,
            operations: operations.len(),
            applied: 0,
            skipped: 0,
            error: None,
        };
        debug!(batch = index, operations = operations.len(), "Batch pending");

        report.state = BatchState::Applying;
        let prepared = match self.prepare(operations).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.fail_batch(&mut report, operations, summary, e.to_string());
                return report;
            }
        };

        for skip in prepared.skips {
            report.skipped += 1;
            summary.record_skip(skip);
        }
        for (item, reason) in prepared.vanished {
            summary.failed += 1;
            summary.failed_items.extend(item);
            summary.record_error(format!("batch {}: {}", index, reason));
        }

        if prepared.mutations.is_empty() {
            report.state = BatchState::Committed;
            return report;
        }

        match self.store.run_in_transaction(&prepared.mutations).await {
            Ok(()) => {
                report.state = BatchState::Committed;
                report.applied = prepared.applied.len();
                summary.success += prepared.applied.len();
                info!(batch = index, applied = report.applied, skipped = report.skipped, "Batch committed");
            }
            Err(e) => {
                report.state = BatchState::RolledBack;
                let message = format!("batch {}: {}", index, e);
                warn!(batch = index, error = %e, "Batch rolled back");
                summary.failed += prepared.applied.len();
                summary
                    .failed_items
                    .extend(prepared.applied.iter().filter_map(|op| op.subject_item()));
                summary.record_error(message.clone());
                report.error = Some(message);
            }
        }
        report
    }

    fn fail_batch(
        &self,
        report: &mut BatchReport,
        operations: &[PlanOperation],
        summary: &mut ExecutionSummary,
        error: String,
    ) {
        let message = format!("batch {}: {}", report.index, error);
        warn!(batch = report.index, %error, "Batch validation failed");
        report.state = BatchState::RolledBack;
        report.error = Some(message.clone());
        summary.failed += operations.len();
        summary
            .failed_items
            .extend(operations.iter().filter_map(|op| op.subject_item()));
        summary.record_error(message);
    }

    /// Re-validate a batch against live data and translate it into mutations
    async fn prepare(&self, operations: &[PlanOperation]) -> Result<PreparedBatch> {
        let mut item_ids: Vec<ItemId> = Vec::new();
        let mut container_ids: Vec<ContainerId> = Vec::new();
        for operation in operations {
            match operation {
                PlanOperation::RelocateItem { item, .. } => item_ids.push(*item),
                PlanOperation::MergeItem {
                    superseded, survivor, ..
                } => {
                    item_ids.push(*superseded);
                    item_ids.push(*survivor);
                }
                PlanOperation::MoveContainer { container, .. }
                | PlanOperation::DeleteContainer { container } => container_ids.push(*container),
            }
        }

        let items: HashMap<ItemId, Item> = self
            .store
            .find_items(&ItemFilter::by_ids(item_ids))
            .await?
            .into_iter()
            .map(|item| (item.id, item))
            .collect();
        let containers: HashMap<_, _> = self
            .store
            .find_containers(&ContainerFilter {
                ids: Some(container_ids),
                ..Default::default()
            })
            .await?
            .into_iter()
            .map(|container| (container.id, container))
            .collect();

        let mut prepared = PreparedBatch::default();

        for operation in operations {
            match operation {
                PlanOperation::RelocateItem { item, to, .. } => {
                    let Some(current) = items.get(item) else {
                        prepared
                            .vanished
                            .push((Some(*item), format!("item {} no longer exists", item)));
                        continue;
                    };
                    if let Some(reason) = self.guard.item_relocation_veto(current) {
                        prepared.skips.push(ProtectedSkip::item(*item, reason));
                        continue;
                    }
                    prepared.mutations.push(Mutation::RelocateItem { item: *item, to: *to });
                    prepared.applied.push(operation.clone());
                }
                PlanOperation::MergeItem {
                    superseded,
                    superseded_versions,
                    survivor,
                    ..
                } => {
                    let Some(current) = items.get(superseded) else {
                        prepared
                            .vanished
                            .push((Some(*superseded), format!("item {} no longer exists", superseded)));
                        continue;
                    };
                    let Some(keeper) = items.get(survivor) else {
                        prepared.vanished.push((
                            Some(*superseded),
                            format!("survivor {} of item {} no longer exists", survivor, superseded),
                        ));
                        continue;
                    };
                    // An edited survivor would leave the superseded content with no live copy
                    let superseded_sig = signature_digest(self.match_mode, &current.type_tag, &current.live.content);
                    let survivor_sig = signature_digest(self.match_mode, &keeper.type_tag, &keeper.live.content);
                    if superseded_sig != survivor_sig {
                        debug!(item_id = %superseded, survivor_id = %survivor, "Contents diverged since planning; merge vetoed");
                        prepared
                            .skips
                            .push(ProtectedSkip::item(*superseded, ProtectionReason::SoleInstance));
                        continue;
                    }
                    let live_references = self.store.count_external_references(current.live.id).await?;
                    if let Some(reason) = self.guard.item_deletion_veto(current, live_references, 1) {
                        debug!(item_id = %superseded, %reason, "Merge vetoed at apply time");
                        prepared.skips.push(ProtectedSkip::item(*superseded, reason));
                        continue;
                    }

                    // Versions added since planning are repointed too
                    let mut versions = superseded_versions.clone();
                    for version in &current.version_ids {
                        if !versions.contains(version) {
                            versions.push(*version);
                        }
                    }
                    for version in versions {
                        prepared.mutations.push(Mutation::RepointReferences {
                            from: version,
                            to: keeper.live.id,
                        });
                    }
                    prepared.mutations.push(Mutation::DeleteItem { item: *superseded });
                    prepared.applied.push(operation.clone());
                }
                PlanOperation::MoveContainer { container, new_parent } => {
                    let Some(current) = containers.get(container) else {
                        prepared
                            .vanished
                            .push((None, format!("container {} no longer exists", container)));
                        continue;
                    };
                    if let Some(reason) = self.guard.container_veto(current) {
                        prepared.skips.push(ProtectedSkip::container(*container, reason));
                        continue;
                    }
                    prepared.mutations.push(Mutation::MoveContainer {
                        container: *container,
                        new_parent: *new_parent,
                    });
                    prepared.applied.push(operation.clone());
                }
                PlanOperation::DeleteContainer { container } => {
                    let Some(current) = containers.get(container) else {
                        prepared
                            .vanished
                            .push((None, format!("container {} no longer exists", container)));
                        continue;
                    };
                    if let Some(reason) = self.guard.container_veto(current) {
                        prepared.skips.push(ProtectedSkip::container(*container, reason));
                        continue;
                    }
                    prepared.mutations.push(Mutation::DeleteContainer { container: *container });
                    prepared.applied.push(operation.clone());
                }
            }
        }

        Ok(prepared)
    }
}

#[derive(Debug, Default)]
struct PreparedBatch {
    mutations: Vec<Mutation>,
    /// Operations that produced mutations
    applied: Vec<PlanOperation>,
    skips: Vec<ProtectedSkip>,
    /// Operations whose subject disappeared since planning
    vanished: Vec<(Option<ItemId>, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Advice;
    use sqlx::SqlitePool;
    use crate::store::SqliteStore;
    use qbank_common::db::init::init_memory_database;
    use qbank_common::db::models::{Scope, VersionId};

    fn relocations(n: i64, to: i64) -> Vec<PlanOperation> {
        (1..=n)
            .map(|i| PlanOperation::RelocateItem {
                item: ItemId(i),
                from: ContainerId(1),
                to: ContainerId(to),
            })
            .collect()
    }

    fn plan_of(operations: Vec<PlanOperation>) -> Plan {
        Plan {
            target_container: ContainerId(2),
            scope: Scope::System,
            source_items: operations.iter().filter_map(|op| op.subject_item()).collect(),
            operations,
            reference_repoints: Vec::new(),
            skipped: Vec::new(),
            diagnostic: None,
            advice: Advice::NotConfigured,
        }
    }

    async fn store() -> (Arc<dyn Store>, SqlitePool) {
        let pool = init_memory_database().await.unwrap();
        for sql in [
            "INSERT INTO contexts (id, level, path) VALUES (1, 'system', '/1')",
            "INSERT INTO containers (id, context_id, parent_id, name) VALUES (1, 1, NULL, 'top')",
            "INSERT INTO containers (id, context_id, parent_id, name) VALUES (2, 1, 1, 'Shared')",
            "INSERT INTO containers (id, context_id, parent_id, name) VALUES (3, 1, 1, 'Old')",
            "INSERT INTO items (id, container_id, type_tag) VALUES (1, 3, 'mc')",
            "INSERT INTO item_versions (id, item_id, version, content) VALUES (10, 1, 1, '2+2=4')",
            "INSERT INTO items (id, container_id, type_tag) VALUES (2, 3, 'mc')",
            "INSERT INTO item_versions (id, item_id, version, content) VALUES (20, 2, 1, '2+2=4')",
        ] {
            sqlx::query(sql).execute(&pool).await.unwrap();
        }
        (Arc::new(SqliteStore::new(pool.clone())), pool)
    }

    fn merge_2_into_1() -> Plan {
        plan_of(vec![PlanOperation::MergeItem {
            superseded: ItemId(2),
            superseded_versions: vec![VersionId(20)],
            survivor: ItemId(1),
            survivor_version: VersionId(10),
        }])
    }

    #[test]
    fn test_split_respects_item_cap() {
        let executor = ConsolidationExecutor {
            store: Arc::new(NoStore),
            guard: ProtectionGuard::default(),
            match_mode: MatchMode::Strict,
            max_item_batch: 500,
            max_container_batch: 100,
            error_cap: 20,
        };
        let ops = relocations(250, 2);

        let sizes: Vec<usize> = executor.split(&ops, 100).iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);

        let sizes: Vec<usize> = executor.split(&ops, 10_000).iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![250]);
    }

    #[test]
    fn test_split_respects_container_cap() {
        let executor = ConsolidationExecutor {
            store: Arc::new(NoStore),
            guard: ProtectionGuard::default(),
            match_mode: MatchMode::Strict,
            max_item_batch: 500,
            max_container_batch: 2,
            error_cap: 20,
        };
        let ops: Vec<PlanOperation> = (0..5)
            .map(|i| PlanOperation::MoveContainer {
                container: ContainerId(10 + i),
                new_parent: ContainerId(2),
            })
            .collect();

        let sizes: Vec<usize> = executor.split(&ops, 100).iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_merge_skipped_when_item_became_used() {
        let (store, pool) = store().await;
        let executor = ConsolidationExecutor::new(store.clone(), ProtectionGuard::default());

        // Item 2 starts being used after planning
        sqlx::query("INSERT INTO external_refs (version_id, component) VALUES (20, 'quiz')")
            .execute(&pool)
            .await
            .unwrap();

        let summary = executor.execute(&merge_2_into_1(), ExecuteOptions::default()).await;

        assert_eq!(summary.success, 0);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.protected[0].reason, ProtectionReason::Used { references: 1 });
        assert!(store.get_item(ItemId(2)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_merge_skipped_when_survivor_content_changed() {
        let (store, pool) = store().await;
        let executor = ConsolidationExecutor::new(store.clone(), ProtectionGuard::default());

        // Survivor gets a new live version after planning
        sqlx::query("INSERT INTO item_versions (id, item_id, version, content) VALUES (11, 1, 2, '2+2=5')")
            .execute(&pool)
            .await
            .unwrap();

        let summary = executor.execute(&merge_2_into_1(), ExecuteOptions::default()).await;

        assert_eq!(summary.success, 0);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.protected[0].reason, ProtectionReason::SoleInstance);
        let kept = store.get_item(ItemId(2)).await.unwrap().unwrap();
        assert_eq!(kept.live.content, "2+2=4");
    }

    #[tokio::test]
    async fn test_normalized_mode_merges_equivalent_survivor() {
        let (store, pool) = store().await;
        let executor = ConsolidationExecutor::new(store.clone(), ProtectionGuard::default())
            .with_match_mode(MatchMode::Normalized);

        sqlx::query("INSERT INTO item_versions (id, item_id, version, content) VALUES (11, 1, 2, '  2+2=4 ')")
            .execute(&pool)
            .await
            .unwrap();

        let summary = executor.execute(&merge_2_into_1(), ExecuteOptions::default()).await;

        assert_eq!(summary.success, 1);
        assert!(store.get_item(ItemId(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_move_into_own_subtree_rolls_back() {
        let (store, pool) = store().await;
        let executor = ConsolidationExecutor::new(store.clone(), ProtectionGuard::default());
        let plan = plan_of(vec![PlanOperation::MoveContainer {
            container: ContainerId(3),
            new_parent: ContainerId(2),
        }]);

        // After planning, the target is re-parented under the moving container
        sqlx::query("UPDATE containers SET parent_id = 3 WHERE id = 2")
            .execute(&pool)
            .await
            .unwrap();

        let summary = executor.execute(&plan, ExecuteOptions::default()).await;

        assert_eq!(summary.success, 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.batches[0].state, BatchState::RolledBack);
        let moved = store.get_container(ContainerId(3)).await.unwrap().unwrap();
        assert_eq!(moved.parent_id, Some(ContainerId(1)));
    }

    #[tokio::test]
    async fn test_merge_then_rerun_reports_vanished_item() {
        let (store, _pool) = store().await;
        let executor = ConsolidationExecutor::new(store.clone(), ProtectionGuard::default());

        let summary = executor.execute(&merge_2_into_1(), ExecuteOptions::default()).await;
        assert_eq!(summary.success, 1);
        assert!(store.get_item(ItemId(2)).await.unwrap().is_none());
        assert_eq!(summary.batches[0].state, BatchState::Committed);

        let summary = executor.execute(&merge_2_into_1(), ExecuteOptions::default()).await;
        assert_eq!(summary.success, 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failed_items, vec![ItemId(2)]);
    }

    #[tokio::test]
    async fn test_error_list_is_capped() {
        let (store, _pool) = store().await;
        let mut executor = ConsolidationExecutor::new(store, ProtectionGuard::default());
        executor.error_cap = 2;

        // Items 100..105 do not exist: five failures, two listed
        let ops: Vec<PlanOperation> = (100..105)
            .map(|i| PlanOperation::RelocateItem {
                item: ItemId(i),
                from: ContainerId(3),
                to: ContainerId(2),
            })
            .collect();
        let summary = executor.execute(&plan_of(ops), ExecuteOptions::default()).await;

        assert_eq!(summary.failed, 5);
        assert_eq!(summary.errors.len(), 2);
        assert_eq!(summary.errors_omitted, 3);
    }

    #[tokio::test]
    async fn test_protected_container_delete_skipped() {
        let (store, _pool) = store().await;
        let executor = ConsolidationExecutor::new(store, ProtectionGuard::default());
        let plan = plan_of(vec![PlanOperation::DeleteContainer {
            container: ContainerId(1),
        }]);

        let summary = executor.execute(&plan, ExecuteOptions::default()).await;

        assert_eq!(summary.success, 0);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.protected[0].reason, ProtectionReason::StructuralRoot);
    }

    struct NoStore;

    #[async_trait::async_trait]
    impl Store for NoStore {
        async fn find_contexts(
            &self,
            _: &crate::store::ContextFilter,
        ) -> Result<Vec<qbank_common::db::models::Context>> {
            Ok(Vec::new())
        }
        async fn find_containers(
            &self,
            _: &ContainerFilter,
        ) -> Result<Vec<qbank_common::db::models::Container>> {
            Ok(Vec::new())
        }
        async fn find_items(&self, _: &ItemFilter) -> Result<Vec<Item>> {
            Ok(Vec::new())
        }
        async fn count_external_references(&self, _: VersionId) -> Result<i64> {
            Ok(0)
        }
        async fn run_in_transaction(&self, _: &[Mutation]) -> Result<()> {
            Ok(())
        }
    }
}
