//! Bulk drivers
//!
//! Long consolidations are driven one batch-sized step at a time. Every
//! step re-queries page one of the remaining candidates; an offset is never
//! advanced, because each step shrinks the result set and an advancing
//! offset over a shrinking set skips rows.
//!
//! Candidates that were skipped (protected) or failed stay behind. The
//! rehome driver keeps a keyset floor at the highest item id it has
//! handled, so page one never returns them again and the query carries
//! no growing exclusion list. The dedupe driver settles each signature
//! it has offered.
//! `run()` stops on completion, on the iteration ceiling, after a step
//! that made no progress, or on the first failure when asked to.

use crate::detector::{DetectionScope, DuplicateDetector};
use crate::executor::{ConsolidationExecutor, ExecuteOptions, ExecutionSummary};
use crate::guard::Subject;
use crate::planner::{ConsolidationPlanner, PlanSource};
use crate::store::{ItemFilter, Store};
use async_trait::async_trait;
use qbank_common::db::models::{ContainerId, ItemId, Scope};
use qbank_common::{Error, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn, Instrument};

/// Why a bulk run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    IterationCeiling,
    NoProgress,
    StoppedOnError,
}

/// Result of one `step()`
#[derive(Debug, Clone, Serialize)]
pub struct BulkStep {
    pub summary: ExecutionSummary,
    /// Candidates taken from page one this step
    pub candidates: usize,
    /// Nothing left to do
    pub finished: bool,
}

/// Result of a whole `run()`
#[derive(Debug, Clone, Serialize)]
pub struct BulkReport {
    pub summary: ExecutionSummary,
    pub iterations: usize,
    pub stop_reason: StopReason,
}

/// Shared settings of both drivers
#[derive(Debug, Clone, Copy)]
pub struct BulkSettings {
    /// Page-one size; also the plan size per step
    pub page_size: usize,
    pub max_iterations: usize,
    pub execute: ExecuteOptions,
    pub error_cap: usize,
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_iterations: 10_000,
            execute: ExecuteOptions::default(),
            error_cap: 20,
        }
    }
}

/// One driver step plus whether it moved past anything it did not apply
#[async_trait]
trait Stepper: Send {
    async fn step_once(&mut self) -> Result<(BulkStep, bool)>;
}

/// Common run loop over [`Stepper::step_once`]
async fn drive<S: Stepper>(settings: &BulkSettings, driver: &mut S) -> Result<BulkReport> {
    let mut total = ExecutionSummary::new(settings.error_cap);
    let mut iterations = 0;

    let stop_reason = loop {
        if iterations >= settings.max_iterations {
            warn!(iterations, "Bulk iteration ceiling reached");
            break StopReason::IterationCeiling;
        }
        iterations += 1;

        let (outcome, excluded_new) = driver.step_once().await?;
        let failed = outcome.summary.failed > 0;
        let progressed = outcome.summary.success > 0 || excluded_new;
        total.absorb(outcome.summary);

        if outcome.finished {
            break StopReason::Completed;
        }
        if failed && settings.execute.stop_on_first_error {
            break StopReason::StoppedOnError;
        }
        if !progressed {
            warn!(iterations, "Bulk step made no progress; stopping");
            break StopReason::NoProgress;
        }
    };

    info!(
        iterations,
        success = total.success,
        failed = total.failed,
        skipped = total.skipped,
        stop_reason = ?stop_reason,
        "Bulk run finished"
    );

    Ok(BulkReport {
        summary: total,
        iterations,
        stop_reason,
    })
}

/// Re-home every item of one container into a target, page by page
pub struct BulkRehome {
    store: Arc<dyn Store>,
    planner: Arc<ConsolidationPlanner>,
    executor: Arc<ConsolidationExecutor>,
    source: ContainerId,
    target: ContainerId,
    scope: Scope,
    delete_emptied: bool,
    settings: BulkSettings,
    /// Highest item id already handled; page one starts above it
    floor: Option<ItemId>,
    /// Candidates left in the source so far
    left_behind: usize,
}

impl BulkRehome {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        planner: Arc<ConsolidationPlanner>,
        executor: Arc<ConsolidationExecutor>,
        source: ContainerId,
        target: ContainerId,
        scope: Scope,
        delete_emptied: bool,
        settings: BulkSettings,
    ) -> Self {
        Self {
            store,
            planner,
            executor,
            source,
            target,
            scope,
            delete_emptied,
            settings,
            floor: None,
            left_behind: 0,
        }
    }

    /// One batch-sized unit of work
    ///
    /// Plan rejections (missing or unreachable target) are returned as
    /// errors: no later step could succeed either.
    pub async fn step(&mut self) -> Result<BulkStep> {
        Ok(self.step_once().await?.0)
    }

    pub async fn run(&mut self) -> Result<BulkReport> {
        let settings = self.settings;
        drive(&settings, self).await
    }
}

#[async_trait]
impl Stepper for BulkRehome {
    async fn step_once(&mut self) -> Result<(BulkStep, bool)> {
        let span = tracing::info_span!("bulk", kind = "rehome", source = %self.source, target = %self.target);
        let settings = self.settings;
        async move {
            let filter = ItemFilter {
                container_ids: Some(vec![self.source]),
                after_id: self.floor,
                limit: Some(settings.page_size.max(1)),
                ..Default::default()
            };
            let page = self.store.find_items(&filter).await?;

            if page.is_empty() {
                let summary = self.finish().await?;
                return Ok((
                    BulkStep {
                        summary,
                        candidates: 0,
                        finished: true,
                    },
                    false,
                ));
            }

            let ids: Vec<ItemId> = page.iter().map(|item| item.id).collect();
            let plan = self
                .planner
                .plan(&PlanSource::Items { ids: ids.clone() }, self.target, self.scope)
                .await?;

            let summary = self.executor.execute(&plan, settings.execute).await;

            let mut stayed: HashSet<ItemId> = summary.failed_items.iter().copied().collect();
            stayed.extend(summary.protected.iter().filter_map(|skip| match skip.subject {
                Subject::Item { id } => Some(id),
                Subject::Container { .. } => None,
            }));
            // Items already in the target never produce an operation
            stayed.extend(ids.iter().filter(|id| !plan.source_items.contains(id)));
            self.left_behind += stayed.len();
            // Pages come back in id order
            self.floor = ids.last().copied().max(self.floor);
            let excluded_new = !stayed.is_empty();

            Ok((
                BulkStep {
                    summary,
                    candidates: ids.len(),
                    finished: false,
                },
                excluded_new,
            ))
        }
        .instrument(span)
        .await
    }
}

impl BulkRehome {
    /// Remove the emptied source when requested
    async fn finish(&self) -> Result<ExecutionSummary> {
        if !self.delete_emptied || self.left_behind > 0 {
            return Ok(ExecutionSummary::new(self.settings.error_cap));
        }
        let source = PlanSource::ContainerContents {
            container: self.source,
            delete_emptied: true,
        };
        let plan = self.planner.plan(&source, self.target, self.scope).await?;
        Ok(self.executor.execute(&plan, self.settings.execute).await)
    }
}

/// Merge duplicate groups into a target, a few groups per step
pub struct BulkDeduplicate {
    detector: Arc<DuplicateDetector>,
    planner: Arc<ConsolidationPlanner>,
    executor: Arc<ConsolidationExecutor>,
    detection: DetectionScope,
    target: ContainerId,
    scope: Scope,
    settings: BulkSettings,
    settled: HashSet<String>,
}

impl BulkDeduplicate {
    pub fn new(
        detector: Arc<DuplicateDetector>,
        planner: Arc<ConsolidationPlanner>,
        executor: Arc<ConsolidationExecutor>,
        detection: DetectionScope,
        target: ContainerId,
        scope: Scope,
        settings: BulkSettings,
    ) -> Self {
        Self {
            detector,
            planner,
            executor,
            detection,
            target,
            scope,
            settings,
            settled: HashSet::new(),
        }
    }

    /// One batch-sized unit of work: page one of the unsettled groups
    pub async fn step(&mut self) -> Result<BulkStep> {
        Ok(self.step_once().await?.0)
    }

    pub async fn run(&mut self) -> Result<BulkReport> {
        let settings = self.settings;
        drive(&settings, self).await
    }
}

#[async_trait]
impl Stepper for BulkDeduplicate {
    async fn step_once(&mut self) -> Result<(BulkStep, bool)> {
        let span = tracing::info_span!("bulk", kind = "dedupe", target = %self.target);
        let settings = self.settings;
        async move {
            let page = self
                .detector
                .detect_excluding(self.detection, 1, settings.page_size.max(1), &self.settled)
                .await?;

            let mut summary = ExecutionSummary::new(settings.error_cap);
            if page.groups.is_empty() {
                return Ok((
                    BulkStep {
                        summary,
                        candidates: 0,
                        finished: true,
                    },
                    false,
                ));
            }

            let candidates = page.groups.len();
            let before = self.settled.len();

            for group in page.groups {
                // Whatever happens, this signature is not offered again
                self.settled.insert(group.signature.clone());

                let source = PlanSource::Group { group };
                let plan = match self.planner.plan(&source, self.target, self.scope).await {
                    Ok(plan) => plan,
                    Err(Error::ValidationRejected(rejection)) => {
                        summary.failed += 1;
                        summary.record_error(rejection.to_string());
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                let outcome = self.executor.execute(&plan, settings.execute).await;
                let failed = outcome.failed > 0;
                summary.absorb(outcome);
                if failed && settings.execute.stop_on_first_error {
                    break;
                }
            }

            Ok((
                BulkStep {
                    summary,
                    candidates,
                    finished: false,
                },
                self.settled.len() > before,
            ))
        }
        .instrument(span)
        .await
    }
}
