//! # qbank-consolidate
//!
//! Content deduplication and consolidation engine for a hierarchical
//! learning-content bank (contexts, containers, items with versions and
//! external references).
//!
//! **Public operations** (see [`Consolidator`]):
//! - `resolve_canonical_target`: find the canonical shared container
//! - `detect_duplicates`: group items by identity signature, classify usage
//! - `plan_consolidation`: validated, side-effect-free plan
//! - `execute_plan`: batched, transactional application of a plan
//!
//! Every operation runs to completion on the calling task; nothing here
//! spawns tasks or threads.

pub mod bulk;
pub mod classifier;
pub mod detector;
pub mod executor;
pub mod guard;
pub mod hierarchy;
pub mod normalize;
pub mod planner;
pub mod reachability;
pub mod report;
pub mod resolver;
pub mod store;

pub use qbank_common::db::models as model;

use bulk::{BulkDeduplicate, BulkRehome, BulkSettings};
use classifier::{Classifier, HttpClassifier};
use detector::{DetectionScope, DuplicateDetector, GroupPage};
use executor::{ConsolidationExecutor, ExecuteOptions, ExecutionSummary};
use guard::ProtectionGuard;
use model::{ContainerId, Scope};
use planner::{ConsolidationPlanner, Plan, PlanSource};
use qbank_common::{ConsolidationConfig, Result};
use reachability::{ContextPathOracle, ReachabilityOracle};
use report::Reporter;
use resolver::{CanonicalTargetResolver, Resolution};
use std::path::Path;
use std::sync::Arc;
use store::{SqliteStore, Store};

/// Engine facade wiring every component from one configuration
pub struct Consolidator {
    config: ConsolidationConfig,
    store: Arc<dyn Store>,
    resolver: CanonicalTargetResolver,
    detector: Arc<DuplicateDetector>,
    planner: Arc<ConsolidationPlanner>,
    executor: Arc<ConsolidationExecutor>,
    reporter: Reporter,
}

impl Consolidator {
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<dyn ReachabilityOracle>,
        config: ConsolidationConfig,
    ) -> Result<Self> {
        config.validate()?;

        let classifier: Option<Arc<dyn Classifier>> = match &config.classifier {
            Some(settings) => Some(Arc::new(HttpClassifier::new(settings)?)),
            None => None,
        };

        let resolver = CanonicalTargetResolver::from_config(store.clone(), oracle.clone(), &config);
        let detector = Arc::new(DuplicateDetector::from_config(store.clone(), &config));
        let mut planner = ConsolidationPlanner::from_config(store.clone(), oracle, &config);
        if let Some(classifier) = classifier {
            planner = planner.with_classifier(classifier);
        }
        let executor = Arc::new(ConsolidationExecutor::from_config(store.clone(), &config));
        let reporter = Reporter::new(
            store.clone(),
            ProtectionGuard::new(&config.default_container_patterns),
            config.scan_page_size,
        );

        Ok(Self {
            config,
            store,
            resolver,
            detector,
            planner: Arc::new(planner),
            executor,
            reporter,
        })
    }

    /// Open the SQLite bank named by the configuration (or `database`)
    /// with context-path reachability
    pub async fn open(config: ConsolidationConfig, database: Option<&Path>) -> Result<Self> {
        let db_path = config.resolve_database_path(database);
        tracing::info!("Database: {}", db_path.display());

        let pool = qbank_common::db::init_database(&db_path).await?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool).with_lock_wait(config.lock_wait_ms));
        let oracle = Arc::new(ContextPathOracle::new(store.clone()));
        Self::new(store, oracle, config)
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Canonical container for `label` as seen from `scope`
    pub async fn resolve_canonical_target(&self, label: &str, scope: Scope) -> Resolution {
        self.resolver.resolve(label, scope).await
    }

    /// Canonical container for the configured label
    pub async fn resolve_configured_target(&self, scope: Scope) -> Resolution {
        self.resolver.resolve(&self.config.canonical_label, scope).await
    }

    pub async fn detect_duplicates(
        &self,
        scope: DetectionScope,
        page: usize,
        page_size: usize,
    ) -> Result<GroupPage> {
        self.detector.detect(scope, page, page_size).await
    }

    pub async fn plan_consolidation(
        &self,
        source: &PlanSource,
        target: ContainerId,
        scope: Scope,
    ) -> Result<Plan> {
        self.planner.plan(source, target, scope).await
    }

    /// Apply `plan` in batches of `batch_size`, continuing past failed batches
    pub async fn execute_plan(&self, plan: &Plan, batch_size: usize) -> ExecutionSummary {
        let options = ExecuteOptions {
            batch_size,
            stop_on_first_error: false,
        };
        self.executor.execute(plan, options).await
    }

    pub async fn execute_plan_with(&self, plan: &Plan, options: ExecuteOptions) -> ExecutionSummary {
        self.executor.execute(plan, options).await
    }

    /// Bulk settings derived from configuration
    pub fn bulk_settings(&self, stop_on_first_error: bool) -> BulkSettings {
        BulkSettings {
            page_size: self.config.batch_size,
            max_iterations: self.config.max_bulk_iterations,
            execute: ExecuteOptions {
                batch_size: self.config.batch_size,
                stop_on_first_error,
            },
            error_cap: self.config.error_cap,
        }
    }

    pub fn rehome(
        &self,
        source: ContainerId,
        target: ContainerId,
        scope: Scope,
        delete_emptied: bool,
        settings: BulkSettings,
    ) -> BulkRehome {
        BulkRehome::new(
            self.store.clone(),
            self.planner.clone(),
            self.executor.clone(),
            source,
            target,
            scope,
            delete_emptied,
            settings,
        )
    }

    pub fn deduplicate(
        &self,
        detection: DetectionScope,
        target: ContainerId,
        scope: Scope,
        settings: BulkSettings,
    ) -> BulkDeduplicate {
        BulkDeduplicate::new(
            self.detector.clone(),
            self.planner.clone(),
            self.executor.clone(),
            detection,
            target,
            scope,
            settings,
        )
    }

    pub fn detector(&self) -> &DuplicateDetector {
        &self.detector
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }
}
