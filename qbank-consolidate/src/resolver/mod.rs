//! Canonical target resolver
//!
//! Finds the single container that best represents a fuzzy label such as
//! "the organization-wide shared pool", even when several containers in
//! several contexts carry loosely matching labels.
//!
//! **Algorithm:**
//! 1. Overrides (e.g. a confirmed anchor record) are consulted first
//! 2. Each domain (primary: system scope, secondary: course categories) is
//!    searched independently: discovery cascade, then structure score,
//!    highest score wins, ties go to the earliest discovered
//! 3. Best-of-primary vs best-of-secondary: the one with a direct anchor
//!    child wins; if both or neither have one, the higher score wins
//! 4. Nothing is ever created; absence is reported as `NotFound`
//!
//! Store failures never abort a resolution: a failing domain contributes
//! no candidates and a failing candidate scores zero.

pub mod overrides;
pub mod scoring;
pub mod strategies;

use crate::normalize::normalize;
use crate::reachability::ReachabilityOracle;
use crate::store::{ContainerFilter, Store};
use overrides::{AnchorRecordOverride, OverrideStrategy};
use qbank_common::config::ConsolidationConfig;
use qbank_common::db::models::{Container, ContainerId, ContextLevel, Scope};
use scoring::{score_candidate, StructureScore};
use serde::Serialize;
use std::sync::Arc;
use strategies::{default_strategies, discover, Candidate, CandidateStrategy, LabelQuery, StrategyKind};
use tracing::{debug, info, warn, Instrument};

/// Minimum Jaro-Winkler similarity for a near-miss hint
const NEAR_MISS_THRESHOLD: f64 = 0.85;
const MAX_NEAR_MISSES: usize = 5;

/// Resolver settings
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub anchor_label: Option<String>,
    pub primary_levels: Vec<ContextLevel>,
    pub secondary_levels: Vec<ContextLevel>,
    pub max_depth: usize,
}

impl From<&ConsolidationConfig> for ResolverSettings {
    fn from(config: &ConsolidationConfig) -> Self {
        Self {
            anchor_label: config.anchor_label.clone(),
            primary_levels: config.primary_levels.clone(),
            secondary_levels: config.secondary_levels.clone(),
            max_depth: config.max_tree_depth,
        }
    }
}

/// Which search domain produced a winner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Primary,
    Secondary,
}

/// How the winning container was chosen
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "via", rename_all = "snake_case")]
pub enum ResolutionPath {
    Override { name: String },
    Scored { domain: Domain, strategy: StrategyKind },
}

/// Anchor-based and score-based choices disagreed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ambiguity {
    /// Chosen because of the anchor signal
    pub anchored: ContainerId,
    /// Would have won on structure score alone
    pub score_preferred: ContainerId,
    pub detail: String,
}

/// Successful resolution
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedTarget {
    pub container: Container,
    #[serde(flatten)]
    pub path: ResolutionPath,
    pub score: Option<StructureScore>,
    pub ambiguity: Option<Ambiguity>,
}

/// Outcome of [`CanonicalTargetResolver::resolve`]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    Found(ResolvedTarget),
    NotFound {
        label: String,
        /// Similar labels seen during the search
        near_misses: Vec<String>,
    },
}

impl Resolution {
    pub fn container(&self) -> Option<&Container> {
        match self {
            Resolution::Found(target) => Some(&target.container),
            Resolution::NotFound { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
struct ScoredCandidate {
    candidate: Candidate,
    score: StructureScore,
}

struct DomainSearch {
    best: Option<ScoredCandidate>,
    pool: Vec<Container>,
}

pub struct CanonicalTargetResolver {
    store: Arc<dyn Store>,
    oracle: Arc<dyn ReachabilityOracle>,
    settings: ResolverSettings,
    strategies: Vec<Box<dyn CandidateStrategy>>,
    overrides: Vec<Box<dyn OverrideStrategy>>,
}

impl CanonicalTargetResolver {
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<dyn ReachabilityOracle>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            store,
            oracle,
            settings,
            strategies: default_strategies(),
            overrides: Vec::new(),
        }
    }

    /// Build from configuration, registering the anchor-record override if set
    pub fn from_config(
        store: Arc<dyn Store>,
        oracle: Arc<dyn ReachabilityOracle>,
        config: &ConsolidationConfig,
    ) -> Self {
        let mut resolver = Self::new(store, oracle, ResolverSettings::from(config));
        if let Some(anchor) = config.anchor_record {
            resolver = resolver.with_override(Box::new(AnchorRecordOverride::new(ContainerId(anchor))));
        }
        resolver
    }

    pub fn with_override(mut self, strategy: Box<dyn OverrideStrategy>) -> Self {
        self.overrides.push(strategy);
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<Box<dyn CandidateStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Resolve `label` to the canonical container visible from `scope`
    pub async fn resolve(&self, label: &str, scope: Scope) -> Resolution {
        let span = tracing::info_span!("resolver", label = %label, scope = %scope);
        self.resolve_inner(label, scope).instrument(span).await
    }

    async fn resolve_inner(&self, label: &str, scope: Scope) -> Resolution {
        let query = LabelQuery::new(label);

        let primary = self.search_domain(&self.settings.primary_levels, &query, scope).await;
        let secondary = self
            .search_domain(&self.settings.secondary_levels, &query, scope)
            .await;

        let scored = pick_between_domains(primary.best.clone(), secondary.best.clone());

        if let Some((name, container)) = self.apply_overrides(scope).await {
            let ambiguity = match &scored {
                Some((_, winner, _)) if winner.candidate.container.id != container.id => {
                    let detail = format!(
                        "override selected container {} but structure score prefers {}",
                        container.id, winner.candidate.container.id
                    );
                    warn!(%detail, "Ambiguous canonical target");
                    Some(Ambiguity {
                        anchored: container.id,
                        score_preferred: winner.candidate.container.id,
                        detail,
                    })
                }
                _ => None,
            };
            info!(container_id = %container.id, override_name = %name, "Canonical target resolved by override");
            return Resolution::Found(ResolvedTarget {
                container,
                path: ResolutionPath::Override { name },
                score: None,
                ambiguity,
            });
        }

        match scored {
            Some((domain, winner, ambiguity)) => {
                info!(
                    container_id = %winner.candidate.container.id,
                    domain = ?domain,
                    score = winner.score.total,
                    "Canonical target resolved"
                );
                Resolution::Found(ResolvedTarget {
                    path: ResolutionPath::Scored {
                        domain,
                        strategy: winner.candidate.strategy,
                    },
                    container: winner.candidate.container,
                    score: Some(winner.score),
                    ambiguity,
                })
            }
            None => {
                let near_misses = near_misses(&query, primary.pool.iter().chain(secondary.pool.iter()));
                info!(near_misses = near_misses.len(), "Canonical target not found");
                Resolution::NotFound {
                    label: label.to_string(),
                    near_misses,
                }
            }
        }
    }

    async fn apply_overrides(&self, scope: Scope) -> Option<(String, Container)> {
        for strategy in &self.overrides {
            match strategy.resolve(self.store.as_ref()).await {
                Ok(Some(container)) => {
                    if self.oracle.is_container_reachable_from_scope(&container, scope).await {
                        return Some((strategy.name().to_string(), container));
                    }
                    warn!(
                        override_name = strategy.name(),
                        container_id = %container.id,
                        "Override target not reachable from scope; ignored"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(override_name = strategy.name(), error = %e, "Override failed; ignored");
                }
            }
        }
        None
    }

    async fn search_domain(
        &self,
        levels: &[ContextLevel],
        query: &LabelQuery,
        scope: Scope,
    ) -> DomainSearch {
        if levels.is_empty() {
            return DomainSearch {
                best: None,
                pool: Vec::new(),
            };
        }

        let filter = ContainerFilter {
            context_levels: Some(levels.to_vec()),
            ..Default::default()
        };
        let all = match self.store.find_containers(&filter).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(levels = ?levels, error = %e, "Domain lookup failed; no candidates from this domain");
                Vec::new()
            }
        };

        let mut pool = Vec::with_capacity(all.len());
        for container in all {
            if self.oracle.is_container_reachable_from_scope(&container, scope).await {
                pool.push(container);
            }
        }

        let candidates = discover(&self.strategies, query, &pool);
        let mut best: Option<ScoredCandidate> = None;

        for candidate in candidates {
            let score = match score_candidate(
                self.store.as_ref(),
                &candidate.container,
                self.settings.anchor_label.as_deref(),
                self.settings.max_depth,
            )
            .await
            {
                Ok(score) => score,
                Err(e) => {
                    warn!(
                        container_id = %candidate.container.id,
                        error = %e,
                        "Candidate scoring failed; scoring as 0"
                    );
                    StructureScore::default()
                }
            };

            debug!(
                container_id = %candidate.container.id,
                score = score.total,
                anchor = score.has_direct_anchor,
                "Scored candidate"
            );

            // Strictly greater: ties keep the earlier discovery
            let better = best
                .as_ref()
                .map_or(true, |current| score.total > current.score.total);
            if better {
                best = Some(ScoredCandidate { candidate, score });
            }
        }

        DomainSearch { best, pool }
    }
}

/// Choose between the best of each domain
///
/// Direct-anchor validation wins; otherwise the higher score; primary on ties.
fn pick_between_domains(
    primary: Option<ScoredCandidate>,
    secondary: Option<ScoredCandidate>,
) -> Option<(Domain, ScoredCandidate, Option<Ambiguity>)> {
    match (primary, secondary) {
        (None, None) => None,
        (Some(p), None) => Some((Domain::Primary, p, None)),
        (None, Some(s)) => Some((Domain::Secondary, s, None)),
        (Some(p), Some(s)) => {
            let p_anchor = p.score.has_direct_anchor;
            let s_anchor = s.score.has_direct_anchor;

            if p_anchor != s_anchor {
                let (domain, anchored, other) = if p_anchor {
                    (Domain::Primary, p, s)
                } else {
                    (Domain::Secondary, s, p)
                };
                let ambiguity = (other.score.total > anchored.score.total).then(|| {
                    let detail = format!(
                        "container {} has the anchor child but container {} scores higher ({} > {})",
                        anchored.candidate.container.id,
                        other.candidate.container.id,
                        other.score.total,
                        anchored.score.total
                    );
                    warn!(%detail, "Ambiguous canonical target");
                    Ambiguity {
                        anchored: anchored.candidate.container.id,
                        score_preferred: other.candidate.container.id,
                        detail,
                    }
                });
                Some((domain, anchored, ambiguity))
            } else if s.score.total > p.score.total {
                Some((Domain::Secondary, s, None))
            } else {
                Some((Domain::Primary, p, None))
            }
        }
    }
}

fn near_misses<'a>(query: &LabelQuery, pool: impl Iterator<Item = &'a Container>) -> Vec<String> {
    let mut scored: Vec<(f64, String)> = pool
        .filter_map(|container| {
            let similarity = strsim::jaro_winkler(&normalize(&container.name), &query.normalized);
            (similarity >= NEAR_MISS_THRESHOLD).then(|| (similarity, container.name.clone()))
        })
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut labels: Vec<String> = Vec::new();
    for (_, name) in scored {
        if !labels.contains(&name) {
            labels.push(name);
        }
        if labels.len() == MAX_NEAR_MISSES {
            break;
        }
    }
    labels
}
