//! Candidate discovery strategies
//!
//! Each strategy is a pure function from the label query and the pool of
//! visible containers to the containers it recognizes. The resolver runs
//! them in priority order and keeps the first non-empty result.

use crate::normalize::normalize;
use qbank_common::db::models::Container;
use serde::Serialize;

/// The label being resolved, in raw and normalized form
#[derive(Debug, Clone)]
pub struct LabelQuery {
    pub raw: String,
    pub normalized: String,
}

impl LabelQuery {
    pub fn new(label: &str) -> Self {
        Self {
            raw: label.trim().to_string(),
            normalized: normalize(label),
        }
    }
}

/// Which strategy discovered a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    ExactLabel,
    NormalizedLabel,
    PaddedSubstring,
    Description,
}

/// A discovered container with its discovery rank (lower = earlier)
#[derive(Debug, Clone)]
pub struct Candidate {
    pub container: Container,
    pub strategy: StrategyKind,
    pub discovered: usize,
}

/// One step of the discovery cascade
pub trait CandidateStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn matches(&self, query: &LabelQuery, container: &Container) -> bool;

    fn discover(&self, query: &LabelQuery, pool: &[Container]) -> Vec<Candidate> {
        pool.iter()
            .filter(|container| self.matches(query, container))
            .enumerate()
            .map(|(discovered, container)| Candidate {
                container: container.clone(),
                strategy: self.kind(),
                discovered,
            })
            .collect()
    }
}

/// Label equal to the query as typed (surrounding whitespace ignored)
pub struct ExactLabel;

impl CandidateStrategy for ExactLabel {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ExactLabel
    }

    fn matches(&self, query: &LabelQuery, container: &Container) -> bool {
        !query.raw.is_empty() && container.name.trim() == query.raw
    }
}

/// Case, diacritic and whitespace variants of the query
pub struct NormalizedLabel;

impl CandidateStrategy for NormalizedLabel {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NormalizedLabel
    }

    fn matches(&self, query: &LabelQuery, container: &Container) -> bool {
        !query.normalized.is_empty() && normalize(&container.name) == query.normalized
    }
}

/// Label starting with, ending with, or containing the query as a whole
/// word run ("Shared (system)", "Course shared", "old shared pool")
pub struct PaddedSubstring;

impl CandidateStrategy for PaddedSubstring {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PaddedSubstring
    }

    fn matches(&self, query: &LabelQuery, container: &Container) -> bool {
        let q = &query.normalized;
        if q.is_empty() {
            return false;
        }
        let name = normalize(&container.name);
        name.starts_with(&format!("{} ", q))
            || name.ends_with(&format!(" {}", q))
            || name.contains(&format!(" {} ", q))
    }
}

/// Last resort: the free-text description mentions the query
pub struct DescriptionMention;

impl CandidateStrategy for DescriptionMention {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Description
    }

    fn matches(&self, query: &LabelQuery, container: &Container) -> bool {
        !query.normalized.is_empty() && normalize(&container.info).contains(&query.normalized)
    }
}

/// The cascade in priority order
pub fn default_strategies() -> Vec<Box<dyn CandidateStrategy>> {
    vec![
        Box::new(ExactLabel),
        Box::new(NormalizedLabel),
        Box::new(PaddedSubstring),
        Box::new(DescriptionMention),
    ]
}

/// Run strategies in order; the first one that finds anything wins
pub fn discover(
    strategies: &[Box<dyn CandidateStrategy>],
    query: &LabelQuery,
    pool: &[Container],
) -> Vec<Candidate> {
    for strategy in strategies {
        let found = strategy.discover(query, pool);
        if !found.is_empty() {
            tracing::debug!(
                strategy = ?strategy.kind(),
                candidates = found.len(),
                "Discovery strategy matched"
            );
            return found;
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbank_common::db::models::{ContainerId, ContextId};

    fn container(id: i64, name: &str, info: &str) -> Container {
        Container {
            id: ContainerId(id),
            context_id: ContextId(1),
            parent_id: Some(ContainerId(1)),
            name: name.to_string(),
            info: info.to_string(),
        }
    }

    #[test]
    fn test_exact_label_beats_variants() {
        let pool = vec![container(2, "SHARED", ""), container(3, "Shared", "")];
        let found = discover(&default_strategies(), &LabelQuery::new("Shared"), &pool);

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].container.id, ContainerId(3));
        assert_eq!(found[0].strategy, StrategyKind::ExactLabel);
    }

    #[test]
    fn test_normalized_variants_found_in_order() {
        let pool = vec![container(2, "  COMMUN ", ""), container(3, "Cômmun", "")];
        let found = discover(&default_strategies(), &LabelQuery::new("commun"), &pool);

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].strategy, StrategyKind::NormalizedLabel);
        assert_eq!(found[0].discovered, 0);
        assert_eq!(found[1].container.id, ContainerId(3));
    }

    #[test]
    fn test_padded_substring_requires_word_boundary() {
        let strategy = PaddedSubstring;
        let query = LabelQuery::new("shared");

        assert!(strategy.matches(&query, &container(1, "Shared (system)", "")));
        assert!(strategy.matches(&query, &container(1, "Course shared", "")));
        assert!(strategy.matches(&query, &container(1, "old shared pool", "")));
        assert!(!strategy.matches(&query, &container(1, "Timeshared", "")));
    }

    #[test]
    fn test_description_is_last_resort() {
        let pool = vec![container(2, "Misc", "This is the shared pool")];
        let found = discover(&default_strategies(), &LabelQuery::new("shared pool"), &pool);

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].strategy, StrategyKind::Description);
    }

    #[test]
    fn test_blank_query_matches_nothing() {
        let pool = vec![container(2, "", "")];
        assert!(discover(&default_strategies(), &LabelQuery::new("   "), &pool).is_empty());
    }
}
