//! Common error types for the content-bank tools

use crate::db::models::{ContainerId, ContextId, ItemId, Scope};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Common result type for content-bank operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the content-bank tools
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Plan construction refused an operation
    #[error("Validation rejected: {0}")]
    ValidationRejected(Rejection),

    /// Hierarchy walk exceeded the depth guard or found a loop
    #[error("Structural inconsistency: {0}")]
    StructuralInconsistency(String),

    /// Optional classifier adjunct failed or timed out
    #[error("Classifier error: {0}")]
    Classifier(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when SQLite reported lock contention (worth retrying)
    pub fn is_lock_contention(&self) -> bool {
        match self {
            Error::Database(db_err) => {
                let msg = db_err.to_string();
                msg.contains("database is locked") || msg.contains("database table is locked")
            }
            _ => false,
        }
    }
}

/// The candidate a plan refused to operate on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectedCandidate {
    Item { id: ItemId },
    Container { id: ContainerId },
    Group { type_tag: String, members: usize },
}

impl fmt::Display for RejectedCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectedCandidate::Item { id } => write!(f, "item {}", id),
            RejectedCandidate::Container { id } => write!(f, "container {}", id),
            RejectedCandidate::Group { type_tag, members } => {
                write!(f, "duplicate group ({}, {} members)", type_tag, members)
            }
        }
    }
}

/// Why a plan was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    /// Target container does not exist
    TargetMissing,
    /// Source item/container does not exist
    SourceMissing,
    /// Target exists but the caller's scope cannot see it
    Unreachable,
    /// Target is the moved container itself or one of its descendants
    Cycle,
    /// Containers never change context; relocate the items instead
    CrossContext { from: ContextId, to: ContextId },
    /// Walk of the hierarchy exceeded the configured depth guard
    DepthExceeded { limit: usize },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::TargetMissing => write!(f, "target container does not exist"),
            RejectionReason::SourceMissing => write!(f, "source does not exist"),
            RejectionReason::Unreachable => write!(f, "target is not reachable from scope"),
            RejectionReason::Cycle => {
                write!(f, "target is the container itself or one of its descendants")
            }
            RejectionReason::CrossContext { from, to } => write!(
                f,
                "container cannot move from context {} to context {}; relocate its items instead",
                from, to
            ),
            RejectionReason::DepthExceeded { limit } => {
                write!(f, "hierarchy deeper than {} levels", limit)
            }
        }
    }
}

/// Typed refusal produced during plan construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub candidate: RejectedCandidate,
    pub target: ContainerId,
    pub scope: Scope,
    #[serde(flatten)]
    pub reason: RejectionReason,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> container {} (scope {}): {}",
            self.candidate, self.target, self.scope, self.reason
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_message_names_target_and_scope() {
        let rejection = Rejection {
            candidate: RejectedCandidate::Item { id: ItemId(7) },
            target: ContainerId(42),
            scope: Scope::Context(ContextId(15)),
            reason: RejectionReason::Unreachable,
        };

        let msg = Error::ValidationRejected(rejection).to_string();
        assert!(msg.contains("item 7"));
        assert!(msg.contains("container 42"));
        assert!(msg.contains("context 15"));
        assert!(msg.contains("not reachable"));
    }

    #[test]
    fn test_non_database_error_is_not_lock_contention() {
        let err = Error::Internal("database is locked".to_string());
        assert!(!err.is_lock_contention());
    }
}
