//! Content-bank models
//!
//! Contexts, containers ("categories"), items ("questions") with their
//! version chain, and the external references that pin item versions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Context (isolation boundary) identifier
    ContextId
);
id_type!(
    /// Container ("category") identifier
    ContainerId
);
id_type!(
    /// Item ("question") identifier
    ItemId
);
id_type!(
    /// Item version identifier
    VersionId
);

/// Level of a context in the platform hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextLevel {
    System,
    Coursecat,
    Course,
    Module,
}

impl ContextLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextLevel::System => "system",
            ContextLevel::Coursecat => "coursecat",
            ContextLevel::Course => "course",
            ContextLevel::Module => "module",
        }
    }
}

impl FromStr for ContextLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(ContextLevel::System),
            "coursecat" => Ok(ContextLevel::Coursecat),
            "course" => Ok(ContextLevel::Course),
            "module" => Ok(ContextLevel::Module),
            other => Err(format!("unknown context level: {}", other)),
        }
    }
}

/// Isolation boundary; read-only for the consolidation core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub id: ContextId,
    pub level: ContextLevel,
    pub instance_id: i64,
    /// Slash-separated ancestor chain ending in this context, e.g. `/1/3/15`
    pub path: String,
    pub name: String,
}

impl Context {
    /// Ancestor-or-self context ids parsed from `path`, root first
    pub fn lineage(&self) -> Vec<ContextId> {
        self.path
            .split('/')
            .filter_map(|segment| segment.parse::<i64>().ok())
            .map(ContextId)
            .collect()
    }

    /// True if `other` is this context or one of its ancestors
    pub fn sees(&self, other: ContextId) -> bool {
        self.lineage().contains(&other)
    }
}

/// Node of the per-context hierarchy holding items
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub context_id: ContextId,
    pub parent_id: Option<ContainerId>,
    pub name: String,
    /// Free-text, human-authored description
    pub info: String,
}

/// Lifecycle status of one item version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Ready,
    Hidden,
    Draft,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Ready => "ready",
            VersionStatus::Hidden => "hidden",
            VersionStatus::Draft => "draft",
        }
    }
}

impl FromStr for VersionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(VersionStatus::Ready),
            "hidden" => Ok(VersionStatus::Hidden),
            "draft" => Ok(VersionStatus::Draft),
            other => Err(format!("unknown version status: {}", other)),
        }
    }
}

/// Live (latest) version of an item, with its payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemVersion {
    pub id: VersionId,
    pub number: i64,
    pub status: VersionStatus,
    pub content: String,
}

/// Reusable content unit; belongs to exactly one container at a time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub container_id: ContainerId,
    pub type_tag: String,
    pub live: ItemVersion,
    /// Every version id of the item, oldest first (includes `live.id`)
    pub version_ids: Vec<VersionId>,
}

/// "Used by" pointer from outside the bank at one item version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRef {
    pub id: i64,
    pub version_id: VersionId,
    pub component: String,
    pub usage_label: String,
}

/// What the caller is allowed to see
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Site administrator: every context
    System,
    /// Caller acting from one context (course, activity, ...)
    Context(ContextId),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::System => write!(f, "system"),
            Scope::Context(id) => write!(f, "context {}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(path: &str) -> Context {
        Context {
            id: ContextId(15),
            level: ContextLevel::Course,
            instance_id: 2,
            path: path.to_string(),
            name: "Course".to_string(),
        }
    }

    #[test]
    fn test_lineage_parses_path() {
        let ctx = context("/1/3/15");
        assert_eq!(ctx.lineage(), vec![ContextId(1), ContextId(3), ContextId(15)]);
    }

    #[test]
    fn test_sees_ancestors_not_siblings() {
        let ctx = context("/1/3/15");
        assert!(ctx.sees(ContextId(1)));
        assert!(ctx.sees(ContextId(15)));
        assert!(!ctx.sees(ContextId(4)));
    }

    #[test]
    fn test_level_round_trip_through_str() {
        for level in [
            ContextLevel::System,
            ContextLevel::Coursecat,
            ContextLevel::Course,
            ContextLevel::Module,
        ] {
            assert_eq!(level.as_str().parse::<ContextLevel>().unwrap(), level);
        }
        assert!("galaxy".parse::<ContextLevel>().is_err());
    }
}
