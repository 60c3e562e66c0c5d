//! Duplicate detector
//!
//! Groups items by identity signature `(type_tag, content)` and classifies
//! every member as used (live version referenced externally) or unused.
//!
//! **Algorithm:**
//! 1. Resolve the scan scope to a container set (all, one container, or
//!    one container subtree under the depth guard)
//! 2. Keyset-scan items in id order, `scan_page_size` rows at a time,
//!    counting SHA-256 signature digests
//! 3. Scan again, collecting members only for digests seen twice or more;
//!    groups are ordered by lowest member id
//! 4. Classify usage only for the groups on the requested page
//!
//! Read-only; safe to call repeatedly while consolidation runs.

pub mod pagination;

use crate::hierarchy::descendants;
use crate::normalize::normalize;
use crate::store::{ItemFilter, Store};
use pagination::{calculate_pagination, Pagination};
use qbank_common::config::{ConsolidationConfig, MatchMode};
use qbank_common::db::models::{ContainerId, Item, ItemId, VersionId};
use qbank_common::{Error, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::sync::Arc;
use tracing::{debug, info, Instrument};

/// Separates type tag from content inside the hashed payload
const SIGNATURE_SEPARATOR: u8 = 0x1f;

/// Which items a detection run looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum DetectionScope {
    /// Every item in the bank
    All,
    /// Items directly in one container, or in its whole subtree
    Container { id: ContainerId, include_subtree: bool },
}

/// One member of a duplicate group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMember {
    pub item: ItemId,
    pub container: ContainerId,
    pub live_version: VersionId,
    /// External references on the live version
    pub references: i64,
}

impl GroupMember {
    pub fn is_used(&self) -> bool {
        self.references > 0
    }
}

/// Items sharing one identity signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    /// Hex SHA-256 of the signature payload
    pub signature: String,
    pub type_tag: String,
    /// Ordered by item id
    pub members: Vec<GroupMember>,
    pub total: usize,
    pub used_count: usize,
    pub unused_count: usize,
    /// The only members ever eligible for deletion or merge
    pub unused_ids: Vec<ItemId>,
}

impl DuplicateGroup {
    pub fn member_ids(&self) -> Vec<ItemId> {
        self.members.iter().map(|m| m.item).collect()
    }
}

/// One page of duplicate groups
#[derive(Debug, Clone, Serialize)]
pub struct GroupPage {
    pub groups: Vec<DuplicateGroup>,
    /// Number of duplicate groups in scope (all pages)
    pub total: usize,
    pub pagination: Pagination,
    /// Items examined by the scan
    pub scanned_items: usize,
}

/// Raw SHA-256 of a signature payload
pub type SignatureDigest = [u8; 32];

/// Signature of one item's content, as raw digest
///
/// Strict mode hashes the payload as stored; normalized mode hashes it
/// after label normalization.
pub fn signature_digest(mode: MatchMode, type_tag: &str, content: &str) -> SignatureDigest {
    let mut hasher = Sha256::new();
    hasher.update(type_tag.as_bytes());
    hasher.update([SIGNATURE_SEPARATOR]);
    match mode {
        MatchMode::Strict => hasher.update(content.as_bytes()),
        MatchMode::Normalized => hasher.update(normalize(content).as_bytes()),
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// Signature of one item's content, as lowercase hex
pub fn signature(mode: MatchMode, type_tag: &str, content: &str) -> String {
    to_hex(&signature_digest(mode, type_tag, content))
}

fn to_hex(digest: &SignatureDigest) -> String {
    let mut hex = String::with_capacity(64);
    for byte in digest {
        let _ = write!(hex, "{:02x}", byte);
    }
    hex
}

#[derive(Debug)]
struct Bucket {
    type_tag: String,
    members: Vec<(ItemId, ContainerId, VersionId)>,
}

pub struct DuplicateDetector {
    store: Arc<dyn Store>,
    match_mode: MatchMode,
    scan_page_size: usize,
    max_depth: usize,
}

impl DuplicateDetector {
    pub fn new(store: Arc<dyn Store>, match_mode: MatchMode) -> Self {
        Self {
            store,
            match_mode,
            scan_page_size: 1000,
            max_depth: 64,
        }
    }

    pub fn from_config(store: Arc<dyn Store>, config: &ConsolidationConfig) -> Self {
        Self {
            store,
            match_mode: config.match_mode,
            scan_page_size: config.scan_page_size.max(1),
            max_depth: config.max_tree_depth,
        }
    }

    pub fn match_mode(&self) -> MatchMode {
        self.match_mode
    }

    /// One page of duplicate groups in `scope`
    pub async fn detect(&self, scope: DetectionScope, page: usize, page_size: usize) -> Result<GroupPage> {
        self.detect_excluding(scope, page, page_size, &HashSet::new()).await
    }

    /// Like [`detect`](Self::detect), skipping groups whose signature is
    /// in `excluded` (settled or failed in an earlier bulk iteration)
    pub async fn detect_excluding(
        &self,
        scope: DetectionScope,
        page: usize,
        page_size: usize,
        excluded: &HashSet<String>,
    ) -> Result<GroupPage> {
        let span = tracing::info_span!("detector", scope = ?scope, page);
        async move {
            let container_ids = self.scope_containers(scope).await?;
            let (buckets, scanned_items) = self.scan(container_ids).await?;

            let mut groups: Vec<(String, Bucket)> = buckets
                .into_iter()
                .map(|(digest, bucket)| (to_hex(&digest), bucket))
                .filter(|(sig, _)| !excluded.contains(sig))
                .collect();
            // Members are pushed in id order, so members[0] is the lowest id
            groups.sort_by_key(|(_, bucket)| bucket.members[0].0);

            let total = groups.len();
            let pagination = calculate_pagination(total, page, page_size);

            let mut page_groups = Vec::new();
            for (sig, bucket) in groups
                .into_iter()
                .skip(pagination.offset)
                .take(pagination.page_size)
            {
                page_groups.push(self.classify(sig, bucket).await?);
            }

            info!(
                scanned_items,
                groups = total,
                page = pagination.page,
                "Duplicate detection complete"
            );

            Ok(GroupPage {
                groups: page_groups,
                total,
                pagination,
                scanned_items,
            })
        }
        .instrument(span)
        .await
    }

    /// Re-derive the largest duplicate group among `items` from current data
    pub async fn group_of(&self, items: &[ItemId]) -> Result<Option<DuplicateGroup>> {
        if items.is_empty() {
            return Ok(None);
        }
        let found = self.store.find_items(&ItemFilter::by_ids(items.to_vec())).await?;
        let mut buckets: HashMap<SignatureDigest, Bucket> = HashMap::new();
        for item in found {
            let sig = signature_digest(self.match_mode, &item.type_tag, &item.live.content);
            buckets
                .entry(sig)
                .or_insert_with(|| Bucket {
                    type_tag: item.type_tag.clone(),
                    members: Vec::new(),
                })
                .members
                .push((item.id, item.container_id, item.live.id));
        }

        let Some((sig, bucket)) = buckets.into_iter().max_by_key(|(_, b)| (b.members.len(), std::cmp::Reverse(b.members[0].0))) else {
            return Ok(None);
        };
        if bucket.members.len() < 2 {
            return Ok(None);
        }
        Ok(Some(self.classify(to_hex(&sig), bucket).await?))
    }

    async fn scope_containers(&self, scope: DetectionScope) -> Result<Option<Vec<ContainerId>>> {
        match scope {
            DetectionScope::All => Ok(None),
            DetectionScope::Container { id, include_subtree } => {
                if self.store.get_container(id).await?.is_none() {
                    return Err(Error::NotFound(format!("Container {} not found", id)));
                }
                let mut ids = vec![id];
                if include_subtree {
                    ids.extend(descendants(self.store.as_ref(), id, self.max_depth).await?);
                }
                Ok(Some(ids))
            }
        }
    }

    /// Duplicate buckets in scope, plus the number of items examined
    ///
    /// Two keyset passes: the first only counts digests, the second keeps
    /// members of digests seen at least twice. Singletons never get a
    /// bucket, so memory follows the number of duplicates rather than
    /// the size of the bank.
    async fn scan(
        &self,
        container_ids: Option<Vec<ContainerId>>,
    ) -> Result<(HashMap<SignatureDigest, Bucket>, usize)> {
        let mut counts: HashMap<SignatureDigest, u32> = HashMap::new();
        let scanned = self
            .scan_pages(&container_ids, |digest, _| {
                *counts.entry(digest).or_default() += 1;
            })
            .await?;

        let duplicated: HashSet<SignatureDigest> = counts
            .into_iter()
            .filter(|(_, count)| *count >= 2)
            .map(|(digest, _)| digest)
            .collect();
        debug!(scanned, duplicated = duplicated.len(), "Counting pass complete");

        let mut buckets: HashMap<SignatureDigest, Bucket> = HashMap::new();
        if duplicated.is_empty() {
            return Ok((buckets, scanned));
        }

        self.scan_pages(&container_ids, |digest, item| {
            if !duplicated.contains(&digest) {
                return;
            }
            buckets
                .entry(digest)
                .or_insert_with(|| Bucket {
                    type_tag: item.type_tag.clone(),
                    members: Vec::new(),
                })
                .members
                .push((item.id, item.container_id, item.live.id));
        })
        .await?;

        Ok((buckets, scanned))
    }

    /// Keyset-walk every item in scope, handing each digest to `visit`
    async fn scan_pages<F>(&self, container_ids: &Option<Vec<ContainerId>>, mut visit: F) -> Result<usize>
    where
        F: FnMut(SignatureDigest, &Item),
    {
        let mut cursor: Option<ItemId> = None;
        let mut scanned = 0usize;

        loop {
            let filter = ItemFilter {
                container_ids: container_ids.clone(),
                after_id: cursor,
                limit: Some(self.scan_page_size),
                ..Default::default()
            };
            let page = self.store.find_items(&filter).await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.id);
            let fetched = page.len();
            scanned += fetched;

            for item in &page {
                visit(signature_digest(self.match_mode, &item.type_tag, &item.live.content), item);
            }

            if fetched < self.scan_page_size {
                break;
            }
        }

        Ok(scanned)
    }

    async fn classify(&self, signature: String, bucket: Bucket) -> Result<DuplicateGroup> {
        let mut members = Vec::with_capacity(bucket.members.len());
        for (item, container, live_version) in bucket.members {
            let references = self.store.count_external_references(live_version).await?;
            members.push(GroupMember {
                item,
                container,
                live_version,
                references,
            });
        }
        members.sort_by_key(|m| m.item);

        let unused_ids: Vec<ItemId> = members.iter().filter(|m| !m.is_used()).map(|m| m.item).collect();
        let total = members.len();

        Ok(DuplicateGroup {
            signature,
            type_tag: bucket.type_tag,
            total,
            used_count: total - unused_ids.len(),
            unused_count: unused_ids.len(),
            unused_ids,
            members,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use qbank_common::db::init::init_memory_database;

    async fn seeded() -> Arc<dyn Store> {
        let pool = init_memory_database().await.unwrap();
        for sql in [
            "INSERT INTO contexts (id, level, path) VALUES (1, 'system', '/1')",
            "INSERT INTO containers (id, context_id, parent_id, name) VALUES (1, 1, NULL, 'top')",
            "INSERT INTO containers (id, context_id, parent_id, name) VALUES (2, 1, 1, 'A')",
            "INSERT INTO containers (id, context_id, parent_id, name) VALUES (3, 1, 1, 'B')",
            "INSERT INTO containers (id, context_id, parent_id, name) VALUES (4, 1, 3, 'B child')",
            "INSERT INTO items (id, container_id, type_tag) VALUES (10, 2, 'mc')",
            "INSERT INTO items (id, container_id, type_tag) VALUES (11, 3, 'mc')",
            "INSERT INTO items (id, container_id, type_tag) VALUES (12, 4, 'mc')",
            "INSERT INTO items (id, container_id, type_tag) VALUES (13, 4, 'essay')",
            "INSERT INTO item_versions (id, item_id, version, content) VALUES (100, 10, 1, '2+2=4')",
            "INSERT INTO item_versions (id, item_id, version, content) VALUES (110, 11, 1, '2+2=4')",
            "INSERT INTO item_versions (id, item_id, version, content) VALUES (120, 12, 1, '2 + 2 = 4')",
            "INSERT INTO item_versions (id, item_id, version, content) VALUES (130, 13, 1, '2+2=4')",
            "INSERT INTO external_refs (version_id, component) VALUES (110, 'quiz')",
        ] {
            sqlx::query(sql).execute(&pool).await.unwrap();
        }
        Arc::new(SqliteStore::new(pool))
    }

    #[test]
    fn test_signature_separates_type_from_content() {
        let a = signature(MatchMode::Strict, "mc", "2+2=4");
        let b = signature(MatchMode::Strict, "essay", "2+2=4");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_normalized_mode_folds_case_and_spacing() {
        assert_ne!(
            signature(MatchMode::Strict, "mc", "Paris"),
            signature(MatchMode::Strict, "mc", "  paris ")
        );
        assert_eq!(
            signature(MatchMode::Normalized, "mc", "Paris"),
            signature(MatchMode::Normalized, "mc", "  paris ")
        );
    }

    #[tokio::test]
    async fn test_strict_group_with_usage() {
        let detector = DuplicateDetector::new(seeded().await, MatchMode::Strict);

        let page = detector.detect(DetectionScope::All, 1, 50).await.unwrap();

        assert_eq!(page.total, 1);
        assert_eq!(page.scanned_items, 4);
        let group = &page.groups[0];
        assert_eq!(group.type_tag, "mc");
        assert_eq!(group.total, 2);
        assert_eq!(group.used_count, 1);
        assert_eq!(group.unused_ids, vec![ItemId(10)]);
    }

    #[tokio::test]
    async fn test_container_scope_without_subtree() {
        let detector = DuplicateDetector::new(seeded().await, MatchMode::Strict);

        let scope = DetectionScope::Container {
            id: ContainerId(3),
            include_subtree: false,
        };
        let page = detector.detect(scope, 1, 50).await.unwrap();
        assert_eq!(page.total, 0);
        assert_eq!(page.scanned_items, 1);
    }

    #[tokio::test]
    async fn test_small_scan_pages_see_every_item() {
        let mut detector = DuplicateDetector::new(seeded().await, MatchMode::Strict);
        detector.scan_page_size = 1;

        let page = detector.detect(DetectionScope::All, 1, 50).await.unwrap();
        assert_eq!(page.scanned_items, 4);
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_scan_keeps_no_singleton_buckets() {
        let mut detector = DuplicateDetector::new(seeded().await, MatchMode::Strict);
        detector.scan_page_size = 2;

        let (buckets, scanned) = detector.scan(None).await.unwrap();

        assert_eq!(scanned, 4);
        assert_eq!(buckets.len(), 1);
        let bucket = buckets.values().next().unwrap();
        let ids: Vec<ItemId> = bucket.members.iter().map(|m| m.0).collect();
        assert_eq!(ids, vec![ItemId(10), ItemId(11)]);
    }

    #[test]
    fn test_hex_signature_matches_digest() {
        let digest = signature_digest(MatchMode::Strict, "mc", "2+2=4");
        let hex = signature(MatchMode::Strict, "mc", "2+2=4");
        assert_eq!(hex, to_hex(&digest));
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn test_missing_scope_container_is_not_found() {
        let detector = DuplicateDetector::new(seeded().await, MatchMode::Strict);
        let scope = DetectionScope::Container {
            id: ContainerId(999),
            include_subtree: true,
        };
        assert!(matches!(
            detector.detect(scope, 1, 50).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_excluded_signature_is_skipped() {
        let detector = DuplicateDetector::new(seeded().await, MatchMode::Strict);
        let first = detector.detect(DetectionScope::All, 1, 50).await.unwrap();

        let excluded: HashSet<String> = first.groups.iter().map(|g| g.signature.clone()).collect();
        let again = detector
            .detect_excluding(DetectionScope::All, 1, 50, &excluded)
            .await
            .unwrap();
        assert_eq!(again.total, 0);
    }
}
