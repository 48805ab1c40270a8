//! Deduplication store: the catalog of accepted files keyed by content digest.
//!
//! At most one record exists per digest. Uniqueness is enforced by an
//! absent-key precondition inside the KV store's atomic batch, so two workers
//! racing on identical content resolve to exactly one `Committed`.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::kvstore::{BatchOp, BatchOutcome, KvStore};
use crate::types::{Digest, FileRecord, FileStatus, MetaError, TagId};

const FILE_PREFIX: &str = "file/";

/// Largest page a listing may request.
pub const MAX_PAGE_SIZE: usize = 100;
/// Page size used when the caller does not specify one.
pub const DEFAULT_PAGE_SIZE: usize = 10;

fn file_key(digest: &Digest) -> Vec<u8> {
    format!("{}{}", FILE_PREFIX, digest.to_hex()).into_bytes()
}

/// Result of a commit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// This caller's record is now the one stored for the digest.
    Committed,
    /// A record for the digest already existed; it is returned unchanged.
    Duplicate(FileRecord),
}

/// Field a listing is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortKey {
    /// Creation timestamp
    #[default]
    CreatedAt,
    /// Original file name
    Name,
}

/// Listing direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    /// Smallest first
    Ascending,
    /// Largest first
    #[default]
    Descending,
}

/// Filter, sort, and page selection for [`DedupStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    /// Records must carry every one of these tags.
    pub tags: Vec<TagId>,
    /// Case-insensitive substring of the original name.
    pub name_contains: Option<String>,
    /// Only records in this status.
    pub status: Option<FileStatus>,
    /// Sort field
    pub sort: SortKey,
    /// Sort direction
    pub order: SortOrder,
    /// 1-based page number
    pub page: usize,
    /// Items per page, clamped to `1..=MAX_PAGE_SIZE`
    pub page_size: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            name_contains: None,
            status: Some(FileStatus::Completed),
            sort: SortKey::default(),
            order: SortOrder::default(),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ListQuery {
    fn matches(&self, record: &FileRecord, needle: Option<&str>) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if !self.tags.iter().all(|t| record.has_tag(*t)) {
            return false;
        }
        match needle {
            Some(n) => record.original_name.to_lowercase().contains(n),
            None => true,
        }
    }

    fn compare(&self, a: &FileRecord, b: &FileRecord) -> Ordering {
        let primary = match self.sort {
            SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
            SortKey::Name => a.original_name.cmp(&b.original_name),
        };
        let primary = match self.order {
            SortOrder::Ascending => primary,
            SortOrder::Descending => primary.reverse(),
        };
        primary.then_with(|| a.digest.cmp(&b.digest))
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// Number of items matching the filter across all pages
    pub total: usize,
    /// 1-based page number
    pub page: usize,
    /// Effective page size
    pub page_size: usize,
}

impl<T> Page<T> {
    /// Number of pages needed to show `total` items.
    pub fn total_pages(&self) -> usize {
        if self.page_size == 0 {
            0
        } else {
            self.total.div_ceil(self.page_size)
        }
    }
}

/// Catalog of file records keyed by digest.
#[derive(Clone)]
pub struct DedupStore {
    kv: Arc<dyn KvStore>,
}

impl DedupStore {
    /// Create a store over the given KV backend.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Find the record for a digest.
    pub fn lookup(&self, digest: &Digest) -> Result<Option<FileRecord>, MetaError> {
        match self.kv.get(&file_key(digest))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Insert `record` unless a record for its digest already exists.
    pub fn commit(&self, record: &FileRecord) -> Result<CommitOutcome, MetaError> {
        let key = file_key(&record.digest);
        let value = bincode::serialize(record)?;
        loop {
            let outcome = self.kv.write_batch(vec![
                BatchOp::Expect {
                    key: key.clone(),
                    value: None,
                },
                BatchOp::Put {
                    key: key.clone(),
                    value: value.clone(),
                },
            ])?;
            match outcome {
                BatchOutcome::Applied { .. } => {
                    debug!(digest = %record.digest, status = %record.status, "Committed file record");
                    return Ok(CommitOutcome::Committed);
                }
                BatchOutcome::Conflict { .. } => {
                    // The winner may have been removed again between our batch and this read.
                    if let Some(existing) = self.lookup(&record.digest)? {
                        debug!(digest = %record.digest, "Commit found existing record");
                        return Ok(CommitOutcome::Duplicate(existing));
                    }
                }
                BatchOutcome::Underflow { .. } => {
                    return Err(MetaError::Conflict {
                        key: String::from_utf8_lossy(&key).into_owned(),
                    })
                }
            }
        }
    }

    /// Replace `current` with `next` in one batch together with `extra` ops,
    /// provided the stored record still equals `current`.
    pub fn compare_and_swap(
        &self,
        current: &FileRecord,
        next: &FileRecord,
        extra: Vec<BatchOp>,
    ) -> Result<BatchOutcome, MetaError> {
        let key = file_key(&current.digest);
        let mut ops = Vec::with_capacity(extra.len() + 2);
        ops.push(BatchOp::Expect {
            key: key.clone(),
            value: Some(bincode::serialize(current)?),
        });
        ops.push(BatchOp::Put {
            key,
            value: bincode::serialize(next)?,
        });
        ops.extend(extra);
        self.kv.write_batch(ops)
    }

    /// Delete `current` in one batch together with `extra` ops, provided the
    /// stored record still equals it.
    pub fn remove_if_unchanged(
        &self,
        current: &FileRecord,
        extra: Vec<BatchOp>,
    ) -> Result<BatchOutcome, MetaError> {
        let key = file_key(&current.digest);
        let mut ops = Vec::with_capacity(extra.len() + 2);
        ops.push(BatchOp::Expect {
            key: key.clone(),
            value: Some(bincode::serialize(current)?),
        });
        ops.push(BatchOp::Delete { key });
        ops.extend(extra);
        self.kv.write_batch(ops)
    }

    /// Promote the claimed record for `digest` to `Completed`, applying `extra` in the same batch.
    pub fn finalize(&self, digest: &Digest, extra: Vec<BatchOp>) -> Result<FileRecord, MetaError> {
        let current = self
            .lookup(digest)?
            .ok_or(MetaError::RecordNotFound(*digest))?;
        self.promote(&current, extra)
    }

    /// Promote exactly `claim` to `Completed`, applying `extra` in the same batch.
    ///
    /// Fails with [`MetaError::Conflict`] if the stored record is no longer
    /// `claim` or a precondition in `extra` does not hold.
    pub fn promote(&self, claim: &FileRecord, extra: Vec<BatchOp>) -> Result<FileRecord, MetaError> {
        let mut next = claim.clone();
        next.status = FileStatus::Completed;
        match self.compare_and_swap(claim, &next, extra)? {
            BatchOutcome::Applied { .. } => {
                debug!(digest = %claim.digest, tags = next.tags.len(), "Finalized file record");
                Ok(next)
            }
            BatchOutcome::Conflict { key } | BatchOutcome::Underflow { key, .. } => {
                Err(MetaError::Conflict {
                    key: String::from_utf8_lossy(&key).into_owned(),
                })
            }
        }
    }

    /// Set or clear the thumbnail of an existing record.
    pub fn set_thumbnail(
        &self,
        digest: &Digest,
        thumbnail: Option<PathBuf>,
    ) -> Result<FileRecord, MetaError> {
        loop {
            let current = self
                .lookup(digest)?
                .ok_or(MetaError::RecordNotFound(*digest))?;
            let mut next = current.clone();
            next.thumbnail_path = thumbnail.clone();
            if self.compare_and_swap(&current, &next, Vec::new())?.is_applied() {
                debug!(digest = %digest, "Updated thumbnail path");
                return Ok(next);
            }
        }
    }

    /// Remove the record for a digest, returning it.
    pub fn remove(&self, digest: &Digest) -> Result<Option<FileRecord>, MetaError> {
        match self.kv.delete(&file_key(digest))? {
            Some(bytes) => {
                let record: FileRecord = bincode::deserialize(&bytes)?;
                debug!(digest = %digest, status = %record.status, "Removed file record");
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Every record, in digest order.
    pub fn records(&self) -> Result<Vec<FileRecord>, MetaError> {
        self.kv
            .scan_prefix(FILE_PREFIX.as_bytes())?
            .into_iter()
            .map(|(_, v)| bincode::deserialize(&v).map_err(MetaError::from))
            .collect()
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<usize, MetaError> {
        Ok(self.kv.scan_prefix(FILE_PREFIX.as_bytes())?.len())
    }

    /// Filter, sort, and paginate records.
    ///
    /// The page is cut from a single prefix scan, so for a fixed query the
    /// result is stable as long as no records are written in between.
    pub fn list(&self, query: &ListQuery) -> Result<Page<FileRecord>, MetaError> {
        let page = query.page.max(1);
        let page_size = query.page_size.clamp(1, MAX_PAGE_SIZE);
        let needle = query
            .name_contains
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let mut matching: Vec<FileRecord> = self
            .records()?
            .into_iter()
            .filter(|r| query.matches(r, needle.as_deref()))
            .collect();
        matching.sort_by(|a, b| query.compare(a, b));

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();

        Ok(Page {
            items,
            total,
            page,
            page_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::{decode_counter, MemoryKvStore};
    use crate::types::Timestamp;
    use std::thread;

    fn store() -> DedupStore {
        DedupStore::new(Arc::new(MemoryKvStore::new()))
    }

    fn record(byte: u8, name: &str, tags: &[u64]) -> FileRecord {
        FileRecord::new(
            Digest([byte; 32]),
            name,
            format!("/data/{}", name),
            100,
            tags.iter().map(|t| TagId::new(*t)).collect(),
        )
    }

    fn completed(byte: u8, name: &str, tags: &[u64], secs: u64) -> FileRecord {
        let mut r = record(byte, name, tags);
        r.status = FileStatus::Completed;
        r.created_at = Timestamp { secs, nanos: 0 };
        r
    }

    #[test]
    fn test_commit_then_lookup() {
        let store = store();
        let rec = record(1, "a.zip", &[]);
        assert_eq!(store.commit(&rec).unwrap(), CommitOutcome::Committed);
        assert_eq!(store.lookup(&rec.digest).unwrap(), Some(rec));
    }

    #[test]
    fn test_second_commit_is_duplicate() {
        let store = store();
        let first = record(1, "a.zip", &[1]);
        let second = record(1, "b.zip", &[2]);
        store.commit(&first).unwrap();
        match store.commit(&second).unwrap() {
            CommitOutcome::Duplicate(existing) => assert_eq!(existing.original_name, "a.zip"),
            other => panic!("expected duplicate, got {:?}", other),
        }
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_concurrent_commits_single_winner() {
        let store = store();
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || store.commit(&record(9, &format!("copy{}.zip", i), &[])).unwrap())
            })
            .collect();
        let outcomes: Vec<CommitOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = outcomes
            .iter()
            .filter(|o| **o == CommitOutcome::Committed)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_finalize_applies_extra_ops_atomically() {
        let kv = Arc::new(MemoryKvStore::new());
        let store = DedupStore::new(kv.clone());
        let rec = record(2, "b.zip", &[]);
        store.commit(&rec).unwrap();

        let done = store
            .finalize(
                &rec.digest,
                vec![BatchOp::Add {
                    key: b"counter".to_vec(),
                    delta: 1,
                }],
            )
            .unwrap();
        assert!(done.is_completed());
        assert_eq!(decode_counter(kv.get(b"counter").unwrap().as_deref()).unwrap(), 1);
        assert!(store.lookup(&rec.digest).unwrap().unwrap().is_completed());
    }

    #[test]
    fn test_promote_requires_unchanged_claim() {
        let store = store();
        let claim = record(7, "g.zip", &[]).with_owner("task-1");
        store.commit(&claim).unwrap();

        let mut replaced = claim.clone();
        replaced.owner = Some("task-2".into());
        assert!(store
            .compare_and_swap(&claim, &replaced, Vec::new())
            .unwrap()
            .is_applied());
        assert!(matches!(
            store.promote(&claim, Vec::new()),
            Err(MetaError::Conflict { .. })
        ));

        let done = store.promote(&replaced, Vec::new()).unwrap();
        assert!(done.is_completed());
        assert!(done.is_owned_by("task-2"));
    }

    #[test]
    fn test_finalize_missing_record() {
        let store = store();
        assert!(matches!(
            store.finalize(&Digest([3; 32]), Vec::new()),
            Err(MetaError::RecordNotFound(_))
        ));
    }

    #[test]
    fn test_remove_then_recommit() {
        let store = store();
        let rec = record(4, "d.zip", &[]);
        store.commit(&rec).unwrap();
        assert_eq!(store.remove(&rec.digest).unwrap(), Some(rec.clone()));
        assert_eq!(store.remove(&rec.digest).unwrap(), None);
        assert_eq!(store.commit(&rec).unwrap(), CommitOutcome::Committed);
    }

    #[test]
    fn test_remove_if_unchanged() {
        let kv = Arc::new(MemoryKvStore::new());
        let store = DedupStore::new(kv.clone());
        let rec = record(6, "f.zip", &[]);
        store.commit(&rec).unwrap();

        let mut stale = rec.clone();
        stale.original_name = "other.zip".into();
        assert!(matches!(
            store.remove_if_unchanged(&stale, Vec::new()).unwrap(),
            BatchOutcome::Conflict { .. }
        ));

        let op = BatchOp::Add {
            key: b"counter".to_vec(),
            delta: 2,
        };
        assert!(store.remove_if_unchanged(&rec, vec![op]).unwrap().is_applied());
        assert!(store.lookup(&rec.digest).unwrap().is_none());
        assert_eq!(decode_counter(kv.get(b"counter").unwrap().as_deref()).unwrap(), 2);
    }

    #[test]
    fn test_set_thumbnail() {
        let store = store();
        let rec = record(5, "e.zip", &[]);
        store.commit(&rec).unwrap();
        let updated = store
            .set_thumbnail(&rec.digest, Some(PathBuf::from("/thumbs/e.jpg")))
            .unwrap();
        assert_eq!(updated.thumbnail_path, Some(PathBuf::from("/thumbs/e.jpg")));
    }

    #[test]
    fn test_list_filters_and_sorts() {
        let store = store();
        store.commit(&completed(1, "alpha.zip", &[1, 2], 10)).unwrap();
        store.commit(&completed(2, "beta.zip", &[1], 20)).unwrap();
        store.commit(&completed(3, "gamma.rar", &[2], 30)).unwrap();
        store.commit(&record(4, "pending.zip", &[1, 2])).unwrap();

        let page = store.list(&ListQuery::default()).unwrap();
        assert_eq!(page.total, 3);
        let names: Vec<_> = page.items.iter().map(|r| r.original_name.as_str()).collect();
        assert_eq!(names, vec!["gamma.rar", "beta.zip", "alpha.zip"]);

        let tagged = store
            .list(&ListQuery {
                tags: vec![TagId::new(1), TagId::new(2)],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(tagged.total, 1);
        assert_eq!(tagged.items[0].original_name, "alpha.zip");

        let by_name = store
            .list(&ListQuery {
                name_contains: Some("ZIP".into()),
                sort: SortKey::Name,
                order: SortOrder::Ascending,
                ..Default::default()
            })
            .unwrap();
        let names: Vec<_> = by_name.items.iter().map(|r| r.original_name.as_str()).collect();
        assert_eq!(names, vec!["alpha.zip", "beta.zip"]);

        let any_status = store
            .list(&ListQuery {
                status: None,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(any_status.total, 4);
    }

    #[test]
    fn test_list_pagination() {
        let store = store();
        for i in 0..25u8 {
            store
                .commit(&completed(i + 1, &format!("f{:02}.zip", i), &[], i as u64))
                .unwrap();
        }
        let query = ListQuery {
            page: 3,
            page_size: 10,
            ..Default::default()
        };
        let page = store.list(&query).unwrap();
        assert_eq!(page.total, 25);
        assert_eq!(page.total_pages(), 3);
        assert_eq!(page.items.len(), 5);
        assert_eq!(store.list(&query).unwrap(), page);

        let clamped = store
            .list(&ListQuery {
                page: 0,
                page_size: 1000,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(clamped.page, 1);
        assert_eq!(clamped.page_size, MAX_PAGE_SIZE);
        assert_eq!(clamped.items.len(), 25);
    }
}
