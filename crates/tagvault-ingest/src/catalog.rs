//! Catalog maintenance: removal, retagging, listing, tag search, integrity checks.
//!
//! Every operation that changes which tags a completed record carries applies
//! the matching count deltas in the same atomic batch as the record change.
//!
//! Removal parks a record's files under tombstone names before its batch and
//! deletes only the tombstones afterwards, so a re-ingest that stores the same
//! path once the record is gone keeps its bytes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tagvault_meta::ledger::tag_from_count_key;
use tagvault_meta::{
    fsck, BatchOp, BatchOutcome, DedupStore, Digest, FileRecord, FsckIssue, FsckReport, KvStore,
    ListQuery, MetaError, Page, TagEntry, TagId, TagLedger,
};
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::intake::split_tags;
use crate::queue;
use crate::worker::{move_file, remove_if_present};

/// Read and maintenance access to stored files and tags.
#[derive(Clone)]
pub struct Catalog {
    kv: Arc<dyn KvStore>,
    store: DedupStore,
    ledger: TagLedger,
    thumbs_dir: PathBuf,
    prune_zero_count_tags: bool,
}

impl Catalog {
    /// Catalog over `kv` with the policies in `config`.
    pub fn new(kv: Arc<dyn KvStore>, config: &IngestConfig) -> Self {
        Self {
            store: DedupStore::new(kv.clone()),
            ledger: TagLedger::new(kv.clone(), config.decrement_policy),
            kv,
            thumbs_dir: config.thumbs_dir.clone(),
            prune_zero_count_tags: config.prune_zero_count_tags,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &DedupStore {
        &self.store
    }

    /// The underlying ledger.
    pub fn ledger(&self) -> &TagLedger {
        &self.ledger
    }

    /// Record for `digest`, if any.
    pub fn get(&self, digest: &Digest) -> Result<Option<FileRecord>, IngestError> {
        Ok(self.store.lookup(digest)?)
    }

    /// Delete a record and its files. If the record was completed, its tag
    /// counts drop by one in the same batch.
    pub async fn remove(&self, digest: &Digest) -> Result<FileRecord, IngestError> {
        let (record, parked) = loop {
            let current = self
                .store
                .lookup(digest)?
                .ok_or(IngestError::NotFound(*digest))?;
            let ops = if current.is_completed() {
                self.ledger.decrement_ops(&current.tags)
            } else {
                Vec::new()
            };
            let parked = Parked::park(&current).await?;
            match self.apply_counted(ops, |ops| self.store.remove_if_unchanged(&current, ops)) {
                Ok(true) => break (current, parked),
                Ok(false) => parked.restore().await,
                Err(e) => {
                    parked.restore().await;
                    return Err(e);
                }
            }
        };
        parked.discard().await;

        if record.is_completed() && self.prune_zero_count_tags {
            for tag in &record.tags {
                match self.ledger.prune_if_unused(*tag) {
                    Ok(Some(entry)) => info!(tag = %entry.name, "Pruned tag with no remaining files"),
                    Ok(None) => {}
                    Err(e) => warn!(tag = %tag, error = %e, "Could not prune tag"),
                }
            }
        }

        info!(digest = %digest, name = %record.original_name, "Removed file");
        Ok(record)
    }

    /// Replace the tags of a completed record, moving counts by the difference.
    pub fn retag(&self, digest: &Digest, raw_tags: &[String]) -> Result<FileRecord, IngestError> {
        let names = split_tags(raw_tags);

        loop {
            // Resolved on every attempt: a tag pruned since the last one conflicts the batch.
            let wanted = self.ledger.resolve_many(names.as_slice())?;
            let current = self
                .store
                .lookup(digest)?
                .ok_or(IngestError::NotFound(*digest))?;
            if !current.is_completed() {
                return Err(MetaError::Conflict {
                    key: format!("file/{}", digest),
                }
                .into());
            }

            let before: HashSet<TagId> = current.tags.iter().copied().collect();
            let after: HashSet<TagId> = wanted.iter().copied().collect();
            let removed: Vec<TagId> = current
                .tags
                .iter()
                .copied()
                .filter(|t| !after.contains(t))
                .collect();
            let added: Vec<TagId> = wanted
                .iter()
                .copied()
                .filter(|t| !before.contains(t))
                .collect();

            let mut next = current.clone();
            next.tags = wanted.clone();
            let mut ops = self.ledger.decrement_ops(&removed);
            ops.extend(self.ledger.increment_ops(&added));

            if self.apply_counted(ops, |ops| self.store.compare_and_swap(&current, &next, ops))? {
                info!(
                    digest = %digest,
                    added = added.len(),
                    removed = removed.len(),
                    "Retagged file"
                );
                return Ok(next);
            }
        }
    }

    /// Move a thumbnail into place for an existing record, replacing any previous one.
    pub async fn attach_thumbnail(
        &self,
        digest: &Digest,
        source: &Path,
    ) -> Result<FileRecord, IngestError> {
        let current = self
            .store
            .lookup(digest)?
            .ok_or(IngestError::NotFound(*digest))?;
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("jpg");
        let target = self.thumbs_dir.join(format!("{}.{}", digest.to_hex(), ext));
        move_file(source, &target).await?;

        let updated = self.store.set_thumbnail(digest, Some(target.clone()))?;
        if let Some(old) = current.thumbnail_path.filter(|p| *p != target) {
            remove_if_present(&old).await;
        }
        Ok(updated)
    }

    /// Filter, sort, and paginate records.
    pub fn list(&self, query: &ListQuery) -> Result<Page<FileRecord>, IngestError> {
        Ok(self.store.list(query)?)
    }

    /// Ids of the named tags, or `None` if any name is unknown (so no record can match).
    pub fn tag_filter(&self, names: &[String]) -> Result<Option<Vec<TagId>>, IngestError> {
        let mut ids = Vec::new();
        for name in split_tags(names) {
            match self.ledger.get_by_name(&name)? {
                Some(entry) => ids.push(entry.id),
                None => return Ok(None),
            }
        }
        Ok(Some(ids))
    }

    /// Tags whose name contains `query`, most used first.
    pub fn search_tags(&self, query: &str, limit: usize) -> Result<Vec<TagEntry>, IngestError> {
        Ok(self.ledger.search(query, limit)?)
    }

    /// Display names of a record's tags. Missing tags are skipped.
    pub fn tag_names(&self, record: &FileRecord) -> Result<Vec<String>, IngestError> {
        let mut names = Vec::with_capacity(record.tags.len());
        for id in &record.tags {
            if let Some(entry) = self.ledger.get(*id)? {
                names.push(entry.name);
            }
        }
        Ok(names)
    }

    /// Compare every tag count with the completed records referencing it.
    pub fn check(&self) -> Result<FsckReport, IngestError> {
        Ok(fsck::check(&self.store, &self.ledger)?)
    }

    /// Fix the issues in `report`, returning how many were repaired.
    ///
    /// A stale claim owned by a task still in the persisted queue is kept:
    /// replaying that task resumes it.
    pub fn repair(&self, report: &FsckReport) -> Result<usize, IngestError> {
        let queued: HashSet<String> = queue::persisted(self.kv.as_ref())?
            .into_iter()
            .map(|q| q.task.correlation_id.to_string())
            .collect();
        let mut issues = Vec::with_capacity(report.issues.len());
        for issue in &report.issues {
            if let FsckIssue::StaleClaim { digest } = issue {
                let owner = self.store.lookup(digest)?.and_then(|r| r.owner);
                if owner.is_some_and(|o| queued.contains(&o)) {
                    info!(digest = %digest, "Keeping claim of a task awaiting replay");
                    continue;
                }
            }
            issues.push(issue.clone());
        }
        let report = FsckReport {
            issues,
            ..report.clone()
        };
        Ok(fsck::repair(&self.store, &self.ledger, &report)?)
    }

    /// Delete every zero-count tag. Run only while no ingest is in flight.
    pub fn prune_unused_tags(&self) -> Result<Vec<TagEntry>, IngestError> {
        let pruned = self.ledger.prune_unused()?;
        info!(pruned = pruned.len(), "Pruned unused tags");
        Ok(pruned)
    }

    /// Apply a record change plus counter ops, honoring the decrement policy
    /// for counts already at zero. Returns false if the record changed underneath.
    fn apply_counted<F>(&self, mut ops: Vec<BatchOp>, mut attempt: F) -> Result<bool, IngestError>
    where
        F: FnMut(Vec<BatchOp>) -> Result<BatchOutcome, MetaError>,
    {
        loop {
            match attempt(ops.clone())? {
                BatchOutcome::Applied { .. } => return Ok(true),
                BatchOutcome::Conflict { .. } => return Ok(false),
                BatchOutcome::Underflow { key, current } => {
                    let tag = tag_from_count_key(&key).ok_or_else(|| {
                        MetaError::Corrupt {
                            offset: 0,
                            reason: format!(
                                "underflow on non-tag key {}",
                                String::from_utf8_lossy(&key)
                            ),
                        }
                    })?;
                    self.ledger.on_underflow(tag, current)?;
                    ops.retain(|op| {
                        !matches!(op, BatchOp::Add { key: k, delta } if *k == key && *delta < 0)
                    });
                }
            }
        }
    }
}

/// Files of a record being removed, moved aside under tombstone names.
struct Parked {
    files: Vec<(PathBuf, PathBuf)>,
}

impl Parked {
    async fn park(record: &FileRecord) -> Result<Self, IngestError> {
        let mut parked = Parked { files: Vec::new() };
        let tag = uuid::Uuid::new_v4().simple().to_string();
        for path in std::iter::once(&record.file_path).chain(record.thumbnail_path.as_ref()) {
            let mut name = path.as_os_str().to_os_string();
            name.push(format!(".removing-{}", tag));
            let tombstone = PathBuf::from(name);
            match tokio::fs::rename(path, &tombstone).await {
                Ok(()) => parked.files.push((path.clone(), tombstone)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    parked.restore().await;
                    return Err(e.into());
                }
            }
        }
        Ok(parked)
    }

    /// Put the files back; the record was not removed.
    async fn restore(self) {
        for (original, tombstone) in self.files {
            if let Err(e) = tokio::fs::rename(&tombstone, &original).await {
                warn!(path = %tombstone.display(), error = %e, "Could not restore parked file");
            }
        }
    }

    /// Delete the parked files; the record is gone.
    async fn discard(self) {
        for (original, tombstone) in self.files {
            debug!(path = %original.display(), "Deleting removed file");
            remove_if_present(&tombstone).await;
        }
    }
}
