//! Catalog integrity checker: verifies tag counts against completed records.
//!
//! Results are only meaningful at a quiescent point. A `Processing` claim
//! belonging to a live ingest is indistinguishable from one left by a crash.

use std::collections::{BTreeMap, HashSet};

use tracing::{info, warn};

use crate::kvstore::BatchOutcome;
use crate::ledger::TagLedger;
use crate::store::DedupStore;
use crate::types::{Digest, FileStatus, MetaError, TagId};

/// Types of catalog integrity issues.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FsckIssue {
    /// Stored tag count differs from the number of completed records referencing it.
    CountMismatch {
        /// The tag
        tag: TagId,
        /// Tag name
        name: String,
        /// Count derived from completed records
        expected: u64,
        /// Count stored in the ledger
        actual: u64,
    },
    /// A record references a tag that does not exist.
    DanglingTagRef {
        /// Record digest
        digest: Digest,
        /// Missing tag
        tag: TagId,
    },
    /// A record was claimed but never completed.
    StaleClaim {
        /// Record digest
        digest: Digest,
    },
}

impl std::fmt::Display for FsckIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsckIssue::CountMismatch {
                tag,
                name,
                expected,
                actual,
            } => write!(
                f,
                "Count mismatch for tag {} '{}': expected {}, got {}",
                tag, name, expected, actual
            ),
            FsckIssue::DanglingTagRef { digest, tag } => {
                write!(f, "Record {} references missing tag {}", digest, tag)
            }
            FsckIssue::StaleClaim { digest } => {
                write!(f, "Record {} left in processing state", digest)
            }
        }
    }
}

/// Outcome of a check pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FsckReport {
    /// Issues found
    pub issues: Vec<FsckIssue>,
    /// Records examined
    pub records_scanned: usize,
    /// Tags examined
    pub tags_scanned: usize,
}

impl FsckReport {
    /// True if no issues were found.
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Compare every tag count with the completed records that reference it.
pub fn check(store: &DedupStore, ledger: &TagLedger) -> Result<FsckReport, MetaError> {
    let records = store.records()?;
    let tags = ledger.all()?;
    let known: HashSet<TagId> = tags.iter().map(|t| t.id).collect();

    let mut expected: BTreeMap<TagId, u64> = BTreeMap::new();
    let mut issues = Vec::new();

    for record in &records {
        if record.status == FileStatus::Processing {
            issues.push(FsckIssue::StaleClaim {
                digest: record.digest,
            });
            continue;
        }
        for tag in &record.tags {
            if !known.contains(tag) {
                issues.push(FsckIssue::DanglingTagRef {
                    digest: record.digest,
                    tag: *tag,
                });
            } else if record.is_completed() {
                *expected.entry(*tag).or_default() += 1;
            }
        }
    }

    for tag in &tags {
        let want = expected.get(&tag.id).copied().unwrap_or(0);
        if want != tag.count {
            issues.push(FsckIssue::CountMismatch {
                tag: tag.id,
                name: tag.name.clone(),
                expected: want,
                actual: tag.count,
            });
        }
    }

    for issue in &issues {
        warn!(%issue, "fsck finding");
    }
    info!(
        records = records.len(),
        tags = tags.len(),
        issues = issues.len(),
        "fsck complete"
    );

    Ok(FsckReport {
        issues,
        records_scanned: records.len(),
        tags_scanned: tags.len(),
    })
}

/// Fix the issues in `report`. Returns the number repaired.
///
/// Stale claims are removed, dangling references are dropped from their
/// records, and mismatched counts are overwritten with the expected value.
pub fn repair(
    store: &DedupStore,
    ledger: &TagLedger,
    report: &FsckReport,
) -> Result<usize, MetaError> {
    let mut repaired = 0;
    for issue in &report.issues {
        match issue {
            FsckIssue::StaleClaim { digest } => {
                if let Some(record) = store.lookup(digest)? {
                    if record.status == FileStatus::Processing {
                        store.remove(digest)?;
                        repaired += 1;
                    }
                }
            }
            FsckIssue::DanglingTagRef { digest, tag } => {
                if let Some(record) = store.lookup(digest)? {
                    let mut next = record.clone();
                    next.tags.retain(|t| t != tag);
                    if let BatchOutcome::Applied { .. } =
                        store.compare_and_swap(&record, &next, Vec::new())?
                    {
                        repaired += 1;
                    }
                }
            }
            FsckIssue::CountMismatch { tag, expected, .. } => {
                ledger.set_count(*tag, *expected)?;
                repaired += 1;
            }
        }
    }
    info!(repaired, "fsck repair complete");
    Ok(repaired)
}
