//! Catalog invariants checked at quiescent points.

use std::collections::{BTreeMap, HashSet};

use anyhow::{bail, Result};
use tagvault_ingest::Catalog;
use tagvault_meta::{Digest, FileStatus, TagId};

/// Number of completed records referencing each tag.
pub fn expected_counts(catalog: &Catalog) -> Result<BTreeMap<TagId, u64>> {
    let mut counts = BTreeMap::new();
    for record in catalog.store().records()? {
        if record.status == FileStatus::Completed {
            for tag in &record.tags {
                *counts.entry(*tag).or_insert(0) += 1;
            }
        }
    }
    Ok(counts)
}

/// Every tag count equals the number of completed records referencing it.
pub fn assert_counts_consistent(catalog: &Catalog) -> Result<()> {
    let expected = expected_counts(catalog)?;
    let mut mismatches = Vec::new();
    for tag in catalog.ledger().all()? {
        let want = expected.get(&tag.id).copied().unwrap_or(0);
        if want != tag.count {
            mismatches.push(format!("{}: expected {}, stored {}", tag.name, want, tag.count));
        }
    }
    if !mismatches.is_empty() {
        bail!("tag counts out of sync: {}", mismatches.join("; "));
    }
    Ok(())
}

/// No record is stuck in `Processing` and no digest appears twice.
pub fn assert_no_stale_claims(catalog: &Catalog) -> Result<()> {
    let mut seen: HashSet<Digest> = HashSet::new();
    for record in catalog.store().records()? {
        if record.status == FileStatus::Processing {
            bail!("record {} left in processing state", record.digest);
        }
        if !seen.insert(record.digest) {
            bail!("digest {} stored twice", record.digest);
        }
    }
    Ok(())
}

/// Both invariants, plus a clean integrity check.
pub fn assert_quiescent(catalog: &Catalog) -> Result<()> {
    assert_counts_consistent(catalog)?;
    assert_no_stale_claims(catalog)?;
    let report = catalog.check()?;
    if !report.is_clean() {
        bail!("integrity check found {} issues", report.issues.len());
    }
    Ok(())
}
