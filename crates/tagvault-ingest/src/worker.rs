//! The per-task ingest pipeline.
//!
//! Ordering matters for the tag ledger: a digest is first claimed with a
//! `Processing` record carrying no counts, the bytes are moved into place,
//! and only then is the record promoted to `Completed` in the same atomic
//! batch that increments its tags. A task that loses the claim, or fails
//! before promotion, therefore never touches a count.
//!
//! A claim names the task that took it. A task meeting another task's claim
//! waits for it to settle and only discards its own bytes once the content is
//! `Completed`; a task meeting its own claim is a replay after a crash and
//! takes the claim back over.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tagvault_meta::{
    CommitOutcome, DedupStore, Digest, FileRecord, FileStatus, KvStore, MetaError, TagLedger,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::hasher::ContentHasher;
use crate::intake::sanitize_file_name;
use crate::metrics::IngestMetrics;
use crate::notifier::{ProgressEvent, ProgressSink, ProgressStatus};
use crate::task::{IngestOutcome, IngestTask, TaskState};

/// Share of the progress bar spent hashing; the rest is committing.
const HASHING_SHARE: u64 = 90;
const DEFAULT_THUMBNAIL_EXT: &str = "jpg";
/// How often a waiting task re-reads another task's claim.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(25);
/// Promotion attempts when tags are pruned between resolve and finalize.
const FINALIZE_ATTEMPTS: usize = 3;

/// Everything a worker needs to process tasks.
pub struct IngestContext {
    store: DedupStore,
    ledger: TagLedger,
    hasher: ContentHasher,
    progress: Arc<dyn ProgressSink>,
    metrics: Arc<IngestMetrics>,
    data_dir: PathBuf,
    thumbs_dir: PathBuf,
    claim_wait: Duration,
}

impl IngestContext {
    /// Builds a context over `kv` using the paths and policies in `config`.
    pub fn from_config(
        config: &IngestConfig,
        kv: Arc<dyn KvStore>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            store: DedupStore::new(kv.clone()),
            ledger: TagLedger::new(kv, config.decrement_policy),
            hasher: ContentHasher::new(config.hash_algorithm, config.hash_chunk_size),
            progress,
            metrics: Arc::new(IngestMetrics::new()),
            data_dir: config.data_dir.clone(),
            thumbs_dir: config.thumbs_dir.clone(),
            claim_wait: Duration::from_millis(config.claim_wait_ms),
        }
    }

    /// Share an existing metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<IngestMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Override how long a task waits on another task's claim.
    pub fn with_claim_wait(mut self, wait: Duration) -> Self {
        self.claim_wait = wait;
        self
    }

    /// The catalog.
    pub fn store(&self) -> &DedupStore {
        &self.store
    }

    /// The tag ledger.
    pub fn ledger(&self) -> &TagLedger {
        &self.ledger
    }

    /// Worker counters.
    pub fn metrics(&self) -> &Arc<IngestMetrics> {
        &self.metrics
    }

    /// Final location of content with `digest` uploaded as `name`.
    ///
    /// The digest prefix keeps distinct contents with the same name apart.
    pub fn stored_path(&self, digest: &Digest, name: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}_{}", digest.to_hex(), sanitize_file_name(name)))
    }

    /// Final location of the thumbnail staged at `staged`.
    pub fn thumbnail_target(&self, digest: &Digest, staged: &Path) -> PathBuf {
        let ext = staged
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .unwrap_or(DEFAULT_THUMBNAIL_EXT);
        self.thumbs_dir.join(format!("{}.{}", digest.to_hex(), ext))
    }
}

/// Run one task to a terminal outcome, reporting progress along the way.
///
/// Never returns an error: failures become [`IngestOutcome::Failed`]. The
/// staged bytes of a failed task are left in place for a retry.
pub async fn process_task(ctx: &IngestContext, task: &IngestTask) -> IngestOutcome {
    let id = task.correlation_id;
    ctx.progress
        .report(ProgressEvent::new(id, ProgressStatus::Processing, 0));

    let mut state = TaskState::Queued;
    let outcome = match run(ctx, task, &mut state).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(correlation_id = %id, state = ?state, error = %e, "Ingest task failed");
            IngestOutcome::Failed {
                at: state,
                reason: e.to_string(),
            }
        }
    };

    let event = match &outcome {
        IngestOutcome::Completed(record) => {
            ctx.metrics.record_completed(record.size);
            ProgressEvent::new(id, ProgressStatus::Completed, 100).with_detail(record.digest.to_hex())
        }
        IngestOutcome::Duplicate { digest, existing } => {
            ctx.metrics.record_duplicate(existing.size);
            ProgressEvent::new(id, ProgressStatus::Duplicate, 100).with_detail(digest.to_hex())
        }
        IngestOutcome::Failed { reason, .. } => {
            ctx.metrics.record_failed();
            ProgressEvent::new(id, ProgressStatus::Failed, 0).with_detail(reason.clone())
        }
    };
    ctx.progress.report(event);
    outcome
}

async fn run(
    ctx: &IngestContext,
    task: &IngestTask,
    state: &mut TaskState,
) -> Result<IngestOutcome, IngestError> {
    let id = task.correlation_id;
    let owner = id.to_string();

    if !tokio::fs::try_exists(&task.staged_path).await? {
        if let Some(done) = resume_from_catalog(ctx, task, &owner).await? {
            return Ok(IngestOutcome::Completed(done));
        }
    }

    *state = TaskState::Hashing;
    let total = tokio::fs::metadata(&task.staged_path).await?.len();
    let progress = ctx.progress.clone();
    let mut last_reported = 0u64;
    let hashed = ctx
        .hasher
        .hash_file(&task.staged_path, |done| {
            let pct = hashing_percent(done, total);
            if pct >= last_reported + 10 {
                last_reported = pct;
                progress.report(ProgressEvent::new(id, ProgressStatus::Processing, pct as u8));
            }
        })
        .await?;
    ctx.metrics.record_hashed(hashed.bytes);
    let digest = hashed.digest;
    debug!(correlation_id = %id, digest = %digest, bytes = hashed.bytes, "Hashed upload");

    // Resolving creates missing tags at count zero; counts move only on finalize.
    let tags = ctx.ledger.resolve_many(task.tags.as_slice())?;

    *state = TaskState::CheckingDuplicate;
    let file_path = ctx.stored_path(&digest, &task.original_name);
    let thumbnail_path = task
        .thumbnail_path
        .as_deref()
        .map(|p| ctx.thumbnail_target(&digest, p));
    let wanted = FileRecord::new(
        digest,
        task.original_name.clone(),
        file_path.clone(),
        hashed.bytes,
        tags,
    )
    .with_thumbnail(thumbnail_path.clone())
    .with_owner(owner.clone());

    let claim = match acquire_claim(ctx, &wanted).await? {
        Claim::Acquired(claim) => claim,
        Claim::Settled(existing) if existing.is_owned_by(&owner) => {
            // Finished by an earlier run of this task before it was acknowledged.
            remove_staged(task).await;
            return Ok(IngestOutcome::Completed(existing));
        }
        Claim::Settled(existing) => return Ok(discard_duplicate(task, digest, existing).await),
    };

    *state = TaskState::Committing;
    let placed = match place_files(task, &file_path, thumbnail_path.as_deref()).await {
        Ok(placed) => placed,
        Err(e) => {
            release_claim(ctx, &claim);
            return Err(e);
        }
    };

    match promote_claim(ctx, task, claim) {
        Ok(record) => {
            info!(
                correlation_id = %id,
                digest = %digest,
                path = %record.file_path.display(),
                tags = record.tags.len(),
                "Stored new file"
            );
            Ok(IngestOutcome::Completed(record))
        }
        Err((claim, e)) => {
            placed.restore(task).await;
            release_claim(ctx, &claim);
            Err(e)
        }
    }
}

fn hashing_percent(done: u64, total: u64) -> u64 {
    if total == 0 {
        HASHING_SHARE
    } else {
        (done.min(total) * HASHING_SHARE) / total
    }
}

enum Claim {
    /// This task holds the `Processing` claim.
    Acquired(FileRecord),
    /// The digest is already `Completed`.
    Settled(FileRecord),
}

/// Claim `wanted.digest` for this task.
///
/// A live claim held by another task is polled until it is promoted or
/// released, for at most the context's claim wait.
async fn acquire_claim(ctx: &IngestContext, wanted: &FileRecord) -> Result<Claim, IngestError> {
    let digest = wanted.digest;
    let owner = wanted.owner.as_deref().unwrap_or_default();
    let started = Instant::now();
    let mut waiting = false;
    loop {
        let existing = match ctx.store.lookup(&digest)? {
            None => match ctx.store.commit(wanted)? {
                CommitOutcome::Committed => return Ok(Claim::Acquired(wanted.clone())),
                CommitOutcome::Duplicate(existing) => existing,
            },
            Some(existing) => existing,
        };

        if existing.status != FileStatus::Processing {
            if waiting {
                debug!(digest = %digest, "Claim settled while waiting");
            }
            return Ok(Claim::Settled(existing));
        }
        if existing.is_owned_by(owner) {
            if ctx
                .store
                .compare_and_swap(&existing, wanted, Vec::new())?
                .is_applied()
            {
                info!(digest = %digest, "Took over claim left by an interrupted run");
                return Ok(Claim::Acquired(wanted.clone()));
            }
            continue;
        }

        let waited = started.elapsed();
        if waited >= ctx.claim_wait {
            return Err(IngestError::ClaimBusy {
                digest,
                waited_ms: waited.as_millis() as u64,
            });
        }
        if !waiting {
            debug!(
                digest = %digest,
                holder = existing.owner.as_deref().unwrap_or("unknown"),
                "Content claimed by another task, waiting"
            );
            waiting = true;
        }
        tokio::time::sleep(CLAIM_POLL_INTERVAL).await;
    }
}

/// Promote `claim`, re-resolving its tags if one was pruned after resolve.
///
/// On failure the claim as last written is handed back for release.
fn promote_claim(
    ctx: &IngestContext,
    task: &IngestTask,
    mut claim: FileRecord,
) -> Result<FileRecord, (FileRecord, IngestError)> {
    let mut attempt = 1;
    loop {
        let err = match ctx.store.promote(&claim, ctx.ledger.increment_ops(&claim.tags)) {
            Ok(record) => return Ok(record),
            Err(e) => e,
        };
        let retry = matches!(
            &err,
            MetaError::Conflict { key } if TagLedger::is_tag_key(key.as_bytes())
        );
        if !retry || attempt >= FINALIZE_ATTEMPTS {
            return Err((claim, err.into()));
        }
        attempt += 1;
        debug!(digest = %claim.digest, error = %err, "Tag pruned before finalize; resolving again");

        let tags = match ctx.ledger.resolve_many(task.tags.as_slice()) {
            Ok(tags) => tags,
            Err(e) => return Err((claim, e.into())),
        };
        let mut next = claim.clone();
        next.tags = tags;
        match ctx.store.compare_and_swap(&claim, &next, Vec::new()) {
            Ok(outcome) if outcome.is_applied() => claim = next,
            Ok(_) => {
                let key = format!("file/{}", claim.digest);
                return Err((claim, MetaError::Conflict { key }.into()));
            }
            Err(e) => return Err((claim, e.into())),
        }
    }
}

/// Recover a replayed task whose staged bytes are gone.
///
/// Returns the record if an earlier run of the task already completed it.
/// If the earlier run placed the bytes but never promoted its claim, they are
/// moved back to staging so the task can run again from the start.
async fn resume_from_catalog(
    ctx: &IngestContext,
    task: &IngestTask,
    owner: &str,
) -> Result<Option<FileRecord>, IngestError> {
    let Some(record) = ctx
        .store
        .records()?
        .into_iter()
        .find(|r| r.is_owned_by(owner))
    else {
        return Ok(None);
    };
    if record.is_completed() {
        info!(
            correlation_id = %task.correlation_id,
            digest = %record.digest,
            "Task already completed by an earlier run"
        );
        return Ok(Some(record));
    }
    if record.status == FileStatus::Processing && tokio::fs::try_exists(&record.file_path).await? {
        move_file(&record.file_path, &task.staged_path).await?;
        if let (Some(placed), Some(staged)) = (&record.thumbnail_path, &task.thumbnail_path) {
            if tokio::fs::try_exists(placed).await? {
                move_file(placed, staged).await?;
            }
        }
        info!(
            correlation_id = %task.correlation_id,
            digest = %record.digest,
            "Returned placed bytes of an interrupted run to staging"
        );
    }
    Ok(None)
}

async fn discard_duplicate(task: &IngestTask, digest: Digest, existing: FileRecord) -> IngestOutcome {
    info!(
        correlation_id = %task.correlation_id,
        digest = %digest,
        existing = %existing.file_path.display(),
        "Duplicate upload discarded"
    );
    remove_staged(task).await;
    IngestOutcome::Duplicate { digest, existing }
}

async fn remove_staged(task: &IngestTask) {
    remove_if_present(&task.staged_path).await;
    if let Some(thumb) = &task.thumbnail_path {
        remove_if_present(thumb).await;
    }
}

/// Drop this task's claim, leaving any record another writer put there.
fn release_claim(ctx: &IngestContext, claim: &FileRecord) {
    match ctx.store.remove_if_unchanged(claim, Vec::new()) {
        Ok(outcome) if outcome.is_applied() => {
            debug!(digest = %claim.digest, "Released claim");
        }
        Ok(_) => {}
        Err(e) => {
            warn!(digest = %claim.digest, error = %e, "Could not release claim; fsck will find it")
        }
    }
}

struct Placed {
    file: PathBuf,
    thumbnail: Option<PathBuf>,
}

impl Placed {
    /// Move placed files back to staging.
    async fn restore(self, task: &IngestTask) {
        if let Err(e) = move_file(&self.file, &task.staged_path).await {
            warn!(path = %self.file.display(), error = %e, "Could not return file to staging");
        }
        if let (Some(placed), Some(staged)) = (self.thumbnail, &task.thumbnail_path) {
            if let Err(e) = move_file(&placed, staged).await {
                warn!(path = %placed.display(), error = %e, "Could not return thumbnail to staging");
            }
        }
    }
}

async fn place_files(
    task: &IngestTask,
    file_path: &Path,
    thumbnail_path: Option<&Path>,
) -> Result<Placed, IngestError> {
    move_file(&task.staged_path, file_path).await?;
    let mut placed = Placed {
        file: file_path.to_path_buf(),
        thumbnail: None,
    };
    if let (Some(src), Some(dst)) = (&task.thumbnail_path, thumbnail_path) {
        if let Err(e) = move_file(src, dst).await {
            placed.restore(task).await;
            return Err(e.into());
        }
        placed.thumbnail = Some(dst.to_path_buf());
    }
    Ok(placed)
}

/// Rename, falling back to copy and delete across filesystems.
pub(crate) async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    let rename_err = match tokio::fs::rename(from, to).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    match tokio::fs::copy(from, to).await {
        Ok(_) => tokio::fs::remove_file(from).await,
        Err(_) => {
            let _ = tokio::fs::remove_file(to).await;
            Err(rename_err)
        }
    }
}

pub(crate) async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove file"),
    }
}
