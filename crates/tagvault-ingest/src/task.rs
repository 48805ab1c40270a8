//! Ingest task and outcome types.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tagvault_meta::{Digest, FileRecord, Timestamp};
use uuid::Uuid;

use crate::notifier::ProgressStatus;

/// Opaque identifier that lets a client follow one upload through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// One staged upload awaiting processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestTask {
    /// Client-visible identifier
    pub correlation_id: CorrelationId,
    /// Where the upload bytes were staged
    pub staged_path: PathBuf,
    /// Name the client supplied
    pub original_name: String,
    /// Tag names, already split and trimmed
    pub tags: Vec<String>,
    /// Staged thumbnail, if any
    pub thumbnail_path: Option<PathBuf>,
    /// When intake accepted the upload
    pub enqueued_at: Timestamp,
}

impl IngestTask {
    /// Creates a task with a fresh correlation id.
    pub fn new(staged_path: impl Into<PathBuf>, original_name: impl Into<String>) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            staged_path: staged_path.into(),
            original_name: original_name.into(),
            tags: Vec::new(),
            thumbnail_path: None,
            enqueued_at: Timestamp::now(),
        }
    }

    /// Attach tag names.
    pub fn with_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Attach a staged thumbnail.
    pub fn with_thumbnail(mut self, path: impl Into<PathBuf>) -> Self {
        self.thumbnail_path = Some(path.into());
        self
    }

    /// Use a specific correlation id.
    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = id;
        self
    }
}

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting in the queue
    Queued,
    /// Computing the digest
    Hashing,
    /// Looking for an existing record
    CheckingDuplicate,
    /// Claiming the digest and moving bytes into place
    Committing,
    /// Stored and tag-accounted
    Completed,
    /// Identical content existed; staged bytes discarded
    DuplicateDiscard,
    /// Aborted
    Failed,
}

impl TaskState {
    /// True for states a task never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::DuplicateDiscard | TaskState::Failed
        )
    }
}

/// Final result of processing one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new record was stored.
    Completed(FileRecord),
    /// Content already existed under `existing`.
    Duplicate {
        /// Digest of the uploaded content
        digest: Digest,
        /// Record that already held it
        existing: FileRecord,
    },
    /// Processing aborted.
    Failed {
        /// State the task was in when it failed
        at: TaskState,
        /// Human-readable cause
        reason: String,
    },
}

impl IngestOutcome {
    /// Terminal lifecycle state for this outcome.
    pub fn state(&self) -> TaskState {
        match self {
            IngestOutcome::Completed(_) => TaskState::Completed,
            IngestOutcome::Duplicate { .. } => TaskState::DuplicateDiscard,
            IngestOutcome::Failed { .. } => TaskState::Failed,
        }
    }

    /// Status reported to progress subscribers.
    pub fn progress_status(&self) -> ProgressStatus {
        match self {
            IngestOutcome::Completed(_) => ProgressStatus::Completed,
            IngestOutcome::Duplicate { .. } => ProgressStatus::Duplicate,
            IngestOutcome::Failed { .. } => ProgressStatus::Failed,
        }
    }

    /// Digest of the content, if hashing got that far.
    pub fn digest(&self) -> Option<Digest> {
        match self {
            IngestOutcome::Completed(record) => Some(record.digest),
            IngestOutcome::Duplicate { digest, .. } => Some(*digest),
            IngestOutcome::Failed { .. } => None,
        }
    }
}

/// Outcome of one task, as published by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    /// Task identifier
    pub correlation_id: CorrelationId,
    /// What happened
    pub outcome: IngestOutcome,
}
