//! Core types for the TagVault metadata subsystem.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// A 32-byte content digest identifying an accepted file. Used as the dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// Return the digest as a lowercase hex string
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, MetaError> {
        let s = s.trim();
        if s.len() != 64 || !s.is_ascii() {
            return Err(MetaError::InvalidDigest(s.to_string()));
        }
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| MetaError::InvalidDigest(s.to_string()))?;
        }
        Ok(Digest(out))
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::from_hex(s)
    }
}

/// Identifier of a tag entry in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagId(u64);

impl TagId {
    /// Creates a new TagId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TagId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall-clock timestamp with nanosecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// Returns the current timestamp
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Lifecycle status of a file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileStatus {
    /// Accepted by intake, not yet picked up.
    Pending,
    /// Digest claimed by a worker; bytes are being moved into place.
    Processing,
    /// Durably stored and tag-accounted.
    Completed,
    /// Content already present under another record.
    Duplicate,
    /// Processing aborted.
    Failed,
}

impl FileStatus {
    /// Lowercase wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Processing => "processing",
            FileStatus::Completed => "completed",
            FileStatus::Duplicate => "duplicate",
            FileStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(FileStatus::Pending),
            "processing" => Ok(FileStatus::Processing),
            "completed" => Ok(FileStatus::Completed),
            "duplicate" => Ok(FileStatus::Duplicate),
            "failed" => Ok(FileStatus::Failed),
            other => Err(MetaError::Serialization(format!("unknown file status '{}'", other))),
        }
    }
}

/// Catalog entry for one accepted file, keyed by its content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Content digest (unique key)
    pub digest: Digest,
    /// Name the file was uploaded under
    pub original_name: String,
    /// Final storage location
    pub file_path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Tags attached to this file
    pub tags: Vec<TagId>,
    /// Stored thumbnail, if any
    pub thumbnail_path: Option<PathBuf>,
    /// Lifecycle status
    pub status: FileStatus,
    /// When the record was first committed
    pub created_at: Timestamp,
    /// Correlation id of the task that claimed the digest
    #[serde(default)]
    pub owner: Option<String>,
}

impl FileRecord {
    /// Creates a record in the `Processing` state, stamped with the current time.
    pub fn new(
        digest: Digest,
        original_name: impl Into<String>,
        file_path: impl Into<PathBuf>,
        size: u64,
        tags: Vec<TagId>,
    ) -> Self {
        Self {
            digest,
            original_name: original_name.into(),
            file_path: file_path.into(),
            size,
            tags,
            thumbnail_path: None,
            status: FileStatus::Processing,
            created_at: Timestamp::now(),
            owner: None,
        }
    }

    /// Records which task owns the claim.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// True if the record was claimed by the task `owner`.
    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner.as_deref() == Some(owner)
    }

    /// Sets the thumbnail location.
    pub fn with_thumbnail(mut self, path: Option<PathBuf>) -> Self {
        self.thumbnail_path = path;
        self
    }

    /// Returns true if this record counts toward tag reference totals.
    pub fn is_completed(&self) -> bool {
        self.status == FileStatus::Completed
    }

    /// Returns true if the record references the given tag.
    pub fn has_tag(&self, tag: TagId) -> bool {
        self.tags.contains(&tag)
    }
}

/// A tag and the number of completed files referencing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEntry {
    /// Tag identifier
    pub id: TagId,
    /// Unique tag name
    pub name: String,
    /// Reference count
    pub count: u64,
}

/// Errors that can occur in the metadata subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// An error occurred in the KV store layer (lock poisoned, backend unreachable).
    #[error("kv store error: {0}")]
    KvError(String),

    /// A persisted value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The journal contains a frame that passed its checksum but could not be decoded.
    #[error("corrupt journal at offset {offset}: {reason}")]
    Corrupt {
        /// Byte offset of the bad frame
        offset: u64,
        /// What went wrong
        reason: String,
    },

    /// The string is not a valid 64-character hex digest.
    #[error("invalid digest '{0}'")]
    InvalidDigest(String),

    /// Tag names must contain at least one non-whitespace character.
    #[error("invalid tag name '{0}'")]
    InvalidTagName(String),

    /// The requested tag does not exist.
    #[error("tag {0} not found")]
    TagNotFound(TagId),

    /// The requested file record does not exist.
    #[error("file record {0} not found")]
    RecordNotFound(Digest),

    /// A decrement would drive a reference count below zero.
    #[error("ledger inconsistency: tag {tag} cannot be decremented below {count}")]
    LedgerInconsistency {
        /// The tag being decremented
        tag: TagId,
        /// Its count at the time of the attempt
        count: u64,
    },

    /// A guarded write lost a race with a concurrent writer.
    #[error("conflicting concurrent update on key '{key}'")]
    Conflict {
        /// Key whose precondition failed
        key: String,
    },

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl From<bincode::Error> for MetaError {
    fn from(e: bincode::Error) -> Self {
        MetaError::Serialization(e.to_string())
    }
}

impl MetaError {
    /// True for errors meaning the backend itself is unusable rather than the request being invalid.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, MetaError::KvError(_) | MetaError::IoError(_))
    }
}
