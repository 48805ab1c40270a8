//! Error types for the tagvault-ingest subsystem

use tagvault_meta::{Digest, MetaError};

/// All errors that can occur while staging, hashing, or committing uploads
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Reading or writing file bytes failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The catalog or ledger backend could not be reached
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
    /// A tag count update violated the ledger's non-negative invariant
    #[error("Ledger inconsistency: {0}")]
    LedgerInconsistency(String),
    /// Any other metadata failure
    #[error("Metadata error: {0}")]
    Meta(MetaError),
    /// The upload stream exceeded the configured limit
    #[error("Upload exceeds limit of {limit} bytes")]
    UploadTooLarge {
        /// Configured maximum
        limit: u64,
    },
    /// The task queue has no consumers left
    #[error("Task queue closed")]
    QueueClosed,
    /// Configuration could not be loaded or is invalid
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// No record exists for the digest
    #[error("File record {0} not found")]
    NotFound(Digest),
    /// Another task kept its claim on the same content past the wait limit
    #[error("Content {digest} still being stored by another task after {waited_ms} ms")]
    ClaimBusy {
        /// The contested digest
        digest: Digest,
        /// How long this task waited
        waited_ms: u64,
    },
}

impl From<MetaError> for IngestError {
    fn from(e: MetaError) -> Self {
        match e {
            MetaError::KvError(_) | MetaError::IoError(_) => {
                IngestError::StorageUnavailable(e.to_string())
            }
            MetaError::LedgerInconsistency { .. } => IngestError::LedgerInconsistency(e.to_string()),
            MetaError::RecordNotFound(digest) => IngestError::NotFound(digest),
            other => IngestError::Meta(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagvault_meta::TagId;

    #[test]
    fn test_meta_errors_are_classified() {
        assert!(matches!(
            IngestError::from(MetaError::KvError("poisoned".into())),
            IngestError::StorageUnavailable(_)
        ));
        assert!(matches!(
            IngestError::from(MetaError::LedgerInconsistency {
                tag: TagId::new(1),
                count: 0
            }),
            IngestError::LedgerInconsistency(_)
        ));
        assert!(matches!(
            IngestError::from(MetaError::RecordNotFound(Digest([0; 32]))),
            IngestError::NotFound(_)
        ));
        assert!(matches!(
            IngestError::from(MetaError::InvalidTagName(" ".into())),
            IngestError::Meta(_)
        ));
    }
}
