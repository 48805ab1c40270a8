//! Ingest configuration, loadable from TOML or JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tagvault_meta::{DecrementPolicy, JournalConfig};

use crate::error::IngestError;
use crate::hasher::{DigestAlgorithm, DEFAULT_CHUNK_SIZE};

/// Logging output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            json: false,
        }
    }
}

/// Configuration for the ingest subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Final home of accepted files.
    pub data_dir: PathBuf,
    /// Where uploads are written before processing.
    pub staging_dir: PathBuf,
    /// Final home of thumbnails.
    pub thumbs_dir: PathBuf,
    /// Catalog journal file.
    pub metadata_path: PathBuf,
    /// Number of concurrent ingest workers.
    pub workers: usize,
    /// Bounded task queue capacity.
    pub queue_capacity: usize,
    /// Content hash function.
    pub hash_algorithm: DigestAlgorithm,
    /// Hash read granularity in bytes.
    pub hash_chunk_size: usize,
    /// Largest accepted upload in bytes.
    pub max_upload_bytes: u64,
    /// Behavior when a decrement would take a count below zero.
    pub decrement_policy: DecrementPolicy,
    /// Delete zero-count tags after removals.
    pub prune_zero_count_tags: bool,
    /// How long a task waits on another task's claim for the same content
    /// before giving up and keeping its staged bytes, in milliseconds.
    pub claim_wait_ms: u64,
    /// Catalog journal settings.
    pub journal: JournalConfig,
    /// Logging settings.
    pub log: LogConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::with_root("/data")
    }
}

impl IngestConfig {
    /// Default configuration with every directory placed under `root`.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            data_dir: root.to_path_buf(),
            staging_dir: root.join("temp"),
            thumbs_dir: root.join("thumbs"),
            metadata_path: root.join("meta").join("catalog.journal"),
            workers: 4,
            queue_capacity: 1000,
            hash_algorithm: DigestAlgorithm::default(),
            hash_chunk_size: DEFAULT_CHUNK_SIZE,
            max_upload_bytes: 100 * 1024 * 1024 * 1024,
            decrement_policy: DecrementPolicy::default(),
            prune_zero_count_tags: false,
            claim_wait_ms: 30_000,
            journal: JournalConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Load from a `.toml` or `.json` file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self, IngestError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: IngestConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| IngestError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| IngestError::Config(e.to_string()))?
            }
            _ => {
                return Err(IngestError::Config(format!(
                    "Unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pool cannot run with.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.workers == 0 {
            return Err(IngestError::Config("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(IngestError::Config("queue_capacity must be at least 1".into()));
        }
        if self.hash_chunk_size == 0 {
            return Err(IngestError::Config("hash_chunk_size must be non-zero".into()));
        }
        if self.max_upload_bytes == 0 {
            return Err(IngestError::Config("max_upload_bytes must be non-zero".into()));
        }
        Ok(())
    }

    /// Create every directory the subsystem writes to.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.staging_dir)?;
        std::fs::create_dir_all(&self.thumbs_dir)?;
        if let Some(parent) = self.metadata_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = IngestConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("/data"));
        assert_eq!(config.staging_dir, PathBuf::from("/data/temp"));
        assert_eq!(config.thumbs_dir, PathBuf::from("/data/thumbs"));
        assert_eq!(config.workers, 4);
        assert_eq!(config.hash_algorithm, DigestAlgorithm::Sha256);
        assert_eq!(config.hash_chunk_size, 1024 * 1024);
        assert_eq!(config.max_upload_bytes, 100 * 1024 * 1024 * 1024);
        assert_eq!(config.decrement_policy, DecrementPolicy::Clamp);
        assert!(!config.prune_zero_count_tags);
        assert_eq!(config.claim_wait_ms, 30_000);
        assert_eq!(config.log.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
data_dir = "/srv/vault"
staging_dir = "/srv/vault/tmp"
workers = 3
hash_algorithm = "blake3"
decrement_policy = "reject"

[log]
level = "debug"
json = true
            "#
        )
        .unwrap();

        let config = IngestConfig::from_file(file.path()).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/vault"));
        assert_eq!(config.staging_dir, PathBuf::from("/srv/vault/tmp"));
        assert_eq!(config.workers, 3);
        assert_eq!(config.hash_algorithm, DigestAlgorithm::Blake3);
        assert_eq!(config.decrement_policy, DecrementPolicy::Reject);
        assert_eq!(config.queue_capacity, 1000);
        assert!(config.log.json);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"workers": 8, "max_upload_bytes": 1024, "journal": {{"sync_on_write": false}}}}"#
        )
        .unwrap();

        let config = IngestConfig::from_file(file.path()).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.max_upload_bytes, 1024);
        assert!(!config.journal.sync_on_write);
        assert_eq!(config.journal.compact_threshold_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = IngestConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "workers = 0").unwrap();
        assert!(matches!(
            IngestConfig::from_file(file.path()),
            Err(IngestError::Config(_))
        ));
    }

    #[test]
    fn test_ensure_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let config = IngestConfig::with_root(dir.path());
        config.ensure_dirs().unwrap();
        assert!(config.staging_dir.is_dir());
        assert!(config.thumbs_dir.is_dir());
        assert!(config.metadata_path.parent().unwrap().is_dir());
    }
}
