//! Test Harness - scratch directories and a running ingest service

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tagvault_ingest::{CorrelationId, IngestConfig, IngestOutcome, IngestService, TaskReport};
use tagvault_meta::{KvStore, MemoryKvStore};
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

/// Route `tracing` output to the test writer, filtered by `RUST_LOG` (default `warn`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// A scratch directory owned by one test.
#[derive(Debug)]
pub struct TestEnv {
    temp_dir: TempDir,
    test_name: String,
}

impl TestEnv {
    /// Fresh empty directory.
    pub fn new(test_name: &str) -> Result<Self> {
        let temp_dir = tempfile::tempdir().context("failed to create temp dir")?;
        Ok(Self {
            temp_dir,
            test_name: test_name.to_string(),
        })
    }

    /// Root of the scratch directory.
    pub fn tempdir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Name given at creation.
    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// Config rooted at `<tempdir>/vault` with `workers` workers.
    pub fn config(&self, workers: usize) -> IngestConfig {
        let mut config = IngestConfig::with_root(self.tempdir().join("vault"));
        config.workers = workers;
        config
    }

    /// Write a source file outside the vault.
    pub fn write_source(&self, name: &str, data: &[u8]) -> Result<PathBuf> {
        let dir = self.tempdir().join("src");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        std::fs::write(&path, data)?;
        Ok(path)
    }
}

/// An ingest service plus a report subscription opened before any upload.
pub struct IngestHarness {
    env: TestEnv,
    service: IngestService,
    reports: broadcast::Receiver<TaskReport>,
}

impl IngestHarness {
    /// Service over an in-memory store.
    pub fn start(test_name: &str, workers: usize) -> Result<Self> {
        let env = TestEnv::new(test_name)?;
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        Self::with_env(env, workers, Some(kv))
    }

    /// Service over a journal in the scratch directory.
    pub fn start_durable(env: TestEnv, workers: usize) -> Result<Self> {
        Self::with_env(env, workers, None)
    }

    fn with_env(env: TestEnv, workers: usize, kv: Option<Arc<dyn KvStore>>) -> Result<Self> {
        init_tracing();
        let config = env.config(workers);
        tracing::debug!(test = env.test_name(), workers, "starting ingest harness");
        let service = match kv {
            Some(kv) => IngestService::start(config, kv)?,
            None => IngestService::open(config)?,
        };
        let reports = service.reports();
        Ok(Self {
            env,
            service,
            reports,
        })
    }

    /// The scratch environment.
    pub fn env(&self) -> &TestEnv {
        &self.env
    }

    /// The running service.
    pub fn service(&self) -> &IngestService {
        &self.service
    }

    /// Stage `data` as an upload named `name`.
    pub async fn upload(&self, name: &str, data: &[u8], tags: &[&str]) -> Result<CorrelationId> {
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        Ok(self
            .service
            .intake()
            .stage(data, name, Some(data.len() as u64), &tags, None)
            .await?)
    }

    /// Wait until every id in `ids` has a report.
    pub async fn wait_for(
        &mut self,
        ids: &[CorrelationId],
    ) -> Result<HashMap<CorrelationId, IngestOutcome>> {
        let mut outcomes = HashMap::with_capacity(ids.len());
        while outcomes.len() < ids.len() {
            match self.reports.recv().await {
                Ok(report) => {
                    if ids.contains(&report.correlation_id) {
                        outcomes.insert(report.correlation_id, report.outcome);
                    }
                }
                Err(RecvError::Lagged(n)) => bail!("missed {} task reports", n),
                Err(RecvError::Closed) => bail!("worker pool stopped early"),
            }
        }
        Ok(outcomes)
    }

    /// Upload and wait for one file.
    pub async fn ingest(&mut self, name: &str, data: &[u8], tags: &[&str]) -> Result<IngestOutcome> {
        let id = self.upload(name, data, tags).await?;
        let mut outcomes = self.wait_for(&[id]).await?;
        outcomes
            .remove(&id)
            .context("report missing for submitted upload")
    }

    /// Count of `tag`, or `None` if the tag does not exist.
    pub fn tag_count(&self, tag: &str) -> Result<Option<u64>> {
        Ok(self
            .service
            .catalog()
            .ledger()
            .get_by_name(tag)?
            .map(|t| t.count))
    }

    /// Regular files directly inside the data directory.
    pub fn stored_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.service.config().data_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Entries left in the staging directory.
    pub fn staged_files(&self) -> Result<usize> {
        Ok(std::fs::read_dir(&self.service.config().staging_dir)?.count())
    }

    /// Let queued work finish and stop the workers, returning the environment.
    pub async fn finish(self) -> TestEnv {
        self.service.drain().await;
        self.env
    }
}
