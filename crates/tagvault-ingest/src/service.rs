//! Wires the store, queue, worker pool, intake, and catalog into one service.

use std::sync::Arc;

use tagvault_meta::{JournaledKvStore, KvStore};
use tokio::sync::broadcast;
use tracing::info;

use crate::catalog::Catalog;
use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::intake::UploadIntake;
use crate::metrics::IngestMetrics;
use crate::notifier::ProgressNotifier;
use crate::pool::{IngestWorkerPool, PoolHandle, PoolStats};
use crate::queue::{self, TaskQueue};
use crate::task::TaskReport;
use crate::worker::IngestContext;

/// A running ingest subsystem.
pub struct IngestService {
    config: IngestConfig,
    notifier: Arc<ProgressNotifier>,
    metrics: Arc<IngestMetrics>,
    queue: TaskQueue,
    intake: UploadIntake,
    catalog: Catalog,
    pool: PoolHandle,
}

impl IngestService {
    /// Open the journal at `config.metadata_path` and start the workers.
    pub fn open(config: IngestConfig) -> Result<Self, IngestError> {
        config.validate()?;
        config.ensure_dirs()?;
        let kv = JournaledKvStore::open(&config.metadata_path, config.journal.clone())?;
        info!(path = %config.metadata_path.display(), "Opened catalog journal");
        Self::start(config, Arc::new(kv))
    }

    /// Start the workers over an already opened store. Must run inside a Tokio runtime.
    pub fn start(config: IngestConfig, kv: Arc<dyn KvStore>) -> Result<Self, IngestError> {
        config.validate()?;
        config.ensure_dirs()?;

        let notifier = Arc::new(ProgressNotifier::default());
        let metrics = Arc::new(IngestMetrics::new());
        let ctx = IngestContext::from_config(&config, kv.clone(), notifier.clone())
            .with_metrics(metrics.clone());

        let (queue, receiver) = queue::channel(kv.clone(), config.queue_capacity);
        let pool = IngestWorkerPool::start(Arc::new(ctx), receiver, config.workers);
        let intake = UploadIntake::new(
            config.staging_dir.clone(),
            config.max_upload_bytes,
            queue.clone(),
            notifier.clone(),
        );
        let catalog = Catalog::new(kv, &config);

        Ok(Self {
            config,
            notifier,
            metrics,
            queue,
            intake,
            catalog,
            pool,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Upload entry point.
    pub fn intake(&self) -> &UploadIntake {
        &self.intake
    }

    /// Catalog maintenance and queries.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Progress subscriptions.
    pub fn notifier(&self) -> &Arc<ProgressNotifier> {
        &self.notifier
    }

    /// Worker counters.
    pub fn metrics(&self) -> &Arc<IngestMetrics> {
        &self.metrics
    }

    /// Pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Outcomes of tasks finished from now on.
    pub fn reports(&self) -> broadcast::Receiver<TaskReport> {
        self.pool.reports()
    }

    /// Re-deliver tasks a previous run accepted but never finished.
    pub async fn recover(&self) -> Result<usize, IngestError> {
        self.queue.recover().await
    }

    /// Process everything already queued, then stop.
    pub async fn drain(self) {
        let Self {
            queue,
            intake,
            pool,
            ..
        } = self;
        drop(intake);
        drop(queue);
        pool.join().await;
    }

    /// Stop once in-flight tasks finish; queued tasks stay persisted for [`Self::recover`].
    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }
}
