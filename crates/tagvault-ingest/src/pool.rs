//! Fixed-size worker pool draining the task queue.
//!
//! Workers share one receiver and process tasks independently. Completion
//! order is unspecified; the dedup store and tag ledger keep the catalog
//! consistent under any interleaving.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::queue::TaskReceiver;
use crate::task::{IngestOutcome, TaskReport};
use crate::worker::{process_task, IngestContext};

/// Buffer of the outcome broadcast channel.
const REPORT_BUFFER: usize = 1024;

/// Statistics tracked by the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Workers started
    pub workers: usize,
    /// Tasks currently being processed
    pub in_flight: usize,
    /// Tasks that stored a new file
    pub completed: u64,
    /// Tasks discarded as duplicates
    pub duplicates: u64,
    /// Tasks that failed
    pub failed: u64,
}

impl PoolStats {
    /// Tasks that reached a terminal outcome.
    pub fn finished(&self) -> u64 {
        self.completed + self.duplicates + self.failed
    }
}

/// Handle to a running pool.
pub struct PoolHandle {
    workers: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    stats: watch::Receiver<PoolStats>,
    reports: broadcast::Sender<TaskReport>,
}

impl PoolHandle {
    /// Snapshot of current stats.
    pub fn stats(&self) -> PoolStats {
        self.stats.borrow().clone()
    }

    /// Watch stats as they change.
    pub fn watch_stats(&self) -> watch::Receiver<PoolStats> {
        self.stats.clone()
    }

    /// Outcomes of tasks finished after this call. Subscribe before
    /// submitting to be sure of seeing a task's report.
    pub fn reports(&self) -> broadcast::Receiver<TaskReport> {
        self.reports.subscribe()
    }

    /// True while at least one worker is alive.
    pub fn is_running(&self) -> bool {
        self.workers.iter().any(|w| !w.is_finished())
    }

    /// Stop after in-flight tasks finish. Queued tasks stay persisted.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.join().await;
    }

    /// Wait for workers to exit on their own, which happens once every
    /// queue producer is dropped and the queue is drained.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Ingest worker panicked");
            }
        }
        info!("Ingest worker pool stopped");
    }
}

/// The ingest worker pool.
pub struct IngestWorkerPool;

impl IngestWorkerPool {
    /// Spawn `workers` tasks consuming from `receiver`.
    pub fn start(ctx: Arc<IngestContext>, receiver: TaskReceiver, workers: usize) -> PoolHandle {
        let workers = workers.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stats_tx, stats_rx) = watch::channel(PoolStats {
            workers,
            ..PoolStats::default()
        });
        let stats_tx = Arc::new(stats_tx);
        let (reports, _) = broadcast::channel(REPORT_BUFFER);

        let handles = (0..workers)
            .map(|index| {
                let worker = Worker {
                    index,
                    ctx: ctx.clone(),
                    receiver: receiver.clone(),
                    shutdown: shutdown_rx.clone(),
                    stats: stats_tx.clone(),
                    reports: reports.clone(),
                };
                tokio::spawn(worker.run().instrument(info_span!("ingest_worker", worker = index)))
            })
            .collect();

        info!(workers, "Ingest worker pool started");
        PoolHandle {
            workers: handles,
            shutdown: shutdown_tx,
            stats: stats_rx,
            reports,
        }
    }
}

struct Worker {
    index: usize,
    ctx: Arc<IngestContext>,
    receiver: TaskReceiver,
    shutdown: watch::Receiver<bool>,
    stats: Arc<watch::Sender<PoolStats>>,
    reports: broadcast::Sender<TaskReport>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let queued = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                next = self.receiver.pop() => match next {
                    Some(queued) => queued,
                    None => break,
                },
            };

            let id = queued.task.correlation_id;
            self.stats.send_modify(|s| s.in_flight += 1);
            let outcome = process_task(&self.ctx, &queued.task)
                .instrument(info_span!("ingest_task", correlation_id = %id))
                .await;

            // A missed ack only means the task is replayed, and replay
            // of a finished task resolves as a duplicate.
            if let Err(e) = self.receiver.ack(&queued) {
                warn!(correlation_id = %id, error = %e, "Could not acknowledge task");
            }
            self.stats.send_modify(|s| {
                s.in_flight -= 1;
                match &outcome {
                    IngestOutcome::Completed(_) => s.completed += 1,
                    IngestOutcome::Duplicate { .. } => s.duplicates += 1,
                    IngestOutcome::Failed { .. } => s.failed += 1,
                }
            });
            let _ = self.reports.send(TaskReport {
                correlation_id: id,
                outcome,
            });
        }
        debug!(worker = self.index, "Ingest worker exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::notifier::NullProgressSink;
    use crate::queue;
    use crate::task::IngestTask;
    use tagvault_meta::{KvStore, MemoryKvStore};

    #[tokio::test]
    async fn test_pool_processes_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let config = IngestConfig::with_root(dir.path());
        config.ensure_dirs().unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let ctx = Arc::new(IngestContext::from_config(
            &config,
            kv.clone(),
            Arc::new(NullProgressSink),
        ));
        let (queue, rx) = queue::channel(kv, 8);
        let pool = IngestWorkerPool::start(ctx, rx, 2);
        let mut reports = pool.reports();

        for i in 0..4u8 {
            let path = config.staging_dir.join(format!("f{}", i));
            std::fs::write(&path, [i % 2]).unwrap();
            queue
                .submit(IngestTask::new(path, format!("f{}", i)))
                .await
                .unwrap();
        }
        for _ in 0..4 {
            reports.recv().await.unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.workers, 2);
        assert_eq!(stats.finished(), 4);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.duplicates, 2);
        assert_eq!(stats.in_flight, 0);
        assert!(queue.pending().unwrap().is_empty());

        drop(queue);
        pool.join().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_workers() {
        let dir = tempfile::tempdir().unwrap();
        let config = IngestConfig::with_root(dir.path());
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let ctx = Arc::new(IngestContext::from_config(
            &config,
            kv.clone(),
            Arc::new(NullProgressSink),
        ));
        let (_queue, rx) = queue::channel(kv, 8);
        let pool = IngestWorkerPool::start(ctx, rx, 3);
        assert!(pool.is_running());
        pool.shutdown().await;
    }
}
