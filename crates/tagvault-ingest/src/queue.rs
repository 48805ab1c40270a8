//! Bounded task queue backed by the catalog store.
//!
//! Every accepted task is persisted under `queue/<seq>` before it enters the
//! in-memory channel and is acknowledged (deleted) once a worker reaches a
//! terminal outcome. Tasks still persisted at startup were accepted by a
//! previous run but never finished, and are replayed by [`TaskQueue::recover`].

use std::sync::Arc;

use tagvault_meta::{CounterUpdate, KvStore, MetaError};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::task::IngestTask;

const QUEUE_PREFIX: &str = "queue/";
const QUEUE_SEQ_KEY: &[u8] = b"seq/queue";

fn queue_key(seq: u64) -> Vec<u8> {
    format!("{}{:016x}", QUEUE_PREFIX, seq).into_bytes()
}

/// A task together with its durable sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    /// Position in the durable queue
    pub seq: u64,
    /// The task
    pub task: IngestTask,
}

/// Producer side of the queue.
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::Sender<QueuedTask>,
    kv: Arc<dyn KvStore>,
}

/// Consumer side, shared by all workers.
#[derive(Clone)]
pub struct TaskReceiver {
    inner: Arc<Mutex<mpsc::Receiver<QueuedTask>>>,
    kv: Arc<dyn KvStore>,
}

/// Creates a queue holding at most `capacity` undelivered tasks in memory.
pub fn channel(kv: Arc<dyn KvStore>, capacity: usize) -> (TaskQueue, TaskReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        TaskQueue {
            sender,
            kv: kv.clone(),
        },
        TaskReceiver {
            inner: Arc::new(Mutex::new(receiver)),
            kv,
        },
    )
}

/// Tasks persisted in `kv` but not yet acknowledged, oldest first.
pub fn persisted(kv: &dyn KvStore) -> Result<Vec<QueuedTask>, IngestError> {
    let mut out = Vec::new();
    for (key, value) in kv.scan_prefix(QUEUE_PREFIX.as_bytes())? {
        let hex = String::from_utf8_lossy(&key[QUEUE_PREFIX.len()..]).into_owned();
        let seq = match u64::from_str_radix(&hex, 16) {
            Ok(seq) => seq,
            Err(_) => {
                warn!(key = %String::from_utf8_lossy(&key), "Skipping malformed queue key");
                continue;
            }
        };
        let task: IngestTask = bincode::deserialize(&value).map_err(MetaError::from)?;
        out.push(QueuedTask { seq, task });
    }
    Ok(out)
}

impl TaskQueue {
    /// Persist and enqueue a task. Waits while the queue is full.
    pub async fn submit(&self, task: IngestTask) -> Result<u64, IngestError> {
        let seq = match self.kv.counter_add(QUEUE_SEQ_KEY, 1)? {
            CounterUpdate::Applied(seq) => seq,
            CounterUpdate::Underflow(current) => {
                return Err(MetaError::KvError(format!(
                    "queue sequence refused increment at {}",
                    current
                ))
                .into())
            }
        };
        let key = queue_key(seq);
        self.kv
            .put(key.clone(), bincode::serialize(&task).map_err(MetaError::from)?)?;

        let correlation_id = task.correlation_id;
        if self.sender.send(QueuedTask { seq, task }).await.is_err() {
            self.kv.delete(&key)?;
            return Err(IngestError::QueueClosed);
        }
        debug!(seq, %correlation_id, "Task enqueued");
        Ok(seq)
    }

    /// Tasks persisted but not yet acknowledged, oldest first.
    pub fn pending(&self) -> Result<Vec<QueuedTask>, IngestError> {
        persisted(self.kv.as_ref())
    }

    /// Re-deliver every persisted task. Call once at startup, before new
    /// submissions, with workers already consuming.
    pub async fn recover(&self) -> Result<usize, IngestError> {
        let pending = self.pending()?;
        let n = pending.len();
        for queued in pending {
            self.sender
                .send(queued)
                .await
                .map_err(|_| IngestError::QueueClosed)?;
        }
        if n > 0 {
            info!(tasks = n, "Recovered unfinished ingest tasks");
        }
        Ok(n)
    }

    /// True once every receiver has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl TaskReceiver {
    /// Next task, or `None` once all producers are dropped and the queue is drained.
    pub async fn pop(&self) -> Option<QueuedTask> {
        self.inner.lock().await.recv().await
    }

    /// Mark a task finished so it is not replayed.
    pub fn ack(&self, queued: &QueuedTask) -> Result<(), IngestError> {
        self.kv.delete(&queue_key(queued.seq))?;
        Ok(())
    }
}
