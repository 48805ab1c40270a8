#![warn(missing_docs)]

//! TagVault ingest subsystem: upload intake, content hashing, deduplicating worker pool
//!
//! Uploads are staged by [`UploadIntake`], queued durably, and processed by
//! [`IngestWorkerPool`] workers that hash the bytes, claim the digest in the
//! catalog, and move the file into place. Tag counts change only when a
//! record reaches `Completed`, in the same batch that completes it.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod hasher;
pub mod intake;
pub mod metrics;
pub mod notifier;
pub mod pool;
pub mod queue;
pub mod service;
pub mod task;
pub mod worker;

pub use catalog::Catalog;
pub use config::{IngestConfig, LogConfig};
pub use error::IngestError;
pub use hasher::{ContentHasher, DigestAlgorithm, HashOutput};
pub use intake::{split_tags, ThumbnailSource, UploadIntake};
pub use metrics::{IngestMetrics, MetricsSnapshot};
pub use notifier::{NullProgressSink, ProgressEvent, ProgressNotifier, ProgressSink, ProgressStatus};
pub use pool::{IngestWorkerPool, PoolHandle, PoolStats};
pub use queue::{QueuedTask, TaskQueue, TaskReceiver};
pub use service::IngestService;
pub use task::{CorrelationId, IngestOutcome, IngestTask, TaskReport, TaskState};
pub use worker::{process_task, IngestContext};
