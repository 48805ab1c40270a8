//! Upload intake: stages incoming bytes and enqueues an ingest task.
//!
//! Intake returns as soon as the task is queued. It never waits for hashing
//! or deduplication, so a client gets its correlation id immediately.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::IngestError;
use crate::hasher::DEFAULT_CHUNK_SIZE;
use crate::notifier::{ProgressEvent, ProgressSink, ProgressStatus};
use crate::queue::TaskQueue;
use crate::task::{CorrelationId, IngestTask};
use crate::worker::remove_if_present;

const FALLBACK_NAME: &str = "upload.bin";

/// Split comma-separated tag strings, trimming whitespace and dropping empties.
///
/// `["a, b", " ,c"]` becomes `["a", "b", "c"]`.
pub fn split_tags<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    raw.iter()
        .flat_map(|s| s.as_ref().split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Reduce a client-supplied name to a bare file name safe to join onto a directory.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        FALLBACK_NAME.to_string()
    } else {
        base.chars().filter(|c| !c.is_control()).collect()
    }
}

/// Thumbnail accompanying an upload.
#[derive(Debug, Clone)]
pub enum ThumbnailSource {
    /// Raw image bytes and their file extension.
    Bytes {
        /// Image data
        data: Vec<u8>,
        /// Extension without the dot, e.g. `jpg`
        extension: String,
    },
    /// A file already on disk; it is copied into staging.
    File(PathBuf),
}

/// Accepts uploads and hands them to the worker pool.
#[derive(Clone)]
pub struct UploadIntake {
    staging_dir: PathBuf,
    max_upload_bytes: u64,
    queue: TaskQueue,
    progress: Arc<dyn ProgressSink>,
}

impl UploadIntake {
    /// Creates an intake that stages under `staging_dir`.
    pub fn new(
        staging_dir: impl Into<PathBuf>,
        max_upload_bytes: u64,
        queue: TaskQueue,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            max_upload_bytes,
            queue,
            progress,
        }
    }

    /// Stream an upload into staging and enqueue it.
    ///
    /// `declared_len` only drives upload progress; the limit is enforced on
    /// the bytes actually received. On any error the partial file is removed.
    pub async fn stage<R>(
        &self,
        reader: R,
        original_name: &str,
        declared_len: Option<u64>,
        raw_tags: &[String],
        thumbnail: Option<ThumbnailSource>,
    ) -> Result<CorrelationId, IngestError>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(len) = declared_len {
            if len > self.max_upload_bytes {
                return Err(IngestError::UploadTooLarge {
                    limit: self.max_upload_bytes,
                });
            }
        }

        let id = CorrelationId::new();
        let name = sanitize_file_name(original_name);
        let staged = self.staging_dir.join(format!("{}_{}", id, name));

        if let Err(e) = self.write_staged(reader, &staged, id, declared_len).await {
            remove_if_present(&staged).await;
            return Err(e);
        }

        let thumbnail_path = match thumbnail {
            Some(source) => match self.stage_thumbnail(source, id).await {
                Ok(path) => Some(path),
                Err(e) => {
                    remove_if_present(&staged).await;
                    return Err(e);
                }
            },
            None => None,
        };

        let result = self
            .enqueue_with_id(id, staged.clone(), original_name, raw_tags, thumbnail_path.clone())
            .await;
        if result.is_err() {
            remove_if_present(&staged).await;
            if let Some(thumb) = &thumbnail_path {
                remove_if_present(thumb).await;
            }
        }
        result
    }

    /// Stage a local file by copying it.
    pub async fn stage_file(
        &self,
        path: &Path,
        raw_tags: &[String],
        thumbnail: Option<ThumbnailSource>,
    ) -> Result<CorrelationId, IngestError> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.stage(file, &name, Some(len), raw_tags, thumbnail)
            .await
    }

    /// Enqueue bytes that are already staged.
    pub async fn enqueue(
        &self,
        staged_path: PathBuf,
        original_name: &str,
        raw_tags: &[String],
        thumbnail_path: Option<PathBuf>,
    ) -> Result<CorrelationId, IngestError> {
        self.enqueue_with_id(
            CorrelationId::new(),
            staged_path,
            original_name,
            raw_tags,
            thumbnail_path,
        )
        .await
    }

    async fn enqueue_with_id(
        &self,
        id: CorrelationId,
        staged_path: PathBuf,
        original_name: &str,
        raw_tags: &[String],
        thumbnail_path: Option<PathBuf>,
    ) -> Result<CorrelationId, IngestError> {
        let mut task = IngestTask::new(staged_path, sanitize_file_name(original_name))
            .with_correlation_id(id)
            .with_tags(split_tags(raw_tags));
        task.thumbnail_path = thumbnail_path;

        let tags = task.tags.len();
        // Reported before submit: once queued, a worker's events may follow at any time.
        self.progress
            .report(ProgressEvent::new(id, ProgressStatus::Uploading, 100));
        if let Err(e) = self.queue.submit(task).await {
            self.progress.report(
                ProgressEvent::new(id, ProgressStatus::Failed, 0).with_detail(e.to_string()),
            );
            return Err(e);
        }
        info!(correlation_id = %id, name = original_name, tags, "Upload accepted");
        Ok(id)
    }

    async fn write_staged<R>(
        &self,
        mut reader: R,
        staged: &Path,
        id: CorrelationId,
        declared_len: Option<u64>,
    ) -> Result<u64, IngestError>
    where
        R: AsyncRead + Unpin,
    {
        let mut out = tokio::fs::File::create(staged).await?;
        let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
        let mut written = 0u64;
        let mut last_reported = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            written += n as u64;
            if written > self.max_upload_bytes {
                return Err(IngestError::UploadTooLarge {
                    limit: self.max_upload_bytes,
                });
            }
            out.write_all(&buf[..n]).await?;

            if let Some(total) = declared_len.filter(|t| *t > 0) {
                let pct = (written.min(total) * 99) / total;
                if pct >= last_reported + 10 {
                    last_reported = pct;
                    self.progress
                        .report(ProgressEvent::new(id, ProgressStatus::Uploading, pct as u8));
                }
            }
        }
        out.flush().await?;
        out.sync_all().await?;
        debug!(correlation_id = %id, bytes = written, path = %staged.display(), "Upload staged");
        Ok(written)
    }

    async fn stage_thumbnail(
        &self,
        source: ThumbnailSource,
        id: CorrelationId,
    ) -> Result<PathBuf, IngestError> {
        match source {
            ThumbnailSource::Bytes { data, extension } => {
                let ext = extension.trim_start_matches('.');
                let path = self.staging_dir.join(format!("{}_thumb.{}", id, ext));
                tokio::fs::write(&path, data).await?;
                Ok(path)
            }
            ThumbnailSource::File(src) => {
                let ext = src
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "jpg".to_string());
                let path = self.staging_dir.join(format!("{}_thumb.{}", id, ext));
                tokio::fs::copy(&src, &path).await?;
                Ok(path)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{NullProgressSink, ProgressNotifier};
    use crate::queue::{self, TaskReceiver};
    use tagvault_meta::{KvStore, MemoryKvStore};
    use tempfile::TempDir;

    fn setup(max: u64) -> (TempDir, UploadIntake, TaskReceiver) {
        let dir = tempfile::tempdir().unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let (queue, rx) = queue::channel(kv, 16);
        let intake = UploadIntake::new(dir.path(), max, queue, Arc::new(NullProgressSink));
        (dir, intake, rx)
    }

    #[test]
    fn test_split_tags() {
        let raw = vec!["a, b".to_string(), " ,c,, ".to_string(), "d".to_string()];
        assert_eq!(split_tags(&raw), vec!["a", "b", "c", "d"]);
        assert!(split_tags::<String>(&[]).is_empty());
        assert!(split_tags(&[" , "]).is_empty());
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("photo.jpg"), "photo.jpg");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\x\\doc.pdf"), "doc.pdf");
        assert_eq!(sanitize_file_name(""), FALLBACK_NAME);
        assert_eq!(sanitize_file_name("dir/"), FALLBACK_NAME);
        assert_eq!(sanitize_file_name(".."), FALLBACK_NAME);
    }

    #[tokio::test]
    async fn test_stage_enqueues_task() {
        let (_dir, intake, rx) = setup(1024);
        let tags = vec!["x, y".to_string()];
        let id = intake
            .stage(&b"hello"[..], "greeting.txt", Some(5), &tags, None)
            .await
            .unwrap();

        let queued = rx.pop().await.unwrap();
        assert_eq!(queued.task.correlation_id, id);
        assert_eq!(queued.task.original_name, "greeting.txt");
        assert_eq!(queued.task.tags, vec!["x", "y"]);
        assert_eq!(std::fs::read(&queued.task.staged_path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_oversize_upload_rejected_and_cleaned() {
        let (dir, intake, _rx) = setup(4);
        let err = intake
            .stage(&b"too many bytes"[..], "big", None, &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::UploadTooLarge { limit: 4 }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let err = intake
            .stage(&b""[..], "big", Some(5), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::UploadTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_thumbnail_bytes_are_staged() {
        let (_dir, intake, rx) = setup(1024);
        let thumb = ThumbnailSource::Bytes {
            data: b"img".to_vec(),
            extension: ".png".into(),
        };
        intake
            .stage(&b"video"[..], "v.mp4", None, &[], Some(thumb))
            .await
            .unwrap();
        let queued = rx.pop().await.unwrap();
        let thumb_path = queued.task.thumbnail_path.unwrap();
        assert_eq!(thumb_path.extension().unwrap(), "png");
        assert_eq!(std::fs::read(thumb_path).unwrap(), b"img");
    }

    #[tokio::test]
    async fn test_stage_file_and_progress() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.bin");
        std::fs::write(&src, vec![9u8; 3000]).unwrap();

        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let (queue, rx) = queue::channel(kv, 4);
        let notifier = Arc::new(ProgressNotifier::default());
        let mut all = notifier.subscribe_all();
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let intake = UploadIntake::new(&staging, u64::MAX, queue, notifier.clone());

        let id = intake.stage_file(&src, &[], None).await.unwrap();
        let queued = rx.pop().await.unwrap();
        assert_eq!(queued.task.original_name, "source.bin");
        assert!(src.exists(), "source is copied, not moved");

        let event = all.recv().await.unwrap();
        assert_eq!(event.correlation_id, id);
        assert_eq!(event.status, ProgressStatus::Uploading);
    }

    /// Records each event together with the number of tasks queued when it was sent.
    struct QueueAwareSink {
        queue: TaskQueue,
        seen: std::sync::Mutex<Vec<(ProgressStatus, u8, usize)>>,
    }

    impl ProgressSink for QueueAwareSink {
        fn report(&self, event: ProgressEvent) {
            let queued = self.queue.pending().unwrap().len();
            self.seen
                .lock()
                .unwrap()
                .push((event.status, event.percent, queued));
        }
    }

    #[tokio::test]
    async fn test_upload_complete_reported_before_task_is_queued() {
        let dir = tempfile::tempdir().unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let (queue, rx) = queue::channel(kv, 4);
        let sink = Arc::new(QueueAwareSink {
            queue: queue.clone(),
            seen: Default::default(),
        });
        let intake = UploadIntake::new(dir.path(), 1024, queue, sink.clone());

        intake
            .stage(&b"ordered"[..], "o.txt", Some(7), &[], None)
            .await
            .unwrap();
        rx.pop().await.unwrap();

        let seen = sink.seen.lock().unwrap().clone();
        let last = *seen.last().unwrap();
        assert_eq!(last, (ProgressStatus::Uploading, 100, 0));
        assert!(seen.iter().all(|(_, _, queued)| *queued == 0));
    }

    #[tokio::test]
    async fn test_closed_queue_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let (queue, rx) = queue::channel(kv, 4);
        drop(rx);
        let sink = Arc::new(QueueAwareSink {
            queue: queue.clone(),
            seen: Default::default(),
        });
        let intake = UploadIntake::new(dir.path(), 1024, queue, sink.clone());

        let err = intake
            .stage(&b"nowhere"[..], "n.txt", None, &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::QueueClosed));
        let seen = sink.seen.lock().unwrap().clone();
        assert_eq!(seen.last().unwrap().0, ProgressStatus::Failed);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_prestaged() {
        let (dir, intake, rx) = setup(1024);
        let staged = dir.path().join("pre");
        std::fs::write(&staged, b"x").unwrap();
        intake
            .enqueue(staged.clone(), "pre", &["t".to_string()], None)
            .await
            .unwrap();
        assert_eq!(rx.pop().await.unwrap().task.staged_path, staged);
    }
}
