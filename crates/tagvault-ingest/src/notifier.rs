//! Progress notification: publishes per-task status events to interested clients.
//!
//! Delivery is best-effort. A slow or vanished subscriber never blocks or
//! fails the worker that reports the event.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::task::CorrelationId;

/// Default per-subscriber buffer.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

/// Client-visible status of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    /// Bytes are arriving at intake
    Uploading,
    /// A worker is hashing or committing
    Processing,
    /// Stored and tag-accounted
    Completed,
    /// Identical content already existed
    Duplicate,
    /// Processing aborted
    Failed,
}

impl ProgressStatus {
    /// True for the last event a task produces.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressStatus::Completed | ProgressStatus::Duplicate | ProgressStatus::Failed
        )
    }
}

/// One progress update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Task the event belongs to
    pub correlation_id: CorrelationId,
    /// Current status
    pub status: ProgressStatus,
    /// 0..=100
    pub percent: u8,
    /// Digest, failure reason, or other detail
    pub detail: Option<String>,
}

impl ProgressEvent {
    /// Creates an event; `percent` is clamped to 100.
    pub fn new(correlation_id: CorrelationId, status: ProgressStatus, percent: u8) -> Self {
        Self {
            correlation_id,
            status,
            percent: percent.min(100),
            detail: None,
        }
    }

    /// Attach a detail string.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Receiver of progress events. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    /// Publish one event.
    fn report(&self, event: ProgressEvent);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn report(&self, _event: ProgressEvent) {}
}

/// Fan-out notifier with per-task and firehose subscriptions.
pub struct ProgressNotifier {
    subscribers: DashMap<CorrelationId, Vec<mpsc::Sender<ProgressEvent>>>,
    all: broadcast::Sender<ProgressEvent>,
    buffer: usize,
}

impl Default for ProgressNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl ProgressNotifier {
    /// Creates a notifier whose subscriptions each buffer `buffer` events.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(1);
        let (all, _) = broadcast::channel(buffer);
        Self {
            subscribers: DashMap::new(),
            all,
            buffer,
        }
    }

    /// Follow one task. The channel closes after its terminal event.
    pub fn subscribe(&self, id: CorrelationId) -> mpsc::Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.entry(id).or_default().push(tx);
        rx
    }

    /// Follow every task. Lagging receivers lose the oldest events.
    pub fn subscribe_all(&self) -> broadcast::Receiver<ProgressEvent> {
        self.all.subscribe()
    }

    /// Number of live per-task subscriptions for `id`.
    pub fn subscriber_count(&self, id: &CorrelationId) -> usize {
        self.subscribers.get(id).map(|s| s.len()).unwrap_or(0)
    }

    /// Convenience wrapper around [`ProgressSink::report`].
    pub fn notify(&self, id: CorrelationId, status: ProgressStatus, percent: u8) {
        self.report(ProgressEvent::new(id, status, percent));
    }
}

impl ProgressSink for ProgressNotifier {
    fn report(&self, event: ProgressEvent) {
        trace!(
            correlation_id = %event.correlation_id,
            status = ?event.status,
            percent = event.percent,
            "progress"
        );
        // No receivers is not an error.
        let _ = self.all.send(event.clone());

        let id = event.correlation_id;
        let terminal = event.status.is_terminal();
        let drained = match self.subscribers.get_mut(&id) {
            Some(mut senders) => {
                senders.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(correlation_id = %id, "Subscriber full, dropping progress event");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
                senders.is_empty()
            }
            None => false,
        };
        if terminal || drained {
            self.subscribers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_until_terminal() {
        let notifier = ProgressNotifier::default();
        let id = CorrelationId::new();
        let mut rx = notifier.subscribe(id);

        notifier.notify(id, ProgressStatus::Processing, 10);
        notifier.report(ProgressEvent::new(id, ProgressStatus::Completed, 100).with_detail("abc"));
        notifier.notify(id, ProgressStatus::Processing, 50);

        assert_eq!(rx.recv().await.unwrap().percent, 10);
        let last = rx.recv().await.unwrap();
        assert_eq!(last.status, ProgressStatus::Completed);
        assert_eq!(last.detail.as_deref(), Some("abc"));
        assert!(rx.recv().await.is_none());
        assert_eq!(notifier.subscriber_count(&id), 0);
    }

    #[tokio::test]
    async fn test_other_ids_not_delivered() {
        let notifier = ProgressNotifier::default();
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        let mut rx = notifier.subscribe(a);
        notifier.notify(b, ProgressStatus::Processing, 1);
        notifier.notify(a, ProgressStatus::Failed, 0);
        assert_eq!(rx.recv().await.unwrap().correlation_id, a);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let notifier = ProgressNotifier::default();
        let id = CorrelationId::new();
        drop(notifier.subscribe(id));
        assert_eq!(notifier.subscriber_count(&id), 1);
        notifier.notify(id, ProgressStatus::Processing, 5);
        assert_eq!(notifier.subscriber_count(&id), 0);
    }

    #[test]
    fn test_full_subscriber_does_not_block() {
        let notifier = ProgressNotifier::new(1);
        let id = CorrelationId::new();
        let _rx = notifier.subscribe(id);
        for pct in 0..10 {
            notifier.notify(id, ProgressStatus::Processing, pct);
        }
        assert_eq!(notifier.subscriber_count(&id), 1);
    }

    #[tokio::test]
    async fn test_subscribe_all() {
        let notifier = ProgressNotifier::default();
        let mut all = notifier.subscribe_all();
        let id = CorrelationId::new();
        notifier.notify(id, ProgressStatus::Uploading, 250);
        let event = all.recv().await.unwrap();
        assert_eq!(event.percent, 100);
        assert_eq!(event.status, ProgressStatus::Uploading);
    }

    #[test]
    fn test_report_without_subscribers() {
        let notifier = ProgressNotifier::default();
        notifier.notify(CorrelationId::new(), ProgressStatus::Duplicate, 100);
        NullProgressSink.report(ProgressEvent::new(
            CorrelationId::new(),
            ProgressStatus::Failed,
            0,
        ));
    }
}
