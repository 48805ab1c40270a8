//! Ingest counters, exportable in Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lock-free counters updated by the workers.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    tasks_completed: AtomicU64,
    tasks_duplicate: AtomicU64,
    tasks_failed: AtomicU64,
    bytes_hashed: AtomicU64,
    bytes_stored: AtomicU64,
    bytes_deduplicated: AtomicU64,
}

/// Point-in-time copy of [`IngestMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Tasks that produced a new record
    pub tasks_completed: u64,
    /// Tasks discarded as duplicates
    pub tasks_duplicate: u64,
    /// Tasks that failed
    pub tasks_failed: u64,
    /// Bytes read by the hasher
    pub bytes_hashed: u64,
    /// Bytes of newly stored files
    pub bytes_stored: u64,
    /// Bytes not stored because identical content existed
    pub bytes_deduplicated: u64,
}

impl MetricsSnapshot {
    /// Fraction of hashed bytes that turned out to be duplicates.
    pub fn dedup_ratio(&self) -> f64 {
        if self.bytes_hashed == 0 {
            0.0
        } else {
            self.bytes_deduplicated as f64 / self.bytes_hashed as f64
        }
    }

    /// Render in Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let rows = [
            ("tagvault_ingest_completed_total", "Tasks that stored a new file", self.tasks_completed),
            ("tagvault_ingest_duplicate_total", "Tasks discarded as duplicates", self.tasks_duplicate),
            ("tagvault_ingest_failed_total", "Tasks that failed", self.tasks_failed),
            ("tagvault_ingest_bytes_hashed_total", "Bytes read by the hasher", self.bytes_hashed),
            ("tagvault_ingest_bytes_stored_total", "Bytes of newly stored files", self.bytes_stored),
            ("tagvault_ingest_bytes_deduplicated_total", "Bytes skipped as duplicates", self.bytes_deduplicated),
        ];
        let mut out = String::new();
        for (name, help, value) in rows {
            out.push_str(&format!("# HELP {} {}\n# TYPE {} counter\n{} {}\n", name, help, name, name, value));
        }
        out
    }
}

impl IngestMetrics {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes consumed by hashing.
    pub fn record_hashed(&self, bytes: u64) {
        self.bytes_hashed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A new file was stored.
    pub fn record_completed(&self, bytes: u64) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_stored.fetch_add(bytes, Ordering::Relaxed);
    }

    /// An upload duplicated existing content.
    pub fn record_duplicate(&self, bytes: u64) {
        self.tasks_duplicate.fetch_add(1, Ordering::Relaxed);
        self.bytes_deduplicated.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A task failed.
    pub fn record_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy of the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_duplicate: self.tasks_duplicate.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            bytes_hashed: self.bytes_hashed.load(Ordering::Relaxed),
            bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            bytes_deduplicated: self.bytes_deduplicated.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters() {
        let m = IngestMetrics::new();
        m.record_hashed(100);
        m.record_hashed(100);
        m.record_completed(100);
        m.record_duplicate(100);
        m.record_failed();
        let s = m.snapshot();
        assert_eq!(s.tasks_completed, 1);
        assert_eq!(s.tasks_duplicate, 1);
        assert_eq!(s.tasks_failed, 1);
        assert_eq!(s.bytes_hashed, 200);
        assert!((s.dedup_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_ratio() {
        assert_eq!(MetricsSnapshot::default().dedup_ratio(), 0.0);
    }

    #[test]
    fn test_prometheus_text() {
        let m = IngestMetrics::new();
        m.record_completed(42);
        let text = m.snapshot().to_prometheus();
        assert!(text.contains("# TYPE tagvault_ingest_completed_total counter"));
        assert!(text.contains("tagvault_ingest_bytes_stored_total 42"));
    }

    #[test]
    fn test_concurrent_updates() {
        let m = Arc::new(IngestMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_failed();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.snapshot().tasks_failed, 8000);
    }
}
