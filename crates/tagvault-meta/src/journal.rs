//! Journaled KV store: the durable backend for the catalog and tag ledger.
//!
//! Every applied batch is appended to a single log file as one frame and
//! synced before the call returns. On open the log is replayed into memory.
//!
//! Frame layout: `[len: u32 LE][crc32: u32 LE][payload: bincode(JournalRecord)]`.
//! A torn or checksum-failing frame marks the end of the usable log; the file
//! is truncated back to the last good frame.
//!
//! A sibling `<path>.lock` file is held under an exclusive advisory lock for
//! the lifetime of the store, so only one process appends to a journal.
//! A frame that cannot be written and synced is cut off the file again; if
//! that also fails the store refuses further writes until it is reopened.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::kvstore::{
    apply_mutations, plan_batch, scan_map, BatchOp, BatchOutcome, Key, KvPair, KvStore, Mutation,
    Planned, Value,
};
use crate::types::MetaError;

const FRAME_HEADER_LEN: usize = 8;

/// Configuration for the journaled store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// fsync after every appended frame.
    pub sync_on_write: bool,
    /// Rewrite the log as a snapshot once it grows past this many bytes (0 disables).
    pub compact_threshold_bytes: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            compact_threshold_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Statistics for the journal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalStats {
    /// Frames replayed when the journal was opened.
    pub frames_replayed: u64,
    /// Frames appended since open.
    pub frames_appended: u64,
    /// Current size of the log file in bytes.
    pub log_bytes: u64,
    /// Number of compactions performed since open.
    pub compactions: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalRecord {
    sequence: u64,
    mutations: Vec<Mutation>,
}

struct JournalState {
    data: BTreeMap<Key, Value>,
    file: File,
    next_sequence: u64,
    stats: JournalStats,
    /// Set when the log tail no longer matches memory; writes are refused.
    poisoned: Option<String>,
    #[cfg(test)]
    fault: Option<Fault>,
}

/// Injected I/O failures for tests.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// Write half the frame, then fail.
    TornWrite,
    /// Write the whole frame, then fail the sync.
    SyncFails,
    /// Like `TornWrite`, and the rollback truncate fails too.
    TornWriteNoRollback,
    /// Fail the next compaction before the rename.
    CompactFails,
}

/// KV store whose mutations are durably logged before being acknowledged.
pub struct JournaledKvStore {
    path: PathBuf,
    config: JournalConfig,
    state: RwLock<JournalState>,
    _lock: File,
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}

impl JournaledKvStore {
    /// Open (or create) the journal at `path` and replay its contents.
    pub fn open(path: impl AsRef<Path>, config: JournalConfig) -> Result<Self, MetaError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let lock = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path(&path))?;
        if let Err(e) = try_lock_exclusive(&lock) {
            return Err(if e.kind() == std::io::ErrorKind::WouldBlock {
                MetaError::KvError(format!(
                    "journal {} is in use by another process",
                    path.display()
                ))
            } else {
                e.into()
            });
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut data = BTreeMap::new();
        let (good_len, frames, last_sequence) = replay(&bytes, &mut data)?;
        if (good_len as usize) < bytes.len() {
            warn!(
                path = %path.display(),
                good_len,
                file_len = bytes.len(),
                "Truncating torn journal tail"
            );
            file.set_len(good_len)?;
            file.sync_all()?;
        }

        info!(
            path = %path.display(),
            frames,
            keys = data.len(),
            "Opened journaled store"
        );

        Ok(Self {
            path,
            config,
            state: RwLock::new(JournalState {
                data,
                file,
                next_sequence: last_sequence + 1,
                stats: JournalStats {
                    frames_replayed: frames,
                    frames_appended: 0,
                    log_bytes: good_len,
                    compactions: 0,
                },
                poisoned: None,
                #[cfg(test)]
                fault: None,
            }),
            _lock: lock,
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of journal statistics.
    pub fn stats(&self) -> JournalStats {
        self.state
            .read()
            .map(|s| s.stats.clone())
            .unwrap_or_default()
    }

    /// Rewrite the log as a single snapshot frame holding the live key set.
    pub fn compact(&self) -> Result<(), MetaError> {
        let mut state = self
            .state
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        check_poisoned(&state)?;
        self.compact_locked(&mut state)
    }

    fn compact_locked(&self, state: &mut JournalState) -> Result<(), MetaError> {
        let tmp_path = self.path.with_extension("compact");
        let record = JournalRecord {
            sequence: state.next_sequence,
            mutations: state
                .data
                .iter()
                .map(|(k, v)| Mutation::Put {
                    key: k.clone(),
                    value: v.clone(),
                })
                .collect(),
        };
        let frame = encode_frame(&record)?;
        if let Err(e) = write_snapshot(state, &tmp_path, &frame) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        std::fs::rename(&tmp_path, &self.path)?;

        // The old descriptor now points at an unlinked file.
        match OpenOptions::new().read(true).append(true).open(&self.path) {
            Ok(file) => state.file = file,
            Err(e) => {
                state.poisoned = Some(format!("reopen after compaction failed: {}", e));
                return Err(e.into());
            }
        }
        state.next_sequence += 1;
        state.stats.log_bytes = frame.len() as u64;
        state.stats.compactions += 1;
        debug!(
            keys = state.data.len(),
            bytes = frame.len(),
            "Compacted journal"
        );
        Ok(())
    }

    fn append_locked(
        &self,
        state: &mut JournalState,
        mutations: Vec<Mutation>,
    ) -> Result<(), MetaError> {
        if mutations.is_empty() {
            return Ok(());
        }
        check_poisoned(state)?;
        let record = JournalRecord {
            sequence: state.next_sequence,
            mutations,
        };
        let frame = encode_frame(&record)?;
        if let Err(e) = write_frame(state, &frame, self.config.sync_on_write) {
            self.rollback_tail(state, &e);
            return Err(e.into());
        }
        state.next_sequence += 1;
        state.stats.frames_appended += 1;
        state.stats.log_bytes += frame.len() as u64;

        apply_mutations(&mut state.data, record.mutations);

        // The frame is durable; a failed compaction only leaves the log long.
        if self.config.compact_threshold_bytes > 0
            && state.stats.log_bytes > self.config.compact_threshold_bytes
        {
            if let Err(e) = self.compact_locked(state) {
                warn!(path = %self.path.display(), error = %e, "Journal compaction failed");
            }
        }
        Ok(())
    }

    /// Cut a failed frame off the log so later frames stay replayable.
    fn rollback_tail(&self, state: &mut JournalState, cause: &std::io::Error) {
        let good_len = state.stats.log_bytes;
        match truncate_to(state, good_len) {
            Ok(()) => warn!(
                path = %self.path.display(),
                good_len,
                error = %cause,
                "Journal append failed; tail rolled back"
            ),
            Err(e) => {
                error!(
                    path = %self.path.display(),
                    error = %e,
                    "Journal rollback failed; refusing further writes"
                );
                state.poisoned = Some(format!("append failed ({}), rollback failed ({})", cause, e));
            }
        }
    }
}

fn check_poisoned(state: &JournalState) -> Result<(), MetaError> {
    match &state.poisoned {
        Some(reason) => Err(MetaError::KvError(format!("journal unusable: {}", reason))),
        None => Ok(()),
    }
}

fn write_frame(state: &mut JournalState, frame: &[u8], sync: bool) -> std::io::Result<()> {
    #[cfg(test)]
    match state.fault {
        Some(Fault::TornWrite) | Some(Fault::TornWriteNoRollback) => {
            state.file.write_all(&frame[..frame.len() / 2])?;
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected torn write"));
        }
        Some(Fault::SyncFails) => {
            state.file.write_all(frame)?;
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected sync failure"));
        }
        _ => {}
    }
    state.file.write_all(frame)?;
    if sync {
        state.file.sync_data()?;
    }
    Ok(())
}

fn truncate_to(state: &mut JournalState, len: u64) -> std::io::Result<()> {
    #[cfg(test)]
    if state.fault == Some(Fault::TornWriteNoRollback) {
        return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected truncate failure"));
    }
    state.file.set_len(len)?;
    state.file.sync_all()
}

fn write_snapshot(state: &JournalState, tmp_path: &Path, frame: &[u8]) -> std::io::Result<()> {
    #[cfg(test)]
    if state.fault == Some(Fault::CompactFails) {
        return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected compaction failure"));
    }
    #[cfg(not(test))]
    let _ = state;
    let mut tmp = File::create(tmp_path)?;
    tmp.write_all(frame)?;
    tmp.sync_all()
}

fn encode_frame(record: &JournalRecord) -> Result<Vec<u8>, MetaError> {
    let payload = bincode::serialize(record)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| MetaError::Serialization("journal frame exceeds 4 GiB".to_string()))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Replay frames into `data`. Returns (length of the valid prefix, frames replayed, last sequence).
fn replay(bytes: &[u8], data: &mut BTreeMap<Key, Value>) -> Result<(u64, u64, u64), MetaError> {
    let mut offset = 0usize;
    let mut frames = 0u64;
    let mut last_sequence = 0u64;

    while offset + FRAME_HEADER_LEN <= bytes.len() {
        let len = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
        let crc = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]);
        let start = offset + FRAME_HEADER_LEN;
        let end = match start.checked_add(len) {
            Some(end) if end <= bytes.len() => end,
            _ => break,
        };
        let payload = &bytes[start..end];
        if crc32fast::hash(payload) != crc {
            warn!(offset, "Journal frame checksum mismatch");
            break;
        }
        let record: JournalRecord =
            bincode::deserialize(payload).map_err(|e| MetaError::Corrupt {
                offset: offset as u64,
                reason: e.to_string(),
            })?;
        last_sequence = record.sequence;
        apply_mutations(data, record.mutations);
        frames += 1;
        offset = end;
    }

    Ok((offset as u64, frames, last_sequence))
}

impl KvStore for JournaledKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError> {
        let state = self
            .state
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(state.data.get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<(), MetaError> {
        let mut state = self
            .state
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        self.append_locked(&mut state, vec![Mutation::Put { key, value }])
    }

    fn delete(&self, key: &[u8]) -> Result<Option<Value>, MetaError> {
        let mut state = self
            .state
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        let previous = state.data.get(key).cloned();
        if previous.is_some() {
            self.append_locked(&mut state, vec![Mutation::Delete { key: key.to_vec() }])?;
        }
        Ok(previous)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let state = self
            .state
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(scan_map(&state.data, prefix))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<BatchOutcome, MetaError> {
        let mut state = self
            .state
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        match plan_batch(&state.data, ops)? {
            Planned::Ready {
                mutations,
                counters,
            } => {
                self.append_locked(&mut state, mutations)?;
                Ok(BatchOutcome::Applied { counters })
            }
            Planned::Rejected(outcome) => Ok(outcome),
        }
    }
}
