//! Key-value store abstraction for catalog persistence.
//!
//! Uniqueness and reference counting are both expressed as guarded batches
//! evaluated under the store's write lock, so callers never need their own
//! locking to stay linearizable.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::types::MetaError;

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Key-value store trait for catalog persistence.
///
/// Implementations must apply each `write_batch` atomically: either every
/// operation takes effect or none does.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> Result<(), MetaError>;

    /// Delete a key, returning the value it held.
    fn delete(&self, key: &[u8]) -> Result<Option<Value>, MetaError>;

    /// Scan all keys with the given prefix, returning (key, value) pairs in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError>;

    /// Atomically apply a batch of operations.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<BatchOutcome, MetaError>;

    /// Returns true if the key exists.
    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError> {
        Ok(self.get(key)?.is_some())
    }

    /// Atomically add `delta` to the counter stored at `key`.
    ///
    /// A missing key counts as zero. Results below zero are refused and
    /// reported as [`BatchOutcome::Underflow`] with the store unchanged.
    fn counter_add(&self, key: &[u8], delta: i64) -> Result<CounterUpdate, MetaError> {
        let outcome = self.write_batch(vec![BatchOp::Add {
            key: key.to_vec(),
            delta,
        }])?;
        match outcome {
            BatchOutcome::Applied { counters } => Ok(CounterUpdate::Applied(
                counters.first().copied().unwrap_or_default(),
            )),
            BatchOutcome::Underflow { current, .. } => Ok(CounterUpdate::Underflow(current)),
            BatchOutcome::Conflict { key } => Err(MetaError::Conflict {
                key: String::from_utf8_lossy(&key).into_owned(),
            }),
        }
    }
}

/// A single operation in a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Key,
        /// The value to store.
        value: Value,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Key,
    },
    /// Precondition: the key currently holds exactly `value` (`None` = absent).
    Expect {
        /// The key to check.
        key: Key,
        /// The expected current value.
        value: Option<Value>,
    },
    /// Precondition: the key currently holds some value.
    ExpectPresent {
        /// The key to check.
        key: Key,
    },
    /// Add a signed delta to a little-endian u64 counter.
    Add {
        /// The counter key.
        key: Key,
        /// Amount to add.
        delta: i64,
    },
}

/// Result of applying a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every operation was applied. `counters` holds the new value of each
    /// `Add` in batch order.
    Applied {
        /// Post-values of the batch's counter operations
        counters: Vec<u64>,
    },
    /// An `Expect` or `ExpectPresent` precondition failed; nothing was applied.
    Conflict {
        /// The key whose precondition failed
        key: Key,
    },
    /// An `Add` would have gone below zero; nothing was applied.
    Underflow {
        /// The counter key
        key: Key,
        /// Its current value
        current: u64,
    },
}

impl BatchOutcome {
    /// True if the batch took effect.
    pub fn is_applied(&self) -> bool {
        matches!(self, BatchOutcome::Applied { .. })
    }
}

/// Result of a single counter update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterUpdate {
    /// The new counter value.
    Applied(u64),
    /// The update was refused; carries the unchanged current value.
    Underflow(u64),
}

/// A resolved mutation, the unit persisted by durable backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Store a value.
    Put {
        /// Key
        key: Key,
        /// Value
        value: Value,
    },
    /// Remove a key.
    Delete {
        /// Key
        key: Key,
    },
}

/// Outcome of evaluating a batch against current contents.
pub(crate) enum Planned {
    Ready {
        mutations: Vec<Mutation>,
        counters: Vec<u64>,
    },
    Rejected(BatchOutcome),
}

/// Encode a counter value.
pub fn encode_counter(value: u64) -> Value {
    value.to_le_bytes().to_vec()
}

/// Decode a counter value. A missing value is zero.
pub fn decode_counter(value: Option<&[u8]>) -> Result<u64, MetaError> {
    match value {
        None => Ok(0),
        Some(bytes) => {
            let arr: [u8; 8] = bytes.try_into().map_err(|_| {
                MetaError::Serialization(format!("counter has {} bytes, expected 8", bytes.len()))
            })?;
            Ok(u64::from_le_bytes(arr))
        }
    }
}

/// Evaluate `ops` against `data` without modifying it.
///
/// Later operations in the batch observe the effect of earlier ones.
pub(crate) fn plan_batch(
    data: &BTreeMap<Key, Value>,
    ops: Vec<BatchOp>,
) -> Result<Planned, MetaError> {
    let mut mutations: Vec<Mutation> = Vec::with_capacity(ops.len());
    let mut counters = Vec::new();

    fn current<'a>(
        data: &'a BTreeMap<Key, Value>,
        staged: &'a [Mutation],
        key: &[u8],
    ) -> Option<&'a [u8]> {
        for m in staged.iter().rev() {
            match m {
                Mutation::Put { key: k, value } if k.as_slice() == key => {
                    return Some(value.as_slice())
                }
                Mutation::Delete { key: k } if k.as_slice() == key => return None,
                _ => {}
            }
        }
        data.get(key).map(|v| v.as_slice())
    }

    for op in ops {
        match op {
            BatchOp::Put { key, value } => mutations.push(Mutation::Put { key, value }),
            BatchOp::Delete { key } => mutations.push(Mutation::Delete { key }),
            BatchOp::Expect { key, value } => {
                if current(data, &mutations, &key) != value.as_deref() {
                    return Ok(Planned::Rejected(BatchOutcome::Conflict { key }));
                }
            }
            BatchOp::ExpectPresent { key } => {
                if current(data, &mutations, &key).is_none() {
                    return Ok(Planned::Rejected(BatchOutcome::Conflict { key }));
                }
            }
            BatchOp::Add { key, delta } => {
                let existing = decode_counter(current(data, &mutations, &key))?;
                let next = existing as i128 + delta as i128;
                if next < 0 {
                    return Ok(Planned::Rejected(BatchOutcome::Underflow {
                        key,
                        current: existing,
                    }));
                }
                let next = u64::try_from(next).map_err(|_| {
                    MetaError::Serialization(format!("counter overflow on delta {}", delta))
                })?;
                counters.push(next);
                mutations.push(Mutation::Put {
                    key,
                    value: encode_counter(next),
                });
            }
        }
    }

    Ok(Planned::Ready {
        mutations,
        counters,
    })
}

/// Apply resolved mutations to a map.
pub(crate) fn apply_mutations(data: &mut BTreeMap<Key, Value>, mutations: Vec<Mutation>) {
    for m in mutations {
        match m {
            Mutation::Put { key, value } => {
                data.insert(key, value);
            }
            Mutation::Delete { key } => {
                data.remove(&key);
            }
        }
    }
}

/// Collect all pairs under `prefix` in key order.
pub(crate) fn scan_map(data: &BTreeMap<Key, Value>, prefix: &[u8]) -> Vec<KvPair> {
    let mut result = Vec::new();
    for (k, v) in data.range::<Vec<u8>, _>(prefix.to_vec()..) {
        if !k.starts_with(prefix) {
            break;
        }
        result.push((k.clone(), v.clone()));
    }
    result
}

/// In-memory KV store backed by a BTreeMap. Thread-safe via RwLock.
///
/// Does not persist data across restarts; use [`crate::journal::JournaledKvStore`]
/// for durability.
#[derive(Clone)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    /// Returns true if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        let data = self
            .data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MetaError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        data.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(data.remove(key))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, MetaError> {
        let data = self
            .data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(scan_map(&data, prefix))
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError> {
        let data = self
            .data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(data.contains_key(key))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<BatchOutcome, MetaError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        match plan_batch(&data, ops)? {
            Planned::Ready {
                mutations,
                counters,
            } => {
                apply_mutations(&mut data, mutations);
                Ok(BatchOutcome::Applied { counters })
            }
            Planned::Rejected(outcome) => Ok(outcome),
        }
    }
}
