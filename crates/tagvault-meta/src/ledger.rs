//! Tag ledger: reference-counted registry of tag names.
//!
//! Layout in the KV store:
//! - `tagname/<name>` → tag id (u64 LE), the unique-name index
//! - `tag/<id>`       → [`TagMeta`]
//! - `tagcount/<id>`  → reference count (u64 LE counter)
//! - `seq/tag`        → id allocator
//!
//! Counts only move through the store's atomic counter op. New tags start at 0.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::kvstore::{decode_counter, encode_counter, BatchOp, BatchOutcome, CounterUpdate, KvStore};
use crate::types::{MetaError, TagEntry, TagId};

const NAME_PREFIX: &str = "tagname/";
const META_PREFIX: &str = "tag/";
const COUNT_PREFIX: &str = "tagcount/";
const SEQ_KEY: &[u8] = b"seq/tag";

/// What to do when a decrement would take a count below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecrementPolicy {
    /// Leave the count at zero and log a warning.
    #[default]
    Clamp,
    /// Refuse with [`MetaError::LedgerInconsistency`].
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TagMeta {
    id: TagId,
    name: String,
}

fn name_key(name: &str) -> Vec<u8> {
    format!("{}{}", NAME_PREFIX, name).into_bytes()
}

fn meta_key(id: TagId) -> Vec<u8> {
    format!("{}{:016x}", META_PREFIX, id.as_u64()).into_bytes()
}

/// Counter key of a tag.
pub fn count_key(id: TagId) -> Vec<u8> {
    format!("{}{:016x}", COUNT_PREFIX, id.as_u64()).into_bytes()
}

/// Inverse of [`count_key`].
pub fn tag_from_count_key(key: &[u8]) -> Option<TagId> {
    let s = std::str::from_utf8(key).ok()?;
    let hex = s.strip_prefix(COUNT_PREFIX)?;
    u64::from_str_radix(hex, 16).ok().map(TagId::new)
}

/// Canonical form of a tag name: surrounding whitespace removed.
pub fn normalize_tag_name(name: &str) -> Result<String, MetaError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(MetaError::InvalidTagName(name.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Reference-counted tag registry.
#[derive(Clone)]
pub struct TagLedger {
    kv: Arc<dyn KvStore>,
    policy: DecrementPolicy,
}

impl TagLedger {
    /// Create a ledger over the given KV backend.
    pub fn new(kv: Arc<dyn KvStore>, policy: DecrementPolicy) -> Self {
        Self { kv, policy }
    }

    /// The configured decrement policy.
    pub fn policy(&self) -> DecrementPolicy {
        self.policy
    }

    fn lookup_name(&self, name: &str) -> Result<Option<TagId>, MetaError> {
        match self.kv.get(&name_key(name))? {
            Some(bytes) => Ok(Some(TagId::new(decode_counter(Some(bytes.as_slice()))?))),
            None => Ok(None),
        }
    }

    /// Return the id of `name`, creating the tag with count 0 if needed.
    ///
    /// Concurrent creators of the same name converge on a single id.
    pub fn resolve_or_create(&self, name: &str) -> Result<TagId, MetaError> {
        let name = normalize_tag_name(name)?;
        loop {
            if let Some(id) = self.lookup_name(&name)? {
                return Ok(id);
            }

            let id = match self.kv.counter_add(SEQ_KEY, 1)? {
                CounterUpdate::Applied(n) => TagId::new(n),
                CounterUpdate::Underflow(_) => {
                    return Err(MetaError::Conflict {
                        key: String::from_utf8_lossy(SEQ_KEY).into_owned(),
                    })
                }
            };
            let meta = TagMeta {
                id,
                name: name.clone(),
            };
            let outcome = self.kv.write_batch(vec![
                BatchOp::Expect {
                    key: name_key(&name),
                    value: None,
                },
                BatchOp::Put {
                    key: name_key(&name),
                    value: encode_counter(id.as_u64()),
                },
                BatchOp::Put {
                    key: meta_key(id),
                    value: bincode::serialize(&meta)?,
                },
                BatchOp::Put {
                    key: count_key(id),
                    value: encode_counter(0),
                },
            ])?;
            match outcome {
                BatchOutcome::Applied { .. } => {
                    debug!(tag = %name, id = %id, "Created tag");
                    return Ok(id);
                }
                BatchOutcome::Conflict { .. } => {
                    debug!(tag = %name, "Tag created concurrently, retrying lookup");
                }
                BatchOutcome::Underflow { key, .. } => {
                    return Err(MetaError::Conflict {
                        key: String::from_utf8_lossy(&key).into_owned(),
                    })
                }
            }
        }
    }

    /// Resolve several names, dropping duplicates while keeping first-seen order.
    pub fn resolve_many<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<TagId>, MetaError> {
        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let id = self.resolve_or_create(name.as_ref())?;
            if seen.insert(id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn ensure_exists(&self, id: TagId) -> Result<(), MetaError> {
        if self.kv.contains_key(&meta_key(id))? {
            Ok(())
        } else {
            Err(MetaError::TagNotFound(id))
        }
    }

    /// Atomically add one to a tag's count, returning the new count.
    pub fn increment(&self, id: TagId) -> Result<u64, MetaError> {
        self.ensure_exists(id)?;
        match self.kv.counter_add(&count_key(id), 1)? {
            CounterUpdate::Applied(n) => {
                debug!(id = %id, count = n, "Incremented tag");
                Ok(n)
            }
            CounterUpdate::Underflow(current) => Err(MetaError::LedgerInconsistency {
                tag: id,
                count: current,
            }),
        }
    }

    /// Atomically subtract one from a tag's count, returning the new count.
    ///
    /// At zero the configured [`DecrementPolicy`] applies; the count is never negative.
    pub fn decrement(&self, id: TagId) -> Result<u64, MetaError> {
        self.ensure_exists(id)?;
        match self.kv.counter_add(&count_key(id), -1)? {
            CounterUpdate::Applied(n) => {
                debug!(id = %id, count = n, "Decremented tag");
                Ok(n)
            }
            CounterUpdate::Underflow(current) => {
                self.on_underflow(id, current)?;
                Ok(current)
            }
        }
    }

    /// Apply the decrement policy to a refused decrement of `id`.
    ///
    /// Returns Ok when the policy is to clamp, so the caller may drop the op.
    pub fn on_underflow(&self, id: TagId, current: u64) -> Result<(), MetaError> {
        match self.policy {
            DecrementPolicy::Clamp => {
                warn!(id = %id, count = current, "Tag decrement below zero clamped");
                Ok(())
            }
            DecrementPolicy::Reject => Err(MetaError::LedgerInconsistency {
                tag: id,
                count: current,
            }),
        }
    }

    /// Counter ops adding one to each tag, for folding into a larger batch.
    ///
    /// Each increment is guarded on the tag still existing, so a tag pruned
    /// after it was resolved makes the whole batch conflict instead of
    /// reviving an orphan counter.
    pub fn increment_ops(&self, ids: &[TagId]) -> Vec<BatchOp> {
        ids.iter()
            .flat_map(|id| {
                [
                    BatchOp::ExpectPresent { key: meta_key(*id) },
                    BatchOp::Add {
                        key: count_key(*id),
                        delta: 1,
                    },
                ]
            })
            .collect()
    }

    /// True if `key` belongs to the ledger's tag records.
    pub fn is_tag_key(key: &[u8]) -> bool {
        key.starts_with(META_PREFIX.as_bytes()) || key.starts_with(COUNT_PREFIX.as_bytes())
    }

    /// Counter ops subtracting one from each tag, for folding into a larger batch.
    pub fn decrement_ops(&self, ids: &[TagId]) -> Vec<BatchOp> {
        ids.iter()
            .map(|id| BatchOp::Add {
                key: count_key(*id),
                delta: -1,
            })
            .collect()
    }

    /// Current count of a tag.
    pub fn count(&self, id: TagId) -> Result<u64, MetaError> {
        self.ensure_exists(id)?;
        decode_counter(self.kv.get(&count_key(id))?.as_deref())
    }

    /// Overwrite a tag's count. Only for repair at quiescent points.
    pub fn set_count(&self, id: TagId, count: u64) -> Result<(), MetaError> {
        self.ensure_exists(id)?;
        self.kv.put(count_key(id), encode_counter(count))
    }

    /// Look up a tag by id.
    pub fn get(&self, id: TagId) -> Result<Option<TagEntry>, MetaError> {
        let Some(bytes) = self.kv.get(&meta_key(id))? else {
            return Ok(None);
        };
        let meta: TagMeta = bincode::deserialize(&bytes)?;
        let count = decode_counter(self.kv.get(&count_key(id))?.as_deref())?;
        Ok(Some(TagEntry {
            id: meta.id,
            name: meta.name,
            count,
        }))
    }

    /// Look up a tag by name without creating it.
    pub fn get_by_name(&self, name: &str) -> Result<Option<TagEntry>, MetaError> {
        let name = normalize_tag_name(name)?;
        match self.lookup_name(&name)? {
            Some(id) => self.get(id),
            None => Ok(None),
        }
    }

    /// Every tag, in id order.
    pub fn all(&self) -> Result<Vec<TagEntry>, MetaError> {
        let metas = self.kv.scan_prefix(META_PREFIX.as_bytes())?;
        let mut entries = Vec::with_capacity(metas.len());
        for (_, bytes) in metas {
            let meta: TagMeta = bincode::deserialize(&bytes)?;
            let count = decode_counter(self.kv.get(&count_key(meta.id))?.as_deref())?;
            entries.push(TagEntry {
                id: meta.id,
                name: meta.name,
                count,
            });
        }
        Ok(entries)
    }

    /// Tags whose name contains `query` (case-insensitive), most used first.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<TagEntry>, MetaError> {
        let needle = query.trim().to_lowercase();
        let mut hits: Vec<TagEntry> = self
            .all()?
            .into_iter()
            .filter(|t| t.name.to_lowercase().contains(&needle))
            .collect();
        hits.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        hits.truncate(limit);
        Ok(hits)
    }

    /// Delete tags whose count is zero. Returns what was removed.
    ///
    /// A tag resolved by an in-flight ingest but not yet counted also reads as
    /// zero and may be removed; that ingest's guarded increment then conflicts
    /// and it resolves its tags again.
    pub fn prune_unused(&self) -> Result<Vec<TagEntry>, MetaError> {
        let mut pruned = Vec::new();
        for entry in self.all()? {
            if entry.count == 0 && self.delete_if_zero(&entry)? {
                pruned.push(entry);
            }
        }
        Ok(pruned)
    }

    /// Delete one tag if its count is zero. See [`Self::prune_unused`].
    pub fn prune_if_unused(&self, id: TagId) -> Result<Option<TagEntry>, MetaError> {
        match self.get(id)? {
            Some(entry) if entry.count == 0 => {
                if self.delete_if_zero(&entry)? {
                    Ok(Some(entry))
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    fn delete_if_zero(&self, entry: &TagEntry) -> Result<bool, MetaError> {
        let outcome = self.kv.write_batch(vec![
            BatchOp::Expect {
                key: count_key(entry.id),
                value: Some(encode_counter(0)),
            },
            BatchOp::Delete {
                key: count_key(entry.id),
            },
            BatchOp::Delete {
                key: meta_key(entry.id),
            },
            BatchOp::Delete {
                key: name_key(&entry.name),
            },
        ])?;
        if outcome.is_applied() {
            debug!(tag = %entry.name, id = %entry.id, "Pruned unused tag");
        }
        Ok(outcome.is_applied())
    }
}
