#![warn(missing_docs)]

//! TagVault metadata subsystem: deduplication store, tag reference ledger, journaled persistence
//!
//! Both the store and the ledger sit on one [`KvStore`], so a record's
//! completion and its tag count increments commit in a single atomic batch.

pub mod fsck;
pub mod journal;
pub mod kvstore;
pub mod ledger;
pub mod store;
pub mod types;

pub use fsck::{FsckIssue, FsckReport};
pub use journal::{JournalConfig, JournalStats, JournaledKvStore};
pub use kvstore::{BatchOp, BatchOutcome, CounterUpdate, KvStore, MemoryKvStore};
pub use ledger::{DecrementPolicy, TagLedger};
pub use store::{CommitOutcome, DedupStore, ListQuery, Page, SortKey, SortOrder};
pub use types::{Digest, FileRecord, FileStatus, MetaError, TagEntry, TagId, Timestamp};
