//! TagVault integration tests
//!
//! Drives the ingest service end to end: concurrent duplicate uploads,
//! restart and replay, and randomised sequences checked against the
//! tag count invariants in [`invariants`].

pub mod harness;
pub mod invariants;

pub use harness::{init_tracing, IngestHarness, TestEnv};
pub use invariants::{assert_counts_consistent, assert_no_stale_claims, assert_quiescent};

#[cfg(test)]
mod dedup_scenarios;
#[cfg(test)]
mod ledger_properties;
