//! Randomised ingest/remove/retag sequences keep tag counts exact.

use std::sync::Arc;

use proptest::prelude::*;
use tagvault_ingest::{
    process_task, Catalog, IngestConfig, IngestContext, IngestOutcome, IngestTask,
    NullProgressSink,
};
use tagvault_meta::{DecrementPolicy, KvStore, MemoryKvStore};

use crate::invariants::{assert_counts_consistent, assert_no_stale_claims};

const CONTENTS: u8 = 5;
const TAGS: [&str; 4] = ["red", "green", "blue", "grey"];

#[derive(Debug, Clone)]
enum Op {
    Ingest { content: u8, tags: Vec<usize> },
    Remove { content: u8 },
    Retag { content: u8, tags: Vec<usize> },
}

fn tag_set() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(0..TAGS.len(), 0..4)
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..CONTENTS, tag_set()).prop_map(|(content, tags)| Op::Ingest { content, tags }),
        1 => (0..CONTENTS).prop_map(|content| Op::Remove { content }),
        1 => (0..CONTENTS, tag_set()).prop_map(|(content, tags)| Op::Retag { content, tags }),
    ]
}

fn names(tags: &[usize]) -> Vec<String> {
    tags.iter().map(|&i| TAGS[i].to_string()).collect()
}

fn payload(content: u8) -> Vec<u8> {
    format!("property payload {}", content).into_bytes()
}

async fn run_ops(ops: Vec<Op>, policy: DecrementPolicy) -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = IngestConfig::with_root(dir.path());
    config.decrement_policy = policy;
    config.ensure_dirs()?;

    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let ctx = IngestContext::from_config(&config, kv.clone(), Arc::new(NullProgressSink));
    let catalog = Catalog::new(kv, &config);

    for (step, op) in ops.into_iter().enumerate() {
        match op {
            Op::Ingest { content, tags } => {
                let staged = config.staging_dir.join(format!("step-{}", step));
                std::fs::write(&staged, payload(content))?;
                let task = IngestTask::new(&staged, format!("c{}", content)).with_tags(names(&tags));
                let outcome = process_task(&ctx, &task).await;
                anyhow::ensure!(
                    !matches!(outcome, IngestOutcome::Failed { .. }),
                    "ingest failed: {:?}",
                    outcome
                );
            }
            Op::Remove { content } => {
                let digest = tagvault_ingest::hasher::digest_bytes(
                    config.hash_algorithm,
                    &payload(content),
                );
                if catalog.get(&digest)?.is_some() {
                    catalog.remove(&digest).await?;
                }
            }
            Op::Retag { content, tags } => {
                let digest = tagvault_ingest::hasher::digest_bytes(
                    config.hash_algorithm,
                    &payload(content),
                );
                if catalog.get(&digest)?.is_some() {
                    catalog.retag(&digest, &names(&tags))?;
                }
            }
        }
        assert_counts_consistent(&catalog)?;
        assert_no_stale_claims(&catalog)?;
    }
    Ok(())
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_counts_match_references_under_clamp(ops in prop::collection::vec(op(), 1..30)) {
        let result = block_on(run_ops(ops, DecrementPolicy::Clamp));
        prop_assert!(result.is_ok(), "{:?}", result);
    }

    #[test]
    fn prop_counts_match_references_under_reject(ops in prop::collection::vec(op(), 1..30)) {
        let result = block_on(run_ops(ops, DecrementPolicy::Reject));
        prop_assert!(result.is_ok(), "{:?}", result);
    }
}
