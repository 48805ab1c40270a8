//! End-to-end deduplication and tag accounting scenarios through the worker pool.

use std::collections::HashMap;

use sha2::{Digest as _, Sha256};
use tagvault_ingest::{ContentHasher, DigestAlgorithm, IngestOutcome};

use crate::harness::IngestHarness;
use crate::invariants::assert_quiescent;

fn completed(outcome: &IngestOutcome) -> bool {
    matches!(outcome, IngestOutcome::Completed(_))
}

fn duplicate(outcome: &IngestOutcome) -> bool {
    matches!(outcome, IngestOutcome::Duplicate { .. })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_uploads_single_winner() {
    let mut h = IngestHarness::start("identical_uploads", 8).unwrap();
    let payload = vec![42u8; 64 * 1024];

    let mut ids = Vec::new();
    for i in 0..12 {
        let id = h
            .upload(&format!("copy-{}.bin", i), &payload, &["shared"])
            .await
            .unwrap();
        ids.push(id);
    }
    let outcomes = h.wait_for(&ids).await.unwrap();

    assert_eq!(outcomes.values().filter(|o| completed(o)).count(), 1);
    assert_eq!(outcomes.values().filter(|o| duplicate(o)).count(), 11);
    assert_eq!(h.service().catalog().store().count().unwrap(), 1);
    assert_eq!(h.stored_files().unwrap().len(), 1);
    assert_eq!(h.staged_files().unwrap(), 0);
    assert_eq!(h.tag_count("shared").unwrap(), Some(1));
    assert_quiescent(h.service().catalog()).unwrap();
    h.finish().await;
}

#[tokio::test]
async fn test_digest_independent_of_name() {
    let mut h = IngestHarness::start("digest_determinism", 2).unwrap();
    let data = b"the same bytes under two names";

    let first = h.ingest("one.txt", data, &[]).await.unwrap();
    let second = h.ingest("two.txt", data, &[]).await.unwrap();
    assert!(completed(&first));
    assert!(duplicate(&second));
    assert_eq!(first.digest(), second.digest());

    let expected: [u8; 32] = Sha256::digest(data).into();
    assert_eq!(first.digest().unwrap().0, expected);

    let hasher = ContentHasher::new(DigestAlgorithm::Sha256, 7);
    let again = hasher.hash_reader(&data[..], |_| {}).await.unwrap();
    assert_eq!(Some(again.digest), first.digest());
    h.finish().await;
}

#[tokio::test]
async fn test_duplicate_never_mutates_counts() {
    let mut h = IngestHarness::start("duplicate_counts", 2).unwrap();
    assert!(completed(&h.ingest("a", b"content", &["x"]).await.unwrap()));

    let before: HashMap<String, u64> = h
        .service()
        .catalog()
        .ledger()
        .all()
        .unwrap()
        .into_iter()
        .map(|t| (t.name, t.count))
        .collect();

    let dup = h.ingest("b", b"content", &["x", "brand-new"]).await.unwrap();
    assert!(duplicate(&dup));

    for tag in h.service().catalog().ledger().all().unwrap() {
        let was = before.get(&tag.name).copied().unwrap_or(0);
        assert_eq!(tag.count, was, "count of {} changed", tag.name);
    }
    assert_eq!(h.tag_count("brand-new").unwrap(), Some(0));
    h.finish().await;
}

#[tokio::test]
async fn test_remove_then_reingest_is_fresh() {
    let mut h = IngestHarness::start("remove_reingest", 2).unwrap();
    let IngestOutcome::Completed(first) = h.ingest("r.bin", b"recycle", &["t"]).await.unwrap()
    else {
        panic!("first ingest should complete");
    };

    h.service().catalog().remove(&first.digest).await.unwrap();
    assert!(!first.file_path.exists());
    assert_eq!(h.tag_count("t").unwrap(), Some(0));

    let again = h.ingest("r2.bin", b"recycle", &["t"]).await.unwrap();
    assert!(completed(&again), "got {:?}", again);
    assert_eq!(again.digest(), Some(first.digest));
    assert_eq!(h.tag_count("t").unwrap(), Some(1));
    assert_quiescent(h.service().catalog()).unwrap();
    h.finish().await;
}

#[tokio::test]
async fn test_ingest_duplicate_remove_reingest_lifecycle() {
    let mut h = IngestHarness::start("lifecycle", 3).unwrap();
    let bytes = b"file A contents";

    // A
    let a = h.ingest("A", bytes, &["x", "y"]).await.unwrap();
    let IngestOutcome::Completed(record_a) = a else {
        panic!("A should complete, got {:?}", a);
    };
    assert_eq!(h.tag_count("x").unwrap(), Some(1));
    assert_eq!(h.tag_count("y").unwrap(), Some(1));

    // B: same bytes, different tags
    let b = h.ingest("B", bytes, &["y", "z"]).await.unwrap();
    assert!(duplicate(&b));
    assert_eq!(h.tag_count("x").unwrap(), Some(1));
    assert_eq!(h.tag_count("y").unwrap(), Some(1));

    h.service().catalog().remove(&record_a.digest).await.unwrap();
    assert_eq!(h.tag_count("x").unwrap(), Some(0));
    assert_eq!(h.tag_count("y").unwrap(), Some(0));

    // C: identical bytes again
    let c = h.ingest("C", bytes, &["x"]).await.unwrap();
    assert!(completed(&c));
    assert_eq!(h.tag_count("x").unwrap(), Some(1));
    assert_eq!(h.tag_count("y").unwrap(), Some(0));
    assert_quiescent(h.service().catalog()).unwrap();
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_workers_hundred_distinct_tasks() {
    let mut h = IngestHarness::start("hundred_tasks", 3).unwrap();

    let mut ids = Vec::new();
    for i in 0..100u32 {
        let parity = if i % 2 == 0 { "even" } else { "odd" };
        let bucket = format!("mod3-{}", i % 3);
        let data = format!("distinct payload #{}", i).into_bytes();
        let id = h
            .upload(&format!("f{}.dat", i), &data, &["all", parity, bucket.as_str()])
            .await
            .unwrap();
        ids.push(id);
    }
    let outcomes = h.wait_for(&ids).await.unwrap();

    assert_eq!(outcomes.len(), 100);
    assert!(outcomes.values().all(completed));
    assert_eq!(h.service().catalog().store().count().unwrap(), 100);
    assert_eq!(h.stored_files().unwrap().len(), 100);
    assert_eq!(h.tag_count("all").unwrap(), Some(100));
    assert_eq!(h.tag_count("even").unwrap(), Some(50));
    assert_eq!(h.tag_count("odd").unwrap(), Some(50));
    assert_eq!(h.tag_count("mod3-0").unwrap(), Some(34));
    assert_eq!(h.tag_count("mod3-1").unwrap(), Some(33));
    assert_eq!(h.tag_count("mod3-2").unwrap(), Some(33));
    assert_eq!(h.service().pool_stats().completed, 100);
    assert_quiescent(h.service().catalog()).unwrap();
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_duplicates_keep_counts_exact() {
    let mut h = IngestHarness::start("mixed_duplicates", 4).unwrap();

    // 40 uploads over 10 distinct contents; every upload of content k tags "k{k}".
    let mut ids = Vec::new();
    for i in 0..40u32 {
        let k = i % 10;
        let tag = format!("k{}", k);
        let data = format!("content {}", k).into_bytes();
        ids.push(
            h.upload(&format!("u{}", i), &data, &[tag.as_str(), "any"])
                .await
                .unwrap(),
        );
    }
    let outcomes = h.wait_for(&ids).await.unwrap();

    assert_eq!(outcomes.values().filter(|o| completed(o)).count(), 10);
    assert_eq!(outcomes.values().filter(|o| duplicate(o)).count(), 30);
    assert_eq!(h.tag_count("any").unwrap(), Some(10));
    for k in 0..10 {
        assert_eq!(h.tag_count(&format!("k{}", k)).unwrap(), Some(1));
    }
    assert_quiescent(h.service().catalog()).unwrap();
    h.finish().await;
}

#[tokio::test]
async fn test_retag_keeps_counts_exact() {
    let mut h = IngestHarness::start("retag", 2).unwrap();
    let IngestOutcome::Completed(a) = h.ingest("a", b"aaa", &["red", "blue"]).await.unwrap()
    else {
        panic!("a should complete");
    };
    h.ingest("b", b"bbb", &["red"]).await.unwrap();

    h.service()
        .catalog()
        .retag(&a.digest, &["green, blue".to_string()])
        .unwrap();
    assert_eq!(h.tag_count("red").unwrap(), Some(1));
    assert_eq!(h.tag_count("blue").unwrap(), Some(1));
    assert_eq!(h.tag_count("green").unwrap(), Some(1));
    assert_quiescent(h.service().catalog()).unwrap();
    h.finish().await;
}
