//! Integration test: historical replay and durable storage.
//!
//! Logs are put on the in-memory chain without being handled, then replayed
//! into fresh stores through the reconciler.

use clearnode_custody::Reconciler;
use clearnode_integration_tests::*;
use clearnode_store::Store;

/// Emit a history touching three channels; returns the last block.
async fn seed_history(net: &mut Network) -> u64 {
    let events = [
        created(1, 1_000_000),
        created(2, 250_000),
        resized(1, 500_000),
        created(3, 10),
        resized(2, -50_000),
        challenged(1, 0, 1_500_000),
        resized(3, 90),
        closed(1, 1, 1_500_000),
        resized(2, 1),
        resized(3, -500),
        closed(3, 2, 100),
    ];
    for event in &events {
        net.emit(event).await;
    }
    net.last_block()
}

#[tokio::test]
async fn test_split_replay_matches_single_pass() {
    init_tracing();
    let mut origin = Network::new();
    let last = seed_history(&mut origin).await;

    let single = origin.follower(Store::memory());
    let report = Reconciler::new(single.engine.clone())
        .reconcile(CHAIN_ID, 1, last)
        .await
        .expect("single pass");
    assert_eq!(report.logs_seen, 11);
    assert_eq!(report.processed, 10);
    assert_eq!(report.discarded, 1);

    for split in [1, 4, 7, last - 1] {
        let parts = origin.follower(Store::memory());
        let reconciler = Reconciler::new(parts.engine.clone());
        let first = reconciler.reconcile(CHAIN_ID, 1, split).await.expect("first part");
        let second = reconciler
            .reconcile(CHAIN_ID, split + 1, last)
            .await
            .expect("second part");
        assert_eq!(first.logs_seen + second.logs_seen, 11);
        assert_eq!(
            parts.snapshot(&[1, 2, 3]),
            single.snapshot(&[1, 2, 3]),
            "split at block {split}"
        );
    }
}

#[tokio::test]
async fn test_step_size_does_not_change_outcome() {
    let mut origin = Network::new();
    let last = seed_history(&mut origin).await;

    let mut snapshots = Vec::new();
    for step in [1, 3, 1_000] {
        let net = origin.follower(Store::memory());
        Reconciler::new(net.engine.clone())
            .reconcile_with_step(CHAIN_ID, 1, last, step)
            .await
            .expect("replay");
        snapshots.push(net.snapshot(&[1, 2, 3]));
    }
    assert!(snapshots.windows(2).all(|w| w[0] == w[1]));
    assert!(snapshots[0].ledger_closed());
}

#[tokio::test]
async fn test_replay_after_live_handling_is_noop() {
    let mut net = Network::new();
    for event in [created(1, 1_000), resized(1, 500), closed(1, 1, 1_500)] {
        net.process(&event).await;
    }
    let live = net.snapshot(&[1]);

    let report = Reconciler::new(net.engine.clone())
        .reconcile(CHAIN_ID, 1, net.last_block())
        .await
        .expect("replay");
    assert_eq!(report.duplicates, 3);
    assert_eq!(report.processed, 0);
    assert_eq!(net.snapshot(&[1]), live);
}

#[tokio::test]
async fn test_rocksdb_state_survives_reopen() {
    let dir = std::env::temp_dir().join(format!("clearnode-it-{}", uuid::Uuid::now_v7()));

    let mut origin = Network::new();
    let last = seed_history(&mut origin).await;

    let before = {
        let net = origin.follower(Store::open(&dir).expect("open rocksdb"));
        Reconciler::new(net.engine.clone())
            .reconcile(CHAIN_ID, 1, last)
            .await
            .expect("replay");
        net.snapshot(&[1, 2, 3])
    };

    let reopened = origin.follower(Store::open(&dir).expect("reopen rocksdb"));
    assert_eq!(reopened.snapshot(&[1, 2, 3]), before);

    let report = Reconciler::new(reopened.engine.clone())
        .reconcile(CHAIN_ID, 1, last)
        .await
        .expect("replay after reopen");
    assert_eq!(report.processed, 0);
    assert_eq!(report.duplicates, 10);
    assert_eq!(reopened.snapshot(&[1, 2, 3]), before);

    drop(reopened);
    std::fs::remove_dir_all(&dir).ok();
}
