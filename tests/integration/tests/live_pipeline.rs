//! Integration test: the full service against a live in-memory chain.
//!
//! Listeners, the custody engine and the checkpoint worker run as spawned
//! tasks; the test only talks to the chain and reads the store.

use std::sync::Arc;
use std::time::Duration;

use clearnode_chain::MemoryChain;
use clearnode_core::{AccountId, ActionStatus, ChannelStatus, TransactionType};
use clearnode_custody::{ListenerError, RecordingNotifier, ServiceError, SettlementService};
use clearnode_integration_tests::*;
use clearnode_store::Store;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Running {
    net: Network,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<(), ServiceError>>,
}

impl Running {
    /// Start a service over a fresh chain. `net` is used to emit events and
    /// read the shared store; its own engine never handles anything.
    fn start() -> Self {
        Self::start_with(Arc::new(MemoryChain::new()))
    }

    fn start_with(chain: Arc<MemoryChain>) -> Self {
        let store = Store::memory();
        let net = Network::with_chain(chain.clone(), store.clone());
        let service = SettlementService::new(
            settlement_config(),
            store,
            registry(&chain),
            Arc::new(RecordingNotifier::new()),
        )
        .expect("service construction");
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { service.run(rx).await });
        Self {
            net,
            shutdown,
            handle,
        }
    }

    /// Signal shutdown and wait for the service; hands back the network.
    async fn stop(self) -> (Network, Result<(), ServiceError>) {
        let _ = self.shutdown.send(true);
        let result = tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("service should stop promptly")
            .expect("service task should not panic");
        (self.net, result)
    }

    fn raw_amount(&self, n: u8) -> Option<u128> {
        self.net
            .store
            .read(|tx| tx.channels().get(&channel_id(n)))
            .expect("channel read")
            .map(|c| c.raw_amount)
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_stale_challenge_is_checkpointed_on_chain() {
    init_tracing();
    let mut run = Running::start();

    run.net.emit(&created(1, 1_000_000)).await;
    eventually("channel open", || run.raw_amount(1) == Some(1_000_000)).await;
    run.net.sign_state(1, 5);

    run.net.emit(&challenged(1, 3, 1_000_000)).await;
    let chain = run.net.chain.clone();
    eventually("checkpoint submission", || chain.submissions().len() == 1).await;

    let call = &chain.submissions()[0];
    assert_eq!(call.channel_id, channel_id(1));
    assert_eq!(call.state.version, 5);

    let store = run.net.store.clone();
    eventually("action completed", || {
        store
            .read(|tx| tx.actions().list(None))
            .expect("actions")
            .iter()
            .all(|a| a.status == ActionStatus::Completed)
    })
    .await;

    let (_, result) = run.stop().await;
    result.expect("clean shutdown");
    assert_eq!(chain.submissions().len(), 1);
}

#[tokio::test]
async fn test_checkpointed_channel_reopens_and_accepts_resize() {
    let mut run = Running::start();

    run.net.emit(&created(1, 1_000_000)).await;
    eventually("channel open", || run.raw_amount(1) == Some(1_000_000)).await;
    run.net.sign_state(1, 5);

    run.net.emit(&challenged(1, 3, 1_000_000)).await;
    let store = run.net.store.clone();
    eventually("dispute resolved", || {
        let done = store
            .read(|tx| tx.actions().list(None))
            .expect("actions")
            .first()
            .is_some_and(|a| a.status == ActionStatus::Completed);
        done && run.net.channel(1).status == ChannelStatus::Open
    })
    .await;

    run.net.emit(&resized(1, 500_000)).await;
    eventually("top-up after dispute", || run.raw_amount(1) == Some(1_500_000)).await;

    let (net, result) = run.stop().await;
    result.expect("clean shutdown");

    let channel = net.channel(1);
    assert_eq!(channel.status, ChannelStatus::Open);
    assert_eq!(channel.version, 6);
    assert_eq!(channel.state.version, 6);
    assert_eq!(net.unified_balance(1), 1_500_000);
    assert!(net.snapshot(&[1]).ledger_closed());
    assert_eq!(net.chain.submissions().len(), 1);
}

#[tokio::test]
async fn test_failed_submission_is_retried_by_worker() {
    let chain = Arc::new(MemoryChain::new());
    chain.fail_next_submissions(2);
    let mut run = Running::start_with(chain.clone());

    run.net.emit(&created(1, 1_000_000)).await;
    eventually("channel open", || run.raw_amount(1).is_some()).await;
    run.net.sign_state(1, 2);
    run.net.emit(&challenged(1, 0, 1_000_000)).await;

    eventually("checkpoint submission", || chain.submissions().len() == 1).await;
    let store = run.net.store.clone();
    eventually("action completed", || {
        store
            .read(|tx| tx.actions().list(None))
            .expect("actions")
            .first()
            .is_some_and(|a| a.status == ActionStatus::Completed && a.retry_count == 2)
    })
    .await;

    let (_, result) = run.stop().await;
    result.expect("clean shutdown");
}

#[tokio::test]
async fn test_redelivery_after_stream_loss_posts_once() {
    let mut run = Running::start();

    run.net.emit(&created(1, 1_000_000)).await;
    run.net.emit(&resized(1, 500_000)).await;
    eventually("top-up applied", || run.raw_amount(1) == Some(1_500_000)).await;

    // Stream ends cleanly; the resubscription replays the last seen block.
    run.net.chain.drop_subscriptions();
    run.net.emit(&resized(1, 250_000)).await;
    eventually("second top-up", || run.raw_amount(1) == Some(1_750_000)).await;

    // Stream fails; the listener backs off and resubscribes.
    run.net.chain.break_subscriptions("connection reset").await;
    run.net.emit(&resized(1, -1_000_000)).await;
    eventually("withdrawal", || run.raw_amount(1) == Some(750_000)).await;

    let (net, result) = run.stop().await;
    result.expect("clean shutdown");

    assert_eq!(net.unified_balance(1), 750_000);
    let snapshot = net.snapshot(&[1]);
    assert!(snapshot.ledger_closed());
    assert_eq!(snapshot.events, 4);
    let count = |kind: TransactionType| snapshot.transactions.iter().filter(|t| t.0 == kind).count();
    assert_eq!(count(TransactionType::Deposit), 3);
    assert_eq!(count(TransactionType::Withdrawal), 1);
}

#[tokio::test]
async fn test_unreachable_chain_stops_service_with_error() {
    let chain = Arc::new(MemoryChain::new());
    chain.fail_next_subscribes(u32::MAX);
    let run = Running::start_with(chain.clone());

    let result = tokio::time::timeout(Duration::from_secs(5), run.handle)
        .await
        .expect("service should give up")
        .expect("service task should not panic");
    match result {
        Err(ServiceError::Listener(ListenerError::RetriesExhausted {
            chain_id, attempts, ..
        })) => {
            assert_eq!(chain_id, CHAIN_ID);
            assert_eq!(attempts, settlement_config().listener.max_retries + 1);
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    assert_eq!(
        chain.subscribe_calls(),
        settlement_config().listener.max_retries + 1
    );
    assert_eq!(
        run.net.balance(&AccountId::Wallet(wallet(1))),
        0,
        "nothing was processed"
    );
}

