//! Integration test: custody events flowing into the registry and ledger.
//!
//! Covers the reference scenarios (open, top-up, rejected withdrawal,
//! stale challenge, redelivered close) and the ledger invariants that must
//! hold after every committed event.

use clearnode_chain::EventKind;
use clearnode_core::{
    format_units, AccountId, ActionStatus, ActionType, ChannelStatus, TransactionType,
};
use clearnode_custody::{CheckpointPayload, HandleOutcome, NotificationKind};
use clearnode_integration_tests::*;

// =========================================================================
// Reference scenarios
// =========================================================================

#[tokio::test]
async fn test_created_opens_channel_and_credits_wallet() {
    init_tracing();
    let mut net = Network::new();

    let outcome = net.process(&created(1, 1_000_000)).await;
    assert_eq!(outcome, HandleOutcome::Processed(EventKind::Created));

    let channel = net.channel(1);
    assert_eq!(channel.status, ChannelStatus::Open);
    assert_eq!(channel.raw_amount, 1_000_000);
    assert_eq!(channel.participants, [signer(1), broker()]);
    assert_eq!(format_units(net.unified_balance(1), DECIMALS), "1");
    assert_eq!(net.balance(&AccountId::Channel(channel_id(1))), 0);

    let notes = net.notifier.take();
    assert!(notes.iter().all(|n| n.wallet == wallet(1)));
    let balance_update = notes
        .iter()
        .find(|n| n.kind == NotificationKind::BalanceUpdate)
        .expect("balance notification");
    assert_eq!(
        balance_update.payload,
        serde_json::json!({ "balances": [{ "asset": "usdc", "amount": "1" }] })
    );
    assert!(notes.iter().any(|n| n.kind == NotificationKind::ChannelUpdate));
}

#[tokio::test]
async fn test_resize_deposit_records_one_transaction() {
    let mut net = Network::new();
    net.process(&created(1, 1_000_000)).await;

    let outcome = net.process(&resized(1, 500_000)).await;
    assert_eq!(outcome, HandleOutcome::Processed(EventKind::Resized));

    let channel = net.channel(1);
    assert_eq!(channel.raw_amount, 1_500_000);
    assert_eq!(format_units(net.unified_balance(1), DECIMALS), "1.5");

    let deposits: Vec<_> = net
        .store
        .read(|tx| tx.ledger().transactions_by_account(&AccountId::Wallet(wallet(1))))
        .expect("transactions")
        .into_iter()
        .filter(|t| t.tx_type == TransactionType::Deposit)
        .collect();
    assert_eq!(deposits.len(), 2);
    assert_eq!(format_units(deposits[1].amount as i128, DECIMALS), "0.5");
}

#[tokio::test]
async fn test_overdrawing_resize_is_rejected_without_effects() {
    let mut net = Network::new();
    net.process(&created(1, 1_000_000)).await;
    net.process(&resized(1, 500_000)).await;
    let before = net.snapshot(&[1]);

    let outcome = net.process(&resized(1, -2_000_000)).await;
    assert!(matches!(outcome, HandleOutcome::Discarded(_)));

    assert_eq!(net.channel(1).raw_amount, 1_500_000);
    let after = net.snapshot(&[1]);
    assert_eq!(after.transactions, before.transactions);
    assert_eq!(after.channels, before.channels);
    assert_eq!(after.balances, before.balances);
}

#[tokio::test]
async fn test_stale_challenge_queues_one_checkpoint() {
    let mut net = Network::new();
    net.process(&created(1, 1_000_000)).await;
    net.sign_state(1, 5);

    let outcome = net.process(&challenged(1, 3, 1_000_000)).await;
    assert_eq!(outcome, HandleOutcome::Processed(EventKind::Challenged));
    assert_eq!(net.channel(1).status, ChannelStatus::Challenged);

    let actions = net
        .store
        .read(|tx| tx.actions().list(None))
        .expect("actions");
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action_type, ActionType::Checkpoint);
    assert_eq!(actions[0].status, ActionStatus::Pending);
    assert_eq!(actions[0].channel_id, channel_id(1));

    let payload: CheckpointPayload =
        serde_json::from_value(actions[0].payload.clone()).expect("payload");
    assert_eq!(payload.state.version, 5);
}

#[tokio::test]
async fn test_current_challenge_queues_nothing() {
    let mut net = Network::new();
    net.process(&created(1, 1_000_000)).await;
    net.sign_state(1, 5);

    net.process(&challenged(1, 5, 1_000_000)).await;
    let pending = net
        .store
        .read(|tx| tx.actions().pending_batch(10))
        .expect("actions");
    assert!(pending.is_empty());
    assert_eq!(net.channel(1).status, ChannelStatus::Challenged);
}

#[tokio::test]
async fn test_redelivered_close_posts_once() {
    let mut net = Network::new();
    net.process(&created(1, 1_000_000)).await;
    net.process(&resized(1, 500_000)).await;

    let log = net.emit(&closed(1, 1, 1_500_000)).await;
    assert_eq!(
        net.handle(&log).await,
        HandleOutcome::Processed(EventKind::Closed)
    );
    let once = net.snapshot(&[1]);

    assert_eq!(net.handle(&log).await, HandleOutcome::Duplicate);
    let twice = net.snapshot(&[1]);
    assert_eq!(once, twice);

    let channel = net.channel(1);
    assert_eq!(channel.status, ChannelStatus::Closed);
    assert_eq!(channel.raw_amount, 0);
    assert_eq!(net.unified_balance(1), 0);
    let withdrawals = twice
        .transactions
        .iter()
        .filter(|t| t.0 == TransactionType::Withdrawal)
        .count();
    assert_eq!(withdrawals, 1);
}

// =========================================================================
// Invariants
// =========================================================================

#[tokio::test]
async fn test_every_event_handled_twice_changes_nothing() {
    let mut net = Network::new();
    let events = [
        created(1, 2_000_000),
        created(2, 300),
        resized(1, 250_000),
        resized(2, -100),
        challenged(1, 0, 2_250_000),
        closed(1, 1, 2_250_000),
        resized(2, 50),
    ];
    for event in &events {
        let log = net.emit(event).await;
        let first = net.handle(&log).await;
        assert!(matches!(first, HandleOutcome::Processed(_)), "{first:?}");
        let after_first = net.snapshot(&[1, 2]);

        assert_eq!(net.handle(&log).await, HandleOutcome::Duplicate);
        assert_eq!(net.snapshot(&[1, 2]), after_first);
    }
    assert_eq!(net.snapshot(&[1, 2]).events, events.len());
}

#[tokio::test]
async fn test_ledger_stays_closed_after_every_event() {
    let mut net = Network::new();
    let events = [
        created(1, 1_000_000),
        created(2, 0),
        resized(2, 40_000),
        resized(1, -999_999),
        resized(1, -2),
        challenged(2, 0, 40_000),
        closed(2, 3, 10_000),
        closed(1, 9, 1),
    ];
    for event in &events {
        net.process(event).await;
        let snapshot = net.snapshot(&[1, 2]);
        assert!(snapshot.ledger_closed(), "{:?}", snapshot.asset_totals);
        assert_eq!(net.balance(&AccountId::Channel(channel_id(1))), 0);
        assert_eq!(net.balance(&AccountId::Channel(channel_id(2))), 0);
    }
}

#[tokio::test]
async fn test_version_never_decreases() {
    let mut net = Network::new();
    net.process(&created(1, 1_000)).await;

    let mut last = net.channel(1).version;
    for event in [resized(1, 10), resized(1, -5), resized(1, 0), closed(1, 0, 1_005)] {
        net.process(&event).await;
        let version = net.channel(1).version;
        assert!(version >= last, "version went from {last} to {version}");
        last = version;
    }
    assert_eq!(last, 3);
}

#[tokio::test]
async fn test_closed_channel_frees_slot_for_new_channel() {
    let mut net = Network::new();
    net.process(&created(1, 1_000)).await;
    net.process(&closed(1, 0, 1_000)).await;

    // Same wallet, same token, fresh channel id.
    let mut reopen = created(1, 700);
    if let clearnode_chain::CustodyEvent::Created { channel_id: id, .. } = &mut reopen {
        *id = channel_id(9);
    }
    assert_eq!(
        net.process(&reopen).await,
        HandleOutcome::Processed(EventKind::Created)
    );
    assert_eq!(net.unified_balance(1), 700);

    let channels = net
        .store
        .read(|tx| tx.channels().list_by_wallet(&wallet(1)))
        .expect("channels");
    assert_eq!(channels.len(), 2);
}
