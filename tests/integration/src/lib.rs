//! Shared harness for the cross-crate settlement tests.
//!
//! A [`Network`] is one chain backed by [`MemoryChain`], a custody engine over
//! a store, and a recording notifier. Events are emitted as encoded logs so
//! every test goes through the same decode path as a live node.

use std::collections::BTreeMap;
use std::sync::Arc;

use clearnode_chain::{
    ChainEntry, ChainRegistry, ChainState, ChannelParams, CustodyEvent, MemoryChain, RawLog,
};
use clearnode_core::{
    AccountId, Address, Allocation, AssetConfig, ChainConfig, Channel, ChannelId, ChannelStatus,
    Intent, ListenerConfig, SettlementConfig, Signature, TransactionType, UnsignedState,
    WorkerConfig, H256,
};
use clearnode_custody::{CustodyEngine, HandleOutcome, RecordingNotifier};
use clearnode_store::{Store, StoreError};

pub const CHAIN_ID: u64 = 137;
pub const ASSET: &str = "usdc";
pub const DECIMALS: u8 = 6;

pub fn custody_address() -> Address {
    Address::repeat_byte(0xee)
}

pub fn adjudicator() -> Address {
    Address::repeat_byte(0xdd)
}

pub fn broker() -> Address {
    Address::repeat_byte(0xbb)
}

pub fn token() -> Address {
    Address::repeat_byte(0xcc)
}

/// Wallet `n` and the key it signs channel states with.
pub fn wallet(n: u8) -> Address {
    Address::from_low_u64_be(0xa000 + n as u64)
}

pub fn signer(n: u8) -> Address {
    Address::from_low_u64_be(0x5000 + n as u64)
}

pub fn channel_id(n: u8) -> ChannelId {
    H256::from_low_u64_be(0xc000 + n as u64)
}

/// Route test logs through the test writer. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn settlement_config() -> SettlementConfig {
    SettlementConfig {
        broker_address: broker(),
        chains: vec![chain_config()],
        assets: vec![AssetConfig {
            symbol: ASSET.into(),
            chain_id: CHAIN_ID,
            token: token(),
            decimals: DECIMALS,
        }],
        listener: ListenerConfig {
            max_retries: 5,
            base_delay_ms: 1,
            max_delay_ms: 8,
            handler_max_attempts: 3,
        },
        worker: WorkerConfig {
            poll_interval_ms: 5,
            batch_size: 50,
            max_retries: 5,
        },
        ..Default::default()
    }
}

pub fn chain_config() -> ChainConfig {
    ChainConfig {
        chain_id: CHAIN_ID,
        rpc_url: "memory://".into(),
        custody_address: custody_address(),
        adjudicator_address: adjudicator(),
        start_block: 1,
        poll_interval_ms: 5,
        block_step: 4,
    }
}

pub fn registry(chain: &Arc<MemoryChain>) -> ChainRegistry {
    let mut registry = ChainRegistry::new();
    registry.insert(ChainEntry::new(&chain_config(), chain.clone(), chain.clone()));
    registry
}

// =========================================================================
// Event builders
// =========================================================================

fn allocations(n: u8, user: u128, broker_amount: u128) -> Vec<Allocation> {
    vec![
        Allocation {
            destination: signer(n),
            token: token(),
            amount: user,
        },
        Allocation {
            destination: broker(),
            token: token(),
            amount: broker_amount,
        },
    ]
}

pub fn chain_state(n: u8, intent: Intent, version: u64, user: u128) -> ChainState {
    ChainState {
        intent,
        version,
        data: Vec::new(),
        allocations: allocations(n, user, 0),
        sigs: vec![Signature(vec![0x1b; 65])],
    }
}

/// Channel `n` opened by wallet `n` with `amount` deposited.
pub fn created(n: u8, amount: u128) -> CustodyEvent {
    CustodyEvent::Created {
        channel_id: channel_id(n),
        wallet: wallet(n),
        channel: ChannelParams {
            participants: vec![signer(n), broker()],
            adjudicator: adjudicator(),
            challenge: 7200,
            nonce: n as u64,
        },
        initial: chain_state(n, Intent::Initialize, 0, amount),
    }
}

pub fn resized(n: u8, user_delta: i128) -> CustodyEvent {
    CustodyEvent::Resized {
        channel_id: channel_id(n),
        deltas: vec![user_delta, 0],
    }
}

pub fn challenged(n: u8, version: u64, user: u128) -> CustodyEvent {
    CustodyEvent::Challenged {
        channel_id: channel_id(n),
        state: chain_state(n, Intent::Operate, version, user),
        expiration: 1_900_000_000,
    }
}

pub fn closed(n: u8, version: u64, user: u128) -> CustodyEvent {
    CustodyEvent::Closed {
        channel_id: channel_id(n),
        final_state: chain_state(n, Intent::Finalize, version, user),
    }
}

// =========================================================================
// Network
// =========================================================================

pub struct Network {
    pub chain: Arc<MemoryChain>,
    pub engine: Arc<CustodyEngine>,
    pub notifier: Arc<RecordingNotifier>,
    pub store: Store,
    next_block: u64,
}

impl Network {
    pub fn new() -> Self {
        Self::with_store(Store::memory())
    }

    pub fn with_store(store: Store) -> Self {
        Self::with_chain(Arc::new(MemoryChain::new()), store)
    }

    /// A network over an existing chain, e.g. to replay its logs into a fresh store.
    pub fn with_chain(chain: Arc<MemoryChain>, store: Store) -> Self {
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = CustodyEngine::new(
            &settlement_config(),
            store.clone(),
            Arc::new(registry(&chain)),
            notifier.clone(),
        )
        .expect("engine construction should succeed");
        Self {
            chain,
            engine: Arc::new(engine),
            notifier,
            store,
            next_block: 1,
        }
    }

    /// A second engine over this network's chain, writing to `store`.
    pub fn follower(&self, store: Store) -> Network {
        let mut net = Self::with_chain(self.chain.clone(), store);
        net.next_block = self.next_block;
        net
    }

    /// Put `event` on chain in the next block without handling it.
    pub async fn emit(&mut self, event: &CustodyEvent) -> RawLog {
        let block = self.next_block;
        self.next_block += 1;
        let log = self.engine.abi().encode_log(
            event,
            custody_address(),
            block,
            0,
            H256::from_low_u64_be(block),
        );
        self.chain.push_log(log.clone()).await;
        log
    }

    /// Emit `event` and hand it to the engine.
    pub async fn process(&mut self, event: &CustodyEvent) -> HandleOutcome {
        let log = self.emit(event).await;
        self.handle(&log).await
    }

    pub async fn handle(&self, log: &RawLog) -> HandleOutcome {
        self.engine
            .handle_log(CHAIN_ID, log)
            .await
            .expect("handling should not fail")
    }

    pub fn last_block(&self) -> u64 {
        self.next_block - 1
    }

    pub fn channel(&self, n: u8) -> Channel {
        self.store
            .read(|tx| tx.channels().require(&channel_id(n)))
            .expect("channel should exist")
    }

    pub fn unified_balance(&self, n: u8) -> i128 {
        self.balance(&AccountId::Wallet(wallet(n)))
    }

    pub fn balance(&self, account: &AccountId) -> i128 {
        self.store
            .read(|tx| tx.ledger().balance(account, ASSET))
            .expect("balance read")
    }

    /// Sign the channel's current allocations at `version` on behalf of both sides.
    pub fn sign_state(&self, n: u8, version: u64) {
        let mut state: UnsignedState = self.channel(n).state;
        state.version = version;
        state.intent = Intent::Operate;
        self.store
            .transaction(|tx| {
                tx.channels().record_signed_state(
                    &channel_id(n),
                    state,
                    Signature(vec![0x01; 65]),
                    Signature(vec![0x02; 65]),
                )
            })
            .expect("signed state should be recorded");
    }

    pub fn snapshot(&self, channels: &[u8]) -> Snapshot {
        Snapshot::take(&self.store, channels)
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

// =========================================================================
// State comparison
// =========================================================================

/// Channel fields that must agree between two replays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelView {
    pub status: ChannelStatus,
    pub raw_amount: u128,
    pub version: u64,
    pub state: UnsignedState,
    pub signed: bool,
}

/// Timestamp-free view of the persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub channels: Vec<Option<ChannelView>>,
    pub balances: Vec<BTreeMap<String, i128>>,
    pub transactions: Vec<(TransactionType, AccountId, AccountId, String, u128)>,
    pub asset_totals: BTreeMap<String, i128>,
    pub events: usize,
    pub actions: usize,
}

impl Snapshot {
    pub fn take(store: &Store, channels: &[u8]) -> Self {
        store
            .read(|tx| {
                let mut views = Vec::new();
                let mut balances = Vec::new();
                for n in channels {
                    views.push(tx.channels().get(&channel_id(*n))?.map(|c| ChannelView {
                        signed: c.has_signed_state(),
                        status: c.status,
                        raw_amount: c.raw_amount,
                        version: c.version,
                        state: c.state,
                    }));
                    balances.push(tx.ledger().balances(&AccountId::Wallet(wallet(*n)))?);
                }
                let transactions = tx
                    .ledger()
                    .transactions()?
                    .into_iter()
                    .map(|t| (t.tx_type, t.from_account, t.to_account, t.asset_symbol, t.amount))
                    .collect();
                Ok::<_, StoreError>(Snapshot {
                    channels: views,
                    balances,
                    transactions,
                    asset_totals: tx.ledger().asset_totals()?,
                    events: tx.events().count(CHAIN_ID)?,
                    actions: tx.actions().list(None)?.len(),
                })
            })
            .expect("snapshot read")
    }

    /// Every asset's deltas sum to zero.
    pub fn ledger_closed(&self) -> bool {
        self.asset_totals.values().all(|total| *total == 0)
    }
}
