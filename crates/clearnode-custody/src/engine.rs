//! Custody engine: turns decoded custody-contract events into registry,
//! ledger and action-queue mutations.
//!
//! Every log is handled in one storage transaction that first stores the
//! event under its idempotency key and then runs the per-event handler. A
//! redelivered log fails the insert and the whole transaction is dropped.
//! Notifications are computed inside the transaction and delivered only
//! after it commits.

use chrono::Utc;
use clearnode_chain::{
    ChainEntry, ChainRegistry, ChainState, ChannelParams, CustodyAbi, CustodyEvent, EventKind,
    RawLog,
};
use clearnode_core::{
    format_units, to_signed, AccountId, ActionType, Address, Asset, BlockchainAction, Channel,
    ChannelEvent, ChannelId, ChannelStateMachine, ChannelStatus, ContractEvent, CoreError,
    EventKey, Intent, LedgerTransaction, SettlementConfig, TransactionType,
};
use clearnode_store::{Store, StoreTx};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::CustodyError;
use crate::notify::{deliver, Notification, NotificationKind, Notifier};
use crate::worker::CheckpointPayload;

/// Result of handling one log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The event was applied and committed.
    Processed(EventKind),
    /// The log was handled by an earlier delivery; nothing changed.
    Duplicate,
    /// The log was rejected and will not be retried.
    Discarded(String),
}

pub struct CustodyEngine {
    store: Store,
    chains: Arc<ChainRegistry>,
    notifier: Arc<dyn Notifier>,
    abi: CustodyAbi,
    broker: Address,
    challenge_floor: u64,
    assets: HashMap<(u64, Address), Asset>,
    decimals: HashMap<String, u8>,
}

impl CustodyEngine {
    /// Build the engine. Fails if the event topic table cannot be derived.
    pub fn new(
        config: &SettlementConfig,
        store: Store,
        chains: Arc<ChainRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, CustodyError> {
        let abi = CustodyAbi::new()?;
        let mut assets = HashMap::new();
        let mut decimals = HashMap::new();
        for cfg in &config.assets {
            let asset = Asset::from(cfg);
            decimals.insert(asset.symbol.clone(), asset.decimals);
            assets.insert((asset.chain_id, asset.token), asset);
        }
        Ok(Self {
            store,
            chains,
            notifier,
            abi,
            broker: config.broker_address,
            challenge_floor: config.challenge_period_floor_secs,
            assets,
            decimals,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn chains(&self) -> &Arc<ChainRegistry> {
        &self.chains
    }

    pub fn abi(&self) -> &CustodyAbi {
        &self.abi
    }

    /// Handle one custody-contract log from `chain_id`.
    ///
    /// Returns `Err` only for failures worth retrying (storage, serialization).
    /// Malformed, foreign and policy-violating logs come back as
    /// [`HandleOutcome::Discarded`].
    pub async fn handle_log(
        &self,
        chain_id: u64,
        log: &RawLog,
    ) -> Result<HandleOutcome, CustodyError> {
        let entry = match self.chains.get(chain_id) {
            Ok(entry) => entry,
            Err(e) => return Ok(self.discard(chain_id, log, e.to_string())),
        };
        if log.address != entry.custody {
            let reason = format!("log from foreign contract {:?}", log.address);
            return Ok(self.discard(chain_id, log, reason));
        }

        let event = match self.abi.decode(log) {
            Ok(Some(event)) => event,
            Ok(None) => {
                let topic = log.topics.first().copied().unwrap_or_default();
                return Ok(self.discard(chain_id, log, format!("unrecognized topic {topic:?}")));
            }
            Err(e) => return Ok(self.discard(chain_id, log, e.to_string())),
        };

        let record = ContractEvent {
            key: EventKey {
                chain_id,
                contract: log.address,
                tx_hash: log.tx_hash,
                log_index: log.log_index,
            },
            name: event.kind().name().to_string(),
            block_number: log.block_number,
            payload: event.snapshot()?,
            created_at: Utc::now(),
        };

        let result = self.store.transaction(|tx| {
            tx.events().store(&record)?;
            self.apply(tx, entry, &event)
        });

        match result {
            Ok(notifications) => {
                tracing::info!(
                    chain_id,
                    block = log.block_number,
                    log_index = log.log_index,
                    channel_id = ?event.channel_id(),
                    event = %event.kind(),
                    "custody event processed"
                );
                deliver(self.notifier.as_ref(), notifications).await;
                Ok(HandleOutcome::Processed(event.kind()))
            }
            Err(e) if e.is_duplicate() => {
                tracing::debug!(
                    chain_id,
                    tx_hash = ?log.tx_hash,
                    log_index = log.log_index,
                    "custody event already processed"
                );
                Ok(HandleOutcome::Duplicate)
            }
            Err(CustodyError::Validation(reason)) => Ok(self.discard(chain_id, log, reason)),
            Err(e) => Err(e),
        }
    }

    fn discard(&self, chain_id: u64, log: &RawLog, reason: String) -> HandleOutcome {
        tracing::warn!(
            chain_id,
            block = log.block_number,
            log_index = log.log_index,
            tx_hash = ?log.tx_hash,
            reason = %reason,
            "custody event discarded"
        );
        HandleOutcome::Discarded(reason)
    }

    fn apply(
        &self,
        tx: &mut StoreTx<'_>,
        entry: &ChainEntry,
        event: &CustodyEvent,
    ) -> Result<Vec<Notification>, CustodyError> {
        match event {
            CustodyEvent::Created {
                channel_id,
                wallet,
                channel,
                initial,
            } => self.on_created(tx, entry, *channel_id, *wallet, channel, initial),
            CustodyEvent::Challenged {
                channel_id,
                state,
                expiration,
            } => self.on_challenged(tx, entry, *channel_id, state, *expiration),
            CustodyEvent::Resized { channel_id, deltas } => {
                self.on_resized(tx, entry, *channel_id, deltas)
            }
            CustodyEvent::Closed {
                channel_id,
                final_state,
            } => self.on_closed(tx, entry, *channel_id, final_state),
        }
    }

    fn on_created(
        &self,
        tx: &mut StoreTx<'_>,
        entry: &ChainEntry,
        channel_id: ChannelId,
        wallet: Address,
        params: &ChannelParams,
        initial: &ChainState,
    ) -> Result<Vec<Notification>, CustodyError> {
        if params.participants.len() != 2 {
            return Err(CustodyError::validation(format!(
                "expected 2 participants, got {}",
                params.participants.len()
            )));
        }
        if initial.allocations.len() != 2 {
            return Err(CustodyError::validation(format!(
                "expected 2 initial allocations, got {}",
                initial.allocations.len()
            )));
        }
        if initial.allocations[1].amount != 0 {
            return Err(CustodyError::validation(format!(
                "broker allocation must be zero, got {}",
                initial.allocations[1].amount
            )));
        }
        if params.challenge < self.challenge_floor {
            return Err(CustodyError::validation(format!(
                "challenge period {}s below minimum {}s",
                params.challenge, self.challenge_floor
            )));
        }
        if params.adjudicator != entry.adjudicator {
            return Err(CustodyError::validation(format!(
                "unsupported adjudicator {:?}",
                params.adjudicator
            )));
        }
        if params.participants[1] != self.broker {
            return Err(CustodyError::validation(format!(
                "second participant {:?} is not the broker",
                params.participants[1]
            )));
        }

        let token = initial.allocations[0].token;
        let asset = self.asset(entry.chain_id, &token)?;
        let signer = params.participants[0];

        tx.channels().put_signer(&signer, &wallet)?;
        if tx.channels().get(&channel_id)?.is_some() {
            return Err(CustodyError::validation(format!(
                "channel {channel_id:?} already exists"
            )));
        }
        if let Some(open) = tx.channels().find_open(&wallet, &token, entry.chain_id)? {
            return Err(CustodyError::validation(format!(
                "wallet already has open channel {:?} for this token",
                open.channel_id
            )));
        }

        let state = initial.unsigned();
        let now = Utc::now();
        let channel = Channel {
            channel_id,
            wallet,
            participants: [signer, params.participants[1]],
            token,
            chain_id: entry.chain_id,
            nonce: params.nonce,
            challenge_period: params.challenge,
            adjudicator: params.adjudicator,
            status: ChannelStatus::Open,
            raw_amount: state.total(),
            version: state.version,
            state,
            user_signature: None,
            server_signature: None,
            created_at: now,
            updated_at: now,
        };
        tx.channels().insert(&channel)?;

        let mut notifications = vec![channel_notification(&channel)?];
        if channel.raw_amount > 0 {
            let record = post_deposit(tx, &channel, &asset.symbol, channel.raw_amount)?;
            notifications.push(transfer_notification(wallet, &record)?);
        }
        notifications.push(self.balance_notification(tx, wallet)?);
        Ok(notifications)
    }

    fn on_challenged(
        &self,
        tx: &mut StoreTx<'_>,
        entry: &ChainEntry,
        channel_id: ChannelId,
        state: &ChainState,
        expiration: u64,
    ) -> Result<Vec<Notification>, CustodyError> {
        let mut channel = require_channel(tx, &channel_id)?;
        let next = transition(channel.status, ChannelEvent::Challenged)?;

        match (&channel.user_signature, &channel.server_signature) {
            (Some(user), Some(server)) if state.version < channel.version => {
                let payload = CheckpointPayload {
                    state: channel.state.clone(),
                    user_signature: user.clone(),
                    server_signature: server.clone(),
                    proofs: Vec::new(),
                };
                let action = tx.actions().enqueue(BlockchainAction::pending(
                    ActionType::Checkpoint,
                    channel_id,
                    entry.chain_id,
                    serde_json::to_value(&payload)?,
                ))?;
                tracing::info!(
                    channel_id = ?channel_id,
                    action_id = action.id,
                    challenged_version = state.version,
                    local_version = channel.version,
                    "checkpoint queued against stale challenge"
                );
            }
            _ => {
                tracing::info!(
                    channel_id = ?channel_id,
                    challenged_version = state.version,
                    local_version = channel.version,
                    signed = channel.has_signed_state(),
                    "no newer signed state, challenge left unanswered"
                );
            }
        }

        channel.status = next;
        channel.updated_at = Utc::now();
        tx.channels().update(&channel)?;
        tracing::info!(channel_id = ?channel_id, expiration, "channel challenged");

        Ok(vec![channel_notification(&channel)?])
    }

    fn on_resized(
        &self,
        tx: &mut StoreTx<'_>,
        entry: &ChainEntry,
        channel_id: ChannelId,
        deltas: &[i128],
    ) -> Result<Vec<Notification>, CustodyError> {
        let mut channel = require_channel(tx, &channel_id)?;
        let next = transition(channel.status, ChannelEvent::Resized)?;
        let asset = self.asset(entry.chain_id, &channel.token)?;

        if deltas.len() != channel.state.allocations.len() {
            return Err(CustodyError::validation(format!(
                "resize carries {} deltas for {} allocations",
                deltas.len(),
                channel.state.allocations.len()
            )));
        }

        let overflow = || CustodyError::validation("resize amount overflow");
        let mut total = signed(channel.raw_amount)?;
        for delta in deltas {
            total = total.checked_add(*delta).ok_or_else(overflow)?;
        }
        if total < 0 {
            return Err(CustodyError::validation(format!(
                "resize would leave channel amount at {total}"
            )));
        }

        let mut allocations = channel.state.allocations.clone();
        for (allocation, delta) in allocations.iter_mut().zip(deltas) {
            let amount = signed(allocation.amount)?
                .checked_add(*delta)
                .ok_or_else(overflow)?;
            allocation.amount = u128::try_from(amount).map_err(|_| {
                CustodyError::validation(format!(
                    "resize would leave allocation for {:?} at {amount}",
                    allocation.destination
                ))
            })?;
        }

        channel.raw_amount = total.unsigned_abs();
        channel.version = channel.version.saturating_add(1);
        channel.state.version = channel.version;
        channel.state.intent = Intent::Resize;
        channel.state.allocations = allocations;
        channel.clear_signatures();
        channel.status = next;
        channel.updated_at = Utc::now();
        tx.channels().update(&channel)?;

        let mut notifications = Vec::new();
        let participant_delta = deltas.first().copied().unwrap_or(0);
        let amount = participant_delta.unsigned_abs();
        if participant_delta > 0 {
            let record = post_deposit(tx, &channel, &asset.symbol, amount)?;
            notifications.push(transfer_notification(channel.wallet, &record)?);
        } else if participant_delta < 0 {
            let record = post_withdrawal(tx, &channel, &asset.symbol, amount)?;
            notifications.push(transfer_notification(channel.wallet, &record)?);
        }
        tracing::info!(
            channel_id = ?channel_id,
            version = channel.version,
            raw_amount = %channel.raw_amount,
            "channel resized"
        );

        notifications.push(self.balance_notification(tx, channel.wallet)?);
        notifications.push(channel_notification(&channel)?);
        Ok(notifications)
    }

    fn on_closed(
        &self,
        tx: &mut StoreTx<'_>,
        entry: &ChainEntry,
        channel_id: ChannelId,
        final_state: &ChainState,
    ) -> Result<Vec<Notification>, CustodyError> {
        let mut channel = require_channel(tx, &channel_id)?;
        let next = transition(channel.status, ChannelEvent::Closed)?;
        let asset = self.asset(entry.chain_id, &channel.token)?;

        let participant = channel.participant();
        let settlement = final_state
            .allocations
            .iter()
            .find(|a| a.destination == participant)
            .or_else(|| final_state.allocations.first())
            .map_or(0, |a| a.amount);

        let mut notifications = Vec::new();
        if settlement > 0 {
            let record = post_withdrawal(tx, &channel, &asset.symbol, settlement)?;
            notifications.push(transfer_notification(channel.wallet, &record)?);
        }
        release_escrow(tx, &channel, &asset.symbol)?;

        let state = final_state.unsigned();
        channel.version = channel.version.max(state.version);
        channel.state = state;
        channel.state.version = channel.version;
        channel.clear_signatures();
        channel.status = next;
        channel.raw_amount = 0;
        channel.updated_at = Utc::now();
        tx.channels().update(&channel)?;
        tracing::info!(
            channel_id = ?channel_id,
            settlement = %settlement,
            version = channel.version,
            "channel closed"
        );

        notifications.push(self.balance_notification(tx, channel.wallet)?);
        notifications.push(channel_notification(&channel)?);
        Ok(notifications)
    }

    fn asset(&self, chain_id: u64, token: &Address) -> Result<Asset, CustodyError> {
        self.assets
            .get(&(chain_id, *token))
            .cloned()
            .ok_or_else(|| {
                CustodyError::validation(format!("unknown token {token:?} on chain {chain_id}"))
            })
    }

    fn balance_notification(
        &self,
        tx: &mut StoreTx<'_>,
        wallet: Address,
    ) -> Result<Notification, CustodyError> {
        let balances = tx.ledger().balances(&AccountId::Wallet(wallet))?;
        let payload: Vec<_> = balances
            .iter()
            .map(|(symbol, raw)| {
                let decimals = self.decimals.get(symbol).copied().unwrap_or(0);
                json!({ "asset": symbol, "amount": format_units(*raw, decimals) })
            })
            .collect();
        Ok(Notification::new(
            wallet,
            NotificationKind::BalanceUpdate,
            json!({ "balances": payload }),
        ))
    }
}

fn require_channel(tx: &mut StoreTx<'_>, channel_id: &ChannelId) -> Result<Channel, CustodyError> {
    tx.channels()
        .get(channel_id)?
        .ok_or_else(|| CustodyError::validation(format!("unknown channel {channel_id:?}")))
}

fn transition(current: ChannelStatus, event: ChannelEvent) -> Result<ChannelStatus, CustodyError> {
    ChannelStateMachine::transition(current, event).map_err(|e| match e {
        CoreError::InvalidStateTransition { .. } => CustodyError::validation(e.to_string()),
        other => CustodyError::Core(other),
    })
}

fn signed(raw: u128) -> Result<i128, CustodyError> {
    to_signed(raw).map_err(|e| CustodyError::validation(e.to_string()))
}

/// Funds arriving through the custody contract: custody to channel escrow,
/// passed through to the wallet's unified balance.
fn post_deposit(
    tx: &mut StoreTx<'_>,
    channel: &Channel,
    asset: &str,
    amount: u128,
) -> Result<LedgerTransaction, CustodyError> {
    let delta = signed(amount)?;
    let custody = AccountId::Custody {
        chain_id: channel.chain_id,
    };
    let escrow = AccountId::Channel(channel.channel_id);
    let unified = AccountId::Wallet(channel.wallet);

    let mut ledger = tx.ledger();
    ledger.record(&custody, asset, -delta)?;
    ledger.record(&escrow, asset, delta)?;
    ledger.record(&escrow, asset, -delta)?;
    ledger.record(&unified, asset, delta)?;
    Ok(ledger.record_transaction(TransactionType::Deposit, &escrow, &unified, asset, amount)?)
}

/// Funds leaving through the custody contract. The unified balance is debited
/// before the escrow leg.
fn post_withdrawal(
    tx: &mut StoreTx<'_>,
    channel: &Channel,
    asset: &str,
    amount: u128,
) -> Result<LedgerTransaction, CustodyError> {
    let delta = signed(amount)?;
    let custody = AccountId::Custody {
        chain_id: channel.chain_id,
    };
    let escrow = AccountId::Channel(channel.channel_id);
    let unified = AccountId::Wallet(channel.wallet);

    let mut ledger = tx.ledger();
    ledger.record(&unified, asset, -delta)?;
    ledger.record(&escrow, asset, delta)?;
    ledger.record(&escrow, asset, -delta)?;
    ledger.record(&custody, asset, delta)?;
    Ok(ledger.record_transaction(TransactionType::Withdrawal, &unified, &escrow, asset, amount)?)
}

/// Zero the channel escrow account against custody.
fn release_escrow(tx: &mut StoreTx<'_>, channel: &Channel, asset: &str) -> Result<(), CustodyError> {
    let escrow = AccountId::Channel(channel.channel_id);
    let mut ledger = tx.ledger();
    let residual = ledger.balance(&escrow, asset)?;
    if residual != 0 {
        tracing::warn!(channel_id = ?channel.channel_id, residual = %residual, "releasing residual escrow");
        ledger.record(&escrow, asset, -residual)?;
        ledger.record(
            &AccountId::Custody {
                chain_id: channel.chain_id,
            },
            asset,
            residual,
        )?;
    }
    Ok(())
}

fn channel_notification(channel: &Channel) -> Result<Notification, CustodyError> {
    Ok(Notification::new(
        channel.wallet,
        NotificationKind::ChannelUpdate,
        serde_json::to_value(channel)?,
    ))
}

fn transfer_notification(
    wallet: Address,
    record: &LedgerTransaction,
) -> Result<Notification, CustodyError> {
    Ok(Notification::new(
        wallet,
        NotificationKind::Transfer,
        serde_json::to_value(record)?,
    ))
}
