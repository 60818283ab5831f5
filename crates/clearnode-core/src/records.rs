//! Persisted records: the contract-event audit trail, follow-up blockchain
//! actions, and ledger transactions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{amount_str, AccountId, Address, ChannelId, TxHash};

/// Idempotency key of an on-chain log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub chain_id: u64,
    pub contract: Address,
    pub tx_hash: TxHash,
    pub log_index: u64,
}

impl EventKey {
    pub fn storage_key(&self) -> String {
        format!(
            "{}:{}:{}:{:010}",
            self.chain_id,
            hex::encode(self.contract.as_bytes()),
            hex::encode(self.tx_hash.as_bytes()),
            self.log_index
        )
    }
}

/// Immutable audit record of a processed custody-contract log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractEvent {
    pub key: EventKey,
    pub name: String,
    pub block_number: u64,
    /// Snapshot of the decoded event.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Kind of follow-up chain transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Checkpoint,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Checkpoint => write!(f, "checkpoint"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Completed,
    Failed,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A durable unit of follow-up on-chain work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockchainAction {
    /// Queue position; assigned on enqueue, increasing.
    pub id: u64,
    pub action_type: ActionType,
    pub channel_id: ChannelId,
    pub chain_id: u64,
    pub payload: serde_json::Value,
    pub status: ActionStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub tx_hash: Option<TxHash>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BlockchainAction {
    /// A new pending action. The id is assigned by the queue.
    pub fn pending(
        action_type: ActionType,
        channel_id: ChannelId,
        chain_id: u64,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            action_type,
            channel_id,
            chain_id,
            payload,
            status: ActionStatus::Pending,
            retry_count: 0,
            last_error: None,
            tx_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn complete(&mut self, tx_hash: TxHash) {
        self.status = ActionStatus::Completed;
        self.tx_hash = Some(tx_hash);
        self.updated_at = Utc::now();
    }

    /// Record a retryable failure. The action stays pending until
    /// `max_retries` failures have been recorded.
    pub fn record_failure(&mut self, error: impl Into<String>, max_retries: u32) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.into());
        if self.retry_count >= max_retries {
            self.status = ActionStatus::Failed;
        }
        self.updated_at = Utc::now();
    }

    /// Mark the action failed without consuming the retry budget.
    pub fn fail_permanently(&mut self, error: impl Into<String>) {
        self.status = ActionStatus::Failed;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Transfer,
    Deposit,
    Withdrawal,
    AppDeposit,
    AppWithdrawal,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transfer => write!(f, "transfer"),
            Self::Deposit => write!(f, "deposit"),
            Self::Withdrawal => write!(f, "withdrawal"),
            Self::AppDeposit => write!(f, "app_deposit"),
            Self::AppWithdrawal => write!(f, "app_withdrawal"),
        }
    }
}

/// Immutable record of one balanced money movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: u64,
    pub tx_type: TransactionType,
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub asset_symbol: String,
    /// Absolute amount in raw units of the asset.
    #[serde(with = "amount_str")]
    pub amount: u128,
    pub created_at: DateTime<Utc>,
}
