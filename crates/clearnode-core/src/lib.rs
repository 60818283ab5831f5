//! Clearnode core types.
//!
//! Shared vocabulary for the settlement core: payment channels and their
//! signed states, the records persisted for audit and follow-up work, ledger
//! accounts, and the node configuration.

pub mod config;
pub mod error;
pub mod records;
pub mod state_machine;
pub mod types;

pub use config::{
    AssetConfig, ChainConfig, ListenerConfig, SettlementConfig, StorageConfig, WorkerConfig,
};
pub use error::CoreError;
pub use records::{
    ActionStatus, ActionType, BlockchainAction, ContractEvent, EventKey, LedgerTransaction,
    TransactionType,
};
pub use state_machine::{ChannelEvent, ChannelStateMachine, ChannelStatus};
pub use types::{
    format_units, to_signed, AccountId, Address, Allocation, Asset, Channel, ChannelId, Intent, Signature,
    TxHash, UnsignedState, H256, U256,
};
