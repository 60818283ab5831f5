use clearnode_chain::{AbiError, ChainError};
use clearnode_core::{ChannelId, CoreError};
use clearnode_store::StoreError;

/// Errors from handling a custody event.
#[derive(Debug, thiserror::Error)]
pub enum CustodyError {
    /// The event is malformed or violates policy. Handling it again gives
    /// the same result, so callers log and discard it.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("abi error: {0}")]
    Abi(#[from] AbiError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CustodyError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_already_processed())
    }
}

/// Fatal listener conditions, reported to the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("chain {chain_id}: subscription failed {attempts} times in a row, last error: {last_error}")]
    RetriesExhausted {
        chain_id: u64,
        attempts: u32,
        last_error: String,
    },

    #[error("chain {chain_id}: log {block_number}:{log_index} still failing after {attempts} attempts: {source}")]
    HandlerFailed {
        chain_id: u64,
        block_number: u64,
        log_index: u64,
        attempts: u32,
        source: CustodyError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// The action payload cannot be decoded. Never retried.
    #[error("undecodable payload: {0}")]
    Decode(String),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("unknown channel {0:?}")]
    UnknownChannel(ChannelId),

    /// The channel closed before the action ran. Never retried.
    #[error("channel {0:?} already closed")]
    ChannelClosed(ChannelId),
}

impl WorkerError {
    /// Whether retrying the same action could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Decode(_)
                | Self::UnknownChannel(_)
                | Self::ChannelClosed(_)
                | Self::Chain(ChainError::UnknownChain(_))
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Custody(#[from] CustodyError),

    #[error("task failed: {0}")]
    Task(String),
}
