//! Chain log access.

use async_trait::async_trait;
use clearnode_core::{Address, TxHash, H256};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ChainError;

/// One contract log as delivered by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: TxHash,
    /// Emitting contract.
    pub address: Address,
    pub topics: Vec<H256>,
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
}

impl RawLog {
    /// Position of the log in the chain, for ordering and watermarks.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// A live log stream.
///
/// `Some(Ok(log))` is a delivery, `Some(Err(_))` a subscription failure, and
/// `None` a transient drop: the producer went away without reporting an error.
pub struct LogSubscription {
    rx: mpsc::Receiver<Result<RawLog, ChainError>>,
}

impl LogSubscription {
    pub fn new(rx: mpsc::Receiver<Result<RawLog, ChainError>>) -> Self {
        Self { rx }
    }

    /// A subscription plus the sender that feeds it.
    pub fn channel(buffer: usize) -> (mpsc::Sender<Result<RawLog, ChainError>>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }

    pub async fn next(&mut self) -> Option<Result<RawLog, ChainError>> {
        self.rx.recv().await
    }
}

/// Source of custody-contract logs for one chain.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Stream logs of `contract` starting at `from_block`, in chain order.
    async fn subscribe(&self, contract: Address, from_block: u64)
        -> Result<LogSubscription, ChainError>;

    /// Logs of `contract` in the closed range `[from_block, to_block]`, in chain order.
    async fn fetch_logs(
        &self,
        contract: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, ChainError>;

    /// Current head block number.
    async fn latest_block(&self) -> Result<u64, ChainError>;
}
