//! In-process chain: a [`LogSource`] and [`ChainSubmitter`] backed by memory.
//!
//! Used for local runs and tests. Logs are appended with [`MemoryChain::push_log`]
//! and fanned out to live subscribers; subscription failures, stream drops and
//! submission failures can be injected.

use async_trait::async_trait;
use clearnode_core::{Address, ChannelId, Signature, TxHash, UnsignedState, H256};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::error::ChainError;
use crate::source::{LogSource, LogSubscription, RawLog};
use crate::submitter::ChainSubmitter;

const SUBSCRIPTION_BUFFER: usize = 1024;

type LogSender = mpsc::Sender<Result<RawLog, ChainError>>;

/// A checkpoint received by the in-memory submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointCall {
    pub channel_id: ChannelId,
    pub state: UnsignedState,
    pub user_signature: Signature,
    pub server_signature: Signature,
    pub proofs: Vec<UnsignedState>,
}

#[derive(Default)]
pub struct MemoryChain {
    logs: Mutex<Vec<RawLog>>,
    subscribers: Mutex<Vec<(Address, LogSender)>>,
    head: AtomicU64,
    subscribe_calls: AtomicU32,
    failing_subscribes: AtomicU32,
    failing_submissions: AtomicU32,
    submissions: Mutex<Vec<CheckpointCall>>,
    tx_counter: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a log and deliver it to matching live subscribers.
    pub async fn push_log(&self, log: RawLog) {
        self.head.fetch_max(log.block_number, Ordering::SeqCst);
        let subscribers: Vec<LogSender> = {
            let subscribers = lock(&self.subscribers);
            lock(&self.logs).push(log.clone());
            subscribers
                .iter()
                .filter(|(contract, _)| *contract == log.address)
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        for tx in subscribers {
            let _ = tx.send(Ok(log.clone())).await;
        }
    }

    /// Advance the head without adding logs.
    pub fn set_head(&self, block: u64) {
        self.head.fetch_max(block, Ordering::SeqCst);
    }

    /// Make the next `n` subscribe calls fail.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.failing_subscribes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` submissions fail. `u32::MAX` fails every submission.
    pub fn fail_next_submissions(&self, n: u32) {
        self.failing_submissions.store(n, Ordering::SeqCst);
    }

    /// Report an error on every live subscription and end them.
    pub async fn break_subscriptions(&self, reason: &str) {
        let subscribers: Vec<_> = lock(&self.subscribers).drain(..).collect();
        for (_, tx) in subscribers {
            let _ = tx
                .send(Err(ChainError::Transport(reason.to_string())))
                .await;
        }
    }

    /// End every live subscription without an error.
    pub fn drop_subscriptions(&self) {
        lock(&self.subscribers).clear();
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn live_subscriptions(&self) -> usize {
        lock(&self.subscribers)
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }

    pub fn submissions(&self) -> Vec<CheckpointCall> {
        lock(&self.submissions).clone()
    }

    fn matching(&self, contract: Address, from_block: u64, to_block: u64) -> Vec<RawLog> {
        let mut logs: Vec<RawLog> = lock(&self.logs)
            .iter()
            .filter(|l| l.address == contract)
            .filter(|l| l.block_number >= from_block && l.block_number <= to_block)
            .cloned()
            .collect();
        logs.sort_by_key(RawLog::position);
        logs
    }

    /// Consume one unit of an injected-failure budget, if any remains.
    fn take_failure(budget: &AtomicU32) -> bool {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl LogSource for MemoryChain {
    async fn subscribe(
        &self,
        contract: Address,
        from_block: u64,
    ) -> Result<LogSubscription, ChainError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_subscribes) {
            return Err(ChainError::Transport("connection refused".into()));
        }

        let (tx, subscription) = LogSubscription::channel(SUBSCRIPTION_BUFFER);
        // Backlog and registration under the subscriber lock, so a concurrent
        // push is delivered exactly once.
        let mut subscribers = lock(&self.subscribers);
        for log in self.matching(contract, from_block, u64::MAX) {
            tx.try_send(Ok(log))
                .map_err(|e| ChainError::Transport(format!("backlog overflow: {e}")))?;
        }
        subscribers.push((contract, tx));
        Ok(subscription)
    }

    async fn fetch_logs(
        &self,
        contract: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, ChainError> {
        Ok(self.matching(contract, from_block, to_block))
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        Ok(self.head.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl ChainSubmitter for MemoryChain {
    async fn checkpoint(
        &self,
        channel_id: ChannelId,
        state: &UnsignedState,
        user_signature: &Signature,
        server_signature: &Signature,
        proofs: &[UnsignedState],
    ) -> Result<TxHash, ChainError> {
        if Self::take_failure(&self.failing_submissions) {
            return Err(ChainError::Submission("execution reverted".into()));
        }
        lock(&self.submissions).push(CheckpointCall {
            channel_id,
            state: state.clone(),
            user_signature: user_signature.clone(),
            server_signature: server_signature.clone(),
            proofs: proofs.to_vec(),
        });
        let n = self.tx_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(H256::from_low_u64_be(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clearnode_core::Intent;

    fn log(block: u64, index: u64, contract: Address) -> RawLog {
        RawLog {
            block_number: block,
            log_index: index,
            tx_hash: H256::from_low_u64_be(block * 100 + index),
            address: contract,
            topics: vec![H256::repeat_byte(1)],
            data: vec![],
        }
    }

    #[tokio::test]
    async fn test_subscribe_replays_backlog_then_streams() {
        let chain = MemoryChain::new();
        let contract = Address::repeat_byte(0xee);
        chain.push_log(log(5, 0, contract)).await;
        chain.push_log(log(10, 1, contract)).await;
        chain.push_log(log(10, 0, contract)).await;
        chain.push_log(log(12, 0, Address::repeat_byte(0x01))).await;

        let mut sub = chain.subscribe(contract, 6).await.unwrap();
        assert_eq!(sub.next().await.unwrap().unwrap().position(), (10, 0));
        assert_eq!(sub.next().await.unwrap().unwrap().position(), (10, 1));

        chain.push_log(log(11, 0, contract)).await;
        assert_eq!(sub.next().await.unwrap().unwrap().position(), (11, 0));

        chain.drop_subscriptions();
        assert!(sub.next().await.is_none());
        assert_eq!(chain.latest_block().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_injected_subscribe_failures() {
        let chain = MemoryChain::new();
        chain.fail_next_subscribes(2);
        assert!(chain.subscribe(Address::zero(), 0).await.is_err());
        assert!(chain.subscribe(Address::zero(), 0).await.is_err());
        assert!(chain.subscribe(Address::zero(), 0).await.is_ok());
        assert_eq!(chain.subscribe_calls(), 3);
    }

    #[tokio::test]
    async fn test_break_reports_error() {
        let chain = MemoryChain::new();
        let mut sub = chain.subscribe(Address::zero(), 0).await.unwrap();
        chain.break_subscriptions("node restarted").await;
        assert!(matches!(sub.next().await, Some(Err(ChainError::Transport(_)))));
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_submitter_records_and_fails_on_demand() {
        let chain = MemoryChain::new();
        let state = UnsignedState {
            intent: Intent::Operate,
            version: 5,
            data: vec![],
            allocations: vec![],
        };
        let sig = Signature(vec![1; 65]);

        chain.fail_next_submissions(1);
        assert!(chain
            .checkpoint(H256::zero(), &state, &sig, &sig, &[])
            .await
            .is_err());
        let hash = chain
            .checkpoint(H256::zero(), &state, &sig, &sig, &[])
            .await
            .unwrap();
        assert_eq!(hash, H256::from_low_u64_be(1));
        assert_eq!(chain.submissions().len(), 1);

        chain.fail_next_submissions(u32::MAX);
        for _ in 0..3 {
            assert!(chain
                .checkpoint(H256::zero(), &state, &sig, &sig, &[])
                .await
                .is_err());
        }
    }
}
