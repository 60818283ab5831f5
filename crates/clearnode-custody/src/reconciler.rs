//! Historical replay of a block range through the live handler path.

use std::sync::Arc;

use crate::engine::{CustodyEngine, HandleOutcome};
use crate::error::CustodyError;

/// Tally of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub chain_id: u64,
    pub from_block: u64,
    pub to_block: u64,
    pub logs_seen: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub discarded: usize,
}

pub struct Reconciler {
    engine: Arc<CustodyEngine>,
}

impl Reconciler {
    pub fn new(engine: Arc<CustodyEngine>) -> Self {
        Self { engine }
    }

    /// Replay `[start, end]` on `chain_id` in chunks of the chain's configured block step.
    pub async fn reconcile(
        &self,
        chain_id: u64,
        start: u64,
        end: u64,
    ) -> Result<ReconcileReport, CustodyError> {
        let step = self
            .engine
            .chains()
            .get(chain_id)
            .map_err(|e| CustodyError::validation(e.to_string()))?
            .block_step;
        self.reconcile_with_step(chain_id, start, end, step).await
    }

    /// Replay `[start, end]` fetching `step` blocks per request.
    ///
    /// Already-processed logs are counted as duplicates and change nothing, so
    /// overlapping or repeated ranges are safe. A storage failure stops the
    /// run; the range can be replayed once the cause is fixed.
    pub async fn reconcile_with_step(
        &self,
        chain_id: u64,
        start: u64,
        end: u64,
        step: u64,
    ) -> Result<ReconcileReport, CustodyError> {
        if start > end {
            return Err(CustodyError::validation(format!(
                "empty block range [{start}, {end}]"
            )));
        }
        if step == 0 {
            return Err(CustodyError::validation("block step must be positive"));
        }
        let entry = self
            .engine
            .chains()
            .get(chain_id)
            .map_err(|e| CustodyError::validation(e.to_string()))?;

        tracing::info!(chain_id, start, end, step, "reconciliation started");
        let mut report = ReconcileReport {
            chain_id,
            from_block: start,
            to_block: end,
            ..Default::default()
        };

        let mut from = start;
        loop {
            let to = from.saturating_add(step - 1).min(end);
            let logs = entry.source.fetch_logs(entry.custody, from, to).await?;
            tracing::debug!(chain_id, from, to, logs = logs.len(), "replaying chunk");

            for log in &logs {
                report.logs_seen += 1;
                match self.engine.handle_log(chain_id, log).await? {
                    HandleOutcome::Processed(_) => report.processed += 1,
                    HandleOutcome::Duplicate => report.duplicates += 1,
                    HandleOutcome::Discarded(_) => report.discarded += 1,
                }
            }

            if to >= end {
                break;
            }
            from = to + 1;
        }

        tracing::info!(
            chain_id,
            logs = report.logs_seen,
            processed = report.processed,
            duplicates = report.duplicates,
            discarded = report.discarded,
            "reconciliation finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NoopNotifier;
    use clearnode_chain::{
        ChainEntry, ChainRegistry, ChainState, ChannelParams, CustodyEvent, MemoryChain,
    };
    use clearnode_core::{
        AccountId, Address, Allocation, AssetConfig, ChainConfig, Intent, SettlementConfig, H256,
    };
    use clearnode_store::Store;

    const CHAIN: u64 = 1;

    fn setup() -> (Reconciler, Arc<MemoryChain>, Arc<CustodyEngine>) {
        let chain = Arc::new(MemoryChain::new());
        let mut registry = ChainRegistry::new();
        registry.insert(ChainEntry::new(
            &ChainConfig {
                chain_id: CHAIN,
                rpc_url: String::new(),
                custody_address: Address::repeat_byte(0xee),
                adjudicator_address: Address::repeat_byte(0xdd),
                start_block: 0,
                poll_interval_ms: 10,
                block_step: 3,
            },
            chain.clone(),
            chain.clone(),
        ));
        let config = SettlementConfig {
            broker_address: Address::repeat_byte(0xbb),
            assets: vec![AssetConfig {
                symbol: "usdc".into(),
                chain_id: CHAIN,
                token: Address::repeat_byte(0xcc),
                decimals: 6,
            }],
            ..Default::default()
        };
        let engine = Arc::new(
            CustodyEngine::new(&config, Store::memory(), Arc::new(registry), Arc::new(NoopNotifier))
                .unwrap(),
        );
        (Reconciler::new(engine.clone()), chain, engine)
    }

    async fn seed(chain: &MemoryChain, engine: &CustodyEngine) {
        let id = H256::repeat_byte(0x11);
        let created = CustodyEvent::Created {
            channel_id: id,
            wallet: Address::repeat_byte(0xaa),
            channel: ChannelParams {
                participants: vec![Address::repeat_byte(0xab), Address::repeat_byte(0xbb)],
                adjudicator: Address::repeat_byte(0xdd),
                challenge: 3600,
                nonce: 7,
            },
            initial: ChainState {
                intent: Intent::Initialize,
                version: 0,
                data: Vec::new(),
                allocations: vec![
                    Allocation {
                        destination: Address::repeat_byte(0xab),
                        token: Address::repeat_byte(0xcc),
                        amount: 100,
                    },
                    Allocation {
                        destination: Address::repeat_byte(0xbb),
                        token: Address::repeat_byte(0xcc),
                        amount: 0,
                    },
                ],
                sigs: Vec::new(),
            },
        };
        let events = [
            (2, created),
            (5, CustodyEvent::Resized { channel_id: id, deltas: vec![50, 0] }),
            (9, CustodyEvent::Resized { channel_id: id, deltas: vec![-20, 0] }),
        ];
        for (block, event) in events {
            let log = engine.abi().encode_log(
                &event,
                Address::repeat_byte(0xee),
                block,
                0,
                H256::from_low_u64_be(block),
            );
            chain.push_log(log).await;
        }
    }

    #[tokio::test]
    async fn test_replay_range_in_chunks() {
        let (reconciler, chain, engine) = setup();
        seed(&chain, &engine).await;

        let report = reconciler.reconcile(CHAIN, 0, 10).await.unwrap();
        assert_eq!(report.logs_seen, 3);
        assert_eq!(report.processed, 3);

        let balance = engine
            .store()
            .read(|tx| tx.ledger().balance(&AccountId::Wallet(Address::repeat_byte(0xaa)), "usdc"))
            .unwrap();
        assert_eq!(balance, 130);

        let again = reconciler.reconcile(CHAIN, 0, 10).await.unwrap();
        assert_eq!(again.processed, 0);
        assert_eq!(again.duplicates, 3);
    }

    #[tokio::test]
    async fn test_partial_ranges() {
        let (reconciler, chain, engine) = setup();
        seed(&chain, &engine).await;

        let first = reconciler.reconcile_with_step(CHAIN, 0, 5, 1).await.unwrap();
        assert_eq!(first.processed, 2);
        let second = reconciler.reconcile_with_step(CHAIN, 6, 6, 10).await.unwrap();
        assert_eq!(second.logs_seen, 0);
        let third = reconciler.reconcile_with_step(CHAIN, 7, 9, 10).await.unwrap();
        assert_eq!(third.processed, 1);
    }

    #[tokio::test]
    async fn test_invalid_ranges() {
        let (reconciler, _, _) = setup();
        assert!(reconciler.reconcile(CHAIN, 10, 5).await.unwrap_err().is_validation());
        assert!(reconciler
            .reconcile_with_step(CHAIN, 0, 5, 0)
            .await
            .unwrap_err()
            .is_validation());
        assert!(reconciler.reconcile(99, 0, 5).await.unwrap_err().is_validation());
    }
}
