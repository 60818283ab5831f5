//! Action worker: drains the blockchain action queue into the chain submitters.

use chrono::Utc;
use clearnode_chain::ChainRegistry;
use clearnode_core::{
    ActionStatus, ActionType, BlockchainAction, ChannelEvent, ChannelId, ChannelStateMachine,
    Signature, TxHash, UnsignedState, WorkerConfig,
};
use clearnode_store::{Store, StoreError, StoreTx};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::WorkerError;

/// Payload of a checkpoint action: the signed state to put on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub state: UnsignedState,
    pub user_signature: Signature,
    pub server_signature: Signature,
    #[serde(default)]
    pub proofs: Vec<UnsignedState>,
}

/// Counts from one pass over the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub completed: usize,
    /// Failed but left pending for a later pass.
    pub retried: usize,
    pub failed: usize,
    /// Dropped without submitting because the channel had already closed.
    pub skipped: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.completed + self.retried + self.failed + self.skipped
    }
}

/// The only writer of action rows after they are enqueued.
pub struct ActionWorker {
    store: Store,
    chains: Arc<ChainRegistry>,
    config: WorkerConfig,
}

impl ActionWorker {
    pub fn new(store: Store, chains: Arc<ChainRegistry>, config: WorkerConfig) -> Self {
        Self {
            store,
            chains,
            config,
        }
    }

    /// Process a batch every poll interval until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "action worker started"
        );

        loop {
            tokio::select! {
                _ = crate::stopped(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }
            match self.process_batch().await {
                Ok(report) if report.total() > 0 => {
                    tracing::debug!(
                        completed = report.completed,
                        retried = report.retried,
                        failed = report.failed,
                        skipped = report.skipped,
                        "action batch processed"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "action batch aborted"),
            }
        }
        tracing::info!("action worker stopped");
    }

    /// Take the oldest pending actions and run each one in turn.
    pub async fn process_batch(&self) -> Result<BatchReport, WorkerError> {
        let batch = self
            .store
            .read(|tx| tx.actions().pending_batch(self.config.batch_size))?;

        let mut report = BatchReport::default();
        for mut action in batch {
            match self.execute(&action).await {
                Ok(tx_hash) => {
                    action.complete(tx_hash);
                    report.completed += 1;
                    tracing::info!(
                        action_id = action.id,
                        channel_id = ?action.channel_id,
                        tx_hash = ?tx_hash,
                        "action completed"
                    );
                }
                Err(e @ WorkerError::ChannelClosed(_)) => {
                    action.fail_permanently(e.to_string());
                    report.skipped += 1;
                    tracing::info!(
                        action_id = action.id,
                        channel_id = ?action.channel_id,
                        "channel closed, action dropped without submission"
                    );
                }
                Err(e) if e.is_retryable() => {
                    action.record_failure(e.to_string(), self.config.max_retries);
                    if action.status == ActionStatus::Failed {
                        report.failed += 1;
                        tracing::error!(
                            action_id = action.id,
                            channel_id = ?action.channel_id,
                            retries = action.retry_count,
                            error = %e,
                            "action failed, retry budget exhausted"
                        );
                    } else {
                        report.retried += 1;
                        tracing::warn!(
                            action_id = action.id,
                            channel_id = ?action.channel_id,
                            retries = action.retry_count,
                            error = %e,
                            "action failed, will retry"
                        );
                    }
                }
                Err(e) => {
                    action.fail_permanently(e.to_string());
                    report.failed += 1;
                    tracing::error!(
                        action_id = action.id,
                        channel_id = ?action.channel_id,
                        error = %e,
                        "action failed permanently"
                    );
                }
            }
            self.store.transaction(|tx| {
                if action.status == ActionStatus::Completed {
                    reopen_after_checkpoint(tx, &action.channel_id)?;
                }
                tx.actions().update(&action)
            })?;
        }
        Ok(report)
    }

    async fn execute(&self, action: &BlockchainAction) -> Result<TxHash, WorkerError> {
        let channel = self
            .store
            .read(|tx| tx.channels().get(&action.channel_id))?
            .ok_or(WorkerError::UnknownChannel(action.channel_id))?;
        if channel.status.is_final() {
            return Err(WorkerError::ChannelClosed(action.channel_id));
        }

        match action.action_type {
            ActionType::Checkpoint => {
                let payload: CheckpointPayload = serde_json::from_value(action.payload.clone())
                    .map_err(|e| WorkerError::Decode(e.to_string()))?;
                let entry = self.chains.get(action.chain_id)?;
                let tx_hash = entry
                    .submitter
                    .checkpoint(
                        action.channel_id,
                        &payload.state,
                        &payload.user_signature,
                        &payload.server_signature,
                        &payload.proofs,
                    )
                    .await?;
                Ok(tx_hash)
            }
        }
    }
}

/// An accepted checkpoint ends the dispute on chain; mirror that locally.
/// A channel that closed in the meantime is left alone.
fn reopen_after_checkpoint(
    tx: &mut StoreTx<'_>,
    channel_id: &ChannelId,
) -> Result<(), StoreError> {
    let Some(mut channel) = tx.channels().get(channel_id)? else {
        return Ok(());
    };
    let Ok(next) = ChannelStateMachine::transition(channel.status, ChannelEvent::Checkpointed) else {
        return Ok(());
    };
    if next != channel.status {
        channel.status = next;
        channel.updated_at = Utc::now();
        tx.channels().update(&channel)?;
        tracing::info!(channel_id = ?channel_id, "dispute resolved by checkpoint, channel open");
    }
    Ok(())
}
