//! Durable queue of follow-up blockchain actions.

use chrono::Utc;
use clearnode_core::{ActionStatus, BlockchainAction};

use crate::backend::Table;
use crate::error::StoreError;
use crate::tx::{seq_key, StoreTx};

const ACTION_SEQUENCE: &str = "blockchain_actions";

/// Action-queue access within a transaction.
///
/// Non-terminal actions are also indexed in [`Table::PendingActions`] by id,
/// so the worker can read the oldest pending batch without a full scan.
pub struct ActionQueue<'t, 'a> {
    tx: &'t mut StoreTx<'a>,
}

impl<'t, 'a> ActionQueue<'t, 'a> {
    pub(crate) fn new(tx: &'t mut StoreTx<'a>) -> Self {
        Self { tx }
    }

    /// Persist a new action, assigning its id. The stored action is returned.
    pub fn enqueue(&mut self, mut action: BlockchainAction) -> Result<BlockchainAction, StoreError> {
        action.id = self.tx.next_sequence(ACTION_SEQUENCE)?;
        action.status = ActionStatus::Pending;
        let key = seq_key(action.id);
        self.tx.put_json(Table::Actions, key.as_bytes(), &action)?;
        self.tx.put(Table::PendingActions, key.as_bytes(), Vec::new());
        tracing::debug!(
            id = action.id,
            action_type = %action.action_type,
            channel_id = ?action.channel_id,
            "action enqueued"
        );
        Ok(action)
    }

    /// Overwrite a stored action, keeping the pending index in step.
    pub fn update(&mut self, action: &BlockchainAction) -> Result<(), StoreError> {
        let key = seq_key(action.id);
        if self.tx.get(Table::Actions, key.as_bytes())?.is_none() {
            return Err(StoreError::NotFound(format!("action {}", action.id)));
        }
        let mut action = action.clone();
        action.updated_at = Utc::now();
        self.tx.put_json(Table::Actions, key.as_bytes(), &action)?;
        if action.status.is_terminal() {
            self.tx.delete(Table::PendingActions, key.as_bytes());
        } else {
            self.tx.put(Table::PendingActions, key.as_bytes(), Vec::new());
        }
        Ok(())
    }

    pub fn get(&self, id: u64) -> Result<Option<BlockchainAction>, StoreError> {
        self.tx.get_json(Table::Actions, seq_key(id).as_bytes())
    }

    /// Up to `limit` pending actions, oldest first.
    pub fn pending_batch(&self, limit: usize) -> Result<Vec<BlockchainAction>, StoreError> {
        let mut batch = Vec::with_capacity(limit);
        for (key, _) in self.tx.scan_prefix(Table::PendingActions, b"")? {
            if batch.len() >= limit {
                break;
            }
            match self.tx.get_json::<BlockchainAction>(Table::Actions, &key)? {
                Some(action) if action.status == ActionStatus::Pending => batch.push(action),
                Some(_) => {}
                None => {
                    tracing::warn!(key = %String::from_utf8_lossy(&key), "pending index points at missing action");
                }
            }
        }
        Ok(batch)
    }

    /// All actions, optionally filtered by status, oldest first.
    pub fn list(&self, status: Option<ActionStatus>) -> Result<Vec<BlockchainAction>, StoreError> {
        let mut actions = Vec::new();
        for (_, value) in self.tx.scan_prefix(Table::Actions, b"")? {
            let action: BlockchainAction = serde_json::from_slice(&value)?;
            if status.map_or(true, |s| action.status == s) {
                actions.push(action);
            }
        }
        Ok(actions)
    }
}
