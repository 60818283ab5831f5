//! Idempotency ledger of processed contract events.

use clearnode_core::{ContractEvent, EventKey};

use crate::backend::Table;
use crate::error::StoreError;
use crate::tx::StoreTx;

/// Contract-event table access within a transaction.
pub struct EventStore<'t, 'a> {
    tx: &'t mut StoreTx<'a>,
}

impl<'t, 'a> EventStore<'t, 'a> {
    pub(crate) fn new(tx: &'t mut StoreTx<'a>) -> Self {
        Self { tx }
    }

    /// Insert `event` under its idempotency key.
    ///
    /// Returns [`StoreError::AlreadyProcessed`] if the key exists; nothing is
    /// written in that case.
    pub fn store(&mut self, event: &ContractEvent) -> Result<(), StoreError> {
        let key = event.key.storage_key();
        if self.tx.get(Table::Events, key.as_bytes())?.is_some() {
            return Err(StoreError::AlreadyProcessed(key));
        }
        self.tx.put_json(Table::Events, key.as_bytes(), event)
    }

    pub fn exists(&self, key: &EventKey) -> Result<bool, StoreError> {
        Ok(self
            .tx
            .get(Table::Events, key.storage_key().as_bytes())?
            .is_some())
    }

    pub fn get(&self, key: &EventKey) -> Result<Option<ContractEvent>, StoreError> {
        self.tx
            .get_json(Table::Events, key.storage_key().as_bytes())
    }

    /// Number of stored events for a chain.
    pub fn count(&self, chain_id: u64) -> Result<usize, StoreError> {
        let prefix = format!("{chain_id}:");
        Ok(self
            .tx
            .scan_prefix(Table::Events, prefix.as_bytes())?
            .len())
    }
}
