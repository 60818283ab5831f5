//! Key/value backends underneath the repositories.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::StoreError;

/// Logical tables. Each maps to one RocksDB column family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Channels,
    /// Index: `wallet:token:chain` -> channel id of the open channel.
    OpenChannels,
    /// Index: `wallet:channel` -> empty.
    WalletChannels,
    Signers,
    Events,
    LedgerEntries,
    LedgerTransactions,
    /// Index: `account|seq` -> empty.
    AccountTransactions,
    Actions,
    /// Index: `id` -> empty, for actions still pending.
    PendingActions,
    Meta,
}

impl Table {
    pub const ALL: [Table; 11] = [
        Table::Channels,
        Table::OpenChannels,
        Table::WalletChannels,
        Table::Signers,
        Table::Events,
        Table::LedgerEntries,
        Table::LedgerTransactions,
        Table::AccountTransactions,
        Table::Actions,
        Table::PendingActions,
        Table::Meta,
    ];

    /// Column family name.
    pub fn name(&self) -> &'static str {
        match self {
            Table::Channels => "channels",
            Table::OpenChannels => "open_channels",
            Table::WalletChannels => "wallet_channels",
            Table::Signers => "signers",
            Table::Events => "contract_events",
            Table::LedgerEntries => "ledger_entries",
            Table::LedgerTransactions => "ledger_transactions",
            Table::AccountTransactions => "account_transactions",
            Table::Actions => "blockchain_actions",
            Table::PendingActions => "pending_actions",
            Table::Meta => "meta",
        }
    }
}

/// One buffered mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        table: Table,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        table: Table,
        key: Vec<u8>,
    },
}

/// A key/value store with ordered prefix scans and atomic batch writes.
pub trait KvBackend: Send + Sync {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, table: Table, prefix: &[u8])
        -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Apply every operation or none of them.
    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;
}

/// In-process ordered map. Used by tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<BTreeMap<(Table, Vec<u8>), Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> std::sync::MutexGuard<'_, BTreeMap<(Table, Vec<u8>), Vec<u8>>> {
        // Batches are applied without any fallible step, so a poisoned map is
        // never half-written.
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data().get(&(table, key.to_vec())).cloned())
    }

    fn scan_prefix(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let data = self.data();
        Ok(data
            .range((table, prefix.to_vec())..)
            .take_while(|((t, k), _)| *t == table && k.starts_with(prefix))
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut data = self.data();
        for op in ops {
            match op {
                WriteOp::Put { table, key, value } => {
                    data.insert((table, key), value);
                }
                WriteOp::Delete { table, key } => {
                    data.remove(&(table, key));
                }
            }
        }
        Ok(())
    }
}
