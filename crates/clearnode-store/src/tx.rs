//! Transactions: buffered writes over a backend, committed as one batch.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::actions::ActionQueue;
use crate::backend::{KvBackend, MemoryBackend, Table, WriteOp};
use crate::channels::ChannelRegistry;
use crate::error::StoreError;
use crate::events::EventStore;
use crate::ledger::Ledger;
use crate::rocks::RocksBackend;

/// Handle to the persistent state. Cheap to clone.
///
/// Write transactions are serialised: at most one is open at a time, so a
/// transaction sees every write committed before it started.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn KvBackend>,
    writer: Arc<Mutex<()>>,
}

impl Store {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// A fresh in-memory store.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Open a RocksDB store under `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(RocksBackend::open(path)?)))
    }

    /// Run `f` in a write transaction.
    ///
    /// Writes become visible only if `f` returns `Ok`; on `Err` nothing is
    /// written and the error is returned unchanged.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut StoreTx<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let _guard = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut tx = StoreTx::new(self.backend.as_ref());
        let value = f(&mut tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run read-only queries against committed state.
    pub fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut StoreTx<'_>) -> Result<T, E>,
    {
        let mut tx = StoreTx::new(self.backend.as_ref());
        f(&mut tx)
    }
}

/// An open transaction. Reads see the transaction's own writes.
pub struct StoreTx<'a> {
    backend: &'a dyn KvBackend,
    writes: BTreeMap<(Table, Vec<u8>), Option<Vec<u8>>>,
}

impl<'a> StoreTx<'a> {
    fn new(backend: &'a dyn KvBackend) -> Self {
        Self {
            backend,
            writes: BTreeMap::new(),
        }
    }

    pub fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.writes.get(&(table, key.to_vec())) {
            Some(buffered) => Ok(buffered.clone()),
            None => self.backend.get(table, key),
        }
    }

    pub fn put(&mut self, table: Table, key: &[u8], value: Vec<u8>) {
        self.writes.insert((table, key.to_vec()), Some(value));
    }

    pub fn delete(&mut self, table: Table, key: &[u8]) {
        self.writes.insert((table, key.to_vec()), None);
    }

    /// Prefix scan over committed rows merged with this transaction's writes.
    pub fn scan_prefix(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut rows: BTreeMap<Vec<u8>, Vec<u8>> =
            self.backend.scan_prefix(table, prefix)?.into_iter().collect();

        for ((_, key), value) in self
            .writes
            .range((table, prefix.to_vec())..)
            .take_while(|((t, k), _)| *t == table && k.starts_with(prefix))
        {
            match value {
                Some(v) => {
                    rows.insert(key.clone(), v.clone());
                }
                None => {
                    rows.remove(key);
                }
            }
        }
        Ok(rows.into_iter().collect())
    }

    pub fn get_json<T: DeserializeOwned>(
        &self,
        table: Table,
        key: &[u8],
    ) -> Result<Option<T>, StoreError> {
        match self.get(table, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(
        &mut self,
        table: Table,
        key: &[u8],
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        self.put(table, key, bytes);
        Ok(())
    }

    /// Next value of a named counter, starting at 1.
    pub fn next_sequence(&mut self, name: &str) -> Result<u64, StoreError> {
        let key = format!("seq:{name}");
        let current: u64 = self.get_json(Table::Meta, key.as_bytes())?.unwrap_or(0);
        let next = current + 1;
        self.put_json(Table::Meta, key.as_bytes(), &next)?;
        Ok(next)
    }

    pub fn channels(&mut self) -> ChannelRegistry<'_, 'a> {
        ChannelRegistry::new(self)
    }

    pub fn events(&mut self) -> EventStore<'_, 'a> {
        EventStore::new(self)
    }

    pub fn ledger(&mut self) -> Ledger<'_, 'a> {
        Ledger::new(self)
    }

    pub fn actions(&mut self) -> ActionQueue<'_, 'a> {
        ActionQueue::new(self)
    }

    fn commit(self) -> Result<(), StoreError> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let ops = self
            .writes
            .into_iter()
            .map(|((table, key), value)| match value {
                Some(value) => WriteOp::Put { table, key, value },
                None => WriteOp::Delete { table, key },
            })
            .collect();
        self.backend.write_batch(ops)
    }
}

/// Fixed-width decimal key so lexical order matches numeric order.
pub(crate) fn seq_key(seq: u64) -> String {
    format!("{seq:020}")
}
