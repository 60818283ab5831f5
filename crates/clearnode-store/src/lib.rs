//! Clearnode persistence.
//!
//! A small transactional key-value layer with two backends (RocksDB and an
//! in-memory map) and the typed tables built on it: the channel registry,
//! the contract-event de-duplication store, the double-entry ledger, and the
//! blockchain action queue.

pub mod actions;
pub mod backend;
pub mod channels;
pub mod error;
pub mod events;
pub mod ledger;
pub mod rocks;
pub mod tx;

pub use actions::ActionQueue;
pub use backend::{KvBackend, MemoryBackend, Table, WriteOp};
pub use channels::{ChannelRegistry, StateRecord, STATE_SCHEMA_VERSION};
pub use error::StoreError;
pub use events::EventStore;
pub use ledger::{Ledger, LedgerEntry};
pub use rocks::RocksBackend;
pub use tx::{Store, StoreTx};
