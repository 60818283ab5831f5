//! Per-chain collaborators, indexed by chain id.

use clearnode_core::{Address, ChainConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ChainError;
use crate::rpc::HttpLogSource;
use crate::source::LogSource;
use crate::submitter::ChainSubmitter;

/// Everything the settlement core needs to talk to one chain.
#[derive(Clone)]
pub struct ChainEntry {
    pub chain_id: u64,
    /// Custody contract whose logs are followed.
    pub custody: Address,
    /// Adjudicator every channel on this chain must use.
    pub adjudicator: Address,
    /// First block to follow when nothing has been processed yet.
    pub start_block: u64,
    /// Chunk size for historical replays.
    pub block_step: u64,
    pub source: Arc<dyn LogSource>,
    pub submitter: Arc<dyn ChainSubmitter>,
}

impl ChainEntry {
    pub fn new(
        config: &ChainConfig,
        source: Arc<dyn LogSource>,
        submitter: Arc<dyn ChainSubmitter>,
    ) -> Self {
        Self {
            chain_id: config.chain_id,
            custody: config.custody_address,
            adjudicator: config.adjudicator_address,
            start_block: config.start_block,
            block_step: config.block_step.max(1),
            source,
            submitter,
        }
    }
}

impl std::fmt::Debug for ChainEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainEntry")
            .field("chain_id", &self.chain_id)
            .field("custody", &self.custody)
            .field("adjudicator", &self.adjudicator)
            .field("start_block", &self.start_block)
            .finish_non_exhaustive()
    }
}

/// Chain registry passed to every component at construction.
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    entries: BTreeMap<u64, ChainEntry>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build HTTP log sources for every configured chain.
    ///
    /// Transaction signing is not part of this crate, so the submitter for
    /// each chain is supplied by the caller.
    pub fn from_config<F>(chains: &[ChainConfig], mut submitter: F) -> Result<Self, ChainError>
    where
        F: FnMut(&ChainConfig) -> Arc<dyn ChainSubmitter>,
    {
        let mut registry = Self::new();
        for chain in chains {
            let source = HttpLogSource::new(
                chain.rpc_url.clone(),
                Duration::from_millis(chain.poll_interval_ms),
                chain.block_step,
            )?;
            registry.insert(ChainEntry::new(chain, Arc::new(source), submitter(chain)));
        }
        Ok(registry)
    }

    /// Add or replace the entry for its chain id.
    pub fn insert(&mut self, entry: ChainEntry) -> Option<ChainEntry> {
        self.entries.insert(entry.chain_id, entry)
    }

    pub fn get(&self, chain_id: u64) -> Result<&ChainEntry, ChainError> {
        self.entries
            .get(&chain_id)
            .ok_or(ChainError::UnknownChain(chain_id))
    }

    pub fn entries(&self) -> impl Iterator<Item = &ChainEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
