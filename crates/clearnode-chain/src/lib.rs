//! Clearnode chain access.
//!
//! The custody contract's event ABI, the [`LogSource`] and [`ChainSubmitter`]
//! interfaces the settlement core consumes, an HTTP JSON-RPC log source, an
//! in-memory chain, and the per-chain registry.

pub mod abi;
pub mod error;
pub mod events;
pub mod memory;
pub mod registry;
pub mod rpc;
pub mod source;
pub mod submitter;

pub use error::{AbiError, ChainError};
pub use events::{ChainState, ChannelParams, CustodyAbi, CustodyEvent, EventKind};
pub use memory::{CheckpointCall, MemoryChain};
pub use registry::{ChainEntry, ChainRegistry};
pub use rpc::HttpLogSource;
pub use source::{LogSource, LogSubscription, RawLog};
pub use submitter::ChainSubmitter;
