//! Settlement core configuration loading and validation.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::CoreError;
use crate::types::{Address, Asset};

/// Full configuration for the settlement core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Address the broker signs with; expected as the second channel participant.
    #[serde(default)]
    pub broker_address: Address,

    /// Minimum challenge period (seconds) accepted for new channels.
    #[serde(default = "default_challenge_floor")]
    pub challenge_period_floor_secs: u64,

    /// Chains whose custody contract is followed.
    #[serde(default)]
    pub chains: Vec<ChainConfig>,

    /// Tokens known to the ledger.
    #[serde(default)]
    pub assets: Vec<AssetConfig>,

    #[serde(default)]
    pub listener: ListenerConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// JSON-RPC endpoint.
    pub rpc_url: String,
    pub custody_address: Address,
    pub adjudicator_address: Address,
    /// First block to follow when no watermark exists.
    #[serde(default)]
    pub start_block: u64,
    /// Log polling interval for the HTTP log source.
    #[serde(default = "default_chain_poll_ms")]
    pub poll_interval_ms: u64,
    /// Block range fetched per request during reconciliation.
    #[serde(default = "default_block_step")]
    pub block_step: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    pub symbol: String,
    pub chain_id: u64,
    pub token: Address,
    pub decimals: u8,
}

impl From<&AssetConfig> for Asset {
    fn from(cfg: &AssetConfig) -> Self {
        Asset {
            symbol: cfg.symbol.clone(),
            chain_id: cfg.chain_id,
            token: cfg.token,
            decimals: cfg.decimals,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Consecutive subscription failures tolerated before giving up.
    #[serde(default = "default_listener_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Attempts at handling one log before the listener stops.
    #[serde(default = "default_handler_attempts")]
    pub handler_max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_action_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the data directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

// Default value functions
fn default_challenge_floor() -> u64 {
    3600
}
fn default_chain_poll_ms() -> u64 {
    2000
}
fn default_block_step() -> u64 {
    1000
}
fn default_listener_retries() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_handler_attempts() -> u32 {
    3
}
fn default_worker_poll_ms() -> u64 {
    5000
}
fn default_batch_size() -> usize {
    50
}
fn default_action_retries() -> u32 {
    5
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            broker_address: Address::zero(),
            challenge_period_floor_secs: default_challenge_floor(),
            chains: Vec::new(),
            assets: Vec::new(),
            listener: ListenerConfig::default(),
            worker: WorkerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_listener_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            handler_max_attempts: default_handler_attempts(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_worker_poll_ms(),
            batch_size: default_batch_size(),
            max_retries: default_action_retries(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl SettlementConfig {
    /// Load config from a TOML file, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<SettlementConfig>(&contents)?
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Save the current config to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut chain_ids = HashSet::new();
        for chain in &self.chains {
            if !chain_ids.insert(chain.chain_id) {
                return Err(CoreError::InvalidConfig(format!(
                    "chain {} configured twice",
                    chain.chain_id
                )));
            }
            if chain.block_step == 0 {
                return Err(CoreError::InvalidConfig(format!(
                    "chain {}: block_step must be positive",
                    chain.chain_id
                )));
            }
        }

        let mut tokens = HashSet::new();
        let mut scales: HashMap<&str, u8> = HashMap::new();
        for asset in &self.assets {
            if !tokens.insert((asset.chain_id, asset.token)) {
                return Err(CoreError::InvalidConfig(format!(
                    "token {:?} on chain {} listed twice",
                    asset.token, asset.chain_id
                )));
            }
            match scales.get(asset.symbol.as_str()) {
                Some(decimals) if *decimals != asset.decimals => {
                    return Err(CoreError::InvalidConfig(format!(
                        "asset {} has conflicting decimals ({} and {})",
                        asset.symbol, decimals, asset.decimals
                    )));
                }
                _ => {
                    scales.insert(asset.symbol.as_str(), asset.decimals);
                }
            }
        }

        if self.worker.batch_size == 0 {
            return Err(CoreError::InvalidConfig("worker.batch_size must be positive".into()));
        }
        Ok(())
    }

    /// Look up the asset for a token on a chain.
    pub fn asset(&self, chain_id: u64, token: &Address) -> Option<Asset> {
        self.assets
            .iter()
            .find(|a| a.chain_id == chain_id && a.token == *token)
            .map(Asset::from)
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}
