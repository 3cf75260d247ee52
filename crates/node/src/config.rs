use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy_signer_local::PrivateKeySigner;
use in3_node_merkle::{DEFAULT_TRIE_CACHE_CAPACITY, ProofEngineConfig, default_worker_count};
use in3_node_types::{Address, BlockNumber};
use serde::{Deserialize, Serialize};

use crate::upstream::{
    DEFAULT_PROOF_RETRY_ATTEMPTS, DEFAULT_RPC_RETRY_BACKOFF_MS, DEFAULT_RPC_TIMEOUT_SECS,
    RpcRetryConfig,
};

pub const DEFAULT_WATCH_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_MIN_BLOCK_HEIGHT: u64 = 6;
pub const DEFAULT_MAX_LOG_RANGE: u64 = 10_000;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u64 = 5;
pub const DEFAULT_MAX_FINALITY_BLOCKS: u64 = 200;
pub const DEFAULT_CLIQUE_EPOCH: u64 = 30_000;
pub const DEFAULT_WORKER_IDLE_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_rpc_bind")]
    pub rpc_bind: SocketAddr,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_worker_idle_timeout_secs")]
    pub worker_idle_timeout_secs: u64,
    #[serde(default = "default_trie_cache_capacity")]
    pub trie_cache_capacity: usize,
    /// Trie builder threads; defaults to one less than the core count.
    #[serde(default)]
    pub trie_workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rpc_bind: default_rpc_bind(),
            data_dir: default_data_dir(),
            worker_idle_timeout_secs: default_worker_idle_timeout_secs(),
            trie_cache_capacity: default_trie_cache_capacity(),
            trie_workers: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    /// Chain id as used in the inbound RPC path, e.g. `1` or `goerli`.
    pub id: String,
    pub upstream_rpc_url: String,
    pub registry: Address,
    #[serde(default = "default_min_block_height")]
    pub min_block_height: u64,
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
    /// Hex secp256k1 key used for `in3_sign` and conviction transactions.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default = "default_max_log_range")]
    pub max_log_range: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u64,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    #[serde(default)]
    pub proof_retry: ProofRetryConfig,
    #[serde(default)]
    pub validators: Option<ValidatorEngineConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProofRetryConfig {
    pub attempts: u32,
    pub base_backoff_ms: u64,
}

impl Default for ProofRetryConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_PROOF_RETRY_ATTEMPTS,
            base_backoff_ms: DEFAULT_RPC_RETRY_BACKOFF_MS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatorEngineKind {
    /// Validator contract emitting `InitiateChange`.
    Aura,
    /// Header votes with the set restated at epoch blocks.
    Clique,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidatorEngineConfig {
    pub engine: ValidatorEngineKind,
    /// Validator set contract; required for Aura.
    #[serde(default)]
    pub contract: Option<Address>,
    pub start_block: BlockNumber,
    pub genesis_validators: Vec<Address>,
    #[serde(default = "default_clique_epoch")]
    pub epoch: u64,
    #[serde(default = "default_max_finality_blocks")]
    pub max_finality_blocks: u64,
}

fn default_rpc_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8500))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_worker_idle_timeout_secs() -> u64 {
    DEFAULT_WORKER_IDLE_TIMEOUT_SECS
}

fn default_trie_cache_capacity() -> usize {
    DEFAULT_TRIE_CACHE_CAPACITY
}

fn default_min_block_height() -> u64 {
    DEFAULT_MIN_BLOCK_HEIGHT
}

fn default_watch_interval_ms() -> u64 {
    DEFAULT_WATCH_INTERVAL_MS
}

fn default_max_log_range() -> u64 {
    DEFAULT_MAX_LOG_RANGE
}

fn default_max_consecutive_failures() -> u64 {
    DEFAULT_MAX_CONSECUTIVE_FAILURES
}

fn default_rpc_timeout_secs() -> u64 {
    DEFAULT_RPC_TIMEOUT_SECS
}

fn default_clique_epoch() -> u64 {
    DEFAULT_CLIQUE_EPOCH
}

fn default_max_finality_blocks() -> u64 {
    DEFAULT_MAX_FINALITY_BLOCKS
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|error| format!("unable to read config {}: {error}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|error| format!("unable to parse config: {error}"))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.worker_idle_timeout_secs == 0 {
            return Err("server.worker_idle_timeout_secs must be > 0".to_string());
        }
        if self.server.trie_cache_capacity == 0 {
            return Err("server.trie_cache_capacity must be > 0".to_string());
        }
        if self.server.trie_workers == Some(0) {
            return Err("server.trie_workers must be > 0".to_string());
        }
        if self.chains.is_empty() {
            return Err("at least one [[chains]] entry is required".to_string());
        }
        for (position, chain) in self.chains.iter().enumerate() {
            chain
                .validate()
                .map_err(|error| format!("chains[{position}] ({}): {error}", chain.id))?;
            if self.chains[..position]
                .iter()
                .any(|other| other.id == chain.id)
            {
                return Err(format!("duplicate chain id `{}`", chain.id));
            }
        }
        Ok(())
    }

    pub fn proof_engine(&self) -> ProofEngineConfig {
        ProofEngineConfig {
            cache_capacity: self.server.trie_cache_capacity,
            workers: self.server.trie_workers.unwrap_or_else(default_worker_count),
            worker_idle_timeout: self.worker_idle_timeout(),
            ..ProofEngineConfig::default()
        }
    }

    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.server.worker_idle_timeout_secs)
    }

    pub fn checkpoint_path(&self, chain: &ChainConfig) -> PathBuf {
        self.server
            .data_dir
            .join(format!("{}-checkpoint.json", chain.id))
    }
}

impl ChainConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("id cannot be empty".to_string());
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err("id may only contain [A-Za-z0-9_-]".to_string());
        }
        if self.upstream_rpc_url.trim().is_empty() {
            return Err("upstream_rpc_url cannot be empty".to_string());
        }
        if self.registry == Address::ZERO {
            return Err("registry cannot be the zero address".to_string());
        }
        if self.watch_interval_ms == 0 {
            return Err("watch_interval_ms must be > 0".to_string());
        }
        if self.rpc_timeout_secs == 0 {
            return Err("rpc_timeout_secs must be > 0".to_string());
        }
        if self.max_consecutive_failures == 0 {
            return Err("max_consecutive_failures must be > 0".to_string());
        }
        if self.proof_retry.attempts == 0 {
            return Err("proof_retry.attempts must be > 0".to_string());
        }
        self.signer()?;
        if let Some(validators) = &self.validators {
            validators.validate()?;
        }
        Ok(())
    }

    pub fn signer(&self) -> Result<Option<PrivateKeySigner>, String> {
        let Some(raw) = self.private_key.as_deref() else {
            return Ok(None);
        };
        raw.trim()
            .parse::<PrivateKeySigner>()
            .map(Some)
            .map_err(|error| format!("private_key is invalid: {error}"))
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn proof_retry(&self) -> RpcRetryConfig {
        RpcRetryConfig {
            attempts: self.proof_retry.attempts,
            base_backoff: Duration::from_millis(self.proof_retry.base_backoff_ms),
        }
    }
}

impl ValidatorEngineConfig {
    fn validate(&self) -> Result<(), String> {
        if self.genesis_validators.is_empty() {
            return Err("validators.genesis_validators cannot be empty".to_string());
        }
        if self.max_finality_blocks == 0 {
            return Err("validators.max_finality_blocks must be > 0".to_string());
        }
        match self.engine {
            ValidatorEngineKind::Aura if self.contract.is_none() => {
                Err("validators.contract is required for the aura engine".to_string())
            }
            ValidatorEngineKind::Clique if self.epoch == 0 => {
                Err("validators.epoch must be > 0".to_string())
            }
            _ => Ok(()),
        }
    }
}
