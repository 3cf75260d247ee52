use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use in3_node_merkle::ProofEngine;
use in3_node_types::{Address, NodeListSnapshot, NodePerformance, ValidatorHistoryState};

use crate::config::{ChainConfig, ValidatorEngineConfig};
use crate::upstream::RpcRetryConfig;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
}

/// Static per-chain settings the protocol components read.
#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub chain_id: String,
    pub registry: Address,
    pub min_block_height: u64,
    pub max_log_range: u64,
    pub proof_retry: RpcRetryConfig,
    pub validators: Option<ValidatorEngineConfig>,
}

impl From<&ChainConfig> for ChainSettings {
    fn from(config: &ChainConfig) -> Self {
        Self {
            chain_id: config.id.clone(),
            registry: config.registry,
            min_block_height: config.min_block_height,
            max_log_range: config.max_log_range,
            proof_retry: config.proof_retry(),
            validators: config.validators.clone(),
        }
    }
}

/// Mutable state owned by one chain handler.
///
/// The node list is swapped whole, so readers always see a complete snapshot.
pub struct ChainContext {
    settings: ChainSettings,
    proofs: Arc<ProofEngine>,
    snapshot: Mutex<Arc<NodeListSnapshot>>,
    performance: Mutex<HashMap<Address, NodePerformance>>,
    validator_history: Option<tokio::sync::Mutex<ValidatorHistoryState>>,
    sync_lock: tokio::sync::Mutex<()>,
}

impl ChainContext {
    pub fn new(settings: ChainSettings, proofs: Arc<ProofEngine>) -> Self {
        let validator_history = settings.validators.as_ref().map(|validators| {
            let mut genesis = validators.genesis_validators.clone();
            genesis.sort();
            genesis.dedup();
            tokio::sync::Mutex::new(ValidatorHistoryState::new(validators.start_block, genesis))
        });
        Self {
            snapshot: Mutex::new(Arc::new(NodeListSnapshot::empty(settings.registry))),
            settings,
            proofs,
            performance: Mutex::new(HashMap::new()),
            validator_history,
            sync_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    pub fn chain_id(&self) -> &str {
        &self.settings.chain_id
    }

    pub fn registry(&self) -> Address {
        self.settings.registry
    }

    pub fn min_block_height(&self) -> u64 {
        self.settings.min_block_height
    }

    pub fn proofs(&self) -> &ProofEngine {
        &self.proofs
    }

    /// Serializes node-list syncs for this chain.
    pub(crate) fn sync_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.sync_lock
    }

    pub fn snapshot(&self) -> Result<Arc<NodeListSnapshot>, ContextError> {
        let snapshot = self
            .snapshot
            .lock()
            .map_err(|_| ContextError::Poisoned("node list"))?;
        Ok(Arc::clone(&snapshot))
    }

    pub fn replace_snapshot(
        &self,
        next: NodeListSnapshot,
    ) -> Result<Arc<NodeListSnapshot>, ContextError> {
        let next = Arc::new(next);
        let mut snapshot = self
            .snapshot
            .lock()
            .map_err(|_| ContextError::Poisoned("node list"))?;
        *snapshot = Arc::clone(&next);
        Ok(next)
    }

    pub fn validator_history(&self) -> Option<&tokio::sync::Mutex<ValidatorHistoryState>> {
        self.validator_history.as_ref()
    }

    pub fn record_peer_success(&self, peer: Address, latency_ms: u64) -> Result<(), ContextError> {
        self.update_performance(peer, |stats| stats.record_success(latency_ms))
    }

    pub fn record_peer_failure(&self, peer: Address) -> Result<(), ContextError> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(millis)
            .unwrap_or_default();
        self.update_performance(peer, |stats| stats.record_failure(now_ms))
    }

    pub fn performance(&self) -> Result<HashMap<Address, NodePerformance>, ContextError> {
        Ok(self
            .performance
            .lock()
            .map_err(|_| ContextError::Poisoned("peer performance"))?
            .clone())
    }

    fn update_performance(
        &self,
        peer: Address,
        update: impl FnOnce(&mut NodePerformance),
    ) -> Result<(), ContextError> {
        let mut performance = self
            .performance
            .lock()
            .map_err(|_| ContextError::Poisoned("peer performance"))?;
        update(performance.entry(peer).or_default());
        Ok(())
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
