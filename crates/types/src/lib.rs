#![forbid(unsafe_code)]

use std::collections::BTreeSet;

pub use alloy_primitives::{Address, B64, B256, Bytes, Signature, U64, U256, keccak256};
use serde::{Deserialize, Serialize};

pub mod header;

pub use header::{BlockHeader, HeaderError, SealKind};

pub type BlockNumber = u64;

pub const MAX_NODE_URL_BYTES: usize = 2_048;
pub const MAX_NODES_PER_REGISTRY: u64 = 100_000;
pub const MAX_VALIDATORS_PER_SET: usize = 10_000;

/// Checkpoint used when no persisted watcher state exists or it cannot be read.
pub const DEFAULT_CHECKPOINT_NUMBER: BlockNumber = 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NodeRecordValidationError {
    #[error("node {index} has an empty url")]
    EmptyUrl { index: u64 },
    #[error("node {index} url is {len} bytes, exceeding limit {max}")]
    UrlTooLong { index: u64, len: usize, max: usize },
    #[error("node {index} has the zero address")]
    ZeroAddress { index: u64 },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("unsupported signature recovery id {0}")]
    InvalidRecoveryId(u8),
    #[error("signature recovery failed: {0}")]
    Recovery(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidatorHistoryInvariantError {
    #[error("validator set entry at block {block} precedes latest entry at block {latest}")]
    OutOfOrder { block: BlockNumber, latest: BlockNumber },
    #[error("validator set at block {block} has {count} members, exceeding limit {max}")]
    TooManyValidators {
        block: BlockNumber,
        count: usize,
        max: usize,
    },
    #[error("validator set at block {block} is empty")]
    EmptySet { block: BlockNumber },
}

/// Rolling latency/failure stats for a peer, fed by signature requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePerformance {
    pub count: u64,
    pub total_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<u64>,
}

impl NodePerformance {
    pub fn record_success(&mut self, latency_ms: u64) {
        self.count = self.count.saturating_add(1);
        self.total_latency_ms = self.total_latency_ms.saturating_add(latency_ms);
    }

    pub fn record_failure(&mut self, unix_ms: u64) {
        self.last_failure = Some(unix_ms);
    }

    pub fn average_latency_ms(&self) -> Option<u64> {
        self.total_latency_ms.checked_div(self.count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub address: Address,
    pub url: String,
    pub index: u64,
    pub deposit: U256,
    pub props: U256,
    pub weight: u64,
    pub register_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof_hash: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<NodePerformance>,
}

impl NodeRecord {
    pub fn validate(&self) -> Result<(), NodeRecordValidationError> {
        if self.url.trim().is_empty() {
            return Err(NodeRecordValidationError::EmptyUrl { index: self.index });
        }
        if self.url.len() > MAX_NODE_URL_BYTES {
            return Err(NodeRecordValidationError::UrlTooLong {
                index: self.index,
                len: self.url.len(),
                max: MAX_NODE_URL_BYTES,
            });
        }
        if self.address == Address::ZERO {
            return Err(NodeRecordValidationError::ZeroAddress { index: self.index });
        }
        Ok(())
    }
}

/// Whether a node list carries a storage proof that was checked against a state root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProofStatus {
    /// Proof attached and verified against the state root of `lastBlockNumber`.
    Verified,
    /// A proof was expected but could not be obtained from upstream.
    Unverifiable,
    /// No proof was requested or none has been built yet.
    #[default]
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSlotProof {
    pub key: U256,
    pub value: U256,
    pub proof: Vec<Bytes>,
}

/// `eth_getProof` response shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountProof {
    pub address: Address,
    pub balance: U256,
    pub code_hash: B256,
    pub nonce: U64,
    pub storage_hash: B256,
    pub account_proof: Vec<Bytes>,
    pub storage_proof: Vec<StorageSlotProof>,
}

impl AccountProof {
    pub fn is_empty(&self) -> bool {
        self.account_proof.is_empty() && self.storage_proof.is_empty()
    }

    /// Copy of this proof restricted to the given storage keys, preserving order.
    pub fn narrowed(&self, keys: &BTreeSet<U256>) -> Self {
        Self {
            storage_proof: self
                .storage_proof
                .iter()
                .filter(|entry| keys.contains(&entry.key))
                .cloned()
                .collect(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeListProof {
    pub block_number: BlockNumber,
    pub state_root: B256,
    pub account: AccountProof,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeListSnapshot {
    pub nodes: Vec<NodeRecord>,
    pub contract: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_id: Option<B256>,
    pub total_servers: u64,
    pub last_block_number: BlockNumber,
    #[serde(default)]
    pub contract_version2: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<NodeListProof>,
    #[serde(default)]
    pub proof_status: ProofStatus,
}

impl NodeListSnapshot {
    pub fn empty(contract: Address) -> Self {
        Self {
            nodes: Vec::new(),
            contract,
            registry_id: None,
            total_servers: 0,
            last_block_number: 0,
            contract_version2: false,
            proof: None,
            proof_status: ProofStatus::Absent,
        }
    }

    pub fn is_synchronized(&self) -> bool {
        self.last_block_number > 0
    }

    pub fn find_by_address(&self, address: &Address) -> Option<&NodeRecord> {
        self.nodes.iter().find(|node| node.address == *address)
    }

    /// Copy without the proof, as served to clients that did not ask for one.
    pub fn without_proof(&self) -> Self {
        Self {
            proof: None,
            proof_status: ProofStatus::Absent,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherCheckpoint {
    pub number: BlockNumber,
    pub hash: B256,
}

impl Default for WatcherCheckpoint {
    fn default() -> Self {
        Self {
            number: DEFAULT_CHECKPOINT_NUMBER,
            hash: B256::ZERO,
        }
    }
}

/// A block a signer is asked to attest, as sent in `in3_sign` params.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRequest {
    pub block_number: BlockNumber,
    #[serde(default, alias = "blockHash", skip_serializing_if = "Option::is_none")]
    pub hash: Option<B256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureAttestation {
    #[serde(rename = "block")]
    pub block_number: BlockNumber,
    pub block_hash: B256,
    pub msg_hash: B256,
    pub r: B256,
    pub s: B256,
    pub v: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_address: Option<Address>,
}

impl SignatureAttestation {
    pub fn expected_msg_hash(&self, registry_id: Option<&B256>) -> B256 {
        attestation_message_hash(&self.block_hash, self.block_number, registry_id)
    }

    pub fn recover_signer(&self) -> Result<Address, RecoveryError> {
        recover_signer(&self.msg_hash, &self.r, &self.s, self.v)
    }
}

/// `keccak256(blockHash || uint256(blockNumber) [|| registryId])`.
pub fn attestation_message_hash(
    block_hash: &B256,
    block_number: BlockNumber,
    registry_id: Option<&B256>,
) -> B256 {
    let mut message = Vec::with_capacity(96);
    message.extend_from_slice(block_hash.as_slice());
    message.extend_from_slice(&U256::from(block_number).to_be_bytes::<32>());
    if let Some(registry_id) = registry_id {
        message.extend_from_slice(registry_id.as_slice());
    }
    keccak256(&message)
}

/// Normalizes `v` (27/28 or 0/1) and recovers the signing address of a prehashed message.
pub fn recover_signer(hash: &B256, r: &B256, s: &B256, v: u8) -> Result<Address, RecoveryError> {
    let parity = match v {
        0 | 27 => false,
        1 | 28 => true,
        other => return Err(RecoveryError::InvalidRecoveryId(other)),
    };
    let signature = Signature::new(
        U256::from_be_bytes(r.0),
        U256::from_be_bytes(s.0),
        parity,
    );
    signature
        .recover_address_from_prehash(hash)
        .map_err(|error| RecoveryError::Recovery(error.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub block_hash: Option<B256>,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    #[serde(default)]
    pub transaction_index: Option<U64>,
    #[serde(default)]
    pub log_index: Option<U64>,
    #[serde(default)]
    pub removed: bool,
}

impl Log {
    pub fn block(&self) -> Option<BlockNumber> {
        self.block_number.map(|number| number.to::<u64>())
    }

    pub fn index(&self) -> u64 {
        self.log_index.map(|index| index.to::<u64>()).unwrap_or_default()
    }
}

/// Serialized headers following a target block, each sealed by a distinct validator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FinalityProof {
    pub headers: Vec<Bytes>,
}

impl FinalityProof {
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ValidatorTransitionProof {
    /// Configured starting set, nothing on chain to point at.
    Genesis,
    /// Validators restated in the extra-data of an epoch block.
    Epoch { header: Bytes },
    /// Headers carrying the votes that committed the change.
    #[serde(rename_all = "camelCase")]
    Votes { headers: Vec<Bytes> },
    /// `InitiateChange` log plus the headers that finalized it.
    #[serde(rename_all = "camelCase")]
    ContractLog {
        log_block: BlockNumber,
        log_index: u64,
        transaction_hash: Option<B256>,
        finality: FinalityProof,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorSetEntry {
    pub block: BlockNumber,
    pub validators: Vec<Address>,
    pub proof: ValidatorTransitionProof,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ballot {
    pub nominee: Address,
    pub authorize: bool,
    pub voters: Vec<Address>,
    pub headers: Vec<Bytes>,
}

/// In-flight Clique votes since the last epoch boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochTally {
    pub epoch_block: BlockNumber,
    pub ballots: Vec<Ballot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorHistoryState {
    pub states: Vec<ValidatorSetEntry>,
    pub last_checked_block: BlockNumber,
    pub last_validator_change: BlockNumber,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_epoch: Option<EpochTally>,
}

impl ValidatorHistoryState {
    pub fn new(start_block: BlockNumber, validators: Vec<Address>) -> Self {
        Self {
            states: vec![ValidatorSetEntry {
                block: start_block,
                validators,
                proof: ValidatorTransitionProof::Genesis,
            }],
            last_checked_block: start_block,
            last_validator_change: start_block,
            last_epoch: None,
        }
    }

    /// Active set at `block`: the last entry whose block is not after it.
    pub fn validators_at(&self, block: BlockNumber) -> Option<&ValidatorSetEntry> {
        self.states.iter().rev().find(|entry| entry.block <= block)
    }

    pub fn current(&self) -> Option<&ValidatorSetEntry> {
        self.states.last()
    }

    /// Appends a transition, replacing the latest entry when both take effect at the same block.
    pub fn record(&mut self, entry: ValidatorSetEntry) -> Result<(), ValidatorHistoryInvariantError> {
        if entry.validators.is_empty() {
            return Err(ValidatorHistoryInvariantError::EmptySet { block: entry.block });
        }
        if entry.validators.len() > MAX_VALIDATORS_PER_SET {
            return Err(ValidatorHistoryInvariantError::TooManyValidators {
                block: entry.block,
                count: entry.validators.len(),
                max: MAX_VALIDATORS_PER_SET,
            });
        }
        match self.states.last() {
            Some(latest) if entry.block < latest.block => {
                return Err(ValidatorHistoryInvariantError::OutOfOrder {
                    block: entry.block,
                    latest: latest.block,
                });
            }
            Some(latest) if entry.block == latest.block => {
                self.states.pop();
            }
            _ => {}
        }
        self.last_validator_change = self.last_validator_change.max(entry.block);
        self.states.push(entry);
        Ok(())
    }
}
