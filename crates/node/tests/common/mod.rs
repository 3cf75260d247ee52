#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::aliases::U192;
use alloy_rlp::Encodable;
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{SolCall, SolEvent, SolValue};
use in3_node::context::{ChainContext, ChainSettings};
use in3_node::nodelist::encode_account;
use in3_node::peers::PeerClient;
use in3_node::registry::{
    In3Node, getIn3NodeInformationCall, nodeRegistryDataCall, registryIdCall, serversCall,
    totalNodesCall, totalServersCall,
};
use in3_node::signatures::{Conviction, ConvictionError, ConvictionFuture, ConvictionSink};
use in3_node::upstream::{
    CallRequest, ChainSource, LogFilter, RpcRetryConfig, UpstreamError, UpstreamFuture,
};
use in3_node::ValidatorEngineConfig;
use in3_node_merkle::{ProofEngine, Trie};
use in3_node_types::{
    AccountProof, Address, B64, B256, BlockHeader, BlockRequest, Bytes, Log, NodeRecord,
    SignatureAttestation, StorageSlotProof, U64, U256, attestation_message_hash, keccak256,
};
use node_spec_core::storage_keys::StructLayout;
use tokio::sync::mpsc;

pub const REGISTRY: Address = Address::repeat_byte(0xaa);
pub const DATA_CONTRACT: Address = Address::repeat_byte(0xdd);
pub const REGISTRY_ID: B256 = B256::repeat_byte(0x1d);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProofMode {
    #[default]
    Honest,
    /// Every `eth_getProof` fails at the transport level.
    Unavailable,
    /// Storage values are altered after the proof nodes were built.
    Tampered,
}

#[derive(Default)]
pub struct MockState {
    pub head: u64,
    pub nodes: Vec<NodeRecord>,
    pub headers: BTreeMap<u64, BlockHeader>,
    pub proof_mode: ProofMode,
    pub proof_calls: usize,
    pub logs: Vec<Log>,
    pub log_queries: Vec<LogFilter>,
    pub fail_logs: bool,
    pub sent_transactions: Vec<Bytes>,
}

/// In-memory chain with a registry whose storage is backed by real tries.
pub struct MockChain {
    pub contract_version2: bool,
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn v2(nodes: Vec<NodeRecord>) -> Self {
        Self::with_layout(true, nodes)
    }

    pub fn legacy(nodes: Vec<NodeRecord>) -> Self {
        Self::with_layout(false, nodes)
    }

    fn with_layout(contract_version2: bool, nodes: Vec<NodeRecord>) -> Self {
        Self {
            contract_version2,
            state: Mutex::new(MockState {
                nodes,
                ..MockState::default()
            }),
        }
    }

    pub fn contract(&self) -> Address {
        if self.contract_version2 {
            DATA_CONTRACT
        } else {
            REGISTRY
        }
    }

    pub fn set_head(&self, head: u64) {
        self.with_state(|state| state.head = head);
    }

    pub fn with_state<R>(&self, update: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().expect("mock chain state lock");
        update(&mut state)
    }

    pub fn header(&self, number: u64) -> BlockHeader {
        self.with_state(|state| self.header_locked(state, number))
    }

    fn header_locked(&self, state: &MockState, number: u64) -> BlockHeader {
        if let Some(header) = state.headers.get(&number) {
            return header.clone();
        }
        let mut header = base_header(number);
        header.state_root = self.state_trie(&state.nodes).root_hash();
        header.hash = keccak256(number.to_be_bytes());
        header
    }

    fn layout(&self) -> StructLayout {
        StructLayout::for_version(self.contract_version2)
    }

    fn storage_slots(&self, nodes: &[NodeRecord]) -> BTreeMap<U256, U256> {
        let layout = self.layout();
        let mut slots = BTreeMap::new();
        slots.insert(U256::ZERO, U256::from(nodes.len()));
        for node in nodes {
            let value = if self.contract_version2 {
                U256::from_be_bytes(node.proof_hash.unwrap_or_default().0)
            } else {
                U256::from_be_slice(node.address.as_slice())
            };
            slots.insert(layout.slot(node.index), value);
        }
        slots
    }

    fn storage_trie(&self, nodes: &[NodeRecord]) -> Trie {
        Trie::from_entries(self.storage_slots(nodes).into_iter().map(|(key, value)| {
            let encoded = if value.is_zero() {
                Vec::new()
            } else {
                alloy_rlp::encode(value)
            };
            (keccak256(key.to_be_bytes::<32>()).to_vec(), encoded)
        }))
    }

    fn account(&self, nodes: &[NodeRecord]) -> AccountProof {
        AccountProof {
            address: self.contract(),
            balance: U256::from(5_u64),
            code_hash: keccak256(b"registry code"),
            nonce: U64::from(1_u64),
            storage_hash: self.storage_trie(nodes).root_hash(),
            account_proof: Vec::new(),
            storage_proof: Vec::new(),
        }
    }

    fn state_trie(&self, nodes: &[NodeRecord]) -> Trie {
        Trie::from_entries([
            (
                keccak256(self.contract()).to_vec(),
                encode_account(&self.account(nodes)),
            ),
            (keccak256(Address::repeat_byte(0xee)).to_vec(), vec![0xc0]),
        ])
    }

    fn build_proof(&self, nodes: &[NodeRecord], keys: &[U256]) -> AccountProof {
        let slots = self.storage_slots(nodes);
        let storage = self.storage_trie(nodes);
        let state = self.state_trie(nodes);
        AccountProof {
            account_proof: state.proof(keccak256(self.contract()).as_slice()),
            storage_proof: keys
                .iter()
                .map(|key| StorageSlotProof {
                    key: *key,
                    value: slots.get(key).copied().unwrap_or_default(),
                    proof: storage.proof(keccak256(key.to_be_bytes::<32>()).as_slice()),
                })
                .collect(),
            ..self.account(nodes)
        }
    }

    fn answer(&self, state: &MockState, request: &CallRequest) -> Result<Bytes, UpstreamError> {
        let selector: [u8; 4] = request
            .data
            .get(..4)
            .and_then(|selector| selector.try_into().ok())
            .unwrap_or_default();

        if selector == nodeRegistryDataCall::SELECTOR {
            return if self.contract_version2 && request.to == REGISTRY {
                Ok(DATA_CONTRACT.abi_encode().into())
            } else {
                Err(revert("eth_call"))
            };
        }
        if request.to != self.contract() {
            return Err(revert("eth_call"));
        }
        if selector == registryIdCall::SELECTOR {
            return if self.contract_version2 {
                Ok(REGISTRY_ID.abi_encode().into())
            } else {
                Err(revert("eth_call"))
            };
        }
        if selector == totalNodesCall::SELECTOR || selector == totalServersCall::SELECTOR {
            return Ok(U256::from(state.nodes.len()).abi_encode().into());
        }
        if selector == getIn3NodeInformationCall::SELECTOR {
            let call = getIn3NodeInformationCall::abi_decode(&request.data).map_err(invalid)?;
            let node = node_at(state, call.index)?;
            return Ok(In3Node {
                url: node.url.clone(),
                deposit: node.deposit,
                registerTime: node.register_time,
                props: U192::from(node.props),
                weight: node.weight,
                signer: node.address,
                proofHash: node.proof_hash.unwrap_or_default(),
            }
            .abi_encode()
            .into());
        }
        if selector == serversCall::SELECTOR {
            let call = serversCall::abi_decode(&request.data).map_err(invalid)?;
            let node = node_at(state, call.index)?;
            return Ok((
                node.url.clone(),
                node.address,
                node.deposit,
                node.props,
                0_u128,
                0_u128,
                Address::ZERO,
            )
                .abi_encode_params()
                .into());
        }
        Err(revert("eth_call"))
    }
}

fn node_at(state: &MockState, index: U256) -> Result<&NodeRecord, UpstreamError> {
    state
        .nodes
        .get(index.saturating_to::<usize>())
        .ok_or_else(|| revert("eth_call"))
}

fn revert(method: &str) -> UpstreamError {
    UpstreamError::Rpc {
        method: method.to_string(),
        code: 3,
        message: "execution reverted".to_string(),
    }
}

fn invalid(error: alloy_sol_types::Error) -> UpstreamError {
    UpstreamError::InvalidResponse {
        method: "eth_call".to_string(),
        message: error.to_string(),
    }
}

impl ChainSource for MockChain {
    fn block_number(&self) -> UpstreamFuture<'_, u64> {
        Box::pin(async move { Ok(self.with_state(|state| state.head)) })
    }

    fn block_by_number(&self, number: u64) -> UpstreamFuture<'_, Option<BlockHeader>> {
        Box::pin(async move {
            Ok(self.with_state(|state| {
                (number <= state.head).then(|| self.header_locked(state, number))
            }))
        })
    }

    fn call(&self, request: CallRequest, _block: Option<u64>) -> UpstreamFuture<'_, Bytes> {
        Box::pin(async move { self.with_state(|state| self.answer(state, &request)) })
    }

    fn call_batch(
        &self,
        requests: Vec<CallRequest>,
        _block: Option<u64>,
    ) -> UpstreamFuture<'_, Vec<Result<Bytes, UpstreamError>>> {
        Box::pin(async move {
            Ok(self.with_state(|state| {
                requests
                    .iter()
                    .map(|request| self.answer(state, request))
                    .collect()
            }))
        })
    }

    fn logs(&self, filter: LogFilter) -> UpstreamFuture<'_, Vec<Log>> {
        Box::pin(async move {
            self.with_state(|state| {
                state.log_queries.push(filter.clone());
                if state.fail_logs {
                    return Err(UpstreamError::Transport {
                        method: "eth_getLogs".to_string(),
                        message: "connection reset".to_string(),
                    });
                }
                Ok(state
                    .logs
                    .iter()
                    .filter(|log| {
                        log.block()
                            .is_some_and(|block| block >= filter.from_block && block <= filter.to_block)
                            && filter.addresses.contains(&log.address)
                            && (filter.topic0.is_empty()
                                || log.topics.first().is_some_and(|topic| filter.topic0.contains(topic)))
                    })
                    .cloned()
                    .collect())
            })
        })
    }

    fn proof(
        &self,
        address: Address,
        keys: Vec<U256>,
        _block: u64,
    ) -> UpstreamFuture<'_, AccountProof> {
        Box::pin(async move {
            self.with_state(|state| {
                state.proof_calls += 1;
                if address != self.contract() {
                    return Err(revert("eth_getProof"));
                }
                match state.proof_mode {
                    ProofMode::Unavailable => Err(UpstreamError::Transport {
                        method: "eth_getProof".to_string(),
                        message: "timed out".to_string(),
                    }),
                    ProofMode::Honest => Ok(self.build_proof(&state.nodes, &keys)),
                    ProofMode::Tampered => {
                        let mut proof = self.build_proof(&state.nodes, &keys);
                        if let Some(entry) = proof.storage_proof.last_mut() {
                            entry.value += U256::from(1_u64);
                        }
                        Ok(proof)
                    }
                }
            })
        })
    }

    fn chain_id(&self) -> UpstreamFuture<'_, u64> {
        Box::pin(async move { Ok(1) })
    }

    fn gas_price(&self) -> UpstreamFuture<'_, U256> {
        Box::pin(async move { Ok(U256::from(1_000_000_000_u64)) })
    }

    fn transaction_count(&self, _address: Address) -> UpstreamFuture<'_, u64> {
        Box::pin(async move { Ok(0) })
    }

    fn send_raw_transaction(&self, raw: Bytes) -> UpstreamFuture<'_, B256> {
        Box::pin(async move {
            let hash = keccak256(&raw);
            self.with_state(|state| state.sent_transactions.push(raw));
            Ok(hash)
        })
    }
}

/// Peers answering `in3_sign` from a fixed table keyed by URL.
#[derive(Default)]
pub struct MockPeers {
    responses: Mutex<HashMap<String, Result<Vec<SignatureAttestation>, UpstreamError>>>,
    pub requests: Mutex<Vec<(String, Vec<BlockRequest>)>>,
}

impl MockPeers {
    pub fn respond(&self, url: &str, response: Result<Vec<SignatureAttestation>, UpstreamError>) {
        self.responses
            .lock()
            .expect("peer responses lock")
            .insert(url.to_string(), response);
    }
}

impl PeerClient for MockPeers {
    fn request_signatures(
        &self,
        url: String,
        blocks: Vec<BlockRequest>,
    ) -> UpstreamFuture<'_, Vec<SignatureAttestation>> {
        Box::pin(async move {
            self.requests
                .lock()
                .expect("peer requests lock")
                .push((url.clone(), blocks));
            self.responses
                .lock()
                .expect("peer responses lock")
                .get(&url)
                .cloned()
                .unwrap_or_else(|| {
                    Err(UpstreamError::Transport {
                        method: "in3_sign".to_string(),
                        message: format!("{url} unreachable"),
                    })
                })
        })
    }
}

/// Forwards convictions to a channel instead of sending transactions.
pub struct ChannelConvictionSink {
    sender: mpsc::UnboundedSender<Conviction>,
}

impl ChannelConvictionSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Conviction>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ConvictionSink for ChannelConvictionSink {
    fn convict(&self, conviction: Conviction) -> ConvictionFuture<'_> {
        Box::pin(async move {
            let tx = keccak256(conviction.block_number.to_be_bytes());
            self.sender
                .send(conviction)
                .map_err(|_| ConvictionError::Closed)?;
            Ok(tx)
        })
    }
}

pub fn v2_node(index: u64, address: Address) -> NodeRecord {
    NodeRecord {
        address,
        url: format!("https://node{index}.example"),
        index,
        deposit: U256::from(1_000_u64 + index),
        props: U256::from(0xffff_u64),
        weight: 1 + index,
        register_time: 1_600_000_000 + index,
        proof_hash: Some(keccak256(format!("node-{index}"))),
        performance: None,
    }
}

pub fn legacy_node(index: u64, address: Address) -> NodeRecord {
    NodeRecord {
        weight: 1,
        register_time: 0,
        proof_hash: None,
        ..v2_node(index, address)
    }
}

pub fn chain_context(
    min_block_height: u64,
    validators: Option<ValidatorEngineConfig>,
) -> Arc<ChainContext> {
    chain_context_with_engine(min_block_height, validators, ProofEngine::default())
}

pub fn chain_context_with_engine(
    min_block_height: u64,
    validators: Option<ValidatorEngineConfig>,
    proofs: ProofEngine,
) -> Arc<ChainContext> {
    let settings = ChainSettings {
        chain_id: "test".to_string(),
        registry: REGISTRY,
        min_block_height,
        max_log_range: 100,
        proof_retry: RpcRetryConfig {
            attempts: 3,
            base_backoff: Duration::ZERO,
        },
        validators,
    };
    Arc::new(ChainContext::new(settings, Arc::new(proofs)))
}

pub fn attest(
    signer: &PrivateKeySigner,
    block_number: u64,
    block_hash: B256,
    registry_id: Option<&B256>,
) -> SignatureAttestation {
    let msg_hash = attestation_message_hash(&block_hash, block_number, registry_id);
    let signature = signer.sign_hash_sync(&msg_hash).expect("sign attestation");
    SignatureAttestation {
        block_number,
        block_hash,
        msg_hash,
        r: B256::from(signature.r()),
        s: B256::from(signature.s()),
        v: 27 + u8::from(signature.v()),
        signer_address: None,
    }
}

pub fn registry_log<E: SolEvent>(event: &E, address: Address, block: u64) -> Log {
    let encoded = event.encode_log_data();
    Log {
        address,
        topics: encoded.topics().to_vec(),
        data: encoded.data.clone(),
        block_number: Some(U64::from(block)),
        block_hash: Some(keccak256(block.to_be_bytes())),
        transaction_hash: Some(B256::repeat_byte(0x7a)),
        transaction_index: Some(U64::ZERO),
        log_index: Some(U64::ZERO),
        removed: false,
    }
}

pub fn base_header(number: u64) -> BlockHeader {
    BlockHeader {
        number: U64::from(number),
        hash: B256::ZERO,
        parent_hash: keccak256(number.saturating_sub(1).to_be_bytes()),
        sha3_uncles: B256::repeat_byte(0x02),
        miner: Address::ZERO,
        state_root: B256::repeat_byte(0x03),
        transactions_root: B256::repeat_byte(0x04),
        receipts_root: B256::repeat_byte(0x05),
        logs_bloom: Bytes::from(vec![0_u8; 256]),
        difficulty: U256::from(2_u64),
        gas_limit: U256::from(8_000_000_u64),
        gas_used: U256::ZERO,
        timestamp: U256::from(1_700_000_000_u64 + number),
        extra_data: Bytes::new(),
        mix_hash: Some(B256::ZERO),
        nonce: Some(B64::ZERO),
        base_fee_per_gas: None,
        seal_fields: Vec::new(),
    }
}

fn seal_bytes(signer: &PrivateKeySigner, hash: &B256) -> Vec<u8> {
    let signature = signer.sign_hash_sync(hash).expect("sign header");
    let mut out = Vec::with_capacity(65);
    out.extend_from_slice(&signature.r().to_be_bytes::<32>());
    out.extend_from_slice(&signature.s().to_be_bytes::<32>());
    out.push(u8::from(signature.v()));
    out
}

/// Aura header sealed by `signer`: step and signature in the seal fields.
pub fn aura_header(number: u64, signer: &PrivateKeySigner) -> BlockHeader {
    let mut header = base_header(number);
    header.mix_hash = None;
    header.nonce = None;
    let bare = header.aura_bare_hash();

    let mut step = Vec::new();
    number.encode(&mut step);
    let mut seal = Vec::new();
    seal_bytes(signer, &bare).as_slice().encode(&mut seal);
    header.seal_fields = vec![Bytes::from(step), Bytes::from(seal)];
    header.hash = header.computed_hash();
    header
}

/// Clique header sealed by `signer`, listing `validators` in extra-data when non-empty.
pub fn clique_header(
    number: u64,
    signer: &PrivateKeySigner,
    validators: &[Address],
    vote: Option<(Address, bool)>,
) -> BlockHeader {
    let mut header = base_header(number);
    if let Some((nominee, authorize)) = vote {
        header.miner = nominee;
        header.nonce = Some(if authorize {
            B64::new([0xff; 8])
        } else {
            B64::ZERO
        });
    }
    let mut unsealed = vec![0_u8; 32];
    for validator in validators {
        unsealed.extend_from_slice(validator.as_slice());
    }
    let mut extra = unsealed.clone();
    extra.extend_from_slice(&[0_u8; 65]);
    header.extra_data = Bytes::from(extra);
    let hash = header.clique_seal_hash().expect("clique seal hash");

    unsealed.extend_from_slice(&seal_bytes(signer, &hash));
    header.extra_data = Bytes::from(unsealed);
    header.hash = header.computed_hash();
    header
}
