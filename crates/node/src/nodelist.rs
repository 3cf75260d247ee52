//! Node list synchronization against the on-chain registry, and partial-list serving.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use alloy_rlp::{Encodable, Header};
use in3_node_merkle::{MerkleError, verify_proof};
use in3_node_types::{
    AccountProof, Address, B256, MAX_NODES_PER_REGISTRY, NodeListProof, NodeListSnapshot,
    NodePerformance, NodeRecord, ProofStatus, U256, keccak256,
};
use node_spec_core::sampling::seeded_sample;
use node_spec_core::storage_keys::{StructLayout, node_list_storage_keys};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::context::{ChainContext, ContextError};
use crate::registry;
use crate::upstream::{CallRequest, ChainSource, UpstreamError};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// Registry data that cannot be what the contract holds.
    #[error("registry integrity violation: {0}")]
    Integrity(String),
    #[error("storage proof rejected: {0}")]
    Proof(#[from] MerkleError),
    #[error("block {0} is not available upstream")]
    MissingBlock(u64),
    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Re-reads the registry and replaces the chain's node list snapshot.
///
/// Concurrent callers queue on the chain's sync lock; each runs its own pass. On any error the
/// previous snapshot stays in place.
pub async fn sync_node_list(
    source: &dyn ChainSource,
    context: &ChainContext,
) -> Result<Arc<NodeListSnapshot>, SyncError> {
    let _guard = context.sync_lock().lock().await;
    let previous = context.snapshot()?;

    let (contract, contract_version2, registry_id) = if previous.is_synchronized() {
        (
            previous.contract,
            previous.contract_version2,
            previous.registry_id,
        )
    } else {
        let (contract, contract_version2) =
            resolve_data_contract(source, context.registry()).await?;
        let registry_id = resolve_registry_id(source, contract, contract_version2).await?;
        info!(
            chain = context.chain_id(),
            %contract,
            contract_version2,
            "resolved registry data contract"
        );
        (contract, contract_version2, registry_id)
    };

    let head = source.block_number().await?;
    let block = head.saturating_sub(context.min_block_height());
    let total = read_total(source, contract, contract_version2, block).await?;
    let nodes = fetch_records(source, contract, contract_version2, total, block).await?;

    let keys = node_list_storage_keys(&StructLayout::for_version(contract_version2), 0..total);
    let (proof, proof_status) =
        match fetch_proof(source, context, contract, &keys, block).await? {
            Some(proof) => {
                let (owned, slots, records) = (proof.clone(), keys.clone(), nodes.clone());
                context
                    .proofs()
                    .offload(keys.len(), move || {
                        verify_node_list_proof(&owned, contract, &slots, &records, contract_version2)
                    })
                    .await??;
                (Some(proof), ProofStatus::Verified)
            }
            None => (None, ProofStatus::Unverifiable),
        };

    let snapshot = NodeListSnapshot {
        nodes,
        contract,
        registry_id,
        total_servers: total,
        last_block_number: block,
        contract_version2,
        proof,
        proof_status,
    };
    info!(
        chain = context.chain_id(),
        block,
        total,
        nodes = snapshot.nodes.len(),
        ?proof_status,
        "node list synchronized"
    );
    Ok(context.replace_snapshot(snapshot)?)
}

/// The data contract behind `registry` and whether it uses the v2 layout.
async fn resolve_data_contract(
    source: &dyn ChainSource,
    registry: Address,
) -> Result<(Address, bool), SyncError> {
    let lookup = CallRequest {
        to: registry,
        data: registry::node_registry_data_call(),
    };
    match source.call(lookup, None).await {
        Ok(data) => match registry::decode_address(&data) {
            Ok(address) if address != Address::ZERO => Ok((address, true)),
            _ => Ok((registry, false)),
        },
        Err(error) if error.is_rejection() => {
            debug!(%registry, %error, "nodeRegistryData reverted, using legacy layout");
            Ok((registry, false))
        }
        Err(error) => Err(error.into()),
    }
}

async fn resolve_registry_id(
    source: &dyn ChainSource,
    contract: Address,
    contract_version2: bool,
) -> Result<Option<B256>, SyncError> {
    let request = CallRequest {
        to: contract,
        data: registry::registry_id_call(),
    };
    match source.call(request, None).await {
        Ok(data) if data.is_empty() && !contract_version2 => Ok(None),
        Ok(data) => registry::decode_bytes32(&data)
            .map(Some)
            .map_err(|error| SyncError::Integrity(format!("undecodable registryId: {error}"))),
        Err(error) if error.is_rejection() && !contract_version2 => Ok(None),
        Err(error) => Err(error.into()),
    }
}

async fn read_total(
    source: &dyn ChainSource,
    contract: Address,
    contract_version2: bool,
    block: u64,
) -> Result<u64, SyncError> {
    let request = CallRequest {
        to: contract,
        data: registry::total_call(contract_version2),
    };
    let data = source.call(request, Some(block)).await?;
    let total = registry::decode_total(&data)
        .map_err(|error| SyncError::Integrity(format!("undecodable node count: {error}")))?;
    let capped = total.saturating_to::<u64>().min(MAX_NODES_PER_REGISTRY);
    if U256::from(capped) != total {
        warn!(%contract, %total, cap = MAX_NODES_PER_REGISTRY, "registry node count capped");
    }
    Ok(capped)
}

async fn fetch_records(
    source: &dyn ChainSource,
    contract: Address,
    contract_version2: bool,
    total: u64,
    block: u64,
) -> Result<Vec<NodeRecord>, SyncError> {
    let requests = (0..total)
        .map(|index| CallRequest {
            to: contract,
            data: registry::record_call(contract_version2, index),
        })
        .collect();
    let results = source.call_batch(requests, Some(block)).await?;

    let mut nodes = Vec::with_capacity(results.len());
    for (index, result) in (0_u64..).zip(results) {
        let data = match result {
            Ok(data) if !data.is_empty() => data,
            Ok(_) => {
                debug!(index, "registry returned no data for node record");
                continue;
            }
            Err(error) => {
                debug!(index, %error, "node record call failed, skipping");
                continue;
            }
        };
        let record = registry::decode_record(contract_version2, index, &data).map_err(|error| {
            SyncError::Integrity(format!("node record {index} does not decode: {error}"))
        })?;
        if let Err(error) = record.validate() {
            warn!(index, %error, "skipping invalid node record");
            continue;
        }
        nodes.push(record);
    }
    Ok(nodes)
}

/// Fetches the storage proof for `keys`, retrying empty or failed answers.
///
/// `Ok(None)` means the retries ran out; that is not an error for the sync.
async fn fetch_proof(
    source: &dyn ChainSource,
    context: &ChainContext,
    contract: Address,
    keys: &BTreeSet<U256>,
    block: u64,
) -> Result<Option<NodeListProof>, SyncError> {
    let retry = &context.settings().proof_retry;
    let attempts = retry.attempts.max(1);
    for attempt in 0..attempts {
        match source
            .proof(contract, keys.iter().copied().collect(), block)
            .await
        {
            Ok(account) if !account.is_empty() => {
                let header = source
                    .block_by_number(block)
                    .await?
                    .ok_or(SyncError::MissingBlock(block))?;
                return Ok(Some(NodeListProof {
                    block_number: block,
                    state_root: header.state_root,
                    account,
                }));
            }
            Ok(_) => warn!(attempt, block, "upstream returned an empty storage proof"),
            Err(error) => warn!(attempt, block, %error, "storage proof request failed"),
        }
        if attempt + 1 < attempts {
            let backoff = retry.backoff(attempt);
            if !backoff.is_zero() {
                sleep(backoff).await;
            }
        }
    }
    warn!(
        chain = context.chain_id(),
        block, attempts, "no storage proof after retries, node list is unverifiable"
    );
    Ok(None)
}

/// Checks a node-list proof against its state root and against the decoded records.
pub fn verify_node_list_proof(
    proof: &NodeListProof,
    contract: Address,
    keys: &BTreeSet<U256>,
    nodes: &[NodeRecord],
    contract_version2: bool,
) -> Result<(), SyncError> {
    let account = &proof.account;
    if account.address != contract {
        return Err(SyncError::Integrity(format!(
            "proof is for {} instead of {contract}",
            account.address
        )));
    }

    let leaf = verify_proof(
        &proof.state_root,
        keccak256(account.address).as_slice(),
        &account.account_proof,
    )?
    .ok_or_else(|| SyncError::Integrity("registry account is absent from state".to_string()))?;
    if leaf != encode_account(account) {
        return Err(SyncError::Integrity(
            "account proof does not match the claimed account fields".to_string(),
        ));
    }

    let mut proven = BTreeMap::new();
    for entry in &account.storage_proof {
        let value = verify_proof(
            &account.storage_hash,
            keccak256(entry.key.to_be_bytes::<32>()).as_slice(),
            &entry.proof,
        )?;
        let expected = (!entry.value.is_zero()).then(|| alloy_rlp::encode(entry.value));
        if value != expected {
            return Err(SyncError::Integrity(format!(
                "storage slot {:#x} does not match its proof",
                entry.key
            )));
        }
        proven.insert(entry.key, entry.value);
    }
    if let Some(missing) = keys.iter().find(|key| !proven.contains_key(key)) {
        return Err(SyncError::Integrity(format!(
            "storage slot {missing:#x} is missing from the proof"
        )));
    }

    let layout = StructLayout::for_version(contract_version2);
    for node in nodes {
        let stored = proven
            .get(&layout.slot(node.index))
            .copied()
            .unwrap_or_default();
        let claimed = if contract_version2 {
            U256::from_be_bytes(node.proof_hash.unwrap_or_default().0)
        } else {
            U256::from_be_slice(node.address.as_slice())
        };
        if stored != claimed {
            return Err(SyncError::Integrity(format!(
                "node record {} disagrees with proven storage",
                node.index
            )));
        }
    }
    Ok(())
}

/// RLP of the state-trie leaf: `[nonce, balance, storageRoot, codeHash]`.
pub fn encode_account(account: &AccountProof) -> Vec<u8> {
    let nonce = account.nonce.to::<u64>();
    let payload_length = nonce.length()
        + account.balance.length()
        + account.storage_hash.length()
        + account.code_hash.length();
    let mut out = Vec::with_capacity(payload_length + 3);
    Header {
        list: true,
        payload_length,
    }
    .encode(&mut out);
    nonce.encode(&mut out);
    account.balance.encode(&mut out);
    account.storage_hash.encode(&mut out);
    account.code_hash.encode(&mut out);
    out
}

/// Seed used when a client asks for a partial list without one: `keccak256(uint256(block))`.
pub fn default_seed(block: u64) -> B256 {
    keccak256(U256::from(block).to_be_bytes::<32>())
}

/// Client-facing view of `snapshot`.
///
/// With `limit` below the registry size a seeded subset is chosen, pinned addresses first, and
/// the proof is narrowed to that subset's slots plus the metadata slots.
pub fn select_node_list(
    snapshot: &NodeListSnapshot,
    limit: Option<u64>,
    seed: Option<B256>,
    pinned: &[Address],
    include_proof: bool,
    performance: &HashMap<Address, NodePerformance>,
) -> NodeListSnapshot {
    let mut view = snapshot.clone();

    if let Some(limit) = limit.filter(|limit| *limit > 0 && *limit < snapshot.total_servers) {
        let seed = seed.unwrap_or_else(|| default_seed(snapshot.last_block_number));
        // Sample positions among the records actually held, so skipped registry entries never
        // shrink the answer below `limit`. With no skipped records positions equal indices.
        let must_include: Vec<u64> = pinned
            .iter()
            .filter_map(|address| {
                snapshot
                    .nodes
                    .iter()
                    .position(|node| node.address == *address)
            })
            .map(|position| position as u64)
            .collect();
        let positions = seeded_sample(snapshot.nodes.len() as u64, limit, &seed, &must_include);
        view.nodes = positions
            .iter()
            .filter_map(|position| snapshot.nodes.get(*position as usize))
            .cloned()
            .collect();

        if let Some(proof) = &snapshot.proof {
            let keys = node_list_storage_keys(
                &StructLayout::for_version(snapshot.contract_version2),
                view.nodes.iter().map(|node| node.index),
            );
            view.proof = Some(NodeListProof {
                account: proof.account.narrowed(&keys),
                ..proof.clone()
            });
        }
    }

    for node in &mut view.nodes {
        node.performance = performance.get(&node.address).cloned();
    }
    if !include_proof {
        view.proof = None;
        view.proof_status = ProofStatus::Absent;
    }
    view
}
