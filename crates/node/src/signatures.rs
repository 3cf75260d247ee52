//! Block attestations: signing our own, collecting and checking other nodes', and convicting
//! nodes that attest a hash the chain does not have.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::TxKind;
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use in3_node_types::{
    Address, B256, BlockRequest, Bytes, SignatureAttestation, U256, attestation_message_hash,
};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::context::{ChainContext, ContextError, millis};
use crate::peers::PeerClient;
use crate::registry;
use crate::upstream::{ChainSource, UpstreamError};

/// The registry can only check hashes `blockhash` still returns.
pub const MAX_CONVICTION_AGE: u64 = 255;
pub const CONVICTION_GAS_LIMIT: u64 = 600_000;

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("block {0} is not available upstream")]
    MissingBlock(u64),
    #[error("signer {0} is not a registered node")]
    UnknownSigner(Address),
    #[error("block {number} is too young to sign: head is {head}, minimum depth {min_block_height}")]
    TooYoung {
        number: u64,
        head: u64,
        min_block_height: u64,
    },
    #[error("block {number} has hash {canonical}, not the requested {requested}")]
    HashMismatch {
        number: u64,
        requested: B256,
        canonical: B256,
    },
    #[error("this node has no signing key")]
    NoSigningKey,
    #[error("signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Evidence for a `convict` call against the node at `node_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conviction {
    pub node_index: u64,
    pub signer: Address,
    pub block_number: u64,
    pub attested_hash: B256,
    pub v: u8,
    pub r: B256,
    pub s: B256,
}

#[derive(Debug, thiserror::Error)]
pub enum ConvictionError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("signing the conviction transaction failed: {0}")]
    Signing(#[from] alloy_signer::Error),
    #[error("gas price {0} does not fit a legacy transaction")]
    GasPriceOverflow(U256),
    #[error("conviction sink closed")]
    Closed,
}

pub type ConvictionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<B256, ConvictionError>> + Send + 'a>>;

/// Submits convictions; returns the transaction hash.
pub trait ConvictionSink: Send + Sync {
    fn convict(&self, conviction: Conviction) -> ConvictionFuture<'_>;
}

/// Signs `blocks` with `signer` after checking each is deep enough and canonical.
pub async fn sign_blocks(
    source: &dyn ChainSource,
    context: &ChainContext,
    signer: Option<&PrivateKeySigner>,
    blocks: &[BlockRequest],
) -> Result<Vec<SignatureAttestation>, SignatureError> {
    let signer = signer.ok_or(SignatureError::NoSigningKey)?;
    let registry_id = context.snapshot()?.registry_id;
    let head = source.block_number().await?;
    let min_block_height = context.min_block_height();

    let mut attestations = Vec::with_capacity(blocks.len());
    for request in blocks {
        let number = request.block_number;
        if number.saturating_add(min_block_height) > head {
            return Err(SignatureError::TooYoung {
                number,
                head,
                min_block_height,
            });
        }
        let header = source
            .block_by_number(number)
            .await?
            .ok_or(SignatureError::MissingBlock(number))?;
        if let Some(requested) = request.hash
            && requested != header.hash
        {
            return Err(SignatureError::HashMismatch {
                number,
                requested,
                canonical: header.hash,
            });
        }

        let msg_hash = attestation_message_hash(&header.hash, number, registry_id.as_ref());
        let signature = signer
            .sign_hash_sync(&msg_hash)
            .map_err(|error| SignatureError::Signing(error.to_string()))?;
        attestations.push(SignatureAttestation {
            block_number: number,
            block_hash: header.hash,
            msg_hash,
            r: B256::from(signature.r()),
            s: B256::from(signature.s()),
            v: 27 + u8::from(signature.v()),
            signer_address: Some(signer.address()),
        });
    }
    Ok(attestations)
}

/// Gathers attestations from registered signers and convicts the ones that lie.
#[derive(Clone)]
pub struct SignatureCollector {
    source: Arc<dyn ChainSource>,
    peers: Arc<dyn PeerClient>,
    convictions: Option<Arc<dyn ConvictionSink>>,
}

impl SignatureCollector {
    pub fn new(
        source: Arc<dyn ChainSource>,
        peers: Arc<dyn PeerClient>,
        convictions: Option<Arc<dyn ConvictionSink>>,
    ) -> Self {
        Self {
            source,
            peers,
            convictions,
        }
    }

    /// Accepted attestations ordered by signer, then by requested block.
    ///
    /// Unreachable peers and attestations that cannot be attributed are dropped silently. A
    /// well-attributed attestation over a wrong hash is dropped and triggers a conviction.
    pub async fn collect(
        &self,
        context: &ChainContext,
        signers: &[Address],
        blocks: &[BlockRequest],
    ) -> Result<Vec<SignatureAttestation>, SignatureError> {
        let resolved = self.resolve_hashes(blocks).await?;
        let snapshot = context.snapshot()?;
        let registry_id = snapshot.registry_id;

        let mut targets = Vec::with_capacity(signers.len());
        for signer in signers {
            let node = snapshot
                .find_by_address(signer)
                .ok_or(SignatureError::UnknownSigner(*signer))?;
            targets.push((*signer, node.url.clone()));
        }

        let mut requests = JoinSet::new();
        for (position, (signer, url)) in targets.into_iter().enumerate() {
            let peers = Arc::clone(&self.peers);
            let blocks = resolved.clone();
            requests.spawn(async move {
                let started = Instant::now();
                let result = peers.request_signatures(url, blocks).await;
                (position, signer, result, started.elapsed())
            });
        }

        let mut responses: Vec<Vec<SignatureAttestation>> = vec![Vec::new(); signers.len()];
        while let Some(joined) = requests.join_next().await {
            let (position, signer, result, elapsed) = match joined {
                Ok(outcome) => outcome,
                Err(error) => {
                    warn!(%error, "signature request task failed");
                    continue;
                }
            };
            match result {
                Ok(attestations) => {
                    context.record_peer_success(signer, millis(elapsed))?;
                    responses[position] = attestations;
                }
                Err(error) => {
                    debug!(%signer, %error, "signer did not answer");
                    context.record_peer_failure(signer)?;
                }
            }
        }

        let mut accepted = Vec::new();
        let mut convicted = HashSet::new();
        for attestations in responses {
            let mut from_signer = Vec::new();
            for attestation in attestations {
                let Some(position) = resolved
                    .iter()
                    .position(|block| block.block_number == attestation.block_number)
                else {
                    debug!(block = attestation.block_number, "dropping attestation for unrequested block");
                    continue;
                };
                if attestation.expected_msg_hash(registry_id.as_ref()) != attestation.msg_hash {
                    debug!(block = attestation.block_number, "dropping attestation with wrong msgHash");
                    continue;
                }
                let recovered = match attestation.recover_signer() {
                    Ok(recovered) => recovered,
                    Err(error) => {
                        debug!(block = attestation.block_number, %error, "dropping unrecoverable attestation");
                        continue;
                    }
                };
                let Some(node) = snapshot.find_by_address(&recovered) else {
                    debug!(%recovered, "dropping attestation from an unregistered key");
                    continue;
                };

                let expected = resolved[position].hash.unwrap_or_default();
                if attestation.block_hash == expected {
                    from_signer.push((
                        position,
                        SignatureAttestation {
                            signer_address: Some(recovered),
                            ..attestation
                        },
                    ));
                    continue;
                }

                warn!(
                    signer = %recovered,
                    block = attestation.block_number,
                    attested = %attestation.block_hash,
                    %expected,
                    "signer attested a wrong block hash"
                );
                if convicted.insert((node.index, attestation.block_number)) {
                    self.spawn_conviction(Conviction {
                        node_index: node.index,
                        signer: recovered,
                        block_number: attestation.block_number,
                        attested_hash: attestation.block_hash,
                        v: normalize_v(attestation.v),
                        r: attestation.r,
                        s: attestation.s,
                    });
                }
            }
            from_signer.sort_by_key(|(position, _)| *position);
            accepted.extend(from_signer.into_iter().map(|(_, attestation)| attestation));
        }
        Ok(accepted)
    }

    async fn resolve_hashes(
        &self,
        blocks: &[BlockRequest],
    ) -> Result<Vec<BlockRequest>, SignatureError> {
        let mut resolved = Vec::with_capacity(blocks.len());
        for block in blocks {
            let hash = match block.hash {
                Some(hash) => hash,
                None => {
                    self.source
                        .block_by_number(block.block_number)
                        .await?
                        .ok_or(SignatureError::MissingBlock(block.block_number))?
                        .hash
                }
            };
            resolved.push(BlockRequest {
                block_number: block.block_number,
                hash: Some(hash),
            });
        }
        Ok(resolved)
    }

    fn spawn_conviction(&self, conviction: Conviction) {
        let Some(sink) = self.convictions.clone() else {
            warn!(
                signer = %conviction.signer,
                block = conviction.block_number,
                "no signing key configured, cannot convict"
            );
            return;
        };
        let source = Arc::clone(&self.source);
        tokio::spawn(async move {
            convict_if_still_wrong(source.as_ref(), sink.as_ref(), conviction).await;
        });
    }
}

async fn convict_if_still_wrong(
    source: &dyn ChainSource,
    sink: &dyn ConvictionSink,
    conviction: Conviction,
) {
    let number = conviction.block_number;
    let head = match source.block_number().await {
        Ok(head) => head,
        Err(error) => {
            warn!(block = number, %error, "conviction aborted, head unavailable");
            return;
        }
    };
    if head.saturating_sub(number) > MAX_CONVICTION_AGE {
        info!(block = number, head, "block too old to convict");
        return;
    }
    match source.block_by_number(number).await {
        Ok(Some(header)) if header.hash == conviction.attested_hash => {
            debug!(block = number, "attested hash is canonical after all, not convicting");
            return;
        }
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!(block = number, "conviction aborted, block unavailable");
            return;
        }
        Err(error) => {
            warn!(block = number, %error, "conviction aborted, block lookup failed");
            return;
        }
    }

    let signer = conviction.signer;
    let node_index = conviction.node_index;
    match sink.convict(conviction).await {
        Ok(tx) => info!(%signer, node_index, block = number, %tx, "conviction submitted"),
        Err(error) => warn!(%signer, node_index, block = number, %error, "conviction failed"),
    }
}

fn normalize_v(v: u8) -> u8 {
    if v < 27 { v + 27 } else { v }
}

/// Sends `convict` transactions to the registry, signed with the node key.
pub struct TxConvictionSink {
    source: Arc<dyn ChainSource>,
    signer: PrivateKeySigner,
    registry: Address,
}

impl TxConvictionSink {
    pub fn new(source: Arc<dyn ChainSource>, signer: PrivateKeySigner, registry: Address) -> Self {
        Self {
            source,
            signer,
            registry,
        }
    }

    async fn submit(&self, conviction: Conviction) -> Result<B256, ConvictionError> {
        let chain_id = self.source.chain_id().await?;
        let gas_price = self.source.gas_price().await?;
        let nonce = self.source.transaction_count(self.signer.address()).await?;
        let input = registry::convict_call(
            conviction.node_index,
            conviction.attested_hash,
            conviction.block_number,
            conviction.v,
            conviction.r,
            conviction.s,
        );
        let tx = conviction_transaction(chain_id, nonce, gas_price, self.registry, input)?;
        let raw = sign_transaction(tx, &self.signer)?;
        Ok(self.source.send_raw_transaction(raw).await?)
    }
}

impl ConvictionSink for TxConvictionSink {
    fn convict(&self, conviction: Conviction) -> ConvictionFuture<'_> {
        Box::pin(self.submit(conviction))
    }
}

/// Zero-value EIP-155 call to `registry` carrying the `convict` calldata.
pub fn conviction_transaction(
    chain_id: u64,
    nonce: u64,
    gas_price: U256,
    registry: Address,
    input: Bytes,
) -> Result<TxLegacy, ConvictionError> {
    let gas_price =
        u128::try_from(gas_price).map_err(|_| ConvictionError::GasPriceOverflow(gas_price))?;
    Ok(TxLegacy {
        chain_id: Some(chain_id),
        nonce,
        gas_price,
        gas_limit: CONVICTION_GAS_LIMIT,
        to: TxKind::Call(registry),
        value: U256::ZERO,
        input,
    })
}

/// Signs `tx` and returns its network encoding for `eth_sendRawTransaction`.
pub fn sign_transaction(tx: TxLegacy, signer: &PrivateKeySigner) -> Result<Bytes, ConvictionError> {
    let signature = signer.sign_hash_sync(&tx.signature_hash())?;
    Ok(TxEnvelope::from(tx.into_signed(signature))
        .encoded_2718()
        .into())
}
