//! Per-chain composition of the protocol components behind the inbound RPC surface.

use std::sync::Arc;

use alloy_signer_local::PrivateKeySigner;
use in3_node_rpc::{
    BackendFuture, In3Backend, NodeListQuery, RpcError, ValidatorListQuery, ValidatorListResponse,
};
use in3_node_types::{
    Address, BlockNumber, BlockRequest, FinalityProof, NodeListSnapshot, SignatureAttestation,
};

use crate::context::{ChainContext, ContextError};
use crate::nodelist::{SyncError, select_node_list, sync_node_list};
use crate::peers::PeerClient;
use crate::signatures::{
    ConvictionSink, SignatureCollector, SignatureError, TxConvictionSink, sign_blocks,
};
use crate::upstream::{ChainSource, UpstreamError};
use crate::validators::{ValidatorHistoryError, finality_proof};

pub struct ChainHandler {
    source: Arc<dyn ChainSource>,
    context: Arc<ChainContext>,
    collector: SignatureCollector,
    signer: Option<PrivateKeySigner>,
}

impl ChainHandler {
    /// Convictions are submitted as transactions when the chain has a signing key.
    pub fn new(
        source: Arc<dyn ChainSource>,
        peers: Arc<dyn PeerClient>,
        context: Arc<ChainContext>,
        signer: Option<PrivateKeySigner>,
    ) -> Self {
        let convictions = signer.clone().map(|signer| {
            Arc::new(TxConvictionSink::new(
                Arc::clone(&source),
                signer,
                context.registry(),
            )) as Arc<dyn ConvictionSink>
        });
        Self::with_conviction_sink(source, peers, context, signer, convictions)
    }

    pub fn with_conviction_sink(
        source: Arc<dyn ChainSource>,
        peers: Arc<dyn PeerClient>,
        context: Arc<ChainContext>,
        signer: Option<PrivateKeySigner>,
        convictions: Option<Arc<dyn ConvictionSink>>,
    ) -> Self {
        Self {
            collector: SignatureCollector::new(Arc::clone(&source), peers, convictions),
            source,
            context,
            signer,
        }
    }

    pub fn context(&self) -> &Arc<ChainContext> {
        &self.context
    }

    pub fn source(&self) -> &Arc<dyn ChainSource> {
        &self.source
    }

    pub fn signer_address(&self) -> Option<Address> {
        self.signer.as_ref().map(PrivateKeySigner::address)
    }

    pub async fn sync(&self) -> Result<Arc<NodeListSnapshot>, SyncError> {
        sync_node_list(self.source.as_ref(), &self.context).await
    }

    pub async fn collect_signatures(
        &self,
        signers: &[Address],
        blocks: &[BlockRequest],
    ) -> Result<Vec<SignatureAttestation>, SignatureError> {
        self.collector.collect(&self.context, signers, blocks).await
    }

    pub async fn finality_proof(
        &self,
        block: BlockNumber,
        percent: u8,
    ) -> Result<FinalityProof, ValidatorHistoryError> {
        finality_proof(self.source.as_ref(), &self.context, block, percent).await
    }
}

impl In3Backend for ChainHandler {
    fn sign(&self, requests: Vec<BlockRequest>) -> BackendFuture<'_, Vec<SignatureAttestation>> {
        Box::pin(async move {
            sign_blocks(
                self.source.as_ref(),
                &self.context,
                self.signer.as_ref(),
                &requests,
            )
            .await
            .map_err(signature_rpc_error)
        })
    }

    fn node_list(&self, query: NodeListQuery) -> BackendFuture<'_, NodeListSnapshot> {
        Box::pin(async move {
            let snapshot = self.context.snapshot().map_err(context_rpc_error)?;
            if !snapshot.is_synchronized() {
                return Err(RpcError::Unavailable(
                    "node list has not been synchronized yet".to_string(),
                ));
            }
            let performance = self.context.performance().map_err(context_rpc_error)?;
            Ok(select_node_list(
                &snapshot,
                query.limit,
                query.seed,
                &query.pinned_addresses,
                query.include_proof,
                &performance,
            ))
        })
    }

    fn validator_list(
        &self,
        query: ValidatorListQuery,
    ) -> BackendFuture<'_, ValidatorListResponse> {
        Box::pin(async move {
            let history = self.context.validator_history().ok_or_else(|| {
                RpcError::Unavailable("chain has no validator history".to_string())
            })?;
            let history = history.lock().await;
            Ok(ValidatorListResponse {
                states: history
                    .states
                    .iter()
                    .skip(query.start_index.unwrap_or(0))
                    .take(query.limit.unwrap_or(usize::MAX))
                    .cloned()
                    .collect(),
                last_checked_block: history.last_checked_block,
            })
        })
    }
}

fn signature_rpc_error(error: SignatureError) -> RpcError {
    match error {
        SignatureError::TooYoung { .. }
        | SignatureError::HashMismatch { .. }
        | SignatureError::UnknownSigner(_) => RpcError::Rejected(error.to_string()),
        SignatureError::Upstream(upstream) => upstream_rpc_error(upstream),
        SignatureError::MissingBlock(_) | SignatureError::NoSigningKey => {
            RpcError::Unavailable(error.to_string())
        }
        SignatureError::Signing(_) | SignatureError::Context(_) => {
            RpcError::Internal(error.to_string())
        }
    }
}

fn upstream_rpc_error(error: UpstreamError) -> RpcError {
    if error.is_rejection() {
        RpcError::Rejected(error.to_string())
    } else {
        RpcError::Unavailable(error.to_string())
    }
}

fn context_rpc_error(error: ContextError) -> RpcError {
    RpcError::Internal(error.to_string())
}
