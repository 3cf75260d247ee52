//! Validator set history for proof-of-authority chains.

pub mod aura;
pub mod clique;

use in3_node_types::{
    Address, BlockNumber, FinalityProof, HeaderError, SealKind, ValidatorHistoryInvariantError,
};
use node_spec_core::finality::{SignerQuorum, percent_quorum};

use crate::config::{ValidatorEngineConfig, ValidatorEngineKind};
use crate::context::ChainContext;
use crate::upstream::{ChainSource, UpstreamError};

#[derive(Debug, thiserror::Error)]
pub enum ValidatorHistoryError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("block {0} is not available upstream")]
    MissingBlock(BlockNumber),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Invariant(#[from] ValidatorHistoryInvariantError),
    #[error("undecodable validator log at block {block}: {reason}")]
    MalformedLog { block: BlockNumber, reason: String },
    #[error("no validator set is known at block {0}")]
    NoValidatorSet(BlockNumber),
    #[error("validator history is not configured for this chain")]
    NotConfigured,
    #[error(
        "block {block} reached only {count} of {required} distinct signers within {searched} blocks"
    )]
    FinalityNotReached {
        block: BlockNumber,
        count: usize,
        required: usize,
        searched: u64,
    },
}

impl ValidatorEngineKind {
    pub fn seal_kind(self) -> SealKind {
        match self {
            ValidatorEngineKind::Aura => SealKind::Aura,
            ValidatorEngineKind::Clique => SealKind::Clique,
        }
    }
}

/// Advances the chain's validator history up to the current head.
///
/// Returns how many transitions were recorded; chains without a validator engine do nothing.
pub async fn update_validator_history(
    source: &dyn ChainSource,
    context: &ChainContext,
) -> Result<usize, ValidatorHistoryError> {
    let (Some(config), Some(history)) = (
        context.settings().validators.as_ref(),
        context.validator_history(),
    ) else {
        return Ok(0);
    };
    let mut history = history.lock().await;
    match config.engine {
        ValidatorEngineKind::Aura => aura::update(source, config, &mut history).await,
        ValidatorEngineKind::Clique => clique::update(source, config, &mut history).await,
    }
}

/// Headers following `block` until `percent` of the validators active at `block` sealed one.
pub async fn finality_proof(
    source: &dyn ChainSource,
    context: &ChainContext,
    block: BlockNumber,
    percent: u8,
) -> Result<FinalityProof, ValidatorHistoryError> {
    let (Some(config), Some(history)) = (
        context.settings().validators.as_ref(),
        context.validator_history(),
    ) else {
        return Err(ValidatorHistoryError::NotConfigured);
    };
    let validators = history
        .lock()
        .await
        .validators_at(block)
        .map(|entry| entry.validators.clone())
        .ok_or(ValidatorHistoryError::NoValidatorSet(block))?;

    let required = percent_quorum(validators.len(), percent);
    let head = source.block_number().await?;
    let walk = collect_sealers(
        source,
        config,
        &validators,
        required,
        block.saturating_add(1),
        head,
    )
    .await?;
    if !walk.quorum.is_reached() {
        return Err(ValidatorHistoryError::FinalityNotReached {
            block,
            count: walk.quorum.count(),
            required,
            searched: walk.searched,
        });
    }
    Ok(walk.proof)
}

pub(crate) struct SealerWalk {
    pub quorum: SignerQuorum,
    pub proof: FinalityProof,
    pub last_block: Option<BlockNumber>,
    pub searched: u64,
}

/// Walks headers from `from` while the quorum is open, bounded by `head` and the block cap.
pub(crate) async fn collect_sealers(
    source: &dyn ChainSource,
    config: &ValidatorEngineConfig,
    eligible: &[Address],
    required: usize,
    from: BlockNumber,
    head: BlockNumber,
) -> Result<SealerWalk, ValidatorHistoryError> {
    let mut walk = SealerWalk {
        quorum: SignerQuorum::new(eligible, required),
        proof: FinalityProof::default(),
        last_block: None,
        searched: 0,
    };
    let last = head.min(from.saturating_add(config.max_finality_blocks.saturating_sub(1)));
    let mut number = from;
    while !walk.quorum.is_reached() && number <= last {
        let header = source
            .block_by_number(number)
            .await?
            .ok_or(ValidatorHistoryError::MissingBlock(number))?;
        let sealer = header.recover_sealer(config.engine.seal_kind())?;
        walk.quorum.observe(sealer);
        walk.proof.headers.push(header.rlp());
        walk.last_block = Some(number);
        walk.searched += 1;
        number += 1;
    }
    Ok(walk)
}
