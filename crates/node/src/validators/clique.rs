//! Header-vote validator tracking with epoch checkpoints.

use in3_node_types::{
    BlockNumber, EpochTally, SealKind, ValidatorHistoryState, ValidatorSetEntry,
    ValidatorTransitionProof,
};
use node_spec_core::clique::{VoteOutcome, apply_vote, start_epoch};
use tracing::{debug, info};

use super::ValidatorHistoryError;
use crate::config::ValidatorEngineConfig;
use crate::upstream::ChainSource;

/// Headers scanned per pass, so one pass never monopolizes the watcher.
pub const MAX_BLOCKS_PER_PASS: u64 = 1_000;

pub(crate) async fn update(
    source: &dyn ChainSource,
    config: &ValidatorEngineConfig,
    history: &mut ValidatorHistoryState,
) -> Result<usize, ValidatorHistoryError> {
    let head = source.block_number().await?;
    if head <= history.last_checked_block {
        return Ok(0);
    }
    let from = history.last_checked_block + 1;
    let to = head.min(history.last_checked_block.saturating_add(MAX_BLOCKS_PER_PASS));

    let mut tally = history.last_epoch.take().unwrap_or_default();
    let outcome = scan(source, config, history, &mut tally, from, to).await;
    history.last_epoch = Some(tally);
    outcome
}

async fn scan(
    source: &dyn ChainSource,
    config: &ValidatorEngineConfig,
    history: &mut ValidatorHistoryState,
    tally: &mut EpochTally,
    from: BlockNumber,
    to: BlockNumber,
) -> Result<usize, ValidatorHistoryError> {
    let mut recorded = 0;
    for number in from..=to {
        let header = source
            .block_by_number(number)
            .await?
            .ok_or(ValidatorHistoryError::MissingBlock(number))?;

        if number % config.epoch == 0 {
            let mut validators = header.clique_epoch_validators()?;
            validators.sort();
            validators.dedup();
            start_epoch(tally, number);
            let unchanged = history
                .validators_at(number)
                .is_some_and(|entry| entry.validators == validators);
            if !unchanged && !validators.is_empty() {
                history.record(ValidatorSetEntry {
                    block: number,
                    validators,
                    proof: ValidatorTransitionProof::Epoch {
                        header: header.rlp(),
                    },
                })?;
                info!(block = number, "validator set restated at epoch");
                recorded += 1;
            }
        } else if let Some((nominee, authorize)) = header.clique_vote() {
            let voter = header.recover_sealer(SealKind::Clique)?;
            let active = history
                .validators_at(number)
                .map(|entry| entry.validators.clone())
                .ok_or(ValidatorHistoryError::NoValidatorSet(number))?;
            match apply_vote(tally, &active, voter, nominee, authorize, header.rlp()) {
                VoteOutcome::Committed {
                    validators, ballot, ..
                } => {
                    history.record(ValidatorSetEntry {
                        block: number,
                        validators,
                        proof: ValidatorTransitionProof::Votes {
                            headers: ballot.headers,
                        },
                    })?;
                    info!(block = number, %nominee, authorize, "validator vote committed");
                    recorded += 1;
                }
                VoteOutcome::Counted { votes, required } => {
                    debug!(block = number, %voter, %nominee, votes, required, "validator vote counted");
                }
                VoteOutcome::Ignored(reason) => {
                    debug!(block = number, %voter, %nominee, ?reason, "validator vote ignored");
                }
            }
        }
        history.last_checked_block = number;
    }
    Ok(recorded)
}
