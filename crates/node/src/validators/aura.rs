//! Validator contract transitions: `InitiateChange` logs finalized by sealer quorum.

use alloy_sol_types::SolEvent;
use in3_node_types::{ValidatorHistoryState, ValidatorSetEntry, ValidatorTransitionProof};
use node_spec_core::finality::transition_quorum;
use tracing::{debug, info};

use super::{ValidatorHistoryError, collect_sealers};
use crate::config::ValidatorEngineConfig;
use crate::registry::{InitiateChange, decode_initiate_change};
use crate::upstream::{ChainSource, LogFilter};

pub(crate) async fn update(
    source: &dyn ChainSource,
    config: &ValidatorEngineConfig,
    history: &mut ValidatorHistoryState,
) -> Result<usize, ValidatorHistoryError> {
    let head = source.block_number().await?;
    if head <= history.last_checked_block {
        return Ok(0);
    }
    let Some(contract) = config.contract else {
        return Err(ValidatorHistoryError::NotConfigured);
    };

    let mut logs = source
        .logs(LogFilter {
            from_block: history.last_checked_block + 1,
            to_block: head,
            addresses: vec![contract],
            topic0: vec![InitiateChange::SIGNATURE_HASH],
        })
        .await?;
    logs.retain(|log| !log.removed);
    logs.sort_by_key(|log| (log.block(), log.index()));

    let mut recorded = 0;
    for log in logs {
        let Some(log_block) = log.block() else {
            debug!("skipping pending validator log");
            continue;
        };
        let change =
            decode_initiate_change(&log).map_err(|error| ValidatorHistoryError::MalformedLog {
                block: log_block,
                reason: error.to_string(),
            })?;
        let previous = history
            .validators_at(log_block)
            .map(|entry| entry.validators.clone())
            .ok_or(ValidatorHistoryError::NoValidatorSet(log_block))?;

        let required = transition_quorum(previous.len());
        let walk = collect_sealers(source, config, &previous, required, log_block, head).await?;
        let (true, Some(last_final)) = (walk.quorum.is_reached(), walk.last_block) else {
            info!(
                block = log_block,
                signers = walk.quorum.count(),
                required,
                "validator change not final yet, retrying next pass"
            );
            history.last_checked_block = log_block.saturating_sub(1);
            return Ok(recorded);
        };

        let mut validators = change.new_set;
        validators.sort();
        validators.dedup();
        let effective = last_final + 1;
        history.record(ValidatorSetEntry {
            block: effective,
            validators,
            proof: ValidatorTransitionProof::ContractLog {
                log_block,
                log_index: log.index(),
                transaction_hash: log.transaction_hash,
                finality: walk.proof,
            },
        })?;
        info!(
            log_block,
            effective,
            parent = %change.parent_hash,
            "validator set change finalized"
        );
        recorded += 1;
    }
    history.last_checked_block = head;
    Ok(recorded)
}
