mod common;

use std::sync::Arc;

use alloy_signer_local::PrivateKeySigner;
use common::{MockChain, aura_header, chain_context, clique_header, registry_log};
use in3_node::registry::InitiateChange;
use in3_node::{
    ChainHandler, ChainSource, ValidatorEngineConfig, ValidatorEngineKind,
    ValidatorHistoryError, update_validator_history,
};
use in3_node_rpc::{In3Backend, ValidatorListQuery};
use in3_node_types::{Address, B256, ValidatorTransitionProof};
use test_case::test_case;

const VALIDATOR_CONTRACT: Address = Address::repeat_byte(0xc0);

/// Three signers sorted by address, plus an outsider to vote in.
fn signers() -> (Vec<PrivateKeySigner>, PrivateKeySigner) {
    let mut keys: Vec<PrivateKeySigner> = (0..3).map(|_| PrivateKeySigner::random()).collect();
    keys.sort_by_key(|key| key.address());
    (keys, PrivateKeySigner::random())
}

fn engine(kind: ValidatorEngineKind, genesis: &[PrivateKeySigner]) -> ValidatorEngineConfig {
    ValidatorEngineConfig {
        engine: kind,
        contract: (kind == ValidatorEngineKind::Aura).then_some(VALIDATOR_CONTRACT),
        start_block: 0,
        genesis_validators: genesis.iter().map(|key| key.address()).collect(),
        epoch: 30_000,
        max_finality_blocks: 200,
    }
}

fn handler(chain: &Arc<MockChain>, config: ValidatorEngineConfig) -> ChainHandler {
    ChainHandler::with_conviction_sink(
        Arc::clone(chain) as Arc<dyn ChainSource>,
        Arc::new(common::MockPeers::default()),
        chain_context(6, Some(config)),
        None,
        None,
    )
}

#[tokio::test]
async fn clique_votes_commit_once_a_majority_agrees() {
    let (keys, newcomer) = signers();
    let chain = Arc::new(MockChain::v2(Vec::new()));
    let vote = Some((newcomer.address(), true));
    chain.with_state(|state| {
        state.headers.insert(1, clique_header(1, &keys[0], &[], vote));
        state.headers.insert(2, clique_header(2, &keys[1], &[], vote));
        state.headers.insert(3, clique_header(3, &keys[2], &[], None));
    });
    chain.set_head(3);
    let handler = handler(&chain, engine(ValidatorEngineKind::Clique, &keys));

    let recorded = update_validator_history(chain.as_ref(), handler.context())
        .await
        .expect("update");
    assert_eq!(recorded, 1);

    let list = handler
        .validator_list(ValidatorListQuery::default())
        .await
        .expect("validator list");
    assert_eq!(list.last_checked_block, 3);
    assert_eq!(list.states.len(), 2);
    let committed = &list.states[1];
    assert_eq!(committed.block, 2);

    let mut expected: Vec<Address> = keys.iter().map(|key| key.address()).collect();
    expected.push(newcomer.address());
    expected.sort();
    assert_eq!(committed.validators, expected);
    assert!(matches!(
        &committed.proof,
        ValidatorTransitionProof::Votes { headers } if headers.len() == 2
    ));

    // Nothing new upstream, nothing recorded.
    let again = update_validator_history(chain.as_ref(), handler.context())
        .await
        .expect("second pass");
    assert_eq!(again, 0);
}

/// Aura chain where block 2 announces `[A, B, D]`, sealed by A, A, B, A, A from block 2 on.
fn aura_chain(keys: &[PrivateKeySigner], newcomer: &PrivateKeySigner) -> Arc<MockChain> {
    let chain = Arc::new(MockChain::v2(Vec::new()));
    let change = InitiateChange {
        parentHash: B256::repeat_byte(0x01),
        newSet: vec![keys[0].address(), keys[1].address(), newcomer.address()],
    };
    chain.with_state(|state| {
        state
            .logs
            .push(registry_log(&change, VALIDATOR_CONTRACT, 2));
        for (number, sealer) in [(2, 0), (3, 0), (4, 1), (5, 0), (6, 0)] {
            state.headers.insert(number, aura_header(number, &keys[sealer]));
        }
    });
    chain
}

#[tokio::test]
async fn aura_change_waits_for_finality_before_taking_effect() {
    let (keys, newcomer) = signers();
    let chain = aura_chain(&keys, &newcomer);
    let handler = handler(&chain, engine(ValidatorEngineKind::Aura, &keys));

    chain.set_head(3);
    let recorded = update_validator_history(chain.as_ref(), handler.context())
        .await
        .expect("first pass");
    assert_eq!(recorded, 0);
    let pending = handler
        .validator_list(ValidatorListQuery::default())
        .await
        .expect("validator list");
    assert_eq!(pending.states.len(), 1);
    assert_eq!(pending.last_checked_block, 1);

    chain.set_head(6);
    let recorded = update_validator_history(chain.as_ref(), handler.context())
        .await
        .expect("second pass");
    assert_eq!(recorded, 1);

    let tail = handler
        .validator_list(ValidatorListQuery {
            start_index: Some(1),
            limit: Some(5),
        })
        .await
        .expect("validator list");
    assert_eq!(tail.last_checked_block, 6);
    assert_eq!(tail.states.len(), 1);
    let entry = &tail.states[0];
    assert_eq!(entry.block, 5);

    let mut expected = vec![keys[0].address(), keys[1].address(), newcomer.address()];
    expected.sort();
    assert_eq!(entry.validators, expected);
    match &entry.proof {
        ValidatorTransitionProof::ContractLog {
            log_block,
            finality,
            ..
        } => {
            assert_eq!(*log_block, 2);
            assert_eq!(finality.len(), 3);
        }
        other => panic!("unexpected proof {other:?}"),
    }
}

#[test_case(33, 1 ; "one signer is a third")]
#[test_case(50, 2 ; "half rounds up to two signers")]
#[tokio::test]
async fn finality_proof_stops_at_requested_share(percent: u8, headers: usize) {
    let (keys, newcomer) = signers();
    let chain = aura_chain(&keys, &newcomer);
    chain.set_head(6);
    let handler = handler(&chain, engine(ValidatorEngineKind::Aura, &keys));

    let proof = handler
        .finality_proof(2, percent)
        .await
        .expect("finality proof");
    assert_eq!(proof.len(), headers);
}

#[tokio::test]
async fn finality_proof_reports_missing_signers() {
    let (keys, newcomer) = signers();
    let chain = aura_chain(&keys, &newcomer);
    chain.set_head(6);
    let handler = handler(&chain, engine(ValidatorEngineKind::Aura, &keys));

    let error = handler
        .finality_proof(2, 100)
        .await
        .expect_err("third validator never sealed");
    assert!(
        matches!(
            error,
            ValidatorHistoryError::FinalityNotReached {
                block: 2,
                count: 2,
                required: 3,
                searched: 4,
            }
        ),
        "{error}"
    );
}
