//! Clique-style validator voting.
//!
//! Between epoch blocks each sealer may cast one vote per block to add or drop a nominee.
//! A ballot commits once `floor(n / 2) + 1` distinct validators back the same change.

use alloy_primitives::{Address, Bytes};
use in3_node_types::{Ballot, BlockNumber, EpochTally};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoredVote {
    NotAValidator,
    NoOp,
    AlreadyCounted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    Ignored(IgnoredVote),
    Counted {
        votes: usize,
        required: usize,
    },
    /// The change took effect; `validators` is the new sorted set.
    Committed {
        nominee: Address,
        authorize: bool,
        validators: Vec<Address>,
        ballot: Ballot,
    },
}

pub fn majority(validator_count: usize) -> usize {
    validator_count / 2 + 1
}

/// Resets the tally at an epoch boundary; pending ballots do not carry over.
pub fn start_epoch(tally: &mut EpochTally, epoch_block: BlockNumber) {
    tally.epoch_block = epoch_block;
    tally.ballots.clear();
}

/// Counts one header vote against the active `validators`.
pub fn apply_vote(
    tally: &mut EpochTally,
    validators: &[Address],
    voter: Address,
    nominee: Address,
    authorize: bool,
    header: Bytes,
) -> VoteOutcome {
    if !validators.contains(&voter) {
        return VoteOutcome::Ignored(IgnoredVote::NotAValidator);
    }
    if validators.contains(&nominee) == authorize {
        return VoteOutcome::Ignored(IgnoredVote::NoOp);
    }

    // A newer vote on the same nominee replaces the voter's earlier one in the other direction.
    for ballot in tally
        .ballots
        .iter_mut()
        .filter(|ballot| ballot.nominee == nominee && ballot.authorize != authorize)
    {
        withdraw(ballot, voter);
    }
    tally.ballots.retain(|ballot| !ballot.voters.is_empty());

    let position = match tally
        .ballots
        .iter()
        .position(|ballot| ballot.nominee == nominee && ballot.authorize == authorize)
    {
        Some(position) => position,
        None => {
            tally.ballots.push(Ballot {
                nominee,
                authorize,
                voters: Vec::new(),
                headers: Vec::new(),
            });
            tally.ballots.len() - 1
        }
    };

    let ballot = &mut tally.ballots[position];
    if ballot.voters.contains(&voter) {
        return VoteOutcome::Ignored(IgnoredVote::AlreadyCounted);
    }
    ballot.voters.push(voter);
    ballot.headers.push(header);

    let required = majority(validators.len());
    if ballot.voters.len() < required {
        return VoteOutcome::Counted {
            votes: ballot.voters.len(),
            required,
        };
    }

    let ballot = tally.ballots.remove(position);
    tally.ballots.retain(|other| other.nominee != nominee);

    let mut next: Vec<Address> = validators.to_vec();
    if authorize {
        next.push(nominee);
    } else {
        next.retain(|validator| *validator != nominee);
        for pending in &mut tally.ballots {
            withdraw(pending, nominee);
        }
        tally.ballots.retain(|pending| !pending.voters.is_empty());
    }
    next.sort();

    VoteOutcome::Committed {
        nominee,
        authorize,
        validators: next,
        ballot,
    }
}

/// Drops `voter` from `ballot` along with the header that carried the vote.
fn withdraw(ballot: &mut Ballot, voter: Address) {
    if let Some(at) = ballot.voters.iter().position(|existing| *existing == voter) {
        ballot.voters.remove(at);
        if at < ballot.headers.len() {
            ballot.headers.remove(at);
        }
    }
}
