use std::collections::BTreeSet;

use alloy_primitives::Address;

/// Distinct signers needed before an Aura validator-set change is final: `ceil((n + 1) / 2)`.
pub fn transition_quorum(validator_count: usize) -> usize {
    (validator_count + 1).div_ceil(2)
}

/// Distinct signers covering `percent` of the set: `ceil(n * percent / 100)`.
pub fn percent_quorum(validator_count: usize, percent: u8) -> usize {
    (validator_count * usize::from(percent.min(100))).div_ceil(100)
}

/// Accumulates sealers of consecutive blocks until enough distinct eligible ones were seen.
#[derive(Debug, Clone)]
pub struct SignerQuorum {
    eligible: BTreeSet<Address>,
    seen: BTreeSet<Address>,
    required: usize,
}

impl SignerQuorum {
    pub fn new(eligible: &[Address], required: usize) -> Self {
        Self {
            eligible: eligible.iter().copied().collect(),
            seen: BTreeSet::new(),
            required,
        }
    }

    /// Records a sealer; returns whether it was newly counted.
    pub fn observe(&mut self, signer: Address) -> bool {
        self.eligible.contains(&signer) && self.seen.insert(signer)
    }

    pub fn count(&self) -> usize {
        self.seen.len()
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn is_reached(&self) -> bool {
        self.seen.len() >= self.required
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(1, 1)]
    #[test_case(2, 2)]
    #[test_case(3, 2)]
    #[test_case(4, 3)]
    #[test_case(5, 3)]
    #[test_case(10, 6)]
    fn transition_quorum_is_ceil_half_of_n_plus_one(n: usize, expected: usize) {
        assert_eq!(transition_quorum(n), expected);
    }

    #[test_case(4, 50, 2)]
    #[test_case(5, 50, 3)]
    #[test_case(3, 100, 3)]
    #[test_case(3, 0, 0)]
    #[test_case(3, 250, 3)]
    fn percent_quorum_rounds_up(n: usize, percent: u8, expected: usize) {
        assert_eq!(percent_quorum(n, percent), expected);
    }

    #[test]
    fn quorum_counts_only_distinct_eligible_signers() {
        let eligible = [Address::repeat_byte(1), Address::repeat_byte(2), Address::repeat_byte(3)];
        let mut quorum = SignerQuorum::new(&eligible, 2);

        assert!(quorum.observe(Address::repeat_byte(1)));
        assert!(!quorum.observe(Address::repeat_byte(1)));
        assert!(!quorum.observe(Address::repeat_byte(9)));
        assert!(!quorum.is_reached());

        assert!(quorum.observe(Address::repeat_byte(3)));
        assert!(quorum.is_reached());
        assert_eq!(quorum.count(), 2);
    }
}
