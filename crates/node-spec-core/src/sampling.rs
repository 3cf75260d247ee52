use std::collections::BTreeSet;

use alloy_primitives::{B256, keccak256};

fn read_u48(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(6)
        .fold(0_u64, |acc, byte| (acc << 8) | u64::from(*byte))
}

/// Picks `limit` distinct indices out of `0..total`, reproducibly for a given seed.
///
/// The walk starts at `seed[6..12] % total` and advances by `seed[0..6]`; whenever it lands on
/// an index already taken the seed is re-hashed and a new step is read from it. Indices in
/// `must_include` are taken first and count towards `limit`. The result is sorted.
pub fn seeded_sample(total: u64, limit: u64, seed: &B256, must_include: &[u64]) -> Vec<u64> {
    if limit >= total {
        return (0..total).collect();
    }

    let mut chosen: BTreeSet<u64> = must_include
        .iter()
        .copied()
        .filter(|index| *index < total)
        .collect();
    if chosen.len() as u64 >= limit {
        return chosen.into_iter().collect();
    }

    let mut seed = *seed;
    let mut step = read_u48(&seed[0..6]);
    let mut position = read_u48(&seed[6..12]) % total;
    while (chosen.len() as u64) < limit {
        if chosen.contains(&position) {
            seed = keccak256(seed);
            step = read_u48(&seed[0..6]);
        } else {
            chosen.insert(position);
        }
        position = (position + step) % total;
    }
    chosen.into_iter().collect()
}
