#![forbid(unsafe_code)]

use alloy_primitives::{B256, Bytes, b256};
use alloy_rlp::Encodable;

mod engine;
mod trie;
mod verify;

pub use engine::{
    DEFAULT_TRIE_CACHE_CAPACITY, ProofEngine, ProofEngineConfig, TrieCache, TriePool,
    default_worker_count,
};
pub use trie::Trie;
pub use verify::verify_proof;

/// Root of a trie with no entries, `keccak256(rlp(""))`.
pub const EMPTY_ROOT_HASH: B256 =
    b256!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421");

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("trie root mismatch: expected {expected}, computed {computed}")]
    RootMismatch { expected: B256, computed: B256 },
    #[error("proof is missing the node with hash {expected}")]
    MissingProofNode { expected: B256 },
    #[error("proof node {position} hashes to {actual}, expected {expected}")]
    ProofNodeMismatch {
        position: usize,
        expected: B256,
        actual: B256,
    },
    #[error("malformed trie node: {0}")]
    MalformedNode(String),
    #[error("proof carries {unused} node(s) past the {used} on the key's path")]
    UnusedProofNodes { used: usize, unused: usize },
    #[error("trie worker failed: {0}")]
    Worker(String),
    #[error("trie cache lock poisoned")]
    CachePoisoned,
}

/// Inclusion (or exclusion) path for one key of a built trie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofPath {
    pub root: B256,
    pub key: Bytes,
    /// Trie nodes from the root down, as `eth_getProof` lists them.
    pub nodes: Vec<Bytes>,
    pub value: Option<Bytes>,
}

/// Trie key of the `index`th element of an ordered trie (transactions, receipts).
pub fn ordered_trie_key(index: u64) -> Bytes {
    let mut out = Vec::with_capacity(9);
    index.encode(&mut out);
    out.into()
}

/// Builds a trie over `entries` and returns the path to `target`.
///
/// When `expected_root` is given the computed root must match it exactly.
pub fn build_proof<K, V>(
    entries: impl IntoIterator<Item = (K, V)>,
    target: &[u8],
    expected_root: Option<B256>,
) -> Result<ProofPath, MerkleError>
where
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let trie = Trie::from_entries(entries);
    check_root(&trie, expected_root)?;
    Ok(path_for(&trie, target))
}

pub(crate) fn check_root(trie: &Trie, expected_root: Option<B256>) -> Result<(), MerkleError> {
    match expected_root {
        Some(expected) if expected != trie.root_hash() => Err(MerkleError::RootMismatch {
            expected,
            computed: trie.root_hash(),
        }),
        _ => Ok(()),
    }
}

pub(crate) fn path_for(trie: &Trie, target: &[u8]) -> ProofPath {
    ProofPath {
        root: trie.root_hash(),
        key: Bytes::copy_from_slice(target),
        nodes: trie.proof(target),
        value: trie.get(target).map(Bytes::copy_from_slice),
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::keccak256;
    use test_case::test_case;

    use super::*;

    fn pairs(raw: &[(&'static str, &'static str)]) -> Vec<(Vec<u8>, Vec<u8>)> {
        raw.iter()
            .map(|(key, value)| (key.as_bytes().to_vec(), value.as_bytes().to_vec()))
            .collect()
    }

    fn ordered_entries(count: u64) -> Vec<(Bytes, Bytes)> {
        (0..count)
            .map(|index| {
                let value = keccak256(index.to_be_bytes()).to_vec();
                (ordered_trie_key(index), Bytes::from(value))
            })
            .collect()
    }

    #[test_case(&[("doe", "reindeer"), ("dog", "puppy"), ("dogglesworth", "cat")],
        b256!("8aad789dff2f538bca5d8ea56e8abe10f4c7ba3a5dea95fea4cd6e7c3a1168d3") ; "dogs")]
    #[test_case(&[("do", "verb"), ("horse", "stallion"), ("doge", "coin"), ("dog", "puppy")],
        b256!("5991bb8c6514148a29db676a14ac506cd2cd5775ace63c30a4fe457715e9ac84") ; "puppy")]
    #[test_case(&[("foo", "bar"), ("food", "bass")],
        b256!("17beaa1648bafa633cda809c90c04af50fc8aed3cb40d16efbddee6fdf63c4c3") ; "foo")]
    fn matches_known_roots(raw: &[(&'static str, &'static str)], root: B256) {
        let entries = pairs(raw);
        assert_eq!(Trie::from_entries(entries.clone()).root_hash(), root);

        let reversed: Vec<_> = entries.iter().rev().cloned().collect();
        assert_eq!(Trie::from_entries(reversed).root_hash(), root);
    }

    #[test]
    fn empty_trie_has_empty_root() {
        let trie = Trie::from_entries(Vec::<(Bytes, Bytes)>::new());
        assert_eq!(trie.root_hash(), EMPTY_ROOT_HASH);
        assert_eq!(keccak256([0x80]), EMPTY_ROOT_HASH);
    }

    #[test]
    fn ordered_keys_are_rlp_of_index() {
        assert_eq!(ordered_trie_key(0).as_ref(), &[0x80]);
        assert_eq!(ordered_trie_key(1).as_ref(), &[0x01]);
        assert_eq!(ordered_trie_key(0x7f).as_ref(), &[0x7f]);
        assert_eq!(ordered_trie_key(0x80).as_ref(), &[0x81, 0x80]);
        assert_eq!(ordered_trie_key(0x0400).as_ref(), &[0x82, 0x04, 0x00]);
    }

    #[test]
    fn build_proof_accepts_matching_root_and_rejects_mismatch() {
        let entries = ordered_entries(40);
        let root = Trie::from_entries(entries.clone()).root_hash();
        let target = ordered_trie_key(17);

        let path = build_proof(entries.clone(), &target, Some(root)).expect("matching root");
        assert_eq!(path.root, root);
        assert_eq!(path.value.as_ref(), Some(&entries[17].1));

        let err = build_proof(entries, &target, Some(B256::repeat_byte(0x42)))
            .expect_err("wrong root must fail");
        assert_eq!(
            err,
            MerkleError::RootMismatch {
                expected: B256::repeat_byte(0x42),
                computed: root,
            }
        );
    }

    #[test]
    fn any_single_bit_flip_breaks_root_binding() {
        let entries = ordered_entries(12);
        let root = Trie::from_entries(entries.clone()).root_hash();
        for index in 0..entries.len() {
            for bit in [0_u8, 3, 7] {
                let mut mutated = entries.clone();
                let mut value = mutated[index].1.to_vec();
                let len = value.len();
                value[index % len] ^= 1 << bit;
                mutated[index].1 = Bytes::from(value);
                let result = build_proof(mutated, &ordered_trie_key(0), Some(root));
                assert!(
                    matches!(result, Err(MerkleError::RootMismatch { .. })),
                    "flipping bit {bit} of entry {index} must change the root"
                );
            }
        }
    }

    #[test]
    fn every_path_replays_to_its_value() {
        let entries = ordered_entries(300);
        let trie = Trie::from_entries(entries.clone());
        for (key, value) in &entries {
            let path = path_for(&trie, key);
            assert_eq!(path.nodes.first().map(keccak256), Some(trie.root_hash()));
            let replayed = verify_proof(&trie.root_hash(), key, &path.nodes).expect("verify");
            assert_eq!(replayed.as_deref(), Some(value.as_ref()));
        }
    }

    #[test]
    fn small_values_are_embedded_and_still_verify() {
        let entries: Vec<(Bytes, Bytes)> = (0..20_u64)
            .map(|index| (ordered_trie_key(index), Bytes::from(vec![index as u8 + 1])))
            .collect();
        let trie = Trie::from_entries(entries.clone());
        for (key, value) in &entries {
            let path = path_for(&trie, key);
            assert!(path.nodes.iter().all(|node| node.len() >= 32 || node == &path.nodes[0]));
            let replayed = verify_proof(&trie.root_hash(), key, &path.nodes).expect("verify");
            assert_eq!(replayed.as_deref(), Some(value.as_ref()));
        }
    }

    #[test]
    fn absent_keys_verify_as_exclusion() {
        let entries = pairs(&[("do", "verb"), ("horse", "stallion"), ("doge", "coin"), ("dog", "puppy")]);
        let trie = Trie::from_entries(entries);
        for missing in [b"d".as_slice(), b"dot", b"doges", b"cat", b"horses"] {
            let path = path_for(&trie, missing);
            assert_eq!(path.value, None);
            let replayed = verify_proof(&trie.root_hash(), missing, &path.nodes).expect("verify");
            assert_eq!(replayed, None);
        }
    }

    #[test]
    fn tampered_proof_node_is_rejected() {
        let entries = ordered_entries(64);
        let trie = Trie::from_entries(entries);
        let key = ordered_trie_key(5);
        let mut nodes = trie.proof(&key);
        assert!(nodes.len() >= 2);
        let mut tampered = nodes[1].to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        nodes[1] = Bytes::from(tampered);

        let err = verify_proof(&trie.root_hash(), &key, &nodes).expect_err("tampered");
        assert!(matches!(err, MerkleError::ProofNodeMismatch { position: 1, .. }));
    }

    #[test]
    fn truncated_proof_reports_missing_node() {
        let entries = ordered_entries(64);
        let trie = Trie::from_entries(entries);
        let key = ordered_trie_key(9);
        let nodes = trie.proof(&key);
        let err = verify_proof(&trie.root_hash(), &key, &nodes[..1]).expect_err("truncated");
        assert!(matches!(err, MerkleError::MissingProofNode { .. }));
    }

    #[test]
    fn trailing_nodes_past_the_path_are_rejected() {
        let entries = ordered_entries(64);
        let trie = Trie::from_entries(entries);
        let key = ordered_trie_key(9);
        let mut nodes = trie.proof(&key);
        let used = nodes.len();
        nodes.push(trie.proof(&ordered_trie_key(40))[1].clone());

        let err = verify_proof(&trie.root_hash(), &key, &nodes).expect_err("padded");
        assert!(
            matches!(err, MerkleError::UnusedProofNodes { used: u, unused: 1 } if u == used),
            "{err}"
        );

        // Same for an exclusion proof.
        let mut absent = trie.proof(b"not a key");
        absent.push(Bytes::from_static(&[0xc0]));
        assert!(matches!(
            verify_proof(&trie.root_hash(), b"not a key", &absent),
            Err(MerkleError::UnusedProofNodes { unused: 1, .. })
        ));
    }
}
