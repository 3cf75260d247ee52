use alloy_primitives::{B256, Bytes, keccak256};
use alloy_rlp::Header;

use crate::MerkleError;
use crate::trie::to_nibbles;

const EMPTY_STRING_CODE: u8 = 0x80;
const HASH_REFERENCE_LEN: usize = 33;

enum Reference {
    Hash(B256),
    Inline(Vec<u8>),
}

/// Replays `proof` from `root` along `key`.
///
/// Returns the stored value for an inclusion proof and `None` when the path proves absence.
/// Nodes left over after the walk ends are rejected.
pub fn verify_proof(root: &B256, key: &[u8], proof: &[Bytes]) -> Result<Option<Vec<u8>>, MerkleError> {
    let mut remaining = proof.iter().enumerate();
    let value = walk(root, key, &mut remaining)?;
    match remaining.len() {
        0 => Ok(value),
        unused => Err(MerkleError::UnusedProofNodes {
            used: proof.len() - unused,
            unused,
        }),
    }
}

fn walk<'a>(
    root: &B256,
    key: &[u8],
    remaining: &mut impl Iterator<Item = (usize, &'a Bytes)>,
) -> Result<Option<Vec<u8>>, MerkleError> {
    let nibbles = to_nibbles(key);
    let mut path = nibbles.as_slice();
    let mut expected = Reference::Hash(*root);

    loop {
        let encoded = match expected {
            Reference::Hash(hash) => {
                let (position, node) = remaining
                    .next()
                    .ok_or(MerkleError::MissingProofNode { expected: hash })?;
                let actual = keccak256(node);
                if actual != hash {
                    return Err(MerkleError::ProofNodeMismatch {
                        position,
                        expected: hash,
                        actual,
                    });
                }
                node.to_vec()
            }
            Reference::Inline(raw) => raw,
        };

        if encoded.as_slice() == [EMPTY_STRING_CODE] {
            return Ok(None);
        }

        let items = list_items(&encoded)?;
        match items.len() {
            17 => match path.split_first() {
                None => {
                    let value = string_payload(items[16])?;
                    return Ok((!value.is_empty()).then(|| value.to_vec()));
                }
                Some((&first, rest)) => {
                    let child = items[usize::from(first)];
                    if child == [EMPTY_STRING_CODE] {
                        return Ok(None);
                    }
                    path = rest;
                    expected = child_reference(child)?;
                }
            },
            2 => {
                let (segment, leaf) = decode_hex_prefix(string_payload(items[0])?)?;
                if leaf {
                    if segment.as_slice() == path {
                        return Ok(Some(string_payload(items[1])?.to_vec()));
                    }
                    return Ok(None);
                }
                match path.strip_prefix(segment.as_slice()) {
                    Some(rest) => {
                        path = rest;
                        expected = child_reference(items[1])?;
                    }
                    None => return Ok(None),
                }
            }
            count => {
                return Err(MerkleError::MalformedNode(format!(
                    "trie node has {count} items, expected 2 or 17"
                )));
            }
        }
    }
}

/// Splits an RLP list into the raw encodings of its items.
fn list_items(encoded: &[u8]) -> Result<Vec<&[u8]>, MerkleError> {
    let mut buf = encoded;
    let header = Header::decode(&mut buf).map_err(malformed)?;
    if !header.list || header.payload_length != buf.len() {
        return Err(MerkleError::MalformedNode(
            "trie node is not a single rlp list".to_string(),
        ));
    }
    let mut items = Vec::with_capacity(17);
    while !buf.is_empty() {
        let mut cursor = buf;
        let item_header = Header::decode(&mut cursor).map_err(malformed)?;
        let header_len = buf.len() - cursor.len();
        let total = header_len + item_header.payload_length;
        if total > buf.len() {
            return Err(MerkleError::MalformedNode(
                "trie node item overruns its list".to_string(),
            ));
        }
        let (item, rest) = buf.split_at(total);
        items.push(item);
        buf = rest;
    }
    Ok(items)
}

fn string_payload(item: &[u8]) -> Result<&[u8], MerkleError> {
    let mut buf = item;
    let header = Header::decode(&mut buf).map_err(malformed)?;
    if header.list {
        return Err(MerkleError::MalformedNode(
            "expected rlp string, found list".to_string(),
        ));
    }
    Ok(buf)
}

fn child_reference(item: &[u8]) -> Result<Reference, MerkleError> {
    if item.len() == HASH_REFERENCE_LEN && item[0] == EMPTY_STRING_CODE + 32 {
        return Ok(Reference::Hash(B256::from_slice(&item[1..])));
    }
    if item.first().is_some_and(|prefix| *prefix >= 0xc0) {
        return Ok(Reference::Inline(item.to_vec()));
    }
    Err(MerkleError::MalformedNode(format!(
        "child reference of {} bytes is neither a hash nor an embedded node",
        item.len()
    )))
}

fn decode_hex_prefix(encoded: &[u8]) -> Result<(Vec<u8>, bool), MerkleError> {
    let (&first, rest) = encoded
        .split_first()
        .ok_or_else(|| MerkleError::MalformedNode("empty hex-prefix path".to_string()))?;
    let flag = first >> 4;
    if flag > 3 {
        return Err(MerkleError::MalformedNode(format!(
            "invalid hex-prefix flag {flag}"
        )));
    }
    let mut nibbles = Vec::with_capacity(rest.len() * 2 + 1);
    if flag & 1 == 1 {
        nibbles.push(first & 0x0f);
    }
    for byte in rest {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0f);
    }
    Ok((nibbles, flag & 2 == 2))
}

fn malformed(error: alloy_rlp::Error) -> MerkleError {
    MerkleError::MalformedNode(error.to_string())
}
