use alloy_primitives::{B256, Bytes, keccak256};
use alloy_rlp::Encodable;

const HASH_REFERENCE_THRESHOLD: usize = 32;
const EMPTY_STRING_CODE: u8 = 0x80;

#[derive(Debug, Clone, Default)]
enum Node {
    #[default]
    Empty,
    Leaf {
        path: Vec<u8>,
        value: Vec<u8>,
    },
    Extension {
        path: Vec<u8>,
        child: Box<Node>,
    },
    Branch {
        children: Box<[Node; 16]>,
        value: Option<Vec<u8>>,
    },
}

fn empty_children() -> Box<[Node; 16]> {
    Box::new(std::array::from_fn(|_| Node::Empty))
}

/// Puts a value under a branch, either in its value slot or below the matching child.
fn place(children: &mut [Node; 16], branch_value: &mut Option<Vec<u8>>, path: &[u8], value: Vec<u8>) {
    match path.split_first() {
        None => *branch_value = Some(value),
        Some((&first, rest)) => {
            let slot = usize::from(first);
            let existing = std::mem::take(&mut children[slot]);
            children[slot] = existing.insert(rest, value);
        }
    }
}

impl Node {
    fn insert(self, path: &[u8], value: Vec<u8>) -> Node {
        match self {
            Node::Empty => Node::Leaf {
                path: path.to_vec(),
                value,
            },
            Node::Leaf {
                path: leaf_path,
                value: leaf_value,
            } => {
                let common = common_prefix_len(&leaf_path, path);
                if common == leaf_path.len() && common == path.len() {
                    return Node::Leaf {
                        path: leaf_path,
                        value,
                    };
                }
                let mut children = empty_children();
                let mut branch_value = None;
                place(&mut children, &mut branch_value, &leaf_path[common..], leaf_value);
                place(&mut children, &mut branch_value, &path[common..], value);
                wrap_extension(
                    &path[..common],
                    Node::Branch {
                        children,
                        value: branch_value,
                    },
                )
            }
            Node::Extension {
                path: ext_path,
                child,
            } => {
                let common = common_prefix_len(&ext_path, path);
                if common == ext_path.len() {
                    return Node::Extension {
                        child: Box::new((*child).insert(&path[common..], value)),
                        path: ext_path,
                    };
                }
                let remainder = &ext_path[common..];
                let displaced = if remainder.len() == 1 {
                    *child
                } else {
                    Node::Extension {
                        path: remainder[1..].to_vec(),
                        child,
                    }
                };
                let mut children = empty_children();
                let mut branch_value = None;
                children[usize::from(remainder[0])] = displaced;
                place(&mut children, &mut branch_value, &path[common..], value);
                wrap_extension(
                    &path[..common],
                    Node::Branch {
                        children,
                        value: branch_value,
                    },
                )
            }
            Node::Branch {
                mut children,
                value: mut branch_value,
            } => {
                place(&mut children, &mut branch_value, path, value);
                Node::Branch {
                    children,
                    value: branch_value,
                }
            }
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Node::Empty => return vec![EMPTY_STRING_CODE],
            Node::Leaf { path, value } => {
                hex_prefix(path, true).as_slice().encode(&mut payload);
                value.as_slice().encode(&mut payload);
            }
            Node::Extension { path, child } => {
                hex_prefix(path, false).as_slice().encode(&mut payload);
                payload.extend_from_slice(&child.reference());
            }
            Node::Branch { children, value } => {
                for child in children.iter() {
                    payload.extend_from_slice(&child.reference());
                }
                match value {
                    Some(value) => value.as_slice().encode(&mut payload),
                    None => payload.push(EMPTY_STRING_CODE),
                }
            }
        }
        let mut out = Vec::with_capacity(payload.len() + 3);
        alloy_rlp::Header {
            list: true,
            payload_length: payload.len(),
        }
        .encode(&mut out);
        out.extend_from_slice(&payload);
        out
    }

    /// How a parent refers to this node: inline when short, otherwise by hash.
    fn reference(&self) -> Vec<u8> {
        let encoded = self.encode();
        if encoded.len() < HASH_REFERENCE_THRESHOLD {
            return encoded;
        }
        let mut out = Vec::with_capacity(33);
        keccak256(&encoded).encode(&mut out);
        out
    }
}

fn wrap_extension(path: &[u8], node: Node) -> Node {
    if path.is_empty() {
        node
    } else {
        Node::Extension {
            path: path.to_vec(),
            child: Box::new(node),
        }
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(left, right)| left == right).count()
}

pub(crate) fn to_nibbles(key: &[u8]) -> Vec<u8> {
    key.iter().flat_map(|byte| [byte >> 4, byte & 0x0f]).collect()
}

pub(crate) fn hex_prefix(nibbles: &[u8], leaf: bool) -> Vec<u8> {
    let flag = if leaf { 0x20 } else { 0x00 };
    let mut out = Vec::with_capacity(nibbles.len() / 2 + 1);
    let rest = if nibbles.len() % 2 == 1 {
        out.push(flag | 0x10 | nibbles[0]);
        &nibbles[1..]
    } else {
        out.push(flag);
        nibbles
    };
    out.extend(rest.chunks_exact(2).map(|pair| (pair[0] << 4) | pair[1]));
    out
}

/// A fully built Modified Merkle Patricia trie.
#[derive(Debug, Clone)]
pub struct Trie {
    root: Node,
    root_hash: B256,
}

impl Trie {
    /// Builds a trie from `(key, value)` pairs. Empty values are absent, as on chain.
    pub fn from_entries<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut root = Node::Empty;
        for (key, value) in entries {
            if value.as_ref().is_empty() {
                continue;
            }
            root = root.insert(&to_nibbles(key.as_ref()), value.as_ref().to_vec());
        }
        let root_hash = keccak256(root.encode());
        Self { root, root_hash }
    }

    pub fn root_hash(&self) -> B256 {
        self.root_hash
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.root, Node::Empty)
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let nibbles = to_nibbles(key);
        let mut path = nibbles.as_slice();
        let mut node = &self.root;
        loop {
            match node {
                Node::Empty => return None,
                Node::Leaf {
                    path: leaf_path,
                    value,
                } => return (leaf_path.as_slice() == path).then_some(value.as_slice()),
                Node::Extension {
                    path: ext_path,
                    child,
                } => {
                    path = path.strip_prefix(ext_path.as_slice())?;
                    node = child;
                }
                Node::Branch { children, value } => match path.split_first() {
                    None => return value.as_deref(),
                    Some((&first, rest)) => {
                        node = &children[usize::from(first)];
                        path = rest;
                    }
                },
            }
        }
    }

    /// Nodes on the path to `key`, root first, skipping nodes embedded in their parent.
    ///
    /// For an absent key the path ends at the node that proves the absence.
    pub fn proof(&self, key: &[u8]) -> Vec<Bytes> {
        let nibbles = to_nibbles(key);
        let mut path = nibbles.as_slice();
        let mut node = &self.root;
        let mut nodes = vec![Bytes::from(self.root.encode())];
        loop {
            let next = match node {
                Node::Empty | Node::Leaf { .. } => None,
                Node::Extension {
                    path: ext_path,
                    child,
                } => match path.strip_prefix(ext_path.as_slice()) {
                    Some(rest) => {
                        path = rest;
                        Some(child.as_ref())
                    }
                    None => None,
                },
                Node::Branch { children, .. } => match path.split_first() {
                    Some((&first, rest)) => {
                        path = rest;
                        Some(&children[usize::from(first)])
                    }
                    None => None,
                },
            };
            let Some(child) = next else {
                return nodes;
            };
            if matches!(child, Node::Empty) {
                return nodes;
            }
            let encoded = child.encode();
            if encoded.len() >= HASH_REFERENCE_THRESHOLD {
                nodes.push(Bytes::from(encoded));
            }
            node = child;
        }
    }
}
