/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trie node types, the nibble arithmetic, and the versioned node codec.
//!
//! Nodes are content-addressed: a node's identity is the Keccak-256 hash of its encoding, and
//! a node is never rewritten under the same hash. Child references inside an encoding are always
//! 32-byte hashes (the zero hash for an absent child); in memory, a child may instead be held
//! inline, or as a lazy [`Node::Hash`] placeholder that the
//! [node store](super::database::NodeStore) resolves on first access.

use sha3::{Digest, Keccak256};

use crate::types::basic::CryptoHash;

/// Storage format version prepended to every stored node encoding.
pub(crate) const NODE_CODEC_VERSION: u8 = 1;

mod tag {
    pub(super) const BRANCH: u8 = 0;
    pub(super) const EXTENSION: u8 = 1;
    pub(super) const LEAF: u8 = 2;
    pub(super) const EMPTY: u8 = 3;
}

/// A node in the Merkle-Patricia trie.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    /// No data.
    Empty,

    /// Terminal node holding the remaining key path (in nibbles) and a value.
    Leaf { path: Vec<u8>, value: Vec<u8> },

    /// Compresses a shared key prefix (in nibbles) above a single child.
    Extension { path: Vec<u8>, child: Box<Node> },

    /// Sixteen-way fan-out, one child slot per nibble, plus an optional value for keys that end
    /// at this node.
    Branch {
        children: Box<[Node; 16]>,
        value: Option<Vec<u8>>,
    },

    /// Lazy reference to a node that lives in the node store. Resolved on first access.
    Hash(CryptoHash),
}

/// Enumerates the ways trie operations can fail.
#[derive(Debug, PartialEq, Eq)]
pub enum TrieError {
    /// A [`Node::Hash`] reference could not be resolved from the node store.
    MissingNode(CryptoHash),

    /// A stored node failed to decode.
    CorruptNode(CryptoHash),
}

impl std::fmt::Display for TrieError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrieError::MissingNode(hash) => write!(f, "missing trie node {}", hash),
            TrieError::CorruptNode(hash) => write!(f, "corrupt trie node {}", hash),
        }
    }
}

impl Node {
    /// Whether this node is [`Node::Empty`].
    pub fn is_empty(&self) -> bool {
        matches!(self, Node::Empty)
    }

    /// The content hash of this node: Keccak-256 of its encoding. The empty node hashes to the
    /// zero sentinel; a [`Node::Hash`] placeholder already knows its hash.
    pub fn hash(&self) -> CryptoHash {
        match self {
            Node::Empty => CryptoHash::zero(),
            Node::Hash(hash) => *hash,
            _ => {
                let mut hasher = Keccak256::new();
                hasher.update(self.encode());
                CryptoHash::new(hasher.finalize().into())
            }
        }
    }

    /// Encode this node. Child references encode as their 32-byte hashes.
    ///
    /// # Panics
    ///
    /// Panics on [`Node::Hash`]: a placeholder has no encoding of its own and must be resolved
    /// first.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Node::Empty => vec![tag::EMPTY],
            Node::Leaf { path, value } => {
                let mut buf = Vec::with_capacity(1 + 8 + path.len() + value.len());
                buf.push(tag::LEAF);
                buf.extend_from_slice(&(path.len() as u32).to_le_bytes());
                buf.extend_from_slice(path);
                buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
                buf.extend_from_slice(value);
                buf
            }
            Node::Extension { path, child } => {
                let mut buf = Vec::with_capacity(1 + 4 + path.len() + 32);
                buf.push(tag::EXTENSION);
                buf.extend_from_slice(&(path.len() as u32).to_le_bytes());
                buf.extend_from_slice(path);
                buf.extend_from_slice(&child.hash().bytes());
                buf
            }
            Node::Branch { children, value } => {
                let mut buf = Vec::with_capacity(1 + 16 * 32 + 4);
                buf.push(tag::BRANCH);
                for child in children.iter() {
                    buf.extend_from_slice(&child.hash().bytes());
                }
                match value {
                    Some(value) => {
                        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
                        buf.extend_from_slice(value);
                    }
                    None => buf.extend_from_slice(&u32::MAX.to_le_bytes()),
                }
                buf
            }
            Node::Hash(_) => panic!("cannot encode an unresolved hash node"),
        }
    }

    /// Decode a node encoding produced by [`encode`](Node::encode). Child hashes decode as
    /// [`Node::Hash`] placeholders (the zero hash as [`Node::Empty`]).
    pub fn decode(bytes: &[u8]) -> Option<Node> {
        let (&tag, rest) = bytes.split_first()?;
        match tag {
            tag::EMPTY => rest.is_empty().then_some(Node::Empty),
            tag::LEAF => {
                let (path, rest) = take_len_prefixed(rest)?;
                let (value, rest) = take_len_prefixed(rest)?;
                rest.is_empty().then_some(Node::Leaf {
                    path: path.to_vec(),
                    value: value.to_vec(),
                })
            }
            tag::EXTENSION => {
                let (path, rest) = take_len_prefixed(rest)?;
                let hash: [u8; 32] = rest.try_into().ok()?;
                Some(Node::Extension {
                    path: path.to_vec(),
                    child: Box::new(node_ref(CryptoHash::new(hash))),
                })
            }
            tag::BRANCH => {
                if rest.len() < 16 * 32 + 4 {
                    return None;
                }
                let mut children: [Node; 16] = Default::default();
                for (i, child) in children.iter_mut().enumerate() {
                    let hash: [u8; 32] = rest[i * 32..(i + 1) * 32].try_into().ok()?;
                    *child = node_ref(CryptoHash::new(hash));
                }
                let rest = &rest[16 * 32..];
                let len = u32::from_le_bytes(rest[..4].try_into().ok()?);
                let rest = &rest[4..];
                let value = if len == u32::MAX {
                    if !rest.is_empty() {
                        return None;
                    }
                    None
                } else {
                    if rest.len() != len as usize {
                        return None;
                    }
                    Some(rest.to_vec())
                };
                Some(Node::Branch {
                    children: Box::new(children),
                    value,
                })
            }
            _ => None,
        }
    }
}

impl Default for Node {
    fn default() -> Node {
        Node::Empty
    }
}

fn node_ref(hash: CryptoHash) -> Node {
    if hash.is_zero() {
        Node::Empty
    } else {
        Node::Hash(hash)
    }
}

fn take_len_prefixed(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    if bytes.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes(bytes[..4].try_into().ok()?) as usize;
    let rest = &bytes[4..];
    if rest.len() < len {
        return None;
    }
    Some((&rest[..len], &rest[len..]))
}

/// Convert a byte key to nibbles, high nibble first.
pub(crate) fn key_to_nibbles(key: &[u8]) -> Vec<u8> {
    let mut nibbles = Vec::with_capacity(key.len() * 2);
    for byte in key {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0f);
    }
    nibbles
}

/// The length of the longest common prefix of two nibble slices.
pub(crate) fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nibble_conversion() {
        assert_eq!(key_to_nibbles(&[0xab, 0x04]), vec![0x0a, 0x0b, 0x00, 0x04]);
        assert_eq!(common_prefix(&[1, 2, 3], &[1, 2, 4]), 2);
        assert_eq!(common_prefix(&[1], &[2]), 0);
    }

    #[test]
    fn leaf_codec_round_trip() {
        let leaf = Node::Leaf {
            path: vec![1, 2, 3],
            value: b"value".to_vec(),
        };
        let decoded = Node::decode(&leaf.encode()).unwrap();
        assert_eq!(leaf, decoded);
        assert_eq!(leaf.hash(), decoded.hash());
    }

    #[test]
    fn branch_codec_round_trip_preserves_child_hashes() {
        let leaf = Node::Leaf {
            path: vec![7],
            value: b"x".to_vec(),
        };
        let mut children: [Node; 16] = Default::default();
        children[3] = leaf.clone();
        let branch = Node::Branch {
            children: Box::new(children),
            value: Some(b"at-branch".to_vec()),
        };

        let decoded = Node::decode(&branch.encode()).unwrap();
        // Children decode as hash placeholders carrying the same identity.
        assert_eq!(branch.hash(), decoded.hash());
        match decoded {
            Node::Branch { children, value } => {
                assert_eq!(children[3], Node::Hash(leaf.hash()));
                assert_eq!(value, Some(b"at-branch".to_vec()));
            }
            _ => panic!("expected branch"),
        }
    }

    #[test]
    fn empty_value_and_no_value_are_distinct() {
        let with_empty_value = Node::Branch {
            children: Box::new(Default::default()),
            value: Some(Vec::new()),
        };
        let without_value = Node::Branch {
            children: Box::new(Default::default()),
            value: None,
        };
        assert_ne!(with_empty_value.hash(), without_value.hash());
        assert_eq!(
            Node::decode(&with_empty_value.encode()).unwrap().hash(),
            with_empty_value.hash()
        );
    }
}
