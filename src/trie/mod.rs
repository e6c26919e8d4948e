/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! An authenticated Merkle-Patricia trie over nibble paths.
//!
//! The trie feeds every root hash in the system: the world `state_root`, each account's
//! `storage_root`, and the per-block `tx_root` and `receipt_root`.
//!
//! ## Canonical form
//!
//! Logically equal tries always share the same root hash. Inserts split on longest common
//! prefixes deterministically, and deletes collapse single-child branches back into extensions
//! and leaves, so the structure (and therefore the root) depends only on the key-value contents.
//!
//! ## Persistence
//!
//! Mutations build nodes in memory; [`commit`](Mpt::commit) writes every newly reachable node to
//! the [`NodeStore`] keyed by its hash and replaces the in-memory tree with a lazy root
//! reference. Unmodified subtrees stay as hash references throughout and are reloaded through
//! the store's LRU cache on demand.

pub mod database;
pub mod node;

use crate::kv_store::KVStore;
use crate::trie::database::NodeStore;
use crate::trie::node::{common_prefix, key_to_nibbles, Node, TrieError};
use crate::types::basic::CryptoHash;

use sha3::{Digest, Keccak256};

/// A Merkle-Patricia trie. Cheap to create; state lives in the [`NodeStore`] passed to each
/// operation.
#[derive(Clone, Debug)]
pub struct Mpt {
    root: Node,
}

impl Mpt {
    /// Create an empty trie.
    pub fn new() -> Mpt {
        Mpt { root: Node::Empty }
    }

    /// Open the trie rooted at `root_hash`. The root node is loaded lazily on first access.
    pub fn from_root(root_hash: CryptoHash) -> Mpt {
        if root_hash.is_zero() {
            Mpt::new()
        } else {
            Mpt {
                root: Node::Hash(root_hash),
            }
        }
    }

    /// The root hash; the zero sentinel for an empty trie.
    pub fn root_hash(&self) -> CryptoHash {
        self.root.hash()
    }

    /// Get the value stored under `key`.
    pub fn get<K: KVStore>(
        &self,
        db: &NodeStore<K>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, TrieError> {
        get_at(&self.root, db, &key_to_nibbles(key))
    }

    /// Insert `value` under `key`, replacing any existing value. An empty value deletes the key.
    pub fn insert<K: KVStore>(
        &mut self,
        db: &NodeStore<K>,
        key: &[u8],
        value: Vec<u8>,
    ) -> Result<(), TrieError> {
        if value.is_empty() {
            return self.delete(db, key);
        }
        let root = std::mem::take(&mut self.root);
        self.root = put_at(root, db, &key_to_nibbles(key), value)?;
        Ok(())
    }

    /// Remove `key`, restoring canonical form on the path back to the root.
    pub fn delete<K: KVStore>(&mut self, db: &NodeStore<K>, key: &[u8]) -> Result<(), TrieError> {
        let root = std::mem::take(&mut self.root);
        self.root = delete_at(root, db, &key_to_nibbles(key))?;
        Ok(())
    }

    /// Write every newly reachable node to `db` and return the new root hash. After a commit
    /// the in-memory tree is a single lazy reference to the stored root.
    pub fn commit<K: KVStore>(&mut self, db: &mut NodeStore<K>) -> Result<CryptoHash, TrieError> {
        let mut batch = Vec::new();
        let root = std::mem::take(&mut self.root);
        let (root, root_hash) = commit_node(root, &mut batch);
        self.root = root;
        db.put_batch(batch);
        Ok(root_hash)
    }

    /// Produce the inclusion proof for `key`: the encoded nodes along the path from the root to
    /// the leaf (or to the point where the key is absent).
    pub fn prove<K: KVStore>(
        &self,
        db: &NodeStore<K>,
        key: &[u8],
    ) -> Result<Vec<Vec<u8>>, TrieError> {
        let mut proof = Vec::new();
        prove_at(&self.root, db, &key_to_nibbles(key), &mut proof)?;
        Ok(proof)
    }
}

impl Default for Mpt {
    fn default() -> Mpt {
        Mpt::new()
    }
}

/// Verify that `proof` shows `value` stored under `key` in the trie with root `root_hash`.
///
/// The proof is replayed from the root: every encoded node must hash to the reference that led
/// to it, the path nibbles must follow `key`, and the walk must end at `value`.
pub fn verify_proof(root_hash: &CryptoHash, key: &[u8], value: &[u8], proof: &[Vec<u8>]) -> bool {
    let nibbles = key_to_nibbles(key);
    let mut offset = 0;
    let mut expected = *root_hash;

    for (i, encoded) in proof.iter().enumerate() {
        let mut hasher = Keccak256::new();
        hasher.update(encoded);
        if CryptoHash::new(hasher.finalize().into()) != expected {
            return false;
        }

        let node = match Node::decode(encoded) {
            Some(node) => node,
            None => return false,
        };
        let last = i == proof.len() - 1;
        let remaining = &nibbles[offset..];

        match node {
            Node::Leaf { path, value: v } => {
                return last && path == remaining && v == value;
            }
            Node::Extension { path, child } => {
                if last || !remaining.starts_with(&path) {
                    return false;
                }
                offset += path.len();
                expected = child.hash();
            }
            Node::Branch {
                children,
                value: branch_value,
            } => {
                if remaining.is_empty() {
                    return last && branch_value.as_deref() == Some(value);
                }
                if last {
                    return false;
                }
                expected = children[remaining[0] as usize].hash();
                offset += 1;
            }
            Node::Empty | Node::Hash(_) => return false,
        }
        if expected.is_zero() {
            return false;
        }
    }

    false
}

fn resolve<K: KVStore>(node: Node, db: &NodeStore<K>) -> Result<Node, TrieError> {
    match node {
        Node::Hash(hash) => db.get(&hash),
        other => Ok(other),
    }
}

fn get_at<K: KVStore>(
    node: &Node,
    db: &NodeStore<K>,
    key: &[u8],
) -> Result<Option<Vec<u8>>, TrieError> {
    match node {
        Node::Empty => Ok(None),
        Node::Hash(hash) => get_at(&db.get(hash)?, db, key),
        Node::Leaf { path, value } => Ok((path.as_slice() == key).then(|| value.clone())),
        Node::Extension { path, child } => {
            if key.len() < path.len() || &key[..path.len()] != path.as_slice() {
                return Ok(None);
            }
            get_at(child, db, &key[path.len()..])
        }
        Node::Branch { children, value } => {
            if key.is_empty() {
                return Ok(value.clone());
            }
            get_at(&children[key[0] as usize], db, &key[1..])
        }
    }
}

fn put_at<K: KVStore>(
    node: Node,
    db: &NodeStore<K>,
    key: &[u8],
    value: Vec<u8>,
) -> Result<Node, TrieError> {
    match node {
        Node::Empty => Ok(Node::Leaf {
            path: key.to_vec(),
            value,
        }),
        Node::Hash(hash) => put_at(db.get(&hash)?, db, key, value),
        Node::Leaf {
            path,
            value: old_value,
        } => {
            if path.as_slice() == key {
                return Ok(Node::Leaf {
                    path,
                    value,
                });
            }

            let common = common_prefix(&path, key);
            let mut children: [Node; 16] = Default::default();
            let mut branch_value = None;

            place(&mut children, &mut branch_value, &path[common..], old_value);
            place(&mut children, &mut branch_value, &key[common..], value);

            let branch = Node::Branch {
                children: Box::new(children),
                value: branch_value,
            };
            if common > 0 {
                Ok(Node::Extension {
                    path: key[..common].to_vec(),
                    child: Box::new(branch),
                })
            } else {
                Ok(branch)
            }
        }
        Node::Extension { path, child } => {
            let common = common_prefix(&path, key);

            // The key descends through the extension.
            if common == path.len() {
                let child = put_at(*child, db, &key[common..], value)?;
                return Ok(Node::Extension {
                    path,
                    child: Box::new(child),
                });
            }

            // The key diverges inside the extension's path: split it around a branch.
            let mut children: [Node; 16] = Default::default();
            let mut branch_value = None;

            let ext_nibble = path[common] as usize;
            let ext_rest = &path[common + 1..];
            children[ext_nibble] = if ext_rest.is_empty() {
                *child
            } else {
                Node::Extension {
                    path: ext_rest.to_vec(),
                    child,
                }
            };

            place(&mut children, &mut branch_value, &key[common..], value);

            let branch = Node::Branch {
                children: Box::new(children),
                value: branch_value,
            };
            if common > 0 {
                Ok(Node::Extension {
                    path: path[..common].to_vec(),
                    child: Box::new(branch),
                })
            } else {
                Ok(branch)
            }
        }
        Node::Branch {
            mut children,
            value: branch_value,
        } => {
            if key.is_empty() {
                return Ok(Node::Branch {
                    children,
                    value: Some(value),
                });
            }
            let index = key[0] as usize;
            let child = std::mem::take(&mut children[index]);
            children[index] = put_at(child, db, &key[1..], value)?;
            Ok(Node::Branch {
                children,
                value: branch_value,
            })
        }
    }
}

/// Place `value` under the remaining nibbles `rest` inside a branch under construction.
fn place(children: &mut [Node; 16], branch_value: &mut Option<Vec<u8>>, rest: &[u8], value: Vec<u8>) {
    if rest.is_empty() {
        *branch_value = Some(value);
    } else {
        children[rest[0] as usize] = Node::Leaf {
            path: rest[1..].to_vec(),
            value,
        };
    }
}

fn delete_at<K: KVStore>(node: Node, db: &NodeStore<K>, key: &[u8]) -> Result<Node, TrieError> {
    match node {
        Node::Empty => Ok(Node::Empty),
        Node::Hash(hash) => delete_at(db.get(&hash)?, db, key),
        Node::Leaf { path, value } => {
            if path.as_slice() == key {
                Ok(Node::Empty)
            } else {
                Ok(Node::Leaf { path, value })
            }
        }
        Node::Extension { path, child } => {
            if key.len() < path.len() || &key[..path.len()] != path.as_slice() {
                // Key not present.
                return Ok(Node::Extension { path, child });
            }

            let new_child = delete_at(*child, db, &key[path.len()..])?;
            Ok(merge_extension(path, new_child))
        }
        Node::Branch {
            mut children,
            value,
        } => {
            if key.is_empty() {
                return collapse_branch(children, None, db);
            }
            let index = key[0] as usize;
            let child = std::mem::take(&mut children[index]);
            children[index] = delete_at(child, db, &key[1..])?;
            collapse_branch(children, value, db)
        }
    }
}

/// Rebuild an extension over `child`, compacting paths so the result is canonical.
fn merge_extension(path: Vec<u8>, child: Node) -> Node {
    match child {
        Node::Empty => Node::Empty,
        Node::Leaf {
            path: child_path,
            value,
        } => {
            let mut path = path;
            path.extend_from_slice(&child_path);
            Node::Leaf { path, value }
        }
        Node::Extension {
            path: child_path,
            child,
        } => {
            let mut path = path;
            path.extend_from_slice(&child_path);
            Node::Extension { path, child }
        }
        other => Node::Extension {
            path,
            child: Box::new(other),
        },
    }
}

/// Restore canonical form for a branch after a deletion: a branch left with no children becomes
/// a leaf (or nothing), and a valueless branch left with a single child merges down into it.
fn collapse_branch<K: KVStore>(
    mut children: Box<[Node; 16]>,
    value: Option<Vec<u8>>,
    db: &NodeStore<K>,
) -> Result<Node, TrieError> {
    let occupied: Vec<usize> = children
        .iter()
        .enumerate()
        .filter(|(_, child)| !child.is_empty())
        .map(|(i, _)| i)
        .collect();

    match (occupied.len(), value) {
        (0, None) => Ok(Node::Empty),
        (0, Some(value)) => Ok(Node::Leaf {
            path: Vec::new(),
            value,
        }),
        (1, None) => {
            let index = occupied[0];
            let child = std::mem::take(&mut children[index]);
            // The child's kind decides how it merges up, so a lazy reference must be resolved.
            let child = resolve(child, db)?;
            Ok(merge_extension(vec![index as u8], child))
        }
        (_, value) => Ok(Node::Branch { children, value }),
    }
}

fn commit_node(node: Node, batch: &mut Vec<(CryptoHash, Node, Vec<u8>)>) -> (Node, CryptoHash) {
    match node {
        Node::Empty => (Node::Empty, CryptoHash::zero()),
        Node::Hash(hash) => (Node::Hash(hash), hash),
        Node::Leaf { path, value } => {
            let node = Node::Leaf { path, value };
            flush(node, batch)
        }
        Node::Extension { path, child } => {
            let (child, _) = commit_node(*child, batch);
            let node = Node::Extension {
                path,
                child: Box::new(child),
            };
            flush(node, batch)
        }
        Node::Branch {
            mut children,
            value,
        } => {
            for child in children.iter_mut() {
                let (committed, _) = commit_node(std::mem::take(child), batch);
                *child = committed;
            }
            let node = Node::Branch { children, value };
            flush(node, batch)
        }
    }
}

fn flush(node: Node, batch: &mut Vec<(CryptoHash, Node, Vec<u8>)>) -> (Node, CryptoHash) {
    let encoding = node.encode();
    let mut hasher = Keccak256::new();
    hasher.update(&encoding);
    let hash = CryptoHash::new(hasher.finalize().into());
    batch.push((hash, node, encoding));
    (Node::Hash(hash), hash)
}

fn prove_at<K: KVStore>(
    node: &Node,
    db: &NodeStore<K>,
    key: &[u8],
    proof: &mut Vec<Vec<u8>>,
) -> Result<(), TrieError> {
    match node {
        Node::Empty => Ok(()),
        Node::Hash(hash) => prove_at(&db.get(hash)?, db, key, proof),
        Node::Leaf { .. } => {
            proof.push(node.encode());
            Ok(())
        }
        Node::Extension { path, child } => {
            proof.push(node.encode());
            if key.len() < path.len() || &key[..path.len()] != path.as_slice() {
                return Ok(());
            }
            prove_at(child, db, &key[path.len()..], proof)
        }
        Node::Branch { children, .. } => {
            proof.push(node.encode());
            if key.is_empty() {
                return Ok(());
            }
            prove_at(&children[key[0] as usize], db, &key[1..], proof)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_store::MemKVStore;

    fn setup() -> (Mpt, NodeStore<MemKVStore>) {
        (Mpt::new(), NodeStore::new(MemKVStore::new()))
    }

    #[test]
    fn get_inserted_values() {
        let (mut trie, db) = setup();
        trie.insert(&db, b"dog", b"cat".to_vec()).unwrap();
        trie.insert(&db, b"doge", b"puppy".to_vec()).unwrap();
        trie.insert(&db, b"horse", b"stallion".to_vec()).unwrap();

        assert_eq!(trie.get(&db, b"dog").unwrap(), Some(b"cat".to_vec()));
        assert_eq!(trie.get(&db, b"doge").unwrap(), Some(b"puppy".to_vec()));
        assert_eq!(trie.get(&db, b"horse").unwrap(), Some(b"stallion".to_vec()));
        assert_eq!(trie.get(&db, b"cat").unwrap(), None);
    }

    #[test]
    fn root_is_insertion_order_independent() {
        let (mut a, db_a) = setup();
        a.insert(&db_a, b"dog", b"cat".to_vec()).unwrap();
        a.insert(&db_a, b"doge", b"puppy".to_vec()).unwrap();
        a.insert(&db_a, b"horse", b"stallion".to_vec()).unwrap();

        let (mut b, db_b) = setup();
        b.insert(&db_b, b"horse", b"stallion".to_vec()).unwrap();
        b.insert(&db_b, b"doge", b"puppy".to_vec()).unwrap();
        b.insert(&db_b, b"dog", b"cat".to_vec()).unwrap();

        assert_eq!(a.root_hash(), b.root_hash());
    }

    #[test]
    fn delete_restores_previous_root() {
        let (mut trie, db) = setup();
        trie.insert(&db, b"dog", b"cat".to_vec()).unwrap();
        trie.insert(&db, b"horse", b"stallion".to_vec()).unwrap();
        let before = trie.root_hash();

        trie.insert(&db, b"doge", b"puppy".to_vec()).unwrap();
        let with_doge = trie.root_hash();
        assert_ne!(before, with_doge);

        trie.delete(&db, b"doge").unwrap();
        assert_eq!(trie.root_hash(), before);

        trie.insert(&db, b"doge", b"puppy".to_vec()).unwrap();
        assert_eq!(trie.root_hash(), with_doge);
    }

    #[test]
    fn delete_to_empty_restores_zero_root() {
        let (mut trie, db) = setup();
        trie.insert(&db, b"dog", b"cat".to_vec()).unwrap();
        trie.insert(&db, b"doge", b"puppy".to_vec()).unwrap();
        trie.delete(&db, b"dog").unwrap();
        trie.delete(&db, b"doge").unwrap();
        assert!(trie.root_hash().is_zero());
        assert_eq!(trie.get(&db, b"dog").unwrap(), None);
    }

    #[test]
    fn empty_value_means_delete() {
        let (mut trie, db) = setup();
        trie.insert(&db, b"dog", b"cat".to_vec()).unwrap();
        let before = trie.root_hash();
        trie.insert(&db, b"doge", b"puppy".to_vec()).unwrap();
        trie.insert(&db, b"doge", Vec::new()).unwrap();
        assert_eq!(trie.root_hash(), before);
    }

    #[test]
    fn values_survive_commit_and_reopen() {
        let kv = MemKVStore::new();
        let mut db = NodeStore::new(kv.clone());
        let mut trie = Mpt::new();
        trie.insert(&db, b"dog", b"cat".to_vec()).unwrap();
        trie.insert(&db, b"doge", b"puppy".to_vec()).unwrap();
        let root = trie.commit(&mut db).unwrap();

        // Reopen through a fresh node store over the same KV: no cache warmth.
        let db = NodeStore::new(kv);
        let reopened = Mpt::from_root(root);
        assert_eq!(reopened.get(&db, b"dog").unwrap(), Some(b"cat".to_vec()));
        assert_eq!(reopened.get(&db, b"doge").unwrap(), Some(b"puppy".to_vec()));
        assert_eq!(reopened.root_hash(), root);
    }

    #[test]
    fn mutate_after_commit() {
        let kv = MemKVStore::new();
        let mut db = NodeStore::new(kv);
        let mut trie = Mpt::new();
        trie.insert(&db, b"dog", b"cat".to_vec()).unwrap();
        trie.insert(&db, b"horse", b"stallion".to_vec()).unwrap();
        trie.commit(&mut db).unwrap();

        trie.insert(&db, b"doge", b"puppy".to_vec()).unwrap();
        trie.delete(&db, b"horse").unwrap();
        assert_eq!(trie.get(&db, b"doge").unwrap(), Some(b"puppy".to_vec()));
        assert_eq!(trie.get(&db, b"horse").unwrap(), None);

        // The same contents built from scratch have the same root.
        let db_fresh = NodeStore::new(MemKVStore::new());
        let mut fresh = Mpt::new();
        fresh.insert(&db_fresh, b"dog", b"cat".to_vec()).unwrap();
        fresh.insert(&db_fresh, b"doge", b"puppy".to_vec()).unwrap();
        assert_eq!(trie.root_hash(), fresh.root_hash());
    }

    #[test]
    fn proofs_verify_against_root() {
        let (mut trie, db) = setup();
        trie.insert(&db, b"dog", b"cat".to_vec()).unwrap();
        trie.insert(&db, b"doge", b"puppy".to_vec()).unwrap();
        trie.insert(&db, b"horse", b"stallion".to_vec()).unwrap();
        let root = trie.root_hash();

        let proof = trie.prove(&db, b"doge").unwrap();
        assert!(verify_proof(&root, b"doge", b"puppy", &proof));
        // Wrong value, wrong key, wrong root: all rejected.
        assert!(!verify_proof(&root, b"doge", b"kitten", &proof));
        assert!(!verify_proof(&root, b"dog", b"puppy", &proof));
        assert!(!verify_proof(&CryptoHash::new([1; 32]), b"doge", b"puppy", &proof));
    }

    #[test]
    fn single_key_proof() {
        let (mut trie, db) = setup();
        trie.insert(&db, b"k", b"v".to_vec()).unwrap();
        let proof = trie.prove(&db, b"k").unwrap();
        assert!(verify_proof(&trie.root_hash(), b"k", b"v", &proof));
    }
}
