/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Persistence for trie nodes: a hash-keyed keyspace in the shared [`KVStore`] fronted by an LRU
//! cache.
//!
//! Stored values are `<version byte> || encoded node`. Nodes are immutable under their hash, so
//! the cache never needs invalidation, only eviction under pressure.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::kv_store::{KVStore, WriteBatch};
use crate::trie::node::{Node, TrieError, NODE_CODEC_VERSION};
use crate::types::basic::CryptoHash;

/// How many decoded nodes the cache holds before evicting least-recently-used entries.
const NODE_CACHE_CAPACITY: usize = 10_000;

/// Hash-keyed node persistence shared by the world trie and every storage trie.
#[derive(Clone)]
pub struct NodeStore<K: KVStore> {
    kv: K,
    cache: Arc<Mutex<LruCache<CryptoHash, Node>>>,
}

impl<K: KVStore> NodeStore<K> {
    /// Create a node store over `kv_store` with the default cache capacity.
    pub fn new(kv_store: K) -> NodeStore<K> {
        NodeStore {
            kv: kv_store,
            cache: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(NODE_CACHE_CAPACITY).expect("capacity is nonzero"),
            ))),
        }
    }

    /// Resolve `hash` to its node, consulting the cache first.
    pub fn get(&self, hash: &CryptoHash) -> Result<Node, TrieError> {
        if hash.is_zero() {
            return Ok(Node::Empty);
        }

        if let Some(node) = self.cache.lock().unwrap().get(hash) {
            return Ok(node.clone());
        }

        let stored = self
            .kv
            .get(&hash.bytes())
            .ok_or(TrieError::MissingNode(*hash))?;
        let node = match stored.split_first() {
            Some((&NODE_CODEC_VERSION, encoding)) => {
                Node::decode(encoding).ok_or(TrieError::CorruptNode(*hash))?
            }
            _ => return Err(TrieError::CorruptNode(*hash)),
        };

        self.cache.lock().unwrap().put(*hash, node.clone());
        Ok(node)
    }

    /// Atomically write a batch of `(hash, encoding)` pairs produced by a trie commit, and warm
    /// the cache with them.
    pub(crate) fn put_batch(&mut self, nodes: Vec<(CryptoHash, Node, Vec<u8>)>) {
        if nodes.is_empty() {
            return;
        }
        let mut wb = K::WriteBatch::new();
        for (hash, _, encoding) in &nodes {
            let mut value = Vec::with_capacity(1 + encoding.len());
            value.push(NODE_CODEC_VERSION);
            value.extend_from_slice(encoding);
            wb.set(&hash.bytes(), &value);
        }
        self.kv.write(wb);

        let mut cache = self.cache.lock().unwrap();
        for (hash, node, _) in nodes {
            cache.put(hash, node);
        }
    }
}
