/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Content-addressed persistence for blocks, with a view-height index, a deduplicated ancestor
//! fetch, and prune/fork extraction.
//!
//! ## Keyspace
//!
//! - `block:<32-byte hash>` → borsh-encoded [`Block`]
//! - `height:<8-byte LE view>` → 32-byte block hash
//! - `meta:prune_height` → 8-byte LE view
//!
//! Competing blocks at the same view are both stored under their hashes; the height index is
//! overwritten and serves only as an advisory map for the prune walker.
//!
//! ## Locking
//!
//! All bookkeeping happens inside a short critical section. The fetch RPC in
//! [`get`](BlockStore::get) is issued with no lock held; a concurrent [`store`](BlockStore::store)
//! of the awaited block wakes the fetch waiters early.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::kv_store::{combine, KVGet, KVStore, WriteBatch};
use crate::logging::short_hash;
use crate::networking::Fetcher;
use crate::types::basic::{CryptoHash, ViewNumber};
use crate::types::block::Block;

/// How long [`get`](BlockStore::get) waits for a fetch before treating the block as unknown.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

mod keys {
    pub(super) const BLOCK: &[u8] = b"block:";
    pub(super) const HEIGHT: &[u8] = b"height:";
    pub(super) const PRUNE_HEIGHT: &[u8] = b"meta:prune_height";
}

/// A waiter slot registered while a fetch for a hash is in flight. Deduplicates concurrent
/// fetches for the same hash: followers wait on the condvar instead of issuing their own RPC.
struct FetchSlot {
    done: Mutex<bool>,
    arrived: Condvar,
}

impl FetchSlot {
    fn new() -> FetchSlot {
        FetchSlot {
            done: Mutex::new(false),
            arrived: Condvar::new(),
        }
    }

    fn complete(&self) {
        *self.done.lock().unwrap() = true;
        self.arrived.notify_all();
    }

    fn wait(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock().unwrap();
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let (guard, _) = self.arrived.wait_timeout(done, deadline - now).unwrap();
            done = guard;
        }
    }
}

/// Content-addressed block persistence shared by the consensus driver, the synchronizer, and the
/// fetch server. Clones refer to the same underlying store.
#[derive(Clone)]
pub struct BlockStore<K: KVStore> {
    kv: K,
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<StoreState>,
    shutdown: AtomicBool,
}

struct StoreState {
    prune_height: ViewNumber,
    pending_fetch: HashMap<CryptoHash, Arc<FetchSlot>>,
}

impl<K: KVStore> BlockStore<K> {
    /// Open the block store over `kv_store`, loading the persisted prune height and storing the
    /// genesis block if it is not already present.
    pub fn open(kv_store: K) -> BlockStore<K> {
        let prune_height = kv_store
            .get(keys::PRUNE_HEIGHT)
            .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
            .map(|bytes| ViewNumber::new(u64::from_le_bytes(bytes)))
            .unwrap_or(ViewNumber::init());

        let mut store = BlockStore {
            kv: kv_store,
            shared: Arc::new(Shared {
                state: Mutex::new(StoreState {
                    prune_height,
                    pending_fetch: HashMap::new(),
                }),
                shutdown: AtomicBool::new(false),
            }),
        };

        let genesis = Block::genesis();
        if store.local_get(&genesis.hash).is_none() {
            store.store(&genesis);
        }

        store
    }

    /// Atomically write `block` under its hash and index it under its view. Idempotent. Wakes any
    /// fetch waiters registered for the block's hash.
    pub fn store(&mut self, block: &Block) {
        let mut wb = K::WriteBatch::new();
        wb.set(
            &combine(keys::BLOCK, &block.hash.bytes()),
            &block
                .try_to_vec()
                .expect("in-memory borsh serialization cannot fail"),
        );
        wb.set(
            &combine(keys::HEIGHT, &block.view.to_le_bytes()),
            &block.hash.bytes(),
        );
        self.kv.write(wb);

        let mut state = self.shared.state.lock().unwrap();
        if let Some(slot) = state.pending_fetch.remove(&block.hash) {
            slot.complete();
        }
    }

    /// Get the block identified by `hash` from local storage only. No network.
    pub fn local_get(&self, hash: &CryptoHash) -> Option<Block> {
        let bytes = self.kv.get(&combine(keys::BLOCK, &hash.bytes()))?;
        match Block::deserialize(&mut bytes.as_slice()) {
            Ok(block) => Some(block),
            Err(err) => {
                log::error!("BlockStore, corrupt block {}: {}", short_hash(hash), err);
                None
            }
        }
    }

    /// Get the block identified by `hash`, fetching it from other replicas if it is not known
    /// locally. Blocks the calling task for up to [`FETCH_TIMEOUT`]; returns `None` on timeout.
    ///
    /// Concurrent calls for the same hash are deduplicated: only the first issues the RPC, the
    /// rest await its completion.
    pub fn get<F: Fetcher>(&mut self, hash: &CryptoHash, fetcher: &F) -> Option<Block> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return None;
        }

        let slot = {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(block) = self.local_get(hash) {
                return Some(block);
            }
            match state.pending_fetch.get(hash) {
                Some(slot) => {
                    // A fetch for this hash is already in flight; await it.
                    let slot = Arc::clone(slot);
                    drop(state);
                    slot.wait(FETCH_TIMEOUT);
                    return self.local_get(hash);
                }
                None => {
                    let slot = Arc::new(FetchSlot::new());
                    state.pending_fetch.insert(*hash, Arc::clone(&slot));
                    slot
                }
            }
        };

        log::debug!("BlockStore, fetching {}", short_hash(hash));
        let fetched = fetcher.fetch(*hash, FETCH_TIMEOUT);

        {
            let mut state = self.shared.state.lock().unwrap();
            state.pending_fetch.remove(hash);
        }
        slot.complete();

        match fetched {
            Some(block) if block.hash == *hash && block.is_correct_hash() => {
                log::debug!("BlockStore, fetched {}", short_hash(hash));
                self.store(&block);
                Some(block)
            }
            Some(_) => {
                log::info!("BlockStore, fetch returned wrong block for {}", short_hash(hash));
                self.local_get(hash)
            }
            // The block may have arrived through a store() while we were fetching.
            None => self.local_get(hash),
        }
    }

    /// Whether the block identified by `hash` is known locally.
    pub fn contains(&self, hash: &CryptoHash) -> bool {
        self.kv.get(&combine(keys::BLOCK, &hash.bytes())).is_some()
    }

    /// Get the hash indexed at `view`, if any.
    pub fn block_at_height(&self, view: ViewNumber) -> Option<Block> {
        let bytes = self.kv.get(&combine(keys::HEIGHT, &view.to_le_bytes()))?;
        let hash = CryptoHash::new(<[u8; 32]>::try_from(bytes).ok()?);
        self.local_get(&hash)
    }

    /// Whether `block` transitively extends `target`: walk parents from `block` while the view is
    /// greater than `target`'s, and check that the walk lands exactly on `target`.
    pub fn extends(&self, block: &Block, target: &Block) -> bool {
        let mut current = block.clone();
        while current.view > target.view {
            current = match self.local_get(&current.parent) {
                Some(parent) => parent,
                None => return false,
            };
        }
        current.hash == target.hash
    }

    /// The current prune watermark.
    pub fn prune_height(&self) -> ViewNumber {
        self.shared.state.lock().unwrap().prune_height
    }

    /// Advance the prune watermark to `height` and return the blocks on abandoned branches.
    ///
    /// The committed branch is computed by walking parents back from `committed_hash` while the
    /// view is above the old watermark; every height in `(old watermark, height]` whose indexed
    /// block is not on that branch is returned as forked, newest first. Forked blocks are handed
    /// to the [`ForkHandler`](crate::app::ForkHandler) exactly once because the watermark only
    /// moves forward.
    pub fn prune_to_height(
        &mut self,
        height: ViewNumber,
        committed_hash: &CryptoHash,
    ) -> Vec<Block> {
        let mut state = self.shared.state.lock().unwrap();
        let old_watermark = state.prune_height;

        // Mark the views on the committed branch.
        let mut on_branch: HashSet<ViewNumber> = HashSet::new();
        let mut cursor = self.local_get(committed_hash);
        while let Some(block) = cursor {
            if block.view <= old_watermark {
                break;
            }
            on_branch.insert(block.view);
            cursor = self.local_get(&block.parent);
        }

        let mut forked = Vec::new();
        let mut view = height;
        while view > old_watermark {
            if !on_branch.contains(&view) {
                if let Some(block) = self.block_at_height(view) {
                    log::debug!(
                        "BlockStore, forked block {} at view {}",
                        short_hash(&block.hash),
                        view
                    );
                    forked.push(block);
                }
            }
            view = view - 1;
        }

        state.prune_height = height;
        let mut wb = K::WriteBatch::new();
        wb.set(keys::PRUNE_HEIGHT, &height.to_le_bytes());
        self.kv.write(wb);

        forked
    }

    /// Cancel all pending fetches and make subsequent [`get`](BlockStore::get) calls return
    /// `None` immediately. Called once when the event loop shuts down.
    pub fn close(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let mut state = self.shared.state.lock().unwrap();
        for (_, slot) in state.pending_fetch.drain() {
            slot.complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_store::MemKVStore;
    use crate::types::basic::ReplicaID;
    use crate::types::block::Command;
    use crate::types::certificates::QuorumCertificate;

    /// A fetcher that knows nothing.
    struct NoFetcher;

    impl Fetcher for NoFetcher {
        fn fetch(&self, _: CryptoHash, _: Duration) -> Option<Block> {
            None
        }
    }

    fn child_of(parent: &Block, view: u64) -> Block {
        let justify = QuorumCertificate {
            chain_id: crate::types::basic::ChainID::new(0),
            view: parent.view,
            block: parent.hash,
            signatures: crate::types::basic::SignatureSet::new(4),
        };
        Block::new(
            parent.hash,
            justify,
            Command::new(vec![view as u8]),
            ViewNumber::new(view),
            ReplicaID::new(0),
            0,
        )
    }

    #[test]
    fn store_and_local_get_round_trip() {
        let mut store = BlockStore::open(MemKVStore::new());
        let genesis = Block::genesis();
        let block = child_of(&genesis, 1);
        store.store(&block);
        assert_eq!(store.local_get(&block.hash).unwrap(), block);
        assert_eq!(store.block_at_height(ViewNumber::new(1)).unwrap(), block);
    }

    #[test]
    fn extends_walks_parent_chain() {
        let mut store = BlockStore::open(MemKVStore::new());
        let genesis = Block::genesis();
        let b1 = child_of(&genesis, 1);
        let b2 = child_of(&b1, 2);
        let b3 = child_of(&b2, 3);
        store.store(&b1);
        store.store(&b2);
        store.store(&b3);

        assert!(store.extends(&b3, &b1));
        assert!(store.extends(&b3, &genesis));
        let other = child_of(&genesis, 2);
        assert!(!store.extends(&other, &b1));
    }

    #[test]
    fn prune_extracts_forked_blocks() {
        let mut store = BlockStore::open(MemKVStore::new());
        let genesis = Block::genesis();
        let b1 = child_of(&genesis, 1);
        // A competing block at view 2 that never gets extended.
        let forked = child_of(&b1, 2);
        let b3 = child_of(&b1, 3);
        let b4 = child_of(&b3, 4);
        for block in [&b1, &forked, &b3, &b4] {
            store.store(block);
        }

        let forked_blocks = store.prune_to_height(ViewNumber::new(4), &b4.hash);
        assert_eq!(forked_blocks, vec![forked]);
        assert_eq!(store.prune_height(), ViewNumber::new(4));

        // A second prune at the same height returns nothing: forked blocks are extracted once.
        let again = store.prune_to_height(ViewNumber::new(4), &b4.hash);
        assert!(again.is_empty());
    }

    #[test]
    fn get_returns_none_after_fetch_timeout() {
        // FETCH_TIMEOUT is too long for a unit test to wait out, so exercise the miss path
        // through a fetcher that returns immediately.
        let mut store = BlockStore::open(MemKVStore::new());
        let unknown = CryptoHash::new([1; 32]);
        assert!(store.get(&unknown, &NoFetcher).is_none());
    }

    #[test]
    fn store_wakes_pending_fetch_waiters() {
        let store = BlockStore::open(MemKVStore::new());
        let genesis = Block::genesis();
        let block = child_of(&genesis, 1);

        /// A fetcher that blocks until the block is stored by another thread, then reports
        /// failure, forcing `get` to re-check local storage.
        struct SlowFetcher {
            store: BlockStore<MemKVStore>,
            block: Block,
        }

        impl Fetcher for SlowFetcher {
            fn fetch(&self, _: CryptoHash, _: Duration) -> Option<Block> {
                let mut store = self.store.clone();
                store.store(&self.block);
                None
            }
        }

        let fetcher = SlowFetcher {
            store: store.clone(),
            block: block.clone(),
        };
        let mut store = store;
        assert_eq!(store.get(&block.hash, &fetcher).unwrap(), block);
    }
}
