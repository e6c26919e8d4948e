/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The pluggable persistence layer: the [`KVStore`], [`KVGet`], and [`WriteBatch`] traits, plus
//! two backends: a volatile in-memory store and an embedded RocksDB store. The backend is
//! chosen by the `K: KVStore` instance the operator hands to
//! [`Replica::start`](crate::replica::Replica::start).
//!
//! The [block store](crate::block_store), [state store](crate::state_store), and
//! [trie node store](crate::trie::database) all share one `KVStore` instance (cheap clones of the
//! same underlying database); each claims its own key prefix. Multi-key atomic updates go through
//! a single [`WriteBatch`].

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rocksdb::{WriteOptions, DB};

/// Get operations over a key-value store or a snapshot of one.
pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

/// A key-value store that can atomically apply a batch of writes and produce consistent
/// snapshots. Clones must refer to the same underlying database.
pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;
    type Snapshot<'a>: 'a + KVGet;

    /// Atomically and durably apply `wb`. Writes on the protocol-critical paths (last vote,
    /// locked hash, committed hash) rely on this completing before any dependent message leaves
    /// the replica.
    ///
    /// # Panics
    ///
    /// Implementations panic if the underlying database fails the write: a replica that cannot
    /// persist protocol state must not continue participating.
    fn write(&mut self, wb: Self::WriteBatch);

    /// Delete everything. Test and re-initialization helper.
    fn clear(&mut self);

    fn snapshot<'b>(&'b self) -> Self::Snapshot<'b>;
}

/// An ordered batch of set/delete operations applied atomically by [`KVStore::write`].
pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

/* ↓↓↓ In-memory backend ↓↓↓ */

/// A volatile, in-memory implementation of [`KVStore`].
#[derive(Clone)]
pub struct MemKVStore(Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>);

impl MemKVStore {
    /// Create a new, empty `MemKVStore`.
    pub fn new() -> MemKVStore {
        MemKVStore(Arc::new(Mutex::new(HashMap::new())))
    }
}

impl Default for MemKVStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KVStore for MemKVStore {
    type WriteBatch = MemWriteBatch;
    type Snapshot<'a> = MemKVStoreSnapshot<'a>;

    fn write(&mut self, wb: Self::WriteBatch) {
        let mut map = self.0.lock().unwrap();
        for (key, value) in wb.insertions {
            map.insert(key, value);
        }
        for key in wb.deletions {
            map.remove(&key);
        }
    }

    fn clear(&mut self) {
        self.0.lock().unwrap().clear();
    }

    fn snapshot<'b>(&'b self) -> MemKVStoreSnapshot<'b> {
        MemKVStoreSnapshot(self.0.lock().unwrap())
    }
}

impl KVGet for MemKVStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }
}

/// [`WriteBatch`] for [`MemKVStore`].
pub struct MemWriteBatch {
    insertions: HashMap<Vec<u8>, Vec<u8>>,
    deletions: HashSet<Vec<u8>>,
}

impl WriteBatch for MemWriteBatch {
    fn new() -> Self {
        MemWriteBatch {
            insertions: HashMap::new(),
            deletions: HashSet::new(),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        let _ = self.deletions.remove(key);
        self.insertions.insert(key.to_vec(), value.to_vec());
    }

    fn delete(&mut self, key: &[u8]) {
        let _ = self.insertions.remove(key);
        self.deletions.insert(key.to_vec());
    }
}

/// [`KVGet`] view used as `KVStore::Snapshot` for [`MemKVStore`].
pub struct MemKVStoreSnapshot<'a>(MutexGuard<'a, HashMap<Vec<u8>, Vec<u8>>>);

impl KVGet for MemKVStoreSnapshot<'_> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.get(key).cloned()
    }
}

/* ↓↓↓ RocksDB backend ↓↓↓ */

/// A persistent implementation of [`KVStore`] backed by an embedded RocksDB database.
#[derive(Clone)]
pub struct RocksKVStore {
    db: Arc<DB>,
}

impl RocksKVStore {
    /// Open (creating if necessary) the database in the directory at `path`. This should be
    /// called once in the process's lifetime per data directory.
    pub fn open(path: &Path) -> Result<RocksKVStore, rocksdb::Error> {
        let db = DB::open_default(path)?;
        Ok(RocksKVStore { db: Arc::new(db) })
    }
}

impl KVStore for RocksKVStore {
    type WriteBatch = RocksWriteBatch;
    type Snapshot<'a> = RocksKVStoreSnapshot<'a>;

    fn write(&mut self, wb: Self::WriteBatch) {
        // Synced so that the durability contract on the protocol-invariant keys holds across
        // crashes, not just process exits.
        let mut write_options = WriteOptions::default();
        write_options.set_sync(true);
        self.db
            .write_opt(wb.0, &write_options)
            .expect("Configuration or hardware fault: failed to write to RocksDB");
    }

    fn clear(&mut self) {
        let keys: Vec<Vec<u8>> = self
            .db
            .iterator(rocksdb::IteratorMode::Start)
            .filter_map(|entry| entry.ok().map(|(key, _)| key.to_vec()))
            .collect();
        for key in keys {
            self.db
                .delete(&key)
                .expect("Configuration or hardware fault: failed to delete from RocksDB");
        }
    }

    fn snapshot<'b>(&'b self) -> RocksKVStoreSnapshot<'b> {
        RocksKVStoreSnapshot(self.db.snapshot())
    }
}

impl KVGet for RocksKVStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.db
            .get(key)
            .expect("Configuration or hardware fault: failed to read from RocksDB")
    }
}

/// [`WriteBatch`] for [`RocksKVStore`].
pub struct RocksWriteBatch(rocksdb::WriteBatch);

impl WriteBatch for RocksWriteBatch {
    fn new() -> Self {
        RocksWriteBatch(rocksdb::WriteBatch::default())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.0.put(key, value)
    }

    fn delete(&mut self, key: &[u8]) {
        self.0.delete(key)
    }
}

/// A consistent read view of a [`RocksKVStore`].
pub struct RocksKVStoreSnapshot<'a>(rocksdb::Snapshot<'a>);

impl KVGet for RocksKVStoreSnapshot<'_> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0
            .get(key)
            .expect("Configuration or hardware fault: failed to read from RocksDB snapshot")
    }
}

/// Concatenate two byte slices into an owned key.
pub(crate) fn combine(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(a.len() + b.len());
    res.extend_from_slice(a);
    res.extend_from_slice(b);
    res
}
