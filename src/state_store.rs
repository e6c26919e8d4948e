/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Crash-durable storage for the small set of protocol invariants a replica must never lose:
//! `current_view`, `last_vote`, `locked_hash`, `committed_hash`, `high_qc`, and `high_tc`.
//!
//! ## Durability ordering
//!
//! The correctness of the protocol across crashes depends on write-before-send ordering:
//! - [`set_last_vote`](StateStore::set_last_vote) must complete before the corresponding vote is
//!   sent;
//! - [`set_locked_hash`](StateStore::set_locked_hash) must complete before any proposal or vote
//!   whose validity depends on the new lock;
//! - [`set_committed_hash`](StateStore::set_committed_hash) is the point at which a decision
//!   becomes externalized.
//!
//! [`KVStore::write`] provides the fsync-equivalent guarantee; this module provides the keys,
//! defaults, and the multi-key atomic update.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::kv_store::{KVStore, WriteBatch};
use crate::types::basic::{CryptoHash, ViewNumber};
use crate::types::block::Block;
use crate::types::certificates::{QuorumCertificate, TimeoutCertificate};

mod keys {
    pub(super) const CURRENT_VIEW: &[u8] = b"state:current_view";
    pub(super) const LAST_VOTE: &[u8] = b"state:last_vote";
    pub(super) const COMMITTED_HASH: &[u8] = b"state:committed_hash";
    pub(super) const LOCK_HASH: &[u8] = b"state:lock_hash";
    pub(super) const HIGH_QC: &[u8] = b"state:high_qc";
    pub(super) const HIGH_TC: &[u8] = b"state:high_tc";
}

/// Enumerates the ways reading the state store can fail. Writes do not fail: a replica that
/// cannot persist protocol state panics inside [`KVStore::write`].
#[derive(Debug, PartialEq, Eq)]
pub enum StateStoreError {
    /// A stored value failed to deserialize. This indicates on-disk corruption or a software
    /// version mismatch; the replica must not participate until the operator intervenes.
    Corrupt { key: &'static str },
}

impl std::fmt::Display for StateStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateStoreError::Corrupt { key } => {
                write!(f, "corrupt value under state store key {}", key)
            }
        }
    }
}

/// Typed accessors over the fixed protocol-invariant keys.
///
/// Absent keys read as their protocol defaults (`current_view = 1`, `last_vote = 0`, the genesis
/// block hash, the genesis QC, the empty TC). [`initialize`](StateStore::initialize) materializes
/// the defaults once on first open so that later reads witness explicitly written values.
#[derive(Clone)]
pub struct StateStore<K: KVStore>(K);

impl<K: KVStore> StateStore<K> {
    /// Wrap `kv_store` and materialize defaults for any absent keys.
    pub fn open(kv_store: K) -> StateStore<K> {
        let mut store = StateStore(kv_store);
        store.initialize();
        store
    }

    fn initialize(&mut self) {
        let mut wb = K::WriteBatch::new();
        let mut dirty = false;

        if self.0.get(keys::CURRENT_VIEW).is_none() {
            wb.set(keys::CURRENT_VIEW, &1u64.to_le_bytes());
            dirty = true;
        }
        if self.0.get(keys::LAST_VOTE).is_none() {
            wb.set(keys::LAST_VOTE, &0u64.to_le_bytes());
            dirty = true;
        }
        let genesis_hash = Block::genesis().hash;
        if self.0.get(keys::COMMITTED_HASH).is_none() {
            wb.set(keys::COMMITTED_HASH, &genesis_hash.bytes());
            dirty = true;
        }
        if self.0.get(keys::LOCK_HASH).is_none() {
            wb.set(keys::LOCK_HASH, &genesis_hash.bytes());
            dirty = true;
        }
        if self.0.get(keys::HIGH_QC).is_none() {
            wb.set(
                keys::HIGH_QC,
                &QuorumCertificate::genesis_high_qc()
                    .try_to_vec()
                    .expect("in-memory borsh serialization cannot fail"),
            );
            dirty = true;
        }
        if self.0.get(keys::HIGH_TC).is_none() {
            wb.set(
                keys::HIGH_TC,
                &TimeoutCertificate::empty()
                    .try_to_vec()
                    .expect("in-memory borsh serialization cannot fail"),
            );
            dirty = true;
        }

        if dirty {
            self.0.write(wb);
        }
    }

    /* ↓↓↓ Views ↓↓↓ */

    pub fn current_view(&self) -> Result<ViewNumber, StateStoreError> {
        self.get_view(keys::CURRENT_VIEW, "state:current_view")
    }

    pub fn set_current_view(&mut self, view: ViewNumber) {
        self.set_raw(keys::CURRENT_VIEW, &view.to_le_bytes());
    }

    pub fn last_vote(&self) -> Result<ViewNumber, StateStoreError> {
        self.get_view(keys::LAST_VOTE, "state:last_vote")
    }

    pub fn set_last_vote(&mut self, view: ViewNumber) {
        self.set_raw(keys::LAST_VOTE, &view.to_le_bytes());
    }

    /* ↓↓↓ Block hashes ↓↓↓ */

    pub fn committed_hash(&self) -> Result<CryptoHash, StateStoreError> {
        self.get_hash(keys::COMMITTED_HASH, "state:committed_hash")
    }

    pub fn set_committed_hash(&mut self, hash: &CryptoHash) {
        self.set_raw(keys::COMMITTED_HASH, &hash.bytes());
    }

    pub fn locked_hash(&self) -> Result<CryptoHash, StateStoreError> {
        self.get_hash(keys::LOCK_HASH, "state:lock_hash")
    }

    pub fn set_locked_hash(&mut self, hash: &CryptoHash) {
        self.set_raw(keys::LOCK_HASH, &hash.bytes());
    }

    /* ↓↓↓ Certificates ↓↓↓ */

    pub fn high_qc(&self) -> Result<QuorumCertificate, StateStoreError> {
        match self.0.get(keys::HIGH_QC) {
            None => Ok(QuorumCertificate::genesis_high_qc()),
            Some(bytes) => QuorumCertificate::deserialize(&mut bytes.as_slice())
                .map_err(|_| StateStoreError::Corrupt { key: "state:high_qc" }),
        }
    }

    pub fn set_high_qc(&mut self, qc: &QuorumCertificate) {
        self.set_raw(
            keys::HIGH_QC,
            &qc.try_to_vec()
                .expect("in-memory borsh serialization cannot fail"),
        );
    }

    pub fn high_tc(&self) -> Result<TimeoutCertificate, StateStoreError> {
        match self.0.get(keys::HIGH_TC) {
            None => Ok(TimeoutCertificate::empty()),
            Some(bytes) => TimeoutCertificate::deserialize(&mut bytes.as_slice())
                .map_err(|_| StateStoreError::Corrupt { key: "state:high_tc" }),
        }
    }

    pub fn set_high_tc(&mut self, tc: &TimeoutCertificate) {
        self.set_raw(
            keys::HIGH_TC,
            &tc.try_to_vec()
                .expect("in-memory borsh serialization cannot fail"),
        );
    }

    /* ↓↓↓ Multi-key atomic update ↓↓↓ */

    /// Commit several protocol-invariant keys in one atomic write, avoiding torn state between
    /// related updates.
    pub fn update(&mut self, updates: ConsensusStateUpdate) {
        let mut wb = K::WriteBatch::new();
        if let Some(view) = updates.current_view {
            wb.set(keys::CURRENT_VIEW, &view.to_le_bytes());
        }
        if let Some(view) = updates.last_vote {
            wb.set(keys::LAST_VOTE, &view.to_le_bytes());
        }
        if let Some(hash) = updates.committed_hash {
            wb.set(keys::COMMITTED_HASH, &hash.bytes());
        }
        if let Some(hash) = updates.locked_hash {
            wb.set(keys::LOCK_HASH, &hash.bytes());
        }
        if let Some(qc) = updates.high_qc {
            wb.set(
                keys::HIGH_QC,
                &qc.try_to_vec()
                    .expect("in-memory borsh serialization cannot fail"),
            );
        }
        if let Some(tc) = updates.high_tc {
            wb.set(
                keys::HIGH_TC,
                &tc.try_to_vec()
                    .expect("in-memory borsh serialization cannot fail"),
            );
        }
        self.0.write(wb);
    }

    /* ↓↓↓ Raw helpers ↓↓↓ */

    fn set_raw(&mut self, key: &[u8], value: &[u8]) {
        let mut wb = K::WriteBatch::new();
        wb.set(key, value);
        self.0.write(wb);
    }

    fn get_view(
        &self,
        key: &[u8],
        key_name: &'static str,
    ) -> Result<ViewNumber, StateStoreError> {
        match self.0.get(key) {
            None => Ok(if key == keys::CURRENT_VIEW {
                ViewNumber::new(1)
            } else {
                ViewNumber::init()
            }),
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| StateStoreError::Corrupt { key: key_name })?;
                Ok(ViewNumber::new(u64::from_le_bytes(bytes)))
            }
        }
    }

    fn get_hash(
        &self,
        key: &[u8],
        key_name: &'static str,
    ) -> Result<CryptoHash, StateStoreError> {
        match self.0.get(key) {
            None => Ok(Block::genesis().hash),
            Some(bytes) => {
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| StateStoreError::Corrupt { key: key_name })?;
                Ok(CryptoHash::new(bytes))
            }
        }
    }
}

/// A batch of protocol-invariant updates committed atomically by [`StateStore::update`].
#[derive(Default)]
pub struct ConsensusStateUpdate {
    pub current_view: Option<ViewNumber>,
    pub last_vote: Option<ViewNumber>,
    pub committed_hash: Option<CryptoHash>,
    pub locked_hash: Option<CryptoHash>,
    pub high_qc: Option<QuorumCertificate>,
    pub high_tc: Option<TimeoutCertificate>,
}
