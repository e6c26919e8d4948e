/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The Ethereum-style world state: accounts in a Merkle-Patricia world trie, one storage trie
//! per contract, content-addressed code blobs, and a journaled rollback log supporting nested
//! snapshots.
//!
//! ## Journaling
//!
//! Every mutation appends the inverse of what it changed: the previous account record (or its
//! absence), the previous storage slot value, or the fact that a code blob was freshly inserted.
//! [`snapshot`](StateDb::snapshot) records the journal length; [`revert_to_snapshot`]
//! (StateDb::revert_to_snapshot) replays inverse entries from the end down to that length.
//! Reverting is exact: the reverted state serializes byte-for-byte equal to the state before the
//! mutations, so state roots are always consistent.

use std::collections::HashMap;

use ethereum_types::{H160, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::kv_store::KVStore;
use crate::trie::database::NodeStore;
use crate::trie::node::TrieError;
use crate::trie::Mpt;
use crate::types::basic::CryptoHash;

/// A 20-byte account address.
pub type Address = H160;

const CODE_KEY_PREFIX: &[u8] = b"code:";

/// An account record as stored in the world trie.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: CryptoHash,
    pub code_hash: CryptoHash,
}

impl Account {
    /// A fresh account: zero balance, zero nonce, no code, empty storage.
    pub fn empty() -> Account {
        Account {
            nonce: 0,
            balance: U256::zero(),
            storage_root: CryptoHash::zero(),
            code_hash: CryptoHash::zero(),
        }
    }

    /// Whether the account is indistinguishable from a nonexistent one.
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code_hash.is_zero()
    }
}

/// An inverse entry in the rollback journal.
enum JournalEntry {
    /// The account record before a mutation; `None` if the account did not exist.
    Account {
        address: Address,
        prev: Option<Account>,
    },

    /// A storage slot's value before a write; the zero hash if the slot was unset.
    Storage {
        address: Address,
        key: CryptoHash,
        prev: CryptoHash,
    },

    /// A code blob that was inserted into the world trie by a `set_code`.
    Code { code_hash: CryptoHash },
}

/// The world-state database handed to the EVM.
pub struct StateDb<K: KVStore> {
    node_store: NodeStore<K>,
    world: Mpt,
    storage_tries: HashMap<Address, Mpt>,
    journal: Vec<JournalEntry>,
    snapshots: Vec<usize>,
}

impl<K: KVStore> StateDb<K> {
    /// Create an empty world state over `node_store`.
    pub fn new(node_store: NodeStore<K>) -> StateDb<K> {
        StateDb {
            node_store,
            world: Mpt::new(),
            storage_tries: HashMap::new(),
            journal: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    /// Open the world state at a previously committed `state_root`.
    pub fn from_root(node_store: NodeStore<K>, state_root: CryptoHash) -> StateDb<K> {
        StateDb {
            node_store,
            world: Mpt::from_root(state_root),
            storage_tries: HashMap::new(),
            journal: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    /// The current (possibly uncommitted) state root.
    pub fn state_root(&self) -> CryptoHash {
        self.world.root_hash()
    }

    /* ↓↓↓ Accounts ↓↓↓ */

    /// Get the account at `address`, or the empty account if none exists.
    pub fn get_account(&self, address: &Address) -> Result<Account, TrieError> {
        Ok(self
            .load_account(address)?
            .unwrap_or_else(Account::empty))
    }

    fn load_account(&self, address: &Address) -> Result<Option<Account>, TrieError> {
        match self.world.get(&self.node_store, address.as_bytes())? {
            None => Ok(None),
            Some(bytes) => match bincode::deserialize(&bytes) {
                Ok(account) => Ok(Some(account)),
                Err(err) => {
                    log::error!("StateDb, failed to decode account {:?}: {}", address, err);
                    Ok(None)
                }
            },
        }
    }

    /// Store `account` at `address`, journaling the previous record.
    pub fn set_account(&mut self, address: &Address, account: &Account) -> Result<(), TrieError> {
        let prev = self.load_account(address)?;
        self.journal.push(JournalEntry::Account {
            address: *address,
            prev,
        });
        self.write_account(address, account)
    }

    fn write_account(&mut self, address: &Address, account: &Account) -> Result<(), TrieError> {
        let bytes = bincode::serialize(account).expect("in-memory serialization cannot fail");
        self.world.insert(&self.node_store, address.as_bytes(), bytes)
    }

    /// Create (or reset to empty) the account at `address`.
    pub fn create_account(&mut self, address: &Address) -> Result<(), TrieError> {
        self.set_account(address, &Account::empty())
    }

    /// Whether an account record exists at `address`.
    pub fn exist(&self, address: &Address) -> Result<bool, TrieError> {
        Ok(self.load_account(address)?.is_some())
    }

    /// Whether the account at `address` is empty (no balance, no nonce, no code).
    pub fn empty(&self, address: &Address) -> Result<bool, TrieError> {
        Ok(self.get_account(address)?.is_empty())
    }

    /* ↓↓↓ Balances ↓↓↓ */

    pub fn get_balance(&self, address: &Address) -> Result<U256, TrieError> {
        Ok(self.get_account(address)?.balance)
    }

    pub fn set_balance(&mut self, address: &Address, balance: U256) -> Result<(), TrieError> {
        let mut account = self.get_account(address)?;
        account.balance = balance;
        self.set_account(address, &account)
    }

    pub fn add_balance(&mut self, address: &Address, amount: U256) -> Result<(), TrieError> {
        let mut account = self.get_account(address)?;
        account.balance = account.balance.saturating_add(amount);
        self.set_account(address, &account)
    }

    /// Subtract `amount` from the balance at `address`.
    ///
    /// Balances are non-negative. Callers check funds before subtracting; an underflow here is
    /// an invariant violation, so debug builds panic and release builds log and clamp to zero.
    pub fn sub_balance(&mut self, address: &Address, amount: U256) -> Result<(), TrieError> {
        let mut account = self.get_account(address)?;
        if amount > account.balance {
            debug_assert!(
                false,
                "invariant violation: balance underflow at {:?}",
                address
            );
            log::error!("StateDb, balance underflow at {:?}", address);
        }
        account.balance = account.balance.saturating_sub(amount);
        self.set_account(address, &account)
    }

    /* ↓↓↓ Nonces ↓↓↓ */

    pub fn get_nonce(&self, address: &Address) -> Result<u64, TrieError> {
        Ok(self.get_account(address)?.nonce)
    }

    pub fn set_nonce(&mut self, address: &Address, nonce: u64) -> Result<(), TrieError> {
        let mut account = self.get_account(address)?;
        account.nonce = nonce;
        self.set_account(address, &account)
    }

    /* ↓↓↓ Code ↓↓↓ */

    /// Get the code of the account at `address`; empty if it has none.
    pub fn get_code(&self, address: &Address) -> Result<Vec<u8>, TrieError> {
        let account = self.get_account(address)?;
        if account.code_hash.is_zero() {
            return Ok(Vec::new());
        }
        Ok(self
            .world
            .get(&self.node_store, &code_key(&account.code_hash))?
            .unwrap_or_default())
    }

    pub fn get_code_hash(&self, address: &Address) -> Result<CryptoHash, TrieError> {
        Ok(self.get_account(address)?.code_hash)
    }

    pub fn get_code_size(&self, address: &Address) -> Result<usize, TrieError> {
        Ok(self.get_code(address)?.len())
    }

    /// Store `code` for the account at `address`. The blob lives in the world trie under
    /// `code:<keccak(code)>`; the account records the hash.
    pub fn set_code(&mut self, address: &Address, code: &[u8]) -> Result<(), TrieError> {
        let mut account = self.get_account(address)?;
        let prev = self.load_account(address)?;
        self.journal.push(JournalEntry::Account {
            address: *address,
            prev,
        });

        if code.is_empty() {
            account.code_hash = CryptoHash::zero();
        } else {
            let code_hash = keccak(code);
            let key = code_key(&code_hash);
            if self.world.get(&self.node_store, &key)?.is_none() {
                self.journal.push(JournalEntry::Code { code_hash });
                self.world.insert(&self.node_store, &key, code.to_vec())?;
            }
            account.code_hash = code_hash;
        }

        self.write_account(address, &account)
    }

    /* ↓↓↓ Contract storage ↓↓↓ */

    /// Get the storage slot `key` of the account at `address`; the zero hash if unset.
    pub fn get_state(&mut self, address: &Address, key: &CryptoHash) -> Result<CryptoHash, TrieError> {
        let node_store = self.node_store.clone();
        let trie = match self.storage_trie(address, false)? {
            Some(trie) => trie,
            None => return Ok(CryptoHash::zero()),
        };
        match trie.get(&node_store, &key.bytes())? {
            None => Ok(CryptoHash::zero()),
            Some(bytes) => Ok(CryptoHash::new(
                bytes.try_into().map_err(|_| {
                    TrieError::CorruptNode(CryptoHash::zero())
                })?,
            )),
        }
    }

    /// Set the storage slot `key` of the account at `address`. The zero hash deletes the slot.
    /// The account's `storage_root` is kept in sync.
    pub fn set_state(
        &mut self,
        address: &Address,
        key: &CryptoHash,
        value: &CryptoHash,
    ) -> Result<(), TrieError> {
        let prev_account = self.load_account(address)?;
        let prev_value = self.get_state(address, key)?;
        self.journal.push(JournalEntry::Account {
            address: *address,
            prev: prev_account,
        });
        self.journal.push(JournalEntry::Storage {
            address: *address,
            key: *key,
            prev: prev_value,
        });

        self.apply_storage_write(address, key, value)?;

        let mut account = self.get_account(address)?;
        account.storage_root = self
            .storage_tries
            .get(address)
            .map(|trie| trie.root_hash())
            .unwrap_or_else(CryptoHash::zero);
        self.write_account(address, &account)
    }

    fn apply_storage_write(
        &mut self,
        address: &Address,
        key: &CryptoHash,
        value: &CryptoHash,
    ) -> Result<(), TrieError> {
        let node_store = self.node_store.clone();
        let trie = self
            .storage_trie(address, true)?
            .expect("storage trie is created on demand");
        if value.is_zero() {
            trie.delete(&node_store, &key.bytes())
        } else {
            trie.insert(&node_store, &key.bytes(), value.bytes().to_vec())
        }
    }

    /// Get (and cache) the storage trie of `address`. With `create`, an account without storage
    /// gets a fresh empty trie; without it, `None` is returned.
    fn storage_trie(&mut self, address: &Address, create: bool) -> Result<Option<&mut Mpt>, TrieError> {
        if !self.storage_tries.contains_key(address) {
            let account = self.get_account(address)?;
            if account.storage_root.is_zero() && !create {
                return Ok(None);
            }
            let trie = Mpt::from_root(account.storage_root);
            self.storage_tries.insert(*address, trie);
        }
        Ok(self.storage_tries.get_mut(address))
    }

    /* ↓↓↓ Snapshots ↓↓↓ */

    /// Record the current journal position and return a snapshot id.
    pub fn snapshot(&mut self) -> usize {
        self.snapshots.push(self.journal.len());
        self.snapshots.len() - 1
    }

    /// Replay inverse journal entries down to snapshot `id`, then discard it and every snapshot
    /// taken after it. Out-of-range ids are ignored.
    pub fn revert_to_snapshot(&mut self, id: usize) {
        let journal_position = match self.snapshots.get(id) {
            Some(position) => *position,
            None => return,
        };

        while self.journal.len() > journal_position {
            let entry = self.journal.pop().expect("length checked above");
            if let Err(err) = self.revert_entry(entry) {
                // Journal replay touches only nodes that were just written; a miss means the
                // node store lost data out from under us.
                panic!("invariant violation: journal revert failed: {}", err);
            }
        }

        self.snapshots.truncate(id);
    }

    fn revert_entry(&mut self, entry: JournalEntry) -> Result<(), TrieError> {
        match entry {
            JournalEntry::Account { address, prev } => match prev {
                Some(account) => self.write_account(&address, &account),
                None => self.world.delete(&self.node_store, address.as_bytes()),
            },
            JournalEntry::Storage { address, key, prev } => {
                self.apply_storage_write(&address, &key, &prev)
            }
            JournalEntry::Code { code_hash } => {
                self.world.delete(&self.node_store, &code_key(&code_hash))
            }
        }
    }

    /* ↓↓↓ Commit / copy ↓↓↓ */

    /// Flush every storage trie and the world trie to the node store, clear the journal and
    /// snapshot stack, and return the new state root.
    pub fn commit(&mut self) -> Result<CryptoHash, TrieError> {
        let mut node_store = self.node_store.clone();

        // Deterministic traversal: sorted by address.
        let mut addresses: Vec<Address> = self.storage_tries.keys().copied().collect();
        addresses.sort();

        for address in &addresses {
            let trie = self
                .storage_tries
                .get_mut(address)
                .expect("key taken from the map");
            let storage_root = trie.commit(&mut node_store)?;

            // Re-sync the account's storage root; set_state keeps it consistent already, so
            // this only matters for accounts whose trie was loaded but never written.
            if let Some(bytes) = self.world.get(&node_store, address.as_bytes())? {
                if let Ok(mut account) = bincode::deserialize::<Account>(&bytes) {
                    if account.storage_root != storage_root {
                        account.storage_root = storage_root;
                        let bytes = bincode::serialize(&account)
                            .expect("in-memory serialization cannot fail");
                        self.world.insert(&node_store, address.as_bytes(), bytes)?;
                    }
                }
            }
        }

        let state_root = self.world.commit(&mut node_store)?;
        self.journal.clear();
        self.snapshots.clear();
        Ok(state_root)
    }

    /// A deep copy sharing the node store. The copy starts with an empty journal.
    pub fn copy(&self) -> StateDb<K> {
        StateDb {
            node_store: self.node_store.clone(),
            world: self.world.clone(),
            storage_tries: self.storage_tries.clone(),
            journal: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    /* ↓↓↓ Proofs ↓↓↓ */

    /// Inclusion proof of the account record at `address` against the world trie.
    pub fn account_proof(&self, address: &Address) -> Result<Vec<Vec<u8>>, TrieError> {
        self.world.prove(&self.node_store, address.as_bytes())
    }

    /// Inclusion proof of a storage slot against the account's storage trie.
    pub fn storage_proof(
        &mut self,
        address: &Address,
        key: &CryptoHash,
    ) -> Result<Vec<Vec<u8>>, TrieError> {
        let node_store = self.node_store.clone();
        match self.storage_trie(address, false)? {
            Some(trie) => trie.prove(&node_store, &key.bytes()),
            None => Ok(Vec::new()),
        }
    }
}

/// Keccak-256 of `bytes`.
pub(crate) fn keccak(bytes: &[u8]) -> CryptoHash {
    let mut hasher = Keccak256::new();
    hasher.update(bytes);
    CryptoHash::new(hasher.finalize().into())
}

fn code_key(code_hash: &CryptoHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(CODE_KEY_PREFIX.len() + 32);
    key.extend_from_slice(CODE_KEY_PREFIX);
    key.extend_from_slice(&code_hash.bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_store::MemKVStore;

    fn setup() -> StateDb<MemKVStore> {
        StateDb::new(NodeStore::new(MemKVStore::new()))
    }

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    #[test]
    fn balances_and_nonces() {
        let mut db = setup();
        let a = addr(1);
        db.create_account(&a).unwrap();
        db.add_balance(&a, U256::from(100)).unwrap();
        db.sub_balance(&a, U256::from(40)).unwrap();
        db.set_nonce(&a, 3).unwrap();

        assert_eq!(db.get_balance(&a).unwrap(), U256::from(60));
        assert_eq!(db.get_nonce(&a).unwrap(), 3);
        assert!(db.exist(&a).unwrap());
        assert!(!db.exist(&addr(2)).unwrap());
    }

    #[test]
    fn revert_is_exact() {
        let mut db = setup();
        let a = addr(1);
        db.create_account(&a).unwrap();
        db.add_balance(&a, U256::from(100)).unwrap();
        let root_before = db.state_root();

        let snapshot = db.snapshot();
        db.sub_balance(&a, U256::from(30)).unwrap();
        db.set_nonce(&a, 1).unwrap();
        db.create_account(&addr(2)).unwrap();
        db.set_code(&addr(2), &[0x60, 0x01]).unwrap();
        db.set_state(&addr(2), &CryptoHash::new([1; 32]), &CryptoHash::new([2; 32]))
            .unwrap();
        assert_ne!(db.state_root(), root_before);

        db.revert_to_snapshot(snapshot);
        assert_eq!(db.state_root(), root_before);
        assert_eq!(db.get_balance(&a).unwrap(), U256::from(100));
        assert!(!db.exist(&addr(2)).unwrap());
    }

    #[test]
    fn nested_snapshots_revert_independently() {
        let mut db = setup();
        let a = addr(1);
        db.create_account(&a).unwrap();
        db.add_balance(&a, U256::from(10)).unwrap();

        let outer = db.snapshot();
        db.add_balance(&a, U256::from(5)).unwrap();
        let inner = db.snapshot();
        db.add_balance(&a, U256::from(7)).unwrap();

        db.revert_to_snapshot(inner);
        assert_eq!(db.get_balance(&a).unwrap(), U256::from(15));
        db.revert_to_snapshot(outer);
        assert_eq!(db.get_balance(&a).unwrap(), U256::from(10));
    }

    #[test]
    fn storage_round_trips_and_updates_storage_root() {
        let mut db = setup();
        let a = addr(3);
        let key = CryptoHash::new([9; 32]);
        let value = CryptoHash::new([7; 32]);

        db.create_account(&a).unwrap();
        db.set_state(&a, &key, &value).unwrap();
        assert_eq!(db.get_state(&a, &key).unwrap(), value);
        assert!(!db.get_account(&a).unwrap().storage_root.is_zero());

        // Zero value deletes the slot and restores the empty storage root.
        db.set_state(&a, &key, &CryptoHash::zero()).unwrap();
        assert_eq!(db.get_state(&a, &key).unwrap(), CryptoHash::zero());
        assert!(db.get_account(&a).unwrap().storage_root.is_zero());
    }

    #[test]
    fn code_round_trips() {
        let mut db = setup();
        let a = addr(4);
        let code = vec![0x60, 0x2a, 0x60, 0x00, 0x52];
        db.create_account(&a).unwrap();
        db.set_code(&a, &code).unwrap();

        assert_eq!(db.get_code(&a).unwrap(), code);
        assert_eq!(db.get_code_size(&a).unwrap(), code.len());
        assert_eq!(db.get_code_hash(&a).unwrap(), keccak(&code));
    }

    #[test]
    fn commit_persists_across_reopen() {
        let kv = MemKVStore::new();
        let root = {
            let mut db = StateDb::new(NodeStore::new(kv.clone()));
            let a = addr(5);
            db.create_account(&a).unwrap();
            db.add_balance(&a, U256::from(1234)).unwrap();
            db.set_state(&a, &CryptoHash::new([1; 32]), &CryptoHash::new([2; 32]))
                .unwrap();
            db.commit().unwrap()
        };

        let mut db = StateDb::from_root(NodeStore::new(kv), root);
        assert_eq!(db.get_balance(&addr(5)).unwrap(), U256::from(1234));
        assert_eq!(
            db.get_state(&addr(5), &CryptoHash::new([1; 32])).unwrap(),
            CryptoHash::new([2; 32])
        );
        assert_eq!(db.state_root(), root);
    }

    #[test]
    fn storage_root_matches_storage_trie_after_commit() {
        let mut db = setup();
        let a = addr(6);
        db.create_account(&a).unwrap();
        db.set_state(&a, &CryptoHash::new([1; 32]), &CryptoHash::new([2; 32]))
            .unwrap();
        db.set_state(&a, &CryptoHash::new([3; 32]), &CryptoHash::new([4; 32]))
            .unwrap();
        db.commit().unwrap();

        let account = db.get_account(&a).unwrap();
        let trie = db.storage_tries.get(&a).unwrap();
        assert_eq!(account.storage_root, trie.root_hash());
    }
}
