/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Internal pool data structures: per-sender nonce-sorted lists, the global hash lookup, and
//! the price-indexed heap.

use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::time::Instant;

use ethereum_types::U256;

use crate::mempool::transaction::Transaction;
use crate::types::basic::CryptoHash;

/// A list of transactions belonging to one sender, sorted by nonce.
pub(crate) struct TxList {
    txs: BTreeMap<u64, Transaction>,
}

impl TxList {
    pub(crate) fn new() -> TxList {
        TxList {
            txs: BTreeMap::new(),
        }
    }

    /// Whether a transaction with the same nonce is already in the list.
    pub(crate) fn overlaps(&self, tx: &Transaction) -> bool {
        self.txs.contains_key(&tx.nonce)
    }

    /// Try to insert `tx`. A transaction replacing one with the same nonce must bump the gas
    /// price by at least `price_bump` percent; otherwise the insert is refused. Returns whether
    /// the transaction was inserted, and the transaction it replaced, if any.
    pub(crate) fn add(
        &mut self,
        tx: Transaction,
        price_bump: u64,
    ) -> (bool, Option<Transaction>) {
        if let Some(old) = self.txs.get(&tx.nonce) {
            let threshold = bump_threshold(&old.gas_price, price_bump);
            if tx.gas_price < threshold {
                return (false, None);
            }
        }
        let old = self.txs.insert(tx.nonce, tx);
        (true, old)
    }

    /// Remove every transaction with a nonce lower than `threshold`, returning them.
    pub(crate) fn forward(&mut self, threshold: u64) -> Vec<Transaction> {
        let keep = self.txs.split_off(&threshold);
        let removed = std::mem::replace(&mut self.txs, keep);
        removed.into_values().collect()
    }

    /// Remove the transaction with `nonce`, returning whether it was present.
    pub(crate) fn remove(&mut self, nonce: u64) -> bool {
        self.txs.remove(&nonce).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.txs.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// The transactions in nonce order.
    pub(crate) fn flatten(&self) -> Vec<Transaction> {
        self.txs.values().cloned().collect()
    }

    /// The highest nonce in the list, if any.
    pub(crate) fn last_nonce(&self) -> Option<u64> {
        self.txs.keys().next_back().copied()
    }
}

/// The global hash → transaction lookup, with the admission sequence number that fixes
/// insertion order for price ties.
pub(crate) struct TxLookup {
    all: HashMap<CryptoHash, LookupEntry>,
}

pub(crate) struct LookupEntry {
    pub(crate) tx: Transaction,
    pub(crate) seq: u64,
    pub(crate) queued_at: Option<Instant>,
}

impl TxLookup {
    pub(crate) fn new() -> TxLookup {
        TxLookup {
            all: HashMap::new(),
        }
    }

    pub(crate) fn add(&mut self, tx: Transaction, seq: u64, queued_at: Option<Instant>) {
        self.all.insert(tx.hash(), LookupEntry { tx, seq, queued_at });
    }

    pub(crate) fn remove(&mut self, hash: &CryptoHash) -> Option<LookupEntry> {
        self.all.remove(hash)
    }

    pub(crate) fn get(&self, hash: &CryptoHash) -> Option<&LookupEntry> {
        self.all.get(hash)
    }

    pub(crate) fn contains(&self, hash: &CryptoHash) -> bool {
        self.all.contains_key(hash)
    }

    pub(crate) fn count(&self) -> usize {
        self.all.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&CryptoHash, &LookupEntry)> {
        self.all.iter()
    }
}

/// An entry in the price heap. Orders by gas price descending, breaking ties by admission
/// sequence ascending, so selection is a stable price ordering.
#[derive(PartialEq, Eq)]
pub(crate) struct PricedEntry {
    pub(crate) gas_price: U256,
    pub(crate) seq: u64,
    pub(crate) hash: CryptoHash,
}

impl Ord for PricedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.gas_price
            .cmp(&other.gas_price)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PricedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The price-indexed heap over all admitted transactions. Entries go stale when their
/// transaction is removed or replaced; stale entries are skipped during draining and compacted
/// away once they outnumber a quarter of the heap.
pub(crate) struct PricedList {
    heap: BinaryHeap<PricedEntry>,
    stales: usize,
}

impl PricedList {
    pub(crate) fn new() -> PricedList {
        PricedList {
            heap: BinaryHeap::new(),
            stales: 0,
        }
    }

    pub(crate) fn put(&mut self, tx: &Transaction, seq: u64) {
        self.heap.push(PricedEntry {
            gas_price: tx.gas_price,
            seq,
            hash: tx.hash(),
        });
    }

    /// Note that `count` transactions left the pool; reheap if stale entries dominate.
    pub(crate) fn removed(&mut self, count: usize, lookup: &TxLookup) {
        self.stales += count;
        if self.stales > self.heap.len() / 4 {
            self.reheap(lookup);
        }
    }

    /// Rebuild the heap from the live contents of `lookup`.
    pub(crate) fn reheap(&mut self, lookup: &TxLookup) {
        self.stales = 0;
        self.heap = lookup
            .iter()
            .map(|(hash, entry)| PricedEntry {
                gas_price: entry.tx.gas_price,
                seq: entry.seq,
                hash: *hash,
            })
            .collect();
    }

    /// The live transactions in price order (highest first, ties in admission order). Stale
    /// entries are skipped.
    pub(crate) fn drain_sorted(&self, lookup: &TxLookup) -> Vec<Transaction> {
        let mut heap = self
            .heap
            .iter()
            .filter(|entry| {
                lookup
                    .get(&entry.hash)
                    .is_some_and(|live| live.seq == entry.seq)
            })
            .collect::<BinaryHeap<_>>();

        let mut sorted = Vec::with_capacity(heap.len());
        while let Some(entry) = heap.pop() {
            if let Some(live) = lookup.get(&entry.hash) {
                sorted.push(live.tx.clone());
            }
        }
        sorted
    }
}

/// The minimum gas price a replacement must offer over `price`: `price * (1 + bump%)`.
pub(crate) fn bump_threshold(price: &U256, bump: u64) -> U256 {
    *price + *price * U256::from(bump) / U256::from(100)
}
