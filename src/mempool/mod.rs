/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The transaction pool: admission, replacement, ordering, and selection of transactions for
//! proposals.
//!
//! ## Structure
//!
//! Per-sender nonce-sorted lists split into `pending` (contiguous, proposable) and `queue`
//! (nonce-gapped, waiting); a global hash lookup; and a price-indexed heap that yields
//! transactions in gas-price order with ties broken by admission order.
//!
//! ## Concurrency
//!
//! Multiple producers call [`add_local`](Mempool::add_local)/[`add_remote`](Mempool::add_remote);
//! a mutex protects the internal structures, and the lock is never held across anything that
//! blocks. The consensus driver consumes the pool through the [`CommandQueue`] and [`Acceptor`]
//! traits on `Arc<Mempool>`.

pub mod list;
pub mod transaction;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ethereum_types::U256;

use crate::app::{Acceptor, CommandQueue};
use crate::logging::short_hash;
use crate::mempool::list::{PricedList, TxList, TxLookup};
use crate::mempool::transaction::{
    decode_batch, encode_batch, Signer, SignerError, Transaction, TxValidationError,
};
use crate::state_db::Address;
use crate::types::basic::CryptoHash;
use crate::types::block::Command;

/// Pool limits and pricing policy.
#[derive(Clone, Debug)]
pub struct MempoolConfig {
    /// Maximum number of proposable transaction slots across all accounts.
    pub global_slots: usize,

    /// Maximum number of nonce-gapped transaction slots across all accounts.
    pub global_queue: usize,

    /// Proposable transaction slots guaranteed per account.
    pub account_slots: usize,

    /// Maximum nonce-gapped transactions per account.
    pub account_queue: usize,

    /// Minimum gas price for admission.
    pub price_limit: U256,

    /// Minimum price bump percentage to replace an existing transaction at the same nonce.
    pub price_bump: u64,

    /// How long nonce-gapped transactions may wait before the expiry sweep drops them.
    pub lifetime: Duration,

    /// Gas budget of a block, bounding selection.
    pub block_gas_limit: u64,
}

impl Default for MempoolConfig {
    fn default() -> MempoolConfig {
        MempoolConfig {
            global_slots: 4096,
            global_queue: 1024,
            account_slots: 16,
            account_queue: 64,
            price_limit: U256::one(),
            price_bump: 10,
            lifetime: Duration::from_secs(3 * 60 * 60),
            block_gas_limit: 8_000_000,
        }
    }
}

/// Enumerates the ways admission can fail.
#[derive(Debug, PartialEq, Eq)]
pub enum PoolError {
    Structural(TxValidationError),
    Underpriced,
    ReplacementUnderpriced,
    AlreadyKnown,
    Full,
    AccountQueueFull,
    InvalidSender(SignerError),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Structural(err) => write!(f, "invalid transaction: {}", err),
            PoolError::Underpriced => write!(f, "transaction underpriced"),
            PoolError::ReplacementUnderpriced => write!(f, "replacement transaction underpriced"),
            PoolError::AlreadyKnown => write!(f, "transaction already known"),
            PoolError::Full => write!(f, "transaction pool is full"),
            PoolError::AccountQueueFull => write!(f, "account queue is full"),
            PoolError::InvalidSender(err) => write!(f, "{}", err),
        }
    }
}

impl From<TxValidationError> for PoolError {
    fn from(err: TxValidationError) -> PoolError {
        PoolError::Structural(err)
    }
}

impl From<SignerError> for PoolError {
    fn from(err: SignerError) -> PoolError {
        PoolError::InvalidSender(err)
    }
}

struct PoolInner {
    pending: HashMap<Address, TxList>,
    queue: HashMap<Address, TxList>,
    all: TxLookup,
    priced: PricedList,
    next_seq: u64,

    /// Hashes already included in an uncommitted proposal; excluded from selection until the
    /// proposal commits (removal) or forks (unmark).
    proposed: HashSet<CryptoHash>,
}

/// The transaction pool. Shared as `Arc<Mempool>` between the RPC surface (producers) and the
/// replica event loop (consumer).
pub struct Mempool {
    config: MempoolConfig,
    signer: Box<dyn Signer>,
    inner: Mutex<PoolInner>,
    new_tx: Condvar,
    subscribers: Mutex<Vec<SyncSender<Transaction>>>,
    shutdown: AtomicBool,
}

impl Mempool {
    /// Create a pool with the given configuration and sender-recovery implementation.
    pub fn new(config: MempoolConfig, signer: impl Signer) -> Mempool {
        Mempool {
            config,
            signer: Box::new(signer),
            inner: Mutex::new(PoolInner {
                pending: HashMap::new(),
                queue: HashMap::new(),
                all: TxLookup::new(),
                priced: PricedList::new(),
                next_seq: 0,
                proposed: HashSet::new(),
            }),
            new_tx: Condvar::new(),
            subscribers: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Admit a transaction submitted through this replica's own interface.
    pub fn add_local(&self, tx: Transaction) -> Result<(), PoolError> {
        self.add(tx, true)
    }

    /// Admit a transaction relayed from another replica.
    pub fn add_remote(&self, tx: Transaction) -> Result<(), PoolError> {
        self.add(tx, false)
    }

    fn add(&self, tx: Transaction, local: bool) -> Result<(), PoolError> {
        // 1. Structural validation.
        tx.validate()?;

        // 2. Price floor.
        if tx.gas_price < self.config.price_limit {
            return Err(PoolError::Underpriced);
        }

        // 3. Sender recovery.
        let sender = self.signer.sender(&tx)?;
        let hash = tx.hash();

        {
            let mut inner = self.inner.lock().unwrap();
            let inner = &mut *inner;

            if inner.all.contains(&hash) {
                return Err(PoolError::AlreadyKnown);
            }

            let replaces = inner
                .pending
                .get(&sender)
                .is_some_and(|list| list.overlaps(&tx));

            // 4. A full pool only admits replacements.
            if inner.all.count() >= self.config.global_slots + self.config.global_queue
                && !replaces
            {
                return Err(PoolError::Full);
            }

            if replaces {
                // 5. Same (sender, nonce): only a sufficient price bump displaces the incumbent.
                let list = inner.pending.get_mut(&sender).expect("checked above");
                let (inserted, old) = list.add(tx.clone(), self.config.price_bump);
                if !inserted {
                    return Err(PoolError::ReplacementUnderpriced);
                }
                let old = old.expect("overlap checked above");
                inner.all.remove(&old.hash());
                inner.proposed.remove(&old.hash());
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.all.add(tx.clone(), seq, None);
                inner.priced.put(&tx, seq);
                let lookup = &inner.all;
                inner.priced.removed(1, lookup);
                log::info!(
                    "Mempool, replaced transaction {} nonce {}",
                    short_hash(&hash),
                    tx.nonce
                );
            } else {
                // 6. New nonce for this sender: contiguous transactions are proposable, gapped
                //    ones wait in the queue.
                let expected_next = inner
                    .pending
                    .get(&sender)
                    .and_then(|list| list.last_nonce())
                    .map(|nonce| nonce + 1);
                let pending_len = inner.pending.get(&sender).map_or(0, |list| list.len());

                let goes_to_queue = expected_next.is_some_and(|next| tx.nonce > next)
                    || pending_len >= self.config.account_slots;

                let seq = inner.next_seq;
                inner.next_seq += 1;

                if goes_to_queue {
                    let list = inner.queue.entry(sender).or_insert_with(TxList::new);
                    if list.len() >= self.config.account_queue {
                        return Err(PoolError::AccountQueueFull);
                    }
                    let (inserted, old) = list.add(tx.clone(), self.config.price_bump);
                    if !inserted {
                        return Err(PoolError::ReplacementUnderpriced);
                    }
                    if let Some(old) = old {
                        inner.all.remove(&old.hash());
                        let lookup = &inner.all;
                        inner.priced.removed(1, lookup);
                    }
                    inner.all.add(tx.clone(), seq, Some(Instant::now()));
                    inner.priced.put(&tx, seq);
                } else {
                    inner
                        .pending
                        .entry(sender)
                        .or_insert_with(TxList::new)
                        .add(tx.clone(), self.config.price_bump);
                    inner.all.add(tx.clone(), seq, None);
                    inner.priced.put(&tx, seq);
                    Self::promote_locked(&mut inner, &sender);
                }

                log::info!(
                    "Mempool, added transaction {} nonce {} from {:?} (local: {})",
                    short_hash(&hash),
                    tx.nonce,
                    sender,
                    local
                );
            }
        }

        self.notify_subscribers(&tx);
        self.new_tx.notify_all();
        Ok(())
    }

    /// Move queued transactions that became nonce-contiguous into the pending list.
    fn promote_locked(inner: &mut PoolInner, sender: &Address) {
        loop {
            let next = match inner.pending.get(sender).and_then(|list| list.last_nonce()) {
                Some(nonce) => nonce + 1,
                None => return,
            };
            let queued = match inner.queue.get_mut(sender) {
                Some(list) => list,
                None => return,
            };
            let promoted: Vec<Transaction> = queued
                .flatten()
                .into_iter()
                .filter(|tx| tx.nonce == next)
                .collect();
            if promoted.is_empty() {
                return;
            }
            for tx in promoted {
                queued.remove(tx.nonce);
                let hash = tx.hash();
                if let Some(entry) = inner.all.remove(&hash) {
                    inner.all.add(entry.tx, entry.seq, None);
                }
                inner
                    .pending
                    .entry(*sender)
                    .or_insert_with(TxList::new)
                    .add(tx, 0);
            }
            if inner.queue.get(sender).is_some_and(|list| list.is_empty()) {
                inner.queue.remove(sender);
            }
        }
    }

    /// Get a transaction by hash.
    pub fn get(&self, hash: &CryptoHash) -> Option<Transaction> {
        self.inner
            .lock()
            .unwrap()
            .all
            .get(hash)
            .map(|entry| entry.tx.clone())
    }

    /// All currently proposable transactions, per sender, in nonce order.
    pub fn pending(&self) -> HashMap<Address, Vec<Transaction>> {
        let inner = self.inner.lock().unwrap();
        inner
            .pending
            .iter()
            .map(|(sender, list)| (*sender, list.flatten()))
            .collect()
    }

    /// The next proposable nonce for `address`, based on the pool's pending view.
    pub fn next_nonce(&self, address: &Address) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .pending
            .get(address)
            .and_then(|list| list.last_nonce())
            .map_or(0, |nonce| nonce + 1)
    }

    /// Counts of (proposable, queued) transactions.
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        let pending = inner.pending.values().map(TxList::len).sum();
        let queued = inner.queue.values().map(TxList::len).sum();
        (pending, queued)
    }

    /// Select transactions for a block: proposable transactions in gas-price order (ties in
    /// admission order), greedily included until the next one would exceed `max_gas`.
    pub fn get_transactions_for_block(&self, max_gas: u64) -> Vec<Transaction> {
        let inner = self.inner.lock().unwrap();
        Self::select_locked(&inner, max_gas)
    }

    fn select_locked(inner: &PoolInner, max_gas: u64) -> Vec<Transaction> {
        let mut selected = Vec::new();
        let mut total_gas = 0u64;

        for tx in inner.priced.drain_sorted(&inner.all) {
            let hash = tx.hash();
            if inner.proposed.contains(&hash) {
                continue;
            }
            // Queued (nonce-gapped) transactions are not proposable.
            if inner
                .all
                .get(&hash)
                .is_some_and(|entry| entry.queued_at.is_some())
            {
                continue;
            }
            if total_gas + tx.gas_limit > max_gas {
                break;
            }
            total_gas += tx.gas_limit;
            selected.push(tx);
        }

        selected
    }

    /// Mark every transaction in `cmd` as proposed, excluding it from future selection while
    /// the proposal is in flight.
    pub fn mark_proposed(&self, cmd: &Command) {
        if let Ok(txs) = decode_batch(cmd) {
            let mut inner = self.inner.lock().unwrap();
            for tx in txs {
                inner.proposed.insert(tx.hash());
            }
        }
    }

    /// Return the transactions of a forked block to circulation.
    pub fn unmark_proposed(&self, txs: &[Transaction]) {
        let mut inner = self.inner.lock().unwrap();
        for tx in txs {
            inner.proposed.remove(&tx.hash());
        }
        drop(inner);
        self.new_tx.notify_all();
    }

    /// Remove executed transactions after a block commits.
    pub fn remove_transactions(&self, txs: &[Transaction]) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let mut removed = 0;
        for tx in txs {
            let hash = tx.hash();
            if inner.all.remove(&hash).is_none() {
                continue;
            }
            removed += 1;
            inner.proposed.remove(&hash);
            if let Ok(sender) = self.signer.sender(tx) {
                if let Some(list) = inner.pending.get_mut(&sender) {
                    list.remove(tx.nonce);
                    if list.is_empty() {
                        inner.pending.remove(&sender);
                    }
                }
                if let Some(list) = inner.queue.get_mut(&sender) {
                    list.remove(tx.nonce);
                    if list.is_empty() {
                        inner.queue.remove(&sender);
                    }
                }
            }
        }
        if removed > 0 {
            let lookup = &inner.all;
            inner.priced.removed(removed, lookup);
        }
    }

    /// Drop queued transactions older than the configured lifetime. Returns how many were
    /// dropped. Called periodically by the replica's event loop.
    pub fn drop_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let now = Instant::now();

        let expired: Vec<(Address, Transaction)> = inner
            .queue
            .iter()
            .flat_map(|(sender, list)| {
                list.flatten().into_iter().map(move |tx| (*sender, tx))
            })
            .filter(|(_, tx)| {
                inner.all.get(&tx.hash()).is_some_and(|entry| {
                    entry
                        .queued_at
                        .is_some_and(|at| now.duration_since(at) > self.config.lifetime)
                })
            })
            .collect();

        for (sender, tx) in &expired {
            inner.all.remove(&tx.hash());
            if let Some(list) = inner.queue.get_mut(sender) {
                list.remove(tx.nonce);
                if list.is_empty() {
                    inner.queue.remove(sender);
                }
            }
        }
        let count = expired.len();
        if count > 0 {
            let lookup = &inner.all;
            inner.priced.removed(count, lookup);
            log::info!("Mempool, dropped {} expired queued transactions", count);
        }
        count
    }

    /// Subscribe to admitted transactions. Notifications are best-effort: if the channel is
    /// full, the notification is dropped.
    pub fn subscribe(&self) -> Receiver<Transaction> {
        let (sender, receiver) = mpsc::sync_channel(64);
        self.subscribers.lock().unwrap().push(sender);
        receiver
    }

    fn notify_subscribers(&self, tx: &Transaction) {
        let subscribers = self.subscribers.lock().unwrap();
        for subscriber in subscribers.iter() {
            let _ = subscriber.try_send(tx.clone());
        }
    }

    /// Wake any waiting consumer and make further waits return immediately.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.new_tx.notify_all();
    }

    fn wait_for_batch(&self, deadline: Instant) -> Option<Command> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            let txs = Self::select_locked(&inner, self.config.block_gas_limit);
            if !txs.is_empty() {
                return Some(encode_batch(&txs));
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .new_tx
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
    }
}

impl CommandQueue for Arc<Mempool> {
    fn get(&mut self, deadline: Instant) -> Option<Command> {
        self.wait_for_batch(deadline)
    }
}

impl Acceptor for Arc<Mempool> {
    fn proposed(&mut self, cmd: &Command) {
        self.mark_proposed(cmd);
    }

    fn accept(&mut self, cmd: &Command) -> bool {
        match decode_batch(cmd) {
            Ok(txs) => txs.iter().all(|tx| tx.validate().is_ok()),
            Err(_) => false,
        }
    }
}
