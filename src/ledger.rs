/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The ledger: applies committed consensus blocks to the EVM state engine and assembles the
//! EVM-side chain of executed blocks.
//!
//! Consensus decides *order*; the ledger turns each committed command back into its transaction
//! batch, executes it, commits the world state, and records an [`EvmBlock`] whose header carries
//! the resulting `state_root`, `tx_root`, and `receipt_root`. It also implements the
//! [`ForkHandler`] side of pruning: transactions of abandoned blocks return to circulation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::app::{Executor as ExecutorTrait, ForkHandler};
use crate::evm::{EvmBlock, EvmBlockHeader, Executor, Receipt};
use crate::kv_store::{KVStore, MemKVStore};
use crate::logging::short_hash;
use crate::mempool::transaction::{decode_batch, Signer, Transaction};
use crate::mempool::Mempool;
use crate::state_db::{Address, StateDb};
use crate::trie::database::NodeStore;
use crate::trie::Mpt;
use crate::types::basic::CryptoHash;
use crate::types::block::Block;

/// The EVM-backed ledger. Owned by the replica's event loop; mutated only through
/// [`exec`](ExecutorTrait::exec) and [`fork`](ForkHandler::fork), in commit order.
pub struct Ledger<K: KVStore> {
    state: StateDb<K>,
    executor: Executor,
    signer: Box<dyn Signer>,
    mempool: Arc<Mempool>,
    coinbase: Address,

    blocks: HashMap<CryptoHash, EvmBlock>,
    blocks_by_number: BTreeMap<u64, CryptoHash>,
    tx_locations: HashMap<CryptoHash, (CryptoHash, u64)>,
    latest: CryptoHash,
    block_number: u64,
}

impl<K: KVStore> Ledger<K> {
    /// Create the ledger over `state`, materializing the EVM genesis block.
    pub fn new(
        state: StateDb<K>,
        executor: Executor,
        signer: impl Signer,
        coinbase: Address,
        mempool: Arc<Mempool>,
    ) -> Ledger<K> {
        let genesis = EvmBlock {
            header: EvmBlockHeader {
                number: 0,
                parent_hash: CryptoHash::zero(),
                coinbase,
                gas_limit: executor.config().gas_limit,
                gas_used: 0,
                base_fee: executor.config().base_fee,
                timestamp: 0,
                state_root: state.state_root(),
                tx_root: CryptoHash::zero(),
                receipt_root: CryptoHash::zero(),
            },
            transactions: Vec::new(),
            receipts: Vec::new(),
        };
        let genesis_hash = genesis.hash();

        let mut ledger = Ledger {
            state,
            executor,
            signer: Box::new(signer),
            mempool,
            coinbase,
            blocks: HashMap::new(),
            blocks_by_number: BTreeMap::new(),
            tx_locations: HashMap::new(),
            latest: genesis_hash,
            block_number: 0,
        };
        ledger.blocks.insert(genesis_hash, genesis);
        ledger.blocks_by_number.insert(0, genesis_hash);
        ledger
    }

    /// Direct access to the world state, for the read side of the RPC façade.
    pub fn state(&self) -> &StateDb<K> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StateDb<K> {
        &mut self.state
    }

    /// The current chain head.
    pub fn latest_block(&self) -> &EvmBlock {
        self.blocks
            .get(&self.latest)
            .expect("the latest hash always indexes a stored block")
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn block_by_hash(&self, hash: &CryptoHash) -> Option<&EvmBlock> {
        self.blocks.get(hash)
    }

    pub fn block_by_number(&self, number: u64) -> Option<&EvmBlock> {
        self.blocks_by_number
            .get(&number)
            .and_then(|hash| self.blocks.get(hash))
    }

    /// Locate a transaction: the containing block and the transaction's index within it.
    pub fn transaction_by_hash(&self, hash: &CryptoHash) -> Option<(&Transaction, &EvmBlock, u64)> {
        let (block_hash, index) = self.tx_locations.get(hash)?;
        let block = self.blocks.get(block_hash)?;
        let tx = block.transactions.get(*index as usize)?;
        Some((tx, block, *index))
    }

    pub fn receipt_by_hash(&self, hash: &CryptoHash) -> Option<&Receipt> {
        let (block_hash, index) = self.tx_locations.get(hash)?;
        self.blocks
            .get(block_hash)?
            .receipts
            .get(*index as usize)
    }
}

impl<K: KVStore> ExecutorTrait for Ledger<K> {
    /// Execute one committed consensus block: decode its command, run the transactions, commit
    /// the world state, and append the resulting [`EvmBlock`] to the chain.
    fn exec(&mut self, block: &Block) {
        let transactions = match decode_batch(&block.cmd) {
            Ok(transactions) => transactions,
            Err(err) => {
                // The acceptor admits only decodable commands, so this indicates a bug.
                log::error!(
                    "Ledger, failed to decode command of committed block {}: {}",
                    short_hash(&block.hash),
                    err
                );
                return;
            }
        };

        let receipts = self.executor.execute_block(
            &mut self.state,
            self.signer.as_ref(),
            &self.coinbase,
            &transactions,
        );

        let state_root = match self.state.commit() {
            Ok(state_root) => state_root,
            Err(err) => {
                log::error!(
                    "Ledger, failed to commit state for block {}: {}",
                    short_hash(&block.hash),
                    err
                );
                return;
            }
        };

        let gas_used = receipts
            .last()
            .map_or(0, |receipt| receipt.cumulative_gas_used);
        self.block_number += 1;

        let header = EvmBlockHeader {
            number: self.block_number,
            parent_hash: self.latest,
            coinbase: self.coinbase,
            gas_limit: self.executor.config().gas_limit,
            gas_used,
            base_fee: self.executor.config().base_fee,
            timestamp: block.timestamp,
            state_root,
            tx_root: index_root(transactions.iter().map(Transaction::encode)),
            receipt_root: index_root(receipts.iter().map(Receipt::encode)),
        };
        let evm_block = EvmBlock {
            header,
            transactions,
            receipts,
        };
        let evm_hash = evm_block.hash();

        for (index, tx) in evm_block.transactions.iter().enumerate() {
            self.tx_locations.insert(tx.hash(), (evm_hash, index as u64));
        }
        self.mempool.remove_transactions(&evm_block.transactions);

        log::info!(
            "Ledger, block {} executed, {} txs, gas {}, state root {}",
            self.block_number,
            evm_block.transactions.len(),
            gas_used,
            short_hash(&state_root)
        );

        self.blocks_by_number.insert(self.block_number, evm_hash);
        self.blocks.insert(evm_hash, evm_block);
        self.latest = evm_hash;
    }
}

impl<K: KVStore> ForkHandler for Ledger<K> {
    /// A consensus block was abandoned by a commit on a competing branch: its transactions were
    /// never executed, so they go back into selection.
    fn fork(&mut self, block: &Block) {
        match decode_batch(&block.cmd) {
            Ok(transactions) => {
                log::info!(
                    "Ledger, returning {} txs of forked block {} to the pool",
                    transactions.len(),
                    short_hash(&block.hash)
                );
                self.mempool.unmark_proposed(&transactions);
            }
            Err(err) => {
                log::error!(
                    "Ledger, failed to decode command of forked block {}: {}",
                    short_hash(&block.hash),
                    err
                );
            }
        }
    }
}

/// The trie root over a sequence of encoded items keyed by their little-endian index, as used
/// for `tx_root` and `receipt_root`.
fn index_root(items: impl Iterator<Item = Vec<u8>>) -> CryptoHash {
    let db = NodeStore::new(MemKVStore::new());
    let mut trie = Mpt::new();
    for (index, encoded) in items.enumerate() {
        let key = (index as u64).to_le_bytes();
        if let Err(err) = trie.insert(&db, &key, encoded) {
            // Freshly built tries never dereference missing nodes.
            panic!("invariant violation: index trie build failed: {}", err);
        }
    }
    trie.root_hash()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::ExecutionConfig;
    use crate::mempool::transaction::DevSigner;
    use crate::mempool::MempoolConfig;
    use crate::types::basic::{ReplicaID, ViewNumber};
    use crate::types::certificates::QuorumCertificate;
    use ethereum_types::U256;

    fn ledger() -> Ledger<MemKVStore> {
        let state = StateDb::new(NodeStore::new(MemKVStore::new()));
        let executor = Executor::new(ExecutionConfig {
            gas_limit: 8_000_000,
            base_fee: U256::one(),
            chain_id: U256::one(),
        });
        let mempool = Arc::new(Mempool::new(MempoolConfig::default(), DevSigner));
        Ledger::new(state, executor, DevSigner, Address::repeat_byte(0xcc), mempool)
    }

    fn consensus_block(transactions: &[Transaction]) -> Block {
        Block::new(
            CryptoHash::zero(),
            QuorumCertificate::genesis_qc(),
            crate::mempool::transaction::encode_batch(transactions),
            ViewNumber::new(1),
            ReplicaID::new(0),
            11,
        )
    }

    fn funded_tx(ledger: &mut Ledger<MemKVStore>, value: u64) -> Transaction {
        let mut tx = Transaction::new(
            0,
            Some(Address::repeat_byte(0xbb)),
            U256::from(value),
            100_000,
            U256::from(2),
            vec![value as u8],
            U256::one(),
        );
        DevSigner.sign(&mut tx);
        let from = DevSigner.sender(&tx).unwrap();
        let state = ledger.state_mut();
        state.create_account(&from).unwrap();
        state.add_balance(&from, U256::from(10_000_000_000u64)).unwrap();
        tx
    }

    #[test]
    fn exec_appends_an_evm_block() {
        let mut ledger = ledger();
        let tx = funded_tx(&mut ledger, 5);
        let tx_hash = tx.hash();
        let block = consensus_block(&[tx]);

        ledger.exec(&block);

        assert_eq!(ledger.block_number(), 1);
        let head = ledger.latest_block();
        assert_eq!(head.header.number, 1);
        assert_eq!(head.transactions.len(), 1);
        assert!(!head.header.tx_root.is_zero());
        assert!(!head.header.receipt_root.is_zero());
        assert_eq!(head.header.timestamp, 11);

        let (_, found_block, index) = ledger.transaction_by_hash(&tx_hash).unwrap();
        assert_eq!(found_block.header.number, 1);
        assert_eq!(index, 0);
        assert_eq!(ledger.receipt_by_hash(&tx_hash).unwrap().status, 1);
    }

    #[test]
    fn exec_removes_transactions_from_the_pool() {
        let mut ledger = ledger();
        let tx = funded_tx(&mut ledger, 5);
        ledger.mempool.add_local(tx.clone()).unwrap();
        assert_eq!(ledger.mempool.stats().0, 1);

        ledger.exec(&consensus_block(&[tx]));
        assert_eq!(ledger.mempool.stats().0, 0);
    }

    #[test]
    fn fork_returns_transactions_to_circulation() {
        let mut ledger = ledger();
        let tx = funded_tx(&mut ledger, 5);
        ledger.mempool.add_local(tx.clone()).unwrap();

        let batch = ledger.mempool.get_transactions_for_block(8_000_000);
        ledger
            .mempool
            .mark_proposed(&crate::mempool::transaction::encode_batch(&batch));
        assert!(ledger.mempool.get_transactions_for_block(8_000_000).is_empty());

        ledger.fork(&consensus_block(&batch));
        assert_eq!(ledger.mempool.get_transactions_for_block(8_000_000).len(), 1);
    }

    #[test]
    fn state_root_depends_only_on_committed_sequence() {
        let mut a = ledger();
        let tx_a = funded_tx(&mut a, 5);
        a.exec(&consensus_block(&[tx_a.clone()]));

        let mut b = ledger();
        let _ = funded_tx(&mut b, 5);
        b.exec(&consensus_block(&[tx_a]));

        assert_eq!(
            a.latest_block().header.state_root,
            b.latest_block().header.state_root
        );
    }

    #[test]
    fn empty_batch_still_advances_the_chain() {
        let mut ledger = ledger();
        ledger.exec(&consensus_block(&[]));
        assert_eq!(ledger.block_number(), 1);
        assert!(ledger.latest_block().header.tx_root.is_zero());
    }
}
