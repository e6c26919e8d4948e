/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The EVM-side block: the header whose roots authenticate execution results, plus the executed
//! transactions and their receipts.

use ethereum_types::U256;
use serde::{Deserialize, Serialize};

use crate::evm::executor::Receipt;
use crate::mempool::transaction::Transaction;
use crate::state_db::{keccak, Address};
use crate::types::basic::CryptoHash;

/// Header of an executed block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmBlockHeader {
    /// Sequential block number; 0 for the genesis block.
    pub number: u64,
    pub parent_hash: CryptoHash,
    pub coinbase: Address,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub base_fee: U256,
    pub timestamp: u64,

    /// World-state root after executing this block.
    pub state_root: CryptoHash,

    /// Trie root over the block's transactions, keyed by index.
    pub tx_root: CryptoHash,

    /// Trie root over the block's receipts, keyed by index.
    pub receipt_root: CryptoHash,
}

impl EvmBlockHeader {
    /// The header hash: Keccak-256 of the canonical encoding.
    pub fn hash(&self) -> CryptoHash {
        let bytes = bincode::serialize(self).expect("in-memory serialization cannot fail");
        keccak(&bytes)
    }
}

/// An executed block: header, transactions, receipts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmBlock {
    pub header: EvmBlockHeader,
    pub transactions: Vec<Transaction>,
    pub receipts: Vec<Receipt>,
}

impl EvmBlock {
    /// The block hash (the header hash).
    pub fn hash(&self) -> CryptoHash {
        self.header.hash()
    }
}
