/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Transaction execution: validation, gas accounting, contract creation and calls, receipts.

use ethereum_types::U256;
use serde::{Deserialize, Serialize};

use crate::evm::interpreter::{execute_bytecode, gas, EvmError};
use crate::kv_store::KVStore;
use crate::logging::short_hash;
use crate::mempool::transaction::{Signer, Transaction};
use crate::state_db::{keccak, Address, StateDb};
use crate::types::basic::CryptoHash;

/// Chain-wide execution parameters.
#[derive(Clone, Debug)]
pub struct ExecutionConfig {
    /// Block gas limit.
    pub gas_limit: u64,

    /// Minimum acceptable gas price.
    pub base_fee: U256,

    /// Replay-protection chain id.
    pub chain_id: U256,
}

/// An event log emitted during execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<CryptoHash>,
    pub data: Vec<u8>,
}

/// The persisted outcome of executing one transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: CryptoHash,
    pub tx_index: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub gas_used: u64,
    pub cumulative_gas_used: u64,

    /// The address of the created contract, for creation transactions.
    pub contract_address: Option<Address>,
    pub logs: Vec<Log>,

    /// 1 on success, 0 on failure.
    pub status: u64,
    pub effective_gas_price: U256,
}

impl Receipt {
    /// The canonical encoding, as hashed into a block's receipt root.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("in-memory serialization cannot fail")
    }
}

/// Enumerates pre-state-charge validation failures. Execution failures past the gas debit do
/// not surface here; they produce status-0 receipts instead.
#[derive(Debug, PartialEq, Eq)]
pub enum ValidationError {
    MissingSignature,
    InvalidNonce { expected: u64, got: u64 },
    InsufficientBalance,
    GasPriceBelowBaseFee,
    SenderRecovery,
    State(crate::trie::node::TrieError),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::MissingSignature => write!(f, "signature fields are zero"),
            ValidationError::InvalidNonce { expected, got } => {
                write!(f, "invalid nonce: expected {}, got {}", expected, got)
            }
            ValidationError::InsufficientBalance => write!(f, "insufficient balance"),
            ValidationError::GasPriceBelowBaseFee => write!(f, "gas price below base fee"),
            ValidationError::SenderRecovery => write!(f, "failed to recover sender"),
            ValidationError::State(err) => write!(f, "state error: {}", err),
        }
    }
}

impl From<crate::trie::node::TrieError> for ValidationError {
    fn from(err: crate::trie::node::TrieError) -> ValidationError {
        ValidationError::State(err)
    }
}

/// Executes transactions against a [`StateDb`] and produces receipts.
pub struct Executor {
    config: ExecutionConfig,
}

impl Executor {
    pub fn new(config: ExecutionConfig) -> Executor {
        Executor { config }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Execute every transaction of a block in order. A transaction that fails validation still
    /// yields a status-0 receipt charging intrinsic gas; the block never aborts.
    pub fn execute_block<K: KVStore>(
        &self,
        state: &mut StateDb<K>,
        signer: &dyn Signer,
        coinbase: &Address,
        transactions: &[Transaction],
    ) -> Vec<Receipt> {
        let mut receipts = Vec::with_capacity(transactions.len());
        let mut cumulative_gas_used = 0u64;

        for (index, tx) in transactions.iter().enumerate() {
            let receipt = match self.execute_transaction(
                state,
                signer,
                coinbase,
                tx,
                index as u64,
                cumulative_gas_used,
            ) {
                Ok(receipt) => receipt,
                Err(err) => {
                    log::info!(
                        "Executor, transaction {} rejected: {}",
                        short_hash(&tx.hash()),
                        err
                    );
                    self.failed_receipt(signer, tx, index as u64, cumulative_gas_used)
                }
            };
            cumulative_gas_used = receipt.cumulative_gas_used;
            receipts.push(receipt);
        }

        receipts
    }

    /// Execute one transaction.
    ///
    /// Validation failures before the up-front gas debit return an error (the caller decides
    /// what receipt, if any, to record). Failures after the debit revert the transaction's
    /// writes through a snapshot but still charge the gas that was consumed, producing a
    /// status-0 receipt.
    pub fn execute_transaction<K: KVStore>(
        &self,
        state: &mut StateDb<K>,
        signer: &dyn Signer,
        coinbase: &Address,
        tx: &Transaction,
        tx_index: u64,
        cumulative_gas_used: u64,
    ) -> Result<Receipt, ValidationError> {
        // 1. Recover the sender.
        let from = signer
            .sender(tx)
            .map_err(|_| ValidationError::SenderRecovery)?;

        // 2. Validate against current state.
        self.validate(state, tx, &from)?;

        // 3. Debit the whole gas budget up front and bump the nonce.
        let gas_cost = tx.gas_price.saturating_mul(U256::from(tx.gas_limit));
        state.sub_balance(&from, gas_cost)?;
        state.set_nonce(&from, tx.nonce + 1)?;

        // 4. Run the transaction body under a snapshot.
        let snapshot = state.snapshot();
        let outcome = self.apply(state, tx, &from);

        let (gas_used, contract_address, status) = match outcome {
            Ok((gas_used, contract_address)) => (gas_used.min(tx.gas_limit), contract_address, 1),
            Err((gas_used, err)) => {
                log::info!(
                    "Executor, transaction {} failed: {}",
                    short_hash(&tx.hash()),
                    err
                );
                state.revert_to_snapshot(snapshot);
                (gas_used.min(tx.gas_limit), None, 0)
            }
        };

        // 5. Refund what was not consumed; pay the consumed part to the block's coinbase.
        let refund = tx
            .gas_price
            .saturating_mul(U256::from(tx.gas_limit - gas_used));
        state.add_balance(&from, refund)?;
        let payment = tx.gas_price.saturating_mul(U256::from(gas_used));
        state.add_balance(coinbase, payment)?;

        Ok(Receipt {
            tx_hash: tx.hash(),
            tx_index,
            from,
            to: tx.to,
            gas_used,
            cumulative_gas_used: cumulative_gas_used + gas_used,
            contract_address,
            logs: Vec::new(),
            status,
            effective_gas_price: tx.gas_price,
        })
    }

    fn validate<K: KVStore>(
        &self,
        state: &mut StateDb<K>,
        tx: &Transaction,
        from: &Address,
    ) -> Result<(), ValidationError> {
        if !tx.is_signed() {
            return Err(ValidationError::MissingSignature);
        }

        let account_nonce = state.get_nonce(from)?;
        if tx.nonce != account_nonce {
            return Err(ValidationError::InvalidNonce {
                expected: account_nonce,
                got: tx.nonce,
            });
        }

        if state.get_balance(from)? < tx.cost() {
            return Err(ValidationError::InsufficientBalance);
        }

        if tx.gas_price < self.config.base_fee {
            return Err(ValidationError::GasPriceBelowBaseFee);
        }

        Ok(())
    }

    /// The transaction body: creation or call, plus the value transfer. Failures carry the gas
    /// consumed so far.
    fn apply<K: KVStore>(
        &self,
        state: &mut StateDb<K>,
        tx: &Transaction,
        from: &Address,
    ) -> Result<(u64, Option<Address>), (u64, EvmError)> {
        match tx.to {
            None => {
                let contract = contract_address(from, tx.nonce);
                let mut gas_used = gas::TX + gas::CREATE;

                state
                    .create_account(&contract)
                    .map_err(|err| (gas_used, err.into()))?;

                if !tx.data.is_empty() {
                    gas_used += tx.data.len() as u64 * gas::CODE_DEPOSIT;
                    let budget = tx.gas_limit.saturating_sub(gas_used);
                    let (exec_gas, result) =
                        execute_bytecode(state, &contract, &tx.data, budget);
                    gas_used += exec_gas;
                    let runtime_code = result.map_err(|err| (gas_used, err))?;
                    state
                        .set_code(&contract, &runtime_code)
                        .map_err(|err| (gas_used, err.into()))?;
                }

                self.transfer(state, from, &contract, tx.value)
                    .map_err(|err| (gas_used, err))?;

                log::debug!(
                    "Executor, contract created at {:?} by {}",
                    contract,
                    short_hash(&tx.hash())
                );
                Ok((gas_used, Some(contract)))
            }
            Some(to) => {
                let mut gas_used = gas::TX;

                let code = state.get_code(&to).map_err(|err| (gas_used, err.into()))?;
                if !code.is_empty() {
                    let budget = tx.gas_limit.saturating_sub(gas_used);
                    let (exec_gas, result) = execute_bytecode(state, &to, &code, budget);
                    gas_used += exec_gas;
                    result.map_err(|err| (gas_used, err))?;
                }

                self.transfer(state, from, &to, tx.value)
                    .map_err(|err| (gas_used, err))?;

                Ok((gas_used, None))
            }
        }
    }

    fn transfer<K: KVStore>(
        &self,
        state: &mut StateDb<K>,
        from: &Address,
        to: &Address,
        value: U256,
    ) -> Result<(), EvmError> {
        if value.is_zero() {
            return Ok(());
        }
        state.sub_balance(from, value)?;
        state.add_balance(to, value)?;
        Ok(())
    }

    /// The receipt recorded for a transaction that failed validation: intrinsic gas charged,
    /// nothing else.
    fn failed_receipt(
        &self,
        signer: &dyn Signer,
        tx: &Transaction,
        tx_index: u64,
        cumulative_gas_used: u64,
    ) -> Receipt {
        let from = signer.sender(tx).unwrap_or_default();
        let gas_used = gas::TX.min(tx.gas_limit);
        Receipt {
            tx_hash: tx.hash(),
            tx_index,
            from,
            to: tx.to,
            gas_used,
            cumulative_gas_used: cumulative_gas_used + gas_used,
            contract_address: None,
            logs: Vec::new(),
            status: 0,
            effective_gas_price: tx.gas_price,
        }
    }

    /// A rough gas estimate for `tx` against a copy of `state`.
    pub fn estimate_gas<K: KVStore>(
        &self,
        state: &StateDb<K>,
        signer: &dyn Signer,
        tx: &Transaction,
    ) -> Result<u64, ValidationError> {
        let mut state = state.copy();
        let from = signer
            .sender(tx)
            .map_err(|_| ValidationError::SenderRecovery)?;
        self.validate(&mut state, tx, &from)?;

        let mut estimate = gas::TX;
        match tx.to {
            None => {
                estimate += gas::CREATE + tx.data.len() as u64 * gas::CODE_DEPOSIT;
            }
            Some(to) => {
                if !tx.data.is_empty() && state.get_code_size(&to)? > 0 {
                    estimate += tx.data.len() as u64 * 16 + 700;
                }
            }
        }
        Ok(estimate)
    }
}

/// The address a contract created by `sender` at `nonce` lives at: the low 20 bytes of
/// Keccak-256 over the sender and nonce.
pub fn contract_address(sender: &Address, nonce: u64) -> Address {
    let mut preimage = Vec::with_capacity(28);
    preimage.extend_from_slice(sender.as_bytes());
    preimage.extend_from_slice(&nonce.to_le_bytes());
    let hash = keccak(&preimage);
    Address::from_slice(&hash.bytes()[12..])
}
