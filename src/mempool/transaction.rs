/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Ethereum-style transactions, their canonical encoding, and the sender-recovery seam.

use ethereum_types::U256;
use serde::{Deserialize, Serialize};

use crate::state_db::{keccak, Address};
use crate::types::basic::CryptoHash;
use crate::types::block::Command;

/// Maximum encoded transaction size accepted by the pool.
pub const MAX_TX_SIZE: usize = 32 * 1024;

/// An Ethereum-style transaction.
///
/// The transaction hash is the Keccak-256 of the canonical (bincode) encoding of the unsigned
/// fields; `v`, `r`, `s` carry the signature over that hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: u64,

    /// `None` for contract creation.
    pub to: Option<Address>,
    pub value: U256,
    pub data: Vec<u8>,

    /// Replay protection: the chain this transaction is valid on.
    pub chain_id: U256,

    pub v: U256,
    pub r: U256,
    pub s: U256,
}

impl Transaction {
    /// Create an unsigned transaction.
    pub fn new(
        nonce: u64,
        to: Option<Address>,
        value: U256,
        gas_limit: u64,
        gas_price: U256,
        data: Vec<u8>,
        chain_id: U256,
    ) -> Transaction {
        Transaction {
            nonce,
            gas_price,
            gas_limit,
            to,
            value,
            data,
            chain_id,
            v: U256::zero(),
            r: U256::zero(),
            s: U256::zero(),
        }
    }

    /// The transaction hash: Keccak-256 over the canonical encoding of the unsigned fields.
    pub fn hash(&self) -> CryptoHash {
        let unsigned = (
            self.nonce,
            &self.gas_price,
            self.gas_limit,
            &self.to,
            &self.value,
            &self.data,
            &self.chain_id,
        );
        let bytes = bincode::serialize(&unsigned).expect("in-memory serialization cannot fail");
        keccak(&bytes)
    }

    /// Whether the signature fields are populated.
    pub fn is_signed(&self) -> bool {
        !self.v.is_zero() && !self.r.is_zero() && !self.s.is_zero()
    }

    /// Whether this transaction creates a contract.
    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }

    /// Total funds the sender needs: `value + gas_limit * gas_price`.
    pub fn cost(&self) -> U256 {
        self.value
            .saturating_add(self.gas_price.saturating_mul(U256::from(self.gas_limit)))
    }

    /// The canonical encoding, as carried inside a block's command.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("in-memory serialization cannot fail")
    }

    /// Decode a transaction from its canonical encoding.
    pub fn decode(bytes: &[u8]) -> Result<Transaction, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// The encoded size of this transaction.
    pub fn size(&self) -> usize {
        self.encode().len()
    }

    /// Structural validation: a transaction the pool will not even look at twice.
    pub fn validate(&self) -> Result<(), TxValidationError> {
        if self.gas_limit == 0 {
            return Err(TxValidationError::ZeroGasLimit);
        }
        if self.size() > MAX_TX_SIZE {
            return Err(TxValidationError::Oversized);
        }
        Ok(())
    }
}

/// Enumerates structural defects in a transaction.
#[derive(Debug, PartialEq, Eq)]
pub enum TxValidationError {
    ZeroGasLimit,
    Oversized,
}

impl std::fmt::Display for TxValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxValidationError::ZeroGasLimit => write!(f, "gas limit cannot be zero"),
            TxValidationError::Oversized => write!(f, "transaction exceeds maximum size"),
        }
    }
}

/// Encode a batch of transactions as a consensus [`Command`].
pub fn encode_batch(transactions: &[Transaction]) -> Command {
    Command::new(bincode::serialize(transactions).expect("in-memory serialization cannot fail"))
}

/// Decode a consensus [`Command`] back into a batch of transactions.
pub fn decode_batch(cmd: &Command) -> Result<Vec<Transaction>, bincode::Error> {
    if cmd.is_empty() {
        return Ok(Vec::new());
    }
    bincode::deserialize(cmd.bytes())
}

/// Recovers the sender address of a transaction from its signature.
///
/// Real deployments slot in an ECDSA-recover implementation here; the pool and executor are
/// agnostic to how the address is derived.
pub trait Signer: Send + Sync + 'static {
    fn sender(&self, tx: &Transaction) -> Result<Address, SignerError>;
}

/// Enumerates sender-recovery failures.
#[derive(Debug, PartialEq, Eq)]
pub enum SignerError {
    /// The signature fields are absent or malformed.
    InvalidSignature,
}

impl std::fmt::Display for SignerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignerError::InvalidSignature => write!(f, "invalid transaction signature"),
        }
    }
}

/// Development signer: derives the sender address from the transaction hash instead of
/// recovering it cryptographically.
///
/// This is a placeholder with no authentication value whatsoever. It exists so the rest of the
/// pipeline can be exercised end to end; production configurations must provide a real
/// [`Signer`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DevSigner;

impl DevSigner {
    /// "Sign" `tx` by stamping deterministic non-zero signature fields derived from its hash.
    pub fn sign(&self, tx: &mut Transaction) {
        let hash = tx.hash();
        tx.v = U256::from(27);
        tx.r = U256::from_big_endian(&hash.bytes());
        if tx.r.is_zero() {
            tx.r = U256::one();
        }
        tx.s = U256::one();
    }
}

impl Signer for DevSigner {
    fn sender(&self, tx: &Transaction) -> Result<Address, SignerError> {
        if !tx.is_signed() {
            return Err(SignerError::InvalidSignature);
        }
        let hash = tx.hash();
        Ok(Address::from_slice(&hash.bytes()[..20]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx(nonce: u64, gas_price: u64) -> Transaction {
        let mut tx = Transaction::new(
            nonce,
            Some(Address::repeat_byte(9)),
            U256::from(1000),
            21_000,
            U256::from(gas_price),
            Vec::new(),
            U256::one(),
        );
        DevSigner.sign(&mut tx);
        tx
    }

    #[test]
    fn encode_decode_is_identity() {
        let tx = sample_tx(7, 100);
        let decoded = Transaction::decode(&tx.encode()).unwrap();
        assert_eq!(tx, decoded);
        assert_eq!(tx.hash(), decoded.hash());
    }

    #[test]
    fn hash_ignores_signature_fields() {
        let mut tx = sample_tx(7, 100);
        let hash = tx.hash();
        tx.v = U256::from(28);
        assert_eq!(tx.hash(), hash);
    }

    #[test]
    fn batch_round_trip_preserves_hashes() {
        let txs = vec![sample_tx(0, 50), sample_tx(1, 60)];
        let cmd = encode_batch(&txs);
        let decoded = decode_batch(&cmd).unwrap();
        assert_eq!(
            txs.iter().map(Transaction::hash).collect::<Vec<_>>(),
            decoded.iter().map(Transaction::hash).collect::<Vec<_>>()
        );
    }

    #[test]
    fn dev_signer_requires_signature_fields() {
        let mut tx = sample_tx(0, 50);
        assert!(DevSigner.sender(&tx).is_ok());
        tx.r = U256::zero();
        assert_eq!(DevSigner.sender(&tx), Err(SignerError::InvalidSignature));
    }
}
