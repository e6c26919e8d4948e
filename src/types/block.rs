/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The unit of consensus: a content-addressed block carrying an opaque command.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};

use crate::types::basic::{CryptoHash, ReplicaID, ViewNumber};
use crate::types::certificates::QuorumCertificate;

/// Opaque bytes ordered by consensus, typically a serialized batch of transactions.
///
/// Consensus never inspects the contents; the [`Executor`](crate::app::Executor) decodes them
/// after commit.
#[derive(Clone, PartialEq, Eq, Debug, Default, BorshDeserialize, BorshSerialize)]
pub struct Command(Vec<u8>);

impl Command {
    /// Create a new `Command` wrapping `bytes`.
    pub fn new(bytes: Vec<u8>) -> Command {
        Command(bytes)
    }

    /// Get a reference to the inner bytes of this `Command`.
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the command is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A block in the block tree.
///
/// Blocks are immutable once constructed: `hash` is computed over the other identifying fields at
/// construction time, and every copy of a block with the same contents has the same hash.
///
/// # Invariant
///
/// `view > justify.view`, except for the genesis block, whose `justify` is the
/// [genesis QC](QuorumCertificate::genesis_qc).
#[derive(Clone, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Block {
    /// Hash of the parent block; the empty sentinel for the genesis block.
    pub parent: CryptoHash,

    /// Quorum certificate for the parent block.
    pub justify: QuorumCertificate,

    /// The command this block orders.
    pub cmd: Command,

    /// The view in which this block was proposed.
    pub view: ViewNumber,

    /// The replica that proposed this block.
    pub proposer: ReplicaID,

    /// Proposal wall-clock time in seconds since the Unix epoch. Not part of the block hash.
    pub timestamp: u64,

    /// Content hash over `(parent, cmd, view, proposer, justify.block)`.
    pub hash: CryptoHash,
}

impl Block {
    /// Create a new block, computing its content hash.
    pub fn new(
        parent: CryptoHash,
        justify: QuorumCertificate,
        cmd: Command,
        view: ViewNumber,
        proposer: ReplicaID,
        timestamp: u64,
    ) -> Block {
        let hash = Block::compute_hash(&parent, &cmd, view, proposer, &justify.block);
        Block {
            parent,
            justify,
            cmd,
            view,
            proposer,
            timestamp,
            hash,
        }
    }

    /// The deterministic genesis block: view 0, empty parent, empty command, genesis QC.
    pub fn genesis() -> Block {
        Block::new(
            CryptoHash::zero(),
            QuorumCertificate::genesis_qc(),
            Command::default(),
            ViewNumber::init(),
            ReplicaID::new(0),
            0,
        )
    }

    /// Whether this block is the genesis block.
    pub fn is_genesis(&self) -> bool {
        self.view == ViewNumber::init() && self.justify.is_genesis_qc()
    }

    /// Recompute the content hash and compare with the stored one. Used to validate blocks
    /// received from the network before any further processing.
    pub fn is_correct_hash(&self) -> bool {
        self.hash
            == Block::compute_hash(
                &self.parent,
                &self.cmd,
                self.view,
                self.proposer,
                &self.justify.block,
            )
    }

    fn compute_hash(
        parent: &CryptoHash,
        cmd: &Command,
        view: ViewNumber,
        proposer: ReplicaID,
        justify_block: &CryptoHash,
    ) -> CryptoHash {
        let preimage = (parent, cmd, view, proposer, justify_block)
            .try_to_vec()
            .expect("in-memory borsh serialization cannot fail");
        let mut hasher = Sha256::new();
        hasher.update(&preimage);
        CryptoHash::new(hasher.finalize().into())
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("view", &self.view)
            .field("proposer", &self.proposer)
            .field("hash", &self.hash)
            .field("parent", &self.parent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_content_addressed() {
        let a = Block::new(
            CryptoHash::zero(),
            QuorumCertificate::genesis_qc(),
            Command::new(vec![1, 2, 3]),
            ViewNumber::new(1),
            ReplicaID::new(0),
            42,
        );
        let b = Block::new(
            CryptoHash::zero(),
            QuorumCertificate::genesis_qc(),
            Command::new(vec![1, 2, 3]),
            ViewNumber::new(1),
            ReplicaID::new(0),
            // A different timestamp does not change the content hash.
            43,
        );
        let c = Block::new(
            CryptoHash::zero(),
            QuorumCertificate::genesis_qc(),
            Command::new(vec![1, 2, 4]),
            ViewNumber::new(1),
            ReplicaID::new(0),
            42,
        );
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
        assert!(a.is_correct_hash());
    }

    #[test]
    fn encode_decode_is_identity() {
        let block = Block::new(
            CryptoHash::new([7; 32]),
            QuorumCertificate::genesis_qc(),
            Command::new(b"batch".to_vec()),
            ViewNumber::new(9),
            ReplicaID::new(3),
            1_700_000_000,
        );
        let bytes = block.try_to_vec().unwrap();
        let decoded = Block::deserialize(&mut bytes.as_slice()).unwrap();
        assert_eq!(block, decoded);
    }
}
