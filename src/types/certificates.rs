/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Certificates: evidence that a quorum of validators supports a given action.
//!
//! Three kinds are defined:
//! 1. [`QuorumCertificate`]: at least `2f + 1` validators voted for a block in a view.
//! 2. [`TimeoutCertificate`]: at least `2f + 1` validators timed out in a view.
//! 3. [`AggregateQC`]: a quorum of timeout attestations, each carrying the attester's highest
//!    known QC, used to carry the true high QC across a view change.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{ChainID, CryptoHash, ReplicaID, SignatureBytes, SignatureSet, ViewNumber};
use crate::types::keypair::verify_signature;
use crate::types::validator_set::ValidatorSet;

/// Minimal signature for types that serve as evidence that a quorum of validators supports a
/// given action. Correctness is checked against the validator set the certificate was formed in.
pub trait Certificate {
    fn is_correct(&self, validator_set: &ValidatorSet) -> bool;
}

/// Proof that at least a quorum of validators voted for `block` in `view`.
///
/// The signature at position `i` of `signatures` must come from the validator at position `i` of
/// the validator set, over the borsh encoding of `(chain_id, view, block)`.
#[derive(Clone, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct QuorumCertificate {
    pub chain_id: ChainID,
    pub view: ViewNumber,
    pub block: CryptoHash,
    pub signatures: SignatureSet,
}

impl QuorumCertificate {
    /// The empty QC carried by the genesis block. Its block hash is the empty sentinel and its
    /// signature set is empty.
    pub const fn genesis_qc() -> QuorumCertificate {
        QuorumCertificate {
            chain_id: ChainID::new(0),
            view: ViewNumber::init(),
            block: CryptoHash::zero(),
            signatures: SignatureSet::genesis(),
        }
    }

    /// The empty-signature QC over the genesis block. This is the high QC a replica starts
    /// with, and the QC the first proposal justifies itself by.
    pub fn genesis_high_qc() -> QuorumCertificate {
        QuorumCertificate {
            chain_id: ChainID::new(0),
            view: ViewNumber::init(),
            block: crate::types::block::Block::genesis().hash,
            signatures: SignatureSet::genesis(),
        }
    }

    /// Whether this is a genesis QC (the embedded one or the empty-signature QC over the
    /// genesis block).
    pub fn is_genesis_qc(&self) -> bool {
        self.signatures.is_empty() && self.view == ViewNumber::init()
    }

    /// The bytes a validator signs to vote for `(chain_id, view, block)`.
    pub(crate) fn message_bytes(
        chain_id: ChainID,
        view: ViewNumber,
        block: &CryptoHash,
    ) -> Vec<u8> {
        (chain_id, view, block)
            .try_to_vec()
            .expect("in-memory borsh serialization cannot fail")
    }
}

impl Certificate for QuorumCertificate {
    /// Checks that every present signature is correct and that the signatures form a quorum.
    ///
    /// The genesis QC is correct by definition.
    fn is_correct(&self, validator_set: &ValidatorSet) -> bool {
        if self.is_genesis_qc() {
            return true;
        }

        if self.signatures.len() != validator_set.len() {
            return false;
        }

        let message = QuorumCertificate::message_bytes(self.chain_id, self.view, &self.block);
        let mut signers = 0;
        for (pos, signature) in self.signatures.iter().enumerate() {
            if let Some(signature) = signature {
                let (_, key) = match validator_set.member_at(pos) {
                    Some(member) => member,
                    None => return false,
                };
                if !verify_signature(key, &message, signature) {
                    return false;
                }
                signers += 1;
            }
        }

        signers >= validator_set.quorum()
    }
}

impl std::fmt::Debug for QuorumCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuorumCertificate")
            .field("view", &self.view)
            .field("block", &self.block)
            .field("signers", &self.signatures.count())
            .finish()
    }
}

/// Proof that at least a quorum of validators have signed a timeout for `view`.
///
/// Signatures are over the borsh encoding of `(chain_id, view)`.
#[derive(Clone, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct TimeoutCertificate {
    pub chain_id: ChainID,
    pub view: ViewNumber,
    pub signatures: SignatureSet,
}

impl TimeoutCertificate {
    /// The empty TC materialized as a persistence default before any timeout has occurred.
    pub const fn empty() -> TimeoutCertificate {
        TimeoutCertificate {
            chain_id: ChainID::new(0),
            view: ViewNumber::init(),
            signatures: SignatureSet::genesis(),
        }
    }

    /// Whether this is the empty TC.
    pub fn is_empty_tc(&self) -> bool {
        self.signatures.is_empty()
    }

    /// The bytes a validator signs to attest a timeout of `view` on `chain_id`.
    pub(crate) fn message_bytes(chain_id: ChainID, view: ViewNumber) -> Vec<u8> {
        (chain_id, view)
            .try_to_vec()
            .expect("in-memory borsh serialization cannot fail")
    }
}

impl Certificate for TimeoutCertificate {
    /// Checks that every present signature is correct and that the signatures form a quorum. The
    /// empty TC is never correct: it only exists as a persistence default.
    fn is_correct(&self, validator_set: &ValidatorSet) -> bool {
        if self.signatures.len() != validator_set.len() {
            return false;
        }

        let message = TimeoutCertificate::message_bytes(self.chain_id, self.view);
        let mut signers = 0;
        for (pos, signature) in self.signatures.iter().enumerate() {
            if let Some(signature) = signature {
                let (_, key) = match validator_set.member_at(pos) {
                    Some(member) => member,
                    None => return false,
                };
                if !verify_signature(key, &message, signature) {
                    return false;
                }
                signers += 1;
            }
        }

        signers >= validator_set.quorum()
    }
}

impl std::fmt::Debug for TimeoutCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutCertificate")
            .field("view", &self.view)
            .field("signers", &self.signatures.count())
            .finish()
    }
}

/// One validator's contribution to an [`AggregateQC`]: its identity, its signature over
/// `(chain_id, view, high_qc)`, and the highest QC it knew when it timed out.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct TimeoutAttestation {
    pub id: ReplicaID,
    pub high_qc: QuorumCertificate,
    pub signature: SignatureBytes,
}

impl TimeoutAttestation {
    /// The bytes a validator signs to attest `(chain_id, view, high_qc)`.
    pub(crate) fn message_bytes(
        chain_id: ChainID,
        view: ViewNumber,
        high_qc: &QuorumCertificate,
    ) -> Vec<u8> {
        (chain_id, view, high_qc)
            .try_to_vec()
            .expect("in-memory borsh serialization cannot fail")
    }
}

/// A quorum of timeout attestations for `view`, each carrying the attester's high QC.
///
/// Unlike a [`TimeoutCertificate`], an `AggregateQC` proves not only that a quorum timed out, but
/// also what the highest QC known to that quorum was, so a new leader can propose on top of it
/// without waiting for further messages.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct AggregateQC {
    pub chain_id: ChainID,
    pub view: ViewNumber,
    pub attestations: Vec<TimeoutAttestation>,
}

impl AggregateQC {
    /// Verify the aggregate and return the highest QC it proves.
    ///
    /// Verification requires:
    /// 1. attestations from at least a quorum of distinct validators,
    /// 2. a correct signature on every attestation,
    /// 3. a correct embedded QC on the attestation carrying the highest QC view.
    ///
    /// Returns `None` if any requirement fails.
    pub fn verify(&self, validator_set: &ValidatorSet) -> Option<QuorumCertificate> {
        let mut seen: Vec<ReplicaID> = Vec::with_capacity(self.attestations.len());
        let mut high_qc: Option<&QuorumCertificate> = None;

        for attestation in &self.attestations {
            if seen.contains(&attestation.id) {
                return None;
            }
            let key = validator_set.key(attestation.id)?;
            let message =
                TimeoutAttestation::message_bytes(self.chain_id, self.view, &attestation.high_qc);
            if !verify_signature(key, &message, &attestation.signature) {
                return None;
            }
            seen.push(attestation.id);

            match high_qc {
                Some(qc) if qc.view >= attestation.high_qc.view => {}
                _ => high_qc = Some(&attestation.high_qc),
            }
        }

        if seen.len() < validator_set.quorum() {
            return None;
        }

        let high_qc = high_qc?;
        if !high_qc.is_correct(validator_set) {
            return None;
        }

        Some(high_qc.clone())
    }
}
