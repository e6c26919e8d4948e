/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Collectors that assemble individually signed messages into certificates.
//!
//! A collector is scoped to a single `(chain_id, view)` pair and a fixed validator set. The
//! consensus driver replaces its [`VoteCollector`] on every view change; the synchronizer builds
//! a [`TimeoutVoteCollector`] per view on demand.

use std::collections::HashMap;

use crate::messages::{PartialCert, TimeoutMsg};
use crate::types::basic::{ChainID, CryptoHash, ReplicaID, SignatureSet, ViewNumber};
use crate::types::certificates::{AggregateQC, QuorumCertificate, TimeoutCertificate};
use crate::types::validator_set::ValidatorSet;

/// Collects [`PartialCert`]s for blocks proposed in a single view into a
/// [`QuorumCertificate`].
///
/// Votes are grouped per block hash: competing proposals in the same view each accumulate their
/// own signature set, and the first to reach a quorum yields a certificate.
pub(crate) struct VoteCollector {
    chain_id: ChainID,
    view: ViewNumber,
    validator_set: ValidatorSet,
    signature_sets: HashMap<CryptoHash, SignatureSet>,
}

impl VoteCollector {
    /// Create a fresh collector for `view`.
    pub(crate) fn new(chain_id: ChainID, view: ViewNumber, validator_set: ValidatorSet) -> Self {
        Self {
            chain_id,
            view,
            validator_set,
            signature_sets: HashMap::new(),
        }
    }

    /// The view this collector collects votes for.
    pub(crate) fn view(&self) -> ViewNumber {
        self.view
    }

    /// Collect a vote from `signer`. Returns a new `QuorumCertificate` the first time the votes
    /// for a block reach a quorum.
    ///
    /// Votes are dropped without effect if the signer is not in the validator set, the vote is
    /// for a different view, the signature does not verify, or the signer already voted for this
    /// block.
    pub(crate) fn collect(
        &mut self,
        signer: ReplicaID,
        partial_cert: &PartialCert,
    ) -> Option<QuorumCertificate> {
        if partial_cert.view != self.view {
            return None;
        }
        let pos = self.validator_set.position(signer)?;
        let key = self.validator_set.key(signer)?;
        if !partial_cert.is_correct(key, self.chain_id) {
            return None;
        }

        let len = self.validator_set.len();
        let signatures = self
            .signature_sets
            .entry(partial_cert.block)
            .or_insert_with(|| SignatureSet::new(len));

        if signatures.vec()[pos].is_some() {
            return None;
        }
        signatures.set(pos, Some(partial_cert.signature));

        if signatures.count() >= self.validator_set.quorum() {
            let qc = QuorumCertificate {
                chain_id: self.chain_id,
                view: self.view,
                block: partial_cert.block,
                signatures: signatures.clone(),
            };
            // A quorum was reached once; further votes for this block must not mint a second
            // certificate.
            self.signature_sets.remove(&partial_cert.block);
            return Some(qc);
        }

        None
    }
}

/// Collects verified [`TimeoutMsg`]s for a single view into a [`TimeoutCertificate`] (and, when
/// message signatures are present, an [`AggregateQC`]).
///
/// The caller is responsible for having verified each message's view signature before collecting
/// it; the collector only tracks distinctness and quorum.
pub(crate) struct TimeoutVoteCollector {
    chain_id: ChainID,
    view: ViewNumber,
    validator_set: ValidatorSet,
    timeouts: HashMap<ReplicaID, TimeoutMsg>,
}

impl TimeoutVoteCollector {
    /// Create a fresh collector for `view`.
    pub(crate) fn new(chain_id: ChainID, view: ViewNumber, validator_set: ValidatorSet) -> Self {
        Self {
            chain_id,
            view,
            validator_set,
            timeouts: HashMap::new(),
        }
    }

    /// How many distinct timeout messages have been collected.
    pub(crate) fn len(&self) -> usize {
        self.timeouts.len()
    }

    /// Collect a verified timeout message. Returns a `TimeoutCertificate` (with an
    /// `AggregateQC` when every collected message carries an attestation) the first time the
    /// collected messages reach a quorum.
    pub(crate) fn collect(
        &mut self,
        timeout: TimeoutMsg,
    ) -> Option<(TimeoutCertificate, Option<AggregateQC>)> {
        if timeout.view != self.view || !self.validator_set.contains(timeout.id) {
            return None;
        }
        if self.timeouts.contains_key(&timeout.id) {
            return None;
        }
        self.timeouts.insert(timeout.id, timeout);

        if self.timeouts.len() < self.validator_set.quorum() {
            return None;
        }

        let mut signatures = SignatureSet::new(self.validator_set.len());
        for (id, timeout) in &self.timeouts {
            let pos = self
                .validator_set
                .position(*id)
                .expect("collected timeouts only come from validator set members");
            signatures.set(pos, Some(timeout.view_signature));
        }
        let tc = TimeoutCertificate {
            chain_id: self.chain_id,
            view: self.view,
            signatures,
        };

        let attestations: Vec<_> = self
            .timeouts
            .values()
            .filter_map(|timeout| timeout.attestation())
            .collect();
        let agg_qc = if attestations.len() >= self.validator_set.quorum() {
            Some(AggregateQC {
                chain_id: self.chain_id,
                view: self.view,
                attestations,
            })
        } else {
            None
        };

        Some((tc, agg_qc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::SyncInfo;
    use crate::types::certificates::Certificate;
    use crate::types::keypair::Keypair;
    use ed25519_dalek::SigningKey;

    fn keypairs(n: u8) -> Vec<Keypair> {
        (0..n)
            .map(|i| Keypair::new(SigningKey::from_bytes(&[i + 1; 32])))
            .collect()
    }

    fn validator_set(keypairs: &[Keypair]) -> ValidatorSet {
        ValidatorSet::new(
            keypairs
                .iter()
                .enumerate()
                .map(|(i, kp)| (ReplicaID::new(i as u32), kp.public()))
                .collect(),
        )
    }

    #[test]
    fn quorum_of_votes_forms_a_qc() {
        let chain_id = ChainID::new(0);
        let view = ViewNumber::new(5);
        let block = CryptoHash::new([9; 32]);
        let kps = keypairs(4);
        let vs = validator_set(&kps);
        let mut collector = VoteCollector::new(chain_id, view, vs.clone());

        for (i, kp) in kps.iter().enumerate().take(2) {
            let pc = PartialCert::new(kp, chain_id, view, block);
            assert!(collector.collect(ReplicaID::new(i as u32), &pc).is_none());
        }
        // The third vote completes the 2f+1 quorum for n = 4.
        let pc = PartialCert::new(&kps[2], chain_id, view, block);
        let qc = collector.collect(ReplicaID::new(2), &pc).unwrap();
        assert!(qc.is_correct(&vs));
        assert_eq!(qc.block, block);
        assert_eq!(qc.view, view);
    }

    #[test]
    fn duplicate_votes_do_not_count_twice() {
        let chain_id = ChainID::new(0);
        let view = ViewNumber::new(1);
        let block = CryptoHash::new([1; 32]);
        let kps = keypairs(4);
        let mut collector = VoteCollector::new(chain_id, view, validator_set(&kps));

        let pc = PartialCert::new(&kps[0], chain_id, view, block);
        for _ in 0..5 {
            assert!(collector.collect(ReplicaID::new(0), &pc).is_none());
        }
    }

    #[test]
    fn timeout_certificate_forms_at_exactly_quorum() {
        let chain_id = ChainID::new(0);
        let view = ViewNumber::new(3);
        let kps = keypairs(4);
        let vs = validator_set(&kps);
        let mut collector = TimeoutVoteCollector::new(chain_id, view, vs.clone());

        for (i, kp) in kps.iter().enumerate().take(2) {
            let msg = TimeoutMsg::new(
                kp,
                chain_id,
                ReplicaID::new(i as u32),
                view,
                SyncInfo::new(),
                false,
            );
            // 2f = 2 messages are not enough.
            assert!(collector.collect(msg).is_none());
        }
        let msg = TimeoutMsg::new(
            &kps[2],
            chain_id,
            ReplicaID::new(2),
            view,
            SyncInfo::new(),
            false,
        );
        let (tc, agg_qc) = collector.collect(msg).unwrap();
        assert!(tc.is_correct(&vs));
        assert!(agg_qc.is_none());
    }

    #[test]
    fn aggregate_qc_carries_highest_attested_qc() {
        let chain_id = ChainID::new(0);
        let view = ViewNumber::new(3);
        let kps = keypairs(4);
        let vs = validator_set(&kps);

        // Build a real QC for a block at view 2 so one attester can carry it.
        let block = CryptoHash::new([2; 32]);
        let qc_view = ViewNumber::new(2);
        let mut vote_collector = VoteCollector::new(chain_id, qc_view, vs.clone());
        let mut qc = None;
        for (i, kp) in kps.iter().enumerate().take(3) {
            let pc = PartialCert::new(kp, chain_id, qc_view, block);
            qc = vote_collector.collect(ReplicaID::new(i as u32), &pc);
        }
        let qc = qc.unwrap();

        let mut collector = TimeoutVoteCollector::new(chain_id, view, vs.clone());
        let mut formed = None;
        for (i, kp) in kps.iter().enumerate().take(3) {
            let sync_info = if i == 1 {
                SyncInfo::new().with_qc(qc.clone())
            } else {
                SyncInfo::new()
            };
            let msg = TimeoutMsg::new(kp, chain_id, ReplicaID::new(i as u32), view, sync_info, true);
            formed = collector.collect(msg);
        }
        let (_, agg_qc) = formed.unwrap();
        let verified = agg_qc.unwrap().verify(&vs).unwrap();
        assert_eq!(verified, qc);
    }
}
