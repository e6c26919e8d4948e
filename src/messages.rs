/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured messages that are sent between replicas.
//!
//! Four progress messages drive the protocol:
//! 1. [`ProposeMsg`]: broadcast by the leader of a view, proposing to extend the block tree.
//! 2. [`VoteMsg`]: sent by a validator to the leader of the next view, carrying a
//!    [`PartialCert`] over the proposed block.
//! 3. [`NewViewMsg`]: sent to the next leader when entering a new view, to update it on the
//!    sender's highest certificates.
//! 4. [`TimeoutMsg`]: broadcast when a view times out; a quorum of these forms a
//!    [`TimeoutCertificate`](crate::types::certificates::TimeoutCertificate).
//!
//! [`FetchRequest`]/[`FetchResponse`] form the block-fetch RPC used by the
//! [block store](crate::block_store) to resolve unknown ancestors.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{ChainID, CryptoHash, ReplicaID, SignatureBytes, ViewNumber};
use crate::types::block::Block;
use crate::types::certificates::{
    AggregateQC, QuorumCertificate, TimeoutAttestation, TimeoutCertificate,
};
use crate::types::keypair::{verify_signature, Keypair, VerifyingKey};

/// Progress messages exchanged between replicas. Transport-level authentication of the sender is
/// the responsibility of the [networking provider](crate::networking).
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub enum Message {
    Propose(ProposeMsg),
    Vote(VoteMsg),
    NewView(NewViewMsg),
    Timeout(TimeoutMsg),
}

impl Message {
    /// The view this message pertains to.
    pub fn view(&self) -> ViewNumber {
        match self {
            Message::Propose(propose) => propose.block.view,
            Message::Vote(vote) => vote.partial_cert.view,
            Message::NewView(new_view) => new_view.view,
            Message::Timeout(timeout) => timeout.view,
        }
    }
}

/// Broadcast by the leader of a view to propose a block.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct ProposeMsg {
    pub proposer: ReplicaID,
    pub block: Block,

    /// Attached only when the proposal follows a timeout and the replica set opted into
    /// aggregate QCs. Its verified high QC must equal `block.justify`.
    pub agg_qc: Option<AggregateQC>,
}

/// A single validator's signature over `(chain_id, view, block)`: one share of a future
/// [`QuorumCertificate`].
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct PartialCert {
    pub view: ViewNumber,
    pub block: CryptoHash,
    pub signature: SignatureBytes,
}

impl PartialCert {
    /// Sign a vote for `block` in `view` on `chain_id`.
    pub fn new(
        keypair: &Keypair,
        chain_id: ChainID,
        view: ViewNumber,
        block: CryptoHash,
    ) -> PartialCert {
        let message = QuorumCertificate::message_bytes(chain_id, view, &block);
        PartialCert {
            view,
            block,
            signature: keypair.sign(&message),
        }
    }

    /// Whether `signer` produced this partial certificate for `chain_id`.
    pub fn is_correct(&self, signer: &VerifyingKey, chain_id: ChainID) -> bool {
        let message = QuorumCertificate::message_bytes(chain_id, self.view, &self.block);
        verify_signature(signer, &message, &self.signature)
    }
}

/// Sent by a validator to the leader of the next view to vote for a proposal.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct VoteMsg {
    pub id: ReplicaID,
    pub partial_cert: PartialCert,
}

/// Sent to the leader of a newly entered view, updating it on the sender's highest certificates.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct NewViewMsg {
    pub id: ReplicaID,
    pub view: ViewNumber,
    pub sync_info: SyncInfo,
}

/// Broadcast when a view times out.
///
/// `view_signature` signs `(chain_id, view)` and is what a
/// [`TimeoutCertificate`] aggregates. `msg_signature`, present only when aggregate QCs are in
/// use, signs `(chain_id, view, high_qc)` and is what an
/// [`AggregateQC`] aggregates.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct TimeoutMsg {
    pub id: ReplicaID,
    pub view: ViewNumber,
    pub sync_info: SyncInfo,
    pub view_signature: SignatureBytes,
    pub msg_signature: Option<SignatureBytes>,
}

impl TimeoutMsg {
    /// Build and sign a timeout message for `view`.
    pub fn new(
        keypair: &Keypair,
        chain_id: ChainID,
        id: ReplicaID,
        view: ViewNumber,
        sync_info: SyncInfo,
        use_agg_qc: bool,
    ) -> TimeoutMsg {
        let view_signature = keypair.sign(&TimeoutCertificate::message_bytes(chain_id, view));
        let msg_signature = if use_agg_qc {
            let high_qc = sync_info.high_qc();
            Some(keypair.sign(&TimeoutAttestation::message_bytes(chain_id, view, &high_qc)))
        } else {
            None
        };

        TimeoutMsg {
            id,
            view,
            sync_info,
            view_signature,
            msg_signature,
        }
    }

    /// Whether `signer` produced this timeout message's view signature for `chain_id`.
    pub fn is_correct(&self, signer: &VerifyingKey, chain_id: ChainID) -> bool {
        let message = TimeoutCertificate::message_bytes(chain_id, self.view);
        verify_signature(signer, &message, &self.view_signature)
    }

    /// Convert this timeout message into its contribution to an [`AggregateQC`], if it carries a
    /// message signature.
    pub(crate) fn attestation(&self) -> Option<TimeoutAttestation> {
        self.msg_signature.map(|signature| TimeoutAttestation {
            id: self.id,
            high_qc: self.sync_info.high_qc(),
            signature,
        })
    }
}

/// The highest certificates known to a replica, passed around with proposals, new-views, and
/// timeouts so that lagging replicas can catch up.
#[derive(Clone, Debug, Default, BorshDeserialize, BorshSerialize)]
pub struct SyncInfo {
    pub qc: Option<QuorumCertificate>,
    pub tc: Option<TimeoutCertificate>,
    pub agg_qc: Option<AggregateQC>,
}

impl SyncInfo {
    /// A `SyncInfo` carrying nothing.
    pub fn new() -> SyncInfo {
        SyncInfo::default()
    }

    /// Attach a quorum certificate.
    pub fn with_qc(mut self, qc: QuorumCertificate) -> SyncInfo {
        self.qc = Some(qc);
        self
    }

    /// Attach a timeout certificate.
    pub fn with_tc(mut self, tc: TimeoutCertificate) -> SyncInfo {
        self.tc = Some(tc);
        self
    }

    /// Attach an aggregate QC.
    pub fn with_agg_qc(mut self, agg_qc: AggregateQC) -> SyncInfo {
        self.agg_qc = Some(agg_qc);
        self
    }

    /// The QC carried by this `SyncInfo`, or the genesis QC if it carries none.
    pub fn high_qc(&self) -> QuorumCertificate {
        self.qc.clone().unwrap_or_else(QuorumCertificate::genesis_qc)
    }
}

/// Request for the block identified by `hash`, served from the receiver's local block store.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct FetchRequest {
    pub hash: CryptoHash,
}

/// Response to a [`FetchRequest`]. `None` if the responder does not know the block.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct FetchResponse {
    pub block: Option<Block>,
}
