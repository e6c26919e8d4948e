/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The seams between consensus and the application it replicates.
//!
//! The consensus driver never interprets commands; it hands them across these traits. The
//! [`Ledger`](crate::ledger::Ledger) implements [`Executor`] and [`ForkHandler`] over the EVM
//! state engine, and the [`Mempool`](crate::mempool::Mempool) implements [`Acceptor`] and
//! [`CommandQueue`]; library users may substitute their own.

use std::time::Instant;

use crate::types::basic::{ReplicaID, ViewNumber};
use crate::types::block::{Block, Command};
use crate::types::validator_set::ValidatorSet;

/// Applies committed blocks to the application state.
///
/// `exec` is called exactly once per committed block, in parent-first order. It must be
/// deterministic: every honest replica executing the same block sequence must arrive at the same
/// state.
pub trait Executor {
    fn exec(&mut self, block: &Block);
}

/// Receives blocks that were abandoned by a commit to a competing branch.
///
/// Each forked block is delivered exactly once. Rolling back any effects speculatively attached
/// to the forked block (e.g. returning its transactions to the mempool) is the handler's
/// responsibility, not the consensus driver's.
pub trait ForkHandler {
    fn fork(&mut self, block: &Block);
}

/// Admission control over commands, consulted before this replica votes for a proposal.
pub trait Acceptor {
    /// Informs the acceptor that `cmd` was included in the parent of the block currently being
    /// considered, so it will not be proposed again.
    fn proposed(&mut self, cmd: &Command);

    /// Whether this replica is willing to vote for a block carrying `cmd`.
    fn accept(&mut self, cmd: &Command) -> bool;
}

/// Supplies the command a leader proposes.
pub trait CommandQueue {
    /// Get the next command, waiting until one is available or `deadline` passes. Returns `None`
    /// on deadline or shutdown.
    fn get(&mut self, deadline: Instant) -> Option<Command>;
}

/// Deterministically maps a view to its leader. Every honest replica must compute the same
/// leader for the same view and validator set, so the whole replica set must be assembled with
/// the same policy. The policy is supplied to
/// [`Replica::start`](crate::replica::Replica::start); [`RoundRobin`] is the default choice.
pub trait LeaderRotation: Send + 'static {
    fn leader(&self, view: ViewNumber, validator_set: &ValidatorSet) -> ReplicaID;
}

/// The default leader rotation policy: leaders rotate round-robin through the validator set in
/// `ReplicaID` order.
#[derive(Clone, Copy, Debug, Default)]
pub struct RoundRobin;

impl LeaderRotation for RoundRobin {
    fn leader(&self, view: ViewNumber, validator_set: &ValidatorSet) -> ReplicaID {
        let position = (view.int() % validator_set.len() as u64) as usize;
        validator_set
            .member_at(position)
            .expect("validator set cannot be empty")
            .0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    #[test]
    fn round_robin_cycles_through_ids() {
        let vs = ValidatorSet::new(
            (0..4u32)
                .map(|i| {
                    let key = SigningKey::from_bytes(&[i as u8 + 1; 32]).verifying_key();
                    (ReplicaID::new(i), key)
                })
                .collect(),
        );
        let rotation = RoundRobin;
        for view in 0..12u64 {
            assert_eq!(
                rotation.leader(ViewNumber::new(view), &vs),
                ReplicaID::new((view % 4) as u32)
            );
        }
    }
}
