/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The set of replicas that vote in consensus, and the quorum arithmetic over it.
//!
//! Replicas are identified by a small dense [`ReplicaID`] assigned at configuration time, and
//! authenticated by an Ed25519 [`VerifyingKey`]. The set tolerates `f = (n - 1) / 3` Byzantine
//! members; certificates require signatures from at least `2f + 1` distinct members.

use ed25519_dalek::VerifyingKey;
use indexmap::IndexMap;

use crate::types::basic::ReplicaID;

/// An identity-ordered map from [`ReplicaID`] to [`VerifyingKey`].
///
/// Iteration order is insertion order, which [`ValidatorSet::new`] fixes to ascending `ReplicaID`.
/// The position of a replica in this order is the position of its signature in a
/// [`SignatureSet`](crate::types::basic::SignatureSet).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ValidatorSet {
    members: IndexMap<ReplicaID, VerifyingKey>,
}

impl ValidatorSet {
    /// Create a validator set from `(id, key)` pairs. The pairs are sorted by `ReplicaID` so that
    /// every replica derives the same positions regardless of configuration order.
    pub fn new(mut members: Vec<(ReplicaID, VerifyingKey)>) -> ValidatorSet {
        members.sort_by_key(|(id, _)| *id);
        ValidatorSet {
            members: members.into_iter().collect(),
        }
    }

    /// The number of validators in the set.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The maximum number of Byzantine members tolerated: `f = (n - 1) / 3`.
    pub fn f(&self) -> usize {
        (self.members.len().saturating_sub(1)) / 3
    }

    /// The number of members whose signatures form a quorum: `2f + 1`.
    pub fn quorum(&self) -> usize {
        2 * self.f() + 1
    }

    /// Get the verifying key of the replica identified by `id`.
    pub fn key(&self, id: ReplicaID) -> Option<&VerifyingKey> {
        self.members.get(&id)
    }

    /// Get the position of `id` in the set's iteration order.
    pub fn position(&self, id: ReplicaID) -> Option<usize> {
        self.members.get_index_of(&id)
    }

    /// Get the `(id, key)` pair at `position`.
    pub fn member_at(&self, position: usize) -> Option<(ReplicaID, &VerifyingKey)> {
        self.members
            .get_index(position)
            .map(|(id, key)| (*id, key))
    }

    /// Whether `id` identifies a member of the set.
    pub fn contains(&self, id: ReplicaID) -> bool {
        self.members.contains_key(&id)
    }

    /// Iterate over the members in position order.
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaID, &VerifyingKey)> {
        self.members.iter().map(|(id, key)| (*id, key))
    }

    /// Iterate over the replica IDs in position order.
    pub fn ids(&self) -> impl Iterator<Item = ReplicaID> + '_ {
        self.members.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> VerifyingKey {
        use ed25519_dalek::SigningKey;
        SigningKey::from_bytes(&[seed; 32]).verifying_key()
    }

    #[test]
    fn quorum_sizes() {
        for (n, f, quorum) in [(1, 0, 1), (3, 0, 1), (4, 1, 3), (7, 2, 5), (10, 3, 7)] {
            let vs = ValidatorSet::new(
                (0..n)
                    .map(|i| (ReplicaID::new(i), key(i as u8)))
                    .collect(),
            );
            assert_eq!(vs.f(), f);
            assert_eq!(vs.quorum(), quorum);
        }
    }

    #[test]
    fn positions_are_sorted_by_id() {
        let vs = ValidatorSet::new(vec![
            (ReplicaID::new(2), key(2)),
            (ReplicaID::new(0), key(0)),
            (ReplicaID::new(1), key(1)),
        ]);
        assert_eq!(vs.position(ReplicaID::new(0)), Some(0));
        assert_eq!(vs.position(ReplicaID::new(1)), Some(1));
        assert_eq!(vs.position(ReplicaID::new(2)), Some(2));
    }
}
