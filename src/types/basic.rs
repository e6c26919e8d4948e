/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes or numbers, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::Hash,
    ops::{Add, AddAssign, Sub},
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Number that uniquely identifies a blockchain.
///
/// Every block in the same block tree shares the same `ChainID`. All replicas that replicate the
/// same block tree must be configured to use the same `ChainID`: votes and certificates produced
/// for one chain are not valid on another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ChainID(u64);

impl ChainID {
    /// Create a new `ChainID` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the `u64` value of this `ChainID`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// View number. View 0 belongs to the genesis block; view 1 is the first view in which a block
/// can be proposed. Monotonically non-decreasing at every replica.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ViewNumber(u64);

impl ViewNumber {
    /// Create a new `ViewNumber` wrapping `int`.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the genesis `ViewNumber`, which is 0.
    pub const fn init() -> Self {
        Self(0)
    }

    /// Get the inner `u64` of this `ViewNumber`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Get the little-endian representation of the inner `u64` of this `ViewNumber`.
    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for ViewNumber {
    type Output = ViewNumber;

    fn add(self, rhs: u64) -> Self::Output {
        ViewNumber(self.0.add(rhs))
    }
}

impl AddAssign<u64> for ViewNumber {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

impl Sub<u64> for ViewNumber {
    type Output = ViewNumber;

    fn sub(self, rhs: u64) -> Self::Output {
        ViewNumber(self.0.sub(rhs))
    }
}

/// Small dense identifier assigned to each replica at configuration time.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ReplicaID(u32);

impl ReplicaID {
    /// Create a new `ReplicaID` wrapping `int`.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the inner `u32` of this `ReplicaID`.
    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for ReplicaID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// 32-byte cryptographic hash.
///
/// The all-zero hash is reserved as the "empty" sentinel: it names the (nonexistent) parent of the
/// genesis block, the block of the empty quorum certificate, and the root of an empty trie.
///
/// Consensus block hashes are SHA256 hashes; trie node, transaction, and code hashes are
/// Keccak-256 hashes. Both fit in this type; the two keyspaces never mix.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    BorshDeserialize,
    BorshSerialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    /// Create a new `CryptoHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The all-zero "empty" sentinel hash.
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Get the inner `[u8; 32]` value of this `CryptoHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Whether this hash is the empty sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "CryptoHash({})", self)
    }
}

/// Ed25519 digital signature bytes.
///
/// Produced using the [`ed25519_dalek`] crate, whose main definitions are re-exported from the
/// [`keypair`](super::keypair) module.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub(crate) const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes(..)")
    }
}

/// An ordered list of optional [`SignatureBytes`] from the same
/// [`ValidatorSet`](super::validator_set::ValidatorSet).
///
/// # Ordering
///
/// A signature produced by the validator at position `i` of the validator set must be placed at
/// position `i` of the `SignatureSet`. Collectors enforce this order; certificates depend on it
/// for verification.
#[derive(Clone, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureSet(Vec<Option<SignatureBytes>>);

impl SignatureSet {
    /// Create the empty `SignatureSet` that forms a part of the genesis quorum certificate.
    pub const fn genesis() -> Self {
        Self(Vec::new())
    }

    /// Create a new `SignatureSet` initially containing `len` `None`s.
    pub(crate) fn new(len: usize) -> Self {
        Self(vec![None; len])
    }

    /// Get a reference to the inner `Vec<Option<SignatureBytes>>` of this `SignatureSet`.
    pub const fn vec(&self) -> &Vec<Option<SignatureBytes>> {
        &self.0
    }

    /// Get an iterator over the `Option<SignatureBytes>`s in this `SignatureSet`.
    pub fn iter(&self) -> std::slice::Iter<'_, Option<SignatureBytes>> {
        self.0.iter()
    }

    /// Set the value at `pos` in this `SignatureSet` to be `signature`.
    ///
    /// # Panics
    ///
    /// Panics if `pos >= len`.
    pub(crate) fn set(&mut self, pos: usize, signature: Option<SignatureBytes>) {
        self.0[pos] = signature
    }

    /// Get the length of the inner vector. This corresponds to the size of the validator set the
    /// `SignatureSet` was built for, not to how many signatures have been collected; for the
    /// latter, use [`count`](Self::count).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the inner vector is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// How many positions hold a signature.
    pub fn count(&self) -> usize {
        self.0.iter().filter(|sig| sig.is_some()).count()
    }
}
