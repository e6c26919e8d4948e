/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The safety/liveness rules that distinguish the consensus variants.
//!
//! A [`Rules`] implementation decides two things the driver cannot decide on its own: whether to
//! vote for a proposal, and whether a proposal's arrival lets an ancestor commit. Exactly one
//! variant is active per replica, chosen at startup:
//!
//! - [`ChainedHotStuff`]: the pipelined three-chain protocol. A block commits when three blocks
//!   link by consecutive parent references.
//! - [`SimpleHotStuff`]: the two-chain simplification (after Jehl's "Formal Verification of
//!   HotStuff"). A block commits when its child is certified in the immediately following view.
//!
//! Both variants maintain a locked block, persisted through the
//! [`StateStore`](crate::state_store::StateStore) before any action that depends on the new lock.

use crate::block_store::BlockStore;
use crate::kv_store::KVStore;
use crate::logging::short_hash;
use crate::messages::ProposeMsg;
use crate::networking::Fetcher;
use crate::state_store::StateStore;
use crate::types::basic::ViewNumber;
use crate::types::block::Block;
use crate::types::certificates::QuorumCertificate;

/// The capability set a consensus variant provides to the [driver](crate::consensus::driver).
pub trait Rules<K: KVStore> {
    /// Whether this replica should vote for `proposal`. Rejections are silent: the driver logs
    /// and drops.
    fn vote_rule<F: Fetcher>(
        &mut self,
        proposal: &ProposeMsg,
        current_view: ViewNumber,
        block_store: &mut BlockStore<K>,
        fetcher: &F,
    ) -> bool;

    /// Whether the arrival of `block` commits one of its ancestors. Returns the ancestor to be
    /// decided, if any. May update (and persist) the locked block as a side effect.
    fn commit_rule<F: Fetcher>(
        &mut self,
        block: &Block,
        block_store: &mut BlockStore<K>,
        fetcher: &F,
    ) -> Option<Block>;

    /// How many consecutive in-view blocks must link for a commit: 3 for chained, 2 for simple.
    fn chain_length(&self) -> usize;
}

/// Resolve the block a QC certifies. The empty sentinel hash (genesis QC) resolves to nothing.
fn qc_ref<K: KVStore, F: Fetcher>(
    qc: &QuorumCertificate,
    block_store: &mut BlockStore<K>,
    fetcher: &F,
) -> Option<Block> {
    if qc.block.is_zero() {
        return None;
    }
    block_store.get(&qc.block, fetcher)
}

/// Shared lock bookkeeping for both variants.
struct LockedBlock<K: KVStore> {
    state_store: StateStore<K>,
    block: Block,
}

impl<K: KVStore> LockedBlock<K> {
    /// Load the locked block recorded in the state store, falling back to genesis if the
    /// recorded block is not locally known.
    fn load(state_store: StateStore<K>, block_store: &BlockStore<K>) -> LockedBlock<K> {
        let block = match state_store.locked_hash() {
            Ok(hash) => match block_store.local_get(&hash) {
                Some(block) => block,
                None => {
                    log::warn!(
                        "Rules, locked block {} not found locally, using genesis",
                        short_hash(&hash)
                    );
                    Block::genesis()
                }
            },
            Err(err) => {
                log::error!("Rules, failed to load locked block hash: {}", err);
                Block::genesis()
            }
        };
        LockedBlock { state_store, block }
    }

    /// Raise the lock to `block` if its view is higher, persisting before returning.
    fn raise_to(&mut self, block: &Block) {
        if block.view > self.block.view {
            log::debug!(
                "Rules, {}, {}, {}",
                crate::logging::UPDATE_LOCKED,
                short_hash(&block.hash),
                block.view
            );
            self.block = block.clone();
            self.state_store.set_locked_hash(&block.hash);
        }
    }

    fn view(&self) -> ViewNumber {
        self.block.view
    }
}

/// The pipelined three-chain HotStuff variant.
pub struct ChainedHotStuff<K: KVStore> {
    locked: LockedBlock<K>,
}

impl<K: KVStore> ChainedHotStuff<K> {
    /// Create the variant, loading the persisted locked block.
    pub fn new(state_store: StateStore<K>, block_store: &BlockStore<K>) -> ChainedHotStuff<K> {
        ChainedHotStuff {
            locked: LockedBlock::load(state_store, block_store),
        }
    }
}

impl<K: KVStore> Rules<K> for ChainedHotStuff<K> {
    /// Vote iff the view of the block certified by the proposal's QC is higher than the locked
    /// view. This is the liveness condition; safety comes from the driver's `last_vote` guard.
    fn vote_rule<F: Fetcher>(
        &mut self,
        proposal: &ProposeMsg,
        _current_view: ViewNumber,
        block_store: &mut BlockStore<K>,
        fetcher: &F,
    ) -> bool {
        let justify = &proposal.block.justify;

        // Bootstrap: before anything is locked, blocks building directly on genesis are safe.
        if justify.is_genesis_qc() {
            return self.locked.view() == ViewNumber::init();
        }

        let qc_block = match qc_ref(justify, block_store, fetcher) {
            Some(block) => block,
            None => {
                log::info!("VoteRule, could not find block referenced by QC");
                return false;
            }
        };

        if qc_block.view <= self.locked.view() {
            log::info!(
                "VoteRule, liveness condition failed, qc block view {} <= locked view {}",
                qc_block.view,
                self.locked.view()
            );
            return false;
        }

        true
    }

    /// The three-chain commit rule. Let `b1 = block.justify.block`, `b2 = b1.justify.block`,
    /// `b3 = b2.justify.block`. Raise the lock to `b2` if its view is higher. If `b1`, `b2`,
    /// and `b3` link by consecutive parent references, `b3` is decided.
    fn commit_rule<F: Fetcher>(
        &mut self,
        block: &Block,
        block_store: &mut BlockStore<K>,
        fetcher: &F,
    ) -> Option<Block> {
        let b1 = qc_ref(&block.justify, block_store, fetcher)?;
        log::debug!("CommitRule, PRE_COMMIT, {}", short_hash(&b1.hash));

        let b2 = qc_ref(&b1.justify, block_store, fetcher)?;
        self.locked.raise_to(&b2);

        let b3 = qc_ref(&b2.justify, block_store, fetcher)?;

        if b1.parent == b2.hash && b2.parent == b3.hash {
            log::debug!("CommitRule, DECIDE, {}", short_hash(&b3.hash));
            return Some(b3);
        }

        None
    }

    fn chain_length(&self) -> usize {
        3
    }
}

/// The two-chain simplified HotStuff variant.
pub struct SimpleHotStuff<K: KVStore> {
    locked: LockedBlock<K>,
}

impl<K: KVStore> SimpleHotStuff<K> {
    /// Create the variant, loading the persisted locked block.
    pub fn new(state_store: StateStore<K>, block_store: &BlockStore<K>) -> SimpleHotStuff<K> {
        SimpleHotStuff {
            locked: LockedBlock::load(state_store, block_store),
        }
    }
}

impl<K: KVStore> Rules<K> for SimpleHotStuff<K> {
    /// Vote iff the proposal is for the current view or later and its parent is at least as
    /// recent as the locked block.
    fn vote_rule<F: Fetcher>(
        &mut self,
        proposal: &ProposeMsg,
        current_view: ViewNumber,
        block_store: &mut BlockStore<K>,
        fetcher: &F,
    ) -> bool {
        let block = &proposal.block;

        // Rule 1: can only vote in increasing rounds.
        if block.view < current_view {
            log::info!("VoteRule, block view {} too low", block.view);
            return false;
        }

        let parent = match qc_ref(&block.justify, block_store, fetcher) {
            Some(parent) => parent,
            None => {
                if block.justify.is_genesis_qc() {
                    return self.locked.view() == ViewNumber::init();
                }
                log::info!("VoteRule, missing parent block");
                return false;
            }
        };

        // Rule 2: the parent must be at least as recent as the locked block.
        if parent.view < self.locked.view() {
            log::info!(
                "VoteRule, parent view {} below locked view {}",
                parent.view,
                self.locked.view()
            );
            return false;
        }

        true
    }

    /// The two-chain commit rule. Let `p = block.justify.block` and `gp = p.justify.block`.
    /// Raise the lock to `p` if its view is higher. If `p` directly extends `gp` in the
    /// immediately following view, `gp` is decided.
    fn commit_rule<F: Fetcher>(
        &mut self,
        block: &Block,
        block_store: &mut BlockStore<K>,
        fetcher: &F,
    ) -> Option<Block> {
        let parent = qc_ref(&block.justify, block_store, fetcher)?;
        self.locked.raise_to(&parent);

        let grandparent = qc_ref(&parent.justify, block_store, fetcher)?;

        if parent.parent == grandparent.hash && parent.view == grandparent.view + 1 {
            log::debug!("CommitRule, COMMIT, {}", short_hash(&grandparent.hash));
            return Some(grandparent);
        }

        None
    }

    fn chain_length(&self) -> usize {
        2
    }
}

/// The variant a replica was configured with. One variant is active per replica; the enum exists
/// so assembly code does not need to be generic over the choice.
pub enum Variant<K: KVStore> {
    Chained(ChainedHotStuff<K>),
    Simple(SimpleHotStuff<K>),
}

impl<K: KVStore> Rules<K> for Variant<K> {
    fn vote_rule<F: Fetcher>(
        &mut self,
        proposal: &ProposeMsg,
        current_view: ViewNumber,
        block_store: &mut BlockStore<K>,
        fetcher: &F,
    ) -> bool {
        match self {
            Variant::Chained(rules) => rules.vote_rule(proposal, current_view, block_store, fetcher),
            Variant::Simple(rules) => rules.vote_rule(proposal, current_view, block_store, fetcher),
        }
    }

    fn commit_rule<F: Fetcher>(
        &mut self,
        block: &Block,
        block_store: &mut BlockStore<K>,
        fetcher: &F,
    ) -> Option<Block> {
        match self {
            Variant::Chained(rules) => rules.commit_rule(block, block_store, fetcher),
            Variant::Simple(rules) => rules.commit_rule(block, block_store, fetcher),
        }
    }

    fn chain_length(&self) -> usize {
        match self {
            Variant::Chained(rules) => rules.chain_length(),
            Variant::Simple(rules) => rules.chain_length(),
        }
    }
}
