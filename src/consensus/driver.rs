/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consensus driver: proposes when leader, votes on valid proposals, and triggers commits.
//!
//! The driver composes a [`Rules`] variant at startup and runs the view-independent part of the
//! protocol: certificate verification, leader checks, command admission, the `last_vote` safety
//! guard (persisted before any vote leaves the replica), block commitment in parent-first order,
//! and prune/fork extraction after each commit.
//!
//! All methods run on the replica's event loop. Methods that must reach other replicas take the
//! network as a parameter; methods that advance the view return the
//! [`SyncInfo`] for the caller to route into the
//! [`Synchronizer`](crate::synchronizer::Synchronizer), preserving the protocol's prescribed
//! ordering of commit → advance → vote.

use std::time::Instant;

use crate::app::{Acceptor, CommandQueue, Executor, ForkHandler, LeaderRotation};
use crate::block_store::BlockStore;
use crate::consensus::rules::Rules;
use crate::kv_store::KVStore;
use crate::logging::{self, now_secs, short_hash};
use crate::messages::{Message, PartialCert, ProposeMsg, SyncInfo, VoteMsg};
use crate::networking::Network;
use crate::state_store::StateStore;
use crate::types::basic::{ChainID, ReplicaID, ViewNumber};
use crate::types::block::Block;
use crate::types::certificates::{Certificate, QuorumCertificate};
use crate::types::collectors::VoteCollector;
use crate::types::keypair::Keypair;
use crate::types::validator_set::ValidatorSet;

/// Immutable parameters of the [`Consensus`] driver.
pub(crate) struct ConsensusConfiguration {
    pub(crate) chain_id: ChainID,
    pub(crate) keypair: Keypair,
    pub(crate) id: ReplicaID,
    pub(crate) use_agg_qc: bool,
}

/// What [`Consensus::on_propose`] instructs the event loop to do next: first feed `advance` to
/// the synchronizer, then deliver `vote` to its target (or back to the driver, when the target
/// is this replica).
pub(crate) struct OnProposeOutcome {
    pub(crate) advance: Option<SyncInfo>,
    pub(crate) vote: Option<(ReplicaID, VoteMsg)>,
}

pub(crate) struct Consensus<K: KVStore, R: Rules<K>, L: LeaderRotation> {
    config: ConsensusConfiguration,
    rules: R,
    leader_rotation: L,
    validator_set: ValidatorSet,
    block_store: BlockStore<K>,
    state_store: StateStore<K>,
    vote_collector: VoteCollector,

    /// The highest view this replica has voted in. Persisted before every vote send.
    last_vote: ViewNumber,

    /// The most recently executed block.
    b_exec: Block,

    /// Set when an invariant violation is detected in a release build. A halted driver rejects
    /// every event until the operator intervenes.
    halted: bool,
}

impl<K: KVStore, R: Rules<K>, L: LeaderRotation> Consensus<K, R, L> {
    /// Create the driver, reloading `last_vote` and the committed block from the state store.
    pub(crate) fn new(
        config: ConsensusConfiguration,
        rules: R,
        leader_rotation: L,
        validator_set: ValidatorSet,
        block_store: BlockStore<K>,
        state_store: StateStore<K>,
        init_view: ViewNumber,
    ) -> Consensus<K, R, L> {
        let last_vote = state_store.last_vote().unwrap_or_else(|err| {
            log::error!("Consensus, failed to load last vote: {}", err);
            ViewNumber::init()
        });

        let b_exec = match state_store.committed_hash() {
            Ok(hash) => match block_store.local_get(&hash) {
                Some(block) => block,
                None => {
                    log::warn!(
                        "Consensus, committed block {} not found locally, using genesis",
                        short_hash(&hash)
                    );
                    Block::genesis()
                }
            },
            Err(err) => {
                log::error!("Consensus, failed to load committed block hash: {}", err);
                Block::genesis()
            }
        };

        log::info!(
            "Consensus, loaded state, last_vote={}, committed={}",
            last_vote,
            short_hash(&b_exec.hash)
        );

        let vote_collector =
            VoteCollector::new(config.chain_id, init_view, validator_set.clone());

        Consensus {
            config,
            rules,
            leader_rotation,
            validator_set,
            block_store,
            state_store,
            vote_collector,
            last_vote,
            b_exec,
            halted: false,
        }
    }

    /// The most recently executed block.
    pub(crate) fn committed_block(&self) -> &Block {
        &self.b_exec
    }

    /// Whether the driver has halted after an invariant violation.
    pub(crate) fn halted(&self) -> bool {
        self.halted
    }

    /// How many consecutive in-view blocks the active variant requires for a commit.
    pub(crate) fn chain_length(&self) -> usize {
        self.rules.chain_length()
    }

    /// Refresh the vote collector on entering `view`. Votes for other views no longer count.
    pub(crate) fn enter_view(&mut self, view: ViewNumber) {
        if self.vote_collector.view() != view {
            self.vote_collector =
                VoteCollector::new(self.config.chain_id, view, self.validator_set.clone());
        }
    }

    /// Ensure that no vote happens in a view earlier than `view`. Persisted immediately: the
    /// guarantee must hold across a crash.
    pub(crate) fn stop_voting(&mut self, view: ViewNumber) {
        if self.last_vote < view {
            self.last_vote = view;
            self.state_store.set_last_vote(view);
        }
    }

    /// Leader-only. Pull a command from the queue (waiting at most until `cmd_deadline`), build
    /// a block on `cert`'s QC, store it, broadcast it, and return the proposal for
    /// self-processing.
    pub(crate) fn propose<N: Network>(
        &mut self,
        cert: &SyncInfo,
        current_view: ViewNumber,
        cmd_deadline: Instant,
        command_queue: &mut impl CommandQueue,
        acceptor: &mut impl Acceptor,
        network: &mut N,
    ) -> Option<ProposeMsg> {
        if self.halted {
            return None;
        }
        log::debug!("Propose, view {}", current_view);

        let qc = cert
            .qc
            .clone()
            .unwrap_or_else(QuorumCertificate::genesis_high_qc);

        // Tell the acceptor that the previous proposal succeeded, so its command is not
        // re-proposed.
        if let Some(qc_block) = self.block_store.get(&qc.block, &*network) {
            acceptor.proposed(&qc_block.cmd);
        } else {
            log::error!("Propose, could not find block for QC {}", short_hash(&qc.block));
        }

        let cmd = match command_queue.get(cmd_deadline) {
            Some(cmd) => cmd,
            None => {
                log::debug!("Propose, no command");
                return None;
            }
        };

        let block = Block::new(
            qc.block,
            qc,
            cmd,
            current_view,
            self.config.id,
            now_secs(),
        );

        let agg_qc = if self.config.use_agg_qc {
            cert.agg_qc.clone()
        } else {
            None
        };

        self.block_store.store(&block);

        let proposal = ProposeMsg {
            proposer: self.config.id,
            block,
            agg_qc,
        };
        log::info!(
            "{}, {}, {}, {}",
            logging::PROPOSE,
            now_secs(),
            short_hash(&proposal.block.hash),
            proposal.block.view
        );
        network.broadcast(Message::Propose(proposal.clone()));

        Some(proposal)
    }

    /// Process an incoming (or self-produced) proposal.
    ///
    /// Invalid proposals (bad QC, wrong leader, failed vote rule, rejected command) are logged
    /// at info and dropped without any state change.
    pub(crate) fn on_propose<N: Network, A: Executor + ForkHandler>(
        &mut self,
        proposal: ProposeMsg,
        origin: ReplicaID,
        current_view: ViewNumber,
        acceptor: &mut impl Acceptor,
        app: &mut A,
        network: &mut N,
    ) -> OnProposeOutcome {
        const NO_ACTION: OnProposeOutcome = OnProposeOutcome {
            advance: None,
            vote: None,
        };

        if self.halted {
            return NO_ACTION;
        }

        let block = &proposal.block;
        log::debug!(
            "{}, {}, {}, {}",
            logging::RECEIVE_PROPOSAL,
            origin,
            short_hash(&block.hash),
            block.view
        );

        // 1. The block must be content-addressed correctly, and claimed by its sender.
        if origin != proposal.proposer || !block.is_correct_hash() {
            log::info!("OnPropose, malformed proposal");
            return NO_ACTION;
        }

        // 2. If an AggregateQC is attached, its verified high QC must equal the block's QC.
        if self.config.use_agg_qc {
            if let Some(agg_qc) = &proposal.agg_qc {
                match agg_qc.verify(&self.validator_set) {
                    Some(high_qc) if high_qc == block.justify => {}
                    Some(_) => {
                        log::info!("OnPropose, block QC does not equal aggregate high QC");
                        return NO_ACTION;
                    }
                    None => {
                        log::info!("OnPropose, failed to verify aggregate QC");
                        return NO_ACTION;
                    }
                }
            }
        }

        // 3. The block's QC must be correct.
        if !block.justify.is_correct(&self.validator_set) {
            log::info!("OnPropose, invalid QC");
            return NO_ACTION;
        }

        // 4. The block must come from the leader of its view.
        if proposal.proposer != self.leader_rotation.leader(block.view, &self.validator_set) {
            log::info!(
                "OnPropose, block was not proposed by the expected leader of view {}",
                block.view
            );
            return NO_ACTION;
        }

        // 5. Apply the variant's vote rule.
        if !self
            .rules
            .vote_rule(&proposal, current_view, &mut self.block_store, &*network)
        {
            log::info!("OnPropose, block not voted for");
            return NO_ACTION;
        }

        // 6. Mark the parent command proposed and ask the acceptor to admit this command.
        if let Some(qc_block) = self.block_store.get(&block.justify.block, &*network) {
            acceptor.proposed(&qc_block.cmd);
        } else {
            log::info!("OnPropose, failed to fetch QC block");
        }

        if !acceptor.accept(&block.cmd) {
            log::info!("OnPropose, command not accepted");
            return NO_ACTION;
        }

        // 7. The block is safe and accepted: store it.
        self.block_store.store(block);
        log::debug!(
            "{}, {}, {}, {}",
            logging::INSERT_BLOCK,
            now_secs(),
            short_hash(&block.hash),
            block.view
        );

        // 8. Apply the commit rule; commit the decided ancestor, if any.
        let block = proposal.block;
        if let Some(ancestor) = self
            .rules
            .commit_rule(&block, &mut self.block_store, &*network)
        {
            self.commit(&ancestor, app, &*network);
        }

        // 9. The caller advances the view with the block's QC before the vote is delivered.
        let advance = Some(SyncInfo::new().with_qc(block.justify.clone()));

        // 10. The last-vote guard: never vote twice in one view, across crashes included. The
        //     new `last_vote` is persisted before the vote leaves this replica.
        if block.view <= self.last_vote {
            log::info!("OnPropose, block view {} too old to vote", block.view);
            return OnProposeOutcome {
                advance,
                vote: None,
            };
        }
        self.last_vote = block.view;
        self.state_store.set_last_vote(block.view);

        // 11. Sign and address the vote to the leader of the next view.
        let partial_cert = PartialCert::new(
            &self.config.keypair,
            self.config.chain_id,
            block.view,
            block.hash,
        );
        let vote = VoteMsg {
            id: self.config.id,
            partial_cert,
        };
        let next_leader = self
            .leader_rotation
            .leader(self.last_vote + 1, &self.validator_set);
        log::info!(
            "{}, {}, {}, {}",
            logging::VOTE,
            now_secs(),
            short_hash(&block.hash),
            block.view
        );

        OnProposeOutcome {
            advance,
            vote: Some((next_leader, vote)),
        }
    }

    /// Process a vote. Returns the `SyncInfo` to advance the view with when the vote completes
    /// a quorum certificate.
    pub(crate) fn on_vote(&mut self, origin: ReplicaID, vote: &VoteMsg) -> Option<SyncInfo> {
        if self.halted {
            return None;
        }
        if origin != vote.id {
            log::info!("OnVote, sender {} does not match vote id {}", origin, vote.id);
            return None;
        }
        log::debug!(
            "{}, {}, {}, {}",
            logging::RECEIVE_VOTE,
            origin,
            short_hash(&vote.partial_cert.block),
            vote.partial_cert.view
        );

        let qc = self.vote_collector.collect(vote.id, &vote.partial_cert)?;
        log::info!(
            "{}, {}, {}, {}",
            logging::COLLECT_QC,
            now_secs(),
            short_hash(&qc.block),
            qc.view
        );
        Some(SyncInfo::new().with_qc(qc))
    }

    /// Commit `block`: execute the chain of uncommitted ancestors in parent-first order, persist
    /// the committed hash, then prune abandoned branches and hand each forked block to the fork
    /// handler.
    fn commit<N: Network, A: Executor + ForkHandler>(
        &mut self,
        block: &Block,
        app: &mut A,
        network: &N,
    ) {
        // Walk parents into a stack first, then execute from oldest to newest. Bounded by the
        // committed gap.
        let mut chain = Vec::new();
        let mut cursor = block.clone();
        while cursor.view > self.b_exec.view {
            chain.push(cursor.clone());
            match self.block_store.get(&cursor.parent, network) {
                Some(parent) => cursor = parent,
                None => {
                    self.chain_gap(&cursor);
                    return;
                }
            }
        }

        for ancestor in chain.iter().rev() {
            log::debug!("Consensus, EXEC, {}, {}", short_hash(&ancestor.hash), ancestor.view);
            app.exec(ancestor);
            self.b_exec = ancestor.clone();
        }

        self.state_store.set_committed_hash(&block.hash);
        log::info!(
            "{}, {}, {}, {}",
            logging::COMMIT_BLOCK,
            now_secs(),
            short_hash(&block.hash),
            block.view
        );

        let forked = self.block_store.prune_to_height(block.view, &block.hash);
        for forked_block in forked {
            log::info!(
                "{}, {}, {}, {}",
                logging::FORK_BLOCK,
                now_secs(),
                short_hash(&forked_block.hash),
                forked_block.view
            );
            app.fork(&forked_block);
        }
    }

    /// A block's ancestor chain has a gap. Under the stored-before-voted invariant this cannot
    /// happen; treat it as an implementation bug.
    fn chain_gap(&mut self, block: &Block) {
        if cfg!(debug_assertions) {
            panic!(
                "invariant violation: missing ancestor {} of block {} during commit",
                block.parent, block.hash
            );
        }
        log::error!(
            "Consensus, invariant violation, missing ancestor {} during commit, halting",
            short_hash(&block.parent)
        );
        self.halted = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::app::RoundRobin;
    use crate::consensus::rules::ChainedHotStuff;
    use crate::kv_store::MemKVStore;
    use crate::networking::Fetcher;
    use crate::types::basic::CryptoHash;
    use crate::types::block::Command;
    use crate::types::collectors::VoteCollector;
    use ed25519_dalek::SigningKey;

    /// A network that records sends and knows no remote blocks.
    #[derive(Clone)]
    struct NullNetwork;

    impl Fetcher for NullNetwork {
        fn fetch(&self, _: CryptoHash, _: Duration) -> Option<Block> {
            None
        }
    }

    impl Network for NullNetwork {
        fn broadcast(&mut self, _: Message) {}
        fn send(&mut self, _: ReplicaID, _: Message) {}
        fn recv(&mut self) -> Option<(ReplicaID, Message)> {
            None
        }
    }

    /// Records executed and forked blocks.
    #[derive(Default)]
    struct RecordingApp {
        execs: Vec<CryptoHash>,
        forks: Vec<CryptoHash>,
    }

    impl crate::app::Executor for RecordingApp {
        fn exec(&mut self, block: &Block) {
            self.execs.push(block.hash);
        }
    }

    impl crate::app::ForkHandler for RecordingApp {
        fn fork(&mut self, block: &Block) {
            self.forks.push(block.hash);
        }
    }

    struct YesAcceptor;

    impl Acceptor for YesAcceptor {
        fn proposed(&mut self, _: &Command) {}
        fn accept(&mut self, _: &Command) -> bool {
            true
        }
    }

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

    fn make_qc(
        keypairs: &[Keypair],
        validator_set: &ValidatorSet,
        view: ViewNumber,
        block: CryptoHash,
    ) -> QuorumCertificate {
        let chain_id = ChainID::new(0);
        let mut collector = VoteCollector::new(chain_id, view, validator_set.clone());
        let mut qc = None;
        for (i, keypair) in keypairs.iter().enumerate().take(validator_set.quorum()) {
            let pc = PartialCert::new(keypair, chain_id, view, block);
            qc = collector.collect(ReplicaID::new(i as u32), &pc);
        }
        qc.expect("a quorum of votes forms a QC")
    }

    struct Harness {
        keypairs: Vec<Keypair>,
        validator_set: ValidatorSet,
        kv: MemKVStore,
        consensus: Consensus<MemKVStore, ChainedHotStuff<MemKVStore>, RoundRobin>,
        app: RecordingApp,
    }

    impl Harness {
        /// A driver for replica 0 of a four-replica set, over fresh (or reused) storage.
        fn new(kv: MemKVStore) -> Harness {
            let keypairs = keypairs(4);
            let validator_set = validator_set(&keypairs);
            let state_store = crate::state_store::StateStore::open(kv.clone());
            let block_store = BlockStore::open(kv.clone());
            let rules = ChainedHotStuff::new(state_store.clone(), &block_store);
            let consensus = Consensus::new(
                ConsensusConfiguration {
                    chain_id: ChainID::new(0),
                    keypair: keypairs[0].clone(),
                    id: ReplicaID::new(0),
                    use_agg_qc: false,
                },
                rules,
                RoundRobin,
                validator_set.clone(),
                block_store,
                state_store,
                ViewNumber::new(1),
            );
            Harness {
                keypairs,
                validator_set,
                kv,
                consensus,
                app: RecordingApp::default(),
            }
        }

        /// The proposal the (correct) leader of `view` makes on top of `parent`.
        fn proposal_on(&self, parent: &Block, view: u64) -> ProposeMsg {
            let view = ViewNumber::new(view);
            let justify = if parent.is_genesis() {
                QuorumCertificate::genesis_high_qc()
            } else {
                make_qc(&self.keypairs, &self.validator_set, parent.view, parent.hash)
            };
            let proposer = RoundRobin.leader(view, &self.validator_set);
            let block = Block::new(
                parent.hash,
                justify,
                Command::new(vec![view.int() as u8]),
                view,
                proposer,
                0,
            );
            ProposeMsg {
                proposer,
                block,
                agg_qc: None,
            }
        }

        fn deliver(&mut self, proposal: ProposeMsg) -> OnProposeOutcome {
            let view = proposal.block.view;
            self.consensus.enter_view(view);
            self.consensus.on_propose(
                proposal.clone(),
                proposal.proposer,
                view,
                &mut YesAcceptor,
                &mut self.app,
                &mut NullNetwork,
            )
        }
    }

    #[test]
    fn three_chain_commit_executes_the_tail_exactly_once() {
        let mut harness = Harness::new(MemKVStore::new());
        let genesis = Block::genesis();

        let p1 = harness.proposal_on(&genesis, 1);
        let b1 = p1.block.clone();
        let p2 = harness.proposal_on(&b1, 2);
        let b2 = p2.block.clone();
        let p3 = harness.proposal_on(&b2, 3);
        let b3 = p3.block.clone();
        let p4 = harness.proposal_on(&b3, 4);

        for proposal in [p1, p2, p3] {
            let outcome = harness.deliver(proposal);
            assert!(outcome.vote.is_some());
        }
        // Nothing above genesis is committed before the three-chain completes.
        assert!(harness.app.execs.is_empty());

        let outcome = harness.deliver(p4);
        assert!(outcome.vote.is_some());

        // B4 completes the chain B1 <- B2 <- B3, deciding B1.
        assert_eq!(harness.app.execs, vec![b1.hash]);
        let state_store = crate::state_store::StateStore::open(harness.kv.clone());
        assert_eq!(state_store.committed_hash().unwrap(), b1.hash);
        assert_eq!(state_store.last_vote().unwrap(), ViewNumber::new(4));
    }

    #[test]
    fn votes_go_to_the_leader_of_the_next_view() {
        let mut harness = Harness::new(MemKVStore::new());
        let genesis = Block::genesis();

        let outcome = harness.deliver(harness.proposal_on(&genesis, 1));
        let (target, vote) = outcome.vote.expect("replica votes for a valid proposal");
        assert_eq!(target, ReplicaID::new(2));
        assert_eq!(vote.partial_cert.view, ViewNumber::new(1));
    }

    #[test]
    fn restart_does_not_double_vote() {
        let kv = MemKVStore::new();
        let mut harness = Harness::new(kv.clone());
        let genesis = Block::genesis();

        let p1 = harness.proposal_on(&genesis, 1);
        let outcome = harness.deliver(p1.clone());
        assert!(outcome.vote.is_some());

        // "Crash" after the vote was persisted, then rebuild from the same storage and receive
        // the same proposal again.
        drop(harness.consensus);
        let mut harness = Harness::new(kv);
        let outcome = harness.deliver(p1);

        assert!(outcome.vote.is_none(), "a recovered replica must not re-vote");
        // The proposal is still useful for view advancement.
        assert!(outcome.advance.is_some());
    }

    #[test]
    fn wrong_leader_is_rejected() {
        let mut harness = Harness::new(MemKVStore::new());
        let genesis = Block::genesis();

        let mut proposal = harness.proposal_on(&genesis, 1);
        proposal.proposer = ReplicaID::new(3);
        let hash = proposal.block.hash;
        let outcome = harness.deliver(proposal);

        assert!(outcome.vote.is_none());
        assert!(outcome.advance.is_none());
        assert!(harness.consensus.committed_block().is_genesis());
        assert!(!harness.consensus.block_store.contains(&hash));
    }

    #[test]
    fn sub_quorum_qc_is_rejected() {
        let mut harness = Harness::new(MemKVStore::new());
        let genesis = Block::genesis();

        let p1 = harness.proposal_on(&genesis, 1);
        let b1 = p1.block.clone();
        harness.deliver(p1);

        // Strip the proposal's QC down to 2f signatures; it no longer verifies for n = 4.
        let mut p2 = harness.proposal_on(&b1, 2);
        let mut weak_qc = p2.block.justify.clone();
        weak_qc.signatures.set(2, None);
        assert_eq!(weak_qc.signatures.count(), 2);
        p2.block = Block::new(
            p2.block.parent,
            weak_qc,
            p2.block.cmd.clone(),
            p2.block.view,
            p2.block.proposer,
            p2.block.timestamp,
        );

        let outcome = harness.deliver(p2);
        assert!(outcome.vote.is_none());
        assert!(outcome.advance.is_none());
    }

    #[test]
    fn fork_is_extracted_exactly_once_on_commit() {
        let mut harness = Harness::new(MemKVStore::new());
        let genesis = Block::genesis();

        let p1 = harness.proposal_on(&genesis, 1);
        let b1 = p1.block.clone();
        harness.deliver(p1);

        // A competing block at view 2 that will be abandoned. Stored directly, as if it had
        // arrived before its branch lost.
        let forked = Block::new(
            b1.hash,
            make_qc(
                &harness.keypairs,
                &harness.validator_set,
                b1.view,
                b1.hash,
            ),
            Command::new(b"forked".to_vec()),
            ViewNumber::new(2),
            ReplicaID::new(2),
            0,
        );
        harness.consensus.block_store.store(&forked);

        // The winning branch skips view 2: B3 on B1, then B4, B5, B6 complete a three-chain
        // committing B3 at height 3... with the fork at view 2 left behind.
        let p3 = harness.proposal_on(&b1, 3);
        let b3 = p3.block.clone();
        let p4 = harness.proposal_on(&b3, 4);
        let b4 = p4.block.clone();
        let p5 = harness.proposal_on(&b4, 5);
        let b5 = p5.block.clone();
        let p6 = harness.proposal_on(&b5, 6);

        for proposal in [p3, p4, p5, p6] {
            harness.deliver(proposal);
        }

        assert_eq!(harness.app.execs, vec![b1.hash, b3.hash]);
        assert_eq!(harness.app.forks, vec![forked.hash]);
    }
}
