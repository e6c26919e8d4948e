/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Replica assembly and the single-threaded event loop.
//!
//! One logical event loop serializes every protocol state transition: network receives,
//! pacemaker ticks, proposal production, commits. The components it owns (consensus driver,
//! synchronizer, block store, ledger) are mutated only from this loop; the mempool is the one
//! shared structure, fed by outside producers and drained here.
//!
//! ## Suspension points
//!
//! The loop blocks in exactly two places, both bounded: waiting for a command while proposing
//! (until the view deadline) and waiting for a block fetch (5 seconds). Everything else is
//! non-blocking; the loop sleeps briefly when idle.
//!
//! ## Crash recovery
//!
//! On start, every component reloads its persisted invariants through the
//! [`StateStore`](crate::state_store::StateStore): the synchronizer resumes from
//! `current_view`/`high_qc`/`high_tc`, the driver from `last_vote`/`committed_hash`, the rules
//! from `locked_hash`. A replica that crashed after persisting `last_vote` but before sending
//! its vote will correctly refuse to vote again in that view.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::app::LeaderRotation;
use crate::block_store::BlockStore;
use crate::config::{Configuration, ConsensusVariant, ViewDurationConfig};
use crate::consensus::driver::{Consensus, ConsensusConfiguration};
use crate::consensus::rules::{ChainedHotStuff, SimpleHotStuff, Variant};
use crate::evm::Executor;
use crate::kv_store::KVStore;
use crate::ledger::Ledger;
use crate::mempool::transaction::Signer;
use crate::mempool::Mempool;
use crate::messages::{Message, ProposeMsg, SyncInfo};
use crate::networking::Network;
use crate::state_db::StateDb;
use crate::state_store::StateStore;
use crate::synchronizer::view_duration::{
    EwmaViewDuration, FixedViewDuration, ViewDuration,
};
use crate::synchronizer::{new_view_msg, EnterView, Synchronizer, SynchronizerConfiguration};
use crate::trie::database::NodeStore;
use crate::types::basic::{ReplicaID, ViewNumber};
use crate::types::validator_set::ValidatorSet;

/// How often the mempool expiry sweep runs.
const MEMPOOL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How long the loop sleeps when there was nothing to do.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// A running replica. Dropping it shuts the event loop down cleanly after draining events.
pub struct Replica {
    handle: Option<JoinHandle<()>>,
    shutdown: Sender<()>,
}

impl Replica {
    /// Materialize the protocol defaults (genesis block, initial protocol invariants) in
    /// `kv_store` without starting a replica. Useful for provisioning a data directory.
    pub fn initialize<K: KVStore>(kv_store: K) {
        let _ = StateStore::open(kv_store.clone());
        let _ = BlockStore::open(kv_store);
    }

    /// Assemble a replica over the given storage and networking providers and start its event
    /// loop.
    ///
    /// `mempool` is shared: the caller keeps its handle to submit transactions (e.g. from an
    /// RPC façade); the replica drains it for proposals and cleans it on commit. `signer` is
    /// the sender-recovery implementation the state engine executes with, and
    /// `leader_rotation` the policy mapping views to leaders
    /// ([`RoundRobin`](crate::app::RoundRobin) unless the whole replica set was configured
    /// otherwise).
    pub fn start<K: KVStore, N: Network>(
        config: Configuration,
        kv_store: K,
        network: N,
        mempool: Arc<Mempool>,
        signer: impl Signer,
        leader_rotation: impl LeaderRotation + Clone,
    ) -> Replica {
        let validator_set = ValidatorSet::new(config.validators.clone());
        let state_store = StateStore::open(kv_store.clone());
        let block_store = BlockStore::open(kv_store.clone());

        let duration: Box<dyn ViewDuration> = match config.view_duration {
            ViewDurationConfig::Fixed(duration) => Box::new(FixedViewDuration(duration)),
            ViewDurationConfig::Adaptive {
                initial,
                max,
                multiplier,
                samples,
            } => Box::new(EwmaViewDuration::new(initial, max, multiplier, samples)),
        };

        let synchronizer = Synchronizer::new(
            SynchronizerConfiguration {
                chain_id: config.chain_id,
                keypair: config.keypair.clone(),
                id: config.id,
                use_agg_qc: config.use_agg_qc,
            },
            validator_set.clone(),
            state_store.clone(),
            duration,
        );

        let rules = match config.variant {
            ConsensusVariant::Chained => {
                Variant::Chained(ChainedHotStuff::new(state_store.clone(), &block_store))
            }
            ConsensusVariant::Simple => {
                Variant::Simple(SimpleHotStuff::new(state_store.clone(), &block_store))
            }
        };

        let consensus = Consensus::new(
            ConsensusConfiguration {
                chain_id: config.chain_id,
                keypair: config.keypair.clone(),
                id: config.id,
                use_agg_qc: config.use_agg_qc,
            },
            rules,
            leader_rotation.clone(),
            validator_set.clone(),
            block_store.clone(),
            state_store,
            synchronizer.view(),
        );

        let mut state_db = StateDb::new(NodeStore::new(kv_store));
        for (address, balance) in &config.genesis_alloc {
            state_db
                .create_account(address)
                .expect("a fresh state database has no missing nodes");
            state_db
                .add_balance(address, *balance)
                .expect("a fresh state database has no missing nodes");
        }
        state_db
            .commit()
            .expect("a fresh state database has no missing nodes");

        let ledger = Ledger::new(
            state_db,
            Executor::new(config.execution.clone()),
            signer,
            config.coinbase,
            Arc::clone(&mempool),
        );

        let mut context = Context {
            id: config.id,
            validator_set,
            leader_rotation,
            consensus,
            synchronizer,
            block_store,
            ledger,
            mempool,
            network,
        };

        let (shutdown, shutdown_receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("replica-{}", config.id))
            .spawn(move || context.run(shutdown_receiver))
            .expect("failed to spawn the replica event loop thread");

        Replica {
            handle: Some(handle),
            shutdown,
        }
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Everything the event loop owns.
struct Context<K: KVStore, N: Network, L: LeaderRotation> {
    id: ReplicaID,
    validator_set: ValidatorSet,
    leader_rotation: L,
    consensus: Consensus<K, Variant<K>, L>,
    synchronizer: Synchronizer<K, Box<dyn ViewDuration>>,
    block_store: BlockStore<K>,
    ledger: Ledger<K>,
    mempool: Arc<Mempool>,
    network: N,
}

impl<K: KVStore, N: Network, L: LeaderRotation> Context<K, N, L> {
    fn run(&mut self, shutdown: Receiver<()>) {
        log::info!(
            "Replica, {}, starting, {}-chain commit rule, view {}",
            self.id,
            self.consensus.chain_length(),
            self.synchronizer.view()
        );
        self.synchronizer.start();
        self.consensus.enter_view(self.synchronizer.view());

        // Kick off the first proposal when starting fresh as the leader of view 1.
        let view = self.synchronizer.view();
        if view == ViewNumber::new(1)
            && self.leader_rotation.leader(view, &self.validator_set) == self.id
        {
            self.try_propose(view, self.synchronizer.sync_info());
        }

        let mut last_sweep = Instant::now();
        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            let mut worked = false;

            // 1. Drain and process network messages.
            while let Some((origin, msg)) = self.network.recv() {
                worked = true;
                self.handle_message(origin, msg);
            }

            // 2. Pacemaker tick: a passed deadline becomes a timeout event, processed only if
            //    the view did not advance in between.
            if let Some(view) = self.synchronizer.tick() {
                if view == self.synchronizer.view() {
                    worked = true;
                    self.on_local_timeout();
                }
            }

            // 3. Periodic mempool maintenance.
            if last_sweep.elapsed() >= MEMPOOL_SWEEP_INTERVAL {
                self.mempool.drop_expired();
                last_sweep = Instant::now();
            }

            if !worked {
                thread::sleep(IDLE_SLEEP);
            }
        }

        self.block_store.close();
        self.mempool.close();
        log::info!("Replica, {}, event loop stopped", self.id);
    }

    fn handle_message(&mut self, origin: ReplicaID, msg: Message) {
        if self.consensus.halted() {
            return;
        }

        match msg {
            Message::Propose(proposal) => self.process_proposal(origin, proposal),
            Message::Vote(vote) => {
                if let Some(sync_info) = self.consensus.on_vote(origin, &vote) {
                    self.advance(sync_info);
                }
            }
            Message::NewView(new_view) => {
                let entered =
                    self.synchronizer
                        .on_new_view(new_view, &mut self.block_store, &self.network);
                if let Some(entered) = entered {
                    self.enter_view(entered);
                }
            }
            Message::Timeout(timeout) => {
                let entered = self.synchronizer.on_remote_timeout(
                    origin,
                    timeout,
                    &mut self.block_store,
                    &self.network,
                );
                if let Some(entered) = entered {
                    self.enter_view(entered);
                }
            }
        }
    }

    /// Run a proposal through the driver, then perform what it decided: advance the view, then
    /// deliver the vote (to ourselves, if we lead the next view).
    fn process_proposal(&mut self, origin: ReplicaID, proposal: ProposeMsg) {
        let current_view = self.synchronizer.view();
        let mut acceptor = Arc::clone(&self.mempool);
        let outcome = self.consensus.on_propose(
            proposal,
            origin,
            current_view,
            &mut acceptor,
            &mut self.ledger,
            &mut self.network,
        );

        if let Some(sync_info) = outcome.advance {
            self.advance(sync_info);
        }

        if let Some((target, vote)) = outcome.vote {
            if target == self.id {
                if let Some(sync_info) = self.consensus.on_vote(self.id, &vote) {
                    self.advance(sync_info);
                }
            } else {
                self.network.send(target, Message::Vote(vote));
            }
        }
    }

    fn advance(&mut self, sync_info: SyncInfo) {
        let entered =
            self.synchronizer
                .advance_view(sync_info, &mut self.block_store, &self.network);
        if let Some(entered) = entered {
            self.enter_view(entered);
        }
    }

    /// React to an advanced view: refresh the vote collector, then propose (as leader) or tell
    /// the leader what we know (as follower).
    fn enter_view(&mut self, entered: EnterView) {
        self.consensus.enter_view(entered.view);

        let leader = self.leader_rotation.leader(entered.view, &self.validator_set);
        if leader == self.id {
            let EnterView { view, sync_info } = entered;
            self.try_propose(view, sync_info);
        } else {
            self.network
                .send(leader, Message::NewView(new_view_msg(self.id, &entered)));
        }
    }

    fn try_propose(&mut self, view: ViewNumber, sync_info: SyncInfo) {
        // The command wait is bounded by the view deadline: if the pool stays empty for the
        // whole view, the view times out normally.
        let deadline = self.synchronizer.deadline();
        let mut command_queue = Arc::clone(&self.mempool);
        let mut acceptor = Arc::clone(&self.mempool);

        let proposal = self.consensus.propose(
            &sync_info,
            view,
            deadline,
            &mut command_queue,
            &mut acceptor,
            &mut self.network,
        );
        if let Some(proposal) = proposal {
            // Self-process the proposal like any other.
            self.process_proposal(self.id, proposal);
        }
    }

    fn on_local_timeout(&mut self) {
        let outcome = self.synchronizer.on_local_timeout();

        if !outcome.is_new {
            // Same view timed out again: just rebroadcast the previous timeout message.
            self.network.broadcast(Message::Timeout(outcome.msg));
            return;
        }

        self.consensus.stop_voting(outcome.msg.view);
        self.network.broadcast(Message::Timeout(outcome.msg.clone()));

        // Self-deliver.
        let entered = self.synchronizer.on_remote_timeout(
            self.id,
            outcome.msg,
            &mut self.block_store,
            &self.network,
        );
        if let Some(entered) = entered {
            self.enter_view(entered);
        }
    }
}
