/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The pacemaker: keeps `current_view` moving forward, synchronizes replicas into the same view,
//! and converts quorums of timeouts into [`TimeoutCertificate`]s.
//!
//! ## Operation
//!
//! The synchronizer is tick-driven: the event loop calls [`tick`](Synchronizer::tick) between
//! events, and a passed deadline yields a `TimeoutEvent` for the loop to route back into
//! [`on_local_timeout`](Synchronizer::on_local_timeout). View changes happen exclusively through
//! [`advance_view`](Synchronizer::advance_view), which enforces that `current_view` is strictly
//! monotonically increasing, persists it, and tells the caller whether this replica should
//! propose or notify the new leader.

pub mod view_duration;

use std::collections::BTreeMap;
use std::time::Instant;

use crate::block_store::BlockStore;
use crate::kv_store::KVStore;
use crate::logging::{self, now_secs, short_hash};
use crate::messages::{NewViewMsg, SyncInfo, TimeoutMsg};
use crate::networking::Fetcher;
use crate::state_store::StateStore;
use crate::synchronizer::view_duration::ViewDuration;
use crate::types::basic::{ChainID, ReplicaID, ViewNumber};
use crate::types::certificates::{Certificate, QuorumCertificate, TimeoutCertificate};
use crate::types::collectors::TimeoutVoteCollector;
use crate::types::keypair::Keypair;
use crate::types::validator_set::ValidatorSet;

/// Immutable parameters of the [`Synchronizer`].
pub(crate) struct SynchronizerConfiguration {
    pub(crate) chain_id: ChainID,
    pub(crate) keypair: Keypair,
    pub(crate) id: ReplicaID,
    pub(crate) use_agg_qc: bool,
}

/// Returned by [`Synchronizer::advance_view`] when the view actually advanced. The event loop
/// reacts by refreshing per-view state and either proposing (when this replica leads `view`) or
/// sending `sync_info` to the new leader in a [`NewViewMsg`].
pub(crate) struct EnterView {
    pub(crate) view: ViewNumber,
    pub(crate) sync_info: SyncInfo,
}

/// Returned by [`Synchronizer::on_local_timeout`]. `is_new` distinguishes a fresh timeout (stop
/// voting, broadcast, self-deliver) from a rebroadcast of the previous timeout message.
pub(crate) struct LocalTimeout {
    pub(crate) msg: TimeoutMsg,
    pub(crate) is_new: bool,
}

pub(crate) struct Synchronizer<K: KVStore, D: ViewDuration> {
    config: SynchronizerConfiguration,
    validator_set: ValidatorSet,
    state_store: StateStore<K>,

    current_view: ViewNumber,
    high_qc: QuorumCertificate,
    high_tc: TimeoutCertificate,

    /// The last timeout message this replica sent. If the view times out again before
    /// advancing, the same message is rebroadcast instead of being re-signed.
    last_timeout: Option<TimeoutMsg>,

    duration: D,
    deadline: Instant,

    /// Collected timeout messages per view. Entries below `current_view` are garbage-collected
    /// on every remote timeout.
    timeouts: BTreeMap<ViewNumber, TimeoutVoteCollector>,
}

impl<K: KVStore, D: ViewDuration> Synchronizer<K, D> {
    /// Create the synchronizer, reloading `current_view`, `high_qc`, and `high_tc` from the
    /// state store.
    pub(crate) fn new(
        config: SynchronizerConfiguration,
        validator_set: ValidatorSet,
        state_store: StateStore<K>,
        duration: D,
    ) -> Synchronizer<K, D> {
        let current_view = state_store.current_view().unwrap_or_else(|err| {
            log::error!("Synchronizer, failed to load current view: {}", err);
            ViewNumber::new(1)
        });
        let high_qc = state_store.high_qc().unwrap_or_else(|err| {
            log::error!("Synchronizer, failed to load high QC: {}", err);
            QuorumCertificate::genesis_high_qc()
        });
        let high_tc = state_store.high_tc().unwrap_or_else(|err| {
            log::error!("Synchronizer, failed to load high TC: {}", err);
            TimeoutCertificate::empty()
        });

        log::info!(
            "Synchronizer, loaded state, view={}, high_qc.view={}, high_tc.view={}",
            current_view,
            high_qc.view,
            high_tc.view
        );

        Synchronizer {
            config,
            validator_set,
            state_store,
            current_view,
            high_qc,
            high_tc,
            last_timeout: None,
            duration,
            deadline: Instant::now(),
            timeouts: BTreeMap::new(),
        }
    }

    /// Start the view timer. Called once before the event loop begins.
    pub(crate) fn start(&mut self) {
        self.duration.view_started();
        self.deadline = Instant::now() + self.duration.duration();
        log::info!(
            "{}, {}, {}",
            logging::START_VIEW,
            now_secs(),
            self.current_view
        );
    }

    /// The current view. Strictly monotonically increasing over the replica's lifetime.
    pub(crate) fn view(&self) -> ViewNumber {
        self.current_view
    }

    /// The instant at which the current view times out.
    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The highest certificates this replica knows, for inclusion in outgoing messages.
    pub(crate) fn sync_info(&self) -> SyncInfo {
        let mut sync_info = SyncInfo::new().with_qc(self.high_qc.clone());
        if !self.high_tc.is_empty_tc() {
            sync_info = sync_info.with_tc(self.high_tc.clone());
        }
        sync_info
    }

    /// Check the clock. Returns the view that timed out, if the deadline has passed.
    pub(crate) fn tick(&self) -> Option<ViewNumber> {
        if Instant::now() >= self.deadline {
            Some(self.current_view)
        } else {
            None
        }
    }

    /// Handle the expiry of the current view's timer.
    ///
    /// The first expiry in a view signs a fresh [`TimeoutMsg`]; repeat expiries rebroadcast the
    /// same message. In both cases the timer restarts so the next expiry fires a view later.
    pub(crate) fn on_local_timeout(&mut self) -> LocalTimeout {
        let view = self.current_view;
        log::info!("{}, {}, {}", logging::VIEW_TIMEOUT, now_secs(), view);

        match &self.last_timeout {
            Some(last) if last.view == view => {
                self.deadline = Instant::now() + self.duration.duration();
                LocalTimeout {
                    msg: last.clone(),
                    is_new: false,
                }
            }
            _ => {
                // Increase the duration of the next view before restarting the timer.
                self.duration.view_timeout();
                self.deadline = Instant::now() + self.duration.duration();

                let msg = TimeoutMsg::new(
                    &self.config.keypair,
                    self.config.chain_id,
                    self.config.id,
                    view,
                    self.sync_info(),
                    self.config.use_agg_qc,
                );
                self.last_timeout = Some(msg.clone());
                log::info!("{}, {}, {}", logging::TIMEOUT_VOTE, now_secs(), view);
                LocalTimeout { msg, is_new: true }
            }
        }
    }

    /// Handle a timeout message from another replica (or this one, self-delivered).
    ///
    /// The message's sync info may already let us advance; additionally, collecting the
    /// `2f + 1`-th distinct timeout for a view forms a [`TimeoutCertificate`] (and, with
    /// aggregate QCs enabled, an [`AggregateQC`](crate::types::certificates::AggregateQC)) and
    /// advances through it.
    pub(crate) fn on_remote_timeout<F: Fetcher>(
        &mut self,
        origin: ReplicaID,
        msg: TimeoutMsg,
        block_store: &mut BlockStore<K>,
        fetcher: &F,
    ) -> Option<EnterView> {
        if origin != msg.id {
            log::info!("OnRemoteTimeout, sender {} does not match id {}", origin, msg.id);
            return None;
        }
        let key = match self.validator_set.key(msg.id) {
            Some(key) => key,
            None => {
                log::info!("OnRemoteTimeout, {} is not a validator", msg.id);
                return None;
            }
        };
        if !msg.is_correct(key, self.config.chain_id) {
            log::info!("OnRemoteTimeout, invalid view signature from {}", msg.id);
            return None;
        }
        log::debug!(
            "{}, {}, {}",
            logging::RECEIVE_TIMEOUT_VOTE,
            msg.id,
            msg.view
        );

        let first_advance =
            self.advance_view(msg.sync_info.clone(), block_store, fetcher);

        let mut second_advance = None;
        if msg.view >= self.current_view {
            let chain_id = self.config.chain_id;
            let validator_set = self.validator_set.clone();
            let collector = self
                .timeouts
                .entry(msg.view)
                .or_insert_with(|| TimeoutVoteCollector::new(chain_id, msg.view, validator_set));

            if let Some((tc, agg_qc)) = collector.collect(msg) {
                log::info!(
                    "{}, {}, {}",
                    logging::COLLECT_TC,
                    now_secs(),
                    tc.view
                );
                self.timeouts.remove(&tc.view);

                let mut sync_info = self.sync_info().with_tc(tc);
                if self.config.use_agg_qc {
                    if let Some(agg_qc) = agg_qc {
                        sync_info = sync_info.with_agg_qc(agg_qc);
                    }
                }
                second_advance = self.advance_view(sync_info, block_store, fetcher);
            }
        }

        // Garbage-collect timeout maps for views we have left behind.
        let live = self.timeouts.split_off(&self.current_view);
        self.timeouts = live;

        second_advance.or(first_advance)
    }

    /// Handle a [`NewViewMsg`]: its sync info may let us advance.
    pub(crate) fn on_new_view<F: Fetcher>(
        &mut self,
        msg: NewViewMsg,
        block_store: &mut BlockStore<K>,
        fetcher: &F,
    ) -> Option<EnterView> {
        log::debug!("{}, {}, {}", logging::RECEIVE_NEW_VIEW, msg.id, msg.view);
        self.advance_view(msg.sync_info, block_store, fetcher)
    }

    /// Attempt to advance to the view after the highest certificate in `sync_info`.
    ///
    /// Certificates are verified before use; `high_qc` and `high_tc` are raised (and persisted)
    /// even when the view does not advance. The next view is
    /// `max(qc.view, tc.view) + 1`; advancing through a QC (rather than only a TC) counts as a
    /// success for the view-duration estimator.
    pub(crate) fn advance_view<F: Fetcher>(
        &mut self,
        sync_info: SyncInfo,
        block_store: &mut BlockStore<K>,
        fetcher: &F,
    ) -> Option<EnterView> {
        let mut sync_info = sync_info;
        let mut v = ViewNumber::init();
        let mut timeout = false;

        // 1. A timeout certificate, if present, raises high_tc and proposes a view.
        if let Some(tc) = &sync_info.tc {
            if !tc.is_correct(&self.validator_set) {
                log::info!("AdvanceView, timeout certificate could not be verified");
                return None;
            }
            self.update_high_tc(tc.clone());
            v = tc.view;
            timeout = true;
        }

        // 2. An aggregate QC (when enabled) both proposes a view and reveals the true high QC;
        //    otherwise a plain QC is used directly.
        let qc = if self.config.use_agg_qc && sync_info.agg_qc.is_some() {
            let agg_qc = sync_info.agg_qc.clone().expect("checked above");
            match agg_qc.verify(&self.validator_set) {
                None => {
                    log::info!("AdvanceView, aggregate QC could not be verified");
                    return None;
                }
                Some(high_qc) => {
                    if agg_qc.view >= v {
                        v = agg_qc.view;
                        timeout = true;
                    }
                    // Make sure the QC passed onward is the verified high QC.
                    sync_info.qc = Some(high_qc.clone());
                    Some(high_qc)
                }
            }
        } else if let Some(qc) = &sync_info.qc {
            if !qc.is_correct(&self.validator_set) {
                log::info!("AdvanceView, quorum certificate could not be verified");
                return None;
            }
            Some(qc.clone())
        } else {
            None
        };

        // 3. A QC raises high_qc; when its view is at least the TC's, the view change does not
        //    count as a timeout.
        if let Some(qc) = qc {
            self.update_high_qc(qc.clone(), block_store, fetcher);
            if qc.view >= v {
                v = qc.view;
                timeout = false;
            }
        }

        // 4. Views never move backward and never repeat.
        if v < self.current_view {
            return None;
        }

        if !timeout {
            self.duration.view_succeeded();
        }

        let new_view = v + 1;
        self.current_view = new_view;
        self.last_timeout = None;
        self.state_store.set_current_view(new_view);

        self.duration.view_started();
        self.deadline = Instant::now() + self.duration.duration();

        log::info!("{}, {}, {}", logging::START_VIEW, now_secs(), new_view);
        Some(EnterView {
            view: new_view,
            sync_info,
        })
    }

    /// Raise `high_qc` to `qc` if it certifies a higher view, persisting on update. The block
    /// the QC refers to must be locally resolvable; an unresolvable block leaves `high_qc`
    /// unchanged.
    fn update_high_qc<F: Fetcher>(
        &mut self,
        qc: QuorumCertificate,
        block_store: &mut BlockStore<K>,
        fetcher: &F,
    ) {
        if block_store.get(&qc.block, fetcher).is_none() {
            log::info!(
                "AdvanceView, could not find block {} referenced by new QC",
                short_hash(&qc.block)
            );
            return;
        }

        if qc.view > self.high_qc.view {
            log::debug!(
                "{}, {}, {}",
                logging::UPDATE_HIGHEST_QC,
                short_hash(&qc.block),
                qc.view
            );
            self.state_store.set_high_qc(&qc);
            self.high_qc = qc;
        }
    }

    /// Raise `high_tc` to `tc` if it is for a higher view, persisting on update.
    fn update_high_tc(&mut self, tc: TimeoutCertificate) {
        if self.high_tc.is_empty_tc() || tc.view > self.high_tc.view {
            log::debug!("{}, {}", logging::UPDATE_HIGHEST_TC, tc.view);
            self.state_store.set_high_tc(&tc);
            self.high_tc = tc;
        }
    }
}

/// Build the [`NewViewMsg`] a non-leader sends to the leader of a newly entered view.
pub(crate) fn new_view_msg(id: ReplicaID, enter: &EnterView) -> NewViewMsg {
    NewViewMsg {
        id,
        view: enter.view,
        sync_info: enter.sync_info.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::kv_store::MemKVStore;
    use crate::synchronizer::view_duration::FixedViewDuration;
    use crate::types::block::Block;
    use ed25519_dalek::SigningKey;

    struct NoFetcher;

    impl Fetcher for NoFetcher {
        fn fetch(&self, _: crate::types::basic::CryptoHash, _: Duration) -> Option<Block> {
            None
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

    fn synchronizer(
        kv: MemKVStore,
        keypairs: &[Keypair],
    ) -> Synchronizer<MemKVStore, FixedViewDuration> {
        let validator_set = validator_set(keypairs);
        let state_store = StateStore::open(kv);
        let mut synchronizer = Synchronizer::new(
            SynchronizerConfiguration {
                chain_id: ChainID::new(0),
                keypair: keypairs[0].clone(),
                id: ReplicaID::new(0),
                use_agg_qc: false,
            },
            validator_set,
            state_store,
            FixedViewDuration(Duration::from_secs(60)),
        );
        synchronizer.start();
        synchronizer
    }

    fn timeout_msg(keypair: &Keypair, id: u32, view: u64) -> TimeoutMsg {
        TimeoutMsg::new(
            keypair,
            ChainID::new(0),
            ReplicaID::new(id),
            ViewNumber::new(view),
            SyncInfo::new(),
            false,
        )
    }

    #[test]
    fn tc_forms_at_exactly_two_f_plus_one_timeouts() {
        let kv = MemKVStore::new();
        let keypairs = keypairs(4);
        let mut synchronizer = synchronizer(kv.clone(), &keypairs);
        let mut block_store = crate::block_store::BlockStore::open(kv.clone());

        assert_eq!(synchronizer.view(), ViewNumber::new(1));

        // 2f = 2 timeouts are not enough to advance.
        for i in 0..2u32 {
            let msg = timeout_msg(&keypairs[i as usize], i, 1);
            assert!(synchronizer
                .on_remote_timeout(ReplicaID::new(i), msg, &mut block_store, &NoFetcher)
                .is_none());
        }
        assert_eq!(synchronizer.view(), ViewNumber::new(1));

        // The 2f + 1-th forms a TC and advances the view.
        let msg = timeout_msg(&keypairs[2], 2, 1);
        let entered = synchronizer
            .on_remote_timeout(ReplicaID::new(2), msg, &mut block_store, &NoFetcher)
            .expect("a quorum of timeouts advances the view");

        assert_eq!(entered.view, ViewNumber::new(2));
        assert_eq!(synchronizer.view(), ViewNumber::new(2));
        assert_eq!(
            entered.sync_info.tc.as_ref().map(|tc| tc.view),
            Some(ViewNumber::new(1))
        );

        // The advanced view and the raised high TC are persisted.
        let state_store = StateStore::open(kv);
        assert_eq!(state_store.current_view().unwrap(), ViewNumber::new(2));
        assert_eq!(state_store.high_tc().unwrap().view, ViewNumber::new(1));

        // No block was ever stored at the timed-out view.
        assert!(block_store.block_at_height(ViewNumber::new(1)).is_none());
    }

    #[test]
    fn duplicate_timeouts_from_one_replica_do_not_count() {
        let kv = MemKVStore::new();
        let keypairs = keypairs(4);
        let mut synchronizer = synchronizer(kv.clone(), &keypairs);
        let mut block_store = crate::block_store::BlockStore::open(kv);

        for _ in 0..5 {
            let msg = timeout_msg(&keypairs[0], 0, 1);
            assert!(synchronizer
                .on_remote_timeout(ReplicaID::new(0), msg, &mut block_store, &NoFetcher)
                .is_none());
        }
        assert_eq!(synchronizer.view(), ViewNumber::new(1));
    }

    #[test]
    fn views_never_move_backward() {
        let kv = MemKVStore::new();
        let keypairs = keypairs(4);
        let mut synchronizer = synchronizer(kv.clone(), &keypairs);
        let mut block_store = crate::block_store::BlockStore::open(kv);

        for i in 0..3u32 {
            let msg = timeout_msg(&keypairs[i as usize], i, 1);
            synchronizer.on_remote_timeout(ReplicaID::new(i), msg, &mut block_store, &NoFetcher);
        }
        assert_eq!(synchronizer.view(), ViewNumber::new(2));

        // A stale TC for view 1 arrives again through a NewView: no change.
        let sync_info = synchronizer.sync_info();
        assert!(synchronizer
            .advance_view(sync_info, &mut block_store, &NoFetcher)
            .is_none());
        assert_eq!(synchronizer.view(), ViewNumber::new(2));
    }

    #[test]
    fn repeat_timeout_in_same_view_rebroadcasts_the_same_message() {
        let kv = MemKVStore::new();
        let keypairs = keypairs(4);
        let mut synchronizer = synchronizer(kv, &keypairs);

        let first = synchronizer.on_local_timeout();
        assert!(first.is_new);
        let second = synchronizer.on_local_timeout();
        assert!(!second.is_new);
        assert_eq!(second.msg.view, first.msg.view);
        assert_eq!(
            second.msg.view_signature.bytes().to_vec(),
            first.msg.view_signature.bytes().to_vec()
        );
    }
}
