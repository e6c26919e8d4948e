//! Assembles replicas over in-memory storage and the mock network, with handles for tests to
//! observe persisted protocol state and feed transactions.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ethereum_types::U256;
use hotstuff_ledger::{
    app::RoundRobin,
    block_store::BlockStore,
    config::{Configuration, ViewDurationConfig},
    kv_store::MemKVStore,
    mempool::{
        transaction::{DevSigner, Signer, Transaction},
        Mempool, MempoolConfig,
    },
    state_db::Address,
    state_store::StateStore,
    types::basic::{ChainID, CryptoHash, ReplicaID, ViewNumber},
    types::keypair::Keypair,
    Replica,
};
use rand::rngs::OsRng;

use crate::common::network::{mock_network, NetworkStub};

pub(crate) struct TestNode {
    pub(crate) id: ReplicaID,
    pub(crate) kv: MemKVStore,
    pub(crate) mempool: Arc<Mempool>,
    config: Configuration,
    network: NetworkStub,
    replica: Option<Replica>,
}

impl TestNode {
    pub(crate) fn start(&mut self) {
        assert!(self.replica.is_none(), "node already started");
        self.replica = Some(Replica::start(
            self.config.clone(),
            self.kv.clone(),
            self.network.clone(),
            Arc::clone(&self.mempool),
            DevSigner,
            RoundRobin,
        ));
    }

    pub(crate) fn stop(&mut self) {
        self.replica = None;
    }

    pub(crate) fn submit(&self, tx: Transaction) {
        // Duplicates across resubmissions are fine.
        let _ = self.mempool.add_local(tx);
    }

    /* ↓↓↓ Observing persisted protocol state ↓↓↓ */

    pub(crate) fn committed_hash(&self) -> CryptoHash {
        StateStore::open(self.kv.clone()).committed_hash().unwrap()
    }

    pub(crate) fn last_vote(&self) -> ViewNumber {
        StateStore::open(self.kv.clone()).last_vote().unwrap()
    }

    pub(crate) fn current_view(&self) -> ViewNumber {
        StateStore::open(self.kv.clone()).current_view().unwrap()
    }

    pub(crate) fn high_tc_view(&self) -> ViewNumber {
        StateStore::open(self.kv.clone()).high_tc().unwrap().view
    }

    pub(crate) fn block_store(&self) -> BlockStore<MemKVStore> {
        BlockStore::open(self.kv.clone())
    }
}

/// Build `n` connected nodes with the given pacemaker timing and genesis balances. The pool's
/// per-block gas budget is kept small so a batch of transfers spreads over several proposals.
pub(crate) fn setup(
    n: u32,
    view_duration: ViewDurationConfig,
    genesis_alloc: Vec<(Address, U256)>,
    block_gas_limit: u64,
) -> Vec<TestNode> {
    let mut csprg = OsRng {};
    let keypairs: Vec<Keypair> = (0..n)
        .map(|_| Keypair::new(ed25519_dalek::SigningKey::generate(&mut csprg)))
        .collect();
    let validators: Vec<(ReplicaID, ed25519_dalek::VerifyingKey)> = keypairs
        .iter()
        .enumerate()
        .map(|(i, keypair)| (ReplicaID::new(i as u32), keypair.public()))
        .collect();

    let networks = mock_network(validators.iter().map(|(id, _)| *id));

    keypairs
        .into_iter()
        .zip(networks)
        .enumerate()
        .map(|(i, (keypair, network))| {
            let id = ReplicaID::new(i as u32);
            let mut config =
                Configuration::new(ChainID::new(0), id, keypair, validators.clone());
            config.view_duration = view_duration.clone();
            config.genesis_alloc = genesis_alloc.clone();
            config.mempool = MempoolConfig {
                block_gas_limit,
                ..MempoolConfig::default()
            };

            TestNode {
                id,
                kv: MemKVStore::new(),
                mempool: Arc::new(Mempool::new(config.mempool.clone(), DevSigner)),
                config,
                network,
                replica: None,
            }
        })
        .collect()
}

/// Build `count` signed transfers from distinct (hash-derived) senders, and the genesis
/// balances funding them.
pub(crate) fn funded_transfers(count: u8) -> (Vec<Transaction>, Vec<(Address, U256)>) {
    let mut transactions = Vec::with_capacity(count as usize);
    let mut alloc = Vec::with_capacity(count as usize);

    for i in 0..count {
        let mut tx = Transaction::new(
            0,
            Some(Address::repeat_byte(0xee)),
            U256::from(1),
            21_000,
            U256::from(2),
            vec![i],
            U256::from(0),
        );
        DevSigner.sign(&mut tx);
        let sender = DevSigner.sender(&tx).unwrap();
        alloc.push((sender, U256::from(10_000_000u64)));
        transactions.push(tx);
    }

    (transactions, alloc)
}

/// Poll `condition` until it holds or `timeout` passes. Returns whether it held.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    condition()
}
