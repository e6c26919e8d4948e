//! End-to-end tests over live replicas connected by the mock network: normal-path commitment,
//! timeout recovery around a silent leader, and persistence across a restart.

mod common;

use std::time::Duration;

use hotstuff_ledger::{
    config::ViewDurationConfig,
    types::basic::ViewNumber,
    types::block::Block,
};
use log::LevelFilter;

use common::node::{funded_transfers, setup, wait_until, TestNode};

/// Submit every transaction to every node, so whichever replica leads a view has something to
/// propose.
fn submit_everywhere(nodes: &[TestNode], transactions: &[hotstuff_ledger::mempool::transaction::Transaction]) {
    for node in nodes {
        for tx in transactions {
            node.submit(tx.clone());
        }
    }
}

/// Four replicas, all honest and online: blocks are proposed, certified, and committed, and
/// every replica agrees on the committed chain.
#[test]
fn normal_path_commits_and_agrees() {
    common::logging::setup_logger(LevelFilter::Warn);

    let (transactions, alloc) = funded_transfers(12);
    let mut nodes = setup(
        4,
        ViewDurationConfig::Fixed(Duration::from_millis(1000)),
        alloc,
        45_000,
    );
    for node in nodes.iter_mut() {
        node.start();
    }
    submit_everywhere(&nodes, &transactions);

    let genesis_hash = Block::genesis().hash;
    assert!(
        wait_until(Duration::from_secs(30), || {
            nodes.iter().all(|node| node.committed_hash() != genesis_hash)
        }),
        "not every replica committed a block in time"
    );

    // Safety: the replicas' committed blocks all lie on one chain.
    let committed: Vec<Block> = nodes
        .iter()
        .map(|node| {
            let store = node.block_store();
            store
                .local_get(&node.committed_hash())
                .expect("the committed block is stored locally")
        })
        .collect();
    for i in 0..committed.len() {
        for j in 0..committed.len() {
            let (high_index, low_index) = if committed[i].view >= committed[j].view {
                (i, j)
            } else {
                (j, i)
            };
            let store = nodes[high_index].block_store();
            assert!(
                store.extends(&committed[high_index], &committed[low_index]),
                "conflicting commits: {} and {}",
                committed[high_index].hash,
                committed[low_index].hash
            );
        }
    }

    // A replica's last vote is at least as recent as the view of its committed block.
    for (node, block) in nodes.iter().zip(&committed) {
        assert!(node.last_vote() >= block.view);
    }
}

/// Four replicas, but the leader of view 1 never starts. The remaining 2f + 1 time out, form a
/// timeout certificate for view 1, advance to view 2, and make progress without any block ever
/// existing at view 1.
#[test]
fn silent_leader_is_skipped_via_timeout_certificate() {
    common::logging::setup_logger(LevelFilter::Warn);

    let (transactions, alloc) = funded_transfers(6);
    let mut nodes = setup(
        4,
        ViewDurationConfig::Fixed(Duration::from_millis(400)),
        alloc,
        45_000,
    );
    // With round-robin rotation, replica 1 leads view 1. Leave it dead.
    for node in nodes.iter_mut() {
        if node.id != hotstuff_ledger::types::basic::ReplicaID::new(1) {
            node.start();
        }
    }
    let live: Vec<&TestNode> = nodes
        .iter()
        .filter(|node| node.id != hotstuff_ledger::types::basic::ReplicaID::new(1))
        .collect();
    submit_everywhere(&nodes, &transactions);

    assert!(
        wait_until(Duration::from_secs(20), || {
            live.iter().all(|node| {
                node.current_view() >= ViewNumber::new(2)
                    && node.high_tc_view() >= ViewNumber::new(1)
            })
        }),
        "the live replicas did not advance past the silent leader's view"
    );

    let genesis_hash = Block::genesis().hash;
    assert!(
        wait_until(Duration::from_secs(30), || {
            live.iter().all(|node| node.committed_hash() != genesis_hash)
        }),
        "the live replicas did not commit after the view change"
    );

    // No block was ever stored at the silent leader's view.
    for node in &live {
        assert!(node.block_store().block_at_height(ViewNumber::new(1)).is_none());
    }
}

/// A replica is stopped and restarted over the same storage. Its persisted protocol state
/// survives, its last vote never moves backward, and it rejoins consensus.
#[test]
fn restart_preserves_protocol_state_and_rejoins() {
    common::logging::setup_logger(LevelFilter::Warn);

    let (transactions, alloc) = funded_transfers(48);
    let (first_batch, second_batch) = transactions.split_at(16);
    let mut nodes = setup(
        4,
        ViewDurationConfig::Fixed(Duration::from_millis(800)),
        alloc,
        45_000,
    );
    for node in nodes.iter_mut() {
        node.start();
    }
    submit_everywhere(&nodes, first_batch);

    let genesis_hash = Block::genesis().hash;
    assert!(
        wait_until(Duration::from_secs(30), || {
            nodes.iter().all(|node| node.committed_hash() != genesis_hash)
        }),
        "no initial progress"
    );

    // Stop replica 3; record what it promised before the crash.
    nodes[3].stop();
    let last_vote_before = nodes[3].last_vote();
    let view_before = nodes[3].current_view();
    let committed_before = nodes[3].committed_hash();

    // The others keep going without it (3 of 4 is a quorum).
    std::thread::sleep(Duration::from_millis(1500));

    nodes[3].start();
    // Fresh work for everyone, so the chain keeps growing while the straggler catches up.
    submit_everywhere(&nodes, second_batch);

    // Recovery: nothing persisted moved backward.
    assert!(nodes[3].last_vote() >= last_vote_before);
    assert!(nodes[3].current_view() >= view_before);

    // The restarted replica catches up with the rest.
    assert!(
        wait_until(Duration::from_secs(30), || {
            let store = nodes[3].block_store();
            let committed = store.local_get(&nodes[3].committed_hash());
            match committed {
                Some(block) => {
                    block.view
                        > store
                            .local_get(&committed_before)
                            .map_or(ViewNumber::init(), |before| before.view)
                }
                None => false,
            }
        }),
        "the restarted replica did not resume committing"
    );
    assert!(nodes[3].last_vote() >= last_vote_before);
}
