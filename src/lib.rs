/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Byzantine fault tolerant state machine replication with an EVM-style ledger.
//!
//! This library combines three tightly coupled subsystems:
//!
//! 1. **Chained HotStuff consensus** ([`consensus`], [`synchronizer`]): the pipelined
//!    three-chain HotStuff protocol (with a two-chain "simple" variant), a pacemaker driving
//!    view changes on timeout, and the safety rules that decide voting and commitment. A set of
//!    `n` replicas tolerates `f = (n - 1) / 3` Byzantine members.
//! 2. **Block store and persistent state** ([`block_store`], [`state_store`], [`kv_store`]):
//!    content-addressed block persistence with a deduplicated ancestor fetch, prune/fork
//!    extraction, and crash-durable storage of the protocol invariants (`last_vote`,
//!    `locked_hash`, `committed_hash`, `high_qc`, `high_tc`, `current_view`).
//! 3. **Deterministic state engine** ([`trie`], [`state_db`], [`evm`], [`mempool`],
//!    [`ledger`]): a Merkle-Patricia-Trie backed world state with snapshot/revert, a minimal
//!    EVM-style bytecode interpreter executing transactions ordered from a priority mempool,
//!    and receipts whose roots feed back into block headers.
//!
//! [`replica`] assembles the three into a single-threaded event loop; [`config`] is the knob
//! surface; [`networking`] declares the transport interface the library user provides.

pub mod app;

pub mod block_store;

pub mod config;

pub mod consensus;

pub mod evm;

pub mod kv_store;

pub mod ledger;

pub mod logging;

pub mod mempool;

pub mod messages;

pub mod networking;

pub mod replica;

pub mod state_db;

pub mod state_store;

pub mod synchronizer;

pub mod trie;

pub mod types;

// Re-exports
pub use config::Configuration;
pub use replica::Replica;
