/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The configuration surface of a replica.
//!
//! Everything a replica needs beyond its pluggable providers is collected here: identity, the
//! validator set, the consensus variant and pacemaker timing, chain parameters for the state
//! engine, and pool limits. The storage backend (in-memory or embedded RocksDB, see
//! [`kv_store`](crate::kv_store)), the network implementation, the transaction
//! [`Signer`](crate::mempool::transaction::Signer), and the
//! [`LeaderRotation`](crate::app::LeaderRotation) policy are passed separately to
//! [`Replica::start`](crate::replica::Replica::start), because their types flow into the
//! replica's type parameters.

use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use ethereum_types::U256;

use crate::evm::ExecutionConfig;
use crate::mempool::MempoolConfig;
use crate::state_db::Address;
use crate::types::basic::{ChainID, ReplicaID};
use crate::types::keypair::Keypair;

/// Which consensus variant the replica runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsensusVariant {
    /// The pipelined three-chain protocol.
    Chained,

    /// The two-chain simplified protocol.
    Simple,
}

/// How view durations are chosen.
#[derive(Clone, Debug)]
pub enum ViewDurationConfig {
    /// Every view gets the same duration.
    Fixed(Duration),

    /// Durations adapt to an exponentially weighted moving average of successful view
    /// latencies, clamped to `[initial, max]`, multiplied on timeout.
    Adaptive {
        initial: Duration,
        max: Duration,
        multiplier: f64,
        samples: u32,
    },
}

/// The full configuration of one replica.
#[derive(Clone)]
pub struct Configuration {
    /// The chain this replica participates in.
    pub chain_id: ChainID,

    /// This replica's identity in the validator set.
    pub id: ReplicaID,

    /// The keypair matching `id`'s registered verifying key.
    pub keypair: Keypair,

    /// All validators: `(id, verifying key)` pairs. `n = validators.len()`,
    /// `f = (n - 1) / 3`.
    pub validators: Vec<(ReplicaID, VerifyingKey)>,

    /// Which consensus variant to run.
    pub variant: ConsensusVariant,

    /// Whether timeout messages carry the second signature that allows forming
    /// [`AggregateQC`](crate::types::certificates::AggregateQC)s.
    pub use_agg_qc: bool,

    /// Pacemaker timing.
    pub view_duration: ViewDurationConfig,

    /// Chain parameters of the state engine.
    pub execution: ExecutionConfig,

    /// Where gas payments of executed blocks accrue.
    pub coinbase: Address,

    /// Balances materialized at genesis.
    pub genesis_alloc: Vec<(Address, U256)>,

    /// Transaction pool limits.
    pub mempool: MempoolConfig,
}

impl Configuration {
    /// A configuration with reasonable development defaults for the given identity and
    /// validator set.
    pub fn new(
        chain_id: ChainID,
        id: ReplicaID,
        keypair: Keypair,
        validators: Vec<(ReplicaID, VerifyingKey)>,
    ) -> Configuration {
        Configuration {
            chain_id,
            id,
            keypair,
            validators,
            variant: ConsensusVariant::Chained,
            use_agg_qc: false,
            view_duration: ViewDurationConfig::Adaptive {
                initial: Duration::from_millis(500),
                max: Duration::from_secs(10),
                multiplier: 1.5,
                samples: 16,
            },
            execution: ExecutionConfig {
                gas_limit: 8_000_000,
                base_fee: U256::one(),
                chain_id: U256::from(chain_id.int()),
            },
            coinbase: Address::zero(),
            genesis_alloc: Vec::new(),
            mempool: MempoolConfig::default(),
        }
    }
}
