/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Helpers for logging protocol events.
//!
//! This crate logs through the [log](https://docs.rs/log) facade. To see the messages, install a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Protocol events log as CSV lines with at least two values: the event name in PascalCase, then
//! the time the event was emitted (seconds since the Unix epoch), then event-specific values.
//! Block and transaction hashes are abbreviated to the first seven characters of their base64
//! encoding. For example, a committed block logs as:
//!
//! ```text
//! CommitBlock, 1701329264, fNGCJyk, 7
//! ```

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::types::basic::CryptoHash;

// Names of each event in PascalCase for printing:
pub const INSERT_BLOCK: &str = "InsertBlock";
pub const COMMIT_BLOCK: &str = "CommitBlock";
pub const PRUNE_BLOCK: &str = "PruneBlock";
pub const FORK_BLOCK: &str = "ForkBlock";
pub const UPDATE_HIGHEST_QC: &str = "UpdateHighestQC";
pub const UPDATE_HIGHEST_TC: &str = "UpdateHighestTC";
pub const UPDATE_LOCKED: &str = "UpdateLocked";

pub const PROPOSE: &str = "Propose";
pub const VOTE: &str = "Vote";
pub const NEW_VIEW: &str = "NewView";
pub const TIMEOUT_VOTE: &str = "TimeoutVote";

pub const RECEIVE_PROPOSAL: &str = "ReceiveProposal";
pub const RECEIVE_VOTE: &str = "ReceiveVote";
pub const RECEIVE_NEW_VIEW: &str = "ReceiveNewView";
pub const RECEIVE_TIMEOUT_VOTE: &str = "ReceiveTimeoutVote";

pub const START_VIEW: &str = "StartView";
pub const VIEW_TIMEOUT: &str = "ViewTimeout";
pub const COLLECT_QC: &str = "CollectQC";
pub const COLLECT_TC: &str = "CollectTC";

/// Get a log-friendly representation of a hash: the first seven characters of its base64
/// encoding.
pub fn short_hash(hash: &CryptoHash) -> String {
    first_seven_base64_chars(&hash.bytes())
}

/// Get a log-friendly representation of a byte sequence by base64-encoding it and taking the
/// first seven characters.
pub fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

/// Seconds between the Unix epoch and `timestamp`.
pub fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("event occurred before the Unix epoch")
        .as_secs()
}

/// Seconds since the Unix epoch, now.
pub(crate) fn now_secs() -> u64 {
    secs_since_unix_epoch(SystemTime::now())
}
