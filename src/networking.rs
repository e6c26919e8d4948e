/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The networking provider interface.
//!
//! This crate does not implement a transport. The library user provides a type implementing
//! [`Network`], which must deliver [`Message`]s between replicas with sender authentication
//! (a message handed to [`recv`](Network::recv) as coming from replica `i` must have been sent by
//! the holder of replica `i`'s keypair), and serve the block-fetch RPC. The tests in this
//! repository use an in-process channel-based implementation.

use std::time::Duration;

use crate::messages::Message;
use crate::types::basic::{CryptoHash, ReplicaID};
use crate::types::block::Block;

/// Resolves a block hash to a block by asking other replicas. Used by the
/// [block store](crate::block_store::BlockStore) when a proposal references an unknown ancestor.
pub trait Fetcher: Send + 'static {
    /// Fetch the block identified by `hash`, waiting at most `timeout`. Returns `None` on
    /// timeout or if no peer knows the block.
    fn fetch(&self, hash: CryptoHash, timeout: Duration) -> Option<Block>;
}

/// Sends and receives progress messages.
///
/// Send operations must not block the caller beyond handing the message to the transport; send
/// errors are the provider's to log and swallow. Broadcasts should reach every connected peer,
/// not only validators, so that listeners can keep up with consensus decisions.
pub trait Network: Fetcher + Clone + Send + 'static {
    /// Send `message` to every connected peer.
    fn broadcast(&mut self, message: Message);

    /// Send `message` to the replica identified by `peer`.
    fn send(&mut self, peer: ReplicaID, message: Message);

    /// Receive the next available message, if any. Must not block.
    fn recv(&mut self) -> Option<(ReplicaID, Message)>;
}
