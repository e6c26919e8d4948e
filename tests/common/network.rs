//! A "mock" (totally local) network for passing messages between replicas in one process.

use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
    time::Duration,
};

use hotstuff_ledger::{
    messages::Message,
    networking::{Fetcher, Network},
    types::basic::{CryptoHash, ReplicaID},
    types::block::Block,
};

/// A network stub that passes messages between replicas using channels, and serves the block
/// fetch RPC from a shared registry of every block that was ever broadcast.
///
/// ## Limitations
///
/// The set of peers reachable from a given `NetworkStub` is fixed on construction by
/// [`mock_network`]. Fetches resolve instantly or not at all; the timeout parameter is unused.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    my_id: ReplicaID,
    all_peers: HashMap<ReplicaID, Sender<(ReplicaID, Message)>>,
    inbox: Arc<Mutex<Receiver<(ReplicaID, Message)>>>,
    blocks: Arc<Mutex<HashMap<CryptoHash, Block>>>,
}

impl Fetcher for NetworkStub {
    fn fetch(&self, hash: CryptoHash, _timeout: Duration) -> Option<Block> {
        self.blocks.lock().unwrap().get(&hash).cloned()
    }
}

impl Network for NetworkStub {
    fn broadcast(&mut self, message: Message) {
        // Record proposed blocks so lagging peers can fetch missed ancestors.
        if let Message::Propose(proposal) = &message {
            self.blocks
                .lock()
                .unwrap()
                .insert(proposal.block.hash, proposal.block.clone());
        }

        for (peer, sender) in &self.all_peers {
            // The replica self-processes its own proposals and timeouts; do not echo them back.
            if *peer == self.my_id {
                continue;
            }
            let _ = sender.send((self.my_id, message.clone()));
        }
    }

    fn send(&mut self, peer: ReplicaID, message: Message) {
        if let Some(sender) = self.all_peers.get(&peer) {
            let _ = sender.send((self.my_id, message));
        }
    }

    fn recv(&mut self) -> Option<(ReplicaID, Message)> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(origin_and_msg) => Some(origin_and_msg),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Create connected `NetworkStub`s for the given replica ids, in the same order.
pub(crate) fn mock_network(ids: impl Iterator<Item = ReplicaID>) -> Vec<NetworkStub> {
    let blocks = Arc::new(Mutex::new(HashMap::new()));
    let mut all_peers = HashMap::new();
    let ids_and_inboxes: Vec<(ReplicaID, Receiver<(ReplicaID, Message)>)> = ids
        .map(|id| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(id, sender);
            (id, receiver)
        })
        .collect();

    ids_and_inboxes
        .into_iter()
        .map(|(my_id, inbox)| NetworkStub {
            my_id,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
            blocks: Arc::clone(&blocks),
        })
        .collect()
}
