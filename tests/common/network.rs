//! A "mock" (totally local) network for passing wire frames between nodes.

use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use keyframe_bft::router::{Network, WireFrame};
use keyframe_bft::types::basic::PubKeyBytes;
use keyframe_bft::types::committee::Committee;

/// A network stub that passes frames to and from nodes using channels.
///
/// The set of reachable peers is fixed on construction by [`mock_network`]; the committee
/// callbacks are no-ops. Every frame that leaves any node is also appended to a shared wire log,
/// which tests inspect to make assertions about what a node actually sent (frames identify their
/// sender through `peer_port`).
#[derive(Clone)]
pub struct NetworkStub {
    all_peers: HashMap<PubKeyBytes, Sender<WireFrame>>,
    inbox: Arc<Mutex<Receiver<WireFrame>>>,
    wire_log: Arc<Mutex<Vec<WireFrame>>>,
}

impl NetworkStub {
    /// Every frame sent through any stub of this network, in send order.
    pub fn wire_log(&self) -> Vec<WireFrame> {
        self.wire_log.lock().unwrap().clone()
    }
}

impl Network for NetworkStub {
    fn init_committee(&mut self, _: &Committee) {}

    fn update_committee(&mut self, _: &Committee) {}

    fn send(&mut self, peer: PubKeyBytes, frame: WireFrame) {
        self.wire_log.lock().unwrap().push(frame.clone());
        if let Some(peer) = self.all_peers.get(&peer) {
            let _ = peer.send(frame);
        }
    }

    fn broadcast(&mut self, frame: WireFrame) {
        self.wire_log.lock().unwrap().push(frame.clone());
        for (_, peer) in &self.all_peers {
            let _ = peer.send(frame.clone());
        }
    }

    fn recv(&mut self) -> Option<WireFrame> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(frame) => Some(frame),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => panic!(),
        }
    }
}

/// Create a vector of `NetworkStub`s connecting the provided peers, in the same order.
pub fn mock_network(peers: impl Iterator<Item = PubKeyBytes>) -> Vec<NetworkStub> {
    let wire_log = Arc::new(Mutex::new(Vec::new()));
    let mut all_peers = HashMap::new();
    let peers_and_inboxes: Vec<(PubKeyBytes, Receiver<WireFrame>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer, sender);
            (peer, receiver)
        })
        .collect();

    peers_and_inboxes
        .into_iter()
        .map(|(_, inbox)| NetworkStub {
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
            wire_log: wire_log.clone(),
        })
        .collect()
}
