//! A deterministic multi-node harness.
//!
//! Nodes are full pacemaker instances wired to a mock network; the harness plays the role of the
//! dispatch loop, shuttling frames between inboxes one at a time. Nothing runs on background
//! threads and no wall-clock timer ever fires on its own, so every test is a deterministic
//! replay: timeouts happen exactly when a test fires them.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keyframe_bft::app::{
    ExecuteBlockRequest, ExecuteError, Executor, ProduceBlockRequest, ProduceBlockResponse,
};
use keyframe_bft::chain::{ChainStore, ChainViewCamera};
use keyframe_bft::crypto::{self, EcdsaKeypair, ThresholdKeypair};
use keyframe_bft::epoch::EpochController;
use keyframe_bft::events::Event;
use keyframe_bft::graph::StageHandle;
use keyframe_bft::pacemaker::messages::ConsensusMessage;
use keyframe_bft::pacemaker::protocol::{CommittedBlock, Pacemaker, PacemakerConfig};
use keyframe_bft::router::{Network, Router, SenderHandle, WireFrame};
use keyframe_bft::scheduler::{TimerEvent, TimerHandle};
use keyframe_bft::types::basic::*;
use keyframe_bft::types::block::{Block, KeyframeData};
use keyframe_bft::types::certificates::QuorumCert;
use keyframe_bft::types::committee::{Committee, Delegate, DelegateSet};

use super::network::{mock_network, NetworkStub};
use super::store::SharedStore;

/// Knobs for the scripted executor, shared with the test body.
#[derive(Default)]
pub struct ExecControl {
    /// Heights at which block production embeds a keyframe with the given nonce.
    pub keyframe_at: HashMap<u32, u64>,
    /// Heights at which execution of a received block fails.
    pub fail_at: HashSet<u32>,
}

/// An executor that produces empty blocks with deterministic roots and executes everything
/// successfully unless scripted otherwise.
#[derive(Clone)]
pub struct TestExecutor(pub Arc<Mutex<ExecControl>>);

impl Executor for TestExecutor {
    fn produce(&mut self, request: ProduceBlockRequest) -> ProduceBlockResponse {
        let control = self.0.lock().unwrap();
        let keyframe = if request.stop {
            None
        } else {
            control
                .keyframe_at
                .get(&request.height.int())
                .map(|nonce| KeyframeData {
                    nonce: *nonce,
                    pow_blocks: Vec::new(),
                    proof: Vec::new(),
                })
        };
        ProduceBlockResponse {
            txs: Vec::new(),
            txs_root: Bytes32::default(),
            state_root: crypto::blake2b(&[&request.height.to_be_bytes()]),
            receipts_root: Bytes32::default(),
            gas_used: 0,
            keyframe,
            stage: StageHandle(request.height.int() as u64),
        }
    }

    fn execute(&mut self, request: ExecuteBlockRequest) -> Result<StageHandle, ExecuteError> {
        if self
            .0
            .lock()
            .unwrap()
            .fail_at
            .contains(&request.block.number().int())
        {
            return Err(ExecuteError::InvalidBlock);
        }
        Ok(StageHandle(request.block.number().int() as u64))
    }

    fn commit(&mut self, _block: &Block, _stage: Option<StageHandle>) {}
}

pub struct TestNode {
    pub keypair: EcdsaKeypair,
    pub threshold: ThresholdKeypair,
    pub pacemaker: Pacemaker<SharedStore, NetworkStub, TestExecutor>,
    pub epoch: EpochController,
    pub kv: SharedStore,
    pub stub: NetworkStub,
    pub router: Router,
    pub timer_requests: Receiver<(Duration, TimerEvent)>,
    pub commit_rx: Receiver<CommittedBlock>,
    /// Every block this node finalized, in finalization order.
    pub committed: Vec<CommittedBlock>,
    pub exec: Arc<Mutex<ExecControl>>,
    pub my_addr: NetAddress,
    pub event_rx: Receiver<Event>,
    /// Best-QC improvements observed through the QC store's watch.
    pub qc_watch: Receiver<QuorumCert>,
}

impl TestNode {
    pub fn camera(&self) -> ChainViewCamera<SharedStore> {
        ChainViewCamera::new(self.kv.clone())
    }
}

pub struct TestNet {
    pub nodes: Vec<TestNode>,
    pub committee: Committee,
    pub delegates: DelegateSet,
}

impl TestNet {
    /// Build `n` nodes whose delegates form a committee of `committee_size` seeded by `nonce`.
    /// Node keys are derived from fixed seeds, so the committee is the same on every run.
    pub fn new(n: usize, committee_size: usize, nonce: u64) -> TestNet {
        let keys: Vec<(EcdsaKeypair, ThresholdKeypair)> = (1..=n as u8)
            .map(|seed| {
                (
                    EcdsaKeypair::from_bytes(&[seed; 32]).unwrap(),
                    ThresholdKeypair::from_seed(&[seed; 32]).unwrap(),
                )
            })
            .collect();
        let delegates = DelegateSet::new(
            keys.iter()
                .enumerate()
                .map(|(i, (ecdsa, threshold))| Delegate {
                    name: format!("node-{i}"),
                    address: ecdsa.address(),
                    ecdsa_pubkey: ecdsa.public(),
                    threshold_pubkey: threshold.public(),
                    voting_power: 1,
                    net_addr: NetAddress::new("127.0.0.1", 9000 + i as u16),
                })
                .collect(),
        );
        let stubs = mock_network(keys.iter().map(|(ecdsa, _)| ecdsa.public()));
        let genesis = Block::genesis(Magic::V1);

        let mut committee = Committee::default();
        let nodes = keys
            .into_iter()
            .zip(stubs)
            .enumerate()
            .map(|(i, ((keypair, threshold), stub))| {
                let kv = SharedStore::new();
                let mut chain = ChainStore::new(kv.clone());
                chain.initialize(&genesis);

                let my_addr = NetAddress::new("127.0.0.1", 9000 + i as u16);
                let router = Router::new(Magic::V1, my_addr.clone());
                let sender = SenderHandle::new(stub.clone(), router.clone());
                let (timer_handle, timer_requests) = TimerHandle::new();
                let (commit_tx, commit_rx) = mpsc::channel();
                let (event_tx, event_rx) = mpsc::channel();
                let exec = Arc::new(Mutex::new(ExecControl::default()));

                let mut epoch = EpochController::new(
                    delegates.clone(),
                    committee_size,
                    keypair.public(),
                    threshold.clone(),
                    EpochId::new(0),
                );
                let change = epoch.genesis_committee(nonce);
                committee = change.committee.clone();

                let mut pacemaker = Pacemaker::new(
                    PacemakerConfig {
                        magic: Magic::V1,
                        keypair: keypair.clone(),
                        threshold_keypair: threshold.clone(),
                        base_timeout: Duration::from_secs(4),
                    },
                    ChainStore::new(kv.clone()),
                    TestExecutor(exec.clone()),
                    sender,
                    timer_handle,
                    change.committee,
                    change.role,
                    change.my_index,
                    change.in_committee,
                    EpochId::new(0),
                    Some(event_tx),
                    Some(commit_tx),
                );
                let (qc_watch_tx, qc_watch) = mpsc::channel();
                pacemaker.watch_qc(qc_watch_tx);

                TestNode {
                    keypair,
                    threshold,
                    pacemaker,
                    epoch,
                    kv,
                    stub,
                    router,
                    timer_requests,
                    commit_rx,
                    committed: Vec::new(),
                    exec,
                    my_addr,
                    event_rx,
                    qc_watch,
                }
            })
            .collect();

        TestNet {
            nodes,
            committee,
            delegates,
        }
    }

    /// The node index of the proposer of `round` in the genesis committee.
    pub fn proposer_node(&self, round: Round) -> usize {
        let proposer = self.committee.proposer(round).unwrap().ecdsa_pubkey;
        self.node_of(&proposer)
    }

    pub fn node_of(&self, pubkey: &PubKeyBytes) -> usize {
        self.nodes
            .iter()
            .position(|node| &node.keypair.public() == pubkey)
            .unwrap()
    }

    /// The committee index of node `i`, if it is in the committee.
    pub fn committee_index(&self, i: usize) -> Option<usize> {
        self.committee.index_of(&self.nodes[i].keypair.public())
    }

    pub fn start(&mut self, i: usize) {
        self.nodes[i].pacemaker.start();
        self.drain_commits(i);
    }

    pub fn start_all(&mut self) {
        for i in 0..self.nodes.len() {
            self.start(i);
        }
    }

    /// Pop one frame off node `i`'s inbox and dispatch it. Returns whether a frame was
    /// processed.
    pub fn process_one(&mut self, i: usize) -> bool {
        let frame = match self.nodes[i].stub.recv() {
            Some(frame) => frame,
            None => return false,
        };
        if let Ok((_, msg)) = self.nodes[i].router.decode_frame(&frame) {
            self.dispatch(i, msg);
        }
        true
    }

    /// Hand a message straight to node `i`'s pacemaker, bypassing the wire.
    pub fn deliver(&mut self, i: usize, msg: ConsensusMessage) {
        self.dispatch(i, msg);
    }

    fn dispatch(&mut self, i: usize, msg: ConsensusMessage) {
        match msg {
            ConsensusMessage::Proposal(_)
            | ConsensusMessage::Vote(_)
            | ConsensusMessage::NewView(_)
            | ConsensusMessage::QueryProposal(_) => self.nodes[i].pacemaker.on_message(msg),
            // The committee handshake is bookkeeping outside the pacemaker; the harness skips it
            // and installs rotations straight from commit notifications.
            _ => {}
        }
        self.drain_commits(i);
    }

    /// Drain node `i`'s commit notifications, applying epoch rotations as the epoch controller
    /// dictates.
    pub fn drain_commits(&mut self, i: usize) {
        loop {
            let committed = match self.nodes[i].commit_rx.try_recv() {
                Ok(committed) => committed,
                Err(_) => return,
            };
            self.nodes[i].committed.push(committed.clone());
            if let Some(change) = self.nodes[i].epoch.on_commit(&committed) {
                self.nodes[i].pacemaker.install_epoch(
                    change.epoch,
                    change.committee,
                    change.role,
                    change.my_index,
                    change.in_committee,
                );
            }
        }
    }

    /// Round-robin over all inboxes except `skip`, processing one frame per node per iteration,
    /// until `pred` holds or nothing moves. Returns whether `pred` held.
    pub fn pump_until<F: Fn(&TestNet) -> bool>(
        &mut self,
        skip: &[usize],
        max_steps: usize,
        pred: F,
    ) -> bool {
        for _ in 0..max_steps {
            if pred(self) {
                return true;
            }
            let mut progressed = false;
            for i in 0..self.nodes.len() {
                if skip.contains(&i) {
                    continue;
                }
                if self.process_one(i) {
                    progressed = true;
                }
            }
            if !progressed {
                return pred(self);
            }
        }
        pred(self)
    }

    /// Fire the round timeout for node `i`'s current round, as the scheduler eventually would.
    pub fn fire_timeout(&mut self, i: usize) {
        while self.nodes[i].timer_requests.try_recv().is_ok() {}
        let round = self.nodes[i].pacemaker.current_round();
        self.nodes[i]
            .pacemaker
            .on_timer(TimerEvent::RoundTimeout(round));
        self.drain_commits(i);
    }

    /// All frames node `i` has sent so far, decoded.
    pub fn sent_by(&self, i: usize) -> Vec<ConsensusMessage> {
        let port = self.nodes[i].my_addr.port.to_string();
        self.nodes[i]
            .stub
            .wire_log()
            .iter()
            .filter(|frame| frame.peer_port == port)
            .filter_map(|frame| self.nodes[i].router.decode_frame(frame).ok())
            .map(|(_, msg)| msg)
            .collect()
    }

    /// Pop one raw frame from node `i`'s inbox without processing it.
    pub fn recv_frame(&mut self, i: usize) -> Option<WireFrame> {
        self.nodes[i].stub.recv()
    }
}
