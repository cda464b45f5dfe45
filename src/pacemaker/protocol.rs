/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The pacemaker state machine.
//!
//! A single-threaded cooperative state machine driven by two event kinds: inbound messages
//! ([`Pacemaker::on_message`]) and timer firings ([`Pacemaker::on_timer`]). All state mutations
//! happen on the dispatch thread that calls these methods; the pacemaker never spawns work of its
//! own.
//!
//! ## Safety and liveness in one paragraph
//!
//! A validator votes for a proposal iff it extends the locked block (within a bounded ancestor
//! walk) and its round is higher than the last round voted in. A new quorum certificate locks the
//! certified block's parent and finalizes its grandparent, provided the three blocks sit at
//! consecutive heights connected by parent links. Liveness comes from round timeouts with
//! exponential backoff: a timed-out validator hands its highest QC to the next proposer, which
//! proposes once a quorum of peers has knocked.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::app::{ExecuteBlockRequest, Executor, ProduceBlockRequest};
use crate::chain::{ChainStore, KVStore};
use crate::codec;
use crate::crypto::{self, EcdsaKeypair, ThresholdKeypair};
use crate::events::*;
use crate::graph::{NodeId, ProposalGraph, ProposalNode};
use crate::pacemaker::messages::{ConsensusMessage, NewView, Proposal, QueryProposal, Vote};
use crate::pacemaker::types::{
    leader_majority_two_third, DoubleSignDetector, NewViewCollector, VoteTally, ViewTimeouts,
};
use crate::qc_store::QcStore;
use crate::router::{Network, SenderHandle};
use crate::scheduler::{TimerEvent, TimerHandle};
use crate::types::basic::*;
use crate::types::block::{Block, BlockType, Evidence, Header, Violation};
use crate::types::certificates::QuorumCert;
use crate::types::committee::{Committee, Role};

/// How many parent hops the extends-locked safety walk inspects before giving up.
const LOCK_WALK_MAX_HOPS: usize = 10;

/// Immutable parameters of the pacemaker.
#[derive(Clone)]
pub struct PacemakerConfig {
    pub magic: Magic,
    pub keypair: EcdsaKeypair,
    pub threshold_keypair: ThresholdKeypair,
    pub base_timeout: std::time::Duration,
}

/// Notification emitted on the outbound commit channel for every finalized block, in strict
/// height order. The transaction pool and the [epoch controller](crate::epoch::EpochController)
/// consume these; the pacemaker never calls back into them synchronously.
#[derive(Clone, Debug)]
pub struct CommittedBlock {
    pub id: BlockId,
    pub height: BlockHeight,
    pub block_type: BlockType,
    pub epoch: EpochId,
    pub keyframe_nonce: Option<u64>,
}

pub struct Pacemaker<K: KVStore, N: Network, E: Executor> {
    config: PacemakerConfig,

    committee: Committee,
    /// The committee of the previous epoch. QCs formed at the epoch boundary verify against it.
    prev_committee: Option<(EpochId, Committee)>,
    my_index: usize,
    role: Role,
    in_committee: bool,

    current_round: Round,
    current_epoch: EpochId,
    qc_store: QcStore,
    b_leaf: BlockId,
    b_locked: BlockId,
    b_executed: BlockId,
    last_voted_round: Option<Round>,
    last_proposed_round: Option<Round>,

    graph: ProposalGraph,
    tallies: HashMap<BlockId, VoteTally>,
    new_view: Option<NewViewCollector>,
    detector: DoubleSignDetector,
    pending_violations: Vec<(BlockHeight, Violation)>,
    /// The first proposal of the next epoch, parked until the rotation it rode in on installs.
    pending_next_epoch: Option<Proposal>,

    chain: ChainStore<K>,
    executor: E,
    sender: SenderHandle<N>,
    timers: TimerHandle,
    view_timeouts: ViewTimeouts,

    event_publisher: Option<Sender<Event>>,
    commit_publisher: Option<Sender<CommittedBlock>>,
}

impl<K: KVStore, N: Network, E: Executor> Pacemaker<K, N, E> {
    /// Build a pacemaker resuming from the persisted chain state: the best QC, the locked height
    /// and the round counters all come from the chain store.
    pub fn new(
        config: PacemakerConfig,
        chain: ChainStore<K>,
        executor: E,
        sender: SenderHandle<N>,
        timers: TimerHandle,
        committee: Committee,
        role: Role,
        my_index: usize,
        in_committee: bool,
        epoch: EpochId,
        event_publisher: Option<Sender<Event>>,
        commit_publisher: Option<Sender<CommittedBlock>>,
    ) -> Pacemaker<K, N, E> {
        // Safety: the chain store is initialized with the genesis block before any replica
        // starts; a missing best block or best QC means storage corruption.
        let best_block = chain.best_block().expect("initialized chain has a best block");
        let best_qc = chain.best_qc().expect("initialized chain has a best QC");
        let locked_id = chain
            .block_at_height(chain.locked_height())
            .expect("locked height is a committed height");

        let base_timeout = config.base_timeout;
        Pacemaker {
            config,
            committee,
            prev_committee: None,
            my_index,
            role,
            in_committee,
            current_round: chain.highest_round_entered(),
            current_epoch: epoch,
            b_leaf: best_qc.block_id,
            qc_store: QcStore::new(best_qc),
            b_locked: locked_id,
            b_executed: best_block.id(),
            last_voted_round: None,
            last_proposed_round: None,
            graph: ProposalGraph::new(),
            tallies: HashMap::new(),
            new_view: None,
            detector: DoubleSignDetector::new(),
            pending_violations: Vec::new(),
            pending_next_epoch: None,
            chain,
            executor,
            sender,
            timers,
            view_timeouts: ViewTimeouts::new(base_timeout),
            event_publisher,
            commit_publisher,
        }
    }

    /// Enter the current round: arm its timer and, if this node is its proposer, propose.
    pub fn start(&mut self) {
        self.schedule_round_timeout();
        Event::StartRound(StartRoundEvent {
            timestamp: SystemTime::now(),
            round: self.current_round,
        })
        .publish(&self.event_publisher);

        if self.is_proposer(self.current_round) {
            self.propose(self.current_round);
        }
    }

    /// Handle one inbound consensus message. Committee handshake messages are routed to the
    /// epoch controller before this point; receiving one here is a routing bug worth logging.
    pub fn on_message(&mut self, msg: ConsensusMessage) {
        if msg.header().magic != self.config.magic {
            return;
        }
        match msg {
            ConsensusMessage::Proposal(proposal) => self.on_proposal(proposal),
            ConsensusMessage::Vote(vote) => self.on_vote(vote),
            ConsensusMessage::NewView(new_view) => self.on_new_view(new_view),
            ConsensusMessage::QueryProposal(query) => self.on_query_proposal(query),
            ConsensusMessage::NewCommittee(_)
            | ConsensusMessage::AnnounceCommittee(_)
            | ConsensusMessage::CommitCommittee(_)
            | ConsensusMessage::NotaryAnnounce(_) => {
                log::debug!("committee handshake message reached the pacemaker; dropped")
            }
        }
    }

    /// Handle a fired timer event.
    pub fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::RoundTimeout(round) => self.on_round_timeout(round),
        }
    }

    /// Install a freshly rotated committee: reset the round clock, drop per-epoch collectors, and
    /// start round 0 of the new epoch.
    pub fn install_epoch(
        &mut self,
        epoch: EpochId,
        committee: Committee,
        role: Role,
        my_index: usize,
        in_committee: bool,
    ) {
        let old_committee = std::mem::take(&mut self.committee);
        self.prev_committee = Some((self.current_epoch, old_committee));
        self.current_epoch = epoch;
        self.committee = committee;
        self.role = role;
        self.my_index = my_index;
        self.in_committee = in_committee;

        self.current_round = Round::init();
        self.chain.set_highest_round_entered(Round::init());
        self.last_voted_round = None;
        self.last_proposed_round = None;
        self.chain.set_last_voted_round(Round::init());
        self.tallies.clear();
        self.new_view = None;
        self.view_timeouts.on_commit();

        Event::EpochChange(EpochChangeEvent {
            timestamp: SystemTime::now(),
            epoch,
            committee_size: self.committee.len(),
        })
        .publish(&self.event_publisher);
        log::info!(
            "epoch {} installed, committee size {}, role {:?}",
            epoch,
            self.committee.len(),
            self.role
        );

        self.start();

        // Re-admit the proposal that announced this epoch, if one was parked.
        if let Some(parked) = self.pending_next_epoch.take() {
            if parked.header.epoch == self.current_epoch {
                self.on_proposal(parked);
            }
        }
    }

    /* ↓↓↓ Accessors used by the replica surface and tests ↓↓↓ */

    pub fn current_round(&self) -> Round {
        self.current_round
    }

    pub fn current_epoch(&self) -> EpochId {
        self.current_epoch
    }

    pub fn qc_high(&self) -> &QuorumCert {
        self.qc_store.best_qc()
    }

    pub fn locked_height(&self) -> BlockHeight {
        self.b_locked.height()
    }

    pub fn executed_height(&self) -> BlockHeight {
        self.b_executed.height()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Register a watcher over best-QC improvements. Called by the replica at startup, which
    /// exposes the stream through [`Replica::qc_updates`](crate::replica::Replica::qc_updates).
    pub fn watch_qc(&mut self, watcher: Sender<QuorumCert>) {
        self.qc_store.watch(watcher);
    }

    /* ↓↓↓ Proposing ↓↓↓ */

    fn is_proposer(&self, round: Round) -> bool {
        self.in_committee
            && self
                .committee
                .proposer(round)
                .is_some_and(|p| p.index as usize == self.my_index)
    }

    /// Build and broadcast a proposal for `round` extending `b_leaf`, then vote for it.
    fn propose(&mut self, round: Round) {
        if !self.is_proposer(round) {
            return;
        }
        if self.last_proposed_round.is_some_and(|last| round <= last) {
            return;
        }
        let parent = match self.block_by_id(&self.b_leaf) {
            Some(parent) => parent,
            None => {
                log::warn!("cannot propose: leaf block {} unknown", self.b_leaf);
                return;
            }
        };

        let height = parent.number() + 1;
        let stop = match self.wind_down_state(&parent) {
            WindDown::Active => false,
            WindDown::Stopping => true,
            WindDown::Stopped => {
                log::info!("committee wound down; waiting for epoch change");
                return;
            }
        };

        let response = self.executor.produce(ProduceBlockRequest {
            parent: &parent,
            height,
            round,
            epoch: self.current_epoch,
            stop,
        });

        let block_type = if stop {
            BlockType::SBlock
        } else if response.keyframe.is_some() {
            BlockType::KBlock
        } else {
            BlockType::MBlock
        };
        // The first non-stop block of an epoch establishes the committee on chain.
        let committee_info = if !stop
            && (parent.is_kblock() || parent.is_sblock())
        {
            Some(self.committee.to_committee_infos(self.current_epoch))
        } else {
            None
        };
        let last_kframe_height = if parent.is_kblock() {
            parent.number()
        } else {
            parent.header.last_kframe_height
        };

        let my_address = self.config.keypair.address();
        let mut block = Block {
            header: Header {
                parent_id: parent.id(),
                timestamp: unix_now(),
                gas_limit: parent.header.gas_limit,
                last_kframe_height,
                block_type,
                beneficiary: my_address,
                proposer: my_address,
                gas_used: if stop { 0 } else { response.gas_used },
                total_score: parent.header.total_score + 1,
                txs_root: if stop { Bytes32::default() } else { response.txs_root },
                state_root: response.state_root,
                receipts_root: if stop { Bytes32::default() } else { response.receipts_root },
                evidence_root: Bytes32::default(),
                signature: SignatureBytes::default(),
            },
            txs: if stop { Vec::new() } else { response.txs },
            parent_qc: Some(self.qc_store.best_qc().clone()),
            committee_info,
            keyframe: if stop { None } else { response.keyframe },
            magic: self.config.magic,
        };
        block.header.evidence_root = block.evidence_payload_hash();
        let signature = self.config.keypair.sign(&block.header.signing_hash());
        let block = block.with_signature(signature);
        let block_bytes = codec::encode_block(&block);
        let block_id = block.id();

        // Record our own signing artifact so an equivocating restart at the same round trips the
        // same detector everyone else runs.
        if let Some(violation) = self.detector.record(
            height,
            round,
            self.my_index as u32,
            &self.config.keypair.public(),
            block.header.signing_hash(),
            block.header.signature.bytes().to_vec(),
        ) {
            self.note_violation(height, violation);
            return;
        }

        let parent_qc = self.qc_store.best_qc().clone();
        let node_id = self.graph.insert(ProposalNode {
            height,
            round,
            parent: None,
            children: Vec::new(),
            block: block.clone(),
            block_bytes: block_bytes.clone(),
            parent_qc: parent_qc.clone(),
            block_type,
            processed: true,
            stage: Some(response.stage),
            mine: true,
        });

        self.last_proposed_round = Some(round);
        self.enter_round(round);
        log::info!("proposing {}", block.oneliner());
        Event::Propose(ProposeEvent {
            timestamp: SystemTime::now(),
            block: block_id,
            height,
            round,
        })
        .publish(&self.event_publisher);

        let proposal = Proposal::new(
            &self.config.keypair,
            self.config.magic,
            round,
            self.current_epoch,
            block_bytes,
            parent_qc,
        );
        self.sender.broadcast(proposal);

        self.vote_for(node_id);
    }

    /* ↓↓↓ Receiving proposals ↓↓↓ */

    fn on_proposal(&mut self, proposal: Proposal) {
        if proposal.header.epoch != self.current_epoch {
            if proposal.header.epoch == self.current_epoch.next() {
                // The first proposal of the next epoch carries the final QC of this one, which
                // finalizes our stop block and triggers the rotation. Extract the QC now and
                // park the proposal until the new committee is installed.
                let qc = proposal.parent_qc.clone();
                if self.verify_qc(&qc) {
                    self.update_qc_high(&qc);
                    self.try_advance_chain();
                    self.pending_next_epoch = Some(proposal);
                }
            } else {
                log::debug!(
                    "proposal for epoch {} in epoch {}; dropped",
                    proposal.header.epoch,
                    self.current_epoch
                );
            }
            return;
        }
        let round = proposal.header.round;
        if round < self.current_round {
            log::debug!("stale proposal for round {round}, current {}", self.current_round);
            return;
        }

        let block = match codec::decode_block(&proposal.block_bytes) {
            Ok(block) => block,
            Err(_) => {
                log::debug!("malformed proposal payload from {:?}", proposal.header.sender);
                return;
            }
        };
        let height = block.number();
        if height <= self.b_executed.height() {
            return;
        }

        // The proposer of the round must have both sent the message and signed the block.
        let expected = match self.committee.proposer(round) {
            Some(member) => member.clone(),
            None => return,
        };
        if proposal.header.sender != expected.ecdsa_pubkey {
            log::debug!("proposal for round {round} from non-proposer; dropped");
            return;
        }
        let signer = match block.header.signer() {
            Ok(signer) => signer,
            Err(_) => return,
        };
        if signer != expected.address {
            log::debug!("block signer is not the round {round} proposer; dropped");
            return;
        }

        let block_id = block.id();
        if self.graph.by_block_id(&block_id).is_some() {
            // Duplicate delivery, including the loopback of our own broadcast.
            return;
        }

        if let Some(violation) = self.detector.record(
            height,
            round,
            expected.index,
            &expected.ecdsa_pubkey,
            block.header.signing_hash(),
            block.header.signature.bytes().to_vec(),
        ) {
            log::warn!("equivocating proposal at height {height} round {round}");
            self.note_violation(height, violation);
            return;
        }

        // The embedded parent QC must verify against the committee active in its epoch. At the
        // epoch boundary the first proposal carries a QC formed by the previous committee.
        let parent_qc = proposal.parent_qc.clone();
        if !self.verify_qc(&parent_qc) {
            log::debug!("parent QC failed verification; dropped");
            return;
        }

        // The parent must be addressable: the committed tip or a live graph node. If it is
        // missing we are behind; ask the round's proposer for it and drop the present proposal.
        let parent_ok = match self.graph.at_height(height - 1) {
            Some(parent_node_id) => {
                // Safety: at_height only returns live indices.
                self.graph.get(parent_node_id).unwrap().id() == block.header.parent_id
            }
            None => block.header.parent_id == self.b_executed,
        };
        if !parent_ok {
            log::info!("missing parent for proposal at height {height}; querying");
            let query = QueryProposal::new(
                &self.config.keypair,
                self.config.magic,
                self.current_round,
                self.current_epoch,
                height - 1,
                parent_qc.round,
            );
            self.sender.send(proposal.header.sender, query);
            return;
        }

        if !self.block_type_admissible(&block) {
            log::debug!("inadmissible {:?} at height {height}; dropped", block.block_type());
            return;
        }

        let node_id = self.graph.insert(ProposalNode {
            height,
            round,
            parent: None,
            children: Vec::new(),
            block_bytes: proposal.block_bytes.clone(),
            parent_qc: parent_qc.clone(),
            block_type: block.block_type(),
            block: block.clone(),
            processed: false,
            stage: None,
            mine: false,
        });
        Event::InsertProposal(InsertProposalEvent {
            timestamp: SystemTime::now(),
            block: block_id,
            height,
            round,
        })
        .publish(&self.event_publisher);
        Event::ReceiveProposal(ReceiveProposalEvent {
            timestamp: SystemTime::now(),
            origin: proposal.header.sender,
            block: block_id,
            height,
            round,
        })
        .publish(&self.event_publisher);

        self.update_qc_high(&parent_qc);
        self.try_advance_chain();

        // Safety rule: only vote for proposals that extend the locked block and move the round
        // forward.
        let extends_locked = self.b_locked.height() <= self.b_executed.height()
            || self.graph.extends(node_id, &self.b_locked, LOCK_WALK_MAX_HOPS);
        if !extends_locked {
            log::debug!("proposal at height {height} does not extend locked block; not voting");
            return;
        }
        if self.last_voted_round.is_some_and(|last| round <= last) {
            return;
        }

        // Execute before voting; a failed execution keeps the node for re-execution but casts no
        // vote.
        let parent_block = match self.block_by_id(&block.header.parent_id) {
            Some(parent_block) => parent_block,
            None => return,
        };
        match self.executor.execute(ExecuteBlockRequest {
            block: &block,
            parent: &parent_block,
        }) {
            Ok(stage) => {
                let node = self.graph.get_mut(node_id).unwrap();
                node.processed = true;
                node.stage = Some(stage);
            }
            Err(err) => {
                log::warn!("execution failed for height {height}: {err:?}; not voting");
                return;
            }
        }

        self.enter_round(round);
        if self.in_committee {
            self.vote_for(node_id);
        }
    }

    /// Block-type admission per the wind-down rules: after a keyframe only stop blocks extend the
    /// old committee's chain, and the first ordinary block of the next epoch must establish the
    /// committee it was proposed under.
    fn block_type_admissible(&self, block: &Block) -> bool {
        let parent = match self.block_by_id(&block.header.parent_id) {
            Some(parent) => parent,
            None => return false,
        };
        match block.block_type() {
            BlockType::SBlock => {
                // A stop block's parent must be the epoch's keyframe, or the first stop block on
                // top of it. The genesis block never winds anything down.
                if parent.number().int() == 0 {
                    false
                } else if parent.is_kblock() {
                    true
                } else if parent.is_sblock() {
                    match self.block_by_id(&parent.header.parent_id) {
                        Some(grandparent) => grandparent.is_kblock(),
                        None => false,
                    }
                } else {
                    false
                }
            }
            BlockType::MBlock | BlockType::KBlock => {
                if parent.is_kblock() || parent.is_sblock() {
                    // First block of a new epoch: must carry the committee info of the epoch we
                    // rotated into.
                    block
                        .committee_info
                        .as_ref()
                        .is_some_and(|info| info.epoch == self.current_epoch)
                } else {
                    true
                }
            }
        }
    }

    /* ↓↓↓ Voting and vote aggregation ↓↓↓ */

    /// Sign and send a vote for the (already executed) node to the next round's proposer.
    fn vote_for(&mut self, node_id: NodeId) {
        let (block_id, height, round) = {
            // Safety: callers pass live node indices.
            let node = self.graph.get(node_id).unwrap();
            (node.id(), node.height, node.round)
        };
        let msg_hash = QuorumCert::voting_hash(&block_id, height, round, self.current_epoch);
        let partial = self.config.threshold_keypair.sign(&msg_hash);

        self.last_voted_round = Some(round);
        self.chain.set_last_voted_round(round);

        let vote = Vote::new(
            &self.config.keypair,
            self.config.magic,
            round,
            self.current_epoch,
            block_id,
            self.my_index as u32,
            partial,
        );
        let next_proposer = match self.committee.proposer(round + 1) {
            Some(member) => member.ecdsa_pubkey,
            None => return,
        };
        self.sender.send(next_proposer, vote);
        Event::Vote(VoteEvent {
            timestamp: SystemTime::now(),
            block: block_id,
            round,
        })
        .publish(&self.event_publisher);
    }

    fn on_vote(&mut self, vote: Vote) {
        let vote_round = vote.header.round;
        // Votes on round r are aggregated by the proposer of r + 1.
        if !self.is_proposer(vote_round + 1) {
            return;
        }
        if vote.header.epoch != self.current_epoch {
            return;
        }

        let member = match self.committee.member(vote.signer_index as usize) {
            Some(member) => member.clone(),
            None => {
                log::debug!("vote with out-of-committee signer index; dropped");
                return;
            }
        };
        if member.ecdsa_pubkey != vote.header.sender {
            log::debug!("vote sender does not own its signer index; dropped");
            return;
        }

        let height = vote.block_id.height();
        if height <= self.b_executed.height() {
            return;
        }
        let msg_hash =
            QuorumCert::voting_hash(&vote.block_id, height, vote_round, self.current_epoch);
        if !crypto::threshold_verify(&vote.partial_sig, &[member.threshold_pubkey], &msg_hash) {
            log::debug!("vote partial signature invalid; dropped");
            return;
        }

        if let Some(violation) = self.detector.record(
            height,
            vote_round,
            vote.signer_index,
            &member.ecdsa_pubkey,
            msg_hash,
            vote.partial_sig.bytes().to_vec(),
        ) {
            log::warn!(
                "double vote by index {} at height {height} round {vote_round}",
                vote.signer_index
            );
            self.note_violation(height, violation);
            return;
        }

        if self.graph.by_block_id(&vote.block_id).is_none() {
            log::debug!("vote for unknown block {}; dropped", vote.block_id);
            return;
        }

        Event::ReceiveVote(ReceiveVoteEvent {
            timestamp: SystemTime::now(),
            origin: vote.header.sender,
            block: vote.block_id,
            round: vote_round,
        })
        .publish(&self.event_publisher);

        let committee_size = self.committee.len();
        let epoch = self.current_epoch;
        let tally = self.tallies.entry(vote.block_id).or_insert_with(|| {
            VoteTally::new(
                vote.block_id,
                height,
                vote_round,
                epoch,
                msg_hash,
                committee_size,
            )
        });
        if tally.round != vote_round {
            return;
        }
        tally.collect(vote.signer_index as usize, vote.partial_sig);
        let quorum = leader_majority_two_third(tally.count(), committee_size);

        if quorum {
            // Safety: the entry was just inserted or found above.
            let tally = self.tallies.remove(&vote.block_id).unwrap();
            let qc = match QcStore::build(&tally, &self.committee) {
                Ok(qc) => qc,
                Err(err) => {
                    log::error!("QC aggregation failed: {err:?}");
                    return;
                }
            };
            Event::CollectQc(CollectQcEvent {
                timestamp: SystemTime::now(),
                qc: qc.clone(),
            })
            .publish(&self.event_publisher);
            log::info!("collected QC for height {} round {}", qc.height, qc.round);

            self.update_qc_high(&qc);
            self.try_advance_chain();
            self.propose(vote_round + 1);
        }
    }

    /* ↓↓↓ View changes ↓↓↓ */

    fn on_round_timeout(&mut self, round: Round) {
        // Advancing the round logically cancels the timers of prior rounds: their firings land
        // here and are discarded.
        if round != self.current_round {
            return;
        }
        Event::RoundTimeout(RoundTimeoutEvent {
            timestamp: SystemTime::now(),
            round,
            timeout: self.view_timeouts.current(),
        })
        .publish(&self.event_publisher);
        log::info!("round {round} timed out");

        let next_round = round + 1;
        if self.in_committee {
            if self.is_proposer(next_round) {
                // Next proposer is us: count ourselves instead of sending a message.
                self.collect_new_view(self.my_index, next_round);
            } else if let Some(next_proposer) = self.committee.proposer(next_round) {
                let new_view = NewView::new(
                    &self.config.keypair,
                    self.config.magic,
                    next_round,
                    self.current_epoch,
                    self.qc_store.best_qc().clone(),
                );
                self.sender.send(next_proposer.ecdsa_pubkey, new_view);
                Event::NewView(NewViewEvent {
                    timestamp: SystemTime::now(),
                    round: next_round,
                })
                .publish(&self.event_publisher);
            }
        }

        self.view_timeouts.on_view_change();
        self.enter_round(next_round);
    }

    fn on_new_view(&mut self, new_view: NewView) {
        if new_view.header.epoch != self.current_epoch {
            return;
        }
        // Merge the sender's highest QC regardless of whether we lead the target round.
        if !self.verify_qc(&new_view.qc_high) {
            return;
        }
        self.update_qc_high(&new_view.qc_high);
        self.try_advance_chain();

        let target_round = new_view.header.round;
        if !self.is_proposer(target_round) {
            return;
        }
        let sender_index = match self.committee.index_of(&new_view.header.sender) {
            Some(index) => index,
            None => return,
        };
        Event::ReceiveNewView(ReceiveNewViewEvent {
            timestamp: SystemTime::now(),
            origin: new_view.header.sender,
            round: target_round,
        })
        .publish(&self.event_publisher);

        self.collect_new_view(sender_index, target_round);
    }

    fn collect_new_view(&mut self, sender_index: usize, target_round: Round) {
        if target_round < self.current_round {
            return;
        }
        if self
            .new_view
            .as_ref()
            .map(|collector| collector.round())
            != Some(target_round)
        {
            self.new_view = Some(NewViewCollector::new(target_round, self.committee.len()));
        }
        // Safety: replaced with Some above when absent or for a different round.
        let quorum = self.new_view.as_mut().unwrap().collect(sender_index);
        if quorum {
            self.new_view = None;
            let round = self.current_round.max(target_round);
            self.propose(round);
        }
    }

    fn on_query_proposal(&mut self, query: QueryProposal) {
        let node_id = match self.graph.address(query.height, query.round) {
            Some(node_id) => node_id,
            None => {
                log::debug!(
                    "no proposal to re-send for height {} round {}",
                    query.height,
                    query.round
                );
                return;
            }
        };
        let (round, block_bytes, parent_qc) = {
            let node = self.graph.get(node_id).unwrap();
            (node.round, node.block_bytes.clone(), node.parent_qc.clone())
        };
        let proposal = Proposal::new(
            &self.config.keypair,
            self.config.magic,
            round,
            self.current_epoch,
            block_bytes,
            parent_qc,
        );
        self.sender.send(query.header.sender, proposal);
    }

    /* ↓↓↓ Chain advancement: qc_high, locking, committing ↓↓↓ */

    /// Verify a certificate against the committee active in its epoch. Only the current and the
    /// immediately previous committee are retained; anything older is unverifiable and dropped.
    fn verify_qc(&self, qc: &QuorumCert) -> bool {
        if qc.is_genesis() {
            return true;
        }
        if qc.epoch == self.current_epoch {
            return QcStore::verify(qc, &self.committee);
        }
        match &self.prev_committee {
            Some((epoch, committee)) if *epoch == qc.epoch => QcStore::verify(qc, committee),
            _ => false,
        }
    }

    fn update_qc_high(&mut self, qc: &QuorumCert) {
        if self.qc_store.update(qc) {
            self.b_leaf = qc.block_id;
            self.chain.set_best_qc(qc);
            Event::UpdateQcHigh(UpdateQcHighEvent {
                timestamp: SystemTime::now(),
                qc_high: qc.clone(),
            })
            .publish(&self.event_publisher);
        }
    }

    /// Re-evaluate the two-chain and three-chain rules from the current highest QC. Idempotent;
    /// called whenever the highest QC improves or a missing ancestor arrives.
    fn try_advance_chain(&mut self) {
        let qc1 = self.qc_store.best_qc().clone();
        if qc1.is_genesis() {
            return;
        }
        let n1 = match self.graph.by_block_id(&qc1.block_id) {
            Some(n1) => n1,
            None => return,
        };

        // Epoch tail: the stop block sitting directly on the keyframe is final as soon as it is
        // certified; nothing later in this epoch can ever extend a three-chain over it. A second
        // stop block never finalizes this way — it is liveness padding, and committing it on a
        // bare QC could fork nodes that never see that QC.
        let n1_header = &self.graph.get(n1).unwrap().block.header;
        if n1_header.block_type.is_sblock()
            && n1_header.last_kframe_height + 1 == n1_header.number()
        {
            self.commit(qc1.block_id, &qc1);
            return;
        }

        let qc2 = self.graph.get(n1).unwrap().parent_qc.clone();
        if qc2.is_genesis() || qc2.height + 1 != qc1.height {
            return;
        }
        // Two-chain: lock the certified block's parent.
        if qc2.block_id.height() > self.b_locked.height() {
            self.b_locked = qc2.block_id;
            self.chain.set_locked_height(qc2.block_id.height());
            Event::UpdateLocked(UpdateLockedEvent {
                timestamp: SystemTime::now(),
                block: qc2.block_id,
                height: qc2.block_id.height(),
            })
            .publish(&self.event_publisher);
        }

        let n2 = match self.graph.by_block_id(&qc2.block_id) {
            Some(n2) => n2,
            None => return,
        };
        let qc3 = self.graph.get(n2).unwrap().parent_qc.clone();
        if qc3.is_genesis() || qc3.height + 1 != qc2.height {
            return;
        }
        // Three-chain complete: finalize through the oldest of the three.
        self.commit(qc3.block_id, &qc3);
    }

    /// Finalize every block from the executed tip up to and including `target_id`, in height
    /// order with no gaps.
    fn commit(&mut self, target_id: BlockId, target_qc: &QuorumCert) {
        if target_id.height() <= self.b_executed.height() {
            return;
        }
        let target_node = match self.graph.by_block_id(&target_id) {
            Some(node_id) => node_id,
            None => return,
        };
        let path = match self.graph.chain_between(self.b_executed.height(), target_node) {
            Some(path) if !path.is_empty() => path,
            _ => return,
        };
        // The path must connect to the executed tip; a gap means we are missing ancestors and
        // may not finalize anything yet.
        if self.graph.get(path[0]).unwrap().block.header.parent_id != self.b_executed {
            return;
        }

        for (i, &node_id) in path.iter().enumerate() {
            let (block, stage, height) = {
                let node = self.graph.get(node_id).unwrap();
                (node.block.clone(), node.stage, node.height)
            };
            let cert_qc = if i + 1 < path.len() {
                self.graph.get(path[i + 1]).unwrap().parent_qc.clone()
            } else {
                target_qc.clone()
            };

            let voting_violations = self.drain_violations(height);
            let evidence = Evidence {
                voting_sig: cert_qc.voter_agg_sig,
                voting_msg_hash: cert_qc.voter_msg_hash,
                voting_bitmap: cert_qc.voter_bitmap.clone(),
                voting_violations,
                ..Evidence::default()
            };

            self.chain.commit_block(&block, &cert_qc, &evidence);
            self.executor.commit(&block, stage);
            self.b_executed = block.id();

            Event::CommitBlock(CommitBlockEvent {
                timestamp: SystemTime::now(),
                block: self.b_executed,
                height,
            })
            .publish(&self.event_publisher);
            log::info!("committed {}", block.oneliner());
            if let Some(commit_publisher) = &self.commit_publisher {
                let _ = commit_publisher.send(CommittedBlock {
                    id: self.b_executed,
                    height,
                    block_type: block.block_type(),
                    epoch: block.epoch(),
                    keyframe_nonce: block.keyframe.as_ref().map(|k| k.nonce),
                });
            }
        }

        self.view_timeouts.on_commit();
        self.graph.prune_below(target_id.height());
        self.detector.prune_below(target_id.height());
        self.tallies
            .retain(|block_id, _| block_id.height() > target_id.height());
    }

    /* ↓↓↓ Small helpers ↓↓↓ */

    /// Look a block up in the proposal graph first, then in the committed chain.
    fn block_by_id(&self, id: &BlockId) -> Option<Block> {
        if let Some(node_id) = self.graph.by_block_id(id) {
            return Some(self.graph.get(node_id).unwrap().block.clone());
        }
        self.chain.block(id)
    }

    /// Where the current committee stands in its lifecycle, judged from the block about to be
    /// extended.
    fn wind_down_state(&self, parent: &Block) -> WindDown {
        if parent.epoch() != self.current_epoch && parent.number().int() != 0 {
            // The parent belongs to the previous epoch: we are its successor committee.
            return WindDown::Active;
        }
        if parent.is_kblock() && parent.number().int() != 0 {
            WindDown::Stopping
        } else if parent.is_sblock() {
            match self.block_by_id(&parent.header.parent_id) {
                Some(grandparent) if grandparent.is_kblock() => WindDown::Stopping,
                _ => WindDown::Stopped,
            }
        } else {
            WindDown::Active
        }
    }

    fn note_violation(&mut self, height: BlockHeight, violation: Violation) {
        Event::ViolationDetected(ViolationDetectedEvent {
            timestamp: SystemTime::now(),
            violation: violation.clone(),
        })
        .publish(&self.event_publisher);
        self.pending_violations.push((height, violation));
    }

    /// Remove and return recorded violations for `height`, deduplicated, each attached exactly
    /// once to the evidence finalized with that height.
    fn drain_violations(&mut self, height: BlockHeight) -> Vec<Violation> {
        let mut drained = Vec::new();
        self.pending_violations.retain(|(h, violation)| {
            if *h == height {
                if !drained.contains(violation) {
                    drained.push(violation.clone());
                }
                false
            } else {
                true
            }
        });
        drained
    }

    /// Move the round forward monotonically and arm its timer.
    fn enter_round(&mut self, round: Round) {
        if round > self.current_round {
            self.current_round = round;
            self.chain.set_highest_round_entered(round);
            Event::StartRound(StartRoundEvent {
                timestamp: SystemTime::now(),
                round,
            })
            .publish(&self.event_publisher);
        }
        self.schedule_round_timeout();
    }

    fn schedule_round_timeout(&mut self) {
        self.timers.schedule(
            self.view_timeouts.current(),
            TimerEvent::RoundTimeout(self.current_round),
        );
    }
}

enum WindDown {
    /// Ordinary operation: m-blocks (or a k-block, if the PoW source found an anchor).
    Active,
    /// A keyframe terminated the epoch; only stop blocks may extend the chain.
    Stopping,
    /// The stop allowance is exhausted; nothing to propose until the epoch changes.
    Stopped,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
