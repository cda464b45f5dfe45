/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that [initialize](Replica::initialize) and start a replica, as well as
//! [the type](Replica) which keeps the replica alive.
//!
//! A running replica is four threads around one dispatch loop: the poller (drains the network
//! provider), the scheduler (timer queue), the dispatch loop itself (all consensus state), and
//! the event bus (user handlers and logging). The [`Replica`] value owns all of them; dropping it
//! shuts them down in dependency order.
//!
//! The only cross-module surfaces a running replica exposes are read-only: the
//! [`ChainViewCamera`], the commit subscription channel, and the best-QC watch stream. Every
//! other interaction goes through consensus messages.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

use crate::algorithm::Algorithm;
use crate::app::Executor;
use crate::chain::{ChainStore, ChainViewCamera, KVStore};
use crate::config::Configuration;
use crate::epoch::EpochController;
use crate::event_bus::{start_event_bus, EventHandlers, HandlerPtr};
use crate::events::*;
use crate::pacemaker::protocol::{CommittedBlock, Pacemaker, PacemakerConfig};
use crate::router::{start_polling, Network, Router, SenderHandle};
use crate::scheduler::{start_scheduler, TimerHandle};
use crate::types::basic::EpochId;
use crate::types::block::Block;
use crate::types::certificates::QuorumCert;
use crate::types::committee::DelegateSet;

/// Specification of a replica: everything needed to start one. Assemble with
/// [`ReplicaSpec::new`], attach event handlers, then call [`start`](ReplicaSpec::start).
pub struct ReplicaSpec<K: KVStore, N: Network, E: Executor> {
    configuration: Configuration,
    kv_store: K,
    network: N,
    executor: E,
    delegates: DelegateSet,
    genesis_nonce: u64,
    handlers: HandlerSpec,
}

/// User-defined event handlers, all optional.
#[derive(Default)]
struct HandlerSpec {
    insert_proposal: Option<HandlerPtr<InsertProposalEvent>>,
    commit_block: Option<HandlerPtr<CommitBlockEvent>>,
    update_qc_high: Option<HandlerPtr<UpdateQcHighEvent>>,
    update_locked: Option<HandlerPtr<UpdateLockedEvent>>,
    propose: Option<HandlerPtr<ProposeEvent>>,
    vote: Option<HandlerPtr<VoteEvent>>,
    new_view: Option<HandlerPtr<NewViewEvent>>,
    receive_proposal: Option<HandlerPtr<ReceiveProposalEvent>>,
    receive_vote: Option<HandlerPtr<ReceiveVoteEvent>>,
    receive_new_view: Option<HandlerPtr<ReceiveNewViewEvent>>,
    start_round: Option<HandlerPtr<StartRoundEvent>>,
    round_timeout: Option<HandlerPtr<RoundTimeoutEvent>>,
    collect_qc: Option<HandlerPtr<CollectQcEvent>>,
    violation: Option<HandlerPtr<ViolationDetectedEvent>>,
    epoch_change: Option<HandlerPtr<EpochChangeEvent>>,
}

impl<K: KVStore, N: Network, E: Executor> ReplicaSpec<K, N, E> {
    pub fn new(
        configuration: Configuration,
        kv_store: K,
        network: N,
        executor: E,
        delegates: DelegateSet,
        genesis_nonce: u64,
    ) -> ReplicaSpec<K, N, E> {
        ReplicaSpec {
            configuration,
            kv_store,
            network,
            executor,
            delegates,
            genesis_nonce,
            handlers: HandlerSpec::default(),
        }
    }

    pub fn on_insert_proposal(mut self, handler: HandlerPtr<InsertProposalEvent>) -> Self {
        self.handlers.insert_proposal = Some(handler);
        self
    }

    pub fn on_commit_block(mut self, handler: HandlerPtr<CommitBlockEvent>) -> Self {
        self.handlers.commit_block = Some(handler);
        self
    }

    pub fn on_update_qc_high(mut self, handler: HandlerPtr<UpdateQcHighEvent>) -> Self {
        self.handlers.update_qc_high = Some(handler);
        self
    }

    pub fn on_update_locked(mut self, handler: HandlerPtr<UpdateLockedEvent>) -> Self {
        self.handlers.update_locked = Some(handler);
        self
    }

    pub fn on_propose(mut self, handler: HandlerPtr<ProposeEvent>) -> Self {
        self.handlers.propose = Some(handler);
        self
    }

    pub fn on_vote(mut self, handler: HandlerPtr<VoteEvent>) -> Self {
        self.handlers.vote = Some(handler);
        self
    }

    pub fn on_new_view(mut self, handler: HandlerPtr<NewViewEvent>) -> Self {
        self.handlers.new_view = Some(handler);
        self
    }

    pub fn on_receive_proposal(mut self, handler: HandlerPtr<ReceiveProposalEvent>) -> Self {
        self.handlers.receive_proposal = Some(handler);
        self
    }

    pub fn on_receive_vote(mut self, handler: HandlerPtr<ReceiveVoteEvent>) -> Self {
        self.handlers.receive_vote = Some(handler);
        self
    }

    pub fn on_receive_new_view(mut self, handler: HandlerPtr<ReceiveNewViewEvent>) -> Self {
        self.handlers.receive_new_view = Some(handler);
        self
    }

    pub fn on_start_round(mut self, handler: HandlerPtr<StartRoundEvent>) -> Self {
        self.handlers.start_round = Some(handler);
        self
    }

    pub fn on_round_timeout(mut self, handler: HandlerPtr<RoundTimeoutEvent>) -> Self {
        self.handlers.round_timeout = Some(handler);
        self
    }

    pub fn on_collect_qc(mut self, handler: HandlerPtr<CollectQcEvent>) -> Self {
        self.handlers.collect_qc = Some(handler);
        self
    }

    pub fn on_violation(mut self, handler: HandlerPtr<ViolationDetectedEvent>) -> Self {
        self.handlers.violation = Some(handler);
        self
    }

    pub fn on_epoch_change(mut self, handler: HandlerPtr<EpochChangeEvent>) -> Self {
        self.handlers.epoch_change = Some(handler);
        self
    }

    /// Start all replica threads and return the handle keeping them alive.
    pub fn start(self) -> Replica<K> {
        let ReplicaSpec {
            configuration,
            kv_store,
            mut network,
            executor,
            delegates,
            genesis_nonce,
            handlers,
        } = self;

        let router = Router::new(
            configuration.networking.magic,
            configuration.identity.my_addr.clone(),
        );

        let mut epoch_controller = EpochController::new(
            delegates,
            configuration.committee_size,
            configuration.identity.keypair.public(),
            configuration.identity.threshold_keypair.clone(),
            EpochId::new(0),
        );
        let genesis_change = epoch_controller.genesis_committee(genesis_nonce);
        network.init_committee(&genesis_change.committee);

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (poller, peer_msgs) =
            start_polling(network.clone(), router.clone(), poller_shutdown_receiver);

        let (timer_handle, timer_requests) = TimerHandle::new();
        let (timer_sink, timer_events) = mpsc::channel();
        let (scheduler_shutdown, scheduler_shutdown_receiver) = mpsc::channel();
        let scheduler = start_scheduler(timer_requests, timer_sink, scheduler_shutdown_receiver);

        let event_handlers = EventHandlers::new(
            configuration.log_events,
            handlers.insert_proposal,
            handlers.commit_block,
            handlers.update_qc_high,
            handlers.update_locked,
            handlers.propose,
            handlers.vote,
            handlers.new_view,
            handlers.receive_proposal,
            handlers.receive_vote,
            handlers.receive_new_view,
            handlers.start_round,
            handlers.round_timeout,
            handlers.collect_qc,
            handlers.violation,
            handlers.epoch_change,
        );
        let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
        let (event_publisher, event_bus) = if event_handlers.is_empty() {
            (None, None)
        } else {
            let (event_publisher, event_subscriber) = mpsc::channel();
            let event_bus = start_event_bus(
                event_handlers,
                event_subscriber,
                event_bus_shutdown_receiver,
            );
            (Some(event_publisher), Some(event_bus))
        };

        let (commit_tx, commit_notifications) = mpsc::channel();
        let (commit_forward, commit_subscription) = mpsc::channel();

        let sender = SenderHandle::new(network, router);
        let mut pacemaker = Pacemaker::new(
            PacemakerConfig {
                magic: configuration.networking.magic,
                keypair: configuration.identity.keypair.clone(),
                threshold_keypair: configuration.identity.threshold_keypair.clone(),
                base_timeout: configuration.pacemaker.base_timeout,
            },
            ChainStore::new(kv_store.clone()),
            executor,
            sender.clone(),
            timer_handle,
            genesis_change.committee.clone(),
            genesis_change.role,
            genesis_change.my_index,
            genesis_change.in_committee,
            EpochId::new(0),
            event_publisher,
            Some(commit_tx),
        );
        let (qc_watch, qc_updates) = mpsc::channel();
        pacemaker.watch_qc(qc_watch);

        let (algorithm_shutdown, algorithm_shutdown_receiver) = mpsc::channel();
        let algorithm = Algorithm::new(
            pacemaker,
            epoch_controller,
            genesis_change,
            configuration.networking.magic,
            configuration.identity.keypair.clone(),
            sender,
            peer_msgs,
            timer_events,
            commit_notifications,
            commit_forward,
            algorithm_shutdown_receiver,
        )
        .start();

        Replica {
            chain_camera: ChainViewCamera::new(kv_store),
            commit_subscription,
            qc_updates,
            poller: Some(poller),
            poller_shutdown,
            scheduler: Some(scheduler),
            scheduler_shutdown,
            algorithm: Some(algorithm),
            algorithm_shutdown,
            event_bus,
            event_bus_shutdown,
        }
    }
}

pub struct Replica<K: KVStore> {
    chain_camera: ChainViewCamera<K>,
    commit_subscription: Receiver<CommittedBlock>,
    qc_updates: Receiver<QuorumCert>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    scheduler: Option<JoinHandle<()>>,
    scheduler_shutdown: Sender<()>,
    algorithm: Option<JoinHandle<()>>,
    algorithm_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Sender<()>,
}

impl<K: KVStore> Replica<K> {
    /// Write the genesis block into the store. Must be called exactly once per store, before the
    /// first [`ReplicaSpec::start`].
    pub fn initialize(kv_store: K, genesis: &Block) {
        let mut chain = ChainStore::new(kv_store);
        chain.initialize(genesis);
    }

    /// The read-only handle into the committed chain, for RPC and probe endpoints.
    pub fn chain_camera(&self) -> &ChainViewCamera<K> {
        &self.chain_camera
    }

    /// The stream of finalized blocks, in strict height order. The transaction pool drains this
    /// to evict included transactions.
    pub fn commits(&self) -> &Receiver<CommittedBlock> {
        &self.commit_subscription
    }

    /// The stream of best-QC improvements, fed by the QC store's watch. Probes read this to
    /// observe consensus progress without touching consensus state.
    pub fn qc_updates(&self) -> &Receiver<QuorumCert> {
        &self.qc_updates
    }
}

impl<K: KVStore> Drop for Replica<K> {
    fn drop(&mut self) {
        // Safety: shutdown order matters. The dispatch loop receives from the poller and the
        // scheduler, and assumes both outlive it; the event bus drains the dispatch loop.
        let _ = self.event_bus_shutdown.send(());
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }

        let _ = self.algorithm_shutdown.send(());
        if let Some(algorithm) = self.algorithm.take() {
            let _ = algorithm.join();
        }

        let _ = self.scheduler_shutdown.send(());
        if let Some(scheduler) = self.scheduler.take() {
            let _ = scheduler.join();
        }

        let _ = self.poller_shutdown.send(());
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
    }
}
