/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The dispatch loop: the one thread on which all consensus state lives.
//!
//! The loop pulls from three queues: inbound peer messages (fed by the
//! [poller](crate::router::start_polling)), timer firings (fed by the
//! [scheduler](crate::scheduler)), and the pacemaker's own commit notifications. Pacemaker
//! messages go to the [`Pacemaker`]; committee handshake messages go to the
//! [`EpochController`]; commit notifications drive epoch rotation and are forwarded to the
//! library user's commit subscription.

use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};

use crate::app::Executor;
use crate::chain::KVStore;
use crate::epoch::{EpochChange, EpochController};
use crate::pacemaker::messages::{
    AnnounceCommittee, CommitCommittee, ConsensusMessage, NewCommittee, NotaryAnnounce,
};
use crate::pacemaker::protocol::{CommittedBlock, Pacemaker};
use crate::router::{Network, SenderHandle};
use crate::scheduler::TimerEvent;
use crate::types::basic::{Magic, NetAddress, Round};
use crate::types::committee::Role;

pub(crate) struct Algorithm<K: KVStore, N: Network, E: Executor> {
    pacemaker: Pacemaker<K, N, E>,
    epoch_controller: EpochController,
    epoch_state: EpochChange,
    magic: Magic,
    keypair: crate::crypto::EcdsaKeypair,
    sender: SenderHandle<N>,

    peer_msgs: Receiver<(NetAddress, ConsensusMessage)>,
    timer_events: Receiver<TimerEvent>,
    commit_notifications: Receiver<CommittedBlock>,
    commit_forward: Sender<CommittedBlock>,
    shutdown_signal: Receiver<()>,
}

impl<K: KVStore, N: Network, E: Executor> Algorithm<K, N, E> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pacemaker: Pacemaker<K, N, E>,
        epoch_controller: EpochController,
        epoch_state: EpochChange,
        magic: Magic,
        keypair: crate::crypto::EcdsaKeypair,
        sender: SenderHandle<N>,
        peer_msgs: Receiver<(NetAddress, ConsensusMessage)>,
        timer_events: Receiver<TimerEvent>,
        commit_notifications: Receiver<CommittedBlock>,
        commit_forward: Sender<CommittedBlock>,
        shutdown_signal: Receiver<()>,
    ) -> Algorithm<K, N, E> {
        Algorithm {
            pacemaker,
            epoch_controller,
            epoch_state,
            magic,
            keypair,
            sender,
            peer_msgs,
            timer_events,
            commit_notifications,
            commit_forward,
            shutdown_signal,
        }
    }

    pub(crate) fn start(mut self) -> JoinHandle<()> {
        thread::spawn(move || {
            self.pacemaker.start();
            self.execute()
        })
    }

    fn execute(&mut self) {
        loop {
            match self.shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("dispatch thread disconnected from main thread")
                }
            }

            let mut progressed = false;

            if let Ok((_, msg)) = self.peer_msgs.try_recv() {
                self.handle_message(msg);
                progressed = true;
            }
            if let Ok(event) = self.timer_events.try_recv() {
                self.pacemaker.on_timer(event);
                progressed = true;
            }
            while let Ok(committed) = self.commit_notifications.try_recv() {
                self.handle_commit(committed);
                progressed = true;
            }

            if !progressed {
                thread::yield_now();
            }
        }
    }

    fn handle_message(&mut self, msg: ConsensusMessage) {
        match msg {
            ConsensusMessage::Proposal(_)
            | ConsensusMessage::Vote(_)
            | ConsensusMessage::NewView(_)
            | ConsensusMessage::QueryProposal(_) => self.pacemaker.on_message(msg),

            ConsensusMessage::NewCommittee(new_committee) => {
                self.on_new_committee(new_committee)
            }
            ConsensusMessage::AnnounceCommittee(announce) => self.on_announce(announce),
            ConsensusMessage::CommitCommittee(commit) => self.on_commit_committee(commit),
            ConsensusMessage::NotaryAnnounce(notary) => self.on_notary(notary),
        }
    }

    /// A block finalized: forward the notification to the library user, then let the epoch
    /// controller decide whether a rotation is due.
    fn handle_commit(&mut self, committed: CommittedBlock) {
        let _ = self.commit_forward.send(committed.clone());

        if let Some(change) = self.epoch_controller.on_commit(&committed) {
            self.pacemaker.install_epoch(
                change.epoch,
                change.committee.clone(),
                change.role,
                change.my_index,
                change.in_committee,
            );
            // Members knock on the new leader's door; the leader announces once a quorum of
            // knocks arrived (see on_new_committee).
            if change.in_committee && change.role != Role::Leader {
                if let Some(leader) = change.committee.leader() {
                    let knock = NewCommittee::new(
                        &self.keypair,
                        self.magic,
                        Round::init(),
                        change.epoch,
                        change.kframe_height,
                        change.nonce,
                    );
                    self.sender.send(leader.ecdsa_pubkey, knock);
                }
            }
            self.epoch_state = change;
        }
    }

    /* ↓↓↓ Committee handshake: bookkeeping around epoch rotation ↓↓↓ */

    fn on_new_committee(&mut self, msg: NewCommittee) {
        if self.epoch_state.role != Role::Leader {
            return;
        }
        let quorum = self
            .epoch_controller
            .on_new_committee(&msg, &self.epoch_state.committee);
        if quorum {
            let announce = AnnounceCommittee::new(
                &self.keypair,
                self.magic,
                Round::init(),
                self.epoch_state.epoch,
                self.epoch_state
                    .committee
                    .to_committee_infos(self.epoch_state.epoch),
                self.epoch_state.kframe_height,
                self.epoch_state.nonce,
            );
            self.sender.broadcast(announce);
        }
    }

    fn on_announce(&mut self, msg: AnnounceCommittee) {
        if !self.epoch_state.in_committee || self.epoch_state.role == Role::Leader {
            return;
        }
        if let Some((ack_hash, partial)) = self
            .epoch_controller
            .on_announce(&msg, &self.epoch_state.committee)
        {
            let ack = CommitCommittee::new(
                &self.keypair,
                self.magic,
                Round::init(),
                self.epoch_state.epoch,
                self.epoch_state.my_index as u32,
                ack_hash,
                partial,
            );
            self.sender.send(msg.header.sender, ack);
        }
    }

    fn on_commit_committee(&mut self, msg: CommitCommittee) {
        if self.epoch_state.role != Role::Leader {
            return;
        }
        if let Some((bitmap, agg)) = self
            .epoch_controller
            .on_commit_committee(&msg, &self.epoch_state.committee)
        {
            let notary = NotaryAnnounce::new(
                &self.keypair,
                self.magic,
                Round::init(),
                self.epoch_state.epoch,
                msg.ack_hash,
                bitmap,
                agg,
            );
            self.sender.broadcast(notary);
        }
    }

    fn on_notary(&mut self, msg: NotaryAnnounce) {
        if !self
            .epoch_controller
            .on_notary(&msg, &self.epoch_state.committee)
        {
            log::warn!("committee notarization failed verification");
        }
    }
}
