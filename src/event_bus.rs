/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives events emitted by the dispatch loop and passes them to event handlers.
//!
//! When the thread receives an [`Event`], it triggers all handlers defined for the contained
//! event type. Handlers come from two places: the user-defined closures passed to the
//! [replica builder](crate::replica::ReplicaSpec), and, when event logging is enabled in the
//! [configuration](crate::config::Configuration), the default logging handlers from
//! [`logging`](crate::logging). When no handlers are present at all, the thread is not started.

use std::{
    sync::mpsc::{Receiver, TryRecvError},
    thread,
    thread::JoinHandle,
};

use crate::{events::*, logging::Logger};

/// Pointer to a handler closure, parametrised by the event type.
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// The two optional handlers enabled for one event type: the user-defined one and the default
/// logging one.
pub(crate) struct HandlerPair<T: Logger> {
    user_defined_handler: Option<HandlerPtr<T>>,
    logging_handler: Option<HandlerPtr<T>>,
}

impl<T: Logger> HandlerPair<T> {
    fn is_empty(&self) -> bool {
        self.user_defined_handler.is_none() && self.logging_handler.is_none()
    }

    fn new(log: bool, user_defined_handler: Option<HandlerPtr<T>>) -> HandlerPair<T> {
        HandlerPair {
            user_defined_handler,
            logging_handler: if log { Some(T::get_logger()) } else { None },
        }
    }

    fn fire(&self, event: &T) {
        if let Some(handler) = &self.user_defined_handler {
            handler(event);
        }
        if let Some(handler) = &self.logging_handler {
            handler(event);
        }
    }
}

/// Stores the handler pair for each pre-defined event type from [`events`](crate::events).
pub(crate) struct EventHandlers {
    pub(crate) insert_proposal_handlers: HandlerPair<InsertProposalEvent>,
    pub(crate) commit_block_handlers: HandlerPair<CommitBlockEvent>,
    pub(crate) update_qc_high_handlers: HandlerPair<UpdateQcHighEvent>,
    pub(crate) update_locked_handlers: HandlerPair<UpdateLockedEvent>,

    pub(crate) propose_handlers: HandlerPair<ProposeEvent>,
    pub(crate) vote_handlers: HandlerPair<VoteEvent>,
    pub(crate) new_view_handlers: HandlerPair<NewViewEvent>,

    pub(crate) receive_proposal_handlers: HandlerPair<ReceiveProposalEvent>,
    pub(crate) receive_vote_handlers: HandlerPair<ReceiveVoteEvent>,
    pub(crate) receive_new_view_handlers: HandlerPair<ReceiveNewViewEvent>,

    pub(crate) start_round_handlers: HandlerPair<StartRoundEvent>,
    pub(crate) round_timeout_handlers: HandlerPair<RoundTimeoutEvent>,
    pub(crate) collect_qc_handlers: HandlerPair<CollectQcEvent>,
    pub(crate) violation_handlers: HandlerPair<ViolationDetectedEvent>,

    pub(crate) epoch_change_handlers: HandlerPair<EpochChangeEvent>,
}

impl EventHandlers {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log: bool,
        insert_proposal_handler: Option<HandlerPtr<InsertProposalEvent>>,
        commit_block_handler: Option<HandlerPtr<CommitBlockEvent>>,
        update_qc_high_handler: Option<HandlerPtr<UpdateQcHighEvent>>,
        update_locked_handler: Option<HandlerPtr<UpdateLockedEvent>>,
        propose_handler: Option<HandlerPtr<ProposeEvent>>,
        vote_handler: Option<HandlerPtr<VoteEvent>>,
        new_view_handler: Option<HandlerPtr<NewViewEvent>>,
        receive_proposal_handler: Option<HandlerPtr<ReceiveProposalEvent>>,
        receive_vote_handler: Option<HandlerPtr<ReceiveVoteEvent>>,
        receive_new_view_handler: Option<HandlerPtr<ReceiveNewViewEvent>>,
        start_round_handler: Option<HandlerPtr<StartRoundEvent>>,
        round_timeout_handler: Option<HandlerPtr<RoundTimeoutEvent>>,
        collect_qc_handler: Option<HandlerPtr<CollectQcEvent>>,
        violation_handler: Option<HandlerPtr<ViolationDetectedEvent>>,
        epoch_change_handler: Option<HandlerPtr<EpochChangeEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            insert_proposal_handlers: HandlerPair::new(log, insert_proposal_handler),
            commit_block_handlers: HandlerPair::new(log, commit_block_handler),
            update_qc_high_handlers: HandlerPair::new(log, update_qc_high_handler),
            update_locked_handlers: HandlerPair::new(log, update_locked_handler),
            propose_handlers: HandlerPair::new(log, propose_handler),
            vote_handlers: HandlerPair::new(log, vote_handler),
            new_view_handlers: HandlerPair::new(log, new_view_handler),
            receive_proposal_handlers: HandlerPair::new(log, receive_proposal_handler),
            receive_vote_handlers: HandlerPair::new(log, receive_vote_handler),
            receive_new_view_handlers: HandlerPair::new(log, receive_new_view_handler),
            start_round_handlers: HandlerPair::new(log, start_round_handler),
            round_timeout_handlers: HandlerPair::new(log, round_timeout_handler),
            collect_qc_handlers: HandlerPair::new(log, collect_qc_handler),
            violation_handlers: HandlerPair::new(log, violation_handler),
            epoch_change_handlers: HandlerPair::new(log, epoch_change_handler),
        }
    }

    /// Whether neither user-defined handlers nor logging are configured.
    pub(crate) fn is_empty(&self) -> bool {
        self.insert_proposal_handlers.is_empty()
            && self.commit_block_handlers.is_empty()
            && self.update_qc_high_handlers.is_empty()
            && self.update_locked_handlers.is_empty()
            && self.propose_handlers.is_empty()
            && self.vote_handlers.is_empty()
            && self.new_view_handlers.is_empty()
            && self.receive_proposal_handlers.is_empty()
            && self.receive_vote_handlers.is_empty()
            && self.receive_new_view_handlers.is_empty()
            && self.start_round_handlers.is_empty()
            && self.round_timeout_handlers.is_empty()
            && self.collect_qc_handlers.is_empty()
            && self.violation_handlers.is_empty()
            && self.epoch_change_handlers.is_empty()
    }

    /// Trigger the handlers defined for the received event's type.
    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::InsertProposal(event) => self.insert_proposal_handlers.fire(&event),
            Event::CommitBlock(event) => self.commit_block_handlers.fire(&event),
            Event::UpdateQcHigh(event) => self.update_qc_high_handlers.fire(&event),
            Event::UpdateLocked(event) => self.update_locked_handlers.fire(&event),
            Event::Propose(event) => self.propose_handlers.fire(&event),
            Event::Vote(event) => self.vote_handlers.fire(&event),
            Event::NewView(event) => self.new_view_handlers.fire(&event),
            Event::ReceiveProposal(event) => self.receive_proposal_handlers.fire(&event),
            Event::ReceiveVote(event) => self.receive_vote_handlers.fire(&event),
            Event::ReceiveNewView(event) => self.receive_new_view_handlers.fire(&event),
            Event::StartRound(event) => self.start_round_handlers.fire(&event),
            Event::RoundTimeout(event) => self.round_timeout_handlers.fire(&event),
            Event::CollectQc(event) => self.collect_qc_handlers.fire(&event),
            Event::ViolationDetected(event) => self.violation_handlers.fire(&event),
            Event::EpochChange(event) => self.epoch_change_handlers.fire(&event),
        }
    }
}

/// Spawn the event bus thread: drains the event channel and fires the registered handlers for
/// every event, until the shutdown signal arrives.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event bus thread disconnected from main thread")
            }
        }

        match event_subscriber.try_recv() {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(TryRecvError::Empty) => thread::yield_now(),
            Err(TryRecvError::Disconnected) => return,
        }
    })
}
