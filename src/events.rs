/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Notifications that are emitted when significant things happen in the local replica.
//!
//! Each variant of the [`Event`] enum wraps an inner struct summarizing one kind of occurrence,
//! always including the timestamp at which it happened. Events are emitted **after** the
//! corresponding occurrence is completed; e.g. [`CommitBlockEvent`] fires only after the block is
//! persisted.
//!
//! Library users register handler closures through the replica builder; the
//! [event bus](crate::event_bus) thread calls them outside the dispatch loop so a slow handler
//! cannot stall consensus.

use std::sync::mpsc::Sender;
use std::time::{Duration, SystemTime};

use crate::types::basic::{BlockHeight, BlockId, EpochId, PubKeyBytes, Round};
use crate::types::block::Violation;
use crate::types::certificates::QuorumCert;

/// Enumerates all events emitted by the consensus core.
pub enum Event {
    // Events that change persistent state.
    InsertProposal(InsertProposalEvent),
    CommitBlock(CommitBlockEvent),
    UpdateQcHigh(UpdateQcHighEvent),
    UpdateLocked(UpdateLockedEvent),

    // Events that involve sending a message.
    Propose(ProposeEvent),
    Vote(VoteEvent),
    NewView(NewViewEvent),

    // Events that involve receiving a message.
    ReceiveProposal(ReceiveProposalEvent),
    ReceiveVote(ReceiveVoteEvent),
    ReceiveNewView(ReceiveNewViewEvent),

    // Other pacemaker events.
    StartRound(StartRoundEvent),
    RoundTimeout(RoundTimeoutEvent),
    CollectQc(CollectQcEvent),
    ViolationDetected(ViolationDetectedEvent),

    // Epoch events.
    EpochChange(EpochChangeEvent),
}

impl Event {
    /// Publish this event on the event publisher channel, if one is configured.
    pub fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// A proposal was inserted into the proposal graph.
pub struct InsertProposalEvent {
    pub timestamp: SystemTime,
    pub block: BlockId,
    pub height: BlockHeight,
    pub round: Round,
}

/// A block was finalized and persisted, together with its certifying QC and evidence record.
pub struct CommitBlockEvent {
    pub timestamp: SystemTime,
    pub block: BlockId,
    pub height: BlockHeight,
}

/// The highest known QC changed.
pub struct UpdateQcHighEvent {
    pub timestamp: SystemTime,
    pub qc_high: QuorumCert,
}

/// The locked block advanced.
pub struct UpdateLockedEvent {
    pub timestamp: SystemTime,
    pub block: BlockId,
    pub height: BlockHeight,
}

/// The replica proposed a block by broadcasting it to all committee peers.
pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub block: BlockId,
    pub height: BlockHeight,
    pub round: Round,
}

/// The replica voted for a block by sending a partial signature to the next round's proposer.
pub struct VoteEvent {
    pub timestamp: SystemTime,
    pub block: BlockId,
    pub round: Round,
}

/// The replica sent a new-view message for `round` to its proposer on view timeout.
pub struct NewViewEvent {
    pub timestamp: SystemTime,
    pub round: Round,
}

/// The replica received a proposal from the proposer of its round.
pub struct ReceiveProposalEvent {
    pub timestamp: SystemTime,
    pub origin: PubKeyBytes,
    pub block: BlockId,
    pub height: BlockHeight,
    pub round: Round,
}

/// The replica received a vote from a committee member.
pub struct ReceiveVoteEvent {
    pub timestamp: SystemTime,
    pub origin: PubKeyBytes,
    pub block: BlockId,
    pub round: Round,
}

/// The replica received a new-view message.
pub struct ReceiveNewViewEvent {
    pub timestamp: SystemTime,
    pub origin: PubKeyBytes,
    pub round: Round,
}

/// The replica entered a round.
pub struct StartRoundEvent {
    pub timestamp: SystemTime,
    pub round: Round,
}

/// The replica's round timed out after the given duration.
pub struct RoundTimeoutEvent {
    pub timestamp: SystemTime,
    pub round: Round,
    pub timeout: Duration,
}

/// The replica aggregated a quorum of votes into a new QC.
pub struct CollectQcEvent {
    pub timestamp: SystemTime,
    pub qc: QuorumCert,
}

/// A double-sign was observed while processing proposals or votes.
pub struct ViolationDetectedEvent {
    pub timestamp: SystemTime,
    pub violation: Violation,
}

/// A keyframe rotation completed: a fresh committee was installed and the round reset.
pub struct EpochChangeEvent {
    pub timestamp: SystemTime,
    pub epoch: EpochId,
    pub committee_size: usize,
}
