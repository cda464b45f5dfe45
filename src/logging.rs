/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the replica's
//! [config](crate::config::Configuration). Logging goes through the
//! [log](https://docs.rs/log/latest/log/) crate; to see the messages, install a logging
//! implementation.
//!
//! ## Log message format
//!
//! Log messages are CSVs with at least two values. The first two are always:
//! 1. The name of the [event](crate::events) in PascalCase (the constants in this module).
//! 2. The time the event was emitted, as seconds since the Unix Epoch.
//!
//! The rest differ by event kind. For example, a received proposal is printed as:
//!
//! ```text
//! ReceiveProposal, 1701329264, Id5u7f6, fNGCJyk, 7, 3
//! ```
//!
//! where the third value is the first seven base64 characters of the origin's public key, the
//! fourth the same prefix of the block ID, and the last two the height and round.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const INSERT_PROPOSAL: &str = "InsertProposal";
pub const COMMIT_BLOCK: &str = "CommitBlock";
pub const UPDATE_QC_HIGH: &str = "UpdateQcHigh";
pub const UPDATE_LOCKED: &str = "UpdateLocked";

pub const PROPOSE: &str = "Propose";
pub const VOTE: &str = "Vote";
pub const NEW_VIEW: &str = "NewView";

pub const RECEIVE_PROPOSAL: &str = "ReceiveProposal";
pub const RECEIVE_VOTE: &str = "ReceiveVote";
pub const RECEIVE_NEW_VIEW: &str = "ReceiveNewView";

pub const START_ROUND: &str = "StartRound";
pub const ROUND_TIMEOUT: &str = "RoundTimeout";
pub const COLLECT_QC: &str = "CollectQc";
pub const VIOLATION_DETECTED: &str = "ViolationDetected";

pub const EPOCH_CHANGE: &str = "EpochChange";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for InsertProposalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &InsertProposalEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                INSERT_PROPOSAL,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.block.bytes()),
                event.height,
                event.round
            )
        })
    }
}

impl Logger for CommitBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CommitBlockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                COMMIT_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.block.bytes()),
                event.height
            )
        })
    }
}

impl Logger for UpdateQcHighEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &UpdateQcHighEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                UPDATE_QC_HIGH,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.qc_high.block_id.bytes()),
                event.qc_high.height,
                event.qc_high.round
            )
        })
    }
}

impl Logger for UpdateLockedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &UpdateLockedEvent| {
            log::info!(
                "{}, {}, {}, {}",
                UPDATE_LOCKED,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.block.bytes()),
                event.height
            )
        })
    }
}

impl Logger for ProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ProposeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PROPOSE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.block.bytes()),
                event.height,
                event.round
            )
        })
    }
}

impl Logger for VoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &VoteEvent| {
            log::info!(
                "{}, {}, {}, {}",
                VOTE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.block.bytes()),
                event.round
            )
        })
    }
}

impl Logger for NewViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &NewViewEvent| {
            log::info!(
                "{}, {}, {}",
                NEW_VIEW,
                secs_since_unix_epoch(event.timestamp),
                event.round
            )
        })
    }
}

impl Logger for ReceiveProposalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveProposalEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PROPOSAL,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.origin.bytes()),
                first_seven_base64_chars(&event.block.bytes()),
                event.height,
                event.round
            )
        })
    }
}

impl Logger for ReceiveVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveVoteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_VOTE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.origin.bytes()),
                first_seven_base64_chars(&event.block.bytes()),
                event.round
            )
        })
    }
}

impl Logger for ReceiveNewViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveNewViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RECEIVE_NEW_VIEW,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.origin.bytes()),
                event.round
            )
        })
    }
}

impl Logger for StartRoundEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &StartRoundEvent| {
            log::info!(
                "{}, {}, {}",
                START_ROUND,
                secs_since_unix_epoch(event.timestamp),
                event.round
            )
        })
    }
}

impl Logger for RoundTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &RoundTimeoutEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ROUND_TIMEOUT,
                secs_since_unix_epoch(event.timestamp),
                event.round,
                event.timeout.as_millis()
            )
        })
    }
}

impl Logger for CollectQcEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CollectQcEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                COLLECT_QC,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.qc.block_id.bytes()),
                event.qc.height,
                event.qc.round,
                event.qc.voter_bitmap.count()
            )
        })
    }
}

impl Logger for ViolationDetectedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ViolationDetectedEvent| {
            log::warn!(
                "{}, {}, {}, {}",
                VIOLATION_DETECTED,
                secs_since_unix_epoch(event.timestamp),
                event.violation.index,
                event.violation.address
            )
        })
    }
}

impl Logger for EpochChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &EpochChangeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                EPOCH_CHANGE,
                secs_since_unix_epoch(event.timestamp),
                event.epoch,
                event.committee_size
            )
        })
    }
}

/// A more readable rendering of a byte sequence: base64-encode it and take the first 7
/// characters.
pub fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

pub fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("event occurred before the Unix Epoch")
        .as_secs()
}
