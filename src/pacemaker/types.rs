/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of types specific to the [`Pacemaker`](crate::pacemaker::protocol::Pacemaker):
//! quorum rules, the vote tally, the new-view collector, the double-sign detector, and the view
//! timeout backoff.

use std::collections::HashMap;
use std::time::Duration;

use crate::crypto;
use crate::types::basic::*;
use crate::types::block::{Violation, ViolationKind};

/// The peer-side quorum rule: `voter_num >= ceil(2 * committee_size / 3)`.
///
/// Evaluated against the cardinality of a unique-voter bitmap, never a raw message count.
pub fn majority_two_third(voter_num: usize, committee_size: usize) -> bool {
    if committee_size == 0 {
        return false;
    }
    // committee_size = 1 -> 1, 2 -> 2, 3 -> 2, 4 -> 3, 5 -> 4, 6 -> 4
    let two_thirds = (committee_size * 2 + 2) / 3;
    voter_num >= two_thirds
}

/// The leader-side quorum rule used when aggregating votes.
///
/// Identical to [`majority_two_third`] except for committee size 2, where a single vote
/// suffices: pacemaker votes include the proposer's own, so a lone operable pair can still make
/// progress through the leader's aggregation path.
pub fn leader_majority_two_third(voter_num: usize, committee_size: usize) -> bool {
    if committee_size == 2 {
        return voter_num >= 1;
    }
    majority_two_third(voter_num, committee_size)
}

/// Serves to incrementally form the aggregate signature of a quorum certificate by collecting
/// partial votes for one block.
///
/// Votes for the same block from the same signer are idempotent: only the first is counted.
pub struct VoteTally {
    pub block_id: BlockId,
    pub height: BlockHeight,
    pub round: Round,
    pub epoch: EpochId,
    pub msg_hash: Bytes32,
    partials: Vec<Option<ThresholdSigBytes>>,
    bitmap: Bitmap,
}

impl VoteTally {
    pub fn new(
        block_id: BlockId,
        height: BlockHeight,
        round: Round,
        epoch: EpochId,
        msg_hash: Bytes32,
        committee_size: usize,
    ) -> VoteTally {
        VoteTally {
            block_id,
            height,
            round,
            epoch,
            msg_hash,
            partials: vec![None; committee_size],
            bitmap: Bitmap::new(committee_size),
        }
    }

    /// Insert a partial vote from the committee member with index `signer_index`. Returns whether
    /// the vote was counted (false for duplicates and out-of-committee indices).
    pub fn collect(&mut self, signer_index: usize, partial: ThresholdSigBytes) -> bool {
        if signer_index >= self.partials.len() || self.partials[signer_index].is_some() {
            return false;
        }
        self.partials[signer_index] = Some(partial);
        self.bitmap.set(signer_index);
        true
    }

    /// The number of distinct voters collected so far.
    pub fn count(&self) -> usize {
        self.bitmap.count()
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// The collected partials, in ascending signer-index order.
    pub fn partials(&self) -> Vec<ThresholdSigBytes> {
        self.partials.iter().filter_map(|p| *p).collect()
    }
}

/// Keeps track of the committee members that have sent a `NewView` message for a given round, and
/// the highest QC carried by any of them.
pub struct NewViewCollector {
    round: Round,
    collected: Bitmap,
}

impl NewViewCollector {
    pub fn new(round: Round, committee_size: usize) -> NewViewCollector {
        NewViewCollector {
            round,
            collected: Bitmap::new(committee_size),
        }
    }

    pub fn round(&self) -> Round {
        self.round
    }

    /// Note that we collected a new-view message from `signer_index` for this round. Returns
    /// whether the distinct senders now form a quorum.
    pub fn collect(&mut self, signer_index: usize) -> bool {
        self.collected.set(signer_index);
        majority_two_third(self.collected.count(), self.collected.len())
    }
}

/// Records signature artifacts per `(height, round, signer)` and surfaces a [`Violation`] when the
/// same signer produces two different message hashes at one position. Detects both equivocating
/// proposals and double votes.
#[derive(Default)]
pub struct DoubleSignDetector {
    seen: HashMap<(BlockHeight, Round, u32), (Bytes32, Vec<u8>)>,
}

impl DoubleSignDetector {
    pub fn new() -> DoubleSignDetector {
        DoubleSignDetector::default()
    }

    /// Record an artifact. Returns a violation iff this signer already produced a different
    /// message hash at this `(height, round)`.
    pub fn record(
        &mut self,
        height: BlockHeight,
        round: Round,
        signer_index: u32,
        signer_pubkey: &PubKeyBytes,
        msg_hash: Bytes32,
        sig: Vec<u8>,
    ) -> Option<Violation> {
        match self.seen.get(&(height, round, signer_index)) {
            None => {
                self.seen.insert((height, round, signer_index), (msg_hash, sig));
                None
            }
            Some((prior_hash, _)) if *prior_hash == msg_hash => None,
            Some((prior_hash, prior_sig)) => Some(Violation {
                kind: ViolationKind::DoubleSign,
                index: signer_index,
                address: crypto::address_of(signer_pubkey),
                msg_hash_a: *prior_hash,
                msg_hash_b: msg_hash,
                sig_a: prior_sig.clone(),
                sig_b: sig,
            }),
        }
    }

    /// Drop artifacts at or below `height`; they can no longer produce actionable evidence once
    /// the height is finalized.
    pub fn prune_below(&mut self, height: BlockHeight) {
        self.seen.retain(|(h, _, _), _| *h > height);
    }
}

/// Per-round timeout with exponential backoff: doubles on each consecutive view change and resets
/// when any height commits.
pub struct ViewTimeouts {
    base: Duration,
    consecutive: u32,
}

impl ViewTimeouts {
    /// Backoff stops growing after this many consecutive view changes.
    const MAX_DOUBLINGS: u32 = 6;

    pub fn new(base: Duration) -> ViewTimeouts {
        ViewTimeouts {
            base,
            consecutive: 0,
        }
    }

    /// The timeout to allot to the current round.
    pub fn current(&self) -> Duration {
        self.base * 2u32.pow(self.consecutive.min(Self::MAX_DOUBLINGS))
    }

    /// A view change happened without progress.
    pub fn on_view_change(&mut self) {
        self.consecutive = self.consecutive.saturating_add(1);
    }

    /// A height committed; the network is live again.
    pub fn on_commit(&mut self) {
        self.consecutive = 0;
    }
}
