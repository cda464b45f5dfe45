/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definition of the [`Certificate`] trait, and of [`QuorumCert`]: the proof that a quorum of the
//! committee voted for a block.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::codec;
use crate::crypto;
use crate::pacemaker::types::majority_two_third;
use crate::types::basic::*;
use crate::types::committee::Committee;

/// Certificates serve as proof that a quorum of committee members has done something, e.g. voted
/// for a proposal. The correctness of a certificate can be validated with
/// [`Certificate::is_correct`] given the committee it was formed under.
pub trait Certificate {
    fn is_correct(&self, committee: &Committee) -> bool;
}

/// Proof that at least `ceil(2N/3)` committee members voted for the block identified by
/// `block_id`. Carried inside the next proposal as its `parent_qc`, and persisted alongside the
/// block it certifies.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct QuorumCert {
    pub height: BlockHeight,
    pub round: Round,
    pub epoch: EpochId,
    pub block_id: BlockId,
    pub voter_bitmap: Bitmap,
    pub voter_msg_hash: Bytes32,
    pub voter_agg_sig: ThresholdSigBytes,
}

impl QuorumCert {
    /// The QC that certifies the genesis block. It carries no signatures and is automatically
    /// correct.
    pub fn genesis(genesis_id: BlockId) -> QuorumCert {
        QuorumCert {
            height: BlockHeight::new(0),
            round: Round::init(),
            epoch: EpochId::new(0),
            block_id: genesis_id,
            voter_bitmap: Bitmap::default(),
            voter_msg_hash: Bytes32::default(),
            voter_agg_sig: ThresholdSigBytes::default(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.height == BlockHeight::new(0) && self.voter_bitmap.is_empty()
    }

    /// The message hash every voter's partial signature is over: a tagged hash binding the block
    /// ID to its position in the pacemaker's logical time.
    pub fn voting_hash(
        block_id: &BlockId,
        height: BlockHeight,
        round: Round,
        epoch: EpochId,
    ) -> Bytes32 {
        let fields = codec::encode(&("BlockVote", block_id, height, round, epoch));
        crypto::blake2b(&[&fields])
    }

    /// Whether `self` ranks higher than `other` under the (height, round) order used for
    /// `qc_high`.
    pub fn is_higher_than(&self, other: &QuorumCert) -> bool {
        (self.height, self.round) > (other.height, other.round)
    }
}

impl Certificate for QuorumCert {
    /// Checks that the voter bitmap indexes the given committee, that its cardinality reaches the
    /// peer-side quorum, that the certified message hash is the canonical voting hash for the
    /// certified block, and that the aggregate signature verifies against the voters' threshold
    /// public keys.
    fn is_correct(&self, committee: &Committee) -> bool {
        if self.is_genesis() {
            return true;
        }

        if self.voter_bitmap.len() != committee.len() {
            return false;
        }
        if !majority_two_third(self.voter_bitmap.count(), committee.len()) {
            return false;
        }

        let expected_hash =
            Self::voting_hash(&self.block_id, self.height, self.round, self.epoch);
        if expected_hash != self.voter_msg_hash {
            return false;
        }

        let voter_keys: Vec<ThresholdPubKeyBytes> = self
            .voter_bitmap
            .iter_set()
            .filter_map(|index| committee.member(index))
            .map(|member| member.threshold_pubkey)
            .collect();
        if voter_keys.len() != self.voter_bitmap.count() {
            // A set bit outside the committee.
            return false;
        }

        crypto::threshold_verify(&self.voter_agg_sig, &voter_keys, &self.voter_msg_hash)
    }
}
