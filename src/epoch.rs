/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The epoch controller: reacts to committed keyframes by reseeding the committee and rotating
//! the epoch.
//!
//! The controller observes finalized blocks through the pacemaker's commit channel. A committed
//! k-block latches the proof-of-work nonce; the first stop block finalized after it triggers the
//! rotation: the delegate set is re-sorted under the nonce, the epoch is bumped, and the
//! pacemaker restarts at round 0 under the new committee.
//!
//! The announce/commit/notary handshake of the wire protocol is bookkeeping layered on top: the
//! new leader announces the committee it derived, members that derived the same committee ack
//! with their threshold keys, and the leader notarizes once a quorum of acks arrived. Rotation
//! itself never waits on the handshake, because every member derives the same committee from the
//! same `(delegate_set, nonce)` input.

use crate::crypto::{self, ThresholdKeypair};
use crate::pacemaker::messages::{AnnounceCommittee, CommitCommittee, NewCommittee, NotaryAnnounce};
use crate::pacemaker::protocol::CommittedBlock;
use crate::pacemaker::types::leader_majority_two_third;
use crate::types::basic::*;
use crate::types::block::BlockType;
use crate::types::committee::{Committee, CommitteeBuilder, DelegateSet, Role};

/// Everything the pacemaker needs to restart under a fresh committee.
#[derive(Clone)]
pub struct EpochChange {
    pub epoch: EpochId,
    pub committee: Committee,
    pub role: Role,
    pub my_index: usize,
    pub in_committee: bool,
    pub kframe_height: BlockHeight,
    pub nonce: u64,
}

pub struct EpochController {
    delegates: DelegateSet,
    committee_size: usize,
    my_pubkey: PubKeyBytes,
    threshold_keypair: ThresholdKeypair,
    current_epoch: EpochId,
    pending_nonce: Option<(BlockHeight, u64)>,

    // Handshake bookkeeping for the epoch being established.
    ready_members: Bitmap,
    ack_tally: Vec<Option<ThresholdSigBytes>>,
}

impl EpochController {
    pub fn new(
        delegates: DelegateSet,
        committee_size: usize,
        my_pubkey: PubKeyBytes,
        threshold_keypair: ThresholdKeypair,
        init_epoch: EpochId,
    ) -> EpochController {
        EpochController {
            delegates,
            committee_size,
            my_pubkey,
            threshold_keypair,
            current_epoch: init_epoch,
            pending_nonce: None,
            ready_members: Bitmap::default(),
            ack_tally: Vec::new(),
        }
    }

    pub fn current_epoch(&self) -> EpochId {
        self.current_epoch
    }

    /// Replace the delegate set used for the next rotation. Delegate selection lives in the
    /// staking layer; it pushes updates here between epochs.
    pub fn update_delegates(&mut self, delegates: DelegateSet) {
        self.delegates = delegates;
    }

    /// Derive the initial committee from the genesis nonce.
    pub fn genesis_committee(&self, nonce: u64) -> EpochChange {
        let (committee, role, my_index, in_committee) = CommitteeBuilder::build(
            &self.delegates,
            nonce,
            self.committee_size,
            &self.my_pubkey,
        );
        EpochChange {
            epoch: EpochId::new(0),
            committee,
            role,
            my_index,
            in_committee,
            kframe_height: BlockHeight::new(0),
            nonce,
        }
    }

    /// Observe a finalized block. A k-block latches its nonce; the following finalized s-block
    /// completes the rotation and returns the change to install.
    pub fn on_commit(&mut self, committed: &CommittedBlock) -> Option<EpochChange> {
        match committed.block_type {
            BlockType::KBlock => {
                if let Some(nonce) = committed.keyframe_nonce {
                    log::info!(
                        "keyframe committed at height {} with nonce {:#x}",
                        committed.height,
                        nonce
                    );
                    self.pending_nonce = Some((committed.height, nonce));
                }
                None
            }
            BlockType::SBlock => {
                let (kframe_height, nonce) = self.pending_nonce.take()?;
                let (committee, role, my_index, in_committee) = CommitteeBuilder::build(
                    &self.delegates,
                    nonce,
                    self.committee_size,
                    &self.my_pubkey,
                );
                self.current_epoch = self.current_epoch.next();
                self.ready_members = Bitmap::new(committee.len());
                self.ack_tally = vec![None; committee.len()];
                Some(EpochChange {
                    epoch: self.current_epoch,
                    committee,
                    role,
                    my_index,
                    in_committee,
                    kframe_height,
                    nonce,
                })
            }
            BlockType::MBlock => None,
        }
    }

    /* ↓↓↓ Committee handshake bookkeeping ↓↓↓ */

    /// Leader side: a member signalled readiness for the committee seeded by `msg.nonce`.
    /// Returns true once a quorum of distinct members is ready and the announce should go out.
    pub fn on_new_committee(&mut self, msg: &NewCommittee, committee: &Committee) -> bool {
        if self.ready_members.len() != committee.len() {
            self.ready_members = Bitmap::new(committee.len());
        }
        if let Some(index) = committee.index_of(&msg.header.sender) {
            self.ready_members.set(index);
        }
        leader_majority_two_third(self.ready_members.count(), committee.len())
    }

    /// Member side: the leader announced a committee. If it matches what we derived ourselves,
    /// produce our ack partial; a mismatch means the leader is faulty and is ignored.
    pub fn on_announce(
        &mut self,
        msg: &AnnounceCommittee,
        own_committee: &Committee,
    ) -> Option<(Bytes32, ThresholdSigBytes)> {
        let expected = own_committee.to_committee_infos(msg.header.epoch);
        if msg.committee != expected {
            log::warn!("announced committee differs from locally derived one; ignoring");
            return None;
        }
        let ack_hash = msg.ack_hash();
        Some((ack_hash, self.threshold_keypair.sign(&ack_hash)))
    }

    /// Leader side: a member acked the announce. Returns the aggregated notarization once a
    /// quorum of acks arrived.
    pub fn on_commit_committee(
        &mut self,
        msg: &CommitCommittee,
        committee: &Committee,
    ) -> Option<(Bitmap, ThresholdSigBytes)> {
        let index = msg.signer_index as usize;
        let member = committee.member(index)?;
        if member.ecdsa_pubkey != msg.header.sender {
            return None;
        }
        if !crypto::threshold_verify(
            &msg.partial_sig,
            &[member.threshold_pubkey],
            &msg.ack_hash,
        ) {
            return None;
        }
        if self.ack_tally.len() != committee.len() {
            self.ack_tally = vec![None; committee.len()];
        }
        if self.ack_tally[index].is_some() {
            return None;
        }
        self.ack_tally[index] = Some(msg.partial_sig);

        let mut bitmap = Bitmap::new(committee.len());
        let mut partials = Vec::new();
        for (i, slot) in self.ack_tally.iter().enumerate() {
            if let Some(partial) = slot {
                bitmap.set(i);
                partials.push(*partial);
            }
        }
        if !leader_majority_two_third(bitmap.count(), committee.len()) {
            return None;
        }
        let agg = crypto::threshold_aggregate(&partials).ok()?;
        Some((bitmap, agg))
    }

    /// Member side: verify the leader's notarization of the committee.
    pub fn on_notary(&self, msg: &NotaryAnnounce, committee: &Committee) -> bool {
        let keys: Vec<ThresholdPubKeyBytes> = msg
            .ack_bitmap
            .iter_set()
            .filter_map(|i| committee.member(i))
            .map(|m| m.threshold_pubkey)
            .collect();
        if keys.len() != msg.ack_bitmap.count() {
            return false;
        }
        crypto::threshold_verify(&msg.ack_agg_sig, &keys, &msg.ack_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EcdsaKeypair;
    use crate::types::committee::Delegate;

    fn controller(seed: u8, delegates: &DelegateSet) -> EpochController {
        let ecdsa = EcdsaKeypair::from_bytes(&[seed; 32]).unwrap();
        EpochController::new(
            delegates.clone(),
            4,
            ecdsa.public(),
            ThresholdKeypair::from_seed(&[seed; 32]).unwrap(),
            EpochId::new(0),
        )
    }

    fn delegates() -> DelegateSet {
        DelegateSet::new(
            (1u8..=4)
                .map(|seed| {
                    let ecdsa = EcdsaKeypair::from_bytes(&[seed; 32]).unwrap();
                    let threshold = ThresholdKeypair::from_seed(&[seed; 32]).unwrap();
                    Delegate {
                        name: format!("delegate-{seed}"),
                        address: ecdsa.address(),
                        ecdsa_pubkey: ecdsa.public(),
                        threshold_pubkey: threshold.public(),
                        voting_power: 1,
                        net_addr: NetAddress::new("127.0.0.1", 8670),
                    }
                })
                .collect(),
        )
    }

    fn committed(height: u32, block_type: BlockType, nonce: Option<u64>) -> CommittedBlock {
        CommittedBlock {
            id: BlockId::compose(BlockHeight::new(height), &Bytes32::new([height as u8; 32])),
            height: BlockHeight::new(height),
            block_type,
            epoch: EpochId::new(0),
            keyframe_nonce: nonce,
        }
    }

    #[test]
    fn rotation_waits_for_stop_block() {
        let delegates = delegates();
        let mut controller = controller(1, &delegates);

        assert!(controller
            .on_commit(&committed(9, BlockType::MBlock, None))
            .is_none());
        assert!(controller
            .on_commit(&committed(10, BlockType::KBlock, Some(0xDEADBEEF)))
            .is_none());

        let change = controller
            .on_commit(&committed(11, BlockType::SBlock, None))
            .unwrap();
        assert_eq!(change.epoch, EpochId::new(1));
        assert_eq!(change.nonce, 0xDEADBEEF);
        assert_eq!(change.kframe_height, BlockHeight::new(10));
        assert_eq!(change.committee.len(), 4);

        // The new leader is the delegate with the smallest commit key under the nonce.
        let mut keyed: Vec<_> = delegates
            .delegates
            .iter()
            .map(|d| CommitteeBuilder::commit_key(&d.ecdsa_pubkey, 0xDEADBEEF))
            .collect();
        keyed.sort();
        assert_eq!(change.committee.leader().unwrap().commit_key, keyed[0]);

        // A second s-block without a fresh keyframe does not rotate again.
        assert!(controller
            .on_commit(&committed(12, BlockType::SBlock, None))
            .is_none());
    }

    #[test]
    fn rotation_is_deterministic_across_nodes() {
        let delegates = delegates();
        let mut a = controller(1, &delegates);
        let mut b = controller(2, &delegates);

        for controller in [&mut a, &mut b] {
            controller.on_commit(&committed(10, BlockType::KBlock, Some(42)));
        }
        let change_a = a.on_commit(&committed(11, BlockType::SBlock, None)).unwrap();
        let change_b = b.on_commit(&committed(11, BlockType::SBlock, None)).unwrap();

        assert_eq!(change_a.committee, change_b.committee);
        assert_eq!(change_a.epoch, change_b.epoch);
    }
}
