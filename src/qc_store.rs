/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Building, verifying and caching quorum certificates.
//!
//! The store tracks the highest QC seen (`best_qc`), persists it through the chain store so a
//! restarted pacemaker resumes where it left off, and exposes a watch channel that fires on every
//! improvement. QCs are persisted next to the blocks they certify by
//! [`ChainStore::commit_block`](crate::chain::ChainStore::commit_block).

use std::sync::mpsc::Sender;

use crate::crypto;
use crate::pacemaker::types::{leader_majority_two_third, VoteTally};
use crate::types::certificates::{Certificate, QuorumCert};
use crate::types::committee::Committee;

/// Failure modes of [`QcStore::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QcError {
    /// The tally's unique-voter cardinality is below the leader-side quorum.
    InsufficientVotes,
    /// A set bit in the tally indexes outside the committee.
    PubkeyMismatch,
    /// A collected partial does not decode as a canonical signature.
    Malformed,
}

/// Cache of the highest quorum certificate, ordered by `(height, round)` with first-received
/// winning ties.
pub struct QcStore {
    best: QuorumCert,
    watchers: Vec<Sender<QuorumCert>>,
}

impl QcStore {
    /// Create a store resuming from `best`, normally the persisted best QC of the chain store.
    pub fn new(best: QuorumCert) -> QcStore {
        QcStore {
            best,
            watchers: Vec::new(),
        }
    }

    /// Aggregate a quorum of partial votes into a certificate for the tallied block.
    ///
    /// Quorum here is the leader-side rule: the proposer's own vote is in the tally, so a
    /// committee of two progresses on a single vote.
    pub fn build(tally: &VoteTally, committee: &Committee) -> Result<QuorumCert, QcError> {
        if !leader_majority_two_third(tally.count(), committee.len()) {
            return Err(QcError::InsufficientVotes);
        }
        if tally.bitmap().iter_set().any(|i| committee.member(i).is_none()) {
            return Err(QcError::PubkeyMismatch);
        }

        let agg = crypto::threshold_aggregate(&tally.partials())
            .map_err(|_| QcError::Malformed)?;
        Ok(QuorumCert {
            height: tally.height,
            round: tally.round,
            epoch: tally.epoch,
            block_id: tally.block_id,
            voter_bitmap: tally.bitmap().clone(),
            voter_msg_hash: tally.msg_hash,
            voter_agg_sig: agg,
        })
    }

    /// Verify a received certificate against the committee active in its epoch. Peer-side quorum
    /// rule, bitmap cardinality, and aggregate signature all have to hold.
    pub fn verify(qc: &QuorumCert, committee: &Committee) -> bool {
        qc.is_correct(committee)
    }

    /// Adopt `qc` if it ranks strictly higher than the current best. Returns whether the best
    /// changed. Equal `(height, round)` keeps the first-received certificate.
    pub fn update(&mut self, qc: &QuorumCert) -> bool {
        if !qc.is_higher_than(&self.best) {
            return false;
        }
        self.best = qc.clone();
        self.watchers
            .retain(|watcher| watcher.send(qc.clone()).is_ok());
        true
    }

    /// The QC with the greatest height, tie-broken by round then arrival order.
    pub fn best_qc(&self) -> &QuorumCert {
        &self.best
    }

    /// Register a watcher that receives every new best QC. The replica registers one at startup
    /// and exposes the receiving end to probes, which observe consensus progress through it
    /// without touching consensus state. Watchers whose receiver is gone are dropped on the next
    /// improvement.
    pub fn watch(&mut self, watcher: Sender<QuorumCert>) {
        self.watchers.push(watcher);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EcdsaKeypair, ThresholdKeypair};
    use crate::types::basic::*;
    use crate::types::committee::{CommitteeBuilder, Delegate, DelegateSet};

    fn committee_of(n: u8) -> (Committee, Vec<ThresholdKeypair>) {
        let mut threshold_keys = Vec::new();
        let delegates: Vec<Delegate> = (1..=n)
            .map(|seed| {
                let ecdsa = EcdsaKeypair::from_bytes(&[seed; 32]).unwrap();
                let threshold = ThresholdKeypair::from_seed(&[seed; 32]).unwrap();
                threshold_keys.push((ecdsa.public(), threshold.clone()));
                Delegate {
                    name: format!("member-{seed}"),
                    address: ecdsa.address(),
                    ecdsa_pubkey: ecdsa.public(),
                    threshold_pubkey: threshold.public(),
                    voting_power: 1,
                    net_addr: NetAddress::new("127.0.0.1", 8670),
                }
            })
            .collect();
        let me = delegates[0].ecdsa_pubkey;
        let (committee, _, _, _) =
            CommitteeBuilder::build(&DelegateSet::new(delegates), 1, n as usize, &me);
        // Reorder the threshold keys to committee order.
        let keys = committee
            .members()
            .map(|m| {
                threshold_keys
                    .iter()
                    .find(|(pk, _)| *pk == m.ecdsa_pubkey)
                    .unwrap()
                    .1
                    .clone()
            })
            .collect();
        (committee, keys)
    }

    fn tally_with_votes(
        committee: &Committee,
        keys: &[ThresholdKeypair],
        voters: &[usize],
    ) -> VoteTally {
        let block_id = BlockId::compose(BlockHeight::new(1), &Bytes32::new([7; 32]));
        let msg_hash = QuorumCert::voting_hash(
            &block_id,
            BlockHeight::new(1),
            Round::new(0),
            EpochId::new(0),
        );
        let mut tally = VoteTally::new(
            block_id,
            BlockHeight::new(1),
            Round::new(0),
            EpochId::new(0),
            msg_hash,
            committee.len(),
        );
        for &voter in voters {
            tally.collect(voter, keys[voter].sign(&msg_hash));
        }
        tally
    }

    #[test]
    fn build_and_verify_roundtrip() {
        let (committee, keys) = committee_of(4);
        let tally = tally_with_votes(&committee, &keys, &[0, 1, 2]);

        let qc = QcStore::build(&tally, &committee).unwrap();
        assert_eq!(qc.voter_bitmap.count(), 3);
        assert!(QcStore::verify(&qc, &committee));
    }

    #[test]
    fn build_rejects_undersized_tally() {
        let (committee, keys) = committee_of(4);
        let tally = tally_with_votes(&committee, &keys, &[0, 1]);
        assert_eq!(
            QcStore::build(&tally, &committee),
            Err(QcError::InsufficientVotes)
        );
    }

    #[test]
    fn lone_leader_qc_builds_but_fails_peer_verification() {
        // Committee of two: the leader-side rule lets a single vote form a QC, while the
        // peer-side rule still demands both voters.
        let (committee, keys) = committee_of(2);
        let tally = tally_with_votes(&committee, &keys, &[0]);

        let qc = QcStore::build(&tally, &committee).unwrap();
        assert!(!QcStore::verify(&qc, &committee));
    }

    #[test]
    fn watch_fires_on_every_improvement() {
        let genesis = QuorumCert::genesis(BlockId::default());
        let mut store = QcStore::new(genesis.clone());
        let (watcher, updates) = std::sync::mpsc::channel();
        store.watch(watcher);

        let mut qc1 = genesis.clone();
        qc1.height = BlockHeight::new(1);
        let mut qc2 = genesis.clone();
        qc2.height = BlockHeight::new(2);

        assert!(store.update(&qc1));
        // A non-improvement fires nothing.
        assert!(!store.update(&qc1));
        assert!(store.update(&qc2));

        assert_eq!(updates.try_recv().unwrap().height, BlockHeight::new(1));
        assert_eq!(updates.try_recv().unwrap().height, BlockHeight::new(2));
        assert!(updates.try_recv().is_err());
    }

    #[test]
    fn update_orders_by_height_then_round() {
        let genesis = QuorumCert::genesis(BlockId::default());
        let mut store = QcStore::new(genesis.clone());

        let mut higher = genesis.clone();
        higher.height = BlockHeight::new(2);
        higher.round = Round::new(5);
        assert!(store.update(&higher));

        // Same (height, round): first received wins.
        let mut rival = higher.clone();
        rival.voter_msg_hash = Bytes32::new([1; 32]);
        assert!(!store.update(&rival));
        assert_eq!(store.best_qc(), &higher);

        let mut same_height_higher_round = higher.clone();
        same_height_higher_round.round = Round::new(6);
        assert!(store.update(&same_height_higher_round));
    }
}
