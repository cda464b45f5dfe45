/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Committee formation: deterministically derive an ordered committee and per-round proposer from
//! the delegate set and a nonce published by the keyframe source.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::crypto;
use crate::types::basic::*;
use crate::types::block::{CommitteeInfo, CommitteeInfos};

/// A delegate eligible for committee selection. Delegate selection itself (staking, reward
/// weighting) happens outside this crate; the consensus core receives the already-selected set.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Delegate {
    pub name: String,
    pub address: Address,
    pub ecdsa_pubkey: PubKeyBytes,
    pub threshold_pubkey: ThresholdPubKeyBytes,
    pub voting_power: u64,
    pub net_addr: NetAddress,
}

/// The ordered list of delegates the next committee is drawn from.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct DelegateSet {
    pub delegates: Vec<Delegate>,
}

impl DelegateSet {
    pub fn new(delegates: Vec<Delegate>) -> DelegateSet {
        DelegateSet { delegates }
    }

    pub fn len(&self) -> usize {
        self.delegates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty()
    }
}

/// One member of the active committee. `index` is the member's position in the commit-key order
/// and doubles as its bit index in voter bitmaps.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct CommitteeMember {
    pub name: String,
    pub address: Address,
    pub ecdsa_pubkey: PubKeyBytes,
    pub threshold_pubkey: ThresholdPubKeyBytes,
    pub commit_key: Bytes32,
    pub net_addr: NetAddress,
    pub index: u32,
}

/// The role this node plays in the current committee.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    None,
    Leader,
    Validator,
}

/// The ordered subset of delegates eligible to propose and vote in the current epoch.
///
/// Members are sorted ascending by commit key; the 0th member is the epoch leader, used only to
/// seed the round-0 proposer. The proposer then rotates round-robin by round number.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Committee {
    members: Vec<CommitteeMember>,
}

impl Committee {
    pub fn new(members: Vec<CommitteeMember>) -> Committee {
        Committee { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member(&self, index: usize) -> Option<&CommitteeMember> {
        self.members.get(index)
    }

    pub fn members(&self) -> impl Iterator<Item = &CommitteeMember> {
        self.members.iter()
    }

    /// The epoch leader: the member whose commit key sorts lowest.
    pub fn leader(&self) -> Option<&CommitteeMember> {
        self.members.first()
    }

    /// The proposer of the given round: round-robin over the sorted members.
    pub fn proposer(&self, round: Round) -> Option<&CommitteeMember> {
        if self.members.is_empty() {
            return None;
        }
        self.members
            .get(round.int() as usize % self.members.len())
    }

    /// The position of `pubkey` in this committee, if it is a member.
    pub fn index_of(&self, pubkey: &PubKeyBytes) -> Option<usize> {
        self.members.iter().position(|m| &m.ecdsa_pubkey == pubkey)
    }

    pub fn contains(&self, pubkey: &PubKeyBytes) -> bool {
        self.index_of(pubkey).is_some()
    }

    /// The committee info payload embedded in the first m-block of `epoch`.
    pub fn to_committee_infos(&self, epoch: EpochId) -> CommitteeInfos {
        CommitteeInfos {
            epoch,
            members: self
                .members
                .iter()
                .map(|m| CommitteeInfo {
                    name: m.name.clone(),
                    index: m.index,
                    net_addr: m.net_addr.clone(),
                    threshold_pubkey: m.threshold_pubkey,
                    ecdsa_pubkey: m.ecdsa_pubkey,
                })
                .collect(),
        }
    }
}

/// Maps `(delegate_set, nonce)` to an ordered committee. Stateless; all nodes running the same
/// build over the same inputs must produce identical committees, byte for byte.
pub struct CommitteeBuilder;

impl CommitteeBuilder {
    /// The commit key of a delegate under `nonce`: `keccak256(ecdsa_pubkey || uvarint(nonce))`.
    pub fn commit_key(pubkey: &PubKeyBytes, nonce: u64) -> Bytes32 {
        let nonce_bytes = crypto::uvarint10(nonce);
        crypto::keccak256(&[&pubkey.bytes(), &nonce_bytes])
    }

    /// Derive the committee for `nonce` from `delegates`, taking the `committee_size` delegates
    /// with the lowest commit keys. Ties on equal commit keys break by ECDSA public key
    /// lexicographic order, so the result is a pure function of the inputs.
    ///
    /// Returns the committee together with the caller's role, index, and membership flag, judged
    /// against `my_pubkey`.
    pub fn build(
        delegates: &DelegateSet,
        nonce: u64,
        committee_size: usize,
        my_pubkey: &PubKeyBytes,
    ) -> (Committee, Role, usize, bool) {
        let mut keyed: Vec<(Bytes32, &Delegate)> = delegates
            .delegates
            .iter()
            .map(|d| (Self::commit_key(&d.ecdsa_pubkey, nonce), d))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.ecdsa_pubkey.cmp(&b.1.ecdsa_pubkey)));

        let size = committee_size.min(keyed.len());
        let members: Vec<CommitteeMember> = keyed[..size]
            .iter()
            .enumerate()
            .map(|(index, (commit_key, d))| CommitteeMember {
                name: d.name.clone(),
                address: d.address,
                ecdsa_pubkey: d.ecdsa_pubkey,
                threshold_pubkey: d.threshold_pubkey,
                commit_key: *commit_key,
                net_addr: d.net_addr.clone(),
                index: index as u32,
            })
            .collect();
        let committee = Committee::new(members);

        match committee.index_of(my_pubkey) {
            Some(0) => (committee, Role::Leader, 0, true),
            Some(index) => (committee, Role::Validator, index, true),
            None => (committee, Role::None, 0, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EcdsaKeypair, ThresholdKeypair};

    fn delegate(seed: u8) -> Delegate {
        let ecdsa = EcdsaKeypair::from_bytes(&[seed; 32]).unwrap();
        let threshold = ThresholdKeypair::from_seed(&[seed; 32]).unwrap();
        Delegate {
            name: format!("delegate-{seed}"),
            address: ecdsa.address(),
            ecdsa_pubkey: ecdsa.public(),
            threshold_pubkey: threshold.public(),
            voting_power: 1,
            net_addr: NetAddress::new("127.0.0.1", 8670 + seed as u16),
        }
    }

    #[test]
    fn build_is_deterministic() {
        let delegates = DelegateSet::new((1u8..=6).map(delegate).collect());
        let me = delegates.delegates[0].ecdsa_pubkey;

        let (a, _, _, _) = CommitteeBuilder::build(&delegates, 0xDEADBEEF, 4, &me);
        let (b, _, _, _) = CommitteeBuilder::build(&delegates, 0xDEADBEEF, 4, &me);
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);

        // A different nonce reshuffles the order (with overwhelming probability for 6 delegates).
        let (c, _, _, _) = CommitteeBuilder::build(&delegates, 0xCAFEBABE, 4, &me);
        assert_ne!(
            a.members().map(|m| m.commit_key).collect::<Vec<_>>(),
            c.members().map(|m| m.commit_key).collect::<Vec<_>>()
        );
    }

    #[test]
    fn members_sorted_by_commit_key_and_indexed() {
        let delegates = DelegateSet::new((1u8..=5).map(delegate).collect());
        let me = delegates.delegates[0].ecdsa_pubkey;
        let (committee, _, _, _) = CommitteeBuilder::build(&delegates, 42, 5, &me);

        let keys: Vec<Bytes32> = committee.members().map(|m| m.commit_key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        for (i, member) in committee.members().enumerate() {
            assert_eq!(member.index as usize, i);
            assert_eq!(
                member.commit_key,
                CommitteeBuilder::commit_key(&member.ecdsa_pubkey, 42)
            );
        }
    }

    #[test]
    fn roles_reported_against_caller() {
        let delegates = DelegateSet::new((1u8..=4).map(delegate).collect());
        let leader_key = {
            let (committee, _, _, _) = CommitteeBuilder::build(
                &delegates,
                7,
                4,
                &delegates.delegates[0].ecdsa_pubkey,
            );
            committee.leader().unwrap().ecdsa_pubkey
        };

        let (_, role, index, in_committee) =
            CommitteeBuilder::build(&delegates, 7, 4, &leader_key);
        assert_eq!(role, Role::Leader);
        assert_eq!(index, 0);
        assert!(in_committee);

        let outsider = EcdsaKeypair::from_bytes(&[99; 32]).unwrap().public();
        let (_, role, _, in_committee) = CommitteeBuilder::build(&delegates, 7, 4, &outsider);
        assert_eq!(role, Role::None);
        assert!(!in_committee);
    }

    #[test]
    fn round_proposer_rotates() {
        let delegates = DelegateSet::new((1u8..=4).map(delegate).collect());
        let me = delegates.delegates[0].ecdsa_pubkey;
        let (committee, _, _, _) = CommitteeBuilder::build(&delegates, 7, 4, &me);

        assert_eq!(
            committee.proposer(Round::new(0)).unwrap().index,
            committee.leader().unwrap().index
        );
        assert_eq!(committee.proposer(Round::new(5)).unwrap().index, 1);
    }
}
