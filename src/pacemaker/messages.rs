/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured messages exchanged between committee members.
//!
//! Every message is a byte-canonical record with a common [`MessageHeader`] and a body
//! discriminated by a single-byte tag on the wire. The closed [`ConsensusMessage`] union forces
//! every handler to consider every kind; adding a variant is a compile error everywhere a match
//! exists.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::codec::{self, CodecError};
use crate::crypto::{self, EcdsaKeypair};
use crate::types::basic::*;
use crate::types::block::CommitteeInfos;
use crate::types::certificates::QuorumCert;

/// Wire tags. The values are part of the network compatibility surface and must not change.
pub mod tags {
    pub const ANNOUNCE_COMMITTEE: u8 = 0x01;
    pub const COMMIT_COMMITTEE: u8 = 0x02;
    pub const NOTARY_ANNOUNCE: u8 = 0x04;
    pub const PROPOSAL: u8 = 0x09;
    pub const VOTE: u8 = 0x10;
    pub const NEW_VIEW: u8 = 0x11;
    pub const NEW_COMMITTEE: u8 = 0x12;
    pub const QUERY_PROPOSAL: u8 = 0x13;
}

/// Fields common to every consensus message. The signature is an ECDSA signature by `sender` over
/// the message's signing hash, which covers the header fields and the body.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct MessageHeader {
    pub magic: Magic,
    pub sender: PubKeyBytes,
    pub round: Round,
    pub epoch: EpochId,
    pub signature: SignatureBytes,
}

/// A signed message consists of a [`MessageHeader`] and body bytes the signature is over. Given
/// both, the signature can be verified against the claimed sender.
pub trait SignedMessage {
    /// The canonical bytes of the message body (everything outside the header).
    fn body_bytes(&self) -> Vec<u8>;

    fn header(&self) -> &MessageHeader;

    /// The hash the header signature is over: header fields except the signature, then the body.
    fn signing_hash(&self) -> Bytes32 {
        let header = self.header();
        let head = codec::encode(&(header.magic, header.sender, header.round, header.epoch));
        crypto::blake2b(&[&head, &self.body_bytes()])
    }

    /// Verify that the header signature was produced by the claimed sender.
    fn is_correct(&self) -> bool {
        crypto::verify_signer(
            &self.signing_hash(),
            &self.header().signature,
            &self.header().sender,
        )
        .is_ok()
    }
}

fn signed_header(
    keypair: &EcdsaKeypair,
    magic: Magic,
    round: Round,
    epoch: EpochId,
    body: &[u8],
) -> MessageHeader {
    let mut header = MessageHeader {
        magic,
        sender: keypair.public(),
        round,
        epoch,
        signature: SignatureBytes::default(),
    };
    let head = codec::encode(&(header.magic, header.sender, header.round, header.epoch));
    header.signature = keypair.sign(&crypto::blake2b(&[&head, body]));
    header
}

macro_rules! impl_signed_message {
    ($type:ty, |$self:ident| $body:expr) => {
        impl SignedMessage for $type {
            fn body_bytes(&$self) -> Vec<u8> {
                $body
            }

            fn header(&self) -> &MessageHeader {
                &self.header
            }
        }
    };
}

/// Broadcast by the proposer of a round: proposes to extend the chain with the contained block.
///
/// The block travels in its canonical encoding because its ID is a hash of those bytes; the
/// receiver decodes and re-checks rather than trusting any derived field.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Proposal {
    pub header: MessageHeader,
    pub block_bytes: Vec<u8>,
    pub parent_qc: QuorumCert,
}

impl Proposal {
    pub fn new(
        keypair: &EcdsaKeypair,
        magic: Magic,
        round: Round,
        epoch: EpochId,
        block_bytes: Vec<u8>,
        parent_qc: QuorumCert,
    ) -> Proposal {
        let body = codec::encode(&(&block_bytes, &parent_qc));
        Proposal {
            header: signed_header(keypair, magic, round, epoch, &body),
            block_bytes,
            parent_qc,
        }
    }
}

impl_signed_message!(Proposal, |self| codec::encode(&(
    &self.block_bytes,
    &self.parent_qc
)));

/// Sent by a validator to the proposer of the next round: a partial threshold signature over the
/// voted block's voting hash.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Vote {
    pub header: MessageHeader,
    pub block_id: BlockId,
    pub signer_index: u32,
    pub partial_sig: ThresholdSigBytes,
}

impl Vote {
    pub fn new(
        keypair: &EcdsaKeypair,
        magic: Magic,
        round: Round,
        epoch: EpochId,
        block_id: BlockId,
        signer_index: u32,
        partial_sig: ThresholdSigBytes,
    ) -> Vote {
        let body = codec::encode(&(block_id, signer_index, partial_sig));
        Vote {
            header: signed_header(keypair, magic, round, epoch, &body),
            block_id,
            signer_index,
            partial_sig,
        }
    }
}

impl_signed_message!(Vote, |self| codec::encode(&(
    self.block_id,
    self.signer_index,
    self.partial_sig
)));

/// Sent to the proposer of the next round on view timeout: carries the sender's highest QC so the
/// next proposer can catch up before proposing.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct NewView {
    pub header: MessageHeader,
    pub qc_high: QuorumCert,
}

impl NewView {
    pub fn new(
        keypair: &EcdsaKeypair,
        magic: Magic,
        round: Round,
        epoch: EpochId,
        qc_high: QuorumCert,
    ) -> NewView {
        let body = codec::encode(&qc_high);
        NewView {
            header: signed_header(keypair, magic, round, epoch, &body),
            qc_high,
        }
    }
}

impl_signed_message!(NewView, |self| codec::encode(&self.qc_high));

/// Asks the proposer of `(height, round)` to re-send its proposal; used by members that fell
/// behind within an epoch.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct QueryProposal {
    pub header: MessageHeader,
    pub height: BlockHeight,
    pub round: Round,
}

impl QueryProposal {
    pub fn new(
        keypair: &EcdsaKeypair,
        magic: Magic,
        round: Round,
        epoch: EpochId,
        height: BlockHeight,
        query_round: Round,
    ) -> QueryProposal {
        let body = codec::encode(&(height, query_round));
        QueryProposal {
            header: signed_header(keypair, magic, round, epoch, &body),
            height,
            round: query_round,
        }
    }
}

impl_signed_message!(QueryProposal, |self| codec::encode(&(
    self.height,
    self.round
)));

/// Sent by committee members of the next epoch to its expected leader once a keyframe nonce is
/// known: announces readiness to form the committee seeded by `nonce`.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct NewCommittee {
    pub header: MessageHeader,
    pub kframe_height: BlockHeight,
    pub nonce: u64,
    pub round: Round,
}

impl NewCommittee {
    pub fn new(
        keypair: &EcdsaKeypair,
        magic: Magic,
        round: Round,
        epoch: EpochId,
        kframe_height: BlockHeight,
        nonce: u64,
    ) -> NewCommittee {
        let body = codec::encode(&(kframe_height, nonce, round));
        NewCommittee {
            header: signed_header(keypair, magic, round, epoch, &body),
            kframe_height,
            nonce,
            round,
        }
    }
}

impl_signed_message!(NewCommittee, |self| codec::encode(&(
    self.kframe_height,
    self.nonce,
    self.round
)));

/// Broadcast by the epoch leader once enough members signalled readiness: the committee
/// parameters every member is expected to have derived identically.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct AnnounceCommittee {
    pub header: MessageHeader,
    pub committee: CommitteeInfos,
    pub kframe_height: BlockHeight,
    pub nonce: u64,
}

impl AnnounceCommittee {
    pub fn new(
        keypair: &EcdsaKeypair,
        magic: Magic,
        round: Round,
        epoch: EpochId,
        committee: CommitteeInfos,
        kframe_height: BlockHeight,
        nonce: u64,
    ) -> AnnounceCommittee {
        let body = codec::encode(&(&committee, kframe_height, nonce));
        AnnounceCommittee {
            header: signed_header(keypair, magic, round, epoch, &body),
            committee,
            kframe_height,
            nonce,
        }
    }

    /// The hash committee members ack with their threshold keys.
    pub fn ack_hash(&self) -> Bytes32 {
        let fields = codec::encode(&(
            "CommitteeAck",
            &self.committee,
            self.kframe_height,
            self.nonce,
        ));
        crypto::blake2b(&[&fields])
    }
}

impl_signed_message!(AnnounceCommittee, |self| codec::encode(&(
    &self.committee,
    self.kframe_height,
    self.nonce
)));

/// A member's ack of an announced committee: a partial threshold signature over the announce
/// hash, aggregated by the leader into the notarization.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct CommitCommittee {
    pub header: MessageHeader,
    pub signer_index: u32,
    pub ack_hash: Bytes32,
    pub partial_sig: ThresholdSigBytes,
}

impl CommitCommittee {
    pub fn new(
        keypair: &EcdsaKeypair,
        magic: Magic,
        round: Round,
        epoch: EpochId,
        signer_index: u32,
        ack_hash: Bytes32,
        partial_sig: ThresholdSigBytes,
    ) -> CommitCommittee {
        let body = codec::encode(&(signer_index, ack_hash, partial_sig));
        CommitCommittee {
            header: signed_header(keypair, magic, round, epoch, &body),
            signer_index,
            ack_hash,
            partial_sig,
        }
    }
}

impl_signed_message!(CommitCommittee, |self| codec::encode(&(
    self.signer_index,
    self.ack_hash,
    self.partial_sig
)));

/// Broadcast by the epoch leader after collecting a quorum of committee acks: the notarized
/// committee, after which members start round 0 of the new epoch.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct NotaryAnnounce {
    pub header: MessageHeader,
    pub ack_hash: Bytes32,
    pub ack_bitmap: Bitmap,
    pub ack_agg_sig: ThresholdSigBytes,
}

impl NotaryAnnounce {
    pub fn new(
        keypair: &EcdsaKeypair,
        magic: Magic,
        round: Round,
        epoch: EpochId,
        ack_hash: Bytes32,
        ack_bitmap: Bitmap,
        ack_agg_sig: ThresholdSigBytes,
    ) -> NotaryAnnounce {
        let body = codec::encode(&(ack_hash, &ack_bitmap, ack_agg_sig));
        NotaryAnnounce {
            header: signed_header(keypair, magic, round, epoch, &body),
            ack_hash,
            ack_bitmap,
            ack_agg_sig,
        }
    }
}

impl_signed_message!(NotaryAnnounce, |self| codec::encode(&(
    self.ack_hash,
    &self.ack_bitmap,
    self.ack_agg_sig
)));

/// The closed union of every consensus message kind.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum ConsensusMessage {
    Proposal(Proposal),
    Vote(Vote),
    NewView(NewView),
    QueryProposal(QueryProposal),
    NewCommittee(NewCommittee),
    AnnounceCommittee(AnnounceCommittee),
    CommitCommittee(CommitCommittee),
    NotaryAnnounce(NotaryAnnounce),
}

impl ConsensusMessage {
    /// The single-byte wire tag of this message kind.
    pub fn tag(&self) -> u8 {
        match self {
            ConsensusMessage::Proposal(_) => tags::PROPOSAL,
            ConsensusMessage::Vote(_) => tags::VOTE,
            ConsensusMessage::NewView(_) => tags::NEW_VIEW,
            ConsensusMessage::QueryProposal(_) => tags::QUERY_PROPOSAL,
            ConsensusMessage::NewCommittee(_) => tags::NEW_COMMITTEE,
            ConsensusMessage::AnnounceCommittee(_) => tags::ANNOUNCE_COMMITTEE,
            ConsensusMessage::CommitCommittee(_) => tags::COMMIT_COMMITTEE,
            ConsensusMessage::NotaryAnnounce(_) => tags::NOTARY_ANNOUNCE,
        }
    }

    pub fn header(&self) -> &MessageHeader {
        match self {
            ConsensusMessage::Proposal(m) => &m.header,
            ConsensusMessage::Vote(m) => &m.header,
            ConsensusMessage::NewView(m) => &m.header,
            ConsensusMessage::QueryProposal(m) => &m.header,
            ConsensusMessage::NewCommittee(m) => &m.header,
            ConsensusMessage::AnnounceCommittee(m) => &m.header,
            ConsensusMessage::CommitCommittee(m) => &m.header,
            ConsensusMessage::NotaryAnnounce(m) => &m.header,
        }
    }

    pub fn round(&self) -> Round {
        self.header().round
    }

    pub fn sender(&self) -> &PubKeyBytes {
        &self.header().sender
    }

    /// Verify the header signature of whichever kind this is.
    pub fn is_correct(&self) -> bool {
        match self {
            ConsensusMessage::Proposal(m) => m.is_correct(),
            ConsensusMessage::Vote(m) => m.is_correct(),
            ConsensusMessage::NewView(m) => m.is_correct(),
            ConsensusMessage::QueryProposal(m) => m.is_correct(),
            ConsensusMessage::NewCommittee(m) => m.is_correct(),
            ConsensusMessage::AnnounceCommittee(m) => m.is_correct(),
            ConsensusMessage::CommitCommittee(m) => m.is_correct(),
            ConsensusMessage::NotaryAnnounce(m) => m.is_correct(),
        }
    }

    /// A short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusMessage::Proposal(_) => "Proposal",
            ConsensusMessage::Vote(_) => "Vote",
            ConsensusMessage::NewView(_) => "NewView",
            ConsensusMessage::QueryProposal(_) => "QueryProposal",
            ConsensusMessage::NewCommittee(_) => "NewCommittee",
            ConsensusMessage::AnnounceCommittee(_) => "AnnounceCommittee",
            ConsensusMessage::CommitCommittee(_) => "CommitCommittee",
            ConsensusMessage::NotaryAnnounce(_) => "NotaryAnnounce",
        }
    }

    /// Encode as wire payload: the tag byte followed by the canonical body encoding.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut bytes = vec![self.tag()];
        let body = match self {
            ConsensusMessage::Proposal(m) => codec::encode(m),
            ConsensusMessage::Vote(m) => codec::encode(m),
            ConsensusMessage::NewView(m) => codec::encode(m),
            ConsensusMessage::QueryProposal(m) => codec::encode(m),
            ConsensusMessage::NewCommittee(m) => codec::encode(m),
            ConsensusMessage::AnnounceCommittee(m) => codec::encode(m),
            ConsensusMessage::CommitCommittee(m) => codec::encode(m),
            ConsensusMessage::NotaryAnnounce(m) => codec::encode(m),
        };
        bytes.extend_from_slice(&body);
        bytes
    }

    /// Decode a wire payload. Total: unknown tags and schema deviations yield `CodecError`.
    pub fn from_wire(bytes: &[u8]) -> Result<ConsensusMessage, CodecError> {
        let (tag, body) = bytes.split_first().ok_or(CodecError)?;
        Ok(match *tag {
            tags::PROPOSAL => ConsensusMessage::Proposal(codec::decode(body)?),
            tags::VOTE => ConsensusMessage::Vote(codec::decode(body)?),
            tags::NEW_VIEW => ConsensusMessage::NewView(codec::decode(body)?),
            tags::QUERY_PROPOSAL => ConsensusMessage::QueryProposal(codec::decode(body)?),
            tags::NEW_COMMITTEE => ConsensusMessage::NewCommittee(codec::decode(body)?),
            tags::ANNOUNCE_COMMITTEE => {
                ConsensusMessage::AnnounceCommittee(codec::decode(body)?)
            }
            tags::COMMIT_COMMITTEE => ConsensusMessage::CommitCommittee(codec::decode(body)?),
            tags::NOTARY_ANNOUNCE => ConsensusMessage::NotaryAnnounce(codec::decode(body)?),
            _ => return Err(CodecError),
        })
    }
}

impl From<Proposal> for ConsensusMessage {
    fn from(msg: Proposal) -> Self {
        ConsensusMessage::Proposal(msg)
    }
}

impl From<Vote> for ConsensusMessage {
    fn from(msg: Vote) -> Self {
        ConsensusMessage::Vote(msg)
    }
}

impl From<NewView> for ConsensusMessage {
    fn from(msg: NewView) -> Self {
        ConsensusMessage::NewView(msg)
    }
}

impl From<QueryProposal> for ConsensusMessage {
    fn from(msg: QueryProposal) -> Self {
        ConsensusMessage::QueryProposal(msg)
    }
}

impl From<NewCommittee> for ConsensusMessage {
    fn from(msg: NewCommittee) -> Self {
        ConsensusMessage::NewCommittee(msg)
    }
}

impl From<AnnounceCommittee> for ConsensusMessage {
    fn from(msg: AnnounceCommittee) -> Self {
        ConsensusMessage::AnnounceCommittee(msg)
    }
}

impl From<CommitCommittee> for ConsensusMessage {
    fn from(msg: CommitCommittee) -> Self {
        ConsensusMessage::CommitCommittee(msg)
    }
}

impl From<NotaryAnnounce> for ConsensusMessage {
    fn from(msg: NotaryAnnounce) -> Self {
        ConsensusMessage::NotaryAnnounce(msg)
    }
}
