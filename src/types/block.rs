/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the block type regime: headers, the three block kinds, keyframe payloads,
//! embedded committee info, and double-sign evidence.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::codec;
use crate::crypto::{self, CryptoError};
use crate::types::basic::*;
use crate::types::certificates::QuorumCert;

/// The kind of a block, which gates committee rotation.
///
/// - `MBlock`: an ordinary block carrying transactions.
/// - `KBlock`: a keyframe block anchoring a proof-of-work nonce; terminates the current epoch.
/// - `SBlock`: a stop block marking committee wind-down after a keyframe. At most two follow a
///   `KBlock` before the next committee takes over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub enum BlockType {
    KBlock,
    MBlock,
    SBlock,
}

impl BlockType {
    pub fn is_kblock(self) -> bool {
        self == BlockType::KBlock
    }

    pub fn is_mblock(self) -> bool {
        self == BlockType::MBlock
    }

    pub fn is_sblock(self) -> bool {
        self == BlockType::SBlock
    }
}

/// A block header. Immutable once signed: the signing hash covers every field except the
/// signature, and the signer address recovered from the signature must be the committee-assigned
/// proposer for the block's round.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Header {
    pub parent_id: BlockId,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub last_kframe_height: BlockHeight,
    pub block_type: BlockType,
    pub beneficiary: Address,
    pub proposer: Address,
    pub gas_used: u64,
    pub total_score: u64,
    pub txs_root: Bytes32,
    pub state_root: Bytes32,
    pub receipts_root: Bytes32,
    pub evidence_root: Bytes32,
    pub signature: SignatureBytes,
}

impl Header {
    /// The height of the block with this header, inferred from the parent ID.
    ///
    /// The genesis parent ID carries `0xFFFFFFFF` in its leading bytes, so the wrapping add yields
    /// height 0.
    pub fn number(&self) -> BlockHeight {
        BlockHeight::new(self.parent_id.height().int().wrapping_add(1))
    }

    /// Hash of all header fields excluding the signature.
    pub fn signing_hash(&self) -> Bytes32 {
        let fields = codec::encode(&(
            self.parent_id,
            self.timestamp,
            self.gas_limit,
            self.last_kframe_height,
            self.block_type,
            self.beneficiary,
            self.proposer,
            self.gas_used,
            self.total_score,
            self.txs_root,
            self.state_root,
            self.receipts_root,
            self.evidence_root,
        ));
        crypto::blake2b(&[&fields])
    }

    /// Recover the address of the signer of this header.
    pub fn signer(&self) -> Result<Address, CryptoError> {
        if self.number() == BlockHeight::new(0) {
            // The genesis block is unsigned.
            return Ok(Address::default());
        }
        let pubkey = crypto::recover(&self.signing_hash(), &self.signature)?;
        Ok(crypto::address_of(&pubkey))
    }

    /// The ID of the block with this header: `number || blake2b(signing_hash, signer)[4..32]`.
    pub fn id(&self) -> BlockId {
        let signer = self.signer().unwrap_or_default();
        let hash = crypto::blake2b(&[&self.signing_hash().bytes(), &signer.bytes()]);
        BlockId::compose(self.number(), &hash)
    }
}

/// The proof-of-work anchor embedded in every k-block: the winning nonce that seeds the next
/// committee, the raw PoW blocks it came from, and the proof tying them together.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct KeyframeData {
    pub nonce: u64,
    pub pow_blocks: Vec<Vec<u8>>,
    pub proof: Vec<u8>,
}

/// One committee member's entry in the committee info embedded in the first m-block after a
/// k-block.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct CommitteeInfo {
    pub name: String,
    pub index: u32,
    pub net_addr: NetAddress,
    pub threshold_pubkey: ThresholdPubKeyBytes,
    pub ecdsa_pubkey: PubKeyBytes,
}

/// Committee info payload: which epoch it establishes and the ordered members.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct CommitteeInfos {
    pub epoch: EpochId,
    pub members: Vec<CommitteeInfo>,
}

/// A double-sign artifact: the same committee index produced two signatures over different
/// message hashes at one `(height, round)`.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub index: u32,
    pub address: Address,
    pub msg_hash_a: Bytes32,
    pub msg_hash_b: Bytes32,
    pub sig_a: Vec<u8>,
    pub sig_b: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum ViolationKind {
    DoubleSign,
}

/// Per-finalized-block record of the aggregate voting artifacts and the double-signs observed
/// while gathering them, separately for the voting round and the notarization round.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Evidence {
    pub voting_sig: ThresholdSigBytes,
    pub voting_msg_hash: Bytes32,
    pub voting_bitmap: Bitmap,
    pub voting_violations: Vec<Violation>,
    pub notarize_sig: ThresholdSigBytes,
    pub notarize_msg_hash: Bytes32,
    pub notarize_bitmap: Bitmap,
    pub notarize_violations: Vec<Violation>,
}

/// An immutable block: header, transaction list, the quorum certificate for the parent, and the
/// optional committee-info and keyframe payloads.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Block {
    pub header: Header,
    pub txs: Vec<Vec<u8>>,
    pub parent_qc: Option<QuorumCert>,
    pub committee_info: Option<CommitteeInfos>,
    pub keyframe: Option<KeyframeData>,
    pub magic: Magic,
}

impl Block {
    /// The parent ID a genesis block carries, chosen so that `number()` wraps to 0.
    pub const GENESIS_PARENT_ID: BlockId = BlockId::new([
        0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 0, 0, 0, 0,
    ]);

    /// Build the unsigned genesis block of a network identified by `magic`.
    pub fn genesis(magic: Magic) -> Block {
        Block {
            header: Header {
                parent_id: Self::GENESIS_PARENT_ID,
                timestamp: 0,
                gas_limit: 0,
                last_kframe_height: BlockHeight::new(0),
                block_type: BlockType::KBlock,
                beneficiary: Address::default(),
                proposer: Address::default(),
                gas_used: 0,
                total_score: 0,
                txs_root: Bytes32::default(),
                state_root: Bytes32::default(),
                receipts_root: Bytes32::default(),
                evidence_root: Bytes32::default(),
                signature: SignatureBytes::default(),
            },
            txs: Vec::new(),
            parent_qc: None,
            committee_info: None,
            keyframe: Some(KeyframeData::default()),
            magic,
        }
    }

    pub fn id(&self) -> BlockId {
        self.header.id()
    }

    pub fn number(&self) -> BlockHeight {
        self.header.number()
    }

    pub fn block_type(&self) -> BlockType {
        self.header.block_type
    }

    pub fn is_kblock(&self) -> bool {
        self.header.block_type.is_kblock()
    }

    pub fn is_sblock(&self) -> bool {
        self.header.block_type.is_sblock()
    }

    /// The epoch this block belongs to. The first m-block of an epoch reads it from its embedded
    /// committee info; every other block reads it from its parent QC.
    pub fn epoch(&self) -> EpochId {
        if let Some(committee_info) = &self.committee_info {
            committee_info.epoch
        } else if let Some(parent_qc) = &self.parent_qc {
            parent_qc.epoch
        } else {
            EpochId::new(0)
        }
    }

    /// Hash of the embedded payloads covered by the header's evidence root: the parent QC, the
    /// committee info, and the keyframe data.
    pub fn evidence_payload_hash(&self) -> Bytes32 {
        let payload = codec::encode(&(&self.parent_qc, &self.committee_info, &self.keyframe));
        crypto::blake2b(&[&payload])
    }

    /// Create a copy of this block with the header signature set.
    pub fn with_signature(mut self, signature: SignatureBytes) -> Block {
        self.header.signature = signature;
        self
    }

    /// A one-line rendering for logs.
    pub fn oneliner(&self) -> String {
        let kind = match self.header.block_type {
            BlockType::KBlock => "kBlock",
            BlockType::MBlock => "mBlock",
            BlockType::SBlock => "sBlock",
        };
        format!(
            "{}({}) {} txs: {}, parent: {}",
            kind,
            self.number(),
            self.id(),
            self.txs.len(),
            self.header.parent_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_has_height_zero() {
        let genesis = Block::genesis(Magic::V1);
        assert_eq!(genesis.number(), BlockHeight::new(0));
        assert_eq!(genesis.id().height(), BlockHeight::new(0));
        assert_eq!(genesis.epoch(), EpochId::new(0));
    }

    #[test]
    fn signing_hash_ignores_signature() {
        let mut block = Block::genesis(Magic::V1);
        let before = block.header.signing_hash();
        block.header.signature = SignatureBytes::new([7u8; 65]);
        assert_eq!(block.header.signing_hash(), before);
    }
}
