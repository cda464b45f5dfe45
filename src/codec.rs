/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Canonical, length-prefixed encoding of every persisted and wire structure.
//!
//! Encoding goes through Borsh, which is bijective over the types it derives for: two semantically
//! equal values produce identical bytes. Block IDs are hashes of this encoding, so byte stability
//! is an invariant, not an optimization.
//!
//! Decoding is total: any deviation from the declared schema, including trailing bytes, yields
//! [`CodecError::Malformed`] rather than a panic.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::block::Block;

/// The single decoding failure mode. Deliberately carries no payload: malformed input is dropped
/// and recorded, never propagated or interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecError;

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed encoding")
    }
}

impl std::error::Error for CodecError {}

/// Encode `value` into its canonical byte representation.
pub fn encode<T: BorshSerialize>(value: &T) -> Vec<u8> {
    // Safety: Borsh serialization of an in-memory value only fails on an io::Write error, and
    // Vec<u8> as a writer is infallible.
    value.try_to_vec().expect("serialization into a Vec")
}

/// Decode a value of type `T` from `bytes`. The entire slice must be consumed.
pub fn decode<T: BorshDeserialize>(bytes: &[u8]) -> Result<T, CodecError> {
    T::try_from_slice(bytes).map_err(|_| CodecError)
}

/// Encode a block into its canonical byte representation.
pub fn encode_block(block: &Block) -> Vec<u8> {
    encode(block)
}

/// Decode a block, verifying the whole slice is consumed.
pub fn decode_block(bytes: &[u8]) -> Result<Block, CodecError> {
    decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::*;
    use crate::types::block::*;
    use crate::types::certificates::QuorumCert;

    fn sample_block() -> Block {
        let mut block = Block::genesis(Magic::V1);
        block.header.timestamp = 1_700_000_000;
        block.header.block_type = BlockType::MBlock;
        block.txs = vec![vec![1, 2, 3], vec![4, 5]];
        block.parent_qc = Some(QuorumCert::genesis(Block::genesis(Magic::V1).id()));
        block.keyframe = None;
        block.committee_info = Some(CommitteeInfos {
            epoch: EpochId::new(3),
            members: Vec::new(),
        });
        block
    }

    #[test]
    fn block_roundtrip_is_byte_stable() {
        let block = sample_block();
        let bytes = encode_block(&block);
        let decoded = decode_block(&bytes).unwrap();
        assert_eq!(decoded, block);
        // Re-encoding the decoded block reproduces the original bytes exactly.
        assert_eq!(encode_block(&decoded), bytes);
    }

    #[test]
    fn decode_rejects_truncation_and_trailing_bytes() {
        let bytes = encode_block(&sample_block());

        assert_eq!(decode_block(&bytes[..bytes.len() - 1]), Err(CodecError));

        let mut extended = bytes.clone();
        extended.push(0);
        assert_eq!(decode_block(&extended), Err(CodecError));

        assert!(decode_block(&[]).is_err());
    }

    #[test]
    fn qc_roundtrip() {
        let qc = QuorumCert {
            height: BlockHeight::new(9),
            round: Round::new(12),
            epoch: EpochId::new(2),
            block_id: BlockId::new([9u8; 32]),
            voter_bitmap: {
                let mut bm = Bitmap::new(4);
                bm.set(0);
                bm.set(2);
                bm
            },
            voter_msg_hash: Bytes32::new([3u8; 32]),
            voter_agg_sig: ThresholdSigBytes::new([4u8; 96]),
        };
        let decoded: QuorumCert = decode(&encode(&qc)).unwrap();
        assert_eq!(decoded, qc);
    }
}
