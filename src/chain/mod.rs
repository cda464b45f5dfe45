/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and methods used to access and mutate the persisted chain.
//!
//! The chain may be stored in a key-value store of the library user's own choosing, as long as
//! that store can provide a type that implements [`KVStore`]. The chain is mutated exclusively
//! through a [`ChainStore`], which is owned by the commit path of the dispatch loop, and read
//! concurrently through [`ChainView`]s, which wrap consistent snapshots.
//!
//! ## State variables
//!
//! - **Blocks** (`BlockId -> Block`): every committed block, under its ID.
//! - **Quorum certificates** (`BlockId ++ "qc" -> QuorumCert`): the QC that certifies each
//!   committed block, co-located with it.
//! - **Evidence** (`BlockId ++ "ev" -> Evidence`): the double-sign record finalized with each
//!   block.
//! - **Block at height** (`BlockHeight -> BlockId`): the canonical chain index. Only committed
//!   blocks appear here; unfinalized proposals live in the
//!   [`ProposalGraph`](crate::graph::ProposalGraph), never in storage.
//! - **Best block**, **Best QC**: resume pointers for the pacemaker.
//! - **Highest round entered**, **Last voted round**, **Locked height**: the pacemaker's safety
//!   variables, persisted so a restarted node cannot be tricked into re-voting old rounds.

use borsh::BorshDeserialize;

use crate::codec;
use crate::types::basic::{BlockHeight, BlockId, Round};
use crate::types::block::{Block, CommitteeInfos, Evidence};
use crate::types::certificates::QuorumCert;

/// Pluggable persistent storage. Writes are atomic per [`WriteBatch`].
pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;
    type Snapshot<'a>: 'a + KVGet;

    fn write(&mut self, wb: Self::WriteBatch);
    fn clear(&mut self);
    fn snapshot<'b>(&'b self) -> Self::Snapshot<'b>;
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

mod paths {
    pub(super) const BLOCKS: [u8; 1] = [0];
    pub(super) const BLOCK_AT_HEIGHT: [u8; 1] = [1];
    pub(super) const BEST_BLOCK: [u8; 1] = [2];
    pub(super) const BEST_QC: [u8; 1] = [3];
    pub(super) const HIGHEST_ROUND_ENTERED: [u8; 1] = [4];
    pub(super) const LAST_VOTED_ROUND: [u8; 1] = [5];
    pub(super) const LOCKED_HEIGHT: [u8; 1] = [6];

    pub(super) const QC_SUFFIX: &[u8] = b"qc";
    pub(super) const EVIDENCE_SUFFIX: &[u8] = b"ev";
}

use paths::*;

/// Takes references to byteslices and returns a vector containing their concatenation.
fn combine(parts: &[&[u8]]) -> Vec<u8> {
    let mut res = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for part in parts {
        res.extend_from_slice(part);
    }
    res
}

fn get_decoded<T: BorshDeserialize>(kv: &impl KVGet, key: &[u8]) -> Option<T> {
    let bytes = kv.get(key)?;
    // Safety: values under our paths were written by `codec::encode`; failure to decode them
    // means the store is corrupted, which is the one fatal error class.
    Some(codec::decode(&bytes).expect("persisted chain state decodes"))
}

fn read_block(kv: &impl KVGet, id: &BlockId) -> Option<Block> {
    get_decoded(kv, &combine(&[&BLOCKS, id.as_ref()]))
}

fn read_block_qc(kv: &impl KVGet, id: &BlockId) -> Option<QuorumCert> {
    get_decoded(kv, &combine(&[&BLOCKS, id.as_ref(), QC_SUFFIX]))
}

fn read_evidence(kv: &impl KVGet, id: &BlockId) -> Option<Evidence> {
    get_decoded(kv, &combine(&[&BLOCKS, id.as_ref(), EVIDENCE_SUFFIX]))
}

fn read_block_at_height(kv: &impl KVGet, height: BlockHeight) -> Option<BlockId> {
    get_decoded(kv, &combine(&[&BLOCK_AT_HEIGHT, &height.to_be_bytes()]))
}

fn read_best_block_id(kv: &impl KVGet) -> Option<BlockId> {
    get_decoded(kv, &BEST_BLOCK)
}

fn read_best_qc(kv: &impl KVGet) -> Option<QuorumCert> {
    get_decoded(kv, &BEST_QC)
}

/// A read and write handle into the persisted chain, exclusively owned by the dispatch loop's
/// commit path.
pub struct ChainStore<K: KVStore>(K);

impl<K: KVStore> ChainStore<K> {
    pub fn new(kv_store: K) -> ChainStore<K> {
        ChainStore(kv_store)
    }

    /// Write the genesis block and its QC. Must be called exactly once, before the first
    /// [`ChainStore::new`]-holding replica starts.
    pub fn initialize(&mut self, genesis: &Block) {
        let genesis_id = genesis.id();
        let genesis_qc = QuorumCert::genesis(genesis_id);

        let mut wb = K::WriteBatch::new();
        wb.set(
            &combine(&[&BLOCKS, genesis_id.as_ref()]),
            &codec::encode_block(genesis),
        );
        wb.set(
            &combine(&[&BLOCKS, genesis_id.as_ref(), QC_SUFFIX]),
            &codec::encode(&genesis_qc),
        );
        wb.set(
            &combine(&[&BLOCK_AT_HEIGHT, &BlockHeight::new(0).to_be_bytes()]),
            &codec::encode(&genesis_id),
        );
        wb.set(&BEST_BLOCK, &codec::encode(&genesis_id));
        wb.set(&BEST_QC, &codec::encode(&genesis_qc));
        wb.set(&HIGHEST_ROUND_ENTERED, &codec::encode(&Round::init()));
        wb.set(&LAST_VOTED_ROUND, &codec::encode(&Round::init()));
        wb.set(&LOCKED_HEIGHT, &codec::encode(&BlockHeight::new(0)));
        self.0.write(wb);
    }

    /// Persist a finalized block, the QC that certifies it, and the evidence record assembled at
    /// finalization. Updates the canonical height index and the best pointers.
    ///
    /// # Precondition
    /// `block.number() == best_block().number() + 1` — commits are atomic and ordered by height
    /// with no gaps, which the pacemaker's commit walk guarantees.
    pub fn commit_block(&mut self, block: &Block, qc: &QuorumCert, evidence: &Evidence) {
        let id = block.id();
        let mut wb = K::WriteBatch::new();
        wb.set(
            &combine(&[&BLOCKS, id.as_ref()]),
            &codec::encode_block(block),
        );
        wb.set(
            &combine(&[&BLOCKS, id.as_ref(), QC_SUFFIX]),
            &codec::encode(qc),
        );
        wb.set(
            &combine(&[&BLOCKS, id.as_ref(), EVIDENCE_SUFFIX]),
            &codec::encode(evidence),
        );
        wb.set(
            &combine(&[&BLOCK_AT_HEIGHT, &block.number().to_be_bytes()]),
            &codec::encode(&id),
        );
        wb.set(&BEST_BLOCK, &codec::encode(&id));
        if self.best_qc().map_or(true, |best| qc.is_higher_than(&best)) {
            wb.set(&BEST_QC, &codec::encode(qc));
        }
        self.0.write(wb);
    }

    /// Persist the highest QC seen, so a restarted pacemaker resumes from it.
    pub fn set_best_qc(&mut self, qc: &QuorumCert) {
        let mut wb = K::WriteBatch::new();
        wb.set(&BEST_QC, &codec::encode(qc));
        self.0.write(wb);
    }

    pub fn set_highest_round_entered(&mut self, round: Round) {
        let mut wb = K::WriteBatch::new();
        wb.set(&HIGHEST_ROUND_ENTERED, &codec::encode(&round));
        self.0.write(wb);
    }

    pub fn set_last_voted_round(&mut self, round: Round) {
        let mut wb = K::WriteBatch::new();
        wb.set(&LAST_VOTED_ROUND, &codec::encode(&round));
        self.0.write(wb);
    }

    pub fn set_locked_height(&mut self, height: BlockHeight) {
        let mut wb = K::WriteBatch::new();
        wb.set(&LOCKED_HEIGHT, &codec::encode(&height));
        self.0.write(wb);
    }

    pub fn block(&self, id: &BlockId) -> Option<Block> {
        read_block(&self.0, id)
    }

    pub fn block_qc(&self, id: &BlockId) -> Option<QuorumCert> {
        read_block_qc(&self.0, id)
    }

    pub fn evidence(&self, id: &BlockId) -> Option<Evidence> {
        read_evidence(&self.0, id)
    }

    pub fn block_at_height(&self, height: BlockHeight) -> Option<BlockId> {
        read_block_at_height(&self.0, height)
    }

    pub fn best_block(&self) -> Option<Block> {
        read_block(&self.0, &read_best_block_id(&self.0)?)
    }

    pub fn best_qc(&self) -> Option<QuorumCert> {
        read_best_qc(&self.0)
    }

    pub fn highest_round_entered(&self) -> Round {
        get_decoded(&self.0, &HIGHEST_ROUND_ENTERED).unwrap_or(Round::init())
    }

    pub fn last_voted_round(&self) -> Round {
        get_decoded(&self.0, &LAST_VOTED_ROUND).unwrap_or(Round::init())
    }

    pub fn locked_height(&self) -> BlockHeight {
        get_decoded(&self.0, &LOCKED_HEIGHT).unwrap_or(BlockHeight::new(0))
    }

    /// Get a consistent read-only view for concurrent readers.
    pub fn view(&self) -> ChainView<K::Snapshot<'_>> {
        ChainView(self.0.snapshot())
    }
}

/// A cloneable handle from which read-only [`ChainView`]s can be taken at any time, e.g. by RPC
/// and probe endpoints. The only cross-module surface into consensus state.
#[derive(Clone)]
pub struct ChainViewCamera<K: KVStore>(K);

impl<K: KVStore> ChainViewCamera<K> {
    pub fn new(kv_store: K) -> ChainViewCamera<K> {
        ChainViewCamera(kv_store)
    }

    pub fn view(&self) -> ChainView<K::Snapshot<'_>> {
        ChainView(self.0.snapshot())
    }
}

/// A read-only view over the committed chain that is guaranteed to stay unchanged.
pub struct ChainView<S: KVGet>(S);

impl<S: KVGet> ChainView<S> {
    pub fn block(&self, id: &BlockId) -> Option<Block> {
        read_block(&self.0, id)
    }

    pub fn block_qc(&self, id: &BlockId) -> Option<QuorumCert> {
        read_block_qc(&self.0, id)
    }

    pub fn evidence(&self, id: &BlockId) -> Option<Evidence> {
        read_evidence(&self.0, id)
    }

    pub fn block_at_height(&self, height: BlockHeight) -> Option<BlockId> {
        read_block_at_height(&self.0, height)
    }

    pub fn best_block(&self) -> Option<Block> {
        read_block(&self.0, &read_best_block_id(&self.0)?)
    }

    pub fn best_qc(&self) -> Option<QuorumCert> {
        read_best_qc(&self.0)
    }

    /// Walk from `id` towards genesis, returning up to `max_hops` ancestors (nearest first).
    pub fn ancestors(&self, id: &BlockId, max_hops: usize) -> Vec<Block> {
        let mut res = Vec::new();
        let mut cursor = match self.block(id) {
            Some(block) => block,
            None => return res,
        };
        while res.len() < max_hops {
            let parent_id = cursor.header.parent_id;
            match self.block(&parent_id) {
                Some(parent) => {
                    cursor = parent.clone();
                    res.push(parent);
                }
                None => break,
            }
        }
        res
    }

    /// The committee info payload of the epoch established by the k-block at `kframe_height`:
    /// embedded in the first m-block after it.
    pub fn committee_info_after(&self, kframe_height: BlockHeight) -> Option<CommitteeInfos> {
        // Stop blocks may sit between the k-block and the first m-block of the next epoch.
        let mut height = kframe_height + 1;
        loop {
            let id = self.block_at_height(height)?;
            let block = self.block(&id)?;
            if block.committee_info.is_some() {
                return block.committee_info;
            }
            if !block.is_sblock() {
                return None;
            }
            height += 1;
        }
    }
}
