/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The executor seam: how the consensus core talks to the transaction pool and the EVM-like
//! execution layer it is embedded next to.
//!
//! Execution must precede voting, so [`Executor::execute`] is a foreground call on the dispatch
//! loop. The returned [`StageHandle`] is opaque to consensus; it is redeemed at commit time so the
//! execution layer can promote the staged state without re-running the block.

use crate::graph::StageHandle;
use crate::types::basic::{BlockHeight, Bytes32, EpochId, Round};
use crate::types::block::{Block, KeyframeData};

/// Asks the execution layer to assemble the content of a block the pacemaker is about to propose.
pub struct ProduceBlockRequest<'a> {
    pub parent: &'a Block,
    pub height: BlockHeight,
    pub round: Round,
    pub epoch: EpochId,
    /// True when committee wind-down forces a stop block; the response's transactions are ignored
    /// and the keyframe must be `None`.
    pub stop: bool,
}

/// The assembled block content. If `keyframe` is set, the proof-of-work source found an anchor
/// and the proposed block becomes a k-block.
pub struct ProduceBlockResponse {
    pub txs: Vec<Vec<u8>>,
    pub txs_root: Bytes32,
    pub state_root: Bytes32,
    pub receipts_root: Bytes32,
    pub gas_used: u64,
    pub keyframe: Option<KeyframeData>,
    pub stage: StageHandle,
}

/// Asks the execution layer to execute a received proposal against its parent's staged state.
pub struct ExecuteBlockRequest<'a> {
    pub block: &'a Block,
    pub parent: &'a Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteError {
    /// The block does not apply cleanly. The proposal node is kept for possible re-execution, but
    /// is not voted on.
    InvalidBlock,
}

/// Implemented by the execution layer. All three methods are called from the dispatch thread.
pub trait Executor: Send + 'static {
    fn produce(&mut self, request: ProduceBlockRequest) -> ProduceBlockResponse;

    fn execute(&mut self, request: ExecuteBlockRequest) -> Result<StageHandle, ExecuteError>;

    /// Promote the staged state of a finalized block. `stage` is `None` when the node never
    /// executed the block itself, e.g. after a restart; the executor then re-derives it.
    fn commit(&mut self, block: &Block, stage: Option<StageHandle>);
}
