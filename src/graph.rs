/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! In-memory tree of unfinalized proposals.
//!
//! The graph is an arena: it owns every [`ProposalNode`], and nodes refer to each other by `u32`
//! arena indices rather than owning pointers. The pacemaker addresses nodes by `(height, round)`
//! and never holds references into the arena across mutations. Nodes at or below the finalized
//! height are pruned after every commit.

use std::collections::BTreeMap;

use crate::types::basic::{BlockHeight, BlockId, Round};
use crate::types::block::{Block, BlockType};
use crate::types::certificates::QuorumCert;

/// Index of a node in the [`ProposalGraph`] arena.
pub type NodeId = u32;

/// Opaque handle to the execution stage a proposal was executed against. Handed out by the
/// executor, redeemed on commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageHandle(pub u64);

/// In-memory vertex of the proposal tree.
pub struct ProposalNode {
    pub height: BlockHeight,
    pub round: Round,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub block: Block,
    pub block_bytes: Vec<u8>,
    pub parent_qc: QuorumCert,
    pub block_type: BlockType,
    /// Whether execution succeeded for this node. A node that failed execution is kept for
    /// possible re-execution but is never voted on.
    pub processed: bool,
    pub stage: Option<StageHandle>,
    /// Whether this node was proposed by the local node, in which case execution is skipped on
    /// receipt: the block was built against local state in the first place.
    pub mine: bool,
}

impl ProposalNode {
    pub fn id(&self) -> BlockId {
        self.block.id()
    }
}

/// Arena-owned tree of unfinalized proposal nodes indexed by height, rooted at the most recently
/// finalized block.
#[derive(Default)]
pub struct ProposalGraph {
    arena: Vec<Option<ProposalNode>>,
    by_height: BTreeMap<BlockHeight, NodeId>,
}

impl ProposalGraph {
    pub fn new() -> ProposalGraph {
        ProposalGraph::default()
    }

    /// Insert a node, linking it to its parent by height lookup. Returns the new node's arena
    /// index.
    ///
    /// At most one proposal is retained per height; the pacemaker rejects (and records) competing
    /// proposals before insertion.
    pub fn insert(&mut self, mut node: ProposalNode) -> NodeId {
        let parent = self
            .by_height
            .get(&(node.height - 1))
            .copied()
            .filter(|id| self.get(*id).is_some());
        node.parent = parent;

        let node_id = self.arena.len() as NodeId;
        self.arena.push(Some(node));
        if let Some(parent_id) = parent {
            // Safety: `parent` was filtered against live nodes above.
            self.arena[parent_id as usize]
                .as_mut()
                .unwrap()
                .children
                .push(node_id);
        }
        self.by_height.insert(self.node(node_id).height, node_id);
        node_id
    }

    pub fn get(&self, id: NodeId) -> Option<&ProposalNode> {
        self.arena.get(id as usize).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut ProposalNode> {
        self.arena
            .get_mut(id as usize)
            .and_then(|slot| slot.as_mut())
    }

    fn node(&self, id: NodeId) -> &ProposalNode {
        // Safety: internal callers only pass live indices.
        self.get(id).unwrap()
    }

    /// Address the node proposed at `(height, round)`, if the graph holds one.
    pub fn address(&self, height: BlockHeight, round: Round) -> Option<NodeId> {
        let id = *self.by_height.get(&height)?;
        let node = self.get(id)?;
        (node.round == round).then_some(id)
    }

    /// The node at `height`, regardless of round.
    pub fn at_height(&self, height: BlockHeight) -> Option<NodeId> {
        let id = *self.by_height.get(&height)?;
        self.get(id).map(|_| id)
    }

    /// The node whose block has the given ID.
    pub fn by_block_id(&self, block_id: &BlockId) -> Option<NodeId> {
        let id = self.at_height(block_id.height())?;
        (self.node(id).id() == *block_id).then_some(id)
    }

    /// Whether the node `descendant` extends the block at `ancestor` within `max_hops` parent
    /// links.
    pub fn extends(&self, descendant: NodeId, ancestor: &BlockId, max_hops: usize) -> bool {
        let mut cursor = Some(descendant);
        for _ in 0..max_hops {
            let node = match cursor.and_then(|id| self.get(id)) {
                Some(node) => node,
                None => return false,
            };
            if node.id() == *ancestor {
                return true;
            }
            // The graph is rooted at the finalized block; walking off the root means the ancestor
            // is already committed, so any path through the root extends it.
            if node.parent.is_none() {
                return node.block.header.parent_id == *ancestor;
            }
            cursor = node.parent;
        }
        false
    }

    /// Collect the chain of nodes from (and excluding) `from_height` up to and including `to`,
    /// ordered by ascending height. Returns `None` if a parent link is missing.
    pub fn chain_between(&self, from_height: BlockHeight, to: NodeId) -> Option<Vec<NodeId>> {
        let mut chain = Vec::new();
        let mut cursor = Some(to);
        while let Some(id) = cursor {
            let node = self.get(id)?;
            if node.height <= from_height {
                break;
            }
            chain.push(id);
            cursor = node.parent;
            if cursor.is_none() && node.height > from_height + 1 {
                return None;
            }
        }
        chain.reverse();
        Some(chain)
    }

    /// Drop every node with height ≤ `height`. Called after finalization; the subtree above the
    /// finalized block stays live.
    pub fn prune_below(&mut self, height: BlockHeight) {
        let doomed: Vec<NodeId> = self
            .by_height
            .range(..=height)
            .map(|(_, id)| *id)
            .collect();
        for id in doomed {
            if let Some(node) = self.arena[id as usize].take() {
                self.by_height.remove(&node.height);
                for child_id in node.children {
                    if let Some(child) = self.arena.get_mut(child_id as usize).and_then(|s| s.as_mut()) {
                        child.parent = None;
                    }
                }
            }
        }
    }

    /// The number of live nodes.
    pub fn len(&self) -> usize {
        self.arena.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
