//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::arena::ArenaMap;
use crate::codegen::regalloc::{RAAssignment, RegsStats};
use crate::codegen::{NodeId, PerGroup};
use crate::dense_arena_key;
use crate::utility::BitVector;
use bitflags::bitflags;
use smallvec::SmallVec;
use std::cell::Cell;

dense_arena_key! {
    /// A reference to one basic block of the function being allocated.
    pub struct BlockId;
}

/// The `povOrder` value of a block that the post-order view has not
/// numbered (yet, or ever, for unreachable blocks).
pub(super) const UNNUMBERED: u32 = u32::MAX;

bitflags! {
    /// Lifecycle and shape bits of an [`RABlock`].
    pub struct BlockFlags: u32 {
        /// Block has been constructed from nodes.
        const CONSTRUCTED = 0x01;
        /// Block is reachable from the entry (set by the view builder).
        const REACHABLE = 0x02;
        /// Block has been processed by the local allocator.
        const ALLOCATED = 0x04;
        /// Block ends the function.
        const FUNC_EXIT = 0x08;
        /// Block ends in a jump, branch or return.
        const HAS_TERMINATOR = 0x10;
        /// Block naturally flows into the next one; its first successor is
        /// the textually following block.
        const HAS_CONSECUTIVE = 0x20;
        /// Block contains fixed (precolored) register constraints.
        const HAS_FIXED_REGS = 0x40;
        /// Block contains function calls.
        const HAS_FUNC_CALLS = 0x80;
    }
}

/// One basic block: a contiguous range of nodes, its position in the CFG,
/// and everything the analyses learn about it.
pub struct RABlock {
    flags: BlockFlags,
    first: Option<NodeId>,
    last: Option<NodeId>,
    first_position: u32,
    end_position: u32,
    weight: u32,
    pov_order: u32,
    regs_stats: RegsStats,
    max_live_count: PerGroup<u32>,
    visited: Cell<u64>,
    idom: Option<BlockId>,
    predecessors: SmallVec<[BlockId; 4]>,
    successors: SmallVec<[BlockId; 4]>,
    live_in: BitVector,
    live_out: BitVector,
    gen: BitVector,
    kill: BitVector,
    entry_assignment: Option<RAAssignment>,
}

impl RABlock {
    /// Creates an empty, unconstructed block.
    pub fn new() -> Self {
        Self {
            flags: BlockFlags::empty(),
            first: None,
            last: None,
            first_position: 0,
            end_position: 0,
            weight: 0,
            pov_order: UNNUMBERED,
            regs_stats: RegsStats::default(),
            max_live_count: PerGroup::default(),
            visited: Cell::new(0),
            idom: None,
            predecessors: SmallVec::new(),
            successors: SmallVec::new(),
            live_in: BitVector::new(),
            live_out: BitVector::new(),
            gen: BitVector::new(),
            kill: BitVector::new(),
            entry_assignment: None,
        }
    }

    /// The lifecycle/shape bits.
    #[inline]
    pub fn flags(&self) -> BlockFlags {
        self.flags
    }

    /// Checks a single flag.
    #[inline]
    pub fn has_flag(&self, flag: BlockFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Adds flags.
    #[inline]
    pub fn add_flags(&mut self, flags: BlockFlags) {
        self.flags |= flags;
    }

    /// Marks the block as constructed and folds in the statistics gathered
    /// while building its instructions.
    pub fn make_constructed(&mut self, stats: RegsStats) {
        self.flags |= BlockFlags::CONSTRUCTED;
        self.regs_stats.combine_with(stats);
    }

    /// The per-group register statistics of the block.
    #[inline]
    pub fn regs_stats(&self) -> RegsStats {
        self.regs_stats
    }

    /// The first node of the block (inclusive), usually its label.
    #[inline]
    pub fn first(&self) -> Option<NodeId> {
        self.first
    }

    /// The last node of the block (inclusive), usually its terminator.
    #[inline]
    pub fn last(&self) -> Option<NodeId> {
        self.last
    }

    /// Sets the first node.
    #[inline]
    pub fn set_first(&mut self, node: NodeId) {
        self.first = Some(node);
    }

    /// Sets the last node.
    #[inline]
    pub fn set_last(&mut self, node: NodeId) {
        self.last = Some(node);
    }

    /// Clears the node range, used when an unreachable block is removed.
    pub fn clear_node_range(&mut self) {
        self.first = None;
        self.last = None;
    }

    /// First instruction position of the block (inclusive).
    #[inline]
    pub fn first_position(&self) -> u32 {
        self.first_position
    }

    /// End instruction position of the block (exclusive).
    #[inline]
    pub fn end_position(&self) -> u32 {
        self.end_position
    }

    /// Sets the position range of the block.
    pub fn set_position_range(&mut self, first: u32, end: u32) {
        self.first_position = first;
        self.end_position = end;
    }

    /// The loop nesting weight: zero for straight-line code, incremented
    /// once per enclosing loop.
    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Bumps the loop nesting weight.
    #[inline]
    pub fn bump_weight(&mut self) {
        self.weight += 1;
    }

    /// The post-order number of the block, if the view builder numbered it.
    #[inline]
    pub fn pov_order(&self) -> Option<u32> {
        (self.pov_order != UNNUMBERED).then_some(self.pov_order)
    }

    /// Numbers the block in the post-order view.
    #[inline]
    pub fn set_pov_order(&mut self, order: u32) {
        self.pov_order = order;
    }

    /// The largest number of simultaneously live work registers per group
    /// anywhere in the block.
    #[inline]
    pub fn max_live_count(&self) -> PerGroup<u32> {
        self.max_live_count
    }

    /// Folds a live-count observation into the per-group maximum.
    pub fn observe_live_count(&mut self, counts: PerGroup<u32>) {
        for (group, &count) in counts.iter() {
            let max = &mut self.max_live_count[group];
            *max = (*max).max(count);
        }
    }

    /// The transient visit mark used by graph walks.
    #[inline]
    pub fn visited(&self) -> u64 {
        self.visited.get()
    }

    /// Stamps the transient visit mark.
    #[inline]
    pub fn mark_visited(&self, timestamp: u64) {
        self.visited.set(timestamp);
    }

    /// The immediate dominator, if computed. The entry block is its own
    /// immediate dominator.
    #[inline]
    pub fn idom(&self) -> Option<BlockId> {
        self.idom
    }

    /// Records the immediate dominator.
    #[inline]
    pub fn set_idom(&mut self, idom: BlockId) {
        self.idom = Some(idom);
    }

    /// The blocks that can transfer control here.
    #[inline]
    pub fn predecessors(&self) -> &[BlockId] {
        &self.predecessors
    }

    /// The blocks control can transfer to from here. If the block
    /// [`BlockFlags::HAS_CONSECUTIVE`], the first successor is the
    /// fall-through.
    #[inline]
    pub fn successors(&self) -> &[BlockId] {
        &self.successors
    }

    /// The fall-through successor, if the block has one.
    #[inline]
    pub fn consecutive(&self) -> Option<BlockId> {
        self.has_flag(BlockFlags::HAS_CONSECUTIVE)
            .then(|| self.successors[0])
    }

    /// The block's live-in set, one bit per work register.
    #[inline]
    pub fn live_in(&self) -> &BitVector {
        &self.live_in
    }

    /// The block's live-out set.
    #[inline]
    pub fn live_out(&self) -> &BitVector {
        &self.live_out
    }

    /// The block's upward-exposed-use set.
    #[inline]
    pub fn gen(&self) -> &BitVector {
        &self.gen
    }

    /// The block's kill (definition) set.
    #[inline]
    pub fn kill(&self) -> &BitVector {
        &self.kill
    }

    /// Mutable access to all four liveness sets at once, in
    /// `(in, out, gen, kill)` order.
    #[inline]
    pub fn live_sets_mut(&mut self) -> (&mut BitVector, &mut BitVector, &mut BitVector, &mut BitVector) {
        (
            &mut self.live_in,
            &mut self.live_out,
            &mut self.gen,
            &mut self.kill,
        )
    }

    /// Resizes all four liveness sets to `bits` width. This is the only
    /// write path for their capacity.
    pub fn resize_live_sets(&mut self, bits: usize) {
        self.live_in.resize(bits);
        self.live_out.resize(bits);
        self.gen.resize(bits);
        self.kill.resize(bits);
    }

    /// The register assignment that must hold when control enters this
    /// block, once some predecessor (or the argument seeding) decided it.
    #[inline]
    pub fn entry_assignment(&self) -> Option<&RAAssignment> {
        self.entry_assignment.as_ref()
    }

    /// Pins the entry assignment. May only happen once.
    pub fn set_entry_assignment(&mut self, assignment: RAAssignment) {
        debug_assert!(self.entry_assignment.is_none(), "entry assignment set twice");

        self.entry_assignment = Some(assignment);
    }
}

impl Default for RABlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Connects `from -> to` in the CFG, updating both adjacency lists.
///
/// This is the only way edges are created; the `p in s.predecessors ⇔
/// s in p.successors` invariant holds because nothing else touches the
/// lists. `prepend` puts the successor first, which is how the natural
/// fall-through is kept at index 0.
pub(super) fn link_blocks(
    blocks: &mut ArenaMap<BlockId, RABlock>,
    from: BlockId,
    to: BlockId,
    prepend: bool,
) {
    if blocks[from].successors.contains(&to) {
        return;
    }

    if prepend {
        blocks[from].successors.insert(0, to);
        blocks[to].predecessors.insert(0, from);
    } else {
        blocks[from].successors.push(to);
        blocks[to].predecessors.push(from);
    }
}

/// Disconnects `from -> to`, updating both adjacency lists.
pub(super) fn unlink_blocks(blocks: &mut ArenaMap<BlockId, RABlock>, from: BlockId, to: BlockId) {
    blocks[from].successors.retain(|b| *b != to);
    blocks[to].predecessors.retain(|b| *b != from);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linking_updates_both_sides() {
        let mut blocks = ArenaMap::new();
        let a = blocks.insert(RABlock::new());
        let b = blocks.insert(RABlock::new());
        let c = blocks.insert(RABlock::new());

        link_blocks(&mut blocks, a, b, false);
        link_blocks(&mut blocks, a, c, true);

        // prepended successor comes first
        assert_eq!(blocks[a].successors(), &[c, b]);
        assert_eq!(blocks[b].predecessors(), &[a]);
        assert_eq!(blocks[c].predecessors(), &[a]);

        // linking twice is a no-op
        link_blocks(&mut blocks, a, b, false);
        assert_eq!(blocks[a].successors(), &[c, b]);

        unlink_blocks(&mut blocks, a, b);
        assert_eq!(blocks[a].successors(), &[c]);
        assert!(blocks[b].predecessors().is_empty());
    }

    #[test]
    fn self_loop_edges() {
        let mut blocks = ArenaMap::new();
        let a = blocks.insert(RABlock::new());

        link_blocks(&mut blocks, a, a, false);

        assert_eq!(blocks[a].successors(), &[a]);
        assert_eq!(blocks[a].predecessors(), &[a]);
    }
}
