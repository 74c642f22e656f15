//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::codegen::regalloc::block::{link_blocks, unlink_blocks};
use crate::codegen::regalloc::inst::RAInstBuilder;
use crate::codegen::regalloc::workreg::WorkRegFlags;
use crate::codegen::regalloc::{BlockFlags, BlockId, RABlock, RAInstFlags, RAPass, TiedFlags};
use crate::codegen::{
    Error, Function, Inst, InstControl, LabelId, NodeId, NodeKind, RAResult, RegGroup, RegMask,
    RegRef,
};
use log::{debug, trace};

impl RAPass {
    /// Walks the node stream once and builds the control-flow graph:
    /// blocks, edges, per-instruction tied-register records and positions.
    pub(super) fn build_cfg(&mut self, func: &Function) -> RAResult<()> {
        let mut ib = RAInstBuilder::new();

        // the open block receiving nodes, if any
        let mut current: Option<BlockId> = None;
        // where the open block started, position-wise
        let mut current_start = 0u32;
        // whether the open block has seen any instruction yet
        let mut current_has_inst = false;
        // a decorative run that precedes the next block's first real node
        let mut pending_first: Option<NodeId> = None;
        // a block that ended in a conditional branch and waits for its
        // fall-through successor to exist
        let mut pending_fallthrough: Option<BlockId> = None;

        for (id, node) in func.iter() {
            match node.kind() {
                NodeKind::Align(_) | NodeKind::Comment(_) => {
                    if current.is_none() && pending_first.is_none() {
                        pending_first = Some(id);
                    }
                }
                NodeKind::Label(label) => {
                    let existing = self.block_of_label.get(*label).copied();

                    match current {
                        // a label at the head of the open block (or right
                        // behind other labels) when no other block claims
                        // it: it names the open block too
                        Some(block) if !current_has_inst && existing.is_none() => {
                            self.block_of_label.insert(*label, block);
                        }
                        // fall-through into the labeled block
                        Some(block) => {
                            let next = self.block_for_label(*label);

                            self.blocks[block]
                                .add_flags(BlockFlags::HAS_CONSECUTIVE);
                            link_blocks(&mut self.blocks, block, next, true);
                            self.close_block(block, current_start);

                            self.open_block(next, pending_first.take().unwrap_or(id));
                            current = Some(next);
                            current_start = self.inst_count * 2;
                            current_has_inst = false;
                        }
                        // a label opening a block after a terminator
                        None => {
                            let next = self.block_for_label(*label);

                            self.open_block(next, pending_first.take().unwrap_or(id));

                            if let Some(from) = pending_fallthrough.take() {
                                self.blocks[from].add_flags(BlockFlags::HAS_CONSECUTIVE);
                                link_blocks(&mut self.blocks, from, next, true);
                            }

                            current = Some(next);
                            current_start = self.inst_count * 2;
                            current_has_inst = false;
                        }
                    }
                }
                NodeKind::Inst(inst) => {
                    let block = match current {
                        Some(block) => block,
                        None => {
                            // an instruction with no label after a
                            // terminator opens an anonymous block; it is
                            // unreachable unless a fall-through feeds it
                            let block = self.blocks.insert(RABlock::new());

                            self.open_block(block, pending_first.take().unwrap_or(id));

                            if let Some(from) = pending_fallthrough.take() {
                                self.blocks[from].add_flags(BlockFlags::HAS_CONSECUTIVE);
                                link_blocks(&mut self.blocks, from, block, true);
                            }

                            current = Some(block);
                            current_start = self.inst_count * 2;
                            current_has_inst = false;
                            block
                        }
                    };

                    let position = self.inst_count * 2;

                    self.inst_count += 1;
                    current_has_inst = true;

                    self.build_ra_inst(func, &mut ib, block, id, inst, position)?;

                    match inst.control {
                        InstControl::None => {}
                        InstControl::Jump(target) => {
                            let succ = self.block_for_label(target);

                            // a jump to the very next label acts like a
                            // fall-through, keep the successor first so the
                            // encoder may elide the jump
                            let next_to = func
                                .label_node(target)
                                .map(|n| self.is_next_to(func, id, n))
                                .unwrap_or(false);

                            if next_to {
                                self.blocks[block].add_flags(BlockFlags::HAS_CONSECUTIVE);
                            }

                            link_blocks(&mut self.blocks, block, succ, next_to);
                            self.blocks[block].add_flags(BlockFlags::HAS_TERMINATOR);
                            self.close_block(block, current_start);
                            self.set_last(block, id);
                            current = None;
                        }
                        InstControl::Branch(target) => {
                            let succ = self.block_for_label(target);

                            link_blocks(&mut self.blocks, block, succ, false);
                            self.blocks[block].add_flags(BlockFlags::HAS_TERMINATOR);
                            self.close_block(block, current_start);
                            self.set_last(block, id);
                            pending_fallthrough = Some(block);
                            current = None;
                        }
                        InstControl::Ret => {
                            self.blocks[block]
                                .add_flags(BlockFlags::HAS_TERMINATOR | BlockFlags::FUNC_EXIT);
                            self.exits.push(block);
                            self.close_block(block, current_start);
                            self.set_last(block, id);
                            current = None;
                        }
                    }
                }
            }

            // non-terminator nodes extend the open block
            if let Some(block) = current {
                self.set_last(block, id);
            }
        }

        if pending_fallthrough.is_some() {
            // a conditional branch fell off the end of the stream
            return Err(Error::InvalidState);
        }

        if let Some(block) = current {
            // the stream ended without a terminator; the block exits the
            // function by falling off its end
            self.blocks[block].add_flags(BlockFlags::FUNC_EXIT);
            self.exits.push(block);
            self.close_block(block, current_start);
        }

        if self.blocks.is_empty() {
            return Err(Error::InvalidState);
        }

        // a block created for a label that never appeared in the stream is
        // dangling, the CFG is incomplete
        for (id, block) in self.blocks.iter() {
            if !block.has_flag(BlockFlags::CONSTRUCTED) {
                debug!("block {id:?} was referenced but never constructed");

                return Err(Error::InvalidState);
            }
        }

        debug!(
            "CFG: {} blocks, {} instructions, {} work regs",
            self.blocks.len(),
            self.inst_count,
            self.work_regs.len()
        );

        Ok(())
    }

    /// Builds the tied-register record for one instruction and attaches it
    /// to the node.
    fn build_ra_inst(
        &mut self,
        func: &Function,
        ib: &mut RAInstBuilder,
        block: BlockId,
        node: NodeId,
        inst: &Inst,
        position: u32,
    ) -> RAResult<()> {
        let mut has_fixed = false;

        for (slot, op) in inst.operands.iter().enumerate() {
            match op.reg {
                RegRef::Phys(phys) => {
                    // precolored operand: nothing to allocate, but the
                    // register is pinned at this instruction
                    ib.pin_phys(phys.group(), phys.id());
                    has_fixed = true;
                }
                RegRef::Virt(virt) => {
                    let work = self.as_work_reg(func, virt)?;
                    let group = self.work_regs[work].group();

                    let mut flags = TiedFlags::empty();

                    if op.kind.is_use() {
                        flags |= TiedFlags::USE;
                    }

                    if op.kind.is_def() {
                        flags |= TiedFlags::OUT;
                    }

                    let allocable = match op.fixed {
                        Some(id) => RegMask::single(id),
                        None => self.available[group],
                    };

                    let use_id = op.fixed.filter(|_| op.kind.is_use());
                    let out_id = op.fixed.filter(|_| op.kind.is_def());
                    let use_mask = if op.kind.is_use() { 1 << slot } else { 0 };
                    let out_mask = if op.kind.is_def() { 1 << slot } else { 0 };

                    ib.add(work, group, flags, allocable, use_id, use_mask, out_id, out_mask)?;

                    self.work_regs[work].restrict_allocable(allocable);

                    if op.kind.is_use() {
                        self.work_regs[work].push_ref(position);
                    }

                    if op.fixed.is_some() {
                        self.work_regs[work].add_flags(WorkRegFlags::FIXED);
                        has_fixed = true;
                    }
                }
            }
        }

        if inst.is_call {
            for group in RegGroup::ALL {
                ib.add_clobbers(group, inst.clobbers[group]);
            }

            self.blocks[block].add_flags(BlockFlags::HAS_FUNC_CALLS);
        }

        if inst.control.is_terminator() {
            ib.add_flags(RAInstFlags::IS_TERMINATOR);
        }

        if has_fixed {
            self.blocks[block].add_flags(BlockFlags::HAS_FIXED_REGS);
        }

        let stats = ib.stats();
        let ra_inst = ib.publish(block, position);
        let id = self.insts.insert(ra_inst);

        self.node_data.insert(node, id);
        self.blocks[block].make_constructed(stats);

        trace!("inst at position {position} in {block:?}: {}", inst.op);

        Ok(())
    }

    /// The block a label starts, created on first reference.
    fn block_for_label(&mut self, label: LabelId) -> BlockId {
        if let Some(&block) = self.block_of_label.get(label) {
            return block;
        }

        let block = self.blocks.insert(RABlock::new());

        self.block_of_label.insert(label, block);
        block
    }

    fn open_block(&mut self, block: BlockId, first: NodeId) {
        let start = self.inst_count * 2;
        let b = &mut self.blocks[block];

        b.add_flags(BlockFlags::CONSTRUCTED);
        b.set_first(first);
        b.set_position_range(start, start);
    }

    fn close_block(&mut self, block: BlockId, start: u32) {
        self.blocks[block].set_position_range(start, self.inst_count * 2);
    }

    fn set_last(&mut self, block: BlockId, node: NodeId) {
        self.blocks[block].set_last(node);
    }

    /// Returns `node` or the first node after it that can begin a block,
    /// skipping decorative nodes.
    pub fn find_successor_starting_at(&self, func: &Function, node: NodeId) -> Option<NodeId> {
        let mut cursor = Some(node);

        while let Some(id) = cursor {
            let n = func.node(id);

            if !n.kind().is_decorative() {
                return Some(id);
            }

            cursor = n.next();
        }

        None
    }

    /// Checks whether control can flow from `node` to `target` without
    /// crossing any executable or data node. Used to treat jumps to the
    /// immediately following label as fall-throughs.
    pub fn is_next_to(&self, func: &Function, node: NodeId, target: NodeId) -> bool {
        let mut cursor = func.node(node).next();

        while let Some(id) = cursor {
            if id == target {
                return true;
            }

            let n = func.node(id);

            // labels between `node` and `target` are fine, anything
            // executable or data is not
            match n.kind() {
                NodeKind::Label(_) => {}
                kind if kind.is_decorative() => {}
                _ => return false,
            }

            cursor = n.next();
        }

        false
    }

    /// Detaches every block the view builder found unreachable: edges are
    /// removed from both sides, the node range is unlinked from the stream
    /// and its pass data dropped.
    pub(super) fn remove_unreachable_code(&mut self, func: &mut Function) -> RAResult<()> {
        let ids: Vec<BlockId> = self.blocks.keys().collect();
        let mut removed = 0usize;

        for id in ids {
            if self.blocks[id].has_flag(BlockFlags::REACHABLE) {
                continue;
            }

            let successors: Vec<BlockId> = self.blocks[id].successors().to_vec();
            let predecessors: Vec<BlockId> = self.blocks[id].predecessors().to_vec();

            for succ in successors {
                unlink_blocks(&mut self.blocks, id, succ);
            }

            for pred in predecessors {
                unlink_blocks(&mut self.blocks, pred, id);
            }

            if let (Some(first), Some(last)) = (self.blocks[id].first(), self.blocks[id].last()) {
                let mut cursor = Some(first);

                while let Some(node) = cursor {
                    self.node_data.remove(node);
                    cursor = if node == last {
                        None
                    } else {
                        func.node(node).next()
                    };
                }

                func.unlink_range(first, last);
            }

            self.blocks[id].clear_node_range();
            removed += 1;
        }

        if removed != 0 {
            self.exits
                .retain(|&b| self.blocks[b].has_flag(BlockFlags::REACHABLE));

            debug!("removed {removed} unreachable blocks");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::testing::{branch_on, gp, ret, test_target, three, two};

    fn diamond() -> Function {
        let mut f = Function::new("diamond");
        let v0 = gp(&mut f);
        let vc = gp(&mut f);
        let t = gp(&mut f);
        let u = gp(&mut f);

        f.set_args([(v0, 0), (vc, 1)]);

        let l_then = f.new_label();
        let l_join = f.new_label();

        branch_on(&mut f, vc, l_then);
        two(&mut f, "neg", t, v0);
        f.append_inst(Inst::jump("jmp", l_join));
        f.append_label(l_then);
        two(&mut f, "not", u, v0);
        f.append_label(l_join);
        ret(&mut f, v0);

        f
    }

    #[test]
    fn straight_line_is_one_block() {
        let mut f = Function::new("straight");
        let a = gp(&mut f);
        let b = gp(&mut f);
        let c = gp(&mut f);

        f.set_args([(a, 0), (b, 1)]);
        three(&mut f, "add", c, a, b);
        ret(&mut f, c);

        let mut pass = RAPass::new(test_target());

        pass.build_cfg(&f).unwrap();

        assert_eq!(pass.block_count(), 1);
        assert_eq!(pass.exit_blocks().len(), 1);
        assert_eq!(pass.work_reg_count(), 3);

        let entry = pass.entry_block();

        assert!(pass.block(entry).has_flag(BlockFlags::FUNC_EXIT));
        assert_eq!(pass.block(entry).first_position(), 0);
        assert_eq!(pass.block(entry).end_position(), 4);
    }

    #[test]
    fn diamond_edges_are_symmetric() {
        let f = diamond();
        let mut pass = RAPass::new(test_target());

        pass.build_cfg(&f).unwrap();

        assert_eq!(pass.block_count(), 4);

        let entry = pass.entry_block();
        let succs = pass.block(entry).successors().to_vec();

        assert_eq!(succs.len(), 2);
        assert!(pass.block(entry).has_flag(BlockFlags::HAS_CONSECUTIVE));

        // the fall-through arm is the first successor
        assert_eq!(pass.block(entry).consecutive(), Some(succs[0]));

        for &succ in succs.iter() {
            assert!(pass.block(succ).predecessors().contains(&entry));

            for &join in pass.block(succ).successors() {
                assert!(pass.block(join).predecessors().contains(&succ));
            }
        }
    }

    #[test]
    fn jump_to_next_label_is_consecutive() {
        let mut f = Function::new("elide");
        let v = gp(&mut f);
        let l = f.new_label();

        f.set_args([(v, 0)]);
        f.append_inst(Inst::jump("jmp", l));
        f.append_label(l);
        ret(&mut f, v);

        let mut pass = RAPass::new(test_target());

        pass.build_cfg(&f).unwrap();

        let entry = pass.entry_block();

        assert!(pass.block(entry).has_flag(BlockFlags::HAS_CONSECUTIVE));
        assert_eq!(pass.block(entry).successors().len(), 1);
    }

    #[test]
    fn unreachable_blocks_are_removed() {
        let mut f = Function::new("dead");
        let v = gp(&mut f);
        let d = gp(&mut f);

        f.set_args([(v, 0)]);
        ret(&mut f, v);
        two(&mut f, "neg", d, v);
        ret(&mut f, d);

        let mut pass = RAPass::new(test_target());

        pass.build_cfg(&f).unwrap();
        assert_eq!(pass.block_count(), 2);

        pass.build_views().unwrap();
        pass.remove_unreachable_code(&mut f).unwrap();

        assert_eq!(pass.reachable_block_count(), 1);
        assert_eq!(pass.exit_blocks().len(), 1);

        // the dead instructions are gone from the stream
        let insts = f
            .iter()
            .filter(|(_, n)| matches!(n.kind(), NodeKind::Inst(_)))
            .count();

        assert_eq!(insts, 1);
    }

    #[test]
    fn jump_to_unplaced_label_is_invalid() {
        let mut f = Function::new("dangling");
        let v = gp(&mut f);
        let nowhere = f.new_label();

        f.set_args([(v, 0)]);
        f.append_inst(Inst::jump("jmp", nowhere));

        let mut pass = RAPass::new(test_target());

        assert_eq!(pass.build_cfg(&f), Err(Error::InvalidState));
    }

    #[test]
    fn decorative_nodes_do_not_split_blocks() {
        let mut f = Function::new("decor");
        let v = gp(&mut f);

        f.set_args([(v, 0)]);
        f.append(NodeKind::Comment("hello".into()));
        f.append(NodeKind::Align(16));
        ret(&mut f, v);

        let mut pass = RAPass::new(test_target());

        pass.build_cfg(&f).unwrap();

        assert_eq!(pass.block_count(), 1);
    }
}
