//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::arena::{ArenaKey, ArenaMap, SecondaryMap};
use crate::codegen::regalloc::block::{link_blocks, unlink_blocks};
use crate::codegen::regalloc::{
    AssignLayout, BlockFlags, BlockId, RAAssignment, RABlock, RAInst, RAInstId, RAPass, SlotId,
    StackAllocator, TiedReg, WorkId, WorkReg,
};
use crate::codegen::{
    EmitContext, Error, Function, InsertPoint, InstControl, LabelId, NodeId, NodeKind, PerGroup,
    RAEmitter, RAResult, RAStrategy, RegGroup, RegMask, TargetDesc, VirtId,
};
use crate::utility::BitVector;
use log::trace;
use smallvec::SmallVec;

impl RAPass {
    /// Runs the local allocator: walks the reachable blocks in reverse
    /// post-order carrying a concrete assignment, satisfies every tied
    /// register, and reconciles assignments across block edges.
    pub(super) fn run_local_allocator<E: RAEmitter>(
        &mut self,
        func: &mut Function,
        emitter: &mut E,
    ) -> RAResult<()> {
        let layout = AssignLayout::new(self.target.phys_count, self.work_regs.len() as u32);

        let mut local = RALocalAllocator {
            func,
            emitter,
            target: &self.target,
            blocks: &mut self.blocks,
            insts: &mut self.insts,
            node_data: &self.node_data,
            work_regs: &mut self.work_regs,
            work_of_virt: &self.work_of_virt,
            stack: &mut self.stack,
            pov: &self.pov,
            strategy: &self.strategy,
            available: &self.available,
            clobbered: &mut self.clobbered,
            block_of_label: &mut self.block_of_label,
            cur: RAAssignment::new(layout),
            layout,
        };

        local.run()
    }
}

/// The state the local allocator carries while walking one function.
struct RALocalAllocator<'a, E: RAEmitter> {
    func: &'a mut Function,
    emitter: &'a mut E,
    target: &'a TargetDesc,
    blocks: &'a mut ArenaMap<BlockId, RABlock>,
    insts: &'a mut ArenaMap<RAInstId, RAInst>,
    node_data: &'a SecondaryMap<NodeId, RAInstId>,
    work_regs: &'a mut ArenaMap<WorkId, WorkReg>,
    work_of_virt: &'a SecondaryMap<VirtId, WorkId>,
    stack: &'a mut StackAllocator,
    pov: &'a [BlockId],
    strategy: &'a PerGroup<RAStrategy>,
    available: &'a PerGroup<RegMask>,
    clobbered: &'a mut PerGroup<RegMask>,
    block_of_label: &'a mut SecondaryMap<LabelId, BlockId>,
    /// The concrete assignment at the point currently being allocated.
    cur: RAAssignment,
    layout: AssignLayout,
}

impl<'a, E: RAEmitter> RALocalAllocator<'a, E> {
    fn run(&mut self) -> RAResult<()> {
        for index in (0..self.pov.len()).rev() {
            let block = self.pov[index];

            self.enter_block(block)?;

            let insts = self.collect_insts(block);

            for (node, ri) in insts {
                self.alloc_inst(node, ri)?;
            }

            self.blocks[block].add_flags(BlockFlags::ALLOCATED);
            self.leave_block(block)?;
        }

        Ok(())
    }

    /// Establishes `cur` for a block: the argument mapping for the entry
    /// block, the pinned entry assignment when a predecessor already chose
    /// one, an empty assignment otherwise. Pins the block's own entry
    /// assignment if nobody did yet.
    fn enter_block(&mut self, block: BlockId) -> RAResult<()> {
        let is_entry = Some(&block) == self.pov.last();

        if is_entry {
            self.cur = RAAssignment::new(self.layout);

            let args: SmallVec<[(VirtId, u8); 8]> = SmallVec::from_slice(self.func.args());

            for (virt, id) in args {
                // arguments the function never uses have no work register
                // and need no seeding
                let work = match self.work_of_virt.get(virt) {
                    Some(&work) => work,
                    None => continue,
                };

                let group = self.work_regs[work].group();

                if u32::from(id) >= self.target.phys_count[group]
                    || self.cur.work_at(group, id).is_some()
                {
                    return Err(Error::InvalidState);
                }

                self.cur.assign(group, work, id, true);
            }
        } else if let Some(entry) = self.blocks[block].entry_assignment() {
            self.cur = entry.clone();
        } else {
            // reachable only through an irreducible edge nobody walked
            // yet; everything will be reloaded from spill slots
            trace!("{block:?} entered with no entry assignment");
            self.cur = RAAssignment::new(self.layout);
        }

        if self.blocks[block].entry_assignment().is_none() {
            let live_in = self.blocks[block].live_in().clone();
            let filtered = self.filtered_to_live_in(&self.cur, &live_in);

            self.cur = filtered.clone();
            self.blocks[block].set_entry_assignment(filtered);
        }

        Ok(())
    }

    /// A copy of `assignment` with every work register that is not live-in
    /// dropped from its register.
    fn filtered_to_live_in(&self, assignment: &RAAssignment, live_in: &BitVector) -> RAAssignment {
        let mut filtered = assignment.clone();

        for group in RegGroup::ALL {
            let pairs: SmallVec<[(WorkId, u8); 8]> = filtered.assigned_of(group).collect();

            for (work, id) in pairs {
                if !live_in.get(work.key_index()) {
                    filtered.unassign(group, work, id);
                }
            }
        }

        filtered
    }

    fn collect_insts(&self, block: BlockId) -> SmallVec<[(NodeId, RAInstId); 16]> {
        let mut out = SmallVec::new();

        let first = match self.blocks[block].first() {
            Some(first) => first,
            None => return out,
        };
        let last = self.blocks[block].last().unwrap();
        let mut cursor = Some(first);

        while let Some(node) = cursor {
            if let Some(&ri) = self.node_data.get(node) {
                out.push((node, ri));
            }

            cursor = if node == last {
                None
            } else {
                self.func.node(node).next()
            };
        }

        out
    }

    /// Allocates registers for one instruction: fixed uses, then remaining
    /// uses, then dead-input release, clobbers, and finally outputs.
    fn alloc_inst(&mut self, node: NodeId, ri: RAInstId) -> RAResult<()> {
        let position = self.insts[ri].position;
        let clobbers = self.insts[ri].clobbered;
        let mut inst_used = self.insts[ri].used_regs;
        let mut tieds: SmallVec<[TiedReg; 8]> =
            self.insts[ri].tied_all().iter().copied().collect();

        let at = InsertPoint::Before(node);

        // protect the registers currently holding this instruction's
        // inputs, nothing below may evict them out from under the reads
        for tied in tieds.iter() {
            if tied.is_use() {
                let group = self.work_regs[tied.work].group();

                if let Some(id) = self.cur.phys_of(tied.work) {
                    inst_used[group].insert(id);
                }
            }
        }

        // fixed inputs: the demanded register, no matter what sits there
        for tied in tieds.iter() {
            if !tied.is_use() || tied.use_id.is_none() {
                continue;
            }

            let work = tied.work;
            let group = self.work_regs[work].group();
            let target = tied.use_id.unwrap();

            if self.cur.work_at(group, target) == Some(work) {
                continue;
            }

            // two distinct values demanded in one register cannot both win
            if inst_used[group].contains(target) && self.cur.work_at(group, target) != Some(work) {
                let fixed_elsewhere = tieds
                    .iter()
                    .any(|t| t.work != work && t.use_id == Some(target));

                if fixed_elsewhere {
                    return Err(Error::OverlappedRegs);
                }
            }

            self.make_resident_at(at, group, work, target, inst_used[group])?;
        }

        // re-read fixed targets into the used set (make_resident_at only
        // moved values around)
        for tied in tieds.iter() {
            if let (true, Some(id)) = (tied.is_use(), tied.use_id) {
                let group = self.work_regs[tied.work].group();

                inst_used[group].insert(id);
            }
        }

        // remaining inputs: keep the current register when it satisfies
        // the constraint, otherwise move or reload
        for tied in tieds.iter_mut() {
            if !tied.is_use() || tied.use_id.is_some() {
                continue;
            }

            let work = tied.work;
            let group = self.work_regs[work].group();

            let mut candidates = tied.allocable & !inst_used[group];

            // a value that survives this instruction is better off out of
            // the registers the instruction is about to destroy
            if !tied.is_last() {
                let sheltered = candidates & !clobbers[group];

                if !sheltered.is_empty() {
                    candidates = sheltered;
                }
            }

            let id = match self.cur.phys_of(work) {
                Some(current)
                    if tied.allocable.contains(current)
                        && (tied.is_last() || !clobbers[group].contains(current)) =>
                {
                    current
                }
                Some(current) if candidates.is_empty() && tied.allocable.contains(current) => {
                    // nowhere better to go, the clobber sweep will deal
                    // with it
                    current
                }
                Some(current) => {
                    let dst = self.take_reg(at, group, candidates, position)?;

                    self.emit_move(at, group, work, dst, current)?;
                    self.cur.reassign(group, work, dst, current);
                    dst
                }
                None => {
                    let dst = self.pick_load_target(at, group, work, candidates, position)?;

                    self.emit_load(at, group, work, dst)?;
                    self.cur.assign(group, work, dst, false);
                    dst
                }
            };

            tied.use_id = Some(id);
            inst_used[group].insert(id);
        }

        // inputs dying here free their register before outputs allocate
        for tied in tieds.iter() {
            if tied.is_use() && tied.is_last() && !tied.is_out() {
                let work = tied.work;
                let group = self.work_regs[work].group();

                if let Some(id) = self.cur.phys_of(work) {
                    self.cur.unassign(group, work, id);
                    inst_used[group].remove(id);
                }
            }
        }

        // everything the instruction destroys (call clobbers and fixed
        // outputs) must leave those registers first; dirty values get
        // saved ahead of the instruction. A value this instruction
        // redefines into the same register stays, the definition consumes
        // it in place.
        for group in RegGroup::ALL {
            for id in clobbers[group].iter() {
                if let Some(victim) = self.cur.work_at(group, id) {
                    let redefined_here = tieds
                        .iter()
                        .any(|t| t.work == victim && t.out_id == Some(id));

                    if !redefined_here {
                        self.spill_reg(at, group, id, victim)?;
                    }
                }
            }
        }

        // outputs
        for tied in tieds.iter_mut() {
            if !tied.is_out() {
                continue;
            }

            let work = tied.work;
            let group = self.work_regs[work].group();

            let id = if let Some(target) = tied.out_id {
                // the clobber sweep freed fixed output targets already;
                // anything still there lost a race it cannot win
                if let Some(occupant) = self.cur.work_at(group, target) {
                    if occupant != work {
                        self.spill_reg(at, group, target, occupant)?;
                    }
                }

                if tied.is_use() && tied.use_id == Some(target) {
                    // the read and the write demand the same register, so
                    // the value itself has to sit there before the
                    // instruction executes
                    if self.cur.phys_of(work) != Some(target) {
                        self.make_resident_at(at, group, work, target, inst_used[group])?;
                    }

                    self.cur.make_dirty(group, target);
                } else if self.cur.phys_of(work) != Some(target) {
                    // an ordinary definition into the demanded register.
                    // A read folded into this record keeps the register it
                    // was already given; only the bookkeeping moves, the
                    // old value stays readable until the write happens.
                    if let Some(old) = self.cur.phys_of(work) {
                        // the old value dies at this definition
                        self.cur.unassign(group, work, old);
                    }

                    self.cur.assign(group, work, target, true);
                } else {
                    self.cur.make_dirty(group, target);
                }

                target
            } else if tied.is_use() {
                // read-modify-write shares the input register
                let id = tied.use_id.expect("use pass stamped every input");

                self.cur.make_dirty(group, id);
                id
            } else if let Some(current) = self.cur.phys_of(work) {
                // plain redefinition in place
                if tied.allocable.contains(current) {
                    self.cur.make_dirty(group, current);
                    current
                } else {
                    self.cur.unassign(group, work, current);

                    let dst =
                        self.take_reg(at, group, tied.allocable & !inst_used[group], position)?;

                    self.cur.assign(group, work, dst, true);
                    dst
                }
            } else {
                let dst = self.pick_load_target(
                    at,
                    group,
                    work,
                    tied.allocable & !inst_used[group],
                    position,
                )?;

                self.cur.assign(group, work, dst, true);
                dst
            };

            tied.out_id = Some(id);
            inst_used[group].insert(id);
            self.clobbered[group].insert(id);
        }

        // definitions that are never read release their register at once
        for tied in tieds.iter() {
            if tied.is_out() && tied.is_last() {
                let work = tied.work;
                let group = self.work_regs[work].group();

                if let Some(id) = self.cur.phys_of(work) {
                    self.cur.unassign(group, work, id);
                }
            }
        }

        for (dst, src) in self.insts[ri].tied_all_mut().iter_mut().zip(tieds.iter()) {
            *dst = *src;
        }

        Ok(())
    }

    /// Makes `work` occupy exactly `target`, moving, swapping, evicting or
    /// reloading as required.
    fn make_resident_at(
        &mut self,
        at: InsertPoint,
        group: RegGroup,
        work: WorkId,
        target: u8,
        reserved: RegMask,
    ) -> RAResult<()> {
        let occupant = self.cur.work_at(group, target);
        let current = self.cur.phys_of(work);

        match (occupant, current) {
            (None, Some(src)) => {
                self.emit_move(at, group, work, target, src)?;
                self.cur.reassign(group, work, target, src);
            }
            (None, None) => {
                self.emit_load(at, group, work, target)?;
                self.cur.assign(group, work, target, false);
            }
            (Some(other), Some(src)) => {
                if self.target.allow_swap[group] {
                    self.emit_swap(at, group, work, src, other, target)?;
                    self.cur.swap(group, work, src, other, target);
                } else {
                    self.relocate(at, group, other, target, reserved)?;
                    self.emit_move(at, group, work, target, src)?;
                    self.cur.reassign(group, work, target, src);
                }
            }
            (Some(other), None) => {
                self.relocate(at, group, other, target, reserved)?;
                self.emit_load(at, group, work, target)?;
                self.cur.assign(group, work, target, false);
            }
        }

        Ok(())
    }

    /// Moves the value in `from` to some free register of the group, or
    /// spills it when none is free.
    fn relocate(
        &mut self,
        at: InsertPoint,
        group: RegGroup,
        work: WorkId,
        from: u8,
        reserved: RegMask,
    ) -> RAResult<()> {
        let free = self.available[group]
            & !self.cur.assigned_mask(group)
            & !reserved
            & !RegMask::single(from);

        match free.lowest() {
            Some(to) => {
                self.emit_move(at, group, work, to, from)?;
                self.cur.reassign(group, work, to, from);
            }
            None => {
                self.spill_reg(at, group, from, work)?;
            }
        }

        Ok(())
    }

    /// Picks a register from `candidates`, spilling a victim when none is
    /// free. `candidates` must already exclude registers this instruction
    /// relies on.
    fn take_reg(
        &mut self,
        at: InsertPoint,
        group: RegGroup,
        candidates: RegMask,
        position: u32,
    ) -> RAResult<u8> {
        if candidates.is_empty() {
            return Err(Error::OutOfPhysRegs);
        }

        let free = candidates & !self.cur.assigned_mask(group);

        if let Some(id) = free.lowest() {
            return Ok(id);
        }

        let victim_id = match self.strategy[group] {
            RAStrategy::Simple => candidates.lowest().unwrap(),
            RAStrategy::Complex => {
                // evict whatever is needed again furthest from here
                let mut best = candidates.lowest().unwrap();
                let mut best_next = 0u32;

                for id in candidates.iter() {
                    let held = self.cur.work_at(group, id).unwrap();
                    let next = self.work_regs[held].next_use_after(position);

                    if next > best_next {
                        best_next = next;
                        best = id;
                    }
                }

                best
            }
        };

        let victim = self.cur.work_at(group, victim_id).unwrap();

        self.spill_reg(at, group, victim_id, victim)?;

        Ok(victim_id)
    }

    /// Picks the register a homeless value should land in, preferring its
    /// global home when that is free and allowed.
    fn pick_load_target(
        &mut self,
        at: InsertPoint,
        group: RegGroup,
        work: WorkId,
        candidates: RegMask,
        position: u32,
    ) -> RAResult<u8> {
        if let Some(home) = self.work_regs[work].home_id() {
            if candidates.contains(home) && !self.cur.assigned_mask(group).contains(home) {
                return Ok(home);
            }
        }

        self.take_reg(at, group, candidates, position)
    }

    /// Saves `victim` (when dirty) and frees its register.
    fn spill_reg(&mut self, at: InsertPoint, group: RegGroup, id: u8, victim: WorkId) -> RAResult<()> {
        if self.cur.is_dirty(group, id) {
            self.emit_save(at, group, victim, id)?;
        }

        self.cur.unassign(group, victim, id);

        Ok(())
    }

    /// Finishes a block: pins or reconciles the entry assignment of every
    /// successor so that control arrives with matching registers.
    fn leave_block(&mut self, block: BlockId) -> RAResult<()> {
        let successors: SmallVec<[BlockId; 4]> =
            SmallVec::from_slice(self.blocks[block].successors());

        if successors.is_empty() {
            return Ok(());
        }

        let consecutive = self.blocks[block].consecutive();
        let terminator = self.terminator_of(block);
        let is_branch = matches!(
            terminator.map(|t| t.1),
            Some(InstControl::Branch(_))
        );

        // branched-to successors first: their reconciliation must not
        // disturb `cur`, which the fall-through still needs
        for &succ in successors.iter() {
            if Some(succ) == consecutive {
                continue;
            }

            if self.blocks[succ].entry_assignment().is_none() {
                let live_in = self.blocks[succ].live_in().clone();
                let entry = self.filtered_to_live_in(&self.cur, &live_in);

                self.blocks[succ].set_entry_assignment(entry);
                continue;
            }

            let dst = self.blocks[succ].entry_assignment().unwrap().clone();
            let live_in = self.blocks[succ].live_in().clone();

            if self.cur.equals(&dst) {
                continue;
            }

            if is_branch {
                // a conditional edge with a pinned target: synthesize a
                // trampoline block that reconciles and jumps
                self.emit_trampoline(block, succ, &dst, &live_in)?;
            } else {
                // an unconditional jump: reconcile right before it
                let at = match terminator {
                    Some((node, _)) => InsertPoint::Before(node),
                    None => self.after_block(block),
                };

                self.switch_to_assignment(&dst, at, &live_in)?;
            }
        }

        if let Some(succ) = consecutive {
            // the fall-through runs whatever we emit after the terminator
            let at = self.after_block(block);

            if self.blocks[succ].entry_assignment().is_none() {
                let live_in = self.blocks[succ].live_in().clone();
                let entry = self.filtered_to_live_in(&self.cur, &live_in);

                self.blocks[succ].set_entry_assignment(entry);
            } else {
                let dst = self.blocks[succ].entry_assignment().unwrap().clone();
                let live_in = self.blocks[succ].live_in().clone();

                if !self.cur.equals(&dst) {
                    // jumps reconcile before the jump itself so the
                    // transfer still lands on the successor's entry
                    let at = match terminator {
                        Some((node, InstControl::Jump(_))) => InsertPoint::Before(node),
                        _ => at,
                    };

                    self.switch_to_assignment(&dst, at, &live_in)?;
                }
            }
        }

        Ok(())
    }

    /// The terminator node of a block and its control effect, if the block
    /// has one.
    fn terminator_of(&self, block: BlockId) -> Option<(NodeId, InstControl)> {
        let last = self.blocks[block].last()?;

        match self.func.node(last).kind() {
            NodeKind::Inst(inst) if inst.control.is_terminator() => Some((last, inst.control)),
            _ => None,
        }
    }

    /// The insertion point just past the end of a block.
    fn after_block(&self, block: BlockId) -> InsertPoint {
        match self.blocks[block].last().and_then(|last| self.func.node(last).next()) {
            Some(next) => InsertPoint::Before(next),
            None => InsertPoint::AtEnd,
        }
    }

    /// Builds the trampoline for a conditional edge whose target entry is
    /// already pinned: a fresh block at the end of the stream holding the
    /// reconciliation moves and a jump to the original target; the branch
    /// is retargeted at it.
    fn emit_trampoline(
        &mut self,
        block: BlockId,
        succ: BlockId,
        dst: &RAAssignment,
        live_in: &BitVector,
    ) -> RAResult<()> {
        let saved = self.cur.clone();

        let succ_label = self.label_of(succ)?;
        let label = self.func.new_label();
        let tramp = self.blocks.insert(RABlock::new());

        self.block_of_label.insert(label, tramp);

        let label_node = self.func.append_label(label);

        // retarget the branch
        let (term, _) = self.terminator_of(block).ok_or(Error::InvalidState)?;

        match self.func.node_mut(term).kind_mut() {
            NodeKind::Inst(inst) => inst.control = InstControl::Branch(label),
            _ => return Err(Error::InvalidState),
        }

        unlink_blocks(self.blocks, block, succ);
        link_blocks(self.blocks, block, tramp, false);
        link_blocks(self.blocks, tramp, succ, false);

        self.switch_to_assignment(dst, InsertPoint::AtEnd, live_in)?;

        let mut cx = EmitContext::new(self.func, InsertPoint::AtEnd);

        self.emitter.emit_jump(&mut cx, succ_label)?;

        {
            let t = &mut self.blocks[tramp];

            t.add_flags(
                BlockFlags::CONSTRUCTED
                    | BlockFlags::REACHABLE
                    | BlockFlags::ALLOCATED
                    | BlockFlags::HAS_TERMINATOR,
            );
            t.set_first(label_node);
            t.set_entry_assignment(saved.clone());
        }

        let last = self.func.last().unwrap();

        self.blocks[tramp].set_last(last);
        self.cur = saved;

        trace!("trampoline {tramp:?} inserted for edge {block:?} -> {succ:?}");

        Ok(())
    }

    /// The label naming a block's head.
    fn label_of(&self, block: BlockId) -> RAResult<LabelId> {
        let mut cursor = self.blocks[block].first();

        while let Some(node) = cursor {
            match self.func.node(node).kind() {
                NodeKind::Label(label) => return Ok(*label),
                kind if kind.is_decorative() => cursor = self.func.node(node).next(),
                _ => break,
            }
        }

        Err(Error::InvalidState)
    }

    /// Emits whatever moves, swaps, saves and loads turn `cur` into `dst`.
    ///
    /// On return `cur` places every work register exactly like `dst`,
    /// dirty bits included.
    fn switch_to_assignment(
        &mut self,
        dst: &RAAssignment,
        at: InsertPoint,
        live_in: &BitVector,
    ) -> RAResult<()> {
        for group in RegGroup::ALL {
            // pass 1: park or drop whatever the target does not keep in a
            // register, and settle dirty-bit mismatches for values already
            // in place
            let held: SmallVec<[(WorkId, u8); 8]> = self.cur.assigned_of(group).collect();

            for (work, id) in held {
                match dst.phys_of(work) {
                    Some(want) if want == id => {
                        let cur_dirty = self.cur.is_dirty(group, id);
                        let dst_dirty = dst.is_dirty(group, id);

                        if cur_dirty && !dst_dirty {
                            self.emit_save(at, group, work, id)?;
                            self.cur.make_clean(group, id);
                        } else if !cur_dirty && dst_dirty {
                            // stale-home claim is conservative, adopting it
                            // costs nothing
                            self.cur.make_dirty(group, id);
                        }
                    }
                    Some(_) => {
                        // placed elsewhere, the move pass handles it
                    }
                    None => {
                        if live_in.get(work.key_index()) && self.cur.is_dirty(group, id) {
                            self.emit_save(at, group, work, id)?;
                        }

                        self.cur.unassign(group, work, id);
                    }
                }
            }

            // pass 2: shuffle registers into place, breaking cycles with a
            // swap (or a detour through a free register)
            loop {
                let mut progressed = false;
                let mut pending = false;

                for id in dst.assigned_mask(group).iter() {
                    let work = dst.work_at(group, id).unwrap();

                    if self.cur.work_at(group, id) == Some(work) {
                        continue;
                    }

                    let src = match self.cur.phys_of(work) {
                        Some(src) => src,
                        None => continue, // load pass
                    };

                    if self.cur.work_at(group, id).is_none() {
                        self.emit_move(at, group, work, id, src)?;
                        self.cur.reassign(group, work, id, src);
                        progressed = true;
                    } else {
                        pending = true;
                    }
                }

                if !pending {
                    break;
                }

                if !progressed {
                    self.break_cycle(dst, at, group)?;
                }
            }

            // pass 3: reload whatever only exists in memory
            for id in dst.assigned_mask(group).iter() {
                let work = dst.work_at(group, id).unwrap();

                if self.cur.work_at(group, id) == Some(work) {
                    continue;
                }

                if let Some(occupant) = self.cur.work_at(group, id) {
                    // a leftover the target wants nowhere in a register
                    self.spill_reg(at, group, id, occupant)?;
                }

                self.emit_load(at, group, work, id)?;
                self.cur.assign(group, work, id, dst.is_dirty(group, id));
            }

            // pass 4: moved values carried their dirty bit with them,
            // align it with what the target entry recorded
            for id in dst.assigned_mask(group).iter() {
                let cur_dirty = self.cur.is_dirty(group, id);
                let dst_dirty = dst.is_dirty(group, id);

                if cur_dirty && !dst_dirty {
                    let work = dst.work_at(group, id).unwrap();

                    self.emit_save(at, group, work, id)?;
                    self.cur.make_clean(group, id);
                } else if !cur_dirty && dst_dirty {
                    self.cur.make_dirty(group, id);
                }
            }
        }

        debug_assert!(self.cur.equals(dst), "edge reconciliation failed");

        Ok(())
    }

    /// Resolves one blocked permutation step during reconciliation.
    fn break_cycle(&mut self, dst: &RAAssignment, at: InsertPoint, group: RegGroup) -> RAResult<()> {
        for id in dst.assigned_mask(group).iter() {
            let work = dst.work_at(group, id).unwrap();

            if self.cur.work_at(group, id) == Some(work) {
                continue;
            }

            let src = match self.cur.phys_of(work) {
                Some(src) => src,
                None => continue,
            };

            let occupant = match self.cur.work_at(group, id) {
                Some(occupant) => occupant,
                None => continue,
            };

            if self.target.allow_swap[group] {
                self.emit_swap(at, group, work, src, occupant, id)?;
                self.cur.swap(group, work, src, occupant, id);
            } else {
                let free = self.available[group] & !self.cur.assigned_mask(group);

                match free.lowest() {
                    Some(to) => {
                        self.emit_move(at, group, occupant, to, id)?;
                        self.cur.reassign(group, occupant, to, id);
                    }
                    None => {
                        self.spill_reg(at, group, id, occupant)?;
                    }
                }
            }

            return Ok(());
        }

        // nothing matched: the caller's pending flag lied, which means the
        // assignment got corrupted somewhere
        Err(Error::InvalidState)
    }

    fn slot_of(&mut self, work: WorkId) -> SlotId {
        if let Some(slot) = self.work_regs[work].slot() {
            return slot;
        }

        let (size, align) = {
            let reg = &self.work_regs[work];

            (reg.size(), reg.align())
        };

        let slot = self.stack.new_slot(size, align);

        self.work_regs[work].set_slot(slot);
        slot
    }

    fn emit_move(
        &mut self,
        at: InsertPoint,
        group: RegGroup,
        work: WorkId,
        dst: u8,
        src: u8,
    ) -> RAResult<()> {
        let mut cx = EmitContext::new(self.func, at);

        self.emitter.emit_move(&mut cx, work, group, dst, src)?;
        self.clobbered[group].insert(dst);

        Ok(())
    }

    fn emit_swap(
        &mut self,
        at: InsertPoint,
        group: RegGroup,
        a: WorkId,
        a_id: u8,
        b: WorkId,
        b_id: u8,
    ) -> RAResult<()> {
        let mut cx = EmitContext::new(self.func, at);

        self.emitter.emit_swap(&mut cx, group, a, a_id, b, b_id)?;
        self.clobbered[group].insert(a_id);
        self.clobbered[group].insert(b_id);

        Ok(())
    }

    fn emit_load(&mut self, at: InsertPoint, group: RegGroup, work: WorkId, dst: u8) -> RAResult<()> {
        let slot = self.slot_of(work);
        let mut cx = EmitContext::new(self.func, at);

        self.emitter.emit_load(&mut cx, work, group, dst, slot)?;
        self.clobbered[group].insert(dst);

        Ok(())
    }

    fn emit_save(&mut self, at: InsertPoint, group: RegGroup, work: WorkId, src: u8) -> RAResult<()> {
        let slot = self.slot_of(work);
        let mut cx = EmitContext::new(self.func, at);

        self.emitter.emit_save(&mut cx, work, group, src, slot)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::testing::{branch_on, gp, ret, test_target, two, EmittedOp, TestMachine};
    use crate::codegen::{Inst, Operand, PhysReg, RegRef};

    /// Runs the pipeline up to and including the local allocator.
    fn through_local(f: &mut Function) -> (RAPass, TestMachine) {
        let mut pass = RAPass::new(test_target());
        let mut machine = TestMachine::new();

        pass.build_cfg(f).unwrap();
        pass.build_views().unwrap();
        pass.remove_unreachable_code(f).unwrap();
        pass.build_dominators().unwrap();
        pass.build_liveness(f).unwrap();
        pass.run_global_allocator(f).unwrap();
        pass.run_local_allocator(f, &mut machine).unwrap();

        (pass, machine)
    }

    fn node_of(f: &Function, op: &str) -> NodeId {
        f.iter()
            .find(|(_, n)| matches!(n.kind(), NodeKind::Inst(i) if i.op == op))
            .map(|(id, _)| id)
            .unwrap()
    }

    fn inst_of<'f>(f: &'f Function, op: &str) -> &'f Inst {
        f.iter()
            .find_map(|(_, n)| n.kind().as_inst().filter(|i| i.op == op))
            .unwrap()
    }

    #[test]
    fn folded_fixed_use_and_out_keep_their_own_registers() {
        let mut f = Function::new("rmw_split");
        let a = gp(&mut f);
        let out = gp(&mut f);

        f.set_args([(a, 1)]);

        // one instruction, two references to `a`: slot 0 reads it pinned
        // to r2, slot 1 redefines it pinned to r3
        f.append_inst(Inst::new(
            "rmw",
            [Operand::read(a).fixed_to(2), Operand::write(a).fixed_to(3)],
        ));
        two(&mut f, "cp", out, a);
        ret(&mut f, out);

        let (mut pass, machine) = through_local(&mut f);

        // the two demands folded into one record without losing either id
        let ri = *pass.node_data.get(node_of(&f, "rmw")).unwrap();
        let tied = &pass.insts[ri].tied_all()[0];

        assert_eq!(tied.ref_count, 2);
        assert_eq!(tied.use_id, Some(2), "fixed use was discarded");
        assert_eq!(tied.out_id, Some(3));

        // the value moves into its use register and nowhere else before
        // the instruction; in particular nothing moves it to r3
        let moves: Vec<(u8, u8)> = machine
            .ops
            .iter()
            .filter_map(|op| match op {
                EmittedOp::Move { dst, src, .. } => Some((*dst, *src)),
                _ => None,
            })
            .collect();

        assert_eq!(moves, vec![(2, 1)]);
        assert_eq!(machine.traffic(), (1, 0, 0, 0));

        // the rewriter patches each slot with its own register, and the
        // consumer reads the redefined value where it was written
        pass.rewrite(&mut f).unwrap();

        let rmw = inst_of(&f, "rmw");

        assert_eq!(rmw.operands[0].reg, RegRef::Phys(PhysReg::gp(2)));
        assert_eq!(rmw.operands[1].reg, RegRef::Phys(PhysReg::gp(3)));

        let cp = inst_of(&f, "cp");

        assert_eq!(cp.operands[1].reg, RegRef::Phys(PhysReg::gp(3)));
    }

    #[test]
    fn cyclic_back_edge_reconciles_through_a_trampoline() {
        let mut f = Function::new("perm_loop");
        let a = gp(&mut f);
        let b = gp(&mut f);
        let lh = f.new_label();

        f.set_args([(a, 0), (b, 1)]);

        // the loop body permutes the assignment: a and b demand each
        // other's entry registers, so the back edge carries a two-cycle
        f.append_label(lh);
        f.append_inst(Inst::new(
            "pin",
            [Operand::read(a).fixed_to(1), Operand::read(b).fixed_to(0)],
        ));
        branch_on(&mut f, a, lh);
        ret(&mut f, a);

        let (pass, machine) = through_local(&mut f);
        let (moves, loads, saves, swaps) = machine.traffic();

        // one swap satisfies the pinned reads, one breaks the cycle on
        // the back edge; nothing touches memory
        assert_eq!(swaps, 2);
        assert_eq!(moves, 0);
        assert_eq!(loads, 0);
        assert_eq!(saves, 0);

        // the conditional edge reconciles through a trampoline block that
        // jumps back to the header
        let jumps: Vec<LabelId> = machine
            .ops
            .iter()
            .filter_map(|op| match op {
                EmittedOp::Jump(target) => Some(*target),
                _ => None,
            })
            .collect();

        assert_eq!(jumps, vec![lh]);

        // the branch was retargeted away from the header label
        let pin_branch = inst_of(&f, "bnz");

        assert!(matches!(pin_branch.control, InstControl::Branch(l) if l != lh));

        // the trampoline is a real block: reachable counts are unchanged
        // but it sits on the back edge with both sides linked
        assert_eq!(pass.block_count(), 3);
        assert_eq!(pass.reachable_block_count(), 2);

        let header = pass.entry_block();
        let preds = pass.block(header).predecessors();

        assert_eq!(preds.len(), 1);

        let tramp = preds[0];

        assert_ne!(tramp, header);
        assert_eq!(pass.block(tramp).successors(), &[header]);
        assert!(pass.block(tramp).has_flag(BlockFlags::ALLOCATED));
        assert!(pass.block(tramp).has_flag(BlockFlags::HAS_TERMINATOR));

        // the synthesized tail reads label, swap, jump in stream order
        let tail: Vec<&'static str> = {
            let mut ops = Vec::new();
            let mut cursor = pass.block(tramp).first();

            while let Some(node) = cursor {
                match f.node(node).kind() {
                    NodeKind::Label(_) => ops.push("label"),
                    NodeKind::Inst(inst) => ops.push(inst.op),
                    _ => {}
                }

                cursor = f.node(node).next();
            }

            ops
        };

        assert_eq!(tail, vec!["label", "xchg", "jmp"]);
    }
}
