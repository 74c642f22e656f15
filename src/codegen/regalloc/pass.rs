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
use crate::codegen::regalloc::{
    BlockId, RABlock, RAInst, RAInstId, StackAllocator, WorkId, WorkReg,
};
use crate::codegen::{
    Error, FrameLayout, Function, LabelId, NodeId, PerGroup, RAEmitter, RAResult, RAStrategy,
    RegGroup, RegMask, TargetDesc, VirtId,
};
use log::debug;
use std::cell::Cell;

/// The register allocation pass.
///
/// One instance allocates one function at a time via
/// [`Self::run_on_function`]; every per-function container it owns is
/// reclaimed wholesale at the start of the next run. Instances are
/// independent, two functions may be allocated concurrently on two threads
/// with two passes.
pub struct RAPass {
    pub(super) target: TargetDesc,

    pub(super) blocks: ArenaMap<BlockId, RABlock>,
    pub(super) exits: Vec<BlockId>,
    pub(super) pov: Vec<BlockId>,

    pub(super) insts: ArenaMap<RAInstId, RAInst>,
    pub(super) node_data: SecondaryMap<NodeId, RAInstId>,

    pub(super) work_regs: ArenaMap<WorkId, WorkReg>,
    pub(super) work_of_group: PerGroup<Vec<WorkId>>,
    pub(super) work_of_virt: SecondaryMap<VirtId, WorkId>,
    pub(super) block_of_label: SecondaryMap<LabelId, BlockId>,

    pub(super) inst_count: u32,
    pub(super) available: PerGroup<RegMask>,
    pub(super) available_count: PerGroup<u32>,
    pub(super) clobbered: PerGroup<RegMask>,
    pub(super) global_max_live: PerGroup<u32>,
    pub(super) strategy: PerGroup<RAStrategy>,

    pub(super) stack: StackAllocator,
    pub(super) frame: Option<FrameLayout>,

    pub(super) last_timestamp: Cell<u64>,
    reserved: PerGroup<RegMask>,
}

impl RAPass {
    /// Creates a pass for the given target.
    pub fn new(target: TargetDesc) -> Self {
        Self {
            target,
            blocks: ArenaMap::new(),
            exits: Vec::new(),
            pov: Vec::new(),
            insts: ArenaMap::new(),
            node_data: SecondaryMap::new(),
            work_regs: ArenaMap::new(),
            work_of_group: PerGroup::default(),
            work_of_virt: SecondaryMap::new(),
            block_of_label: SecondaryMap::new(),
            inst_count: 0,
            available: PerGroup::default(),
            available_count: PerGroup::default(),
            clobbered: PerGroup::default(),
            global_max_live: PerGroup::default(),
            strategy: PerGroup::default(),
            stack: StackAllocator::new(),
            frame: None,
            last_timestamp: Cell::new(0),
            reserved: PerGroup::default(),
        }
    }

    /// Removes `id` of `group` from the allocatable set for every future
    /// run, on top of whatever the target already excludes.
    pub fn make_unavailable(&mut self, group: RegGroup, id: u8) {
        self.reserved[group].insert(id);
    }

    /// Runs the whole allocation pipeline over `func`, rewriting it in
    /// place. On error the function should be discarded by the caller; the
    /// node stream may already contain synthesized code, but no pass data
    /// survives to reference it.
    pub fn run_on_function<E: RAEmitter>(
        &mut self,
        func: &mut Function,
        emitter: &mut E,
    ) -> RAResult<()> {
        self.reset();
        self.on_init();

        debug!("allocating function '{}'", func.name());

        self.build_cfg(func)?;
        self.build_views()?;
        self.remove_unreachable_code(func)?;
        self.build_dominators()?;
        self.build_liveness(func)?;
        self.run_global_allocator(func)?;
        self.run_local_allocator(func, emitter)?;
        self.update_stack_frame()?;
        self.insert_prolog_epilog(func, emitter)?;
        self.rewrite(func)?;

        debug!(
            "allocated '{}': {} blocks ({} reachable), {} work regs, frame {} bytes",
            func.name(),
            self.block_count(),
            self.reachable_block_count(),
            self.work_regs.len(),
            self.frame.as_ref().map(|f| f.frame_size).unwrap_or(0)
        );

        Ok(())
    }

    fn reset(&mut self) {
        self.blocks.clear();
        self.exits.clear();
        self.pov.clear();
        self.insts.clear();
        self.node_data.clear();
        self.work_regs.clear();
        self.work_of_group = PerGroup::default();
        self.work_of_virt.clear();
        self.block_of_label.clear();
        self.inst_count = 0;
        self.clobbered = PerGroup::default();
        self.global_max_live = PerGroup::default();
        self.stack.reset();
        self.frame = None;
        self.last_timestamp.set(0);
    }

    fn on_init(&mut self) {
        for group in RegGroup::ALL {
            self.available[group] = self.target.available[group] & !self.reserved[group];
            self.available_count[group] = self.available[group].count();
            self.strategy[group] = self.target.strategy[group];
        }
    }

    /// The entry block of the CFG. Only meaningful after a run.
    pub fn entry_block(&self) -> BlockId {
        debug_assert!(!self.blocks.is_empty(), "no CFG was built");

        BlockId::key_new(0)
    }

    /// The number of blocks the CFG builder created, reachable or not.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// One past the last instruction position: `instruction_count * 2`,
    /// since positions are even and odd slots are left for synthesized
    /// code.
    pub fn end_position(&self) -> u32 {
        self.inst_count * 2
    }

    /// The number of blocks reachable from the entry, i.e. the size of the
    /// post-order view.
    pub fn reachable_block_count(&self) -> usize {
        self.pov.len()
    }

    /// Reads one block of the CFG.
    pub fn block(&self, id: BlockId) -> &RABlock {
        &self.blocks[id]
    }

    /// The post-order view over the reachable blocks.
    pub fn pov(&self) -> &[BlockId] {
        &self.pov
    }

    /// The function-exit blocks.
    pub fn exit_blocks(&self) -> &[BlockId] {
        &self.exits
    }

    /// The registers of `group` the allocator may use.
    pub fn available_regs(&self, group: RegGroup) -> RegMask {
        self.available[group]
    }

    /// How many registers of `group` the allocator may use.
    pub fn available_reg_count(&self, group: RegGroup) -> u32 {
        self.available_count[group]
    }

    /// The registers of `group` the allocated function writes, which is
    /// what decides the callee-saved preservation set.
    pub fn clobbered_regs(&self, group: RegGroup) -> RegMask {
        self.clobbered[group]
    }

    /// The number of work registers the last run created.
    pub fn work_reg_count(&self) -> usize {
        self.work_regs.len()
    }

    /// The number of work registers of one group.
    pub fn work_reg_count_of(&self, group: RegGroup) -> usize {
        self.work_of_group[group].len()
    }

    /// Reads one work register.
    pub fn work_reg(&self, id: WorkId) -> &WorkReg {
        &self.work_regs[id]
    }

    /// The stack frame computed by the last run, if it got that far.
    pub fn frame(&self) -> Option<&FrameLayout> {
        self.frame.as_ref()
    }

    /// The largest number of simultaneously live work registers of `group`
    /// anywhere in the function.
    pub fn global_max_live_count(&self, group: RegGroup) -> u32 {
        self.global_max_live[group]
    }

    /// Hands out the next timestamp for transient block visits.
    pub(super) fn next_timestamp(&self) -> u64 {
        let next = self.last_timestamp.get() + 1;

        self.last_timestamp.set(next);
        next
    }

    /// Returns the work register standing for `virt`, creating and
    /// registering it on first use.
    pub(super) fn as_work_reg(&mut self, func: &Function, virt: VirtId) -> RAResult<WorkId> {
        if let Some(&work) = self.work_of_virt.get(virt) {
            return Ok(work);
        }

        let vreg = func.virt_reg(virt).ok_or(Error::InvalidVirtId)?;
        let work = self.work_regs.insert(WorkReg::new(
            virt,
            vreg.group,
            self.available[vreg.group],
            vreg.size,
            vreg.align,
        ));

        self.work_of_group[vreg.group].push(work);
        self.work_of_virt.insert(virt, work);

        Ok(work)
    }

}
