//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::codegen::regalloc::RAPass;
use crate::codegen::{
    EmitContext, Error, FrameLayout, Function, InsertPoint, NodeKind, PerGroup, PhysReg, RAEmitter,
    RAResult, RegGroup, RegRef,
};
use log::debug;

impl RAPass {
    /// Finalizes the stack frame: assigns every spill slot its offset and
    /// computes the frame layout, including the callee-saved registers the
    /// function actually needs to preserve.
    pub(super) fn update_stack_frame(&mut self) -> RAResult<()> {
        let local_size = self.stack.finalize();
        let mut saved_regs = PerGroup::default();
        let mut saved_bytes = 0u32;

        for group in RegGroup::ALL {
            let saved = self.target.callee_saved[group] & self.clobbered[group];

            saved_regs[group] = saved;
            saved_bytes += saved.count() * self.target.gp_size;
        }

        let stack_align = self.stack.max_align().max(self.target.gp_size);
        let frame_size = super::stack::align_up(local_size + saved_bytes, stack_align);

        self.frame = Some(FrameLayout {
            local_size,
            saved_regs,
            stack_align,
            frame_size,
        });

        debug!(
            "frame: {} spill bytes, {} saved-reg bytes, {} total",
            local_size, saved_bytes, frame_size
        );

        Ok(())
    }

    /// Splices the prologue ahead of the first node and an epilogue ahead
    /// of every exit block's return.
    pub(super) fn insert_prolog_epilog<E: RAEmitter>(
        &mut self,
        func: &mut Function,
        emitter: &mut E,
    ) -> RAResult<()> {
        let frame = self.frame.clone().ok_or(Error::InvalidState)?;

        let at = match func.first() {
            Some(first) => InsertPoint::Before(first),
            None => InsertPoint::AtEnd,
        };

        let mut cx = EmitContext::new(func, at);

        emitter.emit_prolog(&mut cx, &frame)?;

        for i in 0..self.exits.len() {
            let exit = self.exits[i];
            let last = self.blocks[exit].last().ok_or(Error::InvalidState)?;

            // the epilogue precedes the return; a block that merely falls
            // off the end of the stream gets it appended instead
            let at = match func.node(last).kind() {
                NodeKind::Inst(inst) if inst.control.is_terminator() => InsertPoint::Before(last),
                _ => match func.node(last).next() {
                    Some(next) => InsertPoint::Before(next),
                    None => InsertPoint::AtEnd,
                },
            };

            let mut cx = EmitContext::new(func, at);

            emitter.emit_epilog(&mut cx, &frame)?;
        }

        Ok(())
    }

    /// Walks the stream once and patches physical register ids into every
    /// operand slot named by a tied register's rewrite masks. After this,
    /// no executable node references a virtual register.
    pub(super) fn rewrite(&mut self, func: &mut Function) -> RAResult<()> {
        let mut patched = 0usize;
        let mut cursor = func.first();

        while let Some(node) = cursor {
            cursor = func.node(node).next();

            let ri = match self.node_data.get(node) {
                Some(&ri) => ri,
                // nodes without pass data were either never instructions
                // or were synthesized by the allocator in physical form
                None => continue,
            };

            let inst = &self.insts[ri];
            let kind = func.node_mut(node).kind_mut();
            let operands = match kind {
                NodeKind::Inst(i) => &mut i.operands,
                _ => return Err(Error::InvalidState),
            };

            for tied in inst.tied_all() {
                let group = self.work_regs[tied.work].group();

                let mut mask = tied.use_rewrite_mask;
                while mask != 0 {
                    let slot = mask.trailing_zeros() as usize;
                    mask &= mask - 1;

                    let id = tied.use_id.ok_or(Error::InvalidState)?;

                    operands[slot].reg = RegRef::Phys(PhysReg::with_group(group, id));
                    patched += 1;
                }

                let mut mask = tied.out_rewrite_mask;
                while mask != 0 {
                    let slot = mask.trailing_zeros() as usize;
                    mask &= mask - 1;

                    let id = tied.out_id.ok_or(Error::InvalidState)?;

                    operands[slot].reg = RegRef::Phys(PhysReg::with_group(group, id));
                    patched += 1;
                }
            }

            // the instruction must be fully physical now
            if operands.iter().any(|op| matches!(op.reg, RegRef::Virt(_))) {
                return Err(Error::InvalidState);
            }
        }

        // the pass data is spent; the stream no longer references it
        self.node_data.clear();

        debug!("rewrote {patched} operand references");

        Ok(())
    }
}
