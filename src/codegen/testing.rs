//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! A tiny synthetic machine used by the test suite.
//!
//! The machine has six general-purpose registers of which `r0..r3` are
//! allocatable (`r2`/`r3` callee-saved, `r4`/`r5` acting as sp/fp), plus
//! two allocatable vector registers. Its emitter both records every hook
//! invocation and splices real nodes, so tests can assert on either the
//! operation log or the rewritten stream.

use crate::codegen::regalloc::{SlotId, WorkId};
use crate::codegen::{
    EmitContext, FrameLayout, Function, Inst, LabelId, NodeId, Operand, OperandKind, PerGroup,
    PhysReg, RAEmitter, RAResult, RAStrategy, RegGroup, RegMask, TargetDesc, VirtId,
};

/// The registers a call on the test machine destroys: the caller-saved
/// half of the general-purpose file and every vector register.
pub fn test_call_clobbers() -> PerGroup<RegMask> {
    let mut clobbers = PerGroup::default();

    clobbers[RegGroup::Gp] = RegMask::from_bits(0b0011);
    clobbers[RegGroup::Vec] = RegMask::from_bits(0b11);
    clobbers
}

/// The target description of the test machine.
pub fn test_target() -> TargetDesc {
    let mut phys_count = PerGroup::default();
    let mut available = PerGroup::default();
    let mut callee_saved = PerGroup::default();
    let mut allow_swap = PerGroup::splat(false);
    let mut strategy = PerGroup::splat(RAStrategy::Simple);

    phys_count[RegGroup::Gp] = 6;
    phys_count[RegGroup::Vec] = 2;
    available[RegGroup::Gp] = RegMask::from_bits(0b001111);
    available[RegGroup::Vec] = RegMask::from_bits(0b11);
    callee_saved[RegGroup::Gp] = RegMask::from_bits(0b001100);
    allow_swap[RegGroup::Gp] = true;
    strategy[RegGroup::Gp] = RAStrategy::Complex;

    TargetDesc {
        phys_count,
        available,
        callee_saved,
        sp: PhysReg::gp(4),
        fp: PhysReg::gp(5),
        gp_size: 8,
        allow_swap,
        strategy,
    }
}

/// One recorded emitter invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmittedOp {
    /// `emit_move` happened.
    Move {
        /// The value being moved.
        work: WorkId,
        /// Its register group.
        group: RegGroup,
        /// Destination physical id.
        dst: u8,
        /// Source physical id.
        src: u8,
    },
    /// `emit_swap` happened.
    Swap {
        /// First value.
        a: WorkId,
        /// First register.
        a_phys: u8,
        /// Second value.
        b: WorkId,
        /// Second register.
        b_phys: u8,
    },
    /// `emit_load` happened.
    Load {
        /// The value reloaded.
        work: WorkId,
        /// The register loaded into.
        dst: u8,
        /// The slot loaded from.
        slot: SlotId,
    },
    /// `emit_save` happened.
    Save {
        /// The value spilled.
        work: WorkId,
        /// The register stored from.
        src: u8,
        /// The slot stored to.
        slot: SlotId,
    },
    /// `emit_jump` happened.
    Jump(LabelId),
    /// `emit_prolog` happened.
    Prolog,
    /// `emit_epilog` happened.
    Epilog,
}

/// The test machine's emitter: records operations and splices plain nodes
/// so the rewritten stream stays well formed.
#[derive(Default)]
pub struct TestMachine {
    /// Everything emitted, in order.
    pub ops: Vec<EmittedOp>,
}

impl TestMachine {
    /// Creates an emitter with an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts recorded moves, loads, saves and swaps, in that order.
    pub fn traffic(&self) -> (usize, usize, usize, usize) {
        let count = |f: fn(&EmittedOp) -> bool| self.ops.iter().filter(|op| f(op)).count();

        (
            count(|op| matches!(op, EmittedOp::Move { .. })),
            count(|op| matches!(op, EmittedOp::Load { .. })),
            count(|op| matches!(op, EmittedOp::Save { .. })),
            count(|op| matches!(op, EmittedOp::Swap { .. })),
        )
    }
}

impl RAEmitter for TestMachine {
    fn emit_move(
        &mut self,
        cx: &mut EmitContext<'_>,
        work: WorkId,
        group: RegGroup,
        dst: u8,
        src: u8,
    ) -> RAResult<()> {
        self.ops.push(EmittedOp::Move {
            work,
            group,
            dst,
            src,
        });

        cx.insert_inst(Inst::new(
            "mov",
            [
                Operand::phys(PhysReg::with_group(group, dst), OperandKind::Def),
                Operand::phys(PhysReg::with_group(group, src), OperandKind::Use),
            ],
        ));

        Ok(())
    }

    fn emit_swap(
        &mut self,
        cx: &mut EmitContext<'_>,
        group: RegGroup,
        a: WorkId,
        a_phys: u8,
        b: WorkId,
        b_phys: u8,
    ) -> RAResult<()> {
        self.ops.push(EmittedOp::Swap {
            a,
            a_phys,
            b,
            b_phys,
        });

        cx.insert_inst(Inst::new(
            "xchg",
            [
                Operand::phys(PhysReg::with_group(group, a_phys), OperandKind::UseDef),
                Operand::phys(PhysReg::with_group(group, b_phys), OperandKind::UseDef),
            ],
        ));

        Ok(())
    }

    fn emit_load(
        &mut self,
        cx: &mut EmitContext<'_>,
        work: WorkId,
        group: RegGroup,
        dst: u8,
        slot: SlotId,
    ) -> RAResult<()> {
        self.ops.push(EmittedOp::Load { work, dst, slot });

        let mut inst = Inst::new(
            "load",
            [Operand::phys(PhysReg::with_group(group, dst), OperandKind::Def)],
        );

        inst.slot = Some(slot);
        cx.insert_inst(inst);

        Ok(())
    }

    fn emit_save(
        &mut self,
        cx: &mut EmitContext<'_>,
        work: WorkId,
        group: RegGroup,
        src: u8,
        slot: SlotId,
    ) -> RAResult<()> {
        self.ops.push(EmittedOp::Save { work, src, slot });

        let mut inst = Inst::new(
            "store",
            [Operand::phys(PhysReg::with_group(group, src), OperandKind::Use)],
        );

        inst.slot = Some(slot);
        cx.insert_inst(inst);

        Ok(())
    }

    fn emit_jump(&mut self, cx: &mut EmitContext<'_>, target: LabelId) -> RAResult<()> {
        self.ops.push(EmittedOp::Jump(target));
        cx.insert_inst(Inst::jump("jmp", target));

        Ok(())
    }

    fn emit_prolog(&mut self, cx: &mut EmitContext<'_>, _frame: &FrameLayout) -> RAResult<()> {
        self.ops.push(EmittedOp::Prolog);
        cx.insert_inst(Inst::new("prolog", []));

        Ok(())
    }

    fn emit_epilog(&mut self, cx: &mut EmitContext<'_>, _frame: &FrameLayout) -> RAResult<()> {
        self.ops.push(EmittedOp::Epilog);
        cx.insert_inst(Inst::new("epilog", []));

        Ok(())
    }
}

/// Declares a fresh 8-byte general-purpose virtual register.
pub fn gp(func: &mut Function) -> VirtId {
    func.new_virt(RegGroup::Gp, 8, 8)
}

/// Appends `dst = op a, b`.
pub fn three(func: &mut Function, op: &'static str, dst: VirtId, a: VirtId, b: VirtId) -> NodeId {
    func.append_inst(Inst::new(
        op,
        [Operand::write(dst), Operand::read(a), Operand::read(b)],
    ))
}

/// Appends `dst = op src`.
pub fn two(func: &mut Function, op: &'static str, dst: VirtId, src: VirtId) -> NodeId {
    func.append_inst(Inst::new(op, [Operand::write(dst), Operand::read(src)]))
}

/// Appends a return that consumes `value`.
pub fn ret(func: &mut Function, value: VirtId) -> NodeId {
    func.append_inst(Inst::ret("ret", [Operand::read(value)]))
}

/// Appends a conditional branch on `cond` to `target`.
pub fn branch_on(func: &mut Function, cond: VirtId, target: LabelId) -> NodeId {
    func.append_inst(Inst::branch("bnz", target, [Operand::read(cond)]))
}
