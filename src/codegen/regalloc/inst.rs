//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::codegen::regalloc::{BlockId, WorkId};
use crate::codegen::{Error, PerGroup, RAResult, RegGroup, RegMask};
use crate::utility::SaHashMap;
use bitflags::bitflags;
use smallvec::SmallVec;

use crate::dense_arena_key;

dense_arena_key! {
    /// A reference to the allocator data attached to one instruction node.
    pub struct RAInstId;
}

/// The hard cap on tied registers a single instruction may carry.
///
/// Exceeding it is a precondition violation by the instruction producer,
/// not a recoverable error.
const MAX_TIED_REGS: usize = 128;

bitflags! {
    /// Per-(instruction, work register) state bits.
    pub struct TiedFlags: u32 {
        /// The instruction reads the register.
        const USE = 1;
        /// The instruction writes the register.
        const OUT = 2;
        /// The read must happen in a specific physical register.
        const USE_FIXED = 4;
        /// The write must happen in a specific physical register.
        const OUT_FIXED = 8;
        /// No later instruction reads this value; the register can be
        /// freed once this instruction retires.
        const LAST = 16;
    }
}

/// The link between one instruction and one work register it reads or
/// writes, with the physical constraints of that operand.
#[derive(Copy, Clone, Debug)]
pub struct TiedReg {
    /// The work register being tied.
    pub work: WorkId,
    /// Read/write/fixed/last-use bits.
    pub flags: TiedFlags,
    /// Physical candidates for this operand.
    pub allocable: RegMask,
    /// The physical id the read happens in. Pre-set for fixed uses,
    /// stamped by the local allocator otherwise.
    pub use_id: Option<u8>,
    /// The physical id the write happens in. Same convention as `use_id`.
    pub out_id: Option<u8>,
    /// Bit `i` set means operand slot `i` of the instruction reads this
    /// register and must be rewritten with `use_id`.
    pub use_rewrite_mask: u32,
    /// Bit `i` set means operand slot `i` writes this register and must be
    /// rewritten with `out_id`.
    pub out_rewrite_mask: u32,
    /// How many operand references were folded into this record.
    pub ref_count: u8,
}

impl TiedReg {
    /// Checks whether the instruction reads the register.
    #[inline]
    pub fn is_use(&self) -> bool {
        self.flags.contains(TiedFlags::USE)
    }

    /// Checks whether the instruction writes the register.
    #[inline]
    pub fn is_out(&self) -> bool {
        self.flags.contains(TiedFlags::OUT)
    }

    /// Checks whether this is the last use of the value.
    #[inline]
    pub fn is_last(&self) -> bool {
        self.flags.contains(TiedFlags::LAST)
    }
}

bitflags! {
    /// Instruction-level flags derived while building tied registers.
    pub struct RAInstFlags: u32 {
        /// The instruction ends its block.
        const IS_TERMINATOR = 1;
    }
}

/// Basic statistics about the registers used by one instruction or one
/// block, a bit per register group.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RegsStats {
    used: u8,
    fixed: u8,
    clobbered: u8,
}

impl RegsStats {
    /// Notes that a register of `group` is used.
    #[inline]
    pub fn make_used(&mut self, group: RegGroup) {
        self.used |= 1 << group.index();
    }

    /// Notes that a register of `group` is pinned to a fixed id.
    #[inline]
    pub fn make_fixed(&mut self, group: RegGroup) {
        self.fixed |= 1 << group.index();
    }

    /// Notes that registers of `group` are clobbered.
    #[inline]
    pub fn make_clobbered(&mut self, group: RegGroup) {
        self.clobbered |= 1 << group.index();
    }

    /// Checks whether a register of `group` is used.
    #[inline]
    pub fn is_used(&self, group: RegGroup) -> bool {
        self.used & (1 << group.index()) != 0
    }

    /// Checks whether `group` has a fixed-id constraint.
    #[inline]
    pub fn is_fixed(&self, group: RegGroup) -> bool {
        self.fixed & (1 << group.index()) != 0
    }

    /// Folds another statistics record into this one.
    #[inline]
    pub fn combine_with(&mut self, other: RegsStats) {
        self.used |= other.used;
        self.fixed |= other.fixed;
        self.clobbered |= other.clobbered;
    }
}

/// The allocator data attached to each instruction node.
///
/// Tied registers are stored grouped by register group; the records of
/// group `g` are `tied[index[g] .. index[g] + count[g]]`.
pub struct RAInst {
    /// The block the instruction belongs to.
    pub block: BlockId,
    /// The instruction's even position within the function.
    pub position: u32,
    /// Instruction-level flags.
    pub flags: RAInstFlags,
    /// Number of simultaneously live work registers per group at this
    /// point, snapshot by the liveness analysis.
    pub live_count: PerGroup<u32>,
    /// Fixed physical ids pinned at this instruction, per group.
    pub used_regs: PerGroup<RegMask>,
    /// Registers destroyed by the instruction (e.g. caller-saved registers
    /// at a call), per group.
    pub clobbered: PerGroup<RegMask>,
    tied: SmallVec<[TiedReg; 4]>,
    index: PerGroup<u32>,
    count: PerGroup<u32>,
}

impl RAInst {
    /// All tied registers, grouped by register group.
    #[inline]
    pub fn tied_all(&self) -> &[TiedReg] {
        &self.tied
    }

    /// Mutable access to all tied registers.
    #[inline]
    pub fn tied_all_mut(&mut self) -> &mut [TiedReg] {
        &mut self.tied
    }

    /// The tied registers of one group.
    #[inline]
    pub fn tied_of(&self, group: RegGroup) -> &[TiedReg] {
        let start = self.index[group] as usize;
        let count = self.count[group] as usize;

        &self.tied[start..start + count]
    }

    /// Checks whether the instruction ends its block.
    #[inline]
    pub fn is_terminator(&self) -> bool {
        self.flags.contains(RAInstFlags::IS_TERMINATOR)
    }
}

/// Accumulates the tied-register records of one instruction before they
/// are published into an [`RAInst`].
///
/// Multiple operand references to the same work register are folded into a
/// single record with merged flags, an intersected allocable set and a
/// union of rewrite masks. The fold is driven by a scratch table keyed by
/// work id that lives only inside the builder and is wiped by
/// [`Self::reset`] between instructions.
pub struct RAInstBuilder {
    flags: RAInstFlags,
    tied: SmallVec<[TiedReg; 16]>,
    groups: SmallVec<[RegGroup; 16]>,
    scratch: SaHashMap<WorkId, usize>,
    count: PerGroup<u32>,
    stats: RegsStats,
    used: PerGroup<RegMask>,
    clobbered: PerGroup<RegMask>,
}

impl RAInstBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self {
            flags: RAInstFlags::empty(),
            tied: SmallVec::new(),
            groups: SmallVec::new(),
            scratch: SaHashMap::default(),
            count: PerGroup::default(),
            stats: RegsStats::default(),
            used: PerGroup::default(),
            clobbered: PerGroup::default(),
        }
    }

    /// Wipes the builder so the next instruction starts clean.
    pub fn reset(&mut self) {
        self.flags = RAInstFlags::empty();
        self.tied.clear();
        self.groups.clear();
        self.scratch.clear();
        self.count = PerGroup::default();
        self.stats = RegsStats::default();
        self.used = PerGroup::default();
        self.clobbered = PerGroup::default();
    }

    /// The number of tied registers accumulated so far.
    #[inline]
    pub fn tied_count(&self) -> usize {
        self.tied.len()
    }

    /// The statistics accumulated so far.
    #[inline]
    pub fn stats(&self) -> RegsStats {
        self.stats
    }

    /// The fixed physical ids pinned by uses so far, per group.
    #[inline]
    pub fn used(&self) -> PerGroup<RegMask> {
        self.used
    }

    /// Adds instruction-level flags.
    #[inline]
    pub fn add_flags(&mut self, flags: RAInstFlags) {
        self.flags |= flags;
    }

    /// Pins a physical register named directly by an operand. Nothing gets
    /// allocated for it, but fixed-use bookkeeping must still see it.
    pub fn pin_phys(&mut self, group: RegGroup, id: u8) {
        self.stats.make_used(group);
        self.stats.make_fixed(group);
        self.used[group].insert(id);
    }

    /// Records registers clobbered by the instruction itself (a call's
    /// caller-saved set).
    pub fn add_clobbers(&mut self, group: RegGroup, mask: RegMask) {
        if !mask.is_empty() {
            self.clobbered[group] |= mask;
            self.stats.make_clobbered(group);
        }
    }

    /// Ties `work` to the instruction being built.
    ///
    /// A `use_id`/`out_id` of `Some(id)` demands that the read/write happen
    /// in physical register `id`. If `work` was already tied by an earlier
    /// operand, the two references are merged; conflicting fixed demands
    /// fail with [`Error::OverlappedRegs`].
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        work: WorkId,
        group: RegGroup,
        mut flags: TiedFlags,
        allocable: RegMask,
        use_id: Option<u8>,
        use_rewrite_mask: u32,
        out_id: Option<u8>,
        out_rewrite_mask: u32,
    ) -> RAResult<()> {
        if let Some(id) = use_id {
            self.stats.make_fixed(group);
            self.used[group].insert(id);
            flags |= TiedFlags::USE_FIXED;
        }

        if let Some(id) = out_id {
            self.clobbered[group].insert(id);
            flags |= TiedFlags::OUT_FIXED;
        }

        self.stats.make_used(group);

        match self.scratch.get(&work) {
            None => {
                debug_assert!(self.tied.len() < MAX_TIED_REGS, "tied register overflow");

                self.scratch.insert(work, self.tied.len());
                self.tied.push(TiedReg {
                    work,
                    flags,
                    allocable,
                    use_id,
                    out_id,
                    use_rewrite_mask,
                    out_rewrite_mask,
                    ref_count: 1,
                });
                self.groups.push(group);
                self.count[group] += 1;

                Ok(())
            }
            Some(&at) => {
                let tied = &mut self.tied[at];

                if let Some(id) = out_id {
                    if tied.out_id.is_some() && tied.out_id != Some(id) {
                        return Err(Error::OverlappedRegs);
                    }

                    tied.out_id = Some(id);
                }

                if let Some(id) = use_id {
                    // a fixed use folded into an existing record pins the
                    // shared register; a second, different demand cannot be
                    // satisfied by one register
                    if tied.use_id.is_some() && tied.use_id != Some(id) {
                        return Err(Error::OverlappedRegs);
                    }

                    tied.use_id = Some(id);
                }

                tied.ref_count += 1;
                tied.flags |= flags;
                tied.allocable &= allocable;
                tied.use_rewrite_mask |= use_rewrite_mask;
                tied.out_rewrite_mask |= out_rewrite_mask;

                Ok(())
            }
        }
    }

    /// Publishes the accumulated state as an [`RAInst`] and wipes the
    /// builder, which also clears the scratch links back to the work
    /// registers.
    ///
    /// Tied registers are copied grouped by register group, and the fixed
    /// ids pinned by other operands are removed from each non-fixed
    /// record's allocable set.
    pub fn publish(&mut self, block: BlockId, position: u32) -> RAInst {
        let mut index = PerGroup::<u32>::default();
        let mut running = 0u32;

        for group in RegGroup::ALL {
            index[group] = running;
            running += self.count[group];
        }

        let mut tied: SmallVec<[TiedReg; 4]> = SmallVec::with_capacity(self.tied.len());

        for group in RegGroup::ALL {
            for (src, &g) in self.tied.iter().zip(self.groups.iter()) {
                if g != group {
                    continue;
                }

                let mut dst = *src;

                if !dst.flags.contains(TiedFlags::USE_FIXED) {
                    dst.allocable &= !self.used[group];
                }

                tied.push(dst);
            }
        }

        let inst = RAInst {
            block,
            position,
            flags: self.flags,
            live_count: PerGroup::default(),
            used_regs: self.used,
            clobbered: self.clobbered,
            tied,
            index,
            count: self.count,
        };

        self.reset();

        inst
    }
}

impl Default for RAInstBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaKey;

    fn w(id: usize) -> WorkId {
        WorkId::key_new(id)
    }

    #[test]
    fn duplicate_references_fold_into_one_record() {
        let mut ib = RAInstBuilder::new();
        let allocable = RegMask::low(4);

        // `add v0, v0, v1` style: v0 read twice via slots 1 and 2
        ib.add(w(0), RegGroup::Gp, TiedFlags::OUT, allocable, None, 0, None, 1 << 0)
            .unwrap();
        ib.add(w(0), RegGroup::Gp, TiedFlags::USE, allocable, None, 1 << 1, None, 0)
            .unwrap();
        ib.add(w(1), RegGroup::Gp, TiedFlags::USE, allocable, None, 1 << 2, None, 0)
            .unwrap();

        assert_eq!(ib.tied_count(), 2);

        let inst = ib.publish(BlockId::key_new(0), 0);
        let tied = inst.tied_of(RegGroup::Gp);

        assert_eq!(tied.len(), 2);
        assert_eq!(tied[0].work, w(0));
        assert!(tied[0].is_use() && tied[0].is_out());
        assert_eq!(tied[0].ref_count, 2);
        assert_eq!(tied[0].use_rewrite_mask, 1 << 1);
        assert_eq!(tied[0].out_rewrite_mask, 1 << 0);
    }

    #[test]
    fn conflicting_fixed_outs_fail() {
        let mut ib = RAInstBuilder::new();
        let allocable = RegMask::low(4);

        ib.add(w(0), RegGroup::Gp, TiedFlags::OUT, RegMask::single(1), None, 0, Some(1), 1)
            .unwrap();

        let err = ib
            .add(w(0), RegGroup::Gp, TiedFlags::OUT, RegMask::single(2), None, 0, Some(2), 2)
            .unwrap_err();

        assert_eq!(err, Error::OverlappedRegs);
    }

    #[test]
    fn publish_groups_tied_regs() {
        let mut ib = RAInstBuilder::new();

        ib.add(w(0), RegGroup::Vec, TiedFlags::USE, RegMask::low(2), None, 1, None, 0)
            .unwrap();
        ib.add(w(1), RegGroup::Gp, TiedFlags::USE, RegMask::low(4), None, 2, None, 0)
            .unwrap();

        let inst = ib.publish(BlockId::key_new(0), 4);

        assert_eq!(inst.tied_of(RegGroup::Gp).len(), 1);
        assert_eq!(inst.tied_of(RegGroup::Vec).len(), 1);
        assert_eq!(inst.tied_of(RegGroup::Gp)[0].work, w(1));
        assert_eq!(inst.tied_of(RegGroup::Vec)[0].work, w(0));
        assert_eq!(inst.position, 4);
    }

    #[test]
    fn fixed_use_pins_and_excludes_from_others() {
        let mut ib = RAInstBuilder::new();
        let allocable = RegMask::low(4);

        // v0 demanded in r2, v1 unconstrained
        ib.add(
            w(0),
            RegGroup::Gp,
            TiedFlags::USE,
            RegMask::single(2),
            Some(2),
            1,
            None,
            0,
        )
        .unwrap();
        ib.add(w(1), RegGroup::Gp, TiedFlags::USE, allocable, None, 2, None, 0)
            .unwrap();

        assert!(ib.stats().is_fixed(RegGroup::Gp));
        assert_eq!(ib.used()[RegGroup::Gp], RegMask::single(2));

        let inst = ib.publish(BlockId::key_new(0), 0);
        let tied = inst.tied_of(RegGroup::Gp);

        assert!(tied[0].flags.contains(TiedFlags::USE_FIXED));
        assert_eq!(tied[0].allocable, RegMask::single(2));

        // the unconstrained operand must avoid the pinned register
        assert!(!tied[1].allocable.contains(2));
        assert_eq!(inst.used_regs[RegGroup::Gp], RegMask::single(2));
    }
}
