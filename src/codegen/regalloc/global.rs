//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::codegen::regalloc::workreg::{merge_spans, spans_intersect, WorkRegFlags};
use crate::codegen::regalloc::{LiveSpan, RAPass, WorkId};
use crate::codegen::{Function, RAResult, RegGroup};
use log::{debug, trace};

impl RAPass {
    /// Runs the interference-graph-free global allocator: one binpack per
    /// register group.
    pub(super) fn run_global_allocator(&mut self, func: &Function) -> RAResult<()> {
        for group in RegGroup::ALL {
            self.bin_pack(func, group)?;
        }

        Ok(())
    }

    /// Binpacks the work registers of `group` onto physical registers by
    /// live-span interference.
    ///
    /// Work registers are taken in descending priority (fixed-constrained
    /// ones first, then weight-adjusted span length); each is placed on the
    /// first allocable register whose already-assigned spans it does not
    /// overlap. Registers that fit nowhere stay homeless, the local
    /// allocator deals with them.
    fn bin_pack(&mut self, func: &Function, group: RegGroup) -> RAResult<()> {
        if self.work_of_group[group].is_empty() {
            return Ok(());
        }

        // per-physical-register occupancy, pre-seeded with a unit span at
        // every instruction that pins or clobbers the register so that no
        // global home collides with a fixed use or a call
        let mut occupancy: Vec<Vec<LiveSpan>> = vec![Vec::new(); 32];

        for &block in self.pov.iter() {
            for ri in self.block_insts(func, block) {
                let inst = &self.insts[ri];
                let pinned = inst.used_regs[group] | inst.clobbered[group];

                for id in pinned.iter() {
                    occupancy[id as usize].push(LiveSpan::new(inst.position, inst.position + 1));
                }
            }
        }

        for spans in occupancy.iter_mut() {
            spans.sort_unstable();
            spans.dedup();
        }

        let mut order: Vec<WorkId> = self.work_of_group[group].clone();

        order.sort_by_key(|&w| {
            let reg = &self.work_regs[w];

            (
                !reg.flags().contains(WorkRegFlags::FIXED),
                std::cmp::Reverse(reg.priority()),
            )
        });

        let mut assigned = 0usize;

        for work in order {
            let reg = &self.work_regs[work];

            if reg.spans().is_empty() {
                continue;
            }

            let candidates = reg.allocable() & self.available[group];
            let home = candidates.iter().find(|&id| {
                !spans_intersect(reg.spans(), &occupancy[id as usize])
            });

            match home {
                Some(id) => {
                    merge_spans(&mut occupancy[id as usize], self.work_regs[work].spans());
                    self.work_regs[work].set_home_id(id);
                    assigned += 1;

                    trace!("{work:?} globally homed in {group:?}:{id}");
                }
                None => {
                    trace!("{work:?} left for the local allocator");
                }
            }
        }

        debug!(
            "binpack {group:?}: {assigned}/{} work regs homed",
            self.work_of_group[group].len()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaKey;
    use crate::codegen::testing::{gp, ret, test_call_clobbers, test_target, three, two};
    use crate::codegen::Inst;

    fn packed(f: &mut Function) -> RAPass {
        let mut pass = RAPass::new(test_target());

        pass.build_cfg(f).unwrap();
        pass.build_views().unwrap();
        pass.remove_unreachable_code(f).unwrap();
        pass.build_dominators().unwrap();
        pass.build_liveness(f).unwrap();
        pass.run_global_allocator(f).unwrap();
        pass
    }

    #[test]
    fn homes_never_overlap() {
        let mut f = Function::new("pack");
        let a = gp(&mut f);
        let b = gp(&mut f);
        let c = gp(&mut f);
        let d = gp(&mut f);

        f.set_args([(a, 0), (b, 1)]);
        three(&mut f, "add", c, a, b);
        three(&mut f, "add", d, c, a);
        ret(&mut f, d);

        let pass = packed(&mut f);

        for i in 0..pass.work_reg_count() {
            for j in (i + 1)..pass.work_reg_count() {
                let x = pass.work_reg(WorkId::key_new(i));
                let y = pass.work_reg(WorkId::key_new(j));

                let (Some(hx), Some(hy)) = (x.home_id(), y.home_id()) else {
                    continue;
                };

                if x.group() == y.group() && hx == hy {
                    assert!(
                        !spans_intersect(x.spans(), y.spans()),
                        "{i} and {j} share {hx} but overlap"
                    );
                }
            }
        }
    }

    #[test]
    fn call_crossing_values_avoid_clobbered_homes() {
        let mut f = Function::new("crossing");
        let a = gp(&mut f);
        let r = gp(&mut f);

        f.set_args([(a, 0)]);
        f.append_inst(Inst::call("call", [], test_call_clobbers()));
        two(&mut f, "neg", r, a);
        ret(&mut f, r);

        let pass = packed(&mut f);

        // `a` lives across the call; its home (if any) must be one of the
        // callee-saved registers r2/r3. The `neg` creates work ids in
        // operand order, so its output is w0 and `a` is w1.
        let reg = pass.work_reg(WorkId::key_new(1));

        if let Some(home) = reg.home_id() {
            assert!(home >= 2, "homed in caller-saved r{home}");
        }
    }
}
